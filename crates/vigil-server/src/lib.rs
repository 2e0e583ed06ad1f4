//! Server side of the vigil presence protocol.
//!
//! ## Architecture
//!
//! ```text
//! vigil-server
//!   ├─ PresenceService   (validated query/update surface)
//!   ├─ PresenceStore     (atomic per-channel session bookkeeping)
//!   ├─ Sweeper           (cadenced expiry pass over the global index)
//!   ├─ Broadcaster       (sequenced delta publication)
//!   └─ SystemEnv         (production Environment impl)
//! ```
//!
//! All state transitions on one channel are serialized behind that channel's
//! lock; deltas are published while the lock is held, so bus sequence order
//! always matches transition order. Channels are fully independent of each
//! other.
//!
//! Request routing, authentication, and the transport behind the
//! [`vigil_core::MessageBus`] are external collaborators; this crate only
//! assumes their contracts.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod broadcast;
mod error;
mod service;
mod store;
mod sweeper;
mod system_env;

pub use broadcast::Broadcaster;
pub use error::StoreError;
pub use service::{PresenceService, ServiceConfig, UpdateError};
pub use store::{DEFAULT_TIMEOUT, PresenceStore};
pub use sweeper::{DEFAULT_SWEEP_INTERVAL, Sweeper};
pub use system_env::SystemEnv;
