//! Client side of the vigil presence protocol.
//!
//! ## Architecture
//!
//! ```text
//! vigil-client
//!   ├─ ClientChannel   (sans-IO subscription state machine)
//!   ├─ ChannelDriver   (binds the machine to a bus + API, watch mirror)
//!   ├─ Aggregator      (intent batching, dedup, throttled flushes)
//!   └─ PresenceApi     (transport contract to the service)
//! ```
//!
//! `ClientChannel` holds all protocol decisions (when to apply a delta,
//! when a gap forces a snapshot resync) as a pure state machine; the driver
//! only performs the actions it emits. Outbound presence goes through the
//! `Aggregator`, which turns individual enter/leave intents into batched
//! update requests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod aggregator;
mod api;
mod channel;
mod driver;
mod error;

pub use aggregator::{Aggregator, AggregatorConfig, Completion};
pub use api::{ApiError, PresenceApi};
pub use channel::{ChannelAction, ChannelEvent, ChannelStatus, ClientChannel};
pub use driver::ChannelDriver;
pub use error::ClientError;
