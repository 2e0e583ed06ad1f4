//! Shared data model and contracts for the vigil presence protocol.
//!
//! This crate holds everything both sides of the protocol agree on:
//!
//! - Identifier and snapshot types ([`types`])
//! - The [`Delta`](delta::Delta) wire format and its CBOR codec ([`delta`])
//! - The [`Environment`](env::Environment) abstraction over time and
//!   randomness, enabling deterministic tests ([`env`])
//! - The [`MessageBus`](bus::MessageBus) contract: ordered per-topic
//!   publish/subscribe with replay, plus an in-process reference
//!   implementation ([`bus`])
//!
//! No I/O happens here; server and client crates bind these contracts to
//! real resources.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod delta;
pub mod env;
pub mod types;

pub use bus::{BusError, BusMessage, BusStream, MemoryBus, MessageBus};
pub use delta::{CodecError, Delta, DeltaKind};
pub use env::Environment;
pub use types::{
    ChannelCount, ChannelSnapshot, ClientId, SessionKey, UpdateRequest, UserId, channel_topic,
};
