//! Core identifier and snapshot types.

use serde::{Deserialize, Serialize};

/// Identifies a user. One user may hold many concurrent sessions.
pub type UserId = u64;

/// Identifies one connecting client (a browser tab, a device). Opaque,
/// assigned by the transport layer.
pub type ClientId = String;

/// One claim of presence: a (user, client) pair within a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Owning user.
    pub user_id: UserId,
    /// Connecting client.
    pub client_id: ClientId,
}

impl SessionKey {
    /// Create a session key.
    pub fn new(user_id: UserId, client_id: impl Into<ClientId>) -> Self {
        Self { user_id, client_id: client_id.into() }
    }
}

/// Full state of a channel as returned by a query: the unique present users
/// and the last sequence id published on the channel's topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    /// Present user ids, sorted, one entry per user regardless of session
    /// count.
    pub user_ids: Vec<UserId>,
    /// Sequence id of the most recent delta on this channel (0 if none).
    pub last_message_id: u64,
}

/// Count-only variant of [`ChannelSnapshot`] that avoids transferring the
/// full id list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCount {
    /// Number of unique present users.
    pub count: usize,
    /// Sequence id of the most recent delta on this channel (0 if none).
    pub last_message_id: u64,
}

/// One client's flush payload: the full desired present set plus the
/// channels left since the previous flush.
///
/// Applied as a unit: every present channel gets an (idempotent, refreshing)
/// enter, every leave channel a leave. There is no per-channel partial
/// status in the response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// The sender's client id.
    pub client_id: ClientId,
    /// Channels the client wants to be present in.
    pub present_channels: Vec<String>,
    /// Channels the client left this cycle.
    pub leave_channels: Vec<String>,
}

/// Bus topic carrying a channel's deltas.
pub fn channel_topic(channel: &str) -> String {
    format!("presence/{channel}")
}
