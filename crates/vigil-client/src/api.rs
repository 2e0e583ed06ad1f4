//! Presence API contract the client talks through.
//!
//! The transport carrying these calls (HTTP, RPC, loopback in tests) is an
//! external collaborator; the client only assumes this surface.

use async_trait::async_trait;
use thiserror::Error;
use vigil_core::{ChannelSnapshot, UpdateRequest, UserId};

/// Errors surfaced by a [`PresenceApi`] implementation.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The service understood the request and refused it.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The service could not be reached or failed internally. Retryable.
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

/// Client-side view of the presence service.
#[async_trait]
pub trait PresenceApi: Send + Sync + 'static {
    /// The authenticated user this client acts as, if any.
    fn user_id(&self) -> Option<UserId>;

    /// Fetch a channel's current snapshot.
    async fn get_channel(&self, channel: &str) -> Result<ChannelSnapshot, ApiError>;

    /// Apply one flush: assert the present set, leave the left channels.
    async fn update(&self, request: &UpdateRequest) -> Result<(), ApiError>;

    /// Fire-and-forget teardown notification. Must not block and must not
    /// fail visibly; delivery is best effort.
    fn send_beacon(&self, request: UpdateRequest);
}
