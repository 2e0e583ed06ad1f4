//! Validated request surface over the presence store.
//!
//! The service is transport-free: routing and authentication live outside
//! and hand in an already-resolved optional user id. Requests are validated
//! in full before any mutation, so a rejected update has no partial effect.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use vigil_core::{ChannelCount, ChannelSnapshot, Environment, MessageBus, UpdateRequest, UserId};

use crate::error::StoreError;
use crate::store::{DEFAULT_TIMEOUT, PresenceStore};

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Session timeout applied to every enter.
    pub channel_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { channel_timeout: DEFAULT_TIMEOUT }
    }
}

/// Errors from the update/query surface.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The client id was missing or empty.
    #[error("missing or malformed client_id")]
    InvalidClientId,

    /// A channel name was empty.
    #[error("invalid channel name: {0:?}")]
    InvalidChannel(String),

    /// Mutation was attempted without an identified caller.
    #[error("authentication required")]
    NotAuthenticated,

    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Query/update front over a [`PresenceStore`].
#[derive(Debug)]
pub struct PresenceService<E: Environment, B: MessageBus> {
    store: Arc<PresenceStore<E, B>>,
    config: ServiceConfig,
}

impl<E: Environment, B: MessageBus> PresenceService<E, B> {
    /// Create a service with the default configuration.
    pub fn new(store: Arc<PresenceStore<E, B>>) -> Self {
        Self::with_config(store, ServiceConfig::default())
    }

    /// Create a service with an explicit configuration.
    pub fn with_config(store: Arc<PresenceStore<E, B>>, config: ServiceConfig) -> Self {
        Self { store, config }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<PresenceStore<E, B>> {
        &self.store
    }

    /// Fetch a channel's current state. Requires no identity.
    pub async fn get(&self, channel: &str) -> Result<ChannelSnapshot, UpdateError> {
        validate_channel(channel)?;
        Ok(self.store.query(channel).await?)
    }

    /// Count-only variant of [`get`](Self::get). Requires no identity.
    pub async fn count(&self, channel: &str) -> Result<ChannelCount, UpdateError> {
        validate_channel(channel)?;
        Ok(self.store.count(channel).await?)
    }

    /// Apply one client flush: an (idempotent, refreshing) enter for every
    /// present channel, then a leave for every leave channel.
    ///
    /// The whole request is validated before the first mutation and requires
    /// an identified caller. There is no per-channel partial status.
    pub async fn update(
        &self,
        user_id: Option<UserId>,
        request: &UpdateRequest,
    ) -> Result<(), UpdateError> {
        validate_request(request)?;
        let user_id = user_id.ok_or(UpdateError::NotAuthenticated)?;

        for channel in &request.present_channels {
            self.store
                .enter(channel, user_id, &request.client_id, self.config.channel_timeout)
                .await?;
        }
        for channel in &request.leave_channels {
            self.store.leave(channel, user_id, &request.client_id).await?;
        }
        Ok(())
    }

    /// Best-effort teardown notification: same application path as
    /// [`update`](Self::update), but response-less; failures are logged and
    /// swallowed.
    pub async fn beacon(&self, user_id: Option<UserId>, request: UpdateRequest) {
        if let Err(error) = self.update(user_id, &request).await {
            tracing::debug!(%error, client_id = %request.client_id, "teardown notification dropped");
        }
    }

    /// Debug only: purge one channel's state.
    pub async fn clear(&self, channel: &str) {
        self.store.clear(channel).await;
    }
}

fn validate_channel(channel: &str) -> Result<(), UpdateError> {
    if channel.is_empty() {
        return Err(UpdateError::InvalidChannel(channel.to_string()));
    }
    Ok(())
}

fn validate_request(request: &UpdateRequest) -> Result<(), UpdateError> {
    if request.client_id.is_empty() {
        return Err(UpdateError::InvalidClientId);
    }
    for channel in request.present_channels.iter().chain(&request.leave_channels) {
        validate_channel(channel)?;
    }
    Ok(())
}
