//! Delta broadcast.
//!
//! One message per effective transition (enter 0→1, leave 1→0), published on
//! the channel's topic with the sequence id the bus assigns. Ineffective
//! operations publish nothing; the sequence id is the sole loss-detection
//! signal subscribers get.

use std::sync::Arc;

use vigil_core::{Delta, DeltaKind, MessageBus, UserId, channel_topic};

use crate::error::StoreError;

/// Publishes presence deltas on per-channel topics.
#[derive(Debug)]
pub struct Broadcaster<B: MessageBus> {
    bus: Arc<B>,
}

impl<B: MessageBus> Broadcaster<B> {
    /// Create a broadcaster over the given bus.
    pub fn new(bus: Arc<B>) -> Self {
        Self { bus }
    }

    /// Publish one delta, returning the sequence id it was assigned.
    pub async fn publish(
        &self,
        channel: &str,
        kind: DeltaKind,
        user_id: UserId,
    ) -> Result<u64, StoreError> {
        let payload = Delta::new(kind, user_id).encode()?;
        let seq = self.bus.publish(&channel_topic(channel), payload).await?;
        tracing::debug!(channel, ?kind, user_id, seq, "published presence delta");
        Ok(seq)
    }

    /// Point query for the channel's most recent sequence id (0 if none).
    pub async fn last_id(&self, channel: &str) -> Result<u64, StoreError> {
        Ok(self.bus.last_id(&channel_topic(channel)).await?)
    }
}
