//! Background expiry sweep.
//!
//! Sessions expire passively; nothing removes them at the moment their
//! timeout lapses. The sweeper closes that window on a fixed cadence,
//! independent of query traffic, bounding worst-case staleness to
//! `timeout + sweep interval` without a timer per channel. The global
//! expiry index keeps each pass proportional to the number of channels
//! actually due, not the number of channels in existence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use vigil_core::{Environment, MessageBus};

use crate::error::StoreError;
use crate::store::PresenceStore;

/// Default cadence for [`Sweeper::run`].
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Drives expiry sweeps over a [`PresenceStore`].
#[derive(Debug)]
pub struct Sweeper<E: Environment, B: MessageBus> {
    store: Arc<PresenceStore<E, B>>,
}

impl<E: Environment, B: MessageBus> Sweeper<E, B> {
    /// Create a sweeper over the given store.
    pub fn new(store: Arc<PresenceStore<E, B>>) -> Self {
        Self { store }
    }

    /// Sweep every channel whose minimum session expiry is `<= now`.
    ///
    /// Each per-channel sweep is atomic with respect to traffic on that
    /// channel; channels not due are not even visited.
    pub async fn auto_leave_all(&self, now: Instant) -> Result<(), StoreError> {
        for channel in self.store.channels_due(now) {
            self.store.auto_leave(&channel, now).await?;
        }
        Ok(())
    }

    /// Debug only: wipe every channel found in the index.
    pub async fn clear_all(&self) {
        for channel in self.store.indexed_channels() {
            self.store.clear(&channel).await;
        }
    }

    /// Run sweeps forever on a fixed cadence. Errors are logged, never
    /// fatal; the next pass retries naturally.
    pub async fn run(&self, interval: Duration) {
        let env = self.store.env().clone();
        loop {
            env.sleep(interval).await;
            if let Err(error) = self.auto_leave_all(env.now()).await {
                tracing::warn!(%error, "presence sweep failed");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use vigil_core::MemoryBus;

    use super::*;

    /// Manually advanced clock.
    #[derive(Clone)]
    struct ManualEnv {
        start: Instant,
        offset: Arc<Mutex<Duration>>,
    }

    impl ManualEnv {
        fn new() -> Self {
            Self { start: Instant::now(), offset: Arc::new(Mutex::new(Duration::ZERO)) }
        }

        fn advance(&self, by: Duration) {
            *self.offset.lock().unwrap() += by;
        }
    }

    impl Environment for ManualEnv {
        fn now(&self) -> Instant {
            self.start + *self.offset.lock().unwrap()
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            std::future::ready(())
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(0);
        }
    }

    #[tokio::test]
    async fn sweep_only_visits_due_channels() {
        let env = ManualEnv::new();
        let bus = Arc::new(MemoryBus::new());
        let store = Arc::new(PresenceStore::new(env.clone(), bus));
        let sweeper = Sweeper::new(Arc::clone(&store));

        store.enter("a", 1, "x", Duration::from_secs(10)).await.unwrap();
        store.enter("b", 2, "y", Duration::from_secs(100)).await.unwrap();

        env.advance(Duration::from_secs(20));
        sweeper.auto_leave_all(env.now()).await.unwrap();

        assert!(store.query("a").await.unwrap().user_ids.is_empty());
        assert_eq!(store.query("b").await.unwrap().user_ids, vec![2]);
    }

    #[tokio::test]
    async fn clear_all_wipes_every_indexed_channel() {
        let env = ManualEnv::new();
        let bus = Arc::new(MemoryBus::new());
        let store = Arc::new(PresenceStore::new(env, bus));
        let sweeper = Sweeper::new(Arc::clone(&store));

        store.enter("a", 1, "x", Duration::from_secs(60)).await.unwrap();
        store.enter("b", 2, "y", Duration::from_secs(60)).await.unwrap();

        sweeper.clear_all().await;
        assert!(store.indexed_channels().is_empty());
        assert!(store.query("a").await.unwrap().user_ids.is_empty());
    }
}
