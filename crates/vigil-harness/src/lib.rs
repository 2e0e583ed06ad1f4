//! Test harness for the vigil presence protocol.
//!
//! Provides the pieces integration tests wire together: a manually
//! advanced [`SimEnv`], a [`LoopbackApi`] that connects a client directly
//! to an in-process [`PresenceService`], and a tracing initializer.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use vigil_client::{ApiError, PresenceApi};
use vigil_core::{ChannelSnapshot, Environment, MessageBus, UpdateRequest, UserId};
use vigil_server::{PresenceService, UpdateError};

/// Deterministic environment with a manually advanced clock and a counter
/// RNG.
#[derive(Debug, Clone)]
pub struct SimEnv {
    start: Instant,
    offset: Arc<Mutex<Duration>>,
    counter: Arc<AtomicU64>,
}

impl SimEnv {
    /// Create an environment at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
            counter: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Advance the simulated clock.
    pub fn advance(&self, by: Duration) {
        *lock(&self.offset) += by;
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SimEnv {
    fn now(&self) -> Instant {
        self.start + *lock(&self.offset)
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        // Simulated time never blocks; loops driven by this sleep spin
        // only when the test polls them.
        std::future::ready(())
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        for chunk in buffer.chunks_mut(8) {
            let bytes = self.counter.fetch_add(1, Ordering::Relaxed).to_be_bytes();
            for (dst, src) in chunk.iter_mut().zip(bytes) {
                *dst = src;
            }
        }
    }
}

/// [`PresenceApi`] wired directly to an in-process service, acting as one
/// authenticated (or anonymous) user.
#[derive(Debug)]
pub struct LoopbackApi<E: Environment, B: MessageBus> {
    service: Arc<PresenceService<E, B>>,
    user: Option<UserId>,
}

impl<E: Environment, B: MessageBus> LoopbackApi<E, B> {
    /// Create an API handle acting as `user`.
    pub fn new(service: Arc<PresenceService<E, B>>, user: Option<UserId>) -> Self {
        Self { service, user }
    }
}

#[async_trait]
impl<E: Environment, B: MessageBus> PresenceApi for LoopbackApi<E, B> {
    fn user_id(&self) -> Option<UserId> {
        self.user
    }

    async fn get_channel(&self, channel: &str) -> Result<ChannelSnapshot, ApiError> {
        self.service.get(channel).await.map_err(into_api_error)
    }

    async fn update(&self, request: &UpdateRequest) -> Result<(), ApiError> {
        self.service.update(self.user, request).await.map_err(into_api_error)
    }

    fn send_beacon(&self, request: UpdateRequest) {
        let service = Arc::clone(&self.service);
        let user = self.user;
        drop(tokio::spawn(async move {
            service.beacon(user, request).await;
        }));
    }
}

fn into_api_error(error: UpdateError) -> ApiError {
    match error {
        UpdateError::Store(_) => ApiError::Unavailable(error.to_string()),
        _ => ApiError::Rejected(error.to_string()),
    }
}

/// Install a test-friendly tracing subscriber. Safe to call repeatedly.
pub fn init_tracing() {
    drop(
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init(),
    );
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
