//! Environment abstraction for deterministic testing.
//!
//! The `Environment` trait decouples presence logic from system resources
//! (time, randomness). Session expiry, the sweep cadence, and client id
//! generation all go through it, so tests can drive a manual clock while
//! production uses real time without touching protocol code.
//!
//! # Invariants
//!
//! - Monotonicity: `env.now()` must never go backwards
//! - Isolation: implementations must not share global state

use std::time::{Duration, Instant};

/// Abstract environment providing time, sleeping, and randomness.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Returns the current time.
    ///
    /// Subsequent calls must return times >= previous calls.
    fn now(&self) -> Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code (the sweep loop) uses this; state transitions never
    /// block on it.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    ///
    /// Production implementations must use OS entropy; simulation
    /// implementations may be deterministic.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`, the raw material for client ids.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}
