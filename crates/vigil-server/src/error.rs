//! Server error types.

use thiserror::Error;
use vigil_core::{BusError, CodecError};

/// Errors from presence store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The message bus rejected a publish or query.
    #[error("message bus error: {0}")]
    Bus(#[from] BusError),

    /// A delta payload could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}
