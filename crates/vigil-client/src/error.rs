//! Client-side error types.

use thiserror::Error;
use vigil_core::BusError;

use crate::api::ApiError;

/// Errors from the client mirror and aggregation layer.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A presence mutation was requested without an identified user.
    #[error("authentication required")]
    NotAuthenticated,

    /// An empty channel name was given; the service would reject the whole
    /// batch carrying it.
    #[error("invalid channel name: {0:?}")]
    InvalidChannel(String),

    /// The aggregator was torn down before this intent was serviced.
    #[error("intent abandoned before being serviced")]
    Cancelled,

    /// The presence API rejected or could not serve a request.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The delta bus failed.
    #[error(transparent)]
    Bus(#[from] BusError),
}
