//! Error types for Floodgate.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Floodgate operations.
///
/// A request that is over its quota is not an error: it is a successfully
/// computed [`Decision`](crate::ratelimit::Decision) with `allowed == false`.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Missing or invalid configuration, raised at construction time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The Redis store returned an error or dropped the connection.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store did not answer within the configured bound.
    #[error("Store timed out after {0:?}")]
    Timeout(Duration),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FloodgateError {
    /// Whether this error means the shared store could not serve the check.
    ///
    /// These are the failures an admission gate resolves by failing open.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            FloodgateError::Redis(_)
                | FloodgateError::StoreUnavailable(_)
                | FloodgateError::Timeout(_)
        )
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
