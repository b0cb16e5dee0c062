use std::time::Duration;
use thiserror::Error;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur while evaluating rate limits.
///
/// A request that is over its quota is not an error: it is reported as a
/// denied [`Verdict`](crate::limiter::Verdict).
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Invalid rate limit configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] redis::RedisError),

    #[error("Store operation timed out after {0:?}")]
    StoreTimeout(Duration),

    #[error("Malformed store response: {0}")]
    MalformedStoreResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateLimitError {
    /// Whether this error came from talking to the counter store, as opposed
    /// to a configuration or protocol bug.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            RateLimitError::StoreUnavailable(_) | RateLimitError::StoreTimeout(_)
        )
    }
}

impl From<::config::ConfigError> for RateLimitError {
    fn from(err: ::config::ConfigError) -> Self {
        RateLimitError::Config(err.to_string())
    }
}
