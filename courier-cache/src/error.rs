use std::time::Duration;

use thiserror::Error;

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("Timed out connecting to cache backend after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Not a query key (expected `<scope>#query#<discriminator>`): {0}")]
    InvalidQueryKey(String),

    #[error("Wrong value type stored at key {0}")]
    WrongType(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Refusing destructive cache operation outside the test environment (running as {0})")]
    DestructiveOperationRefused(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}
