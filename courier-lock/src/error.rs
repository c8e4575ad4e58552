use std::time::Duration;

use thiserror::Error;

use courier_core::CourierError;

/// Result type for lock operations
pub type LockResult<T> = Result<T, LockError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Could not reach quorum for {resource} after {attempts} attempts")]
    QuorumNotReached { resource: String, attempts: u32 },

    #[error("Lock manager is shutting down, refusing lock on {resource}")]
    ShuttingDown { resource: String },

    #[error("Lock on {resource} expired before it was released")]
    Expired { resource: String },

    #[error("A quorum lock needs at least one backend")]
    NoBackends,

    #[error("Timed out connecting to lock backend after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Lock backend did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Lock backend unavailable: {0}")]
    Unavailable(String),

    #[error("Lock backend error: {0}")]
    Backend(String),
}

impl LockError {
    /// Resource the error is about, when there is one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Self::QuorumNotReached { resource, .. } | Self::ShuttingDown { resource } | Self::Expired { resource } => {
                Some(resource)
            }
            _ => None,
        }
    }
}

impl From<LockError> for CourierError {
    fn from(err: LockError) -> Self {
        match err.resource() {
            Some(resource) => CourierError::LockAcquisition {
                resource: resource.to_string(),
                source: Box::new(err),
            },
            None => CourierError::BackendTransient(err.to_string()),
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() || err.is_connection_refusal() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}
