//! # Errors
//!
//! Courier keeps one error taxonomy for the execution engine and translates
//! every collaborator's failure into it at the boundary:
//!
//! | variant              | surfaced as                     |
//! |----------------------|---------------------------------|
//! | `Validation`         | returned to the caller verbatim |
//! | `NotFound`           | 404-equivalent                  |
//! | `LockAcquisition`    | retryable job failure           |
//! | `BackendTransient`   | logged, operation degrades      |
//! | `TerminalJob`        | job marked `Failed`             |
//! | `Api`                | fatal to the current request    |

use std::error::Error as StdError;
use thiserror::Error;

/// Result type for engine operations
pub type CourierResult<T> = Result<T, CourierError>;

/// Result type for repository operations
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// HTTP-like classification of an engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRequest,   // 400
    NotFound,     // 404
    Conflict,     // 409
    GeneralError, // 500
    Unavailable,  // 503
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::GeneralError => 500,
            ErrorKind::Unavailable => 503,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::GeneralError => "GeneralError",
            ErrorKind::Unavailable => "Unavailable",
        }
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad-request",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::GeneralError => "general-error",
            ErrorKind::Unavailable => "unavailable",
        }
    }
}

/// Engine error taxonomy
#[derive(Error, Debug)]
pub enum CourierError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Failed to acquire lock on resource {resource}")]
    LockAcquisition {
        resource: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    #[error("Backend unavailable: {0}")]
    BackendTransient(String),

    #[error("Job {job_id} failed: {message}")]
    TerminalJob { job_id: String, message: String },

    #[error("{0}")]
    Api(String),
}

impl CourierError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    pub fn api(msg: impl Into<String>) -> Self {
        Self::Api(msg.into())
    }

    pub fn terminal(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TerminalJob {
            job_id: job_id.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::BadRequest,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::LockAcquisition { .. } => ErrorKind::Conflict,
            Self::BackendTransient(_) => ErrorKind::Unavailable,
            Self::TerminalJob { .. } | Self::Api(_) => ErrorKind::GeneralError,
        }
    }

    /// Whether a job that hit this error should be tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockAcquisition { .. } | Self::BackendTransient(_))
    }
}

/// Errors surfaced by repository implementations.
///
/// Implementations must keep "not found" and "validation" apart so the engine
/// can map them onto its own taxonomy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid {entity}: {message}")]
    Validation { entity: &'static str, message: String },

    #[error("Persistence error: {0}")]
    Backend(String),
}

impl RepositoryError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    pub fn validation(entity: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            entity,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<RepositoryError> for CourierError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound { entity, id } => Self::NotFound { entity, id },
            RepositoryError::Validation { entity, message } => {
                Self::Validation(format!("{entity}: {message}"))
            }
            RepositoryError::Backend(message) => Self::Api(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_errors_keep_their_kind() {
        let not_found: CourierError = RepositoryError::not_found("Job", "j-1").into();
        assert_eq!(not_found.kind(), ErrorKind::NotFound);
        assert_eq!(not_found.kind().status_code(), 404);

        let invalid: CourierError = RepositoryError::validation("Job", "missing step").into();
        assert_eq!(invalid.kind(), ErrorKind::BadRequest);
        assert_eq!(invalid.to_string(), "Validation failed: Job: missing step");

        let backend: CourierError = RepositoryError::Backend("connection reset".into()).into();
        assert!(matches!(backend, CourierError::Api(_)));
    }

    #[test]
    fn lock_errors_are_retryable() {
        let err = CourierError::LockAcquisition {
            resource: "digest:s-1".into(),
            source: "quorum not reached".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.kind().class_name(), "conflict");
        assert!(!CourierError::validation("bad").is_retryable());
    }
}
