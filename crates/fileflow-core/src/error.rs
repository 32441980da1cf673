//! Error types module
//!
//! Two layers of errors live here. `SessionError` is raised by the upload session
//! state machine itself and never touches infrastructure. `AppError` is the service
//! level taxonomy every coordinator, store and worker speaks: validation, conflict,
//! not-found, external dependency and exhausted retry.
//!
//! The `Database` variant and `From<sqlx::Error>` are gated behind the `sqlx` feature.

use std::io;

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;
use uuid::Uuid;

use crate::models::SessionStatus;

pub type AppResult<T> = Result<T, AppError>;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected errors like validation failures
    Debug,
    /// Warning level - for recoverable issues like optimistic conflicts
    Warn,
    /// Error level - for unexpected failures and dead-lettered work
    Error,
}

/// Metadata describing how an error should be surfaced and whether the retry
/// machinery may try again.
pub trait ErrorMetadata {
    /// HTTP status code an outer API layer should map this error to
    fn http_status_code(&self) -> u16;

    /// Machine-readable error code (e.g., "CONFLICT")
    fn error_code(&self) -> &'static str;

    /// Whether this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

/// Transition violations raised by the upload session aggregate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("Missing parts: expected 1..={total_parts}, missing {missing:?}, unexpected {unexpected:?}")]
    MissingParts {
        total_parts: i32,
        missing: Vec<i32>,
        unexpected: Vec<i32>,
    },

    #[error("No eTag recorded for session")]
    MissingETag,

    #[error("Invalid part number {part_number}: must be within 1..={total_parts}")]
    InvalidPartNumber { part_number: i32, total_parts: i32 },

    #[error("Session has not expired yet")]
    NotExpired,

    #[error("Operation not supported for {0} upload sessions")]
    UnsupportedOperation(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[cfg(not(feature = "sqlx"))]
    #[error("Database error: {0}")]
    Database(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{dependency} unavailable: {message}")]
    ExternalDependency {
        dependency: &'static str,
        message: String,
    },

    #[error("Retries exhausted for {entity} {id} after {attempts} attempts: {last_error}")]
    ExhaustedRetry {
        entity: &'static str,
        id: Uuid,
        attempts: i32,
        last_error: String,
    },

    #[error("Checksum mismatch for {key}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error with source")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

impl AppError {
    pub fn external(dependency: &'static str, message: impl Into<String>) -> Self {
        AppError::ExternalDependency {
            dependency,
            message: message.into(),
        }
    }

    /// Collapse infrastructure failures into `ExternalDependency` so the outbox
    /// and coordinator retry logic only reason about one failure shape.
    /// Domain errors pass through untouched.
    pub fn normalize(self, dependency: &'static str) -> Self {
        match self {
            AppError::Session(_)
            | AppError::InvalidInput(_)
            | AppError::Conflict(_)
            | AppError::NotFound(_)
            | AppError::ExternalDependency { .. }
            | AppError::ExhaustedRetry { .. }
            | AppError::ChecksumMismatch { .. } => self,
            other => AppError::ExternalDependency {
                dependency,
                message: other.to_string(),
            },
        }
    }

    /// Get the error type name for structured logs
    pub fn error_type(&self) -> &str {
        match self {
            AppError::Database(_) => "Database",
            AppError::Session(_) => "Session",
            AppError::InvalidInput(_) => "InvalidInput",
            AppError::Conflict(_) => "Conflict",
            AppError::NotFound(_) => "NotFound",
            AppError::ExternalDependency { .. } => "ExternalDependency",
            AppError::ExhaustedRetry { .. } => "ExhaustedRetry",
            AppError::ChecksumMismatch { .. } => "ChecksumMismatch",
            AppError::Internal(_) => "Internal",
            AppError::InternalWithSource { .. } => "Internal",
        }
    }

    /// Get detailed error information including error chain
    pub fn detailed_message(&self) -> String {
        use std::error::Error;

        let mut details = self.to_string();

        let mut source = self.source();
        let mut depth = 0;
        while let Some(err) = source {
            depth += 1;
            if depth > 5 {
                details.push_str("\n  ... (truncated)");
                break;
            }
            details.push_str(&format!("\n  Caused by: {}", err));
            source = err.source();
        }

        details
    }
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for AppError {
    fn from(err: SqlxError) -> Self {
        AppError::Database(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::Internal(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON parsing error: {}", err))
    }
}

impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        AppError::InvalidInput(format!("UUID parsing error: {}", err))
    }
}

/// Static metadata for each variant: (http_status, error_code, recoverable, log_level).
fn app_error_static_metadata(err: &AppError) -> (u16, &'static str, bool, LogLevel) {
    match err {
        AppError::Database(_) => (500, "DATABASE_ERROR", true, LogLevel::Error),
        AppError::Session(SessionError::InvalidTransition { .. }) => {
            (409, "INVALID_TRANSITION", false, LogLevel::Debug)
        }
        AppError::Session(SessionError::MissingParts { .. }) => {
            (400, "MISSING_PARTS", false, LogLevel::Debug)
        }
        AppError::Session(SessionError::MissingETag) => {
            (400, "MISSING_ETAG", false, LogLevel::Debug)
        }
        AppError::Session(_) => (400, "VALIDATION_ERROR", false, LogLevel::Debug),
        AppError::InvalidInput(_) => (400, "INVALID_INPUT", false, LogLevel::Debug),
        AppError::Conflict(_) => (409, "CONFLICT", false, LogLevel::Warn),
        AppError::NotFound(_) => (404, "NOT_FOUND", false, LogLevel::Debug),
        AppError::ExternalDependency { .. } => {
            (503, "EXTERNAL_DEPENDENCY_ERROR", true, LogLevel::Warn)
        }
        AppError::ExhaustedRetry { .. } => (500, "RETRIES_EXHAUSTED", false, LogLevel::Error),
        AppError::ChecksumMismatch { .. } => (422, "CHECKSUM_MISMATCH", false, LogLevel::Error),
        AppError::Internal(_) | AppError::InternalWithSource { .. } => {
            (500, "INTERNAL_ERROR", false, LogLevel::Error)
        }
    }
}

impl ErrorMetadata for AppError {
    fn http_status_code(&self) -> u16 {
        app_error_static_metadata(self).0
    }

    fn error_code(&self) -> &'static str {
        app_error_static_metadata(self).1
    }

    fn is_recoverable(&self) -> bool {
        app_error_static_metadata(self).2
    }

    fn log_level(&self) -> LogLevel {
        app_error_static_metadata(self).3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_metadata_database() {
        #[cfg(feature = "sqlx")]
        let err = AppError::from(sqlx::Error::PoolClosed);
        #[cfg(not(feature = "sqlx"))]
        let err = AppError::Database("pool closed".to_string());
        assert_eq!(err.http_status_code(), 500);
        assert_eq!(err.error_code(), "DATABASE_ERROR");
        assert!(err.is_recoverable());
        assert_eq!(err.log_level(), LogLevel::Error);
    }

    #[test]
    fn test_session_errors_are_validation_failures() {
        let err = AppError::from(SessionError::MissingParts {
            total_parts: 3,
            missing: vec![3],
            unexpected: vec![],
        });
        assert_eq!(err.error_code(), "MISSING_PARTS");
        assert!(!err.is_recoverable());

        let err = AppError::from(SessionError::InvalidTransition {
            from: SessionStatus::Completed,
            to: SessionStatus::Completed,
        });
        assert_eq!(err.http_status_code(), 409);
    }

    #[test]
    fn test_normalize_wraps_infrastructure_errors_only() {
        let err = AppError::Internal("socket closed".to_string()).normalize("webhook");
        assert!(matches!(
            err,
            AppError::ExternalDependency {
                dependency: "webhook",
                ..
            }
        ));
        assert!(err.is_recoverable());

        let err = AppError::NotFound("session".to_string()).normalize("webhook");
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_detailed_message_includes_source_chain() {
        let source = anyhow::anyhow!("connection reset").context("fetching object");
        let err = AppError::from(source);
        let details = err.detailed_message();
        assert!(details.contains("Internal error with source"));
        assert!(details.contains("Caused by"));
    }
}
