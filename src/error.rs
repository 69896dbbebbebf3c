use std::time::Duration;
use thiserror::Error;

/// Errors raised by idempotency store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Failed to (de)serialize stored record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Key '{0}' kept changing while the record was being created")]
    Contended(String),
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Idempotency key '{key}' was reused with a different request")]
    FingerprintMismatch { key: String },

    #[error("Execution for key '{key}' still in progress after waiting {waited:?}")]
    ConcurrentExecutionTimeout { key: String, waited: Duration },

    #[error("Operation for key '{key}' previously failed: {message}")]
    PreviouslyFailed { key: String, message: String },

    #[error("Idempotency store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("{0}")]
    Operation(anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(anyhow::Error),
}

impl AppError {
    /// Wraps a business failure raised by a wrapped operation.
    pub fn operation(message: impl std::fmt::Display) -> Self {
        AppError::Operation(anyhow::anyhow!("{}", message))
    }

    /// Whether retrying the whole call later can succeed without changing the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::ConcurrentExecutionTimeout { .. } | AppError::StoreUnavailable(_)
        )
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::FingerprintMismatch { .. } => "fingerprint_mismatch",
            AppError::ConcurrentExecutionTimeout { .. } => "concurrent_execution_timeout",
            AppError::PreviouslyFailed { .. } => "previously_failed",
            AppError::StoreUnavailable(_) => "store_unavailable",
            AppError::Operation(_) => "operation",
            AppError::Serialization(_) => "serialization",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout = AppError::ConcurrentExecutionTimeout {
            key: "k".to_string(),
            waited: Duration::from_millis(10),
        };
        assert!(timeout.is_retryable());
        assert!(AppError::StoreUnavailable(StoreError::Contended("k".to_string())).is_retryable());

        assert!(!AppError::FingerprintMismatch { key: "k".to_string() }.is_retryable());
        assert!(!AppError::PreviouslyFailed {
            key: "k".to_string(),
            message: "boom".to_string()
        }
        .is_retryable());
        assert!(!AppError::operation("declined").is_retryable());
    }

    #[test]
    fn test_operation_error_displays_verbatim() {
        let err = AppError::operation("card declined");
        assert_eq!(err.to_string(), "card declined");
        assert_eq!(err.kind(), "operation");
    }
}
