//! Error types for the connection layer.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! The variants follow the failure taxonomy of the layer: transient failures
//! reported by a connection, structural configuration problems, lifecycle
//! failures of a pool or connection, and transactional failures.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// Pool or connection lifecycle failure. Retry exhaustion ends up here with
    /// the last underlying failure kept as `source`.
    #[error("Connection failed: {message}")]
    Connection {
        message: String,
        suggestion: String,
        #[source]
        source: Option<Box<DbError>>,
    },

    /// Failure reported by the server or transport for a single call.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Transaction error: {message}")]
    Transaction { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Bulk operation failed: {message} ({error_count} errors)")]
    Bulk { message: String, error_count: usize },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
            source: None,
        }
    }

    /// Create a connection error that keeps `cause` in its source chain.
    pub fn connection_caused_by(
        message: impl Into<String>,
        suggestion: impl Into<String>,
        cause: DbError,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a bulk operation error.
    pub fn bulk(message: impl Into<String>, error_count: usize) -> Self {
        Self::Bulk {
            message: message.into(),
            error_count,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::PoolClosed => Some("Create a new pool or reopen the manager"),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Structural and lifecycle failures never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Protocol { .. } | Self::Timeout { .. }
        )
    }

    /// True for the lifecycle errors a caller sees as `ConnectionError`.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::PoolClosed | Self::Timeout { .. }
        )
    }

    /// The innermost error of the source chain.
    pub fn root_cause(&self) -> &DbError {
        let mut current = self;
        while let Self::Connection {
            source: Some(inner),
            ..
        } = current
        {
            current = inner;
        }
        current
    }
}

impl From<url::ParseError> for DbError {
    fn from(err: url::ParseError) -> Self {
        DbError::configuration(format!("Invalid URL: {}", err))
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::internal(format!("JSON error: {}", err))
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::connection("down", "Check the server");
        assert_eq!(err.suggestion(), Some("Check the server"));
        assert_eq!(DbError::protocol("bad").suggestion(), None);
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", 30).is_retryable());
        assert!(DbError::protocol("reset by peer").is_retryable());
        assert!(!DbError::PoolClosed.is_retryable());
        assert!(!DbError::configuration("bad scheme").is_retryable());
    }

    #[test]
    fn test_source_chain_keeps_cause() {
        let err = DbError::connection_caused_by(
            "Operation failed after 3 attempts",
            "retry later",
            DbError::protocol("socket closed"),
        );
        let source = err.source().expect("source");
        assert_eq!(source.to_string(), "Protocol error: socket closed");
        assert!(matches!(err.root_cause(), DbError::Protocol { .. }));
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(DbError::PoolClosed.is_connection_error());
        assert!(DbError::timeout("acquire", 10).is_connection_error());
        assert!(!DbError::transaction("x").is_connection_error());
    }

    #[test]
    fn test_url_error_is_configuration() {
        let err: DbError = url::Url::parse("not a url").unwrap_err().into();
        assert!(matches!(err, DbError::Configuration { .. }));
    }
}
