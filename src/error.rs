//! Error types for db-keepalive.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Errors that come out of a retry loop always carry the number of attempts made,
//! so callers can tell which retry budget was exhausted.

use thiserror::Error;

/// Boxed driver error kept as the source of a wrapped failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {target} after {attempts} attempt(s): {source}")]
    Connection {
        target: String,
        attempts: u32,
        source: BoxError,
    },

    #[error("Operation failed: {operation} on {target} after {attempts} attempt(s): {source}")]
    Operation {
        operation: String,
        target: String,
        attempts: u32,
        source: BoxError,
    },

    #[error("Registry closed: {target} cannot be used after close_all")]
    RegistryClosed { target: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Connection closed: {target} ({reason})")]
    ConnectionClosed { target: String, reason: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error for an open/reopen that gave up.
    pub fn connection(target: impl Into<String>, attempts: u32, source: impl Into<BoxError>) -> Self {
        Self::Connection {
            target: target.into(),
            attempts,
            source: source.into(),
        }
    }

    /// Create an operation error for a wrapped operation that gave up.
    pub fn operation(
        operation: impl Into<String>,
        target: impl Into<String>,
        attempts: u32,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Operation {
            operation: operation.into(),
            target: target.into(),
            attempts,
            source: source.into(),
        }
    }

    /// Create a registry closed error.
    pub fn registry_closed(target: impl Into<String>) -> Self {
        Self::RegistryClosed {
            target: target.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// Create a connection closed error.
    pub fn connection_closed(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Number of attempts made before this error was surfaced, if it came out of a retry loop.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Connection { attempts, .. } | Self::Operation { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Get a suggestion for this error, if one applies.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Connection { .. } => {
                Some("Check that the database server is running and the credentials are correct")
            }
            Self::ConnectionClosed { .. } => Some("Borrow the connection again to get a fresh handle"),
            Self::RegistryClosed { .. } => Some("Create a new registry after shutting one down"),
            Self::Timeout { .. } => Some("Consider increasing the borrow timeout"),
            _ => None,
        }
    }

    /// Check if this error is retryable by a caller one level up.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::ConnectionClosed { .. }
        )
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("postgresql://app@db:5432/orders (async)", 4, "refused");
        let text = err.to_string();
        assert!(text.contains("Connection failed"));
        assert!(text.contains("4 attempt(s)"));
        assert!(text.contains("refused"));
    }

    #[test]
    fn test_error_source_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = DbError::operation("select", "sqlite://local", 2, io);
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("reset by peer"));
    }

    #[test]
    fn test_error_attempts() {
        assert_eq!(DbError::connection("t", 3, "x").attempts(), Some(3));
        assert_eq!(DbError::operation("op", "t", 1, "x").attempts(), Some(1));
        assert_eq!(DbError::registry_closed("t").attempts(), None);
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("borrow", 30_000).is_retryable());
        assert!(DbError::connection("t", 1, "x").is_retryable());
        assert!(!DbError::registry_closed("t").is_retryable());
        assert!(!DbError::invalid_config("bad").is_retryable());
    }

    #[test]
    fn test_error_suggestion() {
        assert!(DbError::connection("t", 1, "x").suggestion().is_some());
        assert!(DbError::invalid_config("bad").suggestion().is_none());
    }
}
