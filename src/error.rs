//! Error types for the protocol engine.
//!
//! Errors are `Clone` because one fatal cause fails every outstanding
//! submission on a connection.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// SQLSTATE reported when a prepared statement name is unknown to the server.
pub const INVALID_SQL_STATEMENT_NAME: &str = "26000";

/// Result type for protocol engine operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur while driving a PostgreSQL connection.
#[derive(Error, Debug, Clone)]
pub enum PgError {
    /// Socket creation, DNS resolution or TCP connect failed.
    #[error("Connect error: {0}")]
    Connect(String),

    /// Authentication failed (unsupported mechanism, proof mismatch, server refusal).
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Malformed or unexpected frame. Fatal to the connection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A cached prepared statement is unknown to the server.
    #[error("Prepared statement not found: {0}")]
    StatementNotFound(String),

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// The submission was cancelled by the caller.
    #[error("Submission cancelled")]
    Cancelled,

    /// Server returned an error.
    #[error("{severity}: {message} ({code})")]
    Server {
        severity: String,
        code: String,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
    },

    /// Type conversion error.
    #[error("Type error: {0}")]
    Type(String),

    /// An argument was absent or malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A submission failed validation before anything was sent.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration was rejected.
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS session error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Connection is closed or in invalid state.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// A pooled buffer handle was used after it was released.
    #[error("Stale buffer handle (slot {slot}, generation {generation})")]
    StaleBuffer { slot: usize, generation: u32 },
}

impl PgError {
    /// Build a server error from ErrorResponse fields.
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        PgError::Server {
            severity: fields.get(&b'S').cloned().unwrap_or_default(),
            code: fields.get(&b'C').cloned().unwrap_or_default(),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
        }
    }

    /// SQLSTATE code for server errors.
    pub fn code(&self) -> Option<&str> {
        match self {
            PgError::Server { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether the server reported an unknown prepared statement.
    pub fn is_statement_not_found(&self) -> bool {
        matches!(self, PgError::StatementNotFound(_))
            || self.code() == Some(INVALID_SQL_STATEMENT_NAME)
    }

    /// Whether this error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PgError::Connect(_)
                | PgError::Auth(_)
                | PgError::Protocol(_)
                | PgError::Io(_)
                | PgError::Tls(_)
                | PgError::ConnectionClosed
        )
    }
}

impl From<io::Error> for PgError {
    fn from(e: io::Error) -> Self {
        PgError::Io(Arc::new(e))
    }
}

impl From<rustls::Error> for PgError {
    fn from(e: rustls::Error) -> Self {
        PgError::Tls(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_from_fields() {
        let mut fields = HashMap::new();
        fields.insert(b'S', "ERROR".to_string());
        fields.insert(b'C', "26000".to_string());
        fields.insert(b'M', "prepared statement \"s1\" does not exist".to_string());

        let err = PgError::from_fields(&fields);
        assert_eq!(err.code(), Some("26000"));
        assert!(err.is_statement_not_found());
        assert!(!err.is_fatal());
        assert_eq!(
            err.to_string(),
            "ERROR: prepared statement \"s1\" does not exist (26000)"
        );
    }

    #[test]
    fn test_fatal_classification() {
        let io = PgError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(io.is_fatal());
        assert!(PgError::Protocol("bad frame".into()).is_fatal());
        assert!(!PgError::Validation("mismatch".into()).is_fatal());
        assert!(!PgError::Cancelled.is_fatal());
    }
}
