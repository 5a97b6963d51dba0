//! Error types for sqlbook.

use std::sync::Arc;

use thiserror::Error;

/// The main error type for sqlbook operations.
///
/// Errors are `Clone` so a single failed computation can be handed to every
/// caller waiting on the same cache fingerprint.
#[derive(Debug, Clone, Error)]
pub enum SqlbookError {
    /// No dialect or driver could be resolved, or a config file is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A blocked (mutating) SQL operation was found.
    #[error("Sensitive SQL operations are not allowed: {token}")]
    SecurityViolation { token: String },

    /// The source is unavailable (pool exhausted or unreachable).
    #[error("Connection error: {0}")]
    Connection(String),

    /// A wait budget was exceeded.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Driver or SQL fault while running a statement.
    #[error("Execution error: {0}")]
    Execution(String),

    /// The workbook artifact could not be rendered or written.
    #[error("Artifact error: {0}")]
    Artifact(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl SqlbookError {
    /// Create a security violation for the matched token.
    pub fn security(token: impl Into<String>) -> Self {
        Self::SecurityViolation {
            token: token.into(),
        }
    }

    /// Create an execution fault from any displayable driver error.
    pub fn execution(err: impl std::fmt::Display) -> Self {
        Self::Execution(err.to_string())
    }

    /// Connection errors are degraded states, not hard faults.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<std::io::Error> for SqlbookError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<sqlx::Error> for SqlbookError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => Self::Connection(err.to_string()),
            other => Self::Execution(other.to_string()),
        }
    }
}

impl From<rust_xlsxwriter::XlsxError> for SqlbookError {
    fn from(err: rust_xlsxwriter::XlsxError) -> Self {
        Self::Artifact(err.to_string())
    }
}

/// Result type alias for sqlbook operations.
pub type SqlbookResult<T> = Result<T, SqlbookError>;
