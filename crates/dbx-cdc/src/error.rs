//! Error types for the CDC source
//!
//! Terminal errors (configuration, connect, replication stream) propagate to
//! the caller of [`crate::source::MysqlSource::run`]; everything else is
//! absorbed locally with structured logging.

use thiserror::Error;

/// CDC source errors
#[derive(Error, Debug)]
pub enum CdcError {
    /// Missing or invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Could not reach the primary
    #[error("connect error: {0}")]
    Connect(String),

    /// Terminal replication-stream failure
    #[error("reader error: {0}")]
    Reader(String),

    /// `run` called while the source is already running
    #[error("source is already running")]
    AlreadyRunning,

    /// `run` called before a position store was attached
    #[error("position store is not initialized")]
    StoreNotInitialized,

    /// Cooperative cancellation; the ok termination cause
    #[error("cancelled")]
    Cancelled,

    /// JSON serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CdcError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new connect error
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    /// Create a new reader error
    pub fn reader(msg: impl Into<String>) -> Self {
        Self::Reader(msg.into())
    }

    /// True when the error is the cancellation cause rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type for CDC operations
pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CdcError::reader("connection lost");
        assert!(err.to_string().contains("reader error"));
        assert!(err.to_string().contains("connection lost"));
    }

    #[test]
    fn test_error_constructors() {
        let _ = CdcError::config("missing output type");
        let _ = CdcError::connect("127.0.0.1:3306 unreachable");
        let _ = CdcError::reader("malformed event");
    }

    #[test]
    fn test_is_cancelled() {
        assert!(CdcError::Cancelled.is_cancelled());
        assert!(!CdcError::AlreadyRunning.is_cancelled());
        assert!(!CdcError::reader("x").is_cancelled());
    }
}
