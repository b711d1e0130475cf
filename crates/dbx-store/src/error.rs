//! Store error type

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Missing or invalid store configuration
    #[error("store configuration error: {0}")]
    Config(String),

    /// Filesystem failure in the file-backed store
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend failure in the remote store
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        Self::Backend(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
