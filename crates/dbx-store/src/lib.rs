//! # dbx-store - durable key-value stores
//!
//! Small polymorphic store used by the CDC source to persist its replication
//! position across restarts. Two variants exist: one file per key on the
//! local filesystem, and a remote Redis key space.
//!
//! Writers must be durable and atomic against a crashing process: a reader
//! never observes a torn value.

mod error;
mod file;
mod redis_store;

pub use error::{Result, StoreError};
pub use file::{FileStore, FileStoreConfig};
pub use redis_store::{RedisStore, RedisStoreConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Capability contract every store variant satisfies.
#[async_trait]
pub trait Store: Send + Sync {
    /// Check whether a key exists.
    async fn has(&self, key: &str) -> bool;

    /// Durably write a value. Atomic: a concurrent crash never leaves a
    /// partially written value behind.
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Read a value; `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a key. Deleting a missing key is success.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Release resources. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Store selection plus per-variant settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub file: FileStoreConfig,
    pub redis: RedisStoreConfig,
}

impl StoreConfig {
    /// Build from `STORE_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            kind: std::env::var("STORE_TYPE").unwrap_or_default(),
            file: FileStoreConfig::from_env(),
            redis: RedisStoreConfig::from_env(),
        }
    }
}

/// Construct the store named by `config.type`.
pub async fn new_store(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    match config.kind.as_str() {
        "file" => Ok(Arc::new(FileStore::new(config.file.clone()).await?)),
        "redis" => Ok(Arc::new(RedisStore::new(config.redis.clone()).await?)),
        other => Err(StoreError::config(format!(
            "store type {:?} is not registered",
            other
        ))),
    }
}
