//! Redis-backed store
//!
//! Keys are stored verbatim, values are binary-safe. Atomicity is the
//! backend's: a SET either lands or it does not.

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::Store;

/// Redis store settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisStoreConfig {
    pub addr: String,
    pub password: String,
    pub db: i64,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6379".to_string(),
            password: String::new(),
            db: 0,
        }
    }
}

impl std::fmt::Debug for RedisStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStoreConfig")
            .field("addr", &self.addr)
            .field("password", &"[REDACTED]")
            .field("db", &self.db)
            .finish()
    }
}

impl RedisStoreConfig {
    /// Build from `STORE_REDIS_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            addr: std::env::var("STORE_REDIS_ADDR").unwrap_or(defaults.addr),
            password: std::env::var("STORE_REDIS_PASSWORD").unwrap_or(defaults.password),
            db: std::env::var("STORE_REDIS_DB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.db),
        }
    }

    pub(crate) fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}/{}", self.addr, self.db)
        } else {
            format!("redis://:{}@{}/{}", self.password, self.addr, self.db)
        }
    }
}

/// Verbatim keys in a Redis key space.
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn new(config: RedisStoreConfig) -> Result<Self> {
        let client = redis::Client::open(config.url())?;
        let conn = client.get_connection_manager().await?;
        debug!(addr = %config.addr, db = config.db, "redis store ready");
        Ok(Self { conn })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn has(&self, key: &str) -> bool {
        let mut conn = self.conn.clone();
        conn.exists(key).await.unwrap_or(false)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
