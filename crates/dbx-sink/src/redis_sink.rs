//! Redis sink: RPUSH the JSON payload onto a list key.

use async_trait::async_trait;
use dbx_cdc::ChangeEvent;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::{encode_event, Result, Sink, SinkConfig, SinkError, SinkFactory};

/// Redis output settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSinkConfig {
    pub addr: String,
    pub password: String,
    pub db: i64,
    /// List key events are appended to
    pub key: String,
}

impl Default for RedisSinkConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6379".to_string(),
            password: String::new(),
            db: 0,
            key: "dbx-events".to_string(),
        }
    }
}

impl std::fmt::Debug for RedisSinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSinkConfig")
            .field("addr", &self.addr)
            .field("password", &"[REDACTED]")
            .field("db", &self.db)
            .field("key", &self.key)
            .finish()
    }
}

impl RedisSinkConfig {
    /// Build from `OUTPUT_REDIS_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            addr: std::env::var("OUTPUT_REDIS_ADDR").unwrap_or(defaults.addr),
            password: std::env::var("OUTPUT_REDIS_PASSWORD").unwrap_or(defaults.password),
            db: std::env::var("OUTPUT_REDIS_DB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.db),
            key: std::env::var("OUTPUT_REDIS_KEY").unwrap_or(defaults.key),
        }
    }

    fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}/{}", self.addr, self.db)
        } else {
            format!("redis://:{}@{}/{}", self.password, self.addr, self.db)
        }
    }
}

/// Appends events to a Redis list.
pub struct RedisSink {
    conn: redis::aio::ConnectionManager,
    key: String,
}

impl RedisSink {
    pub async fn new(config: RedisSinkConfig) -> Result<Self> {
        let client =
            redis::Client::open(config.url()).map_err(|e| SinkError::config(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| SinkError::config(e.to_string()))?;
        debug!(addr = %config.addr, key = %config.key, "redis sink ready");
        Ok(Self {
            conn,
            key: config.key,
        })
    }
}

#[async_trait]
impl Sink for RedisSink {
    async fn send(&self, event: &ChangeEvent) -> Result<()> {
        let payload = encode_event(event)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .rpush(&self.key, payload)
            .await
            .map_err(|e| SinkError::send(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct RedisSinkFactory;

#[async_trait]
impl SinkFactory for RedisSinkFactory {
    async fn create(&self, config: &SinkConfig) -> Result<Arc<dyn Sink>> {
        Ok(Arc::new(RedisSink::new(config.redis.clone()).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RedisSinkConfig::default();
        assert_eq!(config.addr, "127.0.0.1:6379");
        assert_eq!(config.key, "dbx-events");
        assert_eq!(config.url(), "redis://127.0.0.1:6379/0");
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = RedisSinkConfig {
            password: "s3cret".to_string(),
            ..Default::default()
        };
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("s3cret"));
    }
}
