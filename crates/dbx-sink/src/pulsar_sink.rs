//! Pulsar sink with optional token authentication.

use async_trait::async_trait;
use dbx_cdc::ChangeEvent;
use pulsar::{Authentication, ConnectionRetryOptions, OperationRetryOptions, Pulsar, TokioExecutor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{encode_event, Result, Sink, SinkConfig, SinkError, SinkFactory};

/// Pulsar output settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PulsarSinkConfig {
    pub url: String,
    pub topic: String,
    /// JWT for token auth; disabled when empty
    pub token: String,
    /// Operation timeout in seconds
    pub operation_timeout: u64,
    /// Connection timeout in seconds
    pub connection_timeout: u64,
}

impl Default for PulsarSinkConfig {
    fn default() -> Self {
        Self {
            url: "pulsar://127.0.0.1:6650".to_string(),
            topic: "dbx-events".to_string(),
            token: String::new(),
            operation_timeout: 30,
            connection_timeout: 30,
        }
    }
}

impl std::fmt::Debug for PulsarSinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulsarSinkConfig")
            .field("url", &self.url)
            .field("topic", &self.topic)
            .field("token", &if self.token.is_empty() { "" } else { "[REDACTED]" })
            .field("operation_timeout", &self.operation_timeout)
            .field("connection_timeout", &self.connection_timeout)
            .finish()
    }
}

impl PulsarSinkConfig {
    /// Build from `OUTPUT_PULSAR_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("OUTPUT_PULSAR_URL").unwrap_or(defaults.url),
            topic: std::env::var("OUTPUT_PULSAR_TOPIC").unwrap_or(defaults.topic),
            token: std::env::var("OUTPUT_PULSAR_TOKEN").unwrap_or(defaults.token),
            operation_timeout: env_u64("OUTPUT_PULSAR_OPERATION_TIMEOUT", defaults.operation_timeout),
            connection_timeout: env_u64("OUTPUT_PULSAR_CONNECTION_TIMEOUT", defaults.connection_timeout),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Publishes events to one Pulsar topic.
///
/// The producer requires exclusive access for sends, so it sits behind a
/// mutex and the sink itself can be shared by all workers.
pub struct PulsarSink {
    producer: Mutex<pulsar::producer::Producer<TokioExecutor>>,
}

impl PulsarSink {
    pub async fn new(config: PulsarSinkConfig) -> Result<Self> {
        let mut builder = Pulsar::builder(&config.url, TokioExecutor)
            .with_operation_retry_options(OperationRetryOptions {
                operation_timeout: Duration::from_secs(config.operation_timeout),
                ..Default::default()
            })
            .with_connection_retry_options(ConnectionRetryOptions {
                connection_timeout: Duration::from_secs(config.connection_timeout),
                ..Default::default()
            });

        if !config.token.is_empty() {
            builder = builder.with_auth(Authentication {
                name: "token".to_string(),
                data: config.token.clone().into_bytes(),
            });
        }

        let client: Pulsar<TokioExecutor> = builder
            .build()
            .await
            .map_err(|e| SinkError::config(e.to_string()))?;

        let producer = client
            .producer()
            .with_topic(&config.topic)
            .with_name("dbx")
            .build()
            .await
            .map_err(|e| SinkError::config(e.to_string()))?;

        debug!(url = %config.url, topic = %config.topic, "pulsar sink ready");
        Ok(Self {
            producer: Mutex::new(producer),
        })
    }
}

#[async_trait]
impl Sink for PulsarSink {
    async fn send(&self, event: &ChangeEvent) -> Result<()> {
        let payload = encode_event(event)?;
        let mut producer = self.producer.lock().await;
        let receipt = producer
            .send_non_blocking(payload)
            .await
            .map_err(|e| SinkError::send(e.to_string()))?;
        receipt.await.map_err(|e| SinkError::send(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.producer
            .lock()
            .await
            .close()
            .await
            .map_err(|e| SinkError::send(e.to_string()))
    }
}

pub struct PulsarSinkFactory;

#[async_trait]
impl SinkFactory for PulsarSinkFactory {
    async fn create(&self, config: &SinkConfig) -> Result<Arc<dyn Sink>> {
        Ok(Arc::new(PulsarSink::new(config.pulsar.clone()).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PulsarSinkConfig::default();
        assert_eq!(config.url, "pulsar://127.0.0.1:6650");
        assert_eq!(config.topic, "dbx-events");
        assert_eq!(config.operation_timeout, 30);
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = PulsarSinkConfig {
            token: "eyJhbGciOi.secret".to_string(),
            ..Default::default()
        };
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("secret"));
    }
}
