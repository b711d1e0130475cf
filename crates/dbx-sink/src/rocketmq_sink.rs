//! RocketMQ sink backed by the Apache RocketMQ 5.x client.

use async_trait::async_trait;
use dbx_cdc::ChangeEvent;
use rocketmq::conf::{ClientOption, ProducerOption};
use rocketmq::model::message::MessageBuilder;
use rocketmq::Producer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{encode_event, Result, Sink, SinkConfig, SinkError, SinkFactory};

/// RocketMQ output settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocketMqSinkConfig {
    /// Proxy endpoints, `host:port`
    pub servers: Vec<String>,
    pub topic: String,
    pub group: String,
    pub namespace: String,
    pub access_key: String,
    pub secret_key: String,
    /// Client-side publish retry count
    pub retry: i32,
}

impl Default for RocketMqSinkConfig {
    fn default() -> Self {
        Self {
            servers: vec!["127.0.0.1:8081".to_string()],
            topic: "dbx-events".to_string(),
            group: "dbx".to_string(),
            namespace: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            retry: 2,
        }
    }
}

impl std::fmt::Debug for RocketMqSinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocketMqSinkConfig")
            .field("servers", &self.servers)
            .field("topic", &self.topic)
            .field("group", &self.group)
            .field("namespace", &self.namespace)
            .field("access_key", &if self.access_key.is_empty() { "" } else { "[REDACTED]" })
            .field("secret_key", &if self.secret_key.is_empty() { "" } else { "[REDACTED]" })
            .field("retry", &self.retry)
            .finish()
    }
}

impl RocketMqSinkConfig {
    /// Build from `OUTPUT_ROCKETMQ_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            servers: std::env::var("OUTPUT_ROCKETMQ_SERVERS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(defaults.servers),
            topic: std::env::var("OUTPUT_ROCKETMQ_TOPIC").unwrap_or(defaults.topic),
            group: std::env::var("OUTPUT_ROCKETMQ_GROUP").unwrap_or(defaults.group),
            namespace: std::env::var("OUTPUT_ROCKETMQ_NAMESPACE").unwrap_or(defaults.namespace),
            access_key: std::env::var("OUTPUT_ROCKETMQ_ACCESS_KEY").unwrap_or(defaults.access_key),
            secret_key: std::env::var("OUTPUT_ROCKETMQ_SECRET_KEY").unwrap_or(defaults.secret_key),
            retry: std::env::var("OUTPUT_ROCKETMQ_RETRY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.retry),
        }
    }
}

/// Publishes events to one RocketMQ topic via the gRPC proxy.
pub struct RocketMqSink {
    producer: Mutex<Producer>,
    topic: String,
}

impl RocketMqSink {
    pub async fn new(config: RocketMqSinkConfig) -> Result<Self> {
        // The 5.x client only consumes the proxy endpoint and topic; reject
        // settings it would otherwise drop on the floor.
        let defaults = RocketMqSinkConfig::default();
        if !config.access_key.is_empty() || !config.secret_key.is_empty() {
            return Err(SinkError::config(
                "rocketmq access_key/secret_key are not supported yet; unset them or use an unauthenticated proxy",
            ));
        }
        if !config.namespace.is_empty() {
            return Err(SinkError::config(
                "rocketmq namespace is not supported yet; unset it",
            ));
        }
        if config.group != defaults.group {
            return Err(SinkError::config(
                "rocketmq group is not supported yet; leave it at the default",
            ));
        }

        debug!(config = ?config, "starting rocketmq producer");

        let mut client_option = ClientOption::default();
        client_option.set_access_url(config.servers.join(";"));
        client_option.set_enable_tls(false);

        let mut producer_option = ProducerOption::default();
        producer_option.set_topics(vec![config.topic.clone()]);

        let mut producer = Producer::new(producer_option, client_option)
            .map_err(|e| SinkError::config(e.to_string()))?;
        producer
            .start()
            .await
            .map_err(|e| SinkError::config(e.to_string()))?;

        Ok(Self {
            producer: Mutex::new(producer),
            topic: config.topic,
        })
    }
}

#[async_trait]
impl Sink for RocketMqSink {
    async fn send(&self, event: &ChangeEvent) -> Result<()> {
        let payload = encode_event(event)?;
        let message = MessageBuilder::builder()
            .set_topic(self.topic.clone())
            .set_body(payload)
            .build()
            .map_err(|e| SinkError::send(e.to_string()))?;

        self.producer
            .lock()
            .await
            .send(message)
            .await
            .map_err(|e| SinkError::send(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct RocketMqSinkFactory;

#[async_trait]
impl SinkFactory for RocketMqSinkFactory {
    async fn create(&self, config: &SinkConfig) -> Result<Arc<dyn Sink>> {
        Ok(Arc::new(RocketMqSink::new(config.rocketmq.clone()).await?))
    }
}
