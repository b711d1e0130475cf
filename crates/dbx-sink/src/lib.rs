//! # dbx-sink - downstream delivery
//!
//! Every sink satisfies the same two-method contract: deliver one event,
//! release resources. Sinks are selected at runtime through a registry keyed
//! by the `output.type` config tag, and shared by all pipeline workers, so
//! implementations take `&self` and synchronize internally where their
//! client library demands it.
//!
//! Delivery is at-least-once: [`send_with_retry`] retries failed sends with
//! a linear backoff and the sink may observe duplicates.

mod kafka;
mod pulsar_sink;
mod rabbitmq;
mod redis_sink;
mod rocketmq_sink;
mod stdout;

pub use kafka::{KafkaSink, KafkaSinkConfig, KafkaSinkFactory};
pub use pulsar_sink::{PulsarSink, PulsarSinkConfig, PulsarSinkFactory};
pub use rabbitmq::{RabbitMqSink, RabbitMqSinkConfig, RabbitMqSinkFactory};
pub use redis_sink::{RedisSink, RedisSinkConfig, RedisSinkFactory};
pub use rocketmq_sink::{RocketMqSink, RocketMqSinkConfig, RocketMqSinkFactory};
pub use stdout::{StdoutSink, StdoutSinkFactory};

use async_trait::async_trait;
use dbx_cdc::ChangeEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Sink errors
#[derive(Error, Debug)]
pub enum SinkError {
    /// Missing or invalid sink configuration
    #[error("sink configuration error: {0}")]
    Config(String),

    /// Delivery failure; retried by [`send_with_retry`]
    #[error("send error: {0}")]
    Send(String),

    /// Event could not be encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cancelled between retry attempts
    #[error("cancelled")]
    Cancelled,
}

impl SinkError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn send(msg: impl Into<String>) -> Self {
        Self::Send(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, SinkError>;

/// Capability contract every sink satisfies.
///
/// `send` returning ok means the event will be delivered barring
/// catastrophic sink loss; internal batching is allowed under that promise.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Deliver one event.
    async fn send(&self, event: &ChangeEvent) -> Result<()>;

    /// Flush and release resources. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// The JSON wire payload carried by every opaque-bytes sink.
pub fn encode_event(event: &ChangeEvent) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(event)?)
}

/// Sink selection plus per-variant settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub redis: RedisSinkConfig,
    pub kafka: KafkaSinkConfig,
    pub rabbitmq: RabbitMqSinkConfig,
    pub rocketmq: RocketMqSinkConfig,
    pub pulsar: PulsarSinkConfig,
}

impl SinkConfig {
    /// Build from `OUTPUT_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            kind: std::env::var("OUTPUT_TYPE").unwrap_or_default(),
            redis: RedisSinkConfig::from_env(),
            kafka: KafkaSinkConfig::from_env(),
            rabbitmq: RabbitMqSinkConfig::from_env(),
            rocketmq: RocketMqSinkConfig::from_env(),
            pulsar: PulsarSinkConfig::from_env(),
        }
    }
}

/// Constructor for one sink variant.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn create(&self, config: &SinkConfig) -> Result<Arc<dyn Sink>>;
}

/// Registry of sink constructors keyed by the `output.type` tag.
#[derive(Default)]
pub struct SinkRegistry {
    factories: HashMap<String, Arc<dyn SinkFactory>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, factory: Arc<dyn SinkFactory>) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn list(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Construct the sink named by `config.type`.
    ///
    /// An unregistered tag falls back to stdout rather than failing, so a
    /// bare config still produces visible output.
    pub async fn create(&self, config: &SinkConfig) -> Result<Arc<dyn Sink>> {
        match self.factories.get(config.kind.as_str()) {
            Some(factory) => factory.create(config).await,
            None => {
                warn!(kind = %config.kind, "output type not registered, falling back to stdout");
                Ok(Arc::new(StdoutSink::new()))
            }
        }
    }
}

/// Registry with every built-in sink registered.
pub fn default_registry() -> SinkRegistry {
    let mut registry = SinkRegistry::new();
    registry.register("stdout", Arc::new(StdoutSinkFactory));
    registry.register("redis", Arc::new(RedisSinkFactory));
    registry.register("kafka", Arc::new(KafkaSinkFactory));
    registry.register("rabbitmq", Arc::new(RabbitMqSinkFactory));
    registry.register("rocketmq", Arc::new(RocketMqSinkFactory));
    registry.register("pulsar", Arc::new(PulsarSinkFactory));
    registry
}

/// Base delay unit for the retry backoff.
const RETRY_BACKOFF_UNIT: Duration = Duration::from_millis(100);

/// Deliver one event with bounded retries.
///
/// Up to `max_retries + 1` attempts; attempt `n` (0-based) is followed by a
/// `(n+1) * 100ms` sleep on failure. Cancellation is honored between
/// attempts. The last error is returned when every attempt fails.
pub async fn send_with_retry(
    token: &CancellationToken,
    sink: &dyn Sink,
    event: &ChangeEvent,
    max_retries: u32,
) -> Result<()> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if token.is_cancelled() {
            return Err(SinkError::Cancelled);
        }

        match sink.send(event).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, error = %e, "send failed");
                last_err = Some(e);
                if attempt < max_retries {
                    let backoff = RETRY_BACKOFF_UNIT * (attempt + 1);
                    tokio::select! {
                        _ = token.cancelled() => return Err(SinkError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| SinkError::send("no attempts made")))
}
