//! Stdout sink, mainly for local inspection and as the fallback output.

use async_trait::async_trait;
use dbx_cdc::ChangeEvent;
use std::sync::Arc;

use crate::{Result, Sink, SinkConfig, SinkFactory};

/// Pretty-prints each event to stdout.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sink for StdoutSink {
    async fn send(&self, event: &ChangeEvent) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(event)?);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct StdoutSinkFactory;

#[async_trait]
impl SinkFactory for StdoutSinkFactory {
    async fn create(&self, _config: &SinkConfig) -> Result<Arc<dyn Sink>> {
        Ok(Arc::new(StdoutSink::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbx_cdc::event::RowImage;

    #[tokio::test]
    async fn test_send_never_fails() {
        let sink = StdoutSink::new();
        let event = ChangeEvent::insert("app", "users", RowImage::new());
        sink.send(&event).await.unwrap();
        sink.close().await.unwrap();
    }
}
