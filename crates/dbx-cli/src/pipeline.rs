//! Pipeline supervisor
//!
//! Wires store -> source -> bounded events channel -> worker pool -> sink,
//! owns every component's lifecycle, and propagates the first terminal
//! cause: a source error, cancellation, or a drained channel.
//!
//! Sink failures are never terminal. A worker logs the event it could not
//! deliver after retries and moves on; only the source can bring the
//! pipeline down.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use dbx_cdc::source::new_source;
use dbx_cdc::{CdcError, Result};
use dbx_sink::{default_registry, send_with_retry, Sink};
use dbx_store::new_store;

use crate::config::Config;

/// Retries per event before it is dropped.
const SEND_RETRIES: u32 = 3;

/// Tunables that are not part of the config file.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Worker count; logical CPU count by default
    pub workers: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
        }
    }
}

/// Run the pipeline until cancellation or a terminal source error.
pub async fn run(token: CancellationToken, config: &Config, options: PipelineOptions) -> Result<()> {
    // Construction order store -> source -> sink; anything already built is
    // closed in reverse on failure.
    let store = new_store(&config.store)
        .await
        .map_err(|e| CdcError::connect(e.to_string()))?;

    let source = match new_source(&config.source) {
        Ok(source) => Arc::new(source),
        Err(e) => {
            store.close().await.ok();
            return Err(e);
        }
    };
    source.with_store(store.clone());

    let sink: Arc<dyn Sink> = match default_registry().create(&config.output).await {
        Ok(sink) => sink,
        Err(e) => {
            source.close().await.ok();
            store.close().await.ok();
            return Err(CdcError::connect(e.to_string()));
        }
    };

    let child = token.child_token();

    let (source_err_tx, mut source_err_rx) = mpsc::channel::<Result<()>>(1);
    {
        let source = source.clone();
        let child = child.clone();
        tokio::spawn(async move {
            info!("source task starting");
            let result = source.run(child).await;
            if let Err(e) = &result {
                if !e.is_cancelled() {
                    error!(error = %e, "source run failed");
                }
            }
            let _ = source_err_tx.send(result).await;
        });
    }

    let mut workers = JoinSet::new();
    for worker_id in 0..options.workers.max(1) {
        let events = source.events();
        let sink = sink.clone();
        let child = child.clone();
        workers.spawn(async move {
            debug!(worker_id, "worker started");
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = child.cancelled() => None,
                };
                let Some(event) = event else {
                    break;
                };
                if let Err(e) = send_with_retry(&child, sink.as_ref(), &event, SEND_RETRIES).await {
                    error!(
                        worker_id,
                        database = %event.row.database,
                        table = %event.row.table,
                        error = %e,
                        "dropping event after exhausting retries"
                    );
                }
            }
            debug!(worker_id, "worker exiting");
        });
    }

    // First terminal cause wins: source outcome (error or clean end) or
    // cancellation of the root token.
    let outcome = tokio::select! {
        result = source_err_rx.recv() => match result {
            Some(Err(e)) if !e.is_cancelled() => Err(e),
            _ => Ok(()),
        },
        _ = token.cancelled() => {
            info!("pipeline cancelled");
            Ok(())
        }
    };

    // Tear down in order: stop producing, close components, drain workers.
    child.cancel();
    if let Err(e) = source.close().await {
        error!(error = %e, "failed to close source");
    }
    while workers.join_next().await.is_some() {}
    if let Err(e) = sink.close().await {
        error!(error = %e, "failed to close sink");
    }
    if let Err(e) = store.close().await {
        error!(error = %e, "failed to close store");
    }

    outcome
}
