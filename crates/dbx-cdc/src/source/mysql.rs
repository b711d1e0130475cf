//! MySQL source engine
//!
//! Owns a [`BinlogReader`], converts its row callbacks into canonical
//! [`ChangeEvent`]s, and checkpoints the replication position on every
//! position-sync callback.
//!
//! Events are pushed onto a bounded channel with non-blocking semantics:
//! when the downstream cannot keep up the event is dropped and a warning
//! emitted, rather than stalling the replication stream and letting the
//! primary expire our position.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use async_trait::async_trait;
use dbx_store::Store;

use super::POSITION_KEY;
use crate::binlog::reader::query_master_tip;
use crate::binlog::{BinlogReader, EventHandler, ReaderConfig, RowAction, RowsEvent};
use crate::error::{CdcError, Result};
use crate::event::{ChangeEvent, RowChange, RowKind};
use crate::filter::TableFilter;
use crate::position::BinlogPosition;
use crate::value::coerce_row;

/// Events buffered between the reader and the workers.
pub const EVENT_CHANNEL_CAPACITY: usize = 10_240;

/// MySQL source settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MysqlSourceConfig {
    pub addr: String,
    pub user: String,
    pub password: String,
    pub include_table_regex: Vec<String>,
    pub exclude_table_regex: Vec<String>,
    /// Replica identity announced to the primary
    pub server_id: u32,
}

impl Default for MysqlSourceConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3306".to_string(),
            user: "root".to_string(),
            password: String::new(),
            include_table_regex: Vec::new(),
            exclude_table_regex: Vec::new(),
            server_id: 1001,
        }
    }
}

impl std::fmt::Debug for MysqlSourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MysqlSourceConfig")
            .field("addr", &self.addr)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("include_table_regex", &self.include_table_regex)
            .field("exclude_table_regex", &self.exclude_table_regex)
            .field("server_id", &self.server_id)
            .finish()
    }
}

impl MysqlSourceConfig {
    /// Build from `SOURCE_MYSQL_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            addr: env_or("SOURCE_MYSQL_ADDR", defaults.addr),
            user: env_or("SOURCE_MYSQL_USER", defaults.user),
            password: env_or("SOURCE_MYSQL_PASSWORD", defaults.password),
            include_table_regex: env_list("SOURCE_MYSQL_INCLUDE_TABLE_REGEX"),
            exclude_table_regex: env_list("SOURCE_MYSQL_EXCLUDE_TABLE_REGEX"),
            server_id: std::env::var("SOURCE_MYSQL_SERVER_ID")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.server_id),
        }
    }

    fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            addr: self.addr.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            server_id: self.server_id,
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Shared consuming handle over the source's events channel.
///
/// Clones share one receiver, so any number of workers can drain the channel
/// concurrently. `recv` returns `None` once the source has closed the
/// channel and all buffered events are consumed.
#[derive(Clone)]
pub struct EventReceiver {
    inner: Arc<tokio::sync::Mutex<mpsc::Receiver<ChangeEvent>>>,
}

impl EventReceiver {
    pub async fn recv(&self) -> Option<ChangeEvent> {
        self.inner.lock().await.recv().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    Idle,
    Running,
    Closed,
}

/// The MySQL CDC source engine.
///
/// Lifecycle: `Idle -> Running -> Closed`. `run` is legal once, from `Idle`;
/// `close` is legal from any state and idempotent.
pub struct MysqlSource {
    cfg: MysqlSourceConfig,
    filter: Arc<TableFilter>,
    store: Mutex<Option<Arc<dyn Store>>>,
    state: Mutex<SourceState>,
    sender: Mutex<Option<mpsc::Sender<ChangeEvent>>>,
    receiver: EventReceiver,
    shutdown: CancellationToken,
}

impl MysqlSource {
    pub fn new(cfg: MysqlSourceConfig) -> Result<Self> {
        let filter = TableFilter::new(&cfg.include_table_regex, &cfg.exclude_table_regex)?;
        let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            cfg,
            filter: Arc::new(filter),
            store: Mutex::new(None),
            state: Mutex::new(SourceState::Idle),
            sender: Mutex::new(Some(sender)),
            receiver: EventReceiver {
                inner: Arc::new(tokio::sync::Mutex::new(receiver)),
            },
            shutdown: CancellationToken::new(),
        })
    }

    /// Attach the position store. Required before `run`.
    pub fn with_store(&self, store: Arc<dyn Store>) {
        *self.store.lock().unwrap() = Some(store);
    }

    /// Consuming handle for the events channel.
    pub fn events(&self) -> EventReceiver {
        self.receiver.clone()
    }

    /// Run the replication stream until cancellation or a terminal error.
    ///
    /// Returns [`CdcError::Cancelled`] as the ok termination cause when the
    /// token fires, a reader error otherwise.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let store = self
            .store
            .lock()
            .unwrap()
            .clone()
            .ok_or(CdcError::StoreNotInitialized)?;

        {
            let mut state = self.state.lock().unwrap();
            if *state != SourceState::Idle {
                return Err(CdcError::AlreadyRunning);
            }
            *state = SourceState::Running;
        }
        // The handler takes the only sender; when the reader task ends the
        // channel closes once drained.
        let sender = self
            .sender
            .lock()
            .unwrap()
            .take()
            .ok_or(CdcError::AlreadyRunning)?;

        let reader_cfg = self.cfg.reader_config();
        let start = self.starting_position(store.as_ref(), &reader_cfg).await;
        info!(position = %start, "starting replication");

        let handler = Arc::new(SourceHandler {
            filter: self.filter.clone(),
            sender,
            store,
        });
        let reader = BinlogReader::new(reader_cfg, handler);
        let reader_token = self.shutdown.child_token();

        let (done_tx, mut done_rx) = mpsc::channel::<Result<()>>(1);
        tokio::spawn(async move {
            let result = reader.run(start, reader_token).await;
            let _ = done_tx.send(result).await;
        });

        let outcome = tokio::select! {
            _ = token.cancelled() => {
                info!("source cancelled");
                self.shutdown.cancel();
                done_rx.recv().await;
                Err(CdcError::Cancelled)
            }
            _ = self.shutdown.cancelled() => {
                done_rx.recv().await;
                Err(CdcError::Cancelled)
            }
            result = done_rx.recv() => match result {
                Some(Ok(())) => Ok(()),
                Some(Err(e)) => Err(e),
                // The task died without posting a result, e.g. a panic;
                // that is a terminal reader failure, not a clean stop.
                None => Err(CdcError::reader(
                    "replication task terminated unexpectedly",
                )),
            },
        };

        *self.state.lock().unwrap() = SourceState::Closed;
        outcome
    }

    /// Abort the reader and close the events channel. Idempotent.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state == SourceState::Closed {
                return Ok(());
            }
            *state = SourceState::Closed;
        }
        self.shutdown.cancel();
        // If run was never called the sender is still ours to drop.
        self.sender.lock().unwrap().take();
        Ok(())
    }

    async fn starting_position(&self, store: &dyn Store, reader_cfg: &ReaderConfig) -> BinlogPosition {
        if let Some(pos) = stored_position(store).await {
            debug!(position = %pos, "resuming from checkpointed position");
            return pos;
        }
        match query_master_tip(reader_cfg).await {
            Ok(pos) => pos,
            Err(e) => {
                warn!(error = %e, "could not determine primary tip, starting from the default position");
                BinlogPosition::default()
            }
        }
    }
}

/// Load and validate the checkpointed position, if any.
pub(crate) async fn stored_position(store: &dyn Store) -> Option<BinlogPosition> {
    let bytes = match store.get(POSITION_KEY).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return None,
        Err(e) => {
            warn!(error = %e, "failed to load checkpointed position");
            return None;
        }
    };
    match serde_json::from_slice::<BinlogPosition>(&bytes) {
        Ok(pos) if !pos.is_zero() => Some(pos),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "checkpointed position is malformed, ignoring");
            None
        }
    }
}

/// Reader-facing half of the source: filters, converts, and pushes events,
/// and persists position checkpoints.
struct SourceHandler {
    filter: Arc<TableFilter>,
    sender: mpsc::Sender<ChangeEvent>,
    store: Arc<dyn Store>,
}

#[async_trait]
impl EventHandler for SourceHandler {
    async fn on_row(&self, event: RowsEvent) -> Result<()> {
        if !self.filter.matches(&event.table.database, &event.table.table) {
            return Ok(());
        }

        for change in rows_to_events(Utc::now(), &event) {
            match self.sender.try_send(change) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => {
                    warn!(
                        database = %dropped.row.database,
                        table = %dropped.row.table,
                        "event channel full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => return Ok(()),
            }
        }
        Ok(())
    }

    async fn on_position_synced(&self, pos: BinlogPosition) -> Result<()> {
        let body = serde_json::to_vec(&pos)?;
        if let Err(e) = self.store.set(POSITION_KEY, &body).await {
            warn!(
                error = %e,
                position = %pos,
                "failed to checkpoint position, will retry on next sync"
            );
        }
        Ok(())
    }
}

/// Convert one rows event into canonical change events.
///
/// Inserts and deletes yield one event per row image. Updates consume images
/// in pre/post pairs; a trailing unpaired image still yields an event with
/// only the post-image, it is not dropped.
pub fn rows_to_events(now: DateTime<Utc>, event: &RowsEvent) -> Vec<ChangeEvent> {
    let columns = &event.table.columns;
    let make = |kind: RowKind, data, old| ChangeEvent {
        time: now,
        server_id: event.header.server_id as i64,
        pos: event.header.log_pos as i64,
        row: RowChange {
            time: event.header.timestamp as i64,
            database: event.table.database.clone(),
            table: event.table.table.clone(),
            kind,
            data,
            old,
        },
    };

    let mut events = Vec::new();
    match &event.action {
        RowAction::Insert => {
            for image in &event.rows {
                events.push(make(RowKind::Insert, coerce_row(image, columns), None));
            }
        }
        RowAction::Delete => {
            for image in &event.rows {
                events.push(make(RowKind::Delete, coerce_row(image, columns), None));
            }
        }
        RowAction::Update => {
            let mut idx = 0;
            while idx < event.rows.len() {
                if idx + 1 < event.rows.len() {
                    let old = coerce_row(&event.rows[idx], columns);
                    let data = coerce_row(&event.rows[idx + 1], columns);
                    events.push(make(RowKind::Update, data, Some(old)));
                    idx += 2;
                } else {
                    let data = coerce_row(&event.rows[idx], columns);
                    events.push(make(RowKind::Update, data, None));
                    idx += 1;
                }
            }
        }
        RowAction::Other(action) => {
            for image in &event.rows {
                events.push(make(
                    RowKind::Other(action.clone()),
                    coerce_row(image, columns),
                    None,
                ));
            }
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::decoder::BinlogValue;
    use crate::binlog::{RowsHeader, TableDescriptor};
    use crate::value::{ColumnDescriptor, SqlKind, Value};
    use dbx_store::StoreError;
    use std::collections::HashMap;

    struct MemoryStore {
        entries: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl MemoryStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                entries: Mutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn has(&self, key: &str) -> bool {
            self.entries.lock().unwrap().contains_key(key)
        }

        async fn set(&self, key: &str, value: &[u8]) -> std::result::Result<(), StoreError> {
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_vec());
            Ok(())
        }

        async fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, StoreError> {
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn delete(&self, key: &str) -> std::result::Result<(), StoreError> {
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }

        async fn close(&self) -> std::result::Result<(), StoreError> {
            Ok(())
        }
    }

    fn users_event(action: RowAction, rows: Vec<Vec<BinlogValue>>) -> RowsEvent {
        RowsEvent {
            header: RowsHeader {
                timestamp: 1_704_191_430,
                server_id: 101,
                log_pos: 4096,
            },
            table: TableDescriptor {
                database: "app".to_string(),
                table: "users".to_string(),
                columns: vec![
                    ColumnDescriptor::new("id", SqlKind::Integer),
                    ColumnDescriptor::new("name", SqlKind::Text),
                ],
            },
            action,
            rows,
        }
    }

    fn row(id: i64, name: &str) -> Vec<BinlogValue> {
        vec![
            BinlogValue::SignedInt(id),
            BinlogValue::String(name.to_string()),
        ]
    }

    #[test]
    fn test_insert_emits_one_event_per_row() {
        let event = users_event(RowAction::Insert, vec![row(1, "Alice")]);
        let events = rows_to_events(Utc::now(), &event);

        assert_eq!(events.len(), 1);
        let change = &events[0];
        assert_eq!(change.row.kind, RowKind::Insert);
        assert_eq!(change.row.data["id"], Value::Integer(1));
        assert_eq!(change.row.data["name"], Value::String("Alice".into()));
        assert!(change.row.old.is_none());
        assert_eq!(change.server_id, 101);
        assert_eq!(change.pos, 4096);
        assert_eq!(change.row.time, 1_704_191_430);
    }

    #[test]
    fn test_update_pairs_pre_and_post_images() {
        let event = users_event(RowAction::Update, vec![row(1, "Alice"), row(1, "Bob")]);
        let events = rows_to_events(Utc::now(), &event);

        assert_eq!(events.len(), 1);
        let change = &events[0];
        assert_eq!(change.row.kind, RowKind::Update);
        assert_eq!(change.row.data["name"], Value::String("Bob".into()));
        let old = change.row.old.as_ref().unwrap();
        assert_eq!(old["name"], Value::String("Alice".into()));
        assert_eq!(
            old.keys().collect::<Vec<_>>(),
            change.row.data.keys().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_delete_emits_single_image() {
        let event = users_event(RowAction::Delete, vec![row(2, "Carol")]);
        let events = rows_to_events(Utc::now(), &event);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].row.kind, RowKind::Delete);
        assert_eq!(events[0].row.data["id"], Value::Integer(2));
        assert!(events[0].row.old.is_none());
    }

    #[test]
    fn test_update_with_odd_image_count_keeps_orphan() {
        let event = users_event(
            RowAction::Update,
            vec![row(1, "a"), row(1, "b"), row(2, "orphan")],
        );
        let events = rows_to_events(Utc::now(), &event);

        assert_eq!(events.len(), 2);
        assert!(events[0].row.old.is_some());
        assert!(events[1].row.old.is_none());
        assert_eq!(events[1].row.data["name"], Value::String("orphan".into()));
    }

    #[test]
    fn test_zero_rows_emits_nothing() {
        let event = users_event(RowAction::Insert, vec![]);
        assert!(rows_to_events(Utc::now(), &event).is_empty());
    }

    #[test]
    fn test_unknown_action_passes_through() {
        let event = users_event(RowAction::Other("truncate".into()), vec![row(1, "x")]);
        let events = rows_to_events(Utc::now(), &event);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].row.kind, RowKind::Other("truncate".into()));
    }

    #[test]
    fn test_log_position_monotonic_within_batch() {
        let event = users_event(RowAction::Insert, vec![row(1, "a"), row(2, "b")]);
        let events = rows_to_events(Utc::now(), &event);
        assert!(events.windows(2).all(|w| w[0].pos <= w[1].pos));
    }

    #[tokio::test]
    async fn test_handler_filters_excluded_tables() {
        let (sender, mut receiver) = mpsc::channel(16);
        let handler = SourceHandler {
            filter: Arc::new(TableFilter::default_filter()),
            sender,
            store: MemoryStore::new(),
        };

        let mut event = users_event(RowAction::Insert, vec![row(1, "root")]);
        event.table.database = "mysql".to_string();
        event.table.table = "user".to_string();
        handler.on_row(event).await.unwrap();

        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handler_drops_on_full_channel() {
        let (sender, mut receiver) = mpsc::channel(1);
        let handler = SourceHandler {
            filter: Arc::new(TableFilter::default_filter()),
            sender,
            store: MemoryStore::new(),
        };

        let event = users_event(RowAction::Insert, vec![row(1, "a"), row(2, "b"), row(3, "c")]);
        // Must not block even though the channel only holds one event.
        handler.on_row(event).await.unwrap();

        assert!(receiver.try_recv().is_ok());
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_position_sync_persists_checkpoint() {
        let store = MemoryStore::new();
        let (sender, _receiver) = mpsc::channel(1);
        let handler = SourceHandler {
            filter: Arc::new(TableFilter::default_filter()),
            sender,
            store: store.clone(),
        };

        handler
            .on_position_synced(BinlogPosition::new("bin.000003", 1024))
            .await
            .unwrap();

        let bytes = store.get(POSITION_KEY).await.unwrap().unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"file":"bin.000003","pos":1024}"#
        );
    }

    #[tokio::test]
    async fn test_stored_position_round_trip() {
        let store = MemoryStore::new();
        store
            .set(POSITION_KEY, br#"{"file":"bin.000003","pos":1024}"#)
            .await
            .unwrap();

        let pos = stored_position(store.as_ref()).await.unwrap();
        assert_eq!(pos, BinlogPosition::new("bin.000003", 1024));
    }

    #[tokio::test]
    async fn test_stored_position_rejects_zero_and_garbage() {
        let store = MemoryStore::new();
        assert!(stored_position(store.as_ref()).await.is_none());

        store
            .set(POSITION_KEY, br#"{"file":"","pos":0}"#)
            .await
            .unwrap();
        assert!(stored_position(store.as_ref()).await.is_none());

        store.set(POSITION_KEY, b"not json").await.unwrap();
        assert!(stored_position(store.as_ref()).await.is_none());
    }

    #[tokio::test]
    async fn test_run_requires_store() {
        let source = MysqlSource::new(MysqlSourceConfig::default()).unwrap();
        let err = source.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CdcError::StoreNotInitialized));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let source = MysqlSource::new(MysqlSourceConfig::default()).unwrap();
        source.close().await.unwrap();
        source.close().await.unwrap();

        // Closing drops the sender, so the channel reads as terminated.
        assert!(source.events().recv().await.is_none());
    }

    #[tokio::test]
    async fn test_run_after_close_fails() {
        let source = MysqlSource::new(MysqlSourceConfig::default()).unwrap();
        source.with_store(MemoryStore::new());
        source.close().await.unwrap();

        let err = source.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CdcError::AlreadyRunning));
    }
}
