//! Binlog reader
//!
//! Drives the protocol client and the decoder, resolves column names, and
//! surfaces typed callbacks to an installed [`EventHandler`]:
//!
//! - `on_row` for every WRITE/UPDATE/DELETE rows event, in binlog order
//! - `on_position_synced` at transaction commit (XID) and log rotation,
//!   marking positions that are safe to checkpoint
//!
//! The terminal outcome of the stream is the return value of
//! [`BinlogReader::run`]: `Ok` on cancellation or a clean server EOF, an
//! error otherwise.

use async_trait::async_trait;
use mysql_async::prelude::*;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::decoder::{BinlogDecoder, BinlogValue, EventBody, EventHeader, RowsEventData, TableMapEvent};
use super::protocol::BinlogClient;
use crate::error::{CdcError, Result};
use crate::position::BinlogPosition;
use crate::value::{ColumnDescriptor, SqlKind};

/// Heartbeat period requested from the primary, in nanoseconds.
const HEARTBEAT_PERIOD_NS: u64 = 30_000_000_000;

/// Connection identity for the replica.
#[derive(Clone)]
pub struct ReaderConfig {
    /// `host:port` of the primary
    pub addr: String,
    pub user: String,
    pub password: String,
    /// Replica server id, unique among the primary's replicas
    pub server_id: u32,
}

impl std::fmt::Debug for ReaderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderConfig")
            .field("addr", &self.addr)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("server_id", &self.server_id)
            .finish()
    }
}

/// Row action carried by a rows event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowAction {
    Insert,
    Update,
    Delete,
    /// Forward-compatible pass-through for actions this reader does not know
    Other(String),
}

/// Header fields shared by all rows of one event.
#[derive(Debug, Clone)]
pub struct RowsHeader {
    pub timestamp: u32,
    pub server_id: u32,
    pub log_pos: u32,
}

/// The table a rows event applies to, with resolved column descriptors.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub database: String,
    pub table: String,
    pub columns: Vec<ColumnDescriptor>,
}

/// One decoded rows event.
///
/// `rows` is a flat, ordered list of row images. For updates the images come
/// in pre/post pairs: `rows[2k]` is the pre-image and `rows[2k+1]` the
/// post-image of the k-th changed row.
#[derive(Debug, Clone)]
pub struct RowsEvent {
    pub header: RowsHeader,
    pub table: TableDescriptor,
    pub action: RowAction,
    pub rows: Vec<Vec<BinlogValue>>,
}

/// Callbacks invoked by the reader, in binlog order on one logical stream.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_row(&self, event: RowsEvent) -> Result<()>;
    async fn on_position_synced(&self, pos: BinlogPosition) -> Result<()>;
}

/// Bounded FIFO cache of column-name lists keyed by `(schema, table)`.
///
/// Binlog events carry column types but not names; names come from
/// INFORMATION_SCHEMA and are cached here to avoid a query per table map.
pub struct SchemaCache {
    tables: HashMap<(String, String), Vec<String>>,
    insertion_order: VecDeque<(String, String)>,
    max_entries: usize,
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaCache {
    const DEFAULT_MAX_ENTRIES: usize = 1024;

    pub fn new() -> Self {
        Self::with_max_entries(Self::DEFAULT_MAX_ENTRIES)
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            tables: HashMap::new(),
            insertion_order: VecDeque::new(),
            max_entries,
        }
    }

    pub fn get(&self, schema: &str, table: &str) -> Option<&Vec<String>> {
        self.tables.get(&(schema.to_string(), table.to_string()))
    }

    pub fn insert(&mut self, schema: &str, table: &str, columns: Vec<String>) {
        let key = (schema.to_string(), table.to_string());
        if self.tables.insert(key.clone(), columns).is_none() {
            self.insertion_order.push_back(key);
            while self.tables.len() > self.max_entries {
                match self.insertion_order.pop_front() {
                    Some(oldest) => {
                        self.tables.remove(&oldest);
                        debug!(schema = %oldest.0, table = %oldest.1, "evicted schema cache entry");
                    }
                    None => break,
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Streams binlog events from one primary and dispatches them to a handler.
pub struct BinlogReader {
    config: ReaderConfig,
    handler: Arc<dyn EventHandler>,
}

impl BinlogReader {
    pub fn new(config: ReaderConfig, handler: Arc<dyn EventHandler>) -> Self {
        Self { config, handler }
    }

    /// Run the replication stream from `start` until cancellation, a clean
    /// server EOF, or a terminal error.
    pub async fn run(&self, start: BinlogPosition, token: CancellationToken) -> Result<()> {
        let pool = mysql_async::Pool::new(metadata_opts(&self.config)?);
        let result = self.stream_events(&start, &token, &pool).await;
        pool.disconnect().await.ok();
        result
    }

    async fn stream_events(
        &self,
        start: &BinlogPosition,
        token: &CancellationToken,
        pool: &mysql_async::Pool,
    ) -> Result<()> {
        let checksum = match binlog_checksum_enabled(pool).await {
            Ok(enabled) => enabled,
            Err(e) => {
                debug!(error = %e, "could not query binlog_checksum, assuming CRC32");
                true
            }
        };

        let mut client = BinlogClient::connect(&self.config.addr, &self.config.user, &self.config.password)
            .await
            .map_err(|e| CdcError::connect(e.to_string()))?;

        // Acknowledge checksums so the primary streams to us at all; the
        // variable name changed in MySQL 8.0.26.
        if let Err(e) = client
            .query("SET @source_binlog_checksum = @@global.binlog_checksum")
            .await
        {
            if let Err(e2) = client
                .query("SET @master_binlog_checksum = @@global.binlog_checksum")
                .await
            {
                debug!(error = %e, fallback_error = %e2, "binlog checksum negotiation failed");
            }
        }
        if let Err(e) = client
            .query(&format!("SET @master_heartbeat_period = {}", HEARTBEAT_PERIOD_NS))
            .await
        {
            debug!(error = %e, "heartbeat period negotiation failed");
        }

        client
            .register_replica(self.config.server_id)
            .await
            .map_err(|e| CdcError::reader(e.to_string()))?;

        let mut stream = client
            .binlog_dump(self.config.server_id, &start.file, start.pos)
            .await
            .map_err(|e| CdcError::reader(e.to_string()))?;

        let mut decoder = BinlogDecoder::new(checksum);
        let mut cache = SchemaCache::new();
        let mut tables: HashMap<u64, TableDescriptor> = HashMap::new();
        let mut current_file = start.file.clone();

        loop {
            let payload = tokio::select! {
                _ = token.cancelled() => {
                    info!("binlog reader cancelled");
                    return Ok(());
                }
                next = stream.next_event() => match next {
                    Ok(Some(payload)) => payload,
                    Ok(None) => {
                        warn!("binlog stream closed by the primary");
                        return Ok(());
                    }
                    Err(e) => return Err(CdcError::reader(e.to_string())),
                },
            };

            // A malformed event means the stream is desynced; terminal.
            let event = decoder
                .decode(&payload)
                .map_err(|e| CdcError::reader(format!("malformed binlog event: {}", e)))?;
            let header = event.header;

            match event.body {
                EventBody::FormatDescription(fde) => {
                    info!(
                        binlog_version = fde.binlog_version,
                        server_version = %fde.server_version,
                        "binlog format"
                    );
                }
                EventBody::Rotate(rotate) => {
                    info!(file = %rotate.next_binlog, pos = rotate.position, "binlog rotate");
                    current_file = rotate.next_binlog;
                    self.handler
                        .on_position_synced(BinlogPosition::new(
                            current_file.clone(),
                            rotate.position as u32,
                        ))
                        .await?;
                }
                EventBody::TableMap(map) => {
                    let descriptor = resolve_table(&map, &mut cache, pool).await;
                    tables.insert(map.table_id, descriptor);
                }
                EventBody::WriteRows(data) => {
                    self.dispatch_rows(RowAction::Insert, &header, data, &tables)
                        .await?;
                }
                EventBody::UpdateRows(data) => {
                    self.dispatch_rows(RowAction::Update, &header, data, &tables)
                        .await?;
                }
                EventBody::DeleteRows(data) => {
                    self.dispatch_rows(RowAction::Delete, &header, data, &tables)
                        .await?;
                }
                EventBody::Xid(xid) => {
                    debug!(xid, pos = header.next_position, "transaction commit");
                    self.handler
                        .on_position_synced(BinlogPosition::new(
                            current_file.clone(),
                            header.next_position,
                        ))
                        .await?;
                }
                EventBody::Query(query) => {
                    debug!(schema = %query.schema, "query event");
                }
                EventBody::Gtid | EventBody::Heartbeat | EventBody::Unknown(_) => {}
            }
        }
    }

    async fn dispatch_rows(
        &self,
        action: RowAction,
        header: &EventHeader,
        data: RowsEventData,
        tables: &HashMap<u64, TableDescriptor>,
    ) -> Result<()> {
        let Some(table) = tables.get(&data.table_id) else {
            warn!(table_id = data.table_id, "no table map for rows event, skipping");
            return Ok(());
        };

        let rows = flatten_images(&action, data);
        self.handler
            .on_row(RowsEvent {
                header: RowsHeader {
                    timestamp: header.timestamp,
                    server_id: header.server_id,
                    log_pos: header.next_position,
                },
                table: table.clone(),
                action,
                rows,
            })
            .await
    }
}

/// Flatten decoder row images into the reader's flat image list.
///
/// Updates contribute their pre- and post-image in order, so consumers see
/// pairs; a truncated update row contributes only what survived.
fn flatten_images(action: &RowAction, data: RowsEventData) -> Vec<Vec<BinlogValue>> {
    let mut images = Vec::with_capacity(data.rows.len() * 2);
    for row in data.rows {
        match action {
            RowAction::Update => {
                if let Some(before) = row.before {
                    images.push(before);
                }
                if let Some(after) = row.after {
                    images.push(after);
                }
            }
            RowAction::Delete => {
                if let Some(before) = row.before {
                    images.push(before);
                }
            }
            _ => {
                if let Some(after) = row.after {
                    images.push(after);
                }
            }
        }
    }
    images
}

async fn resolve_table(
    map: &TableMapEvent,
    cache: &mut SchemaCache,
    pool: &mysql_async::Pool,
) -> TableDescriptor {
    let names: Vec<String> = match cache.get(&map.schema_name, &map.table_name) {
        Some(names) => names.clone(),
        None => match query_column_names(pool, &map.schema_name, &map.table_name).await {
            Ok(names) => {
                if names.len() != map.column_count {
                    warn!(
                        schema = %map.schema_name,
                        table = %map.table_name,
                        declared = map.column_count,
                        resolved = names.len(),
                        "column count mismatch between binlog and information_schema"
                    );
                }
                cache.insert(&map.schema_name, &map.table_name, names.clone());
                names
            }
            Err(e) => {
                warn!(
                    schema = %map.schema_name,
                    table = %map.table_name,
                    error = %e,
                    "failed to resolve column names, using positional names"
                );
                Vec::new()
            }
        },
    };

    let columns = map
        .column_types
        .iter()
        .enumerate()
        .map(|(idx, col_type)| {
            let name = names
                .get(idx)
                .cloned()
                .unwrap_or_else(|| format!("col{}", idx));
            ColumnDescriptor::new(name, SqlKind::from_column_type(*col_type))
        })
        .collect();

    TableDescriptor {
        database: map.schema_name.clone(),
        table: map.table_name.clone(),
        columns,
    }
}

async fn query_column_names(
    pool: &mysql_async::Pool,
    schema: &str,
    table: &str,
) -> std::result::Result<Vec<String>, mysql_async::Error> {
    let mut conn = pool.get_conn().await?;
    conn.exec(
        r"SELECT COLUMN_NAME
          FROM INFORMATION_SCHEMA.COLUMNS
          WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
          ORDER BY ORDINAL_POSITION",
        (schema, table),
    )
    .await
}

async fn binlog_checksum_enabled(
    pool: &mysql_async::Pool,
) -> std::result::Result<bool, mysql_async::Error> {
    let mut conn = pool.get_conn().await?;
    let value: Option<String> = conn.query_first("SELECT @@global.binlog_checksum").await?;
    Ok(value.is_some_and(|v| v.eq_ignore_ascii_case("CRC32")))
}

fn metadata_opts(config: &ReaderConfig) -> Result<mysql_async::Opts> {
    let (host, port) = split_addr(&config.addr)?;
    Ok(mysql_async::OptsBuilder::default()
        .ip_or_hostname(host)
        .tcp_port(port)
        .user(Some(config.user.clone()))
        .pass(Some(config.password.clone()))
        .into())
}

/// Split `host:port`, defaulting the port to 3306.
pub(crate) fn split_addr(addr: &str) -> Result<(String, u16)> {
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| CdcError::config(format!("invalid addr {:?}", addr)))?;
            Ok((host.to_string(), port))
        }
        None => Ok((addr.to_string(), 3306)),
    }
}

/// Ask the primary for its current binlog tip.
pub async fn query_master_tip(config: &ReaderConfig) -> Result<BinlogPosition> {
    let opts = metadata_opts(config)?;
    let mut conn = mysql_async::Conn::new(opts)
        .await
        .map_err(|e| CdcError::connect(e.to_string()))?;

    // MySQL 8.2 renamed the statement.
    let rows: Vec<mysql_async::Row> = match conn.query("SHOW BINARY LOG STATUS").await {
        Ok(rows) => rows,
        Err(_) => conn
            .query("SHOW MASTER STATUS")
            .await
            .map_err(|e| CdcError::connect(e.to_string()))?,
    };
    conn.disconnect().await.ok();

    match rows.into_iter().next() {
        Some(row) => {
            let file: String = row.get(0).unwrap_or_default();
            let pos = row.get::<u64, _>(1).map(|p| p as u32).unwrap_or(4);
            if file.is_empty() {
                return Err(CdcError::connect(
                    "primary reported no binlog position, binary logging may be disabled",
                ));
            }
            info!(file = %file, pos, "primary binlog tip");
            Ok(BinlogPosition::new(file, pos))
        }
        None => Err(CdcError::connect(
            "primary reported no binlog status rows, binary logging may be disabled",
        )),
    }
}
