//! # dbx-cdc - MySQL change data capture
//!
//! Tails a MySQL primary's binlog as a replica and turns row events into
//! canonical [`ChangeEvent`]s with a resumable position checkpoint.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   callbacks   ┌───────────────┐   bounded channel
//! │ BinlogReader │──────────────▶│  MysqlSource  │──────────────────▶ workers
//! │ (protocol +  │  on_row       │  filter +     │
//! │  decoder)    │  on_pos_sync  │  coerce +     │──▶ position store
//! └──────────────┘               │  checkpoint   │
//!                                └───────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! # async fn example() -> dbx_cdc::Result<()> {
//! use dbx_cdc::source::{new_source, SourceConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = SourceConfig {
//!     kind: "mysql".to_string(),
//!     ..Default::default()
//! };
//! let source = new_source(&config)?;
//! // source.with_store(store);
//! source.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod binlog;
pub mod error;
pub mod event;
pub mod filter;
pub mod position;
pub mod source;
pub mod value;

pub use error::{CdcError, Result};
pub use event::{ChangeEvent, RowChange, RowImage, RowKind};
pub use filter::TableFilter;
pub use position::BinlogPosition;
pub use source::{EventReceiver, MysqlSource, MysqlSourceConfig, SourceConfig, POSITION_KEY};
pub use value::{ColumnDescriptor, SqlKind, Value};
