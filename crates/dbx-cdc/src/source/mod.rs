//! Change-data sources
//!
//! One source type exists today (`mysql`); the config keeps the `type` tag so
//! the selection stays explicit in the file format.

mod mysql;

pub use mysql::{
    rows_to_events, EventReceiver, MysqlSource, MysqlSourceConfig, EVENT_CHANNEL_CAPACITY,
};

use serde::{Deserialize, Serialize};

use crate::error::{CdcError, Result};

/// Store key under which the serialized replication position lives.
pub const POSITION_KEY: &str = "_dbxgo_position";

/// Source selection plus per-type settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub mysql: MysqlSourceConfig,
}

impl SourceConfig {
    /// Build from `SOURCE_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            kind: std::env::var("SOURCE_TYPE").unwrap_or_default(),
            mysql: MysqlSourceConfig::from_env(),
        }
    }
}

/// Construct the source named by `config.type`.
pub fn new_source(config: &SourceConfig) -> Result<MysqlSource> {
    match config.kind.as_str() {
        "mysql" => MysqlSource::new(config.mysql.clone()),
        other => Err(CdcError::config(format!(
            "unsupported source type: {:?}",
            other
        ))),
    }
}
