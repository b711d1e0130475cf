//! Canonical change-event representation
//!
//! One [`ChangeEvent`] per affected row, in binlog order. The JSON encoding
//! of this struct is the wire payload handed to every sink:
//!
//! ```json
//! {"time":"2024-01-02T10:20:30.123Z","server_id":101,"pos":4096,
//!  "row":{"time":1704191430,"database":"app","table":"users","type":"update",
//!         "data":{"id":1,"name":"Bob"},"old":{"id":1,"name":"Alice"}}}
//! ```

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A row image as an ordered column-name to value mapping.
///
/// Insertion order follows the table's column declaration order.
pub type RowImage = IndexMap<String, Value>;

/// Row operation kind.
///
/// Non-standard actions reported by the replication stream pass through as
/// their raw string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Insert,
    Update,
    Delete,
    #[serde(untagged)]
    Other(String),
}

impl std::fmt::Display for RowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowKind::Insert => write!(f, "insert"),
            RowKind::Update => write!(f, "update"),
            RowKind::Delete => write!(f, "delete"),
            RowKind::Other(s) => write!(f, "{}", s),
        }
    }
}

/// The row-level portion of a change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    /// Seconds since epoch as recorded by the primary
    pub time: i64,
    /// Database the change occurred in
    pub database: String,
    /// Table the change occurred in
    pub table: String,
    /// Operation kind
    #[serde(rename = "type")]
    pub kind: RowKind,
    /// Row image; the post-image for updates
    pub data: RowImage,
    /// Pre-image; present only for updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<RowImage>,
}

/// A single captured row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Ingestion instant on the capturing host, for observability only
    pub time: DateTime<Utc>,
    /// Originating server id
    pub server_id: i64,
    /// Byte offset of the event within its binlog file
    pub pos: i64,
    /// The row change itself
    pub row: RowChange,
}

impl ChangeEvent {
    /// Create an insert event.
    pub fn insert(
        database: impl Into<String>,
        table: impl Into<String>,
        data: RowImage,
    ) -> Self {
        Self::with_kind(database, table, RowKind::Insert, data, None)
    }

    /// Create an update event with pre and post images.
    pub fn update(
        database: impl Into<String>,
        table: impl Into<String>,
        old: RowImage,
        data: RowImage,
    ) -> Self {
        Self::with_kind(database, table, RowKind::Update, data, Some(old))
    }

    /// Create a delete event.
    pub fn delete(
        database: impl Into<String>,
        table: impl Into<String>,
        data: RowImage,
    ) -> Self {
        Self::with_kind(database, table, RowKind::Delete, data, None)
    }

    fn with_kind(
        database: impl Into<String>,
        table: impl Into<String>,
        kind: RowKind,
        data: RowImage,
        old: Option<RowImage>,
    ) -> Self {
        Self {
            time: Utc::now(),
            server_id: 0,
            pos: 0,
            row: RowChange {
                time: 0,
                database: database.into(),
                table: table.into(),
                kind,
                data,
                old,
            },
        }
    }

    /// True for the standard DML kinds.
    pub fn is_dml(&self) -> bool {
        matches!(
            self.row.kind,
            RowKind::Insert | RowKind::Update | RowKind::Delete
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(pairs: &[(&str, Value)]) -> RowImage {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_insert_event() {
        let event = ChangeEvent::insert(
            "app",
            "users",
            image(&[("id", Value::Integer(1)), ("name", Value::from("Alice"))]),
        );

        assert_eq!(event.row.kind, RowKind::Insert);
        assert!(event.row.old.is_none());
        assert!(event.is_dml());
    }

    #[test]
    fn test_update_event_images() {
        let event = ChangeEvent::update(
            "app",
            "users",
            image(&[("id", Value::Integer(1)), ("name", Value::from("Alice"))]),
            image(&[("id", Value::Integer(1)), ("name", Value::from("Bob"))]),
        );

        assert_eq!(event.row.kind, RowKind::Update);
        let old = event.row.old.as_ref().unwrap();
        assert_eq!(
            old.keys().collect::<Vec<_>>(),
            event.row.data.keys().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_old_omitted_from_json() {
        let event = ChangeEvent::insert("app", "users", image(&[("id", Value::Integer(1))]));
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("\"old\""));
        assert!(json.contains("\"type\":\"insert\""));
    }

    #[test]
    fn test_row_kind_passthrough() {
        let kind: RowKind = serde_json::from_str("\"truncate\"").unwrap();
        assert_eq!(kind, RowKind::Other("truncate".to_string()));
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"truncate\"");

        let kind: RowKind = serde_json::from_str("\"update\"").unwrap();
        assert_eq!(kind, RowKind::Update);
    }

    #[test]
    fn test_json_round_trip() {
        let mut event = ChangeEvent::update(
            "app",
            "users",
            image(&[("id", Value::Integer(1)), ("name", Value::from("Alice"))]),
            image(&[("id", Value::Integer(1)), ("name", Value::from("Bob"))]),
        );
        event.server_id = 101;
        event.pos = 4096;
        event.row.time = 1_704_191_430;

        let json = serde_json::to_string(&event).unwrap();
        let parsed: ChangeEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.server_id, 101);
        assert_eq!(parsed.pos, 4096);
        assert_eq!(parsed.row, event.row);
    }

    #[test]
    fn test_data_preserves_column_order() {
        let event = ChangeEvent::insert(
            "app",
            "users",
            image(&[
                ("zeta", Value::Integer(1)),
                ("alpha", Value::Integer(2)),
                ("mid", Value::Integer(3)),
            ]),
        );
        let json = serde_json::to_string(&event).unwrap();
        let zeta = json.find("zeta").unwrap();
        let alpha = json.find("alpha").unwrap();
        let mid = json.find("mid").unwrap();
        assert!(zeta < alpha && alpha < mid);
    }
}
