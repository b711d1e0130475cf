//! Language-neutral column values and type coercion
//!
//! The binlog decoder produces [`BinlogValue`]s typed by the wire protocol;
//! this module folds them into the small [`Value`] model every sink sees,
//! driven by the column's declared [`SqlKind`]. Coercion is total: malformed
//! input falls back to the raw representation, it never fails.
//!
//! [`BinlogValue`]: crate::binlog::decoder::BinlogValue

use base64::Engine;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::binlog::decoder::{BinlogValue, ColumnType};

/// A column value in the canonical event model.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Bytes(Vec<u8>),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::Timestamp(t) => {
                serializer.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Value::Bytes(b) => {
                serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(b))
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(match raw {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s),
            other => Value::String(other.to_string()),
        })
    }
}

/// Declared column type classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlKind {
    Integer,
    Float,
    Decimal,
    Bit,
    Temporal,
    Text,
    Json,
    Binary,
    Spatial,
    Other,
}

impl SqlKind {
    /// Classify a binlog wire type.
    pub fn from_column_type(col_type: ColumnType) -> Self {
        match col_type {
            ColumnType::Tiny
            | ColumnType::Short
            | ColumnType::Int24
            | ColumnType::Long
            | ColumnType::LongLong
            | ColumnType::Year => SqlKind::Integer,
            ColumnType::Float | ColumnType::Double => SqlKind::Float,
            ColumnType::Decimal | ColumnType::NewDecimal => SqlKind::Decimal,
            ColumnType::Bit => SqlKind::Bit,
            ColumnType::Date
            | ColumnType::Time
            | ColumnType::Time2
            | ColumnType::DateTime
            | ColumnType::DateTime2
            | ColumnType::Timestamp
            | ColumnType::Timestamp2 => SqlKind::Temporal,
            ColumnType::Varchar
            | ColumnType::VarString
            | ColumnType::String
            | ColumnType::Enum
            | ColumnType::Set => SqlKind::Text,
            ColumnType::Json => SqlKind::Json,
            ColumnType::Blob
            | ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob => SqlKind::Binary,
            ColumnType::Geometry => SqlKind::Spatial,
            _ => SqlKind::Other,
        }
    }
}

/// A column as declared by the table at the time the event was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub kind: SqlKind,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, kind: SqlKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Coerce one decoded value under its declared kind.
pub fn coerce(raw: &BinlogValue, kind: SqlKind) -> Value {
    if matches!(raw, BinlogValue::Null) {
        return Value::Null;
    }

    match kind {
        SqlKind::Integer => match raw {
            BinlogValue::Bytes(b) => parse_i64(b),
            BinlogValue::String(s) => parse_i64(s.as_bytes()),
            other => passthrough(other),
        },
        SqlKind::Float | SqlKind::Decimal => match raw {
            BinlogValue::Decimal(s) => parse_f64(s.as_bytes()),
            BinlogValue::Bytes(b) => parse_f64(b),
            BinlogValue::String(s) => parse_f64(s.as_bytes()),
            other => passthrough(other),
        },
        SqlKind::Bit => match raw {
            BinlogValue::Bit(b) | BinlogValue::Bytes(b) => {
                Value::Bool(b.first().is_some_and(|byte| *byte != 0))
            }
            other => passthrough(other),
        },
        SqlKind::Temporal => match raw {
            BinlogValue::Timestamp {
                seconds,
                microseconds,
            } => match Utc.timestamp_opt(*seconds as i64, microseconds * 1_000).single() {
                Some(ts) => Value::Timestamp(ts),
                None => Value::String(format!("{}.{:06}", seconds, microseconds)),
            },
            other => {
                let rendered = render_temporal(other);
                parse_datetime(&rendered)
            }
        },
        SqlKind::Text | SqlKind::Json | SqlKind::Binary | SqlKind::Spatial => match raw {
            BinlogValue::Bytes(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
            BinlogValue::String(s) => Value::String(s.clone()),
            other => passthrough(other),
        },
        SqlKind::Other => passthrough(raw),
    }
}

/// Coerce a full row image against the declared column set.
///
/// Every declared column appears in the output, in declaration order; surplus
/// values beyond the declared columns are dropped.
pub fn coerce_row(image: &[BinlogValue], columns: &[ColumnDescriptor]) -> crate::event::RowImage {
    let mut row = crate::event::RowImage::with_capacity(columns.len());
    for (idx, column) in columns.iter().enumerate() {
        let value = match image.get(idx) {
            Some(raw) => coerce(raw, column.kind),
            None => Value::Null,
        };
        row.insert(column.name.clone(), value);
    }
    row
}

fn parse_i64(bytes: &[u8]) -> Value {
    match std::str::from_utf8(bytes).ok().and_then(|s| s.parse::<i64>().ok()) {
        Some(v) => Value::Integer(v),
        None => Value::Bytes(bytes.to_vec()),
    }
}

fn parse_f64(bytes: &[u8]) -> Value {
    match std::str::from_utf8(bytes).ok().and_then(|s| s.parse::<f64>().ok()) {
        Some(v) => Value::Float(v),
        None => Value::Bytes(bytes.to_vec()),
    }
}

fn parse_datetime(rendered: &str) -> Value {
    match NaiveDateTime::parse_from_str(rendered, "%Y-%m-%d %H:%M:%S") {
        Ok(naive) => Value::Timestamp(naive.and_utc()),
        Err(_) => Value::String(rendered.to_string()),
    }
}

fn render_temporal(raw: &BinlogValue) -> String {
    match raw {
        BinlogValue::Date { year, month, day } => {
            format!("{:04}-{:02}-{:02}", year, month, day)
        }
        BinlogValue::Time {
            negative,
            hours,
            minutes,
            seconds,
            microseconds,
        } => {
            let sign = if *negative { "-" } else { "" };
            if *microseconds > 0 {
                format!(
                    "{}{:02}:{:02}:{:02}.{:06}",
                    sign, hours, minutes, seconds, microseconds
                )
            } else {
                format!("{}{:02}:{:02}:{:02}", sign, hours, minutes, seconds)
            }
        }
        BinlogValue::DateTime {
            year,
            month,
            day,
            hour,
            minute,
            second,
            microsecond,
        } => {
            if *microsecond > 0 {
                format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
                    year, month, day, hour, minute, second, microsecond
                )
            } else {
                format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    year, month, day, hour, minute, second
                )
            }
        }
        BinlogValue::String(s) => s.clone(),
        BinlogValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        other => format!("{:?}", other),
    }
}

fn passthrough(raw: &BinlogValue) -> Value {
    match raw {
        BinlogValue::Null => Value::Null,
        BinlogValue::SignedInt(v) => Value::Integer(*v),
        BinlogValue::UnsignedInt(v) => Value::Integer(*v as i64),
        BinlogValue::Float(v) => Value::Float(*v as f64),
        BinlogValue::Double(v) => Value::Float(*v),
        BinlogValue::Decimal(s) => Value::String(s.clone()),
        BinlogValue::String(s) => Value::String(s.clone()),
        BinlogValue::Bytes(b) => Value::Bytes(b.clone()),
        BinlogValue::Year(y) => Value::Integer(*y as i64),
        BinlogValue::Enum(v) => Value::Integer(*v as i64),
        BinlogValue::Set(v) => Value::Integer(*v as i64),
        BinlogValue::Bit(b) => Value::Bytes(b.clone()),
        BinlogValue::Timestamp {
            seconds,
            microseconds,
        } => match Utc.timestamp_opt(*seconds as i64, microseconds * 1_000).single() {
            Some(ts) => Value::Timestamp(ts),
            None => Value::Null,
        },
        temporal @ (BinlogValue::Date { .. }
        | BinlogValue::Time { .. }
        | BinlogValue::DateTime { .. }) => Value::String(render_temporal(temporal)),
    }
}
