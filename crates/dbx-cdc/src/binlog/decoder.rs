//! Binlog event decoding
//!
//! Turns the raw event payloads delivered by [`super::protocol::EventStream`]
//! into typed events. Row events depend on the most recent TABLE_MAP for
//! their table id, so the decoder keeps a table-map cache.
//!
//! When the server writes CRC32 checksums every event carries a four-byte
//! trailer; the decoder strips it before parsing. Whether checksums are
//! enabled is queried up front (`@@global.binlog_checksum`) rather than
//! inferred from the FORMAT_DESCRIPTION event.

use anyhow::{bail, Result};
use bytes::{Buf, Bytes};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use tracing::{debug, trace};

/// Binlog event type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    Unknown = 0,
    QueryEvent = 2,
    StopEvent = 3,
    RotateEvent = 4,
    FormatDescriptionEvent = 15,
    XidEvent = 16,
    TableMapEvent = 19,
    WriteRowsEventV1 = 23,
    UpdateRowsEventV1 = 24,
    DeleteRowsEventV1 = 25,
    HeartbeatLogEvent = 27,
    WriteRowsEventV2 = 30,
    UpdateRowsEventV2 = 31,
    DeleteRowsEventV2 = 32,
    GtidLogEvent = 33,
    AnonymousGtidLogEvent = 34,
    PreviousGtidsLogEvent = 35,
}

impl EventType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatLogEvent,
            30 => EventType::WriteRowsEventV2,
            31 => EventType::UpdateRowsEventV2,
            32 => EventType::DeleteRowsEventV2,
            33 => EventType::GtidLogEvent,
            34 => EventType::AnonymousGtidLogEvent,
            35 => EventType::PreviousGtidsLogEvent,
            _ => EventType::Unknown,
        }
    }

    pub fn is_row_event(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEventV1
                | EventType::WriteRowsEventV2
                | EventType::UpdateRowsEventV1
                | EventType::UpdateRowsEventV2
                | EventType::DeleteRowsEventV1
                | EventType::DeleteRowsEventV2
        )
    }
}

/// Wire-level column type codes from TABLE_MAP events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::Null,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            15 => ColumnType::Varchar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            245 => ColumnType::Json,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            253 => ColumnType::VarString,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            _ => ColumnType::VarString,
        }
    }
}

/// Common 19-byte event header.
#[derive(Debug, Clone)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: EventType,
    pub server_id: u32,
    pub event_length: u32,
    pub next_position: u32,
    pub flags: u16,
}

impl EventHeader {
    pub const SIZE: usize = 19;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("event header too short: {} bytes", data.len());
        }

        let mut cursor = Cursor::new(data);
        Ok(Self {
            timestamp: cursor.get_u32_le(),
            event_type: EventType::from_u8(cursor.get_u8()),
            server_id: cursor.get_u32_le(),
            event_length: cursor.get_u32_le(),
            next_position: cursor.get_u32_le(),
            flags: cursor.get_u16_le(),
        })
    }
}

/// A decoded binlog event together with its header.
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub header: EventHeader,
    pub body: EventBody,
}

/// Decoded event payloads.
#[derive(Debug, Clone)]
pub enum EventBody {
    FormatDescription(FormatDescriptionEvent),
    TableMap(TableMapEvent),
    WriteRows(RowsEventData),
    UpdateRows(RowsEventData),
    DeleteRows(RowsEventData),
    Xid(u64),
    Query(QueryEvent),
    Rotate(RotateEvent),
    Gtid,
    Heartbeat,
    Unknown(EventType),
}

#[derive(Debug, Clone)]
pub struct FormatDescriptionEvent {
    pub binlog_version: u16,
    pub server_version: String,
}

#[derive(Debug, Clone)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub schema_name: String,
    pub table_name: String,
    pub column_count: usize,
    pub column_types: Vec<ColumnType>,
    pub column_metadata: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct RowsEventData {
    pub table_id: u64,
    pub column_count: usize,
    pub rows: Vec<RowData>,
}

/// Before/after images of a single row within a rows event.
#[derive(Debug, Clone)]
pub struct RowData {
    pub before: Option<Vec<BinlogValue>>,
    pub after: Option<Vec<BinlogValue>>,
}

#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub schema: String,
    pub query: String,
}

#[derive(Debug, Clone)]
pub struct RotateEvent {
    pub position: u64,
    pub next_binlog: String,
}

/// A column value as decoded off the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum BinlogValue {
    Null,
    SignedInt(i64),
    UnsignedInt(u64),
    Float(f32),
    Double(f64),
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    Date {
        year: u16,
        month: u8,
        day: u8,
    },
    Time {
        negative: bool,
        hours: u8,
        minutes: u8,
        seconds: u8,
        microseconds: u32,
    },
    DateTime {
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        microsecond: u32,
    },
    Timestamp {
        seconds: u32,
        microseconds: u32,
    },
    Year(u16),
    Enum(u16),
    Set(u64),
    Bit(Vec<u8>),
}

/// Stateful decoder with a table-map cache.
pub struct BinlogDecoder {
    table_cache: HashMap<u64, TableMapEvent>,
    checksum: bool,
}

impl BinlogDecoder {
    pub fn new(checksum: bool) -> Self {
        Self {
            table_cache: HashMap::new(),
            checksum,
        }
    }

    /// Table map for a previously seen table id.
    pub fn table(&self, table_id: u64) -> Option<&TableMapEvent> {
        self.table_cache.get(&table_id)
    }

    /// Decode one raw event payload.
    pub fn decode(&mut self, data: &Bytes) -> Result<DecodedEvent> {
        if data.len() < EventHeader::SIZE {
            bail!("event too short: {} bytes", data.len());
        }

        let header = EventHeader::parse(data)?;
        let mut payload = &data[EventHeader::SIZE..];
        if self.checksum && payload.len() >= 4 {
            payload = &payload[..payload.len() - 4];
        }

        trace!(event_type = ?header.event_type, len = payload.len(), "decoding event");

        let body = match header.event_type {
            EventType::FormatDescriptionEvent => {
                EventBody::FormatDescription(decode_format_description(payload)?)
            }
            EventType::TableMapEvent => {
                let map = decode_table_map(payload)?;
                debug!(
                    table_id = map.table_id,
                    schema = %map.schema_name,
                    table = %map.table_name,
                    "table map"
                );
                self.table_cache.insert(map.table_id, map.clone());
                EventBody::TableMap(map)
            }
            EventType::WriteRowsEventV1 | EventType::WriteRowsEventV2 => {
                EventBody::WriteRows(self.decode_rows(payload, header.event_type)?)
            }
            EventType::UpdateRowsEventV1 | EventType::UpdateRowsEventV2 => {
                EventBody::UpdateRows(self.decode_rows(payload, header.event_type)?)
            }
            EventType::DeleteRowsEventV1 | EventType::DeleteRowsEventV2 => {
                EventBody::DeleteRows(self.decode_rows(payload, header.event_type)?)
            }
            EventType::XidEvent => {
                let mut cursor = Cursor::new(payload);
                EventBody::Xid(read_u64_le(&mut cursor)?)
            }
            EventType::QueryEvent => EventBody::Query(decode_query(payload)?),
            EventType::RotateEvent => EventBody::Rotate(decode_rotate(payload)?),
            EventType::GtidLogEvent | EventType::AnonymousGtidLogEvent => EventBody::Gtid,
            EventType::HeartbeatLogEvent => EventBody::Heartbeat,
            other => EventBody::Unknown(other),
        };

        Ok(DecodedEvent { header, body })
    }

    fn decode_rows(&self, data: &[u8], event_type: EventType) -> Result<RowsEventData> {
        let is_update = matches!(
            event_type,
            EventType::UpdateRowsEventV1 | EventType::UpdateRowsEventV2
        );
        let is_delete = matches!(
            event_type,
            EventType::DeleteRowsEventV1 | EventType::DeleteRowsEventV2
        );

        let mut cursor = Cursor::new(data);
        let table_id = read_table_id(&mut cursor)?;
        let _flags = read_u16_le(&mut cursor)?;

        // v2 events carry a variable extra-data block
        if matches!(
            event_type,
            EventType::WriteRowsEventV2
                | EventType::UpdateRowsEventV2
                | EventType::DeleteRowsEventV2
        ) {
            let extra_len = read_u16_le(&mut cursor)?;
            if extra_len > 2 {
                skip(&mut cursor, (extra_len - 2) as usize)?;
            }
        }

        let column_count = read_packed_int(&mut cursor)? as usize;

        let bitmap_len = column_count.div_ceil(8);
        let present_before = read_bytes(&mut cursor, bitmap_len)?;

        let present_after = if is_update {
            Some(read_bytes(&mut cursor, bitmap_len)?)
        } else {
            None
        };

        let table_map = self.table_cache.get(&table_id);
        let mut rows = Vec::new();

        while cursor.has_remaining() {
            let present_count = count_set_bits(&present_before);
            let null_bitmap_len = present_count.div_ceil(8);
            if cursor.remaining() < null_bitmap_len {
                break;
            }

            if is_update || is_delete {
                let before = decode_image(&mut cursor, table_map, column_count, &present_before)?;

                if is_update {
                    let after_bitmap = present_after.as_deref().unwrap_or(&present_before);
                    let after_null_len = count_set_bits(after_bitmap).div_ceil(8);
                    if cursor.remaining() < after_null_len {
                        rows.push(RowData {
                            before: Some(before),
                            after: None,
                        });
                        break;
                    }
                    let after = decode_image(&mut cursor, table_map, column_count, after_bitmap)?;
                    rows.push(RowData {
                        before: Some(before),
                        after: Some(after),
                    });
                } else {
                    rows.push(RowData {
                        before: Some(before),
                        after: None,
                    });
                }
            } else {
                let after = decode_image(&mut cursor, table_map, column_count, &present_before)?;
                rows.push(RowData {
                    before: None,
                    after: Some(after),
                });
            }
        }

        Ok(RowsEventData {
            table_id,
            column_count,
            rows,
        })
    }
}

fn decode_format_description(data: &[u8]) -> Result<FormatDescriptionEvent> {
    let mut cursor = Cursor::new(data);

    let binlog_version = read_u16_le(&mut cursor)?;
    let version_bytes = read_bytes(&mut cursor, 50)?;
    let server_version = String::from_utf8_lossy(&version_bytes)
        .trim_end_matches('\0')
        .to_string();

    Ok(FormatDescriptionEvent {
        binlog_version,
        server_version,
    })
}

fn decode_table_map(data: &[u8]) -> Result<TableMapEvent> {
    let mut cursor = Cursor::new(data);

    let table_id = read_table_id(&mut cursor)?;
    let _flags = read_u16_le(&mut cursor)?;

    let schema_len = read_u8(&mut cursor)? as usize;
    let schema_bytes = read_bytes(&mut cursor, schema_len)?;
    let schema_name = String::from_utf8_lossy(&schema_bytes).into_owned();
    skip(&mut cursor, 1)?; // null terminator

    let table_len = read_u8(&mut cursor)? as usize;
    let table_bytes = read_bytes(&mut cursor, table_len)?;
    let table_name = String::from_utf8_lossy(&table_bytes).into_owned();
    skip(&mut cursor, 1)?; // null terminator

    let column_count = read_packed_int(&mut cursor)? as usize;
    need(&cursor, column_count)?;
    let mut column_types = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        column_types.push(ColumnType::from_u8(read_u8(&mut cursor)?));
    }

    let _metadata_len = read_packed_int(&mut cursor)?;
    let column_metadata = decode_column_metadata(&column_types, &mut cursor)?;

    Ok(TableMapEvent {
        table_id,
        schema_name,
        table_name,
        column_count,
        column_types,
        column_metadata,
    })
}

fn decode_column_metadata(
    column_types: &[ColumnType],
    cursor: &mut Cursor<&[u8]>,
) -> Result<Vec<u16>> {
    let mut metadata = Vec::with_capacity(column_types.len());

    for col_type in column_types {
        let meta = match col_type {
            ColumnType::Float
            | ColumnType::Double
            | ColumnType::Blob
            | ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob
            | ColumnType::Json
            | ColumnType::Geometry => read_u8(cursor)? as u16,
            ColumnType::Bit | ColumnType::Varchar | ColumnType::VarString => read_u16_le(cursor)?,
            ColumnType::NewDecimal => {
                let precision = read_u8(cursor)?;
                let scale = read_u8(cursor)?;
                ((precision as u16) << 8) | (scale as u16)
            }
            // String-class types store the real type in the high byte
            ColumnType::String | ColumnType::Enum | ColumnType::Set => read_u16_le(cursor)?,
            ColumnType::Time2 | ColumnType::DateTime2 | ColumnType::Timestamp2 => {
                read_u8(cursor)? as u16
            }
            _ => 0,
        };
        metadata.push(meta);
    }

    Ok(metadata)
}

fn decode_image(
    cursor: &mut Cursor<&[u8]>,
    table_map: Option<&TableMapEvent>,
    column_count: usize,
    present_bitmap: &[u8],
) -> Result<Vec<BinlogValue>> {
    let present_count = count_set_bits(present_bitmap);
    let null_bitmap_len = present_count.div_ceil(8);
    let null_bitmap = read_bytes(cursor, null_bitmap_len)?;

    let mut values = Vec::with_capacity(column_count);
    let mut null_idx = 0;

    for col_idx in 0..column_count {
        if !is_bit_set(present_bitmap, col_idx) {
            continue;
        }

        if is_bit_set(&null_bitmap, null_idx) {
            values.push(BinlogValue::Null);
            null_idx += 1;
            continue;
        }
        null_idx += 1;

        let col_type = table_map
            .and_then(|tm| tm.column_types.get(col_idx))
            .copied()
            .unwrap_or(ColumnType::VarString);
        let metadata = table_map
            .and_then(|tm| tm.column_metadata.get(col_idx))
            .copied()
            .unwrap_or(0);

        values.push(decode_value(cursor, col_type, metadata)?);
    }

    Ok(values)
}

fn decode_value(
    cursor: &mut Cursor<&[u8]>,
    col_type: ColumnType,
    metadata: u16,
) -> Result<BinlogValue> {
    match col_type {
        ColumnType::Tiny => Ok(BinlogValue::SignedInt(read_u8(cursor)? as i8 as i64)),
        ColumnType::Short => Ok(BinlogValue::SignedInt(read_u16_le(cursor)? as i16 as i64)),
        ColumnType::Int24 => {
            need(cursor, 3)?;
            let b1 = cursor.get_u8() as u32;
            let b2 = cursor.get_u8() as u32;
            let b3 = cursor.get_u8() as u32;
            let raw = b1 | (b2 << 8) | (b3 << 16);
            let signed = if raw & 0x80_0000 != 0 {
                (raw | 0xFF00_0000) as i32
            } else {
                raw as i32
            };
            Ok(BinlogValue::SignedInt(signed as i64))
        }
        ColumnType::Long => Ok(BinlogValue::SignedInt(read_u32_le(cursor)? as i32 as i64)),
        ColumnType::LongLong => Ok(BinlogValue::SignedInt(read_u64_le(cursor)? as i64)),
        ColumnType::Float => Ok(BinlogValue::Float(read_f32_le(cursor)?)),
        ColumnType::Double => Ok(BinlogValue::Double(read_f64_le(cursor)?)),
        ColumnType::Year => Ok(BinlogValue::Year(read_u8(cursor)? as u16 + 1900)),
        ColumnType::Date => {
            need(cursor, 3)?;
            let packed = cursor.get_u8() as u32
                | ((cursor.get_u8() as u32) << 8)
                | ((cursor.get_u8() as u32) << 16);
            Ok(BinlogValue::Date {
                year: ((packed >> 9) & 0x7FFF) as u16,
                month: ((packed >> 5) & 0x0F) as u8,
                day: (packed & 0x1F) as u8,
            })
        }
        ColumnType::Time => {
            need(cursor, 3)?;
            let packed = cursor.get_u8() as u32
                | ((cursor.get_u8() as u32) << 8)
                | ((cursor.get_u8() as u32) << 16);
            Ok(BinlogValue::Time {
                negative: false,
                hours: (packed / 10_000) as u8,
                minutes: ((packed / 100) % 100) as u8,
                seconds: (packed % 100) as u8,
                microseconds: 0,
            })
        }
        ColumnType::DateTime => {
            let packed = read_u64_le(cursor)?;
            Ok(BinlogValue::DateTime {
                year: (packed / 10_000_000_000) as u16,
                month: ((packed / 100_000_000) % 100) as u8,
                day: ((packed / 1_000_000) % 100) as u8,
                hour: ((packed / 10_000) % 100) as u8,
                minute: ((packed / 100) % 100) as u8,
                second: (packed % 100) as u8,
                microsecond: 0,
            })
        }
        ColumnType::Timestamp => Ok(BinlogValue::Timestamp {
            seconds: read_u32_le(cursor)?,
            microseconds: 0,
        }),
        ColumnType::Timestamp2 => {
            let seconds = read_be_uint(cursor, 4)? as u32;
            let microseconds = read_fractional_seconds(cursor, metadata as u8)?;
            Ok(BinlogValue::Timestamp {
                seconds,
                microseconds,
            })
        }
        ColumnType::DateTime2 => {
            let packed = read_be_uint(cursor, 5)?;
            let microsecond = read_fractional_seconds(cursor, metadata as u8)?;

            let year_month = (packed >> 22) & 0x1_FFFF;
            Ok(BinlogValue::DateTime {
                year: (year_month / 13) as u16,
                month: (year_month % 13) as u8,
                day: ((packed >> 17) & 0x1F) as u8,
                hour: ((packed >> 12) & 0x1F) as u8,
                minute: ((packed >> 6) & 0x3F) as u8,
                second: (packed & 0x3F) as u8,
                microsecond,
            })
        }
        ColumnType::Time2 => {
            let packed = read_be_uint(cursor, 3)? as u32;
            let microseconds = read_fractional_seconds(cursor, metadata as u8)?;

            let negative = packed & 0x80_0000 == 0;
            let value = if negative {
                0x80_0000 - (packed & 0x7F_FFFF)
            } else {
                packed & 0x7F_FFFF
            };

            Ok(BinlogValue::Time {
                negative,
                hours: ((value >> 12) & 0x3FF) as u8,
                minutes: ((value >> 6) & 0x3F) as u8,
                seconds: (value & 0x3F) as u8,
                microseconds,
            })
        }
        ColumnType::Varchar | ColumnType::VarString => {
            let len = if metadata < 256 {
                read_u8(cursor)? as usize
            } else {
                read_u16_le(cursor)? as usize
            };
            let bytes = read_bytes(cursor, len)?;
            Ok(BinlogValue::String(String::from_utf8_lossy(&bytes).into_owned()))
        }
        ColumnType::String => {
            let real_type = (metadata >> 8) as u8;
            let max_len = metadata & 0xFF;

            if real_type == ColumnType::Enum as u8 {
                let value = if max_len == 1 {
                    read_u8(cursor)? as u16
                } else {
                    read_u16_le(cursor)?
                };
                Ok(BinlogValue::Enum(value))
            } else if real_type == ColumnType::Set as u8 {
                let byte_count = max_len.div_ceil(8) as usize;
                let value = read_le_uint(cursor, byte_count)?;
                Ok(BinlogValue::Set(value))
            } else {
                let len = if max_len < 256 {
                    read_u8(cursor)? as usize
                } else {
                    read_u16_le(cursor)? as usize
                };
                let bytes = read_bytes(cursor, len)?;
                Ok(BinlogValue::String(String::from_utf8_lossy(&bytes).into_owned()))
            }
        }
        ColumnType::Blob
        | ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Json => {
            let len = match metadata {
                1 => read_u8(cursor)? as usize,
                2 => read_u16_le(cursor)? as usize,
                3 => read_le_uint(cursor, 3)? as usize,
                4 => read_u32_le(cursor)? as usize,
                _ => read_u8(cursor)? as usize,
            };
            let bytes = read_bytes(cursor, len)?;
            // TODO: decode the MySQL binary JSON format instead of passing
            // the raw representation through.
            Ok(BinlogValue::Bytes(bytes))
        }
        ColumnType::NewDecimal => {
            let precision = (metadata >> 8) as usize;
            let scale = (metadata & 0xFF) as usize;
            Ok(BinlogValue::Decimal(decode_decimal(cursor, precision, scale)?))
        }
        ColumnType::Bit => {
            let nbits = ((metadata >> 8) * 8 + (metadata & 0xFF)) as usize;
            let bytes = read_bytes(cursor, nbits.div_ceil(8))?;
            Ok(BinlogValue::Bit(bytes))
        }
        ColumnType::Enum => {
            let value = if metadata == 1 {
                read_u8(cursor)? as u16
            } else {
                read_u16_le(cursor)?
            };
            Ok(BinlogValue::Enum(value))
        }
        ColumnType::Set => {
            let value = read_le_uint(cursor, metadata as usize)?;
            Ok(BinlogValue::Set(value))
        }
        _ => {
            let len = read_u8(cursor)? as usize;
            let bytes = read_bytes(cursor, len)?;
            Ok(BinlogValue::Bytes(bytes))
        }
    }
}

fn decode_query(data: &[u8]) -> Result<QueryEvent> {
    let mut cursor = Cursor::new(data);

    let _thread_id = read_u32_le(&mut cursor)?;
    let _exec_time = read_u32_le(&mut cursor)?;
    let schema_len = read_u8(&mut cursor)? as usize;
    let _error_code = read_u16_le(&mut cursor)?;

    let status_vars_len = read_u16_le(&mut cursor)? as usize;
    skip(&mut cursor, status_vars_len)?;

    let schema_bytes = read_bytes(&mut cursor, schema_len)?;
    let schema = String::from_utf8_lossy(&schema_bytes).into_owned();
    skip(&mut cursor, 1)?; // null terminator

    let query_len = cursor.remaining();
    let query_bytes = read_bytes(&mut cursor, query_len)?;
    let query = String::from_utf8_lossy(&query_bytes).into_owned();

    Ok(QueryEvent { schema, query })
}

fn decode_rotate(data: &[u8]) -> Result<RotateEvent> {
    let mut cursor = Cursor::new(data);

    let position = read_u64_le(&mut cursor)?;
    let name_len = cursor.remaining();
    let name_bytes = read_bytes(&mut cursor, name_len)?;
    let next_binlog = String::from_utf8_lossy(&name_bytes)
        .trim_end_matches('\0')
        .to_string();

    Ok(RotateEvent {
        position,
        next_binlog,
    })
}

/// Every multi-byte read goes through these guards; the raw `bytes::Buf`
/// getters panic on a short buffer, and a truncated event must surface as a
/// stream error instead.
fn need(cursor: &Cursor<&[u8]>, bytes: usize) -> Result<()> {
    if cursor.remaining() < bytes {
        bail!(
            "truncated event: need {} bytes, {} remain",
            bytes,
            cursor.remaining()
        );
    }
    Ok(())
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    need(cursor, 1)?;
    Ok(cursor.get_u8())
}

fn read_u16_le(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    need(cursor, 2)?;
    Ok(cursor.get_u16_le())
}

fn read_u32_le(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    need(cursor, 4)?;
    Ok(cursor.get_u32_le())
}

fn read_u64_le(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    need(cursor, 8)?;
    Ok(cursor.get_u64_le())
}

fn read_f32_le(cursor: &mut Cursor<&[u8]>) -> Result<f32> {
    need(cursor, 4)?;
    Ok(cursor.get_f32_le())
}

fn read_f64_le(cursor: &mut Cursor<&[u8]>) -> Result<f64> {
    need(cursor, 8)?;
    Ok(cursor.get_f64_le())
}

fn skip(cursor: &mut Cursor<&[u8]>, bytes: usize) -> Result<()> {
    need(cursor, bytes)?;
    cursor.advance(bytes);
    Ok(())
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    need(cursor, len)?;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_table_id(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    need(cursor, 6)?;
    let mut id = 0u64;
    for i in 0..6 {
        id |= (cursor.get_u8() as u64) << (i * 8);
    }
    Ok(id)
}

fn read_packed_int(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let first = read_u8(cursor)?;
    match first {
        0..=250 => Ok(first as u64),
        252 => Ok(read_u16_le(cursor)? as u64),
        253 => read_le_uint(cursor, 3),
        254 => read_u64_le(cursor),
        other => bail!("invalid packed integer prefix: {}", other),
    }
}

fn read_be_uint(cursor: &mut Cursor<&[u8]>, bytes: usize) -> Result<u64> {
    need(cursor, bytes)?;
    let mut value = 0u64;
    for _ in 0..bytes {
        value = (value << 8) | cursor.get_u8() as u64;
    }
    Ok(value)
}

fn read_le_uint(cursor: &mut Cursor<&[u8]>, bytes: usize) -> Result<u64> {
    if bytes > 8 {
        bail!("little-endian integer too wide: {} bytes", bytes);
    }
    need(cursor, bytes)?;
    let mut value = 0u64;
    for i in 0..bytes {
        value |= (cursor.get_u8() as u64) << (i * 8);
    }
    Ok(value)
}

/// Fractional-second tail of the *2 temporal types, in microseconds.
fn read_fractional_seconds(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<u32> {
    let fsp = fsp.min(6);
    let bytes = (fsp as usize).div_ceil(2);
    let value = read_be_uint(cursor, bytes)? as u32;
    Ok(value * 10u32.pow(6 - fsp as u32))
}

fn count_set_bits(bitmap: &[u8]) -> usize {
    bitmap.iter().map(|b| b.count_ones() as usize).sum()
}

fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    let byte = idx / 8;
    byte < bitmap.len() && bitmap[byte] & (1 << (idx % 8)) != 0
}

/// MySQL packed decimal, rendered as a decimal string.
fn decode_decimal(cursor: &mut Cursor<&[u8]>, precision: usize, scale: usize) -> Result<String> {
    const DIGITS_PER_WORD: usize = 9;

    fn leftover_bytes(digits: usize) -> usize {
        match digits {
            0 => 0,
            1..=2 => 1,
            3..=4 => 2,
            5..=6 => 3,
            _ => 4,
        }
    }

    let int_digits = precision.saturating_sub(scale);
    let int_words = int_digits / DIGITS_PER_WORD;
    let int_leftover = int_digits % DIGITS_PER_WORD;
    let frac_words = scale / DIGITS_PER_WORD;
    let frac_leftover = scale % DIGITS_PER_WORD;

    let total = leftover_bytes(int_leftover)
        + int_words * 4
        + frac_words * 4
        + leftover_bytes(frac_leftover);

    let mut bytes = read_bytes(cursor, total)?;
    if bytes.is_empty() {
        return Ok("0".to_string());
    }

    // Sign bit is stored inverted; negative values are complemented.
    let negative = bytes[0] & 0x80 == 0;
    bytes[0] ^= 0x80;
    if negative {
        for b in bytes.iter_mut() {
            *b = !*b;
        }
    }

    let mut inner = Cursor::new(bytes.as_slice());
    let mut int_part = String::new();

    if leftover_bytes(int_leftover) > 0 {
        let value = read_be_uint(&mut inner, leftover_bytes(int_leftover))? as u32;
        if value > 0 {
            int_part.push_str(&value.to_string());
        }
    }
    for _ in 0..int_words {
        let value = read_be_uint(&mut inner, 4)? as u32;
        if int_part.is_empty() {
            if value > 0 {
                int_part.push_str(&value.to_string());
            }
        } else {
            int_part.push_str(&format!("{:09}", value));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }

    let mut result = String::new();
    if negative {
        result.push('-');
    }
    result.push_str(&int_part);

    if scale > 0 {
        result.push('.');
        for _ in 0..frac_words {
            let value = read_be_uint(&mut inner, 4)? as u32;
            result.push_str(&format!("{:09}", value));
        }
        if leftover_bytes(frac_leftover) > 0 {
            let value = read_be_uint(&mut inner, leftover_bytes(frac_leftover))? as u32;
            result.push_str(&format!("{:0width$}", value, width = frac_leftover));
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(event_type: u8, next_position: u32) -> Vec<u8> {
        let mut data = vec![0u8; EventHeader::SIZE];
        data[0..4].copy_from_slice(&1_700_000_000u32.to_le_bytes());
        data[4] = event_type;
        data[5..9].copy_from_slice(&101u32.to_le_bytes());
        data[9..13].copy_from_slice(&0u32.to_le_bytes());
        data[13..17].copy_from_slice(&next_position.to_le_bytes());
        data[17..19].copy_from_slice(&0u16.to_le_bytes());
        data
    }

    #[test]
    fn test_event_type_codes() {
        assert_eq!(EventType::from_u8(15), EventType::FormatDescriptionEvent);
        assert_eq!(EventType::from_u8(19), EventType::TableMapEvent);
        assert_eq!(EventType::from_u8(30), EventType::WriteRowsEventV2);
        assert_eq!(EventType::from_u8(31), EventType::UpdateRowsEventV2);
        assert_eq!(EventType::from_u8(32), EventType::DeleteRowsEventV2);
        assert_eq!(EventType::from_u8(16), EventType::XidEvent);
        assert_eq!(EventType::from_u8(4), EventType::RotateEvent);
        assert_eq!(EventType::from_u8(200), EventType::Unknown);
    }

    #[test]
    fn test_is_row_event() {
        assert!(EventType::WriteRowsEventV2.is_row_event());
        assert!(EventType::UpdateRowsEventV1.is_row_event());
        assert!(EventType::DeleteRowsEventV2.is_row_event());
        assert!(!EventType::QueryEvent.is_row_event());
        assert!(!EventType::TableMapEvent.is_row_event());
    }

    #[test]
    fn test_header_parse() {
        let data = header_bytes(16, 4096);
        let header = EventHeader::parse(&data).unwrap();
        assert_eq!(header.timestamp, 1_700_000_000);
        assert_eq!(header.event_type, EventType::XidEvent);
        assert_eq!(header.server_id, 101);
        assert_eq!(header.next_position, 4096);
    }

    #[test]
    fn test_header_too_short() {
        assert!(EventHeader::parse(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_decode_xid() {
        let mut data = header_bytes(16, 2048);
        data.extend_from_slice(&77u64.to_le_bytes());

        let mut decoder = BinlogDecoder::new(false);
        let event = decoder.decode(&Bytes::from(data)).unwrap();
        match event.body {
            EventBody::Xid(xid) => assert_eq!(xid, 77),
            other => panic!("expected xid, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_xid_with_checksum_trailer() {
        let mut data = header_bytes(16, 2048);
        data.extend_from_slice(&77u64.to_le_bytes());
        data.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]); // CRC32

        let mut decoder = BinlogDecoder::new(true);
        let event = decoder.decode(&Bytes::from(data)).unwrap();
        match event.body {
            EventBody::Xid(xid) => assert_eq!(xid, 77),
            other => panic!("expected xid, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rotate() {
        let mut data = header_bytes(4, 0);
        data.extend_from_slice(&4u64.to_le_bytes());
        data.extend_from_slice(b"binlog.000042");

        let mut decoder = BinlogDecoder::new(false);
        let event = decoder.decode(&Bytes::from(data)).unwrap();
        match event.body {
            EventBody::Rotate(rotate) => {
                assert_eq!(rotate.position, 4);
                assert_eq!(rotate.next_binlog, "binlog.000042");
            }
            other => panic!("expected rotate, got {:?}", other),
        }
    }

    fn users_table_map() -> Vec<u8> {
        // table id 7, schema "app", table "users", columns: Long, Varchar(255)
        let mut payload = Vec::new();
        payload.extend_from_slice(&[7, 0, 0, 0, 0, 0]); // table id
        payload.extend_from_slice(&0u16.to_le_bytes()); // flags
        payload.push(3);
        payload.extend_from_slice(b"app");
        payload.push(0);
        payload.push(5);
        payload.extend_from_slice(b"users");
        payload.push(0);
        payload.push(2); // column count
        payload.push(3); // Long
        payload.push(15); // Varchar
        payload.push(2); // metadata length
        payload.extend_from_slice(&255u16.to_le_bytes()); // varchar max len
        payload.extend_from_slice(&[0x02]); // null bitmap (name nullable)
        payload
    }

    fn decode_table_map_event(decoder: &mut BinlogDecoder) {
        let mut data = header_bytes(19, 500);
        data.extend_from_slice(&users_table_map());
        let event = decoder.decode(&Bytes::from(data)).unwrap();
        assert!(matches!(event.body, EventBody::TableMap(_)));
    }

    #[test]
    fn test_decode_table_map() {
        let mut decoder = BinlogDecoder::new(false);
        decode_table_map_event(&mut decoder);

        let map = decoder.table(7).unwrap();
        assert_eq!(map.schema_name, "app");
        assert_eq!(map.table_name, "users");
        assert_eq!(map.column_count, 2);
        assert_eq!(map.column_types, vec![ColumnType::Long, ColumnType::Varchar]);
        assert_eq!(map.column_metadata, vec![0, 255]);
    }

    fn write_rows_payload(rows: &[(i32, &str)]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[7, 0, 0, 0, 0, 0]); // table id
        payload.extend_from_slice(&0u16.to_le_bytes()); // flags
        payload.extend_from_slice(&2u16.to_le_bytes()); // v2 extra data length
        payload.push(2); // column count
        payload.push(0b0000_0011); // present bitmap
        for (id, name) in rows {
            payload.push(0); // null bitmap
            payload.extend_from_slice(&id.to_le_bytes());
            payload.push(name.len() as u8);
            payload.extend_from_slice(name.as_bytes());
        }
        payload
    }

    #[test]
    fn test_decode_write_rows() {
        let mut decoder = BinlogDecoder::new(false);
        decode_table_map_event(&mut decoder);

        let mut data = header_bytes(30, 600);
        data.extend_from_slice(&write_rows_payload(&[(1, "Alice"), (2, "Bob")]));

        let event = decoder.decode(&Bytes::from(data)).unwrap();
        let rows = match event.body {
            EventBody::WriteRows(rows) => rows,
            other => panic!("expected write rows, got {:?}", other),
        };

        assert_eq!(rows.table_id, 7);
        assert_eq!(rows.rows.len(), 2);
        let first = rows.rows[0].after.as_ref().unwrap();
        assert_eq!(first[0], BinlogValue::SignedInt(1));
        assert_eq!(first[1], BinlogValue::String("Alice".into()));
        assert!(rows.rows[0].before.is_none());
    }

    #[test]
    fn test_decode_update_rows_pairs_images() {
        let mut decoder = BinlogDecoder::new(false);
        decode_table_map_event(&mut decoder);

        let mut payload = Vec::new();
        payload.extend_from_slice(&[7, 0, 0, 0, 0, 0]);
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(&2u16.to_le_bytes()); // v2 extra
        payload.push(2);
        payload.push(0b0000_0011); // before bitmap
        payload.push(0b0000_0011); // after bitmap
        // before image
        payload.push(0);
        payload.extend_from_slice(&1i32.to_le_bytes());
        payload.push(5);
        payload.extend_from_slice(b"Alice");
        // after image
        payload.push(0);
        payload.extend_from_slice(&1i32.to_le_bytes());
        payload.push(3);
        payload.extend_from_slice(b"Bob");

        let mut data = header_bytes(31, 700);
        data.extend_from_slice(&payload);

        let event = decoder.decode(&Bytes::from(data)).unwrap();
        let rows = match event.body {
            EventBody::UpdateRows(rows) => rows,
            other => panic!("expected update rows, got {:?}", other),
        };

        assert_eq!(rows.rows.len(), 1);
        let row = &rows.rows[0];
        assert_eq!(
            row.before.as_ref().unwrap()[1],
            BinlogValue::String("Alice".into())
        );
        assert_eq!(
            row.after.as_ref().unwrap()[1],
            BinlogValue::String("Bob".into())
        );
    }

    #[test]
    fn test_decode_rows_with_null_column() {
        let mut decoder = BinlogDecoder::new(false);
        decode_table_map_event(&mut decoder);

        let mut payload = Vec::new();
        payload.extend_from_slice(&[7, 0, 0, 0, 0, 0]);
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.push(2);
        payload.push(0b0000_0011);
        payload.push(0b0000_0010); // second column is null
        payload.extend_from_slice(&9i32.to_le_bytes());

        let mut data = header_bytes(30, 800);
        data.extend_from_slice(&payload);

        let event = decoder.decode(&Bytes::from(data)).unwrap();
        let rows = match event.body {
            EventBody::WriteRows(rows) => rows,
            other => panic!("expected write rows, got {:?}", other),
        };
        let image = rows.rows[0].after.as_ref().unwrap();
        assert_eq!(image[0], BinlogValue::SignedInt(9));
        assert_eq!(image[1], BinlogValue::Null);
    }

    #[test]
    fn test_zero_rows_event() {
        let mut decoder = BinlogDecoder::new(false);
        decode_table_map_event(&mut decoder);

        let mut data = header_bytes(30, 900);
        data.extend_from_slice(&write_rows_payload(&[]));

        let event = decoder.decode(&Bytes::from(data)).unwrap();
        match event.body {
            EventBody::WriteRows(rows) => assert!(rows.rows.is_empty()),
            other => panic!("expected write rows, got {:?}", other),
        }
    }

    #[test]
    fn test_packed_int_forms() {
        let data = [250u8];
        assert_eq!(read_packed_int(&mut Cursor::new(&data[..])).unwrap(), 250);

        let data = [252u8, 0x34, 0x12];
        assert_eq!(read_packed_int(&mut Cursor::new(&data[..])).unwrap(), 0x1234);

        let data = [253u8, 0x01, 0x02, 0x03];
        assert_eq!(
            read_packed_int(&mut Cursor::new(&data[..])).unwrap(),
            0x030201
        );

        let data = [251u8];
        assert!(read_packed_int(&mut Cursor::new(&data[..])).is_err());
    }

    #[test]
    fn test_bit_helpers() {
        assert_eq!(count_set_bits(&[0b1111_1111]), 8);
        assert_eq!(count_set_bits(&[0b1010_1010, 0b1]), 5);
        assert_eq!(count_set_bits(&[]), 0);

        let bitmap = [0b0000_0101u8];
        assert!(is_bit_set(&bitmap, 0));
        assert!(!is_bit_set(&bitmap, 1));
        assert!(is_bit_set(&bitmap, 2));
        assert!(!is_bit_set(&bitmap, 100));
    }

    #[test]
    fn test_decode_decimal_positive() {
        // DECIMAL(10,2): value 1234567.89
        // int part 12345678 -> leftover 1 digit word? precision 10, scale 2:
        // int_digits 8 -> 0 words, leftover 8 (4 bytes); frac leftover 2 (1 byte)
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1234567u32.to_be_bytes());
        bytes.push(89);
        bytes[0] ^= 0x80; // sign bit set for positive

        let mut cursor = Cursor::new(bytes.as_slice());
        let decimal = decode_decimal(&mut cursor, 10, 2).unwrap();
        assert_eq!(decimal, "1234567.89");
    }

    #[test]
    fn test_decode_decimal_negative() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&42u32.to_be_bytes());
        bytes.push(50);
        bytes[0] ^= 0x80;
        // complement for negative
        for b in bytes.iter_mut() {
            *b = !*b;
        }

        let mut cursor = Cursor::new(bytes.as_slice());
        let decimal = decode_decimal(&mut cursor, 10, 2).unwrap();
        assert_eq!(decimal, "-42.50");
    }

    #[test]
    fn test_truncated_table_map_is_error_not_panic() {
        let mut decoder = BinlogDecoder::new(false);
        // table id only, flags missing
        let mut data = header_bytes(19, 100);
        data.extend_from_slice(&[7, 0, 0, 0, 0, 0]);
        assert!(decoder.decode(&Bytes::from(data)).is_err());
    }

    #[test]
    fn test_truncated_xid_is_error() {
        let mut decoder = BinlogDecoder::new(false);
        let mut data = header_bytes(16, 100);
        data.extend_from_slice(&[1, 2, 3]);
        assert!(decoder.decode(&Bytes::from(data)).is_err());
    }

    #[test]
    fn test_truncated_query_is_error() {
        let mut decoder = BinlogDecoder::new(false);
        // shorter than the fixed query header
        let mut data = header_bytes(2, 100);
        data.extend_from_slice(&[0u8; 6]);
        assert!(decoder.decode(&Bytes::from(data)).is_err());
    }

    #[test]
    fn test_truncated_rotate_is_error() {
        let mut decoder = BinlogDecoder::new(false);
        let mut data = header_bytes(4, 100);
        data.extend_from_slice(&[0u8; 4]);
        assert!(decoder.decode(&Bytes::from(data)).is_err());
    }

    #[test]
    fn test_truncated_rows_event_is_error() {
        let mut decoder = BinlogDecoder::new(false);
        decode_table_map_event(&mut decoder);
        // table id and nothing else
        let mut data = header_bytes(30, 100);
        data.extend_from_slice(&[7, 0, 0, 0, 0, 0]);
        assert!(decoder.decode(&Bytes::from(data)).is_err());
    }

    #[test]
    fn test_truncated_row_image_is_error() {
        let mut decoder = BinlogDecoder::new(false);
        decode_table_map_event(&mut decoder);

        // Claims a 5-byte name but carries only 2 bytes of it.
        let mut payload = Vec::new();
        payload.extend_from_slice(&[7, 0, 0, 0, 0, 0]);
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.push(2);
        payload.push(0b0000_0011);
        payload.push(0);
        payload.extend_from_slice(&1i32.to_le_bytes());
        payload.push(5);
        payload.extend_from_slice(b"Al");

        let mut data = header_bytes(30, 100);
        data.extend_from_slice(&payload);
        assert!(decoder.decode(&Bytes::from(data)).is_err());
    }

    #[test]
    fn test_fractional_seconds() {
        // fsp 3 stores milliseconds in 2 bytes
        let data = [0x01u8, 0xF4]; // 500
        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(read_fractional_seconds(&mut cursor, 3).unwrap(), 500_000);

        let data: [u8; 0] = [];
        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(read_fractional_seconds(&mut cursor, 0).unwrap(), 0);
    }
}
