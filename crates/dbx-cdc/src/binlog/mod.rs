//! Replication ingestion: wire protocol, event decoding, and the reader
//! that turns both into typed row callbacks.

pub mod decoder;
pub mod protocol;
pub mod reader;

pub use reader::{
    BinlogReader, EventHandler, ReaderConfig, RowAction, RowsEvent, RowsHeader, TableDescriptor,
};
