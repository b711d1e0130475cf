//! Binlog position tracking
//!
//! A `(file, pos)` pair naming a byte location in the primary's binlog
//! stream. The serialized JSON form `{"file":"...","pos":...}` is the durable
//! checkpoint body persisted under [`crate::source::POSITION_KEY`].

use serde::{Deserialize, Serialize};

/// A resumable position in the binlog stream.
///
/// An empty file name together with a zero offset means "start from the
/// primary's current tip".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogPosition {
    /// Binlog file name, e.g. `binlog.000003`
    pub file: String,
    /// Byte offset within the file
    pub pos: u32,
}

impl BinlogPosition {
    pub fn new(file: impl Into<String>, pos: u32) -> Self {
        Self {
            file: file.into(),
            pos,
        }
    }

    /// True when this position does not name a concrete location.
    pub fn is_zero(&self) -> bool {
        self.file.is_empty() || self.pos == 0
    }
}

impl std::fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_position() {
        assert!(BinlogPosition::default().is_zero());
        assert!(BinlogPosition::new("", 1024).is_zero());
        assert!(BinlogPosition::new("binlog.000001", 0).is_zero());
        assert!(!BinlogPosition::new("binlog.000001", 4).is_zero());
    }

    #[test]
    fn test_json_shape() {
        let pos = BinlogPosition::new("bin.000003", 1024);
        let json = serde_json::to_string(&pos).unwrap();
        assert_eq!(json, r#"{"file":"bin.000003","pos":1024}"#);

        let parsed: BinlogPosition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, pos);
    }

    #[test]
    fn test_display() {
        let pos = BinlogPosition::new("bin.000007", 4096);
        assert_eq!(pos.to_string(), "bin.000007:4096");
    }
}
