//! Table filtering for captured events
//!
//! Filtering runs on the qualified `database.table` name. Excludes are
//! evaluated first; if any include pattern is configured, a table must also
//! match one of them. System schemas are excluded by default.

use regex::Regex;

use crate::error::{CdcError, Result};

/// Default exclude patterns for the built-in system schemas.
pub const DEFAULT_EXCLUDE_TABLE_REGEX: [&str; 4] = [
    "mysql.*",
    "information_schema.*",
    "performance_schema.*",
    "sys.*",
];

/// Compiled include/exclude table filter.
#[derive(Debug)]
pub struct TableFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl TableFilter {
    /// Compile a filter from regex pattern lists.
    ///
    /// An empty exclude list falls back to [`DEFAULT_EXCLUDE_TABLE_REGEX`].
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let exclude = if exclude.is_empty() {
            compile(DEFAULT_EXCLUDE_TABLE_REGEX.iter().copied())?
        } else {
            compile(exclude.iter().map(String::as_str))?
        };
        let include = compile(include.iter().map(String::as_str))?;
        Ok(Self { include, exclude })
    }

    /// A filter that only excludes the system schemas.
    pub fn default_filter() -> Self {
        Self::new(&[], &[]).expect("default patterns compile")
    }

    /// Check whether events for `database.table` should be emitted.
    pub fn matches(&self, database: &str, table: &str) -> bool {
        let qualified = format!("{}.{}", database, table);

        if self.exclude.iter().any(|re| re.is_match(&qualified)) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include.iter().any(|re| re.is_match(&qualified))
    }
}

fn compile<'a>(patterns: impl Iterator<Item = &'a str>) -> Result<Vec<Regex>> {
    patterns
        .map(|p| {
            Regex::new(p).map_err(|e| CdcError::config(format!("invalid table regex {:?}: {}", p, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_excludes_system_schemas() {
        let filter = TableFilter::default_filter();

        assert!(!filter.matches("mysql", "user"));
        assert!(!filter.matches("information_schema", "tables"));
        assert!(!filter.matches("performance_schema", "threads"));
        assert!(!filter.matches("sys", "sys_config"));
        assert!(filter.matches("app", "users"));
    }

    #[test]
    fn test_include_restricts() {
        let filter = TableFilter::new(&["app\\.users".to_string()], &[]).unwrap();

        assert!(filter.matches("app", "users"));
        assert!(!filter.matches("app", "orders"));
        assert!(!filter.matches("mysql", "user"));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let filter = TableFilter::new(
            &["app.*".to_string()],
            &["app\\.audit.*".to_string()],
        )
        .unwrap();

        assert!(filter.matches("app", "users"));
        assert!(!filter.matches("app", "audit_log"));
        // Custom excludes replace the defaults.
        assert!(!filter.matches("mysql", "user"));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = TableFilter::new(&["(".to_string()], &[]).unwrap_err();
        assert!(matches!(err, CdcError::Config(_)));
    }
}
