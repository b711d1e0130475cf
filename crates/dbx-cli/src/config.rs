//! Configuration loading
//!
//! A readable, parseable YAML file wins; otherwise the configuration is
//! assembled from environment variables. Either way the three `type` tags
//! must end up non-empty.
//!
//! Defaults live on the config structs themselves (`Default` impls plus
//! `from_env` constructors per entity), never in runtime reflection.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

use dbx_cdc::source::SourceConfig;
use dbx_cdc::{CdcError, Result};
use dbx_sink::SinkConfig;
use dbx_store::StoreConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub store: StoreConfig,
    pub output: SinkConfig,
}

impl Config {
    /// Assemble from environment variables.
    pub fn from_env() -> Self {
        Self {
            source: SourceConfig::from_env(),
            store: StoreConfig::from_env(),
            output: SinkConfig::from_env(),
        }
    }

    /// The selector tags every run needs.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.source.kind.is_empty() {
            missing.push("source.type");
        }
        if self.store.kind.is_empty() {
            missing.push("store.type");
        }
        if self.output.kind.is_empty() {
            missing.push("output.type");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CdcError::config(format!(
                "missing required configuration: {}",
                missing.join(", ")
            )))
        }
    }
}

/// Load configuration: file first, environment as the fallback.
pub fn load(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();

    let config = match std::fs::read_to_string(path) {
        Ok(data) => match serde_yaml::from_str::<Config>(&data) {
            Ok(config) => {
                debug!(path = %path.display(), "loaded configuration file");
                config
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config file did not parse, falling back to environment");
                Config::from_env()
            }
        },
        Err(e) => {
            debug!(path = %path.display(), error = %e, "config file not readable, falling back to environment");
            Config::from_env()
        }
    };

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
source:
  type: mysql
  mysql:
    addr: 10.0.0.5:3306
    user: repl
    password: hunter2
    include_table_regex: ["app\\..*"]
store:
  type: file
  file:
    dir: /var/lib/dbx
output:
  type: kafka
  kafka:
    brokers: ["k1:9092", "k2:9092"]
    topic: changes
"#;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = load(file.path()).unwrap();
        assert_eq!(config.source.kind, "mysql");
        assert_eq!(config.source.mysql.addr, "10.0.0.5:3306");
        assert_eq!(config.source.mysql.user, "repl");
        assert_eq!(config.source.mysql.include_table_regex, vec!["app\\..*"]);
        assert_eq!(config.store.kind, "file");
        assert_eq!(config.store.file.dir, "/var/lib/dbx");
        assert_eq!(config.output.kind, "kafka");
        assert_eq!(config.output.kafka.brokers, vec!["k1:9092", "k2:9092"]);
        assert_eq!(config.output.kafka.topic, "changes");
    }

    #[test]
    fn test_unspecified_fields_keep_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"source:\n  type: mysql\nstore:\n  type: file\noutput:\n  type: stdout\n")
            .unwrap();

        let config = load(file.path()).unwrap();
        assert_eq!(config.source.mysql.addr, "127.0.0.1:3306");
        assert_eq!(config.source.mysql.user, "root");
        assert_eq!(config.output.kafka.topic, "dbx-events");
    }

    #[test]
    fn test_missing_types_are_config_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"source:\n  type: mysql\n").unwrap();

        let err = load(file.path()).unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("store.type"));
        assert!(rendered.contains("output.type"));
        assert!(!rendered.contains("source.type"));
    }

    #[test]
    fn test_validate_reports_all_missing() {
        let err = Config::default().validate().unwrap_err();
        assert!(err
            .to_string()
            .contains("source.type, store.type, output.type"));
    }
}
