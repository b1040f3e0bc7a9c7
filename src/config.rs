//! Store configuration
//!
//! Loaded from a JSON file. Every field except `data_file` has a default:
//!
//! ```json
//! {
//!   "data_file": "./data/store.obj",
//!   "oplog_file": "./data/store.oplog",
//!   "log_level": "info",
//!   "lock_shards": 64,
//!   "buffer_pool_size": 32,
//!   "sync_on_write": false
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::observability::Severity;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// Path of the database file (required)
    pub data_file: PathBuf,

    /// Operation log appended before every call; disabled when absent
    #[serde(default)]
    pub oplog_file: Option<PathBuf>,

    /// Minimum log severity (default "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Shards per lock pool, a power of two (default 64)
    #[serde(default = "default_lock_shards")]
    pub lock_shards: usize,

    /// Idle scratch buffers kept for reuse (default 32)
    #[serde(default = "default_buffer_pool_size")]
    pub buffer_pool_size: usize,

    /// fsync after every block allocation (default false)
    #[serde(default)]
    pub sync_on_write: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_lock_shards() -> usize {
    64
}
fn default_buffer_pool_size() -> usize {
    32
}

impl StoreConfig {
    /// Defaults for a database at `data_file`, with no operation log.
    pub fn new(data_file: impl Into<PathBuf>) -> Self {
        Self {
            data_file: data_file.into(),
            oplog_file: None,
            log_level: default_log_level(),
            lock_shards: default_lock_shards(),
            buffer_pool_size: default_buffer_pool_size(),
            sync_on_write: false,
        }
    }

    /// Enables the operation log at `path`.
    pub fn with_oplog(mut self, path: impl Into<PathBuf>) -> Self {
        self.oplog_file = Some(path.into());
        self
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: StoreConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.data_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data_file must not be empty".into()));
        }
        if self.severity().is_none() {
            return Err(ConfigError::Invalid(format!(
                "Invalid log_level: '{}'. Expected trace, info, warn, error or fatal.",
                self.log_level
            )));
        }
        if self.lock_shards == 0 || !self.lock_shards.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "lock_shards must be a power of two, got {}",
                self.lock_shards
            )));
        }
        Ok(())
    }

    /// Parsed `log_level`.
    pub fn severity(&self) -> Option<Severity> {
        Severity::parse(&self.log_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_applied() {
        let config: StoreConfig = serde_json::from_str(r#"{"data_file":"db.obj"}"#).unwrap();
        assert_eq!(config, StoreConfig::new("db.obj"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_shards_and_level() {
        let mut config = StoreConfig::new("db.obj");
        config.lock_shards = 48;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = StoreConfig::new("db.obj");
        config.log_level = "loud".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"data_file":"a.obj","oplog_file":"a.log","lock_shards":8,"sync_on_write":true}"#,
        )
        .unwrap();

        let config = StoreConfig::load(&path).unwrap();
        assert_eq!(config.oplog_file, Some(PathBuf::from("a.log")));
        assert_eq!(config.lock_shards, 8);
        assert!(config.sync_on_write);
        assert_eq!(config.buffer_pool_size, 32);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = StoreConfig::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
