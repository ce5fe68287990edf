//! Configuration types for needlefs
//!
//! This module defines configuration structures used across components.
//! A volume server reads one TOML file; every section and field is optional.

use crate::error::{Error, Result};
use crate::types::NeedleMapKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for a volume server
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen addresses
    pub server: ServerConfig,
    /// Volume storage configuration
    pub storage: StorageConfig,
    /// Follower sync configuration
    pub sync: SyncConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Notification queues, keyed by queue name (`[notification.log]`)
    pub notification: NotificationConfig,
}

impl Config {
    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }
}

/// Server listen addresses
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Admin HTTP listen address
    pub listen: String,
    /// gRPC listen address; defaults to the admin port + 10000
    pub grpc_listen: Option<String>,
    /// Maximum gRPC message size in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            grpc_listen: None,
            max_message_size: 64 * 1024 * 1024, // 64 MB
        }
    }
}

/// Volume storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `<vid>.dat` / `<vid>.idx` pairs
    pub dir: PathBuf,
    /// Backing structure for needle indexes
    pub index_kind: NeedleMapKind,
    /// Volumes to create at startup when missing
    pub volumes: Vec<u32>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./volume-data"),
            index_kind: NeedleMapKind::default(),
            volumes: Vec::new(),
        }
    }
}

/// Follower sync configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Leader volume server (HTTP address); sync is disabled when unset
    pub leader: Option<String>,
    /// Seconds between sync rounds
    pub interval_secs: u64,
    /// Bytes per chunk when serving an index stream
    pub chunk_size: usize,
}

impl SyncConfig {
    /// Pause between sync rounds, at least one second
    #[must_use]
    pub const fn interval(&self) -> Duration {
        if self.interval_secs == 0 {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(self.interval_secs)
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            leader: None,
            interval_secs: 30,
            chunk_size: 64 * 1024, // 64 KB
        }
    }
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

/// Per-queue notification settings, e.g.
///
/// ```toml
/// [notification.log]
/// enabled = true
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationConfig(pub BTreeMap<String, toml::Table>);

impl NotificationConfig {
    /// Names of queues with `enabled = true`, in name order
    pub fn enabled(&self) -> impl Iterator<Item = (&str, &toml::Table)> {
        self.0
            .iter()
            .filter(|(_, table)| {
                table
                    .get("enabled")
                    .and_then(toml::Value::as_bool)
                    .unwrap_or(false)
            })
            .map(|(name, table)| (name.as_str(), table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.storage.index_kind, NeedleMapKind::BTree);
        assert_eq!(config.sync.chunk_size, 64 * 1024);
        assert!(config.sync.leader.is_none());
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"

            [storage]
            dir = "/data/volumes"
            index_kind = "compact"
            volumes = [1, 2]

            [sync]
            leader = "10.0.0.1:8080"
            interval_secs = 5

            [logging]
            level = "debug"
            format = "json"

            [notification.log]
            enabled = true

            [notification.kafka]
            enabled = false
            hosts = ["localhost:9092"]
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.storage.index_kind, NeedleMapKind::Compact);
        assert_eq!(config.storage.volumes, vec![1, 2]);
        assert_eq!(config.sync.leader.as_deref(), Some("10.0.0.1:8080"));
        assert_eq!(config.sync.interval(), Duration::from_secs(5));
        assert_eq!(config.logging.format, LogFormat::Json);

        let enabled: Vec<&str> = config.notification.enabled().map(|(n, _)| n).collect();
        assert_eq!(enabled, vec!["log"]);
    }

    #[test]
    fn test_zero_sync_interval() {
        let config = Config::from_toml_str("[sync]\ninterval_secs = 0").unwrap();
        assert_eq!(config.sync.interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_config() {
        let err = Config::from_toml_str("[storage]\nindex_kind = \"mmap\"").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.toml");
        std::fs::write(&path, "[sync]\nchunk_size = 1024\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.sync.chunk_size, 1024);
        assert!(Config::from_file(dir.path().join("missing.toml")).is_err());
    }
}
