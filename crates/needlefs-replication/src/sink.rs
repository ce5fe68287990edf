//! Replication sinks that entry events are applied to

use crate::event::Entry;
use crate::{ReplicationError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// A destination that mirrors entries
#[async_trait]
pub trait ReplicationSink: Send + Sync {
    /// Name of the sink's configuration section
    fn name(&self) -> &str;

    async fn initialize(&self, config: &toml::Table) -> Result<()>;

    async fn delete_entry(&self, key: &str, is_directory: bool, delete_include_chunks: bool) -> Result<()>;

    async fn create_entry(&self, key: &str, entry: &Entry) -> Result<()>;

    /// Update an existing entry. Returns `false` when the sink has no entry
    /// at `key`, leaving the caller to create it.
    async fn update_entry(
        &self,
        key: &str,
        old_entry: &Entry,
        new_entry: &Entry,
        delete_include_chunks: bool,
    ) -> Result<bool>;

    /// Directory that replicated keys are placed under
    fn sink_to_directory(&self) -> String;
}

/// Keeps replicated entries in memory, keyed by path
#[derive(Debug)]
pub struct MemorySink {
    directory: RwLock<String>,
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            directory: RwLock::new("/".to_string()),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Entry> {
        self.entries.read().get(key).cloned()
    }

    /// Stored keys in order
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplicationSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn initialize(&self, config: &toml::Table) -> Result<()> {
        if let Some(value) = config.get("directory") {
            let directory = value.as_str().ok_or_else(|| {
                ReplicationError::Configuration("sink.memory.directory must be a string".into())
            })?;
            *self.directory.write() = directory.to_string();
        }
        Ok(())
    }

    async fn delete_entry(&self, key: &str, is_directory: bool, _delete_include_chunks: bool) -> Result<()> {
        let mut entries = self.entries.write();
        entries.remove(key);
        if is_directory {
            let prefix = format!("{}/", key.trim_end_matches('/'));
            entries.retain(|path, _| !path.starts_with(&prefix));
        }
        Ok(())
    }

    async fn create_entry(&self, key: &str, entry: &Entry) -> Result<()> {
        self.entries.write().insert(key.to_string(), entry.clone());
        Ok(())
    }

    async fn update_entry(
        &self,
        key: &str,
        _old_entry: &Entry,
        new_entry: &Entry,
        _delete_include_chunks: bool,
    ) -> Result<bool> {
        match self.entries.write().get_mut(key) {
            Some(existing) => {
                *existing = new_entry.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn sink_to_directory(&self) -> String {
        self.directory.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_directory_delete() {
        let sink = MemorySink::new();
        sink.create_entry("/d", &Entry::directory("/d")).await.unwrap();
        sink.create_entry("/d/a", &Entry::file("/d/a", vec![])).await.unwrap();
        sink.create_entry("/dx", &Entry::file("/dx", vec![])).await.unwrap();

        sink.delete_entry("/d", true, true).await.unwrap();
        assert_eq!(sink.keys(), vec!["/dx".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_sink_update_missing() {
        let sink = MemorySink::new();
        let entry = Entry::file("/a", vec![]);
        assert!(!sink.update_entry("/a", &entry, &entry, false).await.unwrap());
        assert!(sink.get("/a").is_none());
    }

    #[tokio::test]
    async fn test_memory_sink_config() {
        let sink = MemorySink::new();
        assert_eq!(sink.sink_to_directory(), "/");

        let config: toml::Table = toml::from_str("directory = \"/backup\"").unwrap();
        sink.initialize(&config).await.unwrap();
        assert_eq!(sink.sink_to_directory(), "/backup");

        let bad: toml::Table = toml::from_str("directory = 5").unwrap();
        assert!(sink.initialize(&bad).await.is_err());
    }
}
