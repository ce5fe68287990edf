//! Applying entry events to a sink

use crate::event::EventNotification;
use crate::sink::ReplicationSink;
use crate::source::NotificationInput;
use crate::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Mirrors entries under `source_dir` into a sink
pub struct Replicator {
    source_dir: String,
    sink: Arc<dyn ReplicationSink>,
}

impl Replicator {
    pub fn new(source_dir: impl Into<String>, sink: Arc<dyn ReplicationSink>) -> Self {
        Self {
            source_dir: source_dir.into(),
            sink,
        }
    }

    #[must_use]
    pub fn source_dir(&self) -> &str {
        &self.source_dir
    }

    /// Path in the sink for `key`, or `None` when `key` is outside the
    /// source directory
    #[must_use]
    pub fn sink_key(&self, key: &str) -> Option<String> {
        let source = self.source_dir.trim_end_matches('/');
        let rest = key.strip_prefix(source)?;
        if !rest.is_empty() && !rest.starts_with('/') {
            return None;
        }

        let target = self.sink.sink_to_directory();
        let target = target.trim_end_matches('/');
        let rest = rest.trim_start_matches('/');
        Some(if rest.is_empty() {
            if target.is_empty() { "/".to_string() } else { target.to_string() }
        } else {
            format!("{}/{}", target, rest)
        })
    }

    /// Apply one event
    pub async fn replicate(&self, key: &str, event: &EventNotification) -> Result<()> {
        let Some(sink_key) = self.sink_key(key) else {
            debug!("skipping {} outside {}", key, self.source_dir);
            return Ok(());
        };

        match (&event.old_entry, &event.new_entry) {
            (None, None) => Ok(()),
            (None, Some(new_entry)) => {
                debug!("create {} -> {}", key, sink_key);
                self.sink.create_entry(&sink_key, new_entry).await
            }
            (Some(old_entry), None) => {
                debug!("delete {} -> {}", key, sink_key);
                self.sink
                    .delete_entry(&sink_key, old_entry.is_directory, event.delete_chunks)
                    .await
            }
            (Some(old_entry), Some(new_entry)) => {
                debug!("update {} -> {}", key, sink_key);
                let found = self
                    .sink
                    .update_entry(&sink_key, old_entry, new_entry, event.delete_chunks)
                    .await?;
                if found {
                    Ok(())
                } else {
                    self.sink.create_entry(&sink_key, new_entry).await
                }
            }
        }
    }

    /// Replicate events from `input` until cancelled or the input fails.
    ///
    /// A failing event is logged and skipped.
    pub async fn run(&self, input: &dyn NotificationInput, cancel: &CancellationToken) -> Result<()> {
        info!(
            "replicating {} from {} to {} {}",
            self.source_dir,
            input.name(),
            self.sink.name(),
            self.sink.sink_to_directory()
        );

        loop {
            let (key, event) = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                message = input.receive_message() => message?,
            };

            if let Err(e) = self.replicate(&key, &event).await {
                warn!("failed to replicate {}: {}", key, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Entry;
    use crate::queue::{MemoryQueue, MessageQueue};
    use crate::sink::MemorySink;

    async fn setup(source: &str, target: &str) -> (Replicator, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let config: toml::Table = toml::from_str(&format!("directory = \"{}\"", target)).unwrap();
        sink.initialize(&config).await.unwrap();
        (Replicator::new(source, sink.clone()), sink)
    }

    fn event(old: Option<Entry>, new: Option<Entry>) -> EventNotification {
        EventNotification {
            old_entry: old,
            new_entry: new,
            delete_chunks: true,
        }
    }

    #[tokio::test]
    async fn test_sink_key() {
        let (replicator, _) = setup("/data/", "/backup").await;
        assert_eq!(replicator.sink_key("/data/a/b").as_deref(), Some("/backup/a/b"));
        assert_eq!(replicator.sink_key("/data").as_deref(), Some("/backup"));
        assert_eq!(replicator.sink_key("/database/x"), None);
        assert_eq!(replicator.sink_key("/other"), None);

        let (root, _) = setup("/", "/").await;
        assert_eq!(root.sink_key("/x").as_deref(), Some("/x"));
        assert_eq!(root.sink_key("/").as_deref(), Some("/"));
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let (replicator, sink) = setup("/data", "/backup").await;
        let v1 = Entry::file("/data/f", vec![]);
        let mut v2 = v1.clone();
        v2.mtime = 42;

        replicator.replicate("/data/f", &event(None, Some(v1.clone()))).await.unwrap();
        assert_eq!(sink.get("/backup/f"), Some(v1.clone()));

        replicator
            .replicate("/data/f", &event(Some(v1.clone()), Some(v2.clone())))
            .await
            .unwrap();
        assert_eq!(sink.get("/backup/f").unwrap().mtime, 42);

        replicator.replicate("/data/f", &event(Some(v2), None)).await.unwrap();
        assert!(sink.keys().is_empty());
    }

    #[tokio::test]
    async fn test_update_of_missing_entry_creates() {
        let (replicator, sink) = setup("/data", "/backup").await;
        let old = Entry::file("/data/g", vec![]);
        let new = Entry::file("/data/g", vec![]);

        replicator.replicate("/data/g", &event(Some(old), Some(new.clone()))).await.unwrap();
        assert_eq!(sink.get("/backup/g"), Some(new));
    }

    #[tokio::test]
    async fn test_skips_outside_source() {
        let (replicator, sink) = setup("/data", "/backup").await;
        let entry = Entry::file("/tmp/x", vec![]);
        replicator.replicate("/tmp/x", &event(None, Some(entry))).await.unwrap();
        assert!(sink.keys().is_empty());
    }

    #[tokio::test]
    async fn test_run_until_cancelled() {
        let (replicator, sink) = setup("/", "/mirror").await;
        let queue = Arc::new(MemoryQueue::new());
        MessageQueue::initialize(queue.as_ref(), &toml::Table::new())
            .await
            .unwrap();

        queue
            .send_message("/a", &event(None, Some(Entry::file("/a", vec![]))))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let task = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { replicator.run(queue.as_ref(), &cancel).await })
        };

        for _ in 0..100 {
            if sink.get("/mirror/a").is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(sink.get("/mirror/a").is_some());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
