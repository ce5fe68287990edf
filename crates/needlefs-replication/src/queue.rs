//! Message queues that entry events are published to

use crate::event::EventNotification;
use crate::source::NotificationInput;
use crate::{ReplicationError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::info;

/// Default capacity of the in-process queue
pub const DEFAULT_MEMORY_QUEUE_CAPACITY: usize = 1024;

/// A destination for entry events
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Name of the `[notification.<name>]` configuration section
    fn name(&self) -> &str;

    async fn initialize(&self, config: &toml::Table) -> Result<()>;

    async fn send_message(&self, key: &str, message: &EventNotification) -> Result<()>;
}

/// Writes every event to the log as JSON
#[derive(Debug, Default)]
pub struct LogQueue;

#[async_trait]
impl MessageQueue for LogQueue {
    fn name(&self) -> &str {
        "log"
    }

    async fn initialize(&self, _config: &toml::Table) -> Result<()> {
        Ok(())
    }

    async fn send_message(&self, key: &str, message: &EventNotification) -> Result<()> {
        info!(target: "needlefs::notification", key, event = %message.to_json()?, "entry event");
        Ok(())
    }
}

/// In-process bounded queue; also readable as a [`NotificationInput`]
#[derive(Debug, Default)]
pub struct MemoryQueue {
    sender: Mutex<Option<mpsc::Sender<(String, EventNotification)>>>,
    receiver: tokio::sync::Mutex<Option<mpsc::Receiver<(String, EventNotification)>>>,
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the channel once; later calls keep the existing one
    async fn setup(&self, config: &toml::Table) -> Result<()> {
        let capacity = Self::capacity(config)?;
        if self.sender.lock().is_some() {
            return Ok(());
        }

        let mut receiver = self.receiver.lock().await;
        let mut sender = self.sender.lock();
        if sender.is_none() {
            let (tx, rx) = mpsc::channel(capacity);
            *sender = Some(tx);
            *receiver = Some(rx);
        }
        Ok(())
    }

    fn capacity(config: &toml::Table) -> Result<usize> {
        match config.get("capacity") {
            None => Ok(DEFAULT_MEMORY_QUEUE_CAPACITY),
            Some(value) => value
                .as_integer()
                .and_then(|n| usize::try_from(n).ok())
                .filter(|&n| n > 0)
                .ok_or_else(|| {
                    ReplicationError::Configuration(format!(
                        "notification.memory.capacity must be a positive integer, got {}",
                        value
                    ))
                }),
        }
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    fn name(&self) -> &str {
        "memory"
    }

    async fn initialize(&self, config: &toml::Table) -> Result<()> {
        self.setup(config).await
    }

    async fn send_message(&self, key: &str, message: &EventNotification) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| ReplicationError::NotInitialized("memory queue".into()))?;

        sender
            .send((key.to_string(), message.clone()))
            .await
            .map_err(|_| ReplicationError::QueueClosed("memory".into()))
    }
}

#[async_trait]
impl NotificationInput for MemoryQueue {
    fn name(&self) -> &str {
        "memory"
    }

    async fn initialize(&self, config: &toml::Table) -> Result<()> {
        self.setup(config).await
    }

    async fn receive_message(&self) -> Result<(String, EventNotification)> {
        let mut receiver = self.receiver.lock().await;
        let receiver = receiver
            .as_mut()
            .ok_or_else(|| ReplicationError::NotInitialized("memory queue".into()))?;

        receiver
            .recv()
            .await
            .ok_or_else(|| ReplicationError::QueueClosed("memory".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Entry;

    fn event(path: &str) -> EventNotification {
        EventNotification {
            new_entry: Some(Entry::file(path, vec![])),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_memory_queue_round_trip() {
        let queue = MemoryQueue::new();
        MessageQueue::initialize(&queue, &toml::Table::new()).await.unwrap();

        queue.send_message("/a", &event("/a")).await.unwrap();
        queue.send_message("/b", &event("/b")).await.unwrap();

        let (key, message) = queue.receive_message().await.unwrap();
        assert_eq!(key, "/a");
        assert_eq!(message, event("/a"));
        assert_eq!(queue.receive_message().await.unwrap().0, "/b");
    }

    #[tokio::test]
    async fn test_memory_queue_requires_initialize() {
        let queue = MemoryQueue::new();
        assert!(matches!(
            queue.send_message("/a", &event("/a")).await,
            Err(ReplicationError::NotInitialized(_))
        ));
        assert!(queue.receive_message().await.is_err());
    }

    #[tokio::test]
    async fn test_memory_queue_capacity_config() {
        let queue = MemoryQueue::new();
        let config: toml::Table = toml::from_str("capacity = 0").unwrap();
        assert!(matches!(
            MessageQueue::initialize(&queue, &config).await,
            Err(ReplicationError::Configuration(_))
        ));

        let config: toml::Table = toml::from_str("capacity = 1").unwrap();
        MessageQueue::initialize(&queue, &config).await.unwrap();
        queue.send_message("/a", &event("/a")).await.unwrap();
        // A full queue makes the sender wait
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            queue.send_message("/b", &event("/b")),
        )
        .await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_log_queue_accepts_events() {
        let queue = LogQueue;
        queue.initialize(&toml::Table::new()).await.unwrap();
        queue.send_message("/a", &event("/a")).await.unwrap();
        assert_eq!(MessageQueue::name(&queue), "log");
    }
}
