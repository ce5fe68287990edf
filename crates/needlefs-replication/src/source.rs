//! Notification inputs read by a replicator

use crate::Result;
use crate::event::EventNotification;
use async_trait::async_trait;

/// A source of published entry events
#[async_trait]
pub trait NotificationInput: Send + Sync {
    /// Name of the `[notification.<name>]` configuration section
    fn name(&self) -> &str;

    async fn initialize(&self, config: &toml::Table) -> Result<()>;

    /// Wait for the next event and its key
    async fn receive_message(&self) -> Result<(String, EventNotification)>;
}
