//! Publishing entry change events

use crate::Result;
use crate::event::{Entry, EventNotification};
use crate::queue::MessageQueue;
use std::sync::Arc;
use tracing::debug;

/// Publishes entry changes to the configured queue, if any
#[derive(Clone, Default)]
pub struct Notifier {
    queue: Option<Arc<dyn MessageQueue>>,
}

impl Notifier {
    pub fn new(queue: Option<Arc<dyn MessageQueue>>) -> Self {
        Self { queue }
    }

    /// Notifier that drops every event
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.queue.is_some()
    }

    /// Publish a change from `old_entry` to `new_entry`.
    ///
    /// The event is keyed by the old entry's path, else the new entry's;
    /// with neither entry, or no queue, nothing is sent.
    pub async fn notify_update_event(
        &self,
        old_entry: Option<&Entry>,
        new_entry: Option<&Entry>,
        delete_chunks: bool,
    ) -> Result<()> {
        let Some(queue) = &self.queue else {
            return Ok(());
        };

        let event = EventNotification {
            old_entry: old_entry.cloned(),
            new_entry: new_entry.cloned(),
            delete_chunks,
        };
        let Some(key) = event.key() else {
            return Ok(());
        };

        debug!("notifying entry update {}", key);
        queue.send_message(key, &event).await
    }
}
