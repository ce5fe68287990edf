//! Named queue, input and sink implementations

use crate::queue::{LogQueue, MemoryQueue, MessageQueue};
use crate::sink::{MemorySink, ReplicationSink};
use crate::source::NotificationInput;
use crate::Result;
use needlefs_common::config::NotificationConfig;
use std::sync::Arc;
use tracing::{info, warn};

/// Implementations available to a process, in registration order
#[derive(Default)]
pub struct Registry {
    queues: Vec<Arc<dyn MessageQueue>>,
    inputs: Vec<Arc<dyn NotificationInput>>,
    sinks: Vec<Arc<dyn ReplicationSink>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in implementations.
    ///
    /// The `memory` queue and input share one channel, so events published
    /// to it can be replicated in-process.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let memory = Arc::new(MemoryQueue::new());

        registry.register_queue(Arc::new(LogQueue));
        registry.register_queue(memory.clone());
        registry.register_input(memory);
        registry.register_sink(Arc::new(MemorySink::new()));
        registry
    }

    pub fn register_queue(&mut self, queue: Arc<dyn MessageQueue>) {
        self.queues.push(queue);
    }

    pub fn register_input(&mut self, input: Arc<dyn NotificationInput>) {
        self.inputs.push(input);
    }

    pub fn register_sink(&mut self, sink: Arc<dyn ReplicationSink>) {
        self.sinks.push(sink);
    }

    #[must_use]
    pub fn queue(&self, name: &str) -> Option<Arc<dyn MessageQueue>> {
        self.queues.iter().find(|q| q.name() == name).cloned()
    }

    #[must_use]
    pub fn input(&self, name: &str) -> Option<Arc<dyn NotificationInput>> {
        self.inputs.iter().find(|i| i.name() == name).cloned()
    }

    #[must_use]
    pub fn sink(&self, name: &str) -> Option<Arc<dyn ReplicationSink>> {
        self.sinks.iter().find(|s| s.name() == name).cloned()
    }

    /// Initialize and return the first registered queue enabled in `config`.
    ///
    /// Enabled sections naming no registered queue are logged and ignored.
    pub async fn configured_queue(
        &self,
        config: &NotificationConfig,
    ) -> Result<Option<Arc<dyn MessageQueue>>> {
        for (name, _) in config.enabled() {
            if self.queue(name).is_none() {
                warn!("notification queue {} is not available", name);
            }
        }

        for queue in &self.queues {
            let Some(table) = config
                .enabled()
                .find(|(name, _)| *name == queue.name())
                .map(|(_, table)| table)
            else {
                continue;
            };

            queue.initialize(table).await?;
            info!("notifications go to the {} queue", queue.name());
            return Ok(Some(queue.clone()));
        }

        Ok(None)
    }
}
