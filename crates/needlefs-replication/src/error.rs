//! Replication error types

use thiserror::Error;

/// Result type for replication operations
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors from queues, inputs and sinks
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0} is not initialized")]
    NotInitialized(String),

    #[error("queue {0} is closed")]
    QueueClosed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sink error: {0}")]
    Sink(String),
}
