//! needlefs Replication - Entry change notifications
//!
//! This crate carries entry change events out of a node and applies them
//! elsewhere:
//! - `MessageQueue`: where notifications are published
//! - `NotificationInput`: where a replicator reads them back
//! - `ReplicationSink`: where a replicator applies them
//! - `Registry`: the named implementations available to a process

pub mod error;
pub mod event;
pub mod notify;
pub mod queue;
pub mod registry;
pub mod replicator;
pub mod sink;
pub mod source;

// Re-exports
pub use error::{ReplicationError, Result};
pub use event::{Entry, EventNotification, FileChunk};
pub use notify::Notifier;
pub use queue::{LogQueue, MemoryQueue, MessageQueue};
pub use registry::Registry;
pub use replicator::Replicator;
pub use sink::{MemorySink, ReplicationSink};
pub use source::NotificationInput;
