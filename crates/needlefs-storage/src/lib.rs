//! needlefs Storage Engine - Needle index and volumes
//!
//! This crate implements the storage side of a volume server:
//! - Needle index log (append-only, crash-tolerant replay)
//! - Pluggable in-memory needle maps (B-tree, compact array)
//! - Incrementally maintained index metrics
//! - Volumes (data file + index) and the per-node volume store
//! - Follower index and data resync staging
//! - Batch deletion

pub mod batch_delete;
pub mod index_file;
pub mod metric;
pub mod needle;
pub mod needle_map;
pub mod store;
pub mod sync;
pub mod volume;

// Re-exports
pub use batch_delete::{BatchDeleter, DeleteResult, DeleteStatus};
pub use index_file::{FileChunks, IndexLog, IndexRecord, RecordReassembler, walk_index_file};
pub use metric::{NeedleMapMetric, fast_load};
pub use needle::{FLAG_CHUNK_MANIFEST, Needle};
pub use needle_map::{
    BTreeNeedleMap, CompactNeedleMap, NeedleMap, NeedleValue, NeedleValueMap, create_value_map,
};
pub use store::{Store, VolumeStore};
pub use sync::{StagingData, StagingIndex, SyncCursor, SyncDecision, VolumeSyncStatus};
pub use volume::Volume;
