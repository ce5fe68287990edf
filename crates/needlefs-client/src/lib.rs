//! needlefs Client - Volume server RPC client
//!
//! This crate provides the gRPC connection pool used between volume servers
//! and the follower side of the volume sync protocol.

pub mod pool;
pub mod sync;

// Re-exports
pub use pool::{VolumeServerPool, to_grpc_address};
pub use sync::{
    SyncOutcome, VolumeSyncer, get_volume_sync_status, stream_volume_data, stream_volume_index,
};
