//! needlefs volume server
//!
//! The daemon in `main.rs` wires these pieces together:
//! - `service`: the `VolumeServer` gRPC service
//! - `admin`: the admin HTTP endpoints
//! - `follower`: periodic index sync against a leader

pub mod admin;
pub mod follower;
pub mod service;

use needlefs_proto::volume::volume_server_server::VolumeServerServer;
use service::VolumeService;
use std::sync::Arc;

/// Wrap a service for a tonic server, with message limits applied
pub fn grpc_server(
    service: Arc<VolumeService>,
    max_message_size: usize,
) -> VolumeServerServer<VolumeService> {
    VolumeServerServer::from_arc(service)
        .max_decoding_message_size(max_message_size)
        .max_encoding_message_size(max_message_size)
}
