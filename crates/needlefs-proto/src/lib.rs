//! needlefs Protocol - gRPC service definitions
//!
//! This crate contains the protobuf-generated code for the volume server's
//! gRPC service.

/// Volume server service (needle I/O, batch delete, volume sync)
pub mod volume {
    tonic::include_proto!("needlefs.volume");
}
