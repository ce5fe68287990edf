//! Volume server connection pool
//!
//! Volume servers are addressed by their admin HTTP address; the gRPC
//! service listens on the same host at the HTTP port + 10000.

use needlefs_common::{Error, Result};
use needlefs_proto::volume::volume_server_client::VolumeServerClient;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tonic::transport::{Channel, Endpoint};
use tracing::info;

/// Offset between a volume server's HTTP port and its gRPC port
pub const GRPC_PORT_OFFSET: u16 = 10000;

/// Max message size for volume server RPCs
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024; // 64 MB

/// Derive the gRPC address of a volume server from its `host:port`
pub fn to_grpc_address(server: &str) -> Result<String> {
    let (host, port) = server.rsplit_once(':').ok_or_else(|| {
        Error::invalid_argument(format!("volume server address without port: {}", server))
    })?;
    let port: u16 = port.parse().map_err(|_| {
        Error::invalid_argument(format!("failed to parse volume server address: {}", server))
    })?;
    let grpc_port = port.checked_add(GRPC_PORT_OFFSET).ok_or_else(|| {
        Error::invalid_argument(format!("volume server port {} has no gRPC port", port))
    })?;

    Ok(format!("{}:{}", host, grpc_port))
}

/// Cached gRPC clients keyed by volume server address
#[derive(Default)]
pub struct VolumeServerPool {
    clients: RwLock<HashMap<String, VolumeServerClient<Channel>>>,
}

impl VolumeServerPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client for `server` (HTTP address), connecting if necessary
    pub async fn get_or_connect(&self, server: &str) -> Result<VolumeServerClient<Channel>> {
        if let Some(client) = self.clients.read().await.get(server) {
            return Ok(client.clone());
        }

        let grpc_address = to_grpc_address(server)?;
        let client = Self::connect_grpc(&grpc_address).await?;

        // Another task may have connected while we were dialing
        let mut clients = self.clients.write().await;
        let client = clients
            .entry(server.to_string())
            .or_insert(client)
            .clone();
        info!("Connected to volume server {} (gRPC {})", server, grpc_address);
        Ok(client)
    }

    /// Dial a gRPC address directly
    pub async fn connect_grpc(grpc_address: &str) -> Result<VolumeServerClient<Channel>> {
        let channel = Endpoint::new(format!("http://{}", grpc_address))
            .map_err(|e| Error::invalid_argument(format!("bad address {}: {}", grpc_address, e)))?
            .connect()
            .await
            .map_err(|e| Error::retryable(format!("connect {}: {}", grpc_address, e)))?;

        Ok(VolumeServerClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE))
    }

    /// Drop the cached client of `server`
    pub async fn disconnect(&self, server: &str) {
        if self.clients.write().await.remove(server).is_some() {
            info!("Disconnected from volume server {}", server);
        }
    }

    /// Addresses with a cached client
    pub async fn connected(&self) -> Vec<String> {
        self.clients.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_grpc_address() {
        assert_eq!(to_grpc_address("localhost:8080").unwrap(), "localhost:18080");
        assert_eq!(to_grpc_address("10.0.0.1:80").unwrap(), "10.0.0.1:10080");
        assert_eq!(to_grpc_address("[::1]:8080").unwrap(), "[::1]:18080");
    }

    #[test]
    fn test_to_grpc_address_errors() {
        assert!(to_grpc_address("localhost").is_err());
        assert!(to_grpc_address("localhost:http").is_err());
        assert!(to_grpc_address("localhost:60000").is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_retryable() {
        let pool = VolumeServerPool::new();
        // Port 1 + 10000 on loopback; nothing listens there in tests
        let err = pool.get_or_connect("127.0.0.1:1").await.unwrap_err();
        assert!(err.is_retryable(), "{:?}", err);
        assert!(pool.connected().await.is_empty());
    }
}
