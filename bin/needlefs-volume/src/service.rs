//! Volume server gRPC service implementation

use needlefs_common::{Error, FileId, VolumeId};
use needlefs_proto::volume::{
    AllocateVolumeRequest, AllocateVolumeResponse, BatchDeleteRequest, BatchDeleteResponse,
    DeleteNeedleRequest, DeleteNeedleResponse, DeleteResult, ReadNeedleRequest,
    ReadNeedleResponse, VolumeSyncDataRequest, VolumeSyncDataResponse, VolumeSyncIndexRequest,
    VolumeSyncIndexResponse, VolumeSyncStatusRequest, VolumeSyncStatusResponse, WriteNeedleRequest,
    WriteNeedleResponse,
    volume_server_server::VolumeServer,
};
use needlefs_replication::{Entry, FileChunk, Notifier};
use needlefs_storage::{BatchDeleter, FileChunks, Needle, Store, VolumeSyncStatus};
use prost::Message;
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// Chunks buffered between the index reader and a slow follower
const SYNC_STREAM_BUFFER: usize = 4;

/// gRPC method metrics
#[derive(Debug, Default)]
pub struct RpcMethodMetrics {
    pub requests_success: AtomicU64,
    pub requests_error: AtomicU64,
    pub latency_sum_us: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl RpcMethodMetrics {
    pub fn record(&self, success: bool, start: Instant, bytes_in: u64, bytes_out: u64) {
        if success {
            self.requests_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_error.fetch_add(1, Ordering::Relaxed);
        }
        let latency_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes_out, Ordering::Relaxed);
    }
}

/// gRPC metrics of the volume server
#[derive(Debug, Default)]
pub struct RpcMetrics {
    pub batch_delete: RpcMethodMetrics,
    pub volume_sync_status: RpcMethodMetrics,
    pub volume_sync_index: RpcMethodMetrics,
    pub volume_sync_data: RpcMethodMetrics,
    pub allocate_volume: RpcMethodMetrics,
    pub write_needle: RpcMethodMetrics,
    pub read_needle: RpcMethodMetrics,
    pub delete_needle: RpcMethodMetrics,
}

impl RpcMetrics {
    fn methods(&self) -> [(&'static str, &RpcMethodMetrics); 8] {
        [
            ("BatchDelete", &self.batch_delete),
            ("VolumeSyncStatus", &self.volume_sync_status),
            ("VolumeSyncIndex", &self.volume_sync_index),
            ("VolumeSyncData", &self.volume_sync_data),
            ("AllocateVolume", &self.allocate_volume),
            ("WriteNeedle", &self.write_needle),
            ("ReadNeedle", &self.read_needle),
            ("DeleteNeedle", &self.delete_needle),
        ]
    }

    /// Export metrics in Prometheus format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::with_capacity(4 * 1024);
        let methods = self.methods();

        // Writing into a String cannot fail
        let _ = writeln!(
            output,
            "# HELP needlefs_grpc_requests_total Total gRPC requests by method and status"
        );
        let _ = writeln!(output, "# TYPE needlefs_grpc_requests_total counter");
        for (method, metrics) in &methods {
            let _ = writeln!(
                output,
                "needlefs_grpc_requests_total{{method=\"{}\",status=\"success\"}} {}",
                method,
                metrics.requests_success.load(Ordering::Relaxed)
            );
            let _ = writeln!(
                output,
                "needlefs_grpc_requests_total{{method=\"{}\",status=\"error\"}} {}",
                method,
                metrics.requests_error.load(Ordering::Relaxed)
            );
        }

        let _ = writeln!(
            output,
            "# HELP needlefs_grpc_latency_seconds_sum Sum of gRPC request latencies"
        );
        let _ = writeln!(output, "# TYPE needlefs_grpc_latency_seconds_sum counter");
        for (method, metrics) in &methods {
            let sum_us = metrics.latency_sum_us.load(Ordering::Relaxed);
            let _ = writeln!(
                output,
                "needlefs_grpc_latency_seconds_sum{{method=\"{}\"}} {}",
                method,
                sum_us as f64 / 1_000_000.0
            );
        }

        let _ = writeln!(
            output,
            "# HELP needlefs_grpc_bytes_received_total Total bytes received via gRPC"
        );
        let _ = writeln!(output, "# TYPE needlefs_grpc_bytes_received_total counter");
        for (method, metrics) in &methods {
            let bytes = metrics.bytes_received.load(Ordering::Relaxed);
            if bytes > 0 {
                let _ = writeln!(
                    output,
                    "needlefs_grpc_bytes_received_total{{method=\"{}\"}} {}",
                    method, bytes
                );
            }
        }

        let _ = writeln!(
            output,
            "# HELP needlefs_grpc_bytes_sent_total Total bytes sent via gRPC"
        );
        let _ = writeln!(output, "# TYPE needlefs_grpc_bytes_sent_total counter");
        for (method, metrics) in &methods {
            let bytes = metrics.bytes_sent.load(Ordering::Relaxed);
            if bytes > 0 {
                let _ = writeln!(
                    output,
                    "needlefs_grpc_bytes_sent_total{{method=\"{}\"}} {}",
                    method, bytes
                );
            }
        }

        output
    }
}

/// Map a storage error onto a gRPC status
pub fn to_status(err: Error) -> Status {
    match &err {
        Error::InvalidFileId(_) | Error::InvalidArgument(_) | Error::CookieMismatch { .. } => {
            Status::invalid_argument(err.to_string())
        }
        Error::VolumeNotFound(_) | Error::NeedleNotFound { .. } => {
            Status::not_found(err.to_string())
        }
        Error::VolumeAlreadyExists(_) => Status::already_exists(err.to_string()),
        Error::NotAcceptable(_) | Error::VolumeMismatch { .. } | Error::Configuration(_) => {
            Status::failed_precondition(err.to_string())
        }
        Error::Retryable(_) => Status::unavailable(err.to_string()),
        Error::Cancelled => Status::cancelled(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

/// Convert a sync status into its wire form
#[must_use]
pub fn status_to_proto(status: &VolumeSyncStatus) -> VolumeSyncStatusResponse {
    VolumeSyncStatusResponse {
        volume_id: status.volume_id.get(),
        idx_file_size: status.idx_file_size,
        file_count: status.metric.file_count,
        deleted_count: status.metric.deleted_count,
        deleted_bytes: status.metric.deleted_bytes,
        content_bytes: status.metric.content_bytes,
        max_file_key: status.metric.max_file_key.get(),
    }
}

fn needle_entry(fid: &FileId, size: u32) -> Entry {
    let file_id = fid.to_string();
    Entry::file(
        file_id.clone(),
        vec![FileChunk {
            file_id,
            offset: 0,
            size: u64::from(size),
        }],
    )
}

/// Feed file chunks to a follower from a blocking reader task
fn stream_chunks<T, W>(
    chunks: FileChunks,
    volume_id: VolumeId,
    metrics: Arc<RpcMetrics>,
    method: fn(&RpcMetrics) -> &RpcMethodMetrics,
    start: Instant,
    wrap: W,
) -> ReceiverStream<Result<T, Status>>
where
    T: Send + 'static,
    W: Fn(Vec<u8>) -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel(SYNC_STREAM_BUFFER);
    tokio::task::spawn_blocking(move || {
        let mut sent = 0u64;
        for chunk in chunks {
            let message = match chunk {
                Ok(content) => {
                    sent += content.len() as u64;
                    Ok(wrap(content))
                }
                Err(e) => {
                    warn!("Volume {}: sync stream failed: {}", volume_id, e);
                    let _ = tx.blocking_send(Err(to_status(e)));
                    method(&metrics).record(false, start, 0, sent);
                    return;
                }
            };

            if tx.blocking_send(message).is_err() {
                debug!("Volume {}: follower went away after {} bytes", volume_id, sent);
                method(&metrics).record(false, start, 0, sent);
                return;
            }
        }
        method(&metrics).record(true, start, 0, sent);
    });

    ReceiverStream::new(rx)
}

/// Volume server service
pub struct VolumeService {
    store: Arc<Store>,
    notifier: Notifier,
    chunk_size: usize,
    metrics: Arc<RpcMetrics>,
}

impl VolumeService {
    pub fn new(store: Arc<Store>, notifier: Notifier, chunk_size: usize) -> Self {
        info!(
            "Volume service over {:?} ({} volumes, notifications {})",
            store.dir(),
            store.volume_ids().len(),
            if notifier.is_enabled() { "on" } else { "off" }
        );
        Self {
            store,
            notifier,
            chunk_size,
            metrics: Arc::new(RpcMetrics::default()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    #[must_use]
    pub fn rpc_metrics(&self) -> &Arc<RpcMetrics> {
        &self.metrics
    }

    fn parse_file_id(raw: &str) -> Result<FileId, Status> {
        raw.parse::<FileId>()
            .map_err(|e| to_status(Error::InvalidFileId(e)))
    }

    /// Publish a needle change; notification failures never fail the request
    async fn notify(&self, old: Option<&Entry>, new: Option<&Entry>, delete_chunks: bool) {
        if let Err(e) = self.notifier.notify_update_event(old, new, delete_chunks).await {
            warn!("Failed to publish needle event: {}", e);
        }
    }
}

#[tonic::async_trait]
impl VolumeServer for VolumeService {
    async fn batch_delete(
        &self,
        request: Request<BatchDeleteRequest>,
    ) -> Result<Response<BatchDeleteResponse>, Status> {
        let start = Instant::now();
        let req = request.into_inner();
        let bytes_in = req.encoded_len() as u64;

        let results = BatchDeleter::new(self.store.as_ref()).delete(&req.file_ids);
        debug!("BatchDelete: {} ids, {} results", req.file_ids.len(), results.len());

        let resp = BatchDeleteResponse {
            results: results
                .into_iter()
                .map(|r| DeleteResult {
                    file_id: r.file_id,
                    status: i32::from(r.status.http_code()),
                    size: r.size,
                    error: r.error,
                })
                .collect(),
        };
        self.metrics
            .batch_delete
            .record(true, start, bytes_in, resp.encoded_len() as u64);

        Ok(Response::new(resp))
    }

    async fn volume_sync_status(
        &self,
        request: Request<VolumeSyncStatusRequest>,
    ) -> Result<Response<VolumeSyncStatusResponse>, Status> {
        let start = Instant::now();
        let volume_id = VolumeId::new(request.into_inner().volume_id);

        let status = self
            .store
            .volume(volume_id)
            .and_then(|volume| volume.sync_status())
            .map_err(|e| {
                self.metrics.volume_sync_status.record(false, start, 0, 0);
                to_status(e)
            })?;

        let resp = status_to_proto(&status);
        self.metrics
            .volume_sync_status
            .record(true, start, 0, resp.encoded_len() as u64);

        Ok(Response::new(resp))
    }

    type VolumeSyncIndexStream = ReceiverStream<Result<VolumeSyncIndexResponse, Status>>;

    async fn volume_sync_index(
        &self,
        request: Request<VolumeSyncIndexRequest>,
    ) -> Result<Response<Self::VolumeSyncIndexStream>, Status> {
        let start = Instant::now();
        let volume_id = VolumeId::new(request.into_inner().volume_id);

        let chunks = self
            .store
            .volume(volume_id)
            .and_then(|volume| volume.index_snapshot())
            .and_then(|(path, len)| {
                debug!("VolumeSyncIndex: volume {} streaming {} bytes", volume_id, len);
                FileChunks::open(path, len, self.chunk_size)
            })
            .map_err(|e| {
                self.metrics.volume_sync_index.record(false, start, 0, 0);
                to_status(e)
            })?;

        let stream = stream_chunks(
            chunks,
            volume_id,
            Arc::clone(&self.metrics),
            |metrics| &metrics.volume_sync_index,
            start,
            |index_file_content| VolumeSyncIndexResponse { index_file_content },
        );
        Ok(Response::new(stream))
    }

    type VolumeSyncDataStream = ReceiverStream<Result<VolumeSyncDataResponse, Status>>;

    async fn volume_sync_data(
        &self,
        request: Request<VolumeSyncDataRequest>,
    ) -> Result<Response<Self::VolumeSyncDataStream>, Status> {
        let start = Instant::now();
        let volume_id = VolumeId::new(request.into_inner().volume_id);

        let chunks = self
            .store
            .volume(volume_id)
            .and_then(|volume| volume.data_snapshot())
            .and_then(|(path, len)| {
                debug!("VolumeSyncData: volume {} streaming {} bytes", volume_id, len);
                FileChunks::open(path, len, self.chunk_size)
            })
            .map_err(|e| {
                self.metrics.volume_sync_data.record(false, start, 0, 0);
                to_status(e)
            })?;

        let stream = stream_chunks(
            chunks,
            volume_id,
            Arc::clone(&self.metrics),
            |metrics| &metrics.volume_sync_data,
            start,
            |file_content| VolumeSyncDataResponse { file_content },
        );
        Ok(Response::new(stream))
    }

    async fn allocate_volume(
        &self,
        request: Request<AllocateVolumeRequest>,
    ) -> Result<Response<AllocateVolumeResponse>, Status> {
        let start = Instant::now();
        let volume_id = VolumeId::new(request.into_inner().volume_id);

        self.store.allocate_volume(volume_id).map_err(|e| {
            self.metrics.allocate_volume.record(false, start, 0, 0);
            to_status(e)
        })?;
        info!("Allocated volume {}", volume_id);
        self.metrics.allocate_volume.record(true, start, 0, 0);

        Ok(Response::new(AllocateVolumeResponse {}))
    }

    async fn write_needle(
        &self,
        request: Request<WriteNeedleRequest>,
    ) -> Result<Response<WriteNeedleResponse>, Status> {
        let start = Instant::now();
        let req = request.into_inner();
        let bytes_in = req.data.len() as u64;
        let fid = Self::parse_file_id(&req.file_id).inspect_err(|_| {
            self.metrics.write_needle.record(false, start, bytes_in, 0);
        })?;

        let previous = self
            .store
            .volume(fid.volume_id)
            .ok()
            .and_then(|volume| volume.index().get(fid.key));

        let needle = Needle::new(fid.key, fid.cookie, req.data)
            .with_chunk_manifest(req.is_chunk_manifest);
        let size = self
            .store
            .write_needle(fid.volume_id, &needle)
            .map_err(|e| {
                self.metrics.write_needle.record(false, start, bytes_in, 0);
                to_status(e)
            })?;

        debug!("WriteNeedle: {} ({} bytes)", fid, size);
        let old = previous.map(|value| needle_entry(&fid, value.size));
        let entry = needle_entry(&fid, size);
        self.notify(old.as_ref(), Some(&entry), false).await;

        self.metrics.write_needle.record(true, start, bytes_in, 0);
        Ok(Response::new(WriteNeedleResponse { size }))
    }

    async fn read_needle(
        &self,
        request: Request<ReadNeedleRequest>,
    ) -> Result<Response<ReadNeedleResponse>, Status> {
        let start = Instant::now();
        let req = request.into_inner();
        let fid = Self::parse_file_id(&req.file_id).inspect_err(|_| {
            self.metrics.read_needle.record(false, start, 0, 0);
        })?;

        let needle = self
            .store
            .read_volume_needle(fid.volume_id, fid.key)
            .and_then(|needle| {
                // A wrong cookie reads as a missing needle
                if needle.cookie == fid.cookie {
                    Ok(needle)
                } else {
                    Err(Error::NeedleNotFound {
                        volume_id: fid.volume_id,
                        key: fid.key,
                    })
                }
            })
            .map_err(|e| {
                self.metrics.read_needle.record(false, start, 0, 0);
                to_status(e)
            })?;

        let resp = ReadNeedleResponse {
            is_chunk_manifest: needle.is_chunk_manifest(),
            data: needle.data.to_vec(),
        };
        self.metrics
            .read_needle
            .record(true, start, 0, resp.data.len() as u64);

        Ok(Response::new(resp))
    }

    async fn delete_needle(
        &self,
        request: Request<DeleteNeedleRequest>,
    ) -> Result<Response<DeleteNeedleResponse>, Status> {
        let start = Instant::now();
        let req = request.into_inner();
        let fid = Self::parse_file_id(&req.file_id).inspect_err(|_| {
            self.metrics.delete_needle.record(false, start, 0, 0);
        })?;

        let deleted = self.delete_checked(&fid).map_err(|e| {
            self.metrics.delete_needle.record(false, start, 0, 0);
            to_status(e)
        })?;

        let size = match deleted {
            Some(size) => {
                debug!("DeleteNeedle: {} ({} bytes)", fid, size);
                let entry = needle_entry(&fid, size);
                self.notify(Some(&entry), None, true).await;
                size
            }
            None => 0,
        };

        self.metrics.delete_needle.record(true, start, 0, 0);
        Ok(Response::new(DeleteNeedleResponse { size }))
    }
}

impl VolumeService {
    /// Delete a needle after checking its cookie; `None` when it was not live
    fn delete_checked(&self, fid: &FileId) -> needlefs_common::Result<Option<u32>> {
        let needle = match self.store.read_volume_needle(fid.volume_id, fid.key) {
            Ok(needle) => needle,
            Err(Error::NeedleNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        if needle.cookie != fid.cookie {
            return Err(Error::CookieMismatch {
                volume_id: fid.volume_id,
                key: fid.key,
            });
        }
        self.store
            .delete_volume_needle(fid.volume_id, fid.key)
            .map(Some)
    }
}
