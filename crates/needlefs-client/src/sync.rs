//! Follower side of the volume sync protocol
//!
//! One sync round for a volume:
//! 1. ask the leader for its index status
//! 2. compare it with the local index
//! 3. if they differ, stream the leader's index log into a staging index
//! 4. stream the leader's data file into a staging data file
//! 5. swap both in once the streams ended cleanly
//!
//! Transport failures surface as `Error::Retryable`; the caller decides
//! when to try again. Cancellation surfaces as `Error::Cancelled`.

use crate::pool::VolumeServerPool;
use needlefs_common::{Error, NeedleId, Result, VolumeId};
use needlefs_proto::volume::volume_server_client::VolumeServerClient;
use needlefs_proto::volume::{
    VolumeSyncDataRequest, VolumeSyncIndexRequest, VolumeSyncStatusRequest,
    VolumeSyncStatusResponse,
};
use needlefs_storage::{NeedleMapMetric, Store, SyncDecision, Volume, VolumeSyncStatus};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::Streaming;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

/// Result of one successful sync round
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    UpToDate,
    Resynced {
        records: u64,
        bytes: u64,
        data_bytes: u64,
    },
}

/// Convert a status reply into the storage type
#[must_use]
pub fn status_from_proto(resp: &VolumeSyncStatusResponse) -> VolumeSyncStatus {
    VolumeSyncStatus {
        volume_id: VolumeId::new(resp.volume_id),
        idx_file_size: resp.idx_file_size,
        metric: NeedleMapMetric {
            file_count: resp.file_count,
            deleted_count: resp.deleted_count,
            deleted_bytes: resp.deleted_bytes,
            content_bytes: resp.content_bytes,
            max_file_key: NeedleId::new(resp.max_file_key),
        },
    }
}

fn from_status(volume_id: VolumeId, status: tonic::Status) -> Error {
    match status.code() {
        tonic::Code::NotFound => Error::VolumeMismatch {
            expected: volume_id,
            actual: format!("unknown volume ({})", status.message()),
        },
        tonic::Code::Cancelled => Error::Cancelled,
        _ => Error::retryable(format!("volume {}: {}", volume_id, status)),
    }
}

/// Ask a leader for the index status of `volume_id`
pub async fn get_volume_sync_status(
    client: &mut VolumeServerClient<Channel>,
    volume_id: VolumeId,
) -> Result<VolumeSyncStatus> {
    let resp = client
        .volume_sync_status(VolumeSyncStatusRequest {
            volume_id: volume_id.get(),
        })
        .await
        .map_err(|status| from_status(volume_id, status))?
        .into_inner();

    let status = status_from_proto(&resp);
    if status.volume_id != volume_id {
        return Err(Error::VolumeMismatch {
            expected: volume_id,
            actual: status.volume_id.to_string(),
        });
    }
    Ok(status)
}

/// Pass every message of a sync stream to `on_chunk` until the leader
/// closes it. Returns the number of bytes received.
async fn drain_stream<T, F>(
    stream: &mut Streaming<T>,
    volume_id: VolumeId,
    cancel: &CancellationToken,
    content: fn(&T) -> &[u8],
    mut on_chunk: F,
) -> Result<u64>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    let mut received = 0u64;
    loop {
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            message = stream.message() => {
                message.map_err(|status| from_status(volume_id, status))?
            }
        };

        match message {
            Some(message) => {
                let chunk = content(&message);
                received += chunk.len() as u64;
                on_chunk(chunk)?;
            }
            None => return Ok(received),
        }
    }
}

/// Stream a leader's index log of `volume_id`, passing every chunk to
/// `on_chunk` as it arrives. Returns the number of bytes received.
pub async fn stream_volume_index<F>(
    client: &mut VolumeServerClient<Channel>,
    volume_id: VolumeId,
    cancel: &CancellationToken,
    on_chunk: F,
) -> Result<u64>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    let request = VolumeSyncIndexRequest {
        volume_id: volume_id.get(),
    };
    let mut stream = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(Error::Cancelled),
        resp = client.volume_sync_index(request) => {
            resp.map_err(|status| from_status(volume_id, status))?.into_inner()
        }
    };

    let received = drain_stream(
        &mut stream,
        volume_id,
        cancel,
        |chunk| chunk.index_file_content.as_slice(),
        on_chunk,
    )
    .await?;
    debug!("Volume {}: received {} index bytes", volume_id, received);
    Ok(received)
}

/// Stream a leader's data file of `volume_id`, passing every chunk to
/// `on_chunk` as it arrives. Returns the number of bytes received.
pub async fn stream_volume_data<F>(
    client: &mut VolumeServerClient<Channel>,
    volume_id: VolumeId,
    cancel: &CancellationToken,
    on_chunk: F,
) -> Result<u64>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    let request = VolumeSyncDataRequest {
        volume_id: volume_id.get(),
    };
    let mut stream = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(Error::Cancelled),
        resp = client.volume_sync_data(request) => {
            resp.map_err(|status| from_status(volume_id, status))?.into_inner()
        }
    };

    let received = drain_stream(
        &mut stream,
        volume_id,
        cancel,
        |chunk| chunk.file_content.as_slice(),
        on_chunk,
    )
    .await?;
    debug!("Volume {}: received {} data bytes", volume_id, received);
    Ok(received)
}

/// Runs sync rounds for local volumes against one leader
pub struct VolumeSyncer {
    pool: Arc<VolumeServerPool>,
    leader: String,
}

impl VolumeSyncer {
    /// `leader` is the leader's HTTP address
    pub fn new(pool: Arc<VolumeServerPool>, leader: impl Into<String>) -> Self {
        Self {
            pool,
            leader: leader.into(),
        }
    }

    #[must_use]
    pub fn leader(&self) -> &str {
        &self.leader
    }

    /// Bring one volume's index and data in line with the leader's
    pub async fn sync_volume(
        &self,
        volume: &Volume,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome> {
        let volume_id = volume.id();
        let mut client = self.pool.get_or_connect(&self.leader).await?;

        let remote = get_volume_sync_status(&mut client, volume_id).await?;
        let local = volume.sync_status()?;
        if SyncDecision::decide(&local, &remote) == SyncDecision::UpToDate {
            debug!("Volume {} is up to date with {}", volume_id, self.leader);
            return Ok(SyncOutcome::UpToDate);
        }

        info!(
            "Volume {}: resyncing from {} (local index {} bytes, leader index {} bytes)",
            volume_id, self.leader, local.idx_file_size, remote.idx_file_size
        );

        // Dropping the staging files on any early return removes them
        let mut staging = volume.begin_resync()?;
        stream_volume_index(&mut client, volume_id, cancel, |chunk| {
            staging.apply_chunk(chunk)
        })
        .await?;
        staging.check_complete()?;

        let mut data = volume.begin_data_resync()?;
        let data_bytes = stream_volume_data(&mut client, volume_id, cancel, |chunk| {
            data.apply_chunk(chunk)
        })
        .await?;

        let cursor = *staging.cursor();
        volume.commit_resync(staging, data)?;

        Ok(SyncOutcome::Resynced {
            records: cursor.records_applied,
            bytes: cursor.bytes_received,
            data_bytes,
        })
    }

    /// One round over every volume of `store`, in ascending id order.
    ///
    /// A failing volume does not stop the round; stops early on cancellation.
    pub async fn sync_store(
        &self,
        store: &Store,
        cancel: &CancellationToken,
    ) -> Vec<(VolumeId, Result<SyncOutcome>)> {
        let mut results = Vec::new();

        for volume_id in store.volume_ids() {
            if cancel.is_cancelled() {
                break;
            }

            let outcome = match store.volume(volume_id) {
                Ok(volume) => self.sync_volume(&volume, cancel).await,
                Err(e) => Err(e),
            };

            match &outcome {
                Ok(SyncOutcome::UpToDate) => {}
                Ok(SyncOutcome::Resynced {
                    records,
                    bytes,
                    data_bytes,
                }) => {
                    info!(
                        "Volume {}: synced {} records ({} index bytes, {} data bytes)",
                        volume_id, records, bytes, data_bytes
                    );
                }
                Err(e) if e.is_retryable() => {
                    self.pool.disconnect(&self.leader).await;
                    warn!(
                        "Volume {}: sync with {} failed, will retry: {}",
                        volume_id, self.leader, e
                    );
                }
                Err(e) => warn!("Volume {}: sync with {} failed: {}", volume_id, self.leader, e),
            }
            results.push((volume_id, outcome));
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_proto() {
        let status = status_from_proto(&VolumeSyncStatusResponse {
            volume_id: 7,
            idx_file_size: 160,
            file_count: 10,
            deleted_count: 2,
            deleted_bytes: 20,
            content_bytes: 80,
            max_file_key: 0xff,
        });

        assert_eq!(status.volume_id, VolumeId::new(7));
        assert_eq!(status.idx_file_size, 160);
        assert_eq!(status.metric.live_count(), 8);
        assert_eq!(status.metric.max_file_key, NeedleId::new(0xff));
    }

    #[test]
    fn test_status_mapping() {
        let vid = VolumeId::new(3);
        assert!(matches!(
            from_status(vid, tonic::Status::not_found("volume 3")),
            Error::VolumeMismatch { .. }
        ));
        assert!(matches!(
            from_status(vid, tonic::Status::cancelled("gone")),
            Error::Cancelled
        ));
        assert!(from_status(vid, tonic::Status::unavailable("down")).is_retryable());
        assert!(from_status(vid, tonic::Status::internal("reset")).is_retryable());
    }
}
