//! Follower sync loop

use needlefs_client::{SyncOutcome, VolumeSyncer};
use needlefs_storage::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Counts of one sync round
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub up_to_date: usize,
    pub resynced: usize,
    pub failed: usize,
}

/// Run one sync round over every local volume
pub async fn sync_round(
    syncer: &VolumeSyncer,
    store: &Store,
    cancel: &CancellationToken,
) -> RoundSummary {
    let mut summary = RoundSummary::default();
    for (_, outcome) in syncer.sync_store(store, cancel).await {
        match outcome {
            Ok(SyncOutcome::UpToDate) => summary.up_to_date += 1,
            Ok(SyncOutcome::Resynced { .. }) => summary.resynced += 1,
            Err(_) => summary.failed += 1,
        }
    }
    summary
}

/// Sync with the leader every `interval` until cancelled
pub async fn run_follower(
    syncer: VolumeSyncer,
    store: Arc<Store>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!(
        "Following {} every {}s",
        syncer.leader(),
        interval.as_secs()
    );

    loop {
        let summary = sync_round(&syncer, &store, &cancel).await;
        debug!(
            "Sync round with {}: {} up to date, {} resynced, {} failed",
            syncer.leader(),
            summary.up_to_date,
            summary.resynced,
            summary.failed
        );

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }

    info!("Stopped following {}", syncer.leader());
}
