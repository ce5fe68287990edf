//! Admin HTTP endpoints

use crate::service::RpcMetrics;
use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use needlefs_storage::{Store, VolumeSyncStatus};
use serde::Serialize;
use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Version reported by `/status` and `/stats/disk`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state of the admin handlers
pub struct AdminState {
    pub store: Arc<Store>,
    pub rpc_metrics: Arc<RpcMetrics>,
    pub start_time: Instant,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusReport {
    pub version: &'static str,
    pub volumes: Vec<VolumeSyncStatus>,
}

/// Usage of the file system holding a directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DiskStatus {
    pub dir: String,
    pub all: u64,
    pub used: u64,
    pub free: u64,
}

impl DiskStatus {
    pub fn of(dir: &Path) -> nix::Result<Self> {
        let stat = nix::sys::statvfs::statvfs(dir)?;
        let block_size = stat.fragment_size() as u64;
        let all = stat.blocks() as u64 * block_size;
        let free = stat.blocks_free() as u64 * block_size;
        Ok(Self {
            dir: dir.display().to_string(),
            all,
            used: all.saturating_sub(free),
            free,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiskReport {
    pub version: &'static str,
    pub disk_statuses: Vec<DiskStatus>,
}

pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/stats/disk", get(disk_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn status_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    match state.store.status() {
        Ok(volumes) => Ok(Json(StatusReport {
            version: VERSION,
            volumes,
        })),
        Err(e) => {
            warn!("Failed to collect volume status: {}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

async fn disk_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let dir = std::fs::canonicalize(state.store.dir())
        .unwrap_or_else(|_| state.store.dir().to_path_buf());

    let mut disk_statuses = Vec::new();
    match DiskStatus::of(&dir) {
        Ok(status) => disk_statuses.push(status),
        Err(e) => warn!("statvfs {:?} failed: {}", dir, e),
    }

    Json(DiskReport {
        version: VERSION,
        disk_statuses,
    })
}

async fn health_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    if state.store.status().is_ok() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "UNHEALTHY")
    }
}

async fn metrics_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let mut output = String::with_capacity(8 * 1024);

    let _ = writeln!(output, "# HELP needlefs_uptime_seconds Volume server uptime in seconds");
    let _ = writeln!(output, "# TYPE needlefs_uptime_seconds counter");
    let _ = writeln!(
        output,
        "needlefs_uptime_seconds {}",
        state.start_time.elapsed().as_secs()
    );

    let volumes = state.store.status().unwrap_or_else(|e| {
        warn!("Failed to collect volume metrics: {}", e);
        Vec::new()
    });

    let gauges: [(&str, &str, fn(&VolumeSyncStatus) -> u64); 6] = [
        ("needlefs_volume_file_count", "Needles ever written", |s| s.metric.file_count),
        ("needlefs_volume_deleted_count", "Needles deleted", |s| s.metric.deleted_count),
        ("needlefs_volume_deleted_bytes", "Bytes of deleted needles", |s| s.metric.deleted_bytes),
        ("needlefs_volume_content_bytes", "Bytes ever written", |s| s.metric.content_bytes),
        ("needlefs_volume_max_file_key", "Largest needle key", |s| s.metric.max_file_key.get()),
        ("needlefs_volume_index_bytes", "Index log size", |s| s.idx_file_size),
    ];
    for (name, help, value) in gauges {
        let _ = writeln!(output, "# HELP {} {}", name, help);
        let _ = writeln!(output, "# TYPE {} gauge", name);
        for volume in &volumes {
            let _ = writeln!(
                output,
                "{}{{volume=\"{}\"}} {}",
                name,
                volume.volume_id,
                value(volume)
            );
        }
    }

    output.push_str(&state.rpc_metrics.export_prometheus());

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        output,
    )
}
