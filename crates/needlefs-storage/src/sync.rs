//! Follower-side volume sync
//!
//! A follower compares its index with the leader's ([`SyncDecision`]), and
//! when they differ rebuilds the whole index from the leader's log stream in
//! a [`StagingIndex`], then copies the leader's data file into a
//! [`StagingData`], both next to the live files. The live pair is only
//! replaced once both streams ended cleanly; staging files dropped before
//! commit are removed.

use crate::index_file::RecordReassembler;
use crate::metric::NeedleMapMetric;
use crate::needle::disk_size;
use crate::needle_map::NeedleMap;
use needlefs_common::{Error, NeedleMapKind, Result, VolumeId};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Suffix of the staging index file next to `<vid>.idx`
pub const STAGING_SUFFIX: &str = "sync";

/// Index state of one volume as reported to sync peers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct VolumeSyncStatus {
    pub volume_id: VolumeId,
    /// Index log length in bytes
    pub idx_file_size: u64,
    #[serde(flatten)]
    pub metric: NeedleMapMetric,
}

/// Outcome of comparing a local index with the leader's
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncDecision {
    UpToDate,
    FullResync,
}

impl SyncDecision {
    #[must_use]
    pub fn decide(local: &VolumeSyncStatus, remote: &VolumeSyncStatus) -> Self {
        if local.idx_file_size == remote.idx_file_size && local.metric == remote.metric {
            Self::UpToDate
        } else {
            Self::FullResync
        }
    }
}

/// Progress of one sync session
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncCursor {
    pub bytes_received: u64,
    pub records_applied: u64,
    pub chunks_received: u64,
}

/// Index being rebuilt from a leader stream
pub struct StagingIndex {
    volume_id: VolumeId,
    path: PathBuf,
    map: Option<NeedleMap>,
    reassembler: RecordReassembler,
    cursor: SyncCursor,
}

impl StagingIndex {
    /// Start an empty staging index at `<dir>/<vid>.idx.sync`
    pub fn create(dir: impl AsRef<Path>, volume_id: VolumeId, kind: NeedleMapKind) -> Result<Self> {
        let path = staging_path(dir.as_ref(), volume_id);
        let map = NeedleMap::create(&path, kind)?;
        debug!("Volume {}: staging index at {:?}", volume_id, path);

        Ok(Self {
            volume_id,
            path,
            map: Some(map),
            reassembler: RecordReassembler::new(),
            cursor: SyncCursor::default(),
        })
    }

    /// Feed one stream chunk; chunk boundaries need not align with records
    pub fn apply_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let map = self
            .map
            .as_ref()
            .ok_or_else(|| Error::internal("staging index already committed"))?;

        let applied = self
            .reassembler
            .push(chunk, |record| map.replay_record(&record))?;

        self.cursor.chunks_received += 1;
        self.cursor.bytes_received += chunk.len() as u64;
        self.cursor.records_applied += applied;
        Ok(())
    }

    #[must_use]
    pub const fn cursor(&self) -> &SyncCursor {
        &self.cursor
    }

    #[must_use]
    pub const fn volume_id(&self) -> VolumeId {
        self.volume_id
    }

    /// Metrics of everything applied so far
    #[must_use]
    pub fn metric(&self) -> NeedleMapMetric {
        self.map.as_ref().map(NeedleMap::metric).unwrap_or_default()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fails with `CorruptStream` if the stream so far ends mid-record
    pub fn check_complete(&self) -> Result<()> {
        match self.reassembler.pending() {
            0 => Ok(()),
            leftover => Err(Error::CorruptStream { leftover }),
        }
    }

    /// Data file length needed by the live entries applied so far
    pub fn data_end(&self) -> Result<u64> {
        let mut end = 0;
        if let Some(map) = &self.map {
            map.visit(|value| {
                end = end.max(value.offset.to_actual() + disk_size(value.size));
                Ok(())
            })?;
        }
        Ok(end)
    }

    /// Finish the stream and move the staging log over `target`.
    ///
    /// Fails with `CorruptStream` if the stream ended mid-record; the staging
    /// file is removed on any failure.
    pub(crate) fn commit(mut self, target: &Path) -> Result<NeedleMap> {
        self.check_complete()?;

        let mut map = self
            .map
            .take()
            .ok_or_else(|| Error::internal("staging index already committed"))?;

        let renamed = map.sync().and_then(|()| {
            std::fs::rename(&self.path, target)
                .map_err(|e| Error::Storage(format!("failed to install synced index: {}", e)))
        });
        if let Err(e) = renamed {
            drop(map);
            self.remove_file();
            return Err(e);
        }

        map.set_index_path(target.to_path_buf());
        Ok(map)
    }

    fn remove_file(&self) {
        remove_staging_file(&self.path);
    }
}

impl Drop for StagingIndex {
    fn drop(&mut self) {
        if let Some(map) = self.map.take() {
            drop(map);
            self.remove_file();
        }
    }
}

/// `<dir>/<vid>.idx.sync`
#[must_use]
pub fn staging_path(dir: &Path, volume_id: VolumeId) -> PathBuf {
    dir.join(format!("{}.idx.{}", volume_id, STAGING_SUFFIX))
}

/// `<dir>/<vid>.dat.sync`
#[must_use]
pub fn staging_data_path(dir: &Path, volume_id: VolumeId) -> PathBuf {
    dir.join(format!("{}.dat.{}", volume_id, STAGING_SUFFIX))
}

/// Data file being copied from a leader stream
pub struct StagingData {
    volume_id: VolumeId,
    path: PathBuf,
    file: Option<File>,
    len: u64,
}

impl StagingData {
    /// Start an empty staging data file at `<dir>/<vid>.dat.sync`
    pub fn create(dir: impl AsRef<Path>, volume_id: VolumeId) -> Result<Self> {
        let path = staging_data_path(dir.as_ref(), volume_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to create {:?}: {}", path, e)))?;
        debug!("Volume {}: staging data at {:?}", volume_id, path);

        Ok(Self {
            volume_id,
            path,
            file: Some(file),
            len: 0,
        })
    }

    /// Append one stream chunk
    pub fn apply_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::internal("staging data already committed"))?;
        file.write_all(chunk)
            .map_err(|e| Error::Storage(format!("failed to stage volume data: {}", e)))?;
        self.len += chunk.len() as u64;
        Ok(())
    }

    /// Bytes received so far
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn volume_id(&self) -> VolumeId {
        self.volume_id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fsync and move the staging file over `target`; the returned handle
    /// refers to the installed file
    pub(crate) fn commit(mut self, target: &Path) -> Result<File> {
        let file = self
            .file
            .take()
            .ok_or_else(|| Error::internal("staging data already committed"))?;

        let renamed = file.sync_all().map_err(Error::from).and_then(|()| {
            std::fs::rename(&self.path, target)
                .map_err(|e| Error::Storage(format!("failed to install synced data: {}", e)))
        });
        if let Err(e) = renamed {
            drop(file);
            remove_staging_file(&self.path);
            return Err(e);
        }
        Ok(file)
    }
}

impl Drop for StagingData {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
            remove_staging_file(&self.path);
        }
    }
}

fn remove_staging_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed staging file {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove staging file {:?}: {}", path, e),
    }
}
