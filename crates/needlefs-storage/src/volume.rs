//! Volumes: one append-only data file plus its needle index
//!
//! Files of volume `<vid>` in the store directory:
//! - `<vid>.dat`: superblock followed by padded needle records
//! - `<vid>.idx`: index log (see [`crate::index_file`])
//!
//! All mutations (needle writes, deletes, resync commits) serialize on the
//! volume's write mutex. Reads go through the index's own lock. A resync
//! replaces both files, so the data handle sits behind its own lock.

use crate::needle::{Needle, NEEDLE_HEADER_SIZE, disk_size};
use crate::needle_map::NeedleMap;
use crate::sync::{StagingData, StagingIndex, VolumeSyncStatus};
use needlefs_common::{
    Cookie, Error, NEEDLE_PADDING_SIZE, NeedleId, NeedleMapKind, Offset, Result, Size, VolumeId,
};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Superblock size; also keeps every needle off offset 0
pub const SUPERBLOCK_SIZE: u64 = 8;

/// Data file format version written to new volumes
pub const CURRENT_VERSION: u8 = 3;

/// `<dir>/<vid>.dat`
#[must_use]
pub fn data_path(dir: &Path, id: VolumeId) -> PathBuf {
    dir.join(format!("{}.dat", id))
}

/// `<dir>/<vid>.idx`
#[must_use]
pub fn index_path(dir: &Path, id: VolumeId) -> PathBuf {
    dir.join(format!("{}.idx", id))
}

/// One volume
pub struct Volume {
    id: VolumeId,
    dir: PathBuf,
    kind: NeedleMapKind,
    version: u8,
    data: RwLock<File>,
    index: RwLock<Arc<NeedleMap>>,
    /// End of the data file; held while mutating
    append_at: Mutex<u64>,
}

impl Volume {
    /// Create a new, empty volume
    pub fn create(dir: impl AsRef<Path>, id: VolumeId, kind: NeedleMapKind) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let dat = data_path(&dir, id);

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&dat)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => Error::VolumeAlreadyExists(id),
                _ => Error::Storage(format!("failed to create {:?}: {}", dat, e)),
            })?;

        let mut superblock = [0u8; SUPERBLOCK_SIZE as usize];
        superblock[0] = CURRENT_VERSION;
        data.write_all_at(&superblock, 0)?;
        data.sync_all()?;

        let index = NeedleMap::create(index_path(&dir, id), kind)?;
        info!("Created volume {} in {:?}", id, dir);

        Ok(Self {
            id,
            dir,
            kind,
            version: CURRENT_VERSION,
            data: RwLock::new(data),
            index: RwLock::new(Arc::new(index)),
            append_at: Mutex::new(SUPERBLOCK_SIZE),
        })
    }

    /// Open an existing volume and load its index
    pub fn open(dir: impl AsRef<Path>, id: VolumeId, kind: NeedleMapKind) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let dat = data_path(&dir, id);

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&dat)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::VolumeNotFound(id),
                _ => Error::Storage(format!("failed to open {:?}: {}", dat, e)),
            })?;

        let mut superblock = [0u8; SUPERBLOCK_SIZE as usize];
        data.read_exact_at(&mut superblock, 0).map_err(|e| {
            Error::DataCorruption(format!("volume {} superblock unreadable: {}", id, e))
        })?;
        let version = superblock[0];

        let len = data.metadata()?.len();
        let append_at = len.div_ceil(NEEDLE_PADDING_SIZE) * NEEDLE_PADDING_SIZE;
        if append_at != len {
            warn!(
                "Volume {}: data file length {} is not aligned, appending at {}",
                id, len, append_at
            );
        }

        let index = NeedleMap::load(index_path(&dir, id), kind)?;
        info!(
            "Opened volume {} (version {}): {} needles, {} bytes of data",
            id,
            version,
            index.len(),
            len
        );

        Ok(Self {
            id,
            dir,
            kind,
            version,
            data: RwLock::new(data),
            index: RwLock::new(Arc::new(index)),
            append_at: Mutex::new(append_at),
        })
    }

    #[must_use]
    pub const fn id(&self) -> VolumeId {
        self.id
    }

    #[must_use]
    pub const fn kind(&self) -> NeedleMapKind {
        self.kind
    }

    #[must_use]
    pub const fn version(&self) -> u8 {
        self.version
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current needle index
    #[must_use]
    pub fn index(&self) -> Arc<NeedleMap> {
        Arc::clone(&self.index.read())
    }

    /// Bytes of the data file, superblock included
    #[must_use]
    pub fn data_size(&self) -> u64 {
        *self.append_at.lock()
    }

    /// Append a needle and index it.
    ///
    /// Overwriting a live needle requires the same cookie.
    pub fn write_needle(&self, needle: &Needle) -> Result<Size> {
        let size = needle.size()?;
        let bytes = needle.to_bytes()?;

        let mut append_at = self.append_at.lock();
        let index = self.index();

        if let Some(existing) = index.get(needle.id) {
            let (cookie, _, _) = self.read_header(existing.offset)?;
            if cookie != needle.cookie {
                return Err(Error::CookieMismatch {
                    volume_id: self.id,
                    key: needle.id,
                });
            }
        }

        let offset = Offset::from_actual(*append_at)
            .ok_or_else(|| Error::storage(format!("volume {} is full", self.id)))?;
        self.data
            .read()
            .write_all_at(&bytes, *append_at)
            .map_err(|e| Error::Storage(format!("volume {} write failed: {}", self.id, e)))?;
        index.put(needle.id, offset, size)?;
        *append_at += bytes.len() as u64;

        debug!(
            "Volume {}: wrote needle {} ({} bytes) at {:?}",
            self.id, needle.id, size, offset
        );
        Ok(size)
    }

    /// Read and verify a live needle
    pub fn read_needle(&self, key: NeedleId) -> Result<Needle> {
        let value = self.index().get(key).ok_or(Error::NeedleNotFound {
            volume_id: self.id,
            key,
        })?;

        let mut buf = vec![0u8; disk_size(value.size) as usize];
        self.data
            .read()
            .read_exact_at(&mut buf, value.offset.to_actual())
            .map_err(|e| {
                Error::DataCorruption(format!(
                    "volume {} needle {} unreadable at {:?}: {}",
                    self.id, key, value.offset, e
                ))
            })?;

        let needle = Needle::from_bytes(&buf)?;
        if needle.id != key {
            return Err(Error::DataCorruption(format!(
                "volume {}: index points needle {} at a record for {}",
                self.id, key, needle.id
            )));
        }
        Ok(needle)
    }

    fn read_header(&self, offset: Offset) -> Result<(Cookie, NeedleId, Size)> {
        let mut header = [0u8; NEEDLE_HEADER_SIZE];
        self.data.read().read_exact_at(&mut header, offset.to_actual())?;
        Needle::header_from_bytes(&header)
    }

    /// Delete a needle, returning the freed bytes (0 if it was not live)
    pub fn delete_needle(&self, key: NeedleId) -> Result<Size> {
        let _append_at = self.append_at.lock();
        let index = self.index();

        if index.get(key).is_none() {
            return Ok(0);
        }
        let freed = index.delete(key)?;
        debug!("Volume {}: deleted needle {} ({} bytes)", self.id, key, freed);
        Ok(freed)
    }

    /// Index state for sync peers
    pub fn sync_status(&self) -> Result<VolumeSyncStatus> {
        let (idx_file_size, metric) = self.index().index_snapshot()?;
        Ok(VolumeSyncStatus {
            volume_id: self.id,
            idx_file_size,
            metric,
        })
    }

    /// Path and length of a consistent index log prefix to stream
    pub fn index_snapshot(&self) -> Result<(PathBuf, u64)> {
        let index = self.index();
        let len = index.index_file_size()?;
        let path = index
            .index_path()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| index_path(&self.dir, self.id));
        Ok((path, len))
    }

    /// Path and length of the data file to stream.
    ///
    /// Taken after [`Self::index_snapshot`], it covers every offset of that
    /// index prefix.
    pub fn data_snapshot(&self) -> Result<(PathBuf, u64)> {
        let len = *self.append_at.lock();
        Ok((data_path(&self.dir, self.id), len))
    }

    /// Start rebuilding this volume's index from a leader stream
    pub fn begin_resync(&self) -> Result<StagingIndex> {
        StagingIndex::create(&self.dir, self.id, self.kind)
    }

    /// Start copying this volume's data file from a leader stream
    pub fn begin_data_resync(&self) -> Result<StagingData> {
        StagingData::create(&self.dir, self.id)
    }

    /// Replace the live index and data file with fully received staging
    /// copies.
    ///
    /// The staged data must cover every live entry of the staged index;
    /// otherwise nothing is installed and both staging files are removed.
    pub fn commit_resync(&self, staging: StagingIndex, data: StagingData) -> Result<()> {
        for staged in [staging.volume_id(), data.volume_id()] {
            if staged != self.id {
                return Err(Error::VolumeMismatch {
                    expected: self.id,
                    actual: staged.to_string(),
                });
            }
        }

        let mut append_at = self.append_at.lock();
        staging.check_complete()?;
        let needed = staging.data_end()?.max(SUPERBLOCK_SIZE);
        let data_len = data.len();
        if data_len < needed {
            return Err(Error::DataCorruption(format!(
                "volume {}: synced data ends at {} but the synced index needs {}",
                self.id, data_len, needed
            )));
        }

        let cursor = *staging.cursor();
        let file = data.commit(&data_path(&self.dir, self.id))?;
        let map = staging.commit(&index_path(&self.dir, self.id))?;
        let live = map.len();

        *self.data.write() = file;
        *self.index.write() = Arc::new(map);
        *append_at = data_len.div_ceil(NEEDLE_PADDING_SIZE) * NEEDLE_PADDING_SIZE;

        info!(
            "Volume {}: installed synced index ({} records, {} bytes, {} live needles) and {} bytes of data",
            self.id, cursor.records_applied, cursor.bytes_received, live, data_len
        );
        Ok(())
    }

    /// Flush the index log and fsync both files
    pub fn sync(&self) -> Result<()> {
        let _append_at = self.append_at.lock();
        self.index().sync()?;
        self.data.read().sync_data()?;
        Ok(())
    }
}
