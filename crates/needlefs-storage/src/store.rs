//! Volume store
//!
//! All volumes of one storage node, kept in a single directory.

use crate::needle::Needle;
use crate::sync::{STAGING_SUFFIX, VolumeSyncStatus};
use crate::volume::Volume;
use needlefs_common::{Error, NeedleId, NeedleMapKind, Result, Size, VolumeId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Needle access needed by request handlers
pub trait VolumeStore: Send + Sync {
    fn read_needle(&self, volume_id: VolumeId, key: NeedleId) -> Result<Needle>;

    /// Delete a needle, returning the freed bytes
    fn delete_needle(&self, volume_id: VolumeId, key: NeedleId) -> Result<Size>;
}

/// Volumes of one node
pub struct Store {
    dir: PathBuf,
    kind: NeedleMapKind,
    volumes: RwLock<HashMap<VolumeId, Arc<Volume>>>,
}

impl Store {
    /// Open every volume found in `dir`, creating the directory if needed
    pub fn open(dir: impl AsRef<Path>, kind: NeedleMapKind) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Storage(format!("failed to create store dir: {}", e)))?;

        let mut volumes = HashMap::new();
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| Error::Storage(format!("failed to read store dir: {}", e)))?;

        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            // Leftover from a sync interrupted by a crash
            if name.ends_with(&format!(".idx.{}", STAGING_SUFFIX))
                || name.ends_with(&format!(".dat.{}", STAGING_SUFFIX))
            {
                warn!("Removing stale staging file {:?}", path);
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Failed to remove {:?}: {}", path, e);
                }
                continue;
            }

            let Some(id) = name
                .strip_suffix(".dat")
                .and_then(|stem| stem.parse::<VolumeId>().ok())
            else {
                continue;
            };

            let volume = Volume::open(&dir, id, kind)?;
            volumes.insert(id, Arc::new(volume));
        }

        info!("Opened store {:?} with {} volumes ({})", dir, volumes.len(), kind);

        Ok(Self {
            dir,
            kind,
            volumes: RwLock::new(volumes),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub const fn kind(&self) -> NeedleMapKind {
        self.kind
    }

    /// Create a new volume
    pub fn allocate_volume(&self, id: VolumeId) -> Result<Arc<Volume>> {
        let mut volumes = self.volumes.write();
        if volumes.contains_key(&id) {
            return Err(Error::VolumeAlreadyExists(id));
        }

        let volume = Arc::new(Volume::create(&self.dir, id, self.kind)?);
        volumes.insert(id, Arc::clone(&volume));
        Ok(volume)
    }

    pub fn volume(&self, id: VolumeId) -> Result<Arc<Volume>> {
        self.volumes
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::VolumeNotFound(id))
    }

    /// Volume ids in ascending order
    #[must_use]
    pub fn volume_ids(&self) -> Vec<VolumeId> {
        let mut ids: Vec<_> = self.volumes.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn write_needle(&self, volume_id: VolumeId, needle: &Needle) -> Result<Size> {
        self.volume(volume_id)?.write_needle(needle)
    }

    pub fn read_volume_needle(&self, volume_id: VolumeId, key: NeedleId) -> Result<Needle> {
        self.volume(volume_id)?.read_needle(key)
    }

    pub fn delete_volume_needle(&self, volume_id: VolumeId, key: NeedleId) -> Result<Size> {
        self.volume(volume_id)?.delete_needle(key)
    }

    /// Sync status of every volume, by ascending id
    pub fn status(&self) -> Result<Vec<VolumeSyncStatus>> {
        self.volume_ids()
            .into_iter()
            .map(|id| self.volume(id)?.sync_status())
            .collect()
    }

    /// Fsync every volume
    pub fn sync(&self) -> Result<()> {
        let volumes: Vec<_> = self.volumes.read().values().cloned().collect();
        for volume in volumes {
            volume.sync()?;
        }
        Ok(())
    }
}

impl VolumeStore for Store {
    fn read_needle(&self, volume_id: VolumeId, key: NeedleId) -> Result<Needle> {
        self.read_volume_needle(volume_id, key)
    }

    fn delete_needle(&self, volume_id: VolumeId, key: NeedleId) -> Result<Size> {
        self.delete_volume_needle(volume_id, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use needlefs_common::Cookie;
    use tempfile::tempdir;

    #[test]
    fn test_allocate_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = Store::open(dir.path(), NeedleMapKind::BTree).unwrap();
            store.allocate_volume(VolumeId::new(3)).unwrap();
            store.allocate_volume(VolumeId::new(1)).unwrap();
            assert!(matches!(
                store.allocate_volume(VolumeId::new(1)),
                Err(Error::VolumeAlreadyExists(_))
            ));

            let needle = Needle::new(NeedleId::new(5), Cookie::new(9), &b"data"[..]);
            store.write_needle(VolumeId::new(3), &needle).unwrap();
            store.sync().unwrap();
        }

        let store = Store::open(dir.path(), NeedleMapKind::BTree).unwrap();
        assert_eq!(store.volume_ids(), vec![VolumeId::new(1), VolumeId::new(3)]);
        let needle = store
            .read_volume_needle(VolumeId::new(3), NeedleId::new(5))
            .unwrap();
        assert_eq!(&needle.data[..], b"data");

        let status = store.status().unwrap();
        assert_eq!(status.len(), 2);
        assert_eq!(status[1].metric.file_count, 1);
    }

    #[test]
    fn test_unknown_volume() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), NeedleMapKind::BTree).unwrap();
        let err = store
            .read_volume_needle(VolumeId::new(8), NeedleId::new(1))
            .unwrap_err();
        assert!(matches!(err, Error::VolumeNotFound(_)));
        assert_eq!(err.http_status_code(), 404);
    }

    #[test]
    fn test_open_removes_stale_staging_files() {
        let dir = tempdir().unwrap();
        let stale = dir.path().join("2.idx.sync");
        let stale_data = dir.path().join("2.dat.sync");
        std::fs::write(&stale, [0u8; 16]).unwrap();
        std::fs::write(&stale_data, [0u8; 8]).unwrap();

        let store = Store::open(dir.path(), NeedleMapKind::Compact).unwrap();
        assert!(!stale.exists());
        assert!(!stale_data.exists());
        assert!(store.volume_ids().is_empty());
    }
}
