//! Needle index
//!
//! Maps a needle key to its `(offset, size)` in the volume data file:
//! - `NeedleValueMap`: pluggable in-memory backing structure
//! - `NeedleMap`: value map + metrics + index log of one volume
//!
//! Every mutation is appended to the index log before it touches the map,
//! so replaying the log always reconstructs the same map and metrics.

mod btree;
mod compact;

pub use btree::BTreeNeedleMap;
pub use compact::CompactNeedleMap;

use crate::index_file::{IndexLog, IndexRecord, walk_index_file};
use crate::metric::NeedleMapMetric;
use needlefs_common::{Error, NeedleId, NeedleMapKind, Offset, Result, Size};
use parking_lot::RwLock;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A live index entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NeedleValue {
    pub key: NeedleId,
    pub offset: Offset,
    pub size: Size,
}

impl NeedleValue {
    #[must_use]
    pub const fn new(key: NeedleId, offset: Offset, size: Size) -> Self {
        Self { key, offset, size }
    }
}

/// In-memory backing structure of a needle index
pub trait NeedleValueMap: Send + Sync {
    /// Insert or overwrite `key`, returning the previous live value or
    /// `(Offset::ZERO, 0)` when there was none.
    fn set(&mut self, key: NeedleId, offset: Offset, size: Size) -> (Offset, Size);

    /// Remove `key`, returning the freed size if it was live.
    fn delete(&mut self, key: NeedleId) -> Option<Size>;

    fn get(&self, key: NeedleId) -> Option<NeedleValue>;

    /// Walk live entries in ascending key order. A visitor error stops the
    /// walk and is returned.
    fn visit(&self, visitor: &mut dyn FnMut(NeedleValue) -> Result<()>) -> Result<()>;

    /// Live entry count
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Create an empty value map of the given kind
#[must_use]
pub fn create_value_map(kind: NeedleMapKind) -> Box<dyn NeedleValueMap> {
    match kind {
        NeedleMapKind::BTree => Box::new(BTreeNeedleMap::new()),
        NeedleMapKind::Compact => Box::new(CompactNeedleMap::new()),
    }
}

struct Inner {
    map: Box<dyn NeedleValueMap>,
    metric: NeedleMapMetric,
    log: Option<IndexLog>,
}

impl Inner {
    fn record(&mut self, record: &IndexRecord) -> Result<Option<Size>> {
        if let Some(log) = self.log.as_mut() {
            log.append(record)?;
        }

        Ok(self.metric.apply(self.map.as_mut(), record))
    }
}

/// The live needle index of one volume.
///
/// Log, map and metrics change together under one lock, so readers always
/// see the state after some whole prefix of the record history.
pub struct NeedleMap {
    kind: NeedleMapKind,
    path: Option<PathBuf>,
    inner: RwLock<Inner>,
}

impl NeedleMap {
    /// Create an empty index with a fresh log at `path`
    pub fn create(path: impl AsRef<Path>, kind: NeedleMapKind) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let log = IndexLog::create(&path)?;
        debug!("Created needle index {:?} ({})", path, kind);

        Ok(Self::with_parts(
            kind,
            Some(path),
            create_value_map(kind),
            NeedleMapMetric::default(),
            Some(log),
        ))
    }

    /// Rebuild an index by replaying the log at `path`.
    ///
    /// A torn trailing record left by a crash is cut off before the log is
    /// reopened for appends.
    pub fn load(path: impl AsRef<Path>, kind: NeedleMapKind) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut map = create_value_map(kind);
        let mut metric = NeedleMapMetric::default();

        let walk = walk_index_file(&path, |record| {
            metric.apply(map.as_mut(), &record);
            Ok(())
        })?;

        if walk.torn_bytes > 0 {
            warn!(
                "Truncating {} torn bytes at the end of index {:?}",
                walk.torn_bytes, path
            );
            OpenOptions::new()
                .write(true)
                .open(&path)
                .and_then(|file| file.set_len(walk.valid_len))
                .map_err(|e| Error::Storage(format!("failed to truncate index: {}", e)))?;
        }

        let log = IndexLog::open(&path)?;
        info!(
            "Loaded needle index {:?}: {} records, {} live entries",
            path,
            walk.records,
            map.len()
        );

        Ok(Self::with_parts(kind, Some(path), map, metric, Some(log)))
    }

    /// Index without a log
    #[must_use]
    pub fn in_memory(kind: NeedleMapKind) -> Self {
        Self::with_parts(
            kind,
            None,
            create_value_map(kind),
            NeedleMapMetric::default(),
            None,
        )
    }

    fn with_parts(
        kind: NeedleMapKind,
        path: Option<PathBuf>,
        map: Box<dyn NeedleValueMap>,
        metric: NeedleMapMetric,
        log: Option<IndexLog>,
    ) -> Self {
        Self {
            kind,
            path,
            inner: RwLock::new(Inner { map, metric, log }),
        }
    }

    /// Record a live needle. Offset zero is reserved for tombstones.
    pub fn put(&self, key: NeedleId, offset: Offset, size: Size) -> Result<()> {
        if offset.is_zero() {
            return Err(Error::invalid_argument(format!(
                "needle {}: offset 0 is reserved for tombstones",
                key
            )));
        }

        self.inner
            .write()
            .record(&IndexRecord::new(key, offset, size))?;
        Ok(())
    }

    /// Record a delete and return the freed bytes (0 if `key` was not live).
    ///
    /// The tombstone is logged even for absent keys.
    pub fn delete(&self, key: NeedleId) -> Result<Size> {
        let freed = self.inner.write().record(&IndexRecord::tombstone(key))?;
        Ok(freed.unwrap_or(0))
    }

    /// Apply one record exactly as the live operation would
    pub fn replay_record(&self, record: &IndexRecord) -> Result<()> {
        self.inner.write().record(record)?;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, key: NeedleId) -> Option<NeedleValue> {
        self.inner.read().map.get(key)
    }

    /// Walk live entries in ascending key order
    pub fn visit<F>(&self, mut visitor: F) -> Result<()>
    where
        F: FnMut(NeedleValue) -> Result<()>,
    {
        self.inner.read().map.visit(&mut visitor)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn kind(&self) -> NeedleMapKind {
        self.kind
    }

    /// Snapshot of the metrics
    #[must_use]
    pub fn metric(&self) -> NeedleMapMetric {
        self.inner.read().metric
    }

    #[must_use]
    pub fn file_count(&self) -> u64 {
        self.inner.read().metric.file_count
    }

    #[must_use]
    pub fn deleted_count(&self) -> u64 {
        self.inner.read().metric.deleted_count
    }

    #[must_use]
    pub fn deleted_size(&self) -> u64 {
        self.inner.read().metric.deleted_bytes
    }

    #[must_use]
    pub fn content_size(&self) -> u64 {
        self.inner.read().metric.content_bytes
    }

    #[must_use]
    pub fn max_file_key(&self) -> NeedleId {
        self.inner.read().metric.max_file_key
    }

    /// Flush buffered records and return the log length with the metrics
    /// it corresponds to.
    pub fn index_snapshot(&self) -> Result<(u64, NeedleMapMetric)> {
        let mut inner = self.inner.write();
        let len = match inner.log.as_mut() {
            Some(log) => {
                log.flush()?;
                log.len()
            }
            None => 0,
        };
        Ok((len, inner.metric))
    }

    /// Flush buffered records and return the log length
    pub fn index_file_size(&self) -> Result<u64> {
        self.index_snapshot().map(|(len, _)| len)
    }

    #[must_use]
    pub fn index_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn set_index_path(&mut self, path: PathBuf) {
        self.path = Some(path);
    }

    pub fn flush(&self) -> Result<()> {
        match self.inner.write().log.as_mut() {
            Some(log) => log.flush(),
            None => Ok(()),
        }
    }

    /// Flush and fsync the log
    pub fn sync(&self) -> Result<()> {
        match self.inner.write().log.as_mut() {
            Some(log) => log.sync(),
            None => Ok(()),
        }
    }
}
