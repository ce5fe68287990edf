//! Needle index usage metrics
//!
//! Metrics are maintained incrementally on every index mutation and can be
//! rebuilt from the index log alone. Both paths apply the same rules, so a
//! fast load of a log yields exactly the counters the live index reached.

use crate::index_file::{IndexRecord, walk_index_file};
use crate::needle_map::{NeedleValueMap, create_value_map};
use needlefs_common::{NeedleId, NeedleMapKind, Offset, Result, Size};
use serde::Serialize;
use std::path::Path;

/// Usage counters of one needle index
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NeedleMapMetric {
    /// Lifetime inserts, overwrites included
    pub file_count: u64,
    /// Entries removed by delete or superseded by overwrite
    pub deleted_count: u64,
    /// Bytes of removed or superseded entries
    pub deleted_bytes: u64,
    /// Bytes of live entries
    pub content_bytes: u64,
    /// Largest key ever set; tombstones never raise it
    pub max_file_key: NeedleId,
}

impl NeedleMapMetric {
    /// Account for a set of `key` that replaced `previous`
    pub fn on_set(&mut self, key: NeedleId, size: Size, previous: (Offset, Size)) {
        self.max_file_key = self.max_file_key.max(key);
        self.file_count += 1;
        self.content_bytes += u64::from(size);

        let (prev_offset, prev_size) = previous;
        if !prev_offset.is_zero() {
            self.deleted_count += 1;
            self.deleted_bytes += u64::from(prev_size);
            self.content_bytes = self.content_bytes.saturating_sub(u64::from(prev_size));
        }
    }

    /// Account for a delete that freed `freed` bytes, if anything was live
    pub fn on_delete(&mut self, freed: Option<Size>) {
        if let Some(size) = freed {
            self.deleted_count += 1;
            self.deleted_bytes += u64::from(size);
            self.content_bytes = self.content_bytes.saturating_sub(u64::from(size));
        }
    }

    /// Apply one record to `map` and account for it.
    ///
    /// Returns the bytes freed by a tombstone, if the key was live.
    pub fn apply(&mut self, map: &mut dyn NeedleValueMap, record: &IndexRecord) -> Option<Size> {
        if record.is_tombstone() {
            let freed = map.delete(record.key);
            self.on_delete(freed);
            freed
        } else {
            let previous = map.set(record.key, record.offset, record.size);
            self.on_set(record.key, record.size, previous);
            None
        }
    }

    /// Live entry count implied by the counters
    #[must_use]
    pub const fn live_count(&self) -> u64 {
        self.file_count.saturating_sub(self.deleted_count)
    }

    /// Re-derive metrics from an index log file alone.
    ///
    /// A torn trailing record is ignored.
    pub fn from_index_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut map = create_value_map(NeedleMapKind::BTree);
        let mut metric = Self::default();
        walk_index_file(path, |record| {
            metric.apply(map.as_mut(), &record);
            Ok(())
        })?;
        Ok(metric)
    }
}

/// Replay `records` into a fresh value map of `kind`
pub fn fast_load<I>(kind: NeedleMapKind, records: I) -> (Box<dyn NeedleValueMap>, NeedleMapMetric)
where
    I: IntoIterator<Item = IndexRecord>,
{
    let mut map = create_value_map(kind);
    let mut metric = NeedleMapMetric::default();
    for record in records {
        metric.apply(map.as_mut(), &record);
    }
    (map, metric)
}
