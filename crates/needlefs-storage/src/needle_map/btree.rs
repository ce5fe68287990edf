//! B-tree backed needle value map

use super::{NeedleValue, NeedleValueMap};
use needlefs_common::{NeedleId, Offset, Result, Size};
use std::collections::BTreeMap;

/// Needle value map over a `BTreeMap`; deleted keys are removed outright.
#[derive(Debug, Default)]
pub struct BTreeNeedleMap {
    tree: BTreeMap<NeedleId, (Offset, Size)>,
}

impl BTreeNeedleMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl NeedleValueMap for BTreeNeedleMap {
    fn set(&mut self, key: NeedleId, offset: Offset, size: Size) -> (Offset, Size) {
        self.tree
            .insert(key, (offset, size))
            .unwrap_or((Offset::ZERO, 0))
    }

    fn delete(&mut self, key: NeedleId) -> Option<Size> {
        self.tree.remove(&key).map(|(_, size)| size)
    }

    fn get(&self, key: NeedleId) -> Option<NeedleValue> {
        self.tree
            .get(&key)
            .map(|&(offset, size)| NeedleValue::new(key, offset, size))
    }

    fn visit(&self, visitor: &mut dyn FnMut(NeedleValue) -> Result<()>) -> Result<()> {
        for (&key, &(offset, size)) in &self.tree {
            visitor(NeedleValue::new(key, offset, size))?;
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.tree.len()
    }
}
