//! Compact needle value map
//!
//! Needle keys are mostly assigned in increasing order, so most inserts land
//! at the end of a sorted vector of fixed-width entries. Keys that arrive out
//! of order go to a small `BTreeMap` overflow. Every key lives in exactly one
//! of the two.
//!
//! Deleting a key in the vector clears its `live` flag instead of shifting
//! the tail; a later `set` on the same key revives the slot.

use super::{NeedleValue, NeedleValueMap};
use needlefs_common::{NeedleId, Offset, Result, Size};
use std::collections::BTreeMap;
use std::iter::Peekable;

#[derive(Clone, Copy, Debug)]
struct Slot {
    key: NeedleId,
    offset: Offset,
    size: Size,
    live: bool,
}

impl Slot {
    const fn value(&self) -> NeedleValue {
        NeedleValue::new(self.key, self.offset, self.size)
    }
}

#[derive(Debug, Default)]
pub struct CompactNeedleMap {
    /// Strictly ascending by key
    sorted: Vec<Slot>,
    /// Keys that arrived below the tail of `sorted`
    overflow: BTreeMap<NeedleId, (Offset, Size)>,
    live: usize,
}

impl CompactNeedleMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn find(&self, key: NeedleId) -> Option<usize> {
        self.sorted.binary_search_by_key(&key, |slot| slot.key).ok()
    }
}

impl NeedleValueMap for CompactNeedleMap {
    fn set(&mut self, key: NeedleId, offset: Offset, size: Size) -> (Offset, Size) {
        let appends = self.sorted.last().is_none_or(|tail| key > tail.key);
        if appends {
            self.sorted.push(Slot {
                key,
                offset,
                size,
                live: true,
            });
            self.live += 1;
            return (Offset::ZERO, 0);
        }

        if let Some(idx) = self.find(key) {
            let slot = &mut self.sorted[idx];
            let previous = if slot.live {
                (slot.offset, slot.size)
            } else {
                self.live += 1;
                (Offset::ZERO, 0)
            };
            *slot = Slot {
                key,
                offset,
                size,
                live: true,
            };
            return previous;
        }

        match self.overflow.insert(key, (offset, size)) {
            Some(previous) => previous,
            None => {
                self.live += 1;
                (Offset::ZERO, 0)
            }
        }
    }

    fn delete(&mut self, key: NeedleId) -> Option<Size> {
        let freed = match self.find(key) {
            Some(idx) => {
                let slot = &mut self.sorted[idx];
                if !slot.live {
                    return None;
                }
                slot.live = false;
                Some(slot.size)
            }
            None => self.overflow.remove(&key).map(|(_, size)| size),
        };
        if freed.is_some() {
            self.live -= 1;
        }
        freed
    }

    fn get(&self, key: NeedleId) -> Option<NeedleValue> {
        match self.find(key) {
            Some(idx) => {
                let slot = &self.sorted[idx];
                slot.live.then(|| slot.value())
            }
            None => self
                .overflow
                .get(&key)
                .map(|&(offset, size)| NeedleValue::new(key, offset, size)),
        }
    }

    fn visit(&self, visitor: &mut dyn FnMut(NeedleValue) -> Result<()>) -> Result<()> {
        let sorted = self
            .sorted
            .iter()
            .filter(|slot| slot.live)
            .map(Slot::value);
        let overflow = self
            .overflow
            .iter()
            .map(|(&key, &(offset, size))| NeedleValue::new(key, offset, size));

        for value in MergeByKey::new(sorted, overflow) {
            visitor(value)?;
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.live
    }
}

/// Merges two key-ascending streams with disjoint keys
struct MergeByKey<A: Iterator, B: Iterator> {
    left: Peekable<A>,
    right: Peekable<B>,
}

impl<A, B> MergeByKey<A, B>
where
    A: Iterator<Item = NeedleValue>,
    B: Iterator<Item = NeedleValue>,
{
    fn new(left: A, right: B) -> Self {
        Self {
            left: left.peekable(),
            right: right.peekable(),
        }
    }
}

impl<A, B> Iterator for MergeByKey<A, B>
where
    A: Iterator<Item = NeedleValue>,
    B: Iterator<Item = NeedleValue>,
{
    type Item = NeedleValue;

    fn next(&mut self) -> Option<NeedleValue> {
        match (self.left.peek(), self.right.peek()) {
            (Some(l), Some(r)) if r.key < l.key => self.right.next(),
            (Some(_), _) => self.left.next(),
            (None, _) => self.right.next(),
        }
    }
}
