//! In-memory segment backed by a concurrent skip list.
//!
//! A [`MemorySegment`] starts as the mutable segment and, once frozen, keeps
//! serving reads as a read-only segment until a flush merge writes it to disk.
//!
//! # Design
//!
//! - Uses `crossbeam-skiplist` for lock-free concurrent access
//! - One entry per key; an overwrite replaces the previous value
//! - Writers register in an in-flight counter before checking the frozen
//!   flag, so `is_fully_frozen` can tell when the last racing writer left

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;

use crate::types::{AddOrUpdateResult, Value};
use crate::Result;

use super::{MutableSegment, ReadOnlySegment, SegmentIterator};

/// Skip-list segment used for both the mutable and read-only tiers.
#[derive(Debug)]
pub struct MemorySegment {
    /// Segment id.
    id: u64,
    /// The underlying skip list.
    table: SkipMap<Bytes, Value>,
    /// Item limit; writes beyond it ask the caller to rotate.
    max_item_count: usize,
    /// Set once by `freeze`.
    frozen: AtomicBool,
    /// Writers currently inside `upsert`/`delete`.
    writers: AtomicUsize,
    /// Set once merged away.
    released: AtomicBool,
}

/// Decrements the writer count when a write leaves the segment.
struct WriterGuard<'a>(&'a AtomicUsize);

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemorySegment {
    /// Create a new empty segment.
    pub fn new(id: u64, max_item_count: usize) -> Self {
        Self {
            id,
            table: SkipMap::new(),
            max_item_count,
            frozen: AtomicBool::new(false),
            writers: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        }
    }

    /// Number of writers currently inside the segment.
    #[cfg(test)]
    pub(crate) fn active_writers(&self) -> usize {
        self.writers.load(Ordering::SeqCst)
    }

    /// Check if the segment was released by a merge.
    #[cfg(test)]
    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn write(&self, key: Bytes, value: Value) -> AddOrUpdateResult {
        self.writers.fetch_add(1, Ordering::SeqCst);
        let _guard = WriterGuard(&self.writers);

        if self.frozen.load(Ordering::SeqCst) {
            return AddOrUpdateResult::RetrySegmentIsFrozen;
        }

        let exists = self.table.contains_key(&key);
        if !exists && self.table.len() >= self.max_item_count {
            return AddOrUpdateResult::RetrySegmentIsFull;
        }

        self.table.insert(key, value);
        if exists {
            AddOrUpdateResult::Updated
        } else {
            AddOrUpdateResult::Added
        }
    }

    fn get(&self, key: &[u8]) -> Option<Value> {
        self.table.get(key).map(|entry| entry.value().clone())
    }
}

impl MutableSegment for MemorySegment {
    fn id(&self) -> u64 {
        self.id
    }

    fn len(&self) -> usize {
        self.table.len()
    }

    fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    fn try_get(&self, key: &[u8]) -> Option<Value> {
        self.get(key)
    }

    fn upsert(&self, key: Bytes, value: Bytes) -> AddOrUpdateResult {
        self.write(key, Value::Put(value))
    }

    fn delete(&self, key: Bytes) -> AddOrUpdateResult {
        self.write(key, Value::Deleted)
    }

    fn freeze(self: Arc<Self>) -> Arc<dyn ReadOnlySegment> {
        self.frozen.store(true, Ordering::SeqCst);
        self
    }

    fn iter(self: Arc<Self>) -> Box<dyn SegmentIterator> {
        Box::new(MemorySegmentIterator::new(self))
    }
}

impl ReadOnlySegment for MemorySegment {
    fn id(&self) -> u64 {
        self.id
    }

    fn len(&self) -> usize {
        self.table.len()
    }

    fn try_get(&self, key: &[u8]) -> Option<Value> {
        self.get(key)
    }

    fn is_fully_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst) && self.writers.load(Ordering::SeqCst) == 0
    }

    fn iter(self: Arc<Self>) -> Box<dyn SegmentIterator> {
        Box::new(MemorySegmentIterator::new(self))
    }

    fn release(&self) {
        // Entries stay reachable for readers holding an older layout; memory
        // is reclaimed when the last reference goes away.
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Iterator over a [`MemorySegment`].
///
/// Holds a clone of the current entry and re-enters the skip list on every
/// step, so concurrent inserts never invalidate it.
pub struct MemorySegmentIterator {
    segment: Arc<MemorySegment>,
    current: Option<(Bytes, Value)>,
}

impl MemorySegmentIterator {
    fn new(segment: Arc<MemorySegment>) -> Self {
        let mut iter = Self {
            segment,
            current: None,
        };
        iter.position(Bound::Unbounded);
        iter
    }

    fn position(&mut self, bound: Bound<&[u8]>) {
        self.current = self
            .segment
            .table
            .lower_bound(bound)
            .map(|entry| (entry.key().clone(), entry.value().clone()));
    }
}

impl SegmentIterator for MemorySegmentIterator {
    fn seek_to_first(&mut self) -> Result<()> {
        self.position(Bound::Unbounded);
        Ok(())
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.position(Bound::Included(target));
        Ok(())
    }

    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> Option<&Bytes> {
        self.current.as_ref().map(|(k, _)| k)
    }

    fn value(&self) -> Option<&Value> {
        self.current.as_ref().map(|(_, v)| v)
    }

    fn next(&mut self) -> Result<()> {
        if let Some((key, _)) = self.current.take() {
            self.position(Bound::Excluded(key.as_ref()));
        }
        Ok(())
    }
}
