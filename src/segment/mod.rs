//! Segments - sorted containers of key/value entries.
//!
//! Every entry lives in exactly one kind of segment at a time:
//!
//! - **Mutable**: the single live write buffer ([`MemorySegment`]).
//! - **Read-only**: a frozen former mutable segment awaiting a flush merge.
//! - **Disk**: an immutable persisted sorted run, either one file
//!   ([`PartSegment`]) or an ordered list of parts ([`MultiPartSegment`]).
//!
//! # Design
//!
//! Segment kinds are traits so the layout and merge code only depend on the
//! capabilities they use. Disk segments expose their part boundaries so a
//! merge can copy untouched parts by reference instead of rewriting them.
//!
//! All segment data is reference counted. Dropping a segment's files never
//! invalidates a reader that still holds an older layout.

pub mod creator;
pub mod memory;
pub mod multi_part;
pub mod part;
pub mod store;

pub use creator::{DiskSegmentCreator, MultiPartCreator, SinglePartCreator};
pub use memory::MemorySegment;
pub use multi_part::MultiPartSegment;
pub use part::PartSegment;
pub use store::{DiskSegmentStore, FileSegmentStore};

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::types::{AddOrUpdateResult, Value};
use crate::Result;

/// Id of the null disk segment.
pub const NULL_SEGMENT_ID: u64 = 0;

/// Seekable forward iterator over a segment's entries in key order.
pub trait SegmentIterator: Send {
    /// Position at the first entry.
    fn seek_to_first(&mut self) -> Result<()>;

    /// Position at the first entry with key >= `target`.
    fn seek(&mut self, target: &[u8]) -> Result<()>;

    /// Check if the iterator is positioned at an entry.
    fn valid(&self) -> bool;

    /// Get the current key.
    fn key(&self) -> Option<&Bytes>;

    /// Get the current value.
    fn value(&self) -> Option<&Value>;

    /// Move to the next entry.
    fn next(&mut self) -> Result<()>;
}

/// The live write buffer.
pub trait MutableSegment: Send + Sync {
    /// Segment id.
    fn id(&self) -> u64;

    /// Number of distinct keys, tombstones included.
    fn len(&self) -> usize;

    /// Check if the segment holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if the segment stopped accepting writes.
    fn is_frozen(&self) -> bool;

    /// Look up a key. Tombstones are returned as [`Value::Deleted`].
    fn try_get(&self, key: &[u8]) -> Option<Value>;

    /// Insert or overwrite a live value.
    fn upsert(&self, key: Bytes, value: Bytes) -> AddOrUpdateResult;

    /// Insert a tombstone.
    fn delete(&self, key: Bytes) -> AddOrUpdateResult;

    /// Stop accepting writes. Irreversible.
    fn freeze(self: Arc<Self>) -> Arc<dyn ReadOnlySegment>;

    /// Iterate the current contents.
    fn iter(self: Arc<Self>) -> Box<dyn SegmentIterator>;
}

/// A frozen write buffer waiting to be merged to disk.
pub trait ReadOnlySegment: Send + Sync {
    /// Segment id.
    fn id(&self) -> u64;

    /// Number of entries.
    fn len(&self) -> usize;

    /// Look up a key. Tombstones are returned as [`Value::Deleted`].
    fn try_get(&self, key: &[u8]) -> Option<Value>;

    /// True once no writer that raced the freeze is still inside.
    fn is_fully_frozen(&self) -> bool;

    /// Iterate the contents.
    fn iter(self: Arc<Self>) -> Box<dyn SegmentIterator>;

    /// Mark the segment as merged away.
    fn release(&self);
}

/// An immutable persisted sorted run.
pub trait DiskSegment: Send + Sync {
    /// Segment id.
    fn id(&self) -> u64;

    /// Number of entries.
    fn len(&self) -> usize;

    /// Check if the segment holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tombstones.
    fn deleted_count(&self) -> usize;

    /// Look up a key. Tombstones are returned as [`Value::Deleted`].
    fn try_get(&self, key: &[u8]) -> Option<Value>;

    /// Smallest and largest key, or `None` when empty.
    fn key_range(&self) -> Option<(Bytes, Bytes)>;

    /// Iterate the contents.
    fn iter(self: Arc<Self>) -> Box<dyn SegmentIterator>;

    /// Number of parts; 0 for segments that are not split.
    fn part_count(&self) -> usize {
        0
    }

    /// First key of every part, in order.
    fn first_keys_of_every_part(&self) -> Vec<Bytes> {
        Vec::new()
    }

    /// Last key of every part, in order.
    fn last_keys_of_every_part(&self) -> Vec<Bytes> {
        Vec::new()
    }

    /// Value stored under the last key of every part, in order.
    fn last_values_of_every_part(&self) -> Vec<Value> {
        Vec::new()
    }

    /// Get a part by index.
    fn part(&self, _index: usize) -> Option<Arc<dyn DiskSegment>> {
        None
    }

    /// Ids of the files holding this segment's entries.
    fn part_ids(&self) -> Vec<u64>;

    /// Delete backing storage, keeping any file whose id is in `exclude`.
    fn drop_segment(&self, exclude: &HashSet<u64>) -> Result<()>;
}

/// Sentinel for "no active disk segment".
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDiskSegment;

impl NullDiskSegment {
    /// Shared instance.
    pub fn arc() -> Arc<dyn DiskSegment> {
        Arc::new(NullDiskSegment)
    }
}

impl DiskSegment for NullDiskSegment {
    fn id(&self) -> u64 {
        NULL_SEGMENT_ID
    }

    fn len(&self) -> usize {
        0
    }

    fn deleted_count(&self) -> usize {
        0
    }

    fn try_get(&self, _key: &[u8]) -> Option<Value> {
        None
    }

    fn key_range(&self) -> Option<(Bytes, Bytes)> {
        None
    }

    fn iter(self: Arc<Self>) -> Box<dyn SegmentIterator> {
        Box::new(EmptyIterator)
    }

    fn part_ids(&self) -> Vec<u64> {
        Vec::new()
    }

    fn drop_segment(&self, _exclude: &HashSet<u64>) -> Result<()> {
        Ok(())
    }
}

/// Iterator over nothing.
#[derive(Debug, Default)]
pub struct EmptyIterator;

impl SegmentIterator for EmptyIterator {
    fn seek_to_first(&mut self) -> Result<()> {
        Ok(())
    }

    fn seek(&mut self, _target: &[u8]) -> Result<()> {
        Ok(())
    }

    fn valid(&self) -> bool {
        false
    }

    fn key(&self) -> Option<&Bytes> {
        None
    }

    fn value(&self) -> Option<&Value> {
        None
    }

    fn next(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Allocates segment and part ids.
///
/// Mutable, disk and part segments share one id space; 0 is reserved for the
/// null disk segment.
#[derive(Debug)]
pub struct SegmentIdGenerator {
    next: AtomicU64,
}

impl SegmentIdGenerator {
    /// Create a generator whose first id is `first`.
    pub fn new(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
        }
    }

    /// Allocate a new id.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Make sure future ids are greater than `id`.
    pub fn mark_used(&self, id: u64) {
        self.next.fetch_max(id + 1, Ordering::SeqCst);
    }

    /// Peek the next id without allocating it.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for SegmentIdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Collect the remaining entries of an iterator.
pub fn collect_entries(iter: &mut dyn SegmentIterator) -> Result<Vec<(Bytes, Value)>> {
    let mut entries = Vec::new();
    while iter.valid() {
        if let (Some(k), Some(v)) = (iter.key(), iter.value()) {
            entries.push((k.clone(), v.clone()));
        }
        iter.next()?;
    }
    Ok(entries)
}
