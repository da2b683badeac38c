//! Merge iterator for combining multiple sorted segment iterators.
//!
//! The merge iterator maintains a min-heap of source heads and always
//! yields entries in key order. When several sources hold the same key,
//! the one with the lowest source index comes first; callers order sources
//! newest first so the newest version wins.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use bytes::Bytes;

use crate::segment::SegmentIterator;
use crate::types::Value;
use crate::Result;

/// A single entry taken from a source.
#[derive(Debug, Clone)]
pub struct MergeEntry {
    /// The key.
    pub key: Bytes,
    /// The value or tombstone.
    pub value: Value,
    /// Index of the source this entry came from.
    pub source: usize,
}

impl MergeEntry {
    /// Create a new merge entry.
    pub fn new(key: Bytes, value: Value, source: usize) -> Self {
        Self { key, value, source }
    }
}

// For the min-heap, we need reverse ordering (smallest first)
impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (BinaryHeap is a max-heap).
        // Equal keys: lower source index = newer data, popped first.
        match other.key.cmp(&self.key) {
            Ordering::Equal => other.source.cmp(&self.source),
            ord => ord,
        }
    }
}

fn head_of(iterator: &dyn SegmentIterator, source: usize) -> Option<MergeEntry> {
    if !iterator.valid() {
        return None;
    }
    Some(MergeEntry::new(
        iterator.key()?.clone(),
        iterator.value()?.clone(),
        source,
    ))
}

/// Merge iterator over boxed segment iterators.
///
/// Yields every version of every key; deduplication is up to the caller.
pub struct MergeIterator {
    /// Sources, newest first.
    sources: Vec<Box<dyn SegmentIterator>>,
    /// Min-heap of source heads, excluding the current entry's source.
    heap: BinaryHeap<MergeEntry>,
    /// Current entry.
    current: Option<MergeEntry>,
}

impl MergeIterator {
    /// Create a new merge iterator from sources ordered newest first.
    pub fn new(sources: Vec<Box<dyn SegmentIterator>>) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            current: None,
        }
    }

    /// Number of sources.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Seek to the first entry.
    pub fn seek_to_first(&mut self) -> Result<()> {
        self.heap.clear();
        self.current = None;

        for (index, source) in self.sources.iter_mut().enumerate() {
            source.seek_to_first()?;
            if let Some(entry) = head_of(source.as_ref(), index) {
                self.heap.push(entry);
            }
        }

        self.current = self.heap.pop();
        Ok(())
    }

    /// Position every source at the first key >= `target`.
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.heap.clear();
        self.current = None;

        for (index, source) in self.sources.iter_mut().enumerate() {
            source.seek(target)?;
            if let Some(entry) = head_of(source.as_ref(), index) {
                self.heap.push(entry);
            }
        }

        self.current = self.heap.pop();
        Ok(())
    }

    /// Check if the iterator is valid.
    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// Get the current entry.
    pub fn current(&self) -> Option<&MergeEntry> {
        self.current.as_ref()
    }

    /// Smallest head among the sources other than the current one.
    pub fn peek_other_key(&self) -> Option<&Bytes> {
        self.heap.peek().map(|e| &e.key)
    }

    /// Move to the next entry.
    pub fn next(&mut self) -> Result<()> {
        if let Some(entry) = self.current.take() {
            let source = &mut self.sources[entry.source];
            source.next()?;
            if let Some(head) = head_of(source.as_ref(), entry.source) {
                self.heap.push(head);
            }
        }

        self.current = self.heap.pop();
        Ok(())
    }

    /// Reposition the current entry's source at `target`, or drop it when
    /// `target` is None, then move to the next entry.
    ///
    /// `target` must be greater than the current key.
    pub fn skip_current_source(&mut self, target: Option<&[u8]>) -> Result<()> {
        if let Some(entry) = self.current.take() {
            if let Some(target) = target {
                let source = &mut self.sources[entry.source];
                source.seek(target)?;
                if let Some(head) = head_of(source.as_ref(), entry.source) {
                    self.heap.push(head);
                }
            }
        }

        self.current = self.heap.pop();
        Ok(())
    }
}

/// Newest-wins view over a merge iterator.
///
/// Stale versions are skipped, and so are tombstones, so only live entries
/// are visible.
pub struct LiveEntryIterator {
    inner: MergeIterator,
}

impl LiveEntryIterator {
    /// Create a live view over sources ordered newest first.
    pub fn new(sources: Vec<Box<dyn SegmentIterator>>) -> Self {
        Self {
            inner: MergeIterator::new(sources),
        }
    }

    /// Advance past versions of `key` and then past tombstones.
    fn settle(&mut self, mut last: Option<Bytes>) -> Result<()> {
        loop {
            let Some(entry) = self.inner.current() else {
                return Ok(());
            };
            if last.as_ref() == Some(&entry.key) {
                self.inner.next()?;
                continue;
            }
            if entry.value.is_deleted() {
                last = Some(entry.key.clone());
                self.inner.next()?;
                continue;
            }
            return Ok(());
        }
    }
}

impl SegmentIterator for LiveEntryIterator {
    fn seek_to_first(&mut self) -> Result<()> {
        self.inner.seek_to_first()?;
        self.settle(None)
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.inner.seek(target)?;
        self.settle(None)
    }

    fn valid(&self) -> bool {
        self.inner.valid()
    }

    fn key(&self) -> Option<&Bytes> {
        self.inner.current().map(|e| &e.key)
    }

    fn value(&self) -> Option<&Value> {
        self.inner.current().map(|e| &e.value)
    }

    fn next(&mut self) -> Result<()> {
        let last = self.inner.current().map(|e| e.key.clone());
        self.inner.next()?;
        self.settle(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{collect_entries, MemorySegment, MutableSegment};
    use std::sync::Arc;

    fn source(entries: &[(&str, Option<&str>)]) -> Box<dyn SegmentIterator> {
        let segment = Arc::new(MemorySegment::new(1, 1000));
        for (key, value) in entries {
            match value {
                Some(v) => segment.upsert(Bytes::from(key.to_string()), Bytes::from(v.to_string())),
                None => segment.delete(Bytes::from(key.to_string())),
            };
        }
        MutableSegment::iter(segment)
    }

    fn drain(iter: &mut MergeIterator) -> Vec<(String, usize)> {
        let mut out = Vec::new();
        while let Some(entry) = iter.current() {
            out.push((String::from_utf8(entry.key.to_vec()).unwrap(), entry.source));
            iter.next().unwrap();
        }
        out
    }

    #[test]
    fn test_merge_iterator_multiple_sources() {
        let mut iter = MergeIterator::new(vec![
            source(&[("a", Some("1")), ("c", Some("1")), ("e", Some("1"))]),
            source(&[("b", Some("2")), ("d", Some("2")), ("f", Some("2"))]),
        ]);
        iter.seek_to_first().unwrap();

        let keys: Vec<String> = drain(&mut iter).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c", "d", "e", "f"]);
    }

    #[test]
    fn test_merge_iterator_ties_prefer_lower_source() {
        let mut iter = MergeIterator::new(vec![
            source(&[("k", Some("new"))]),
            source(&[("k", Some("mid"))]),
            source(&[("k", Some("old"))]),
        ]);
        iter.seek_to_first().unwrap();

        assert_eq!(
            drain(&mut iter),
            vec![("k".to_string(), 0), ("k".to_string(), 1), ("k".to_string(), 2)]
        );
    }

    #[test]
    fn test_peek_and_skip_current_source() {
        let mut iter = MergeIterator::new(vec![
            source(&[("m", Some("1"))]),
            source(&[("a", Some("2")), ("b", Some("2")), ("x", Some("2"))]),
        ]);
        iter.seek_to_first().unwrap();

        assert_eq!(iter.current().unwrap().key.as_ref(), b"a");
        assert_eq!(iter.peek_other_key().unwrap().as_ref(), b"m");

        iter.skip_current_source(Some(b"x")).unwrap();
        assert_eq!(iter.current().unwrap().key.as_ref(), b"m");
        iter.next().unwrap();
        assert_eq!(iter.current().unwrap().key.as_ref(), b"x");

        iter.skip_current_source(None).unwrap();
        assert!(!iter.valid());
    }

    #[test]
    fn test_live_entry_iterator() {
        let mut iter = LiveEntryIterator::new(vec![
            source(&[("a", Some("1")), ("b", None)]),
            source(&[("a", Some("old")), ("b", Some("old")), ("c", Some("3"))]),
        ]);
        iter.seek_to_first().unwrap();

        let entries = collect_entries(&mut iter).unwrap();
        assert_eq!(
            entries,
            vec![
                (Bytes::from("a"), Value::put("1")),
                (Bytes::from("c"), Value::put("3")),
            ]
        );

        iter.seek(b"b").unwrap();
        assert_eq!(iter.key().unwrap().as_ref(), b"c");
    }

    #[test]
    fn test_empty_sources() {
        let mut iter = MergeIterator::new(Vec::new());
        iter.seek_to_first().unwrap();
        assert!(!iter.valid());
        assert_eq!(iter.source_count(), 0);
    }
}
