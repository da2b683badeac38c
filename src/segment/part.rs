//! Single-file sorted run.
//!
//! # Format
//!
//! ```text
//! [magic (4)]
//! [entry 1: key_len (varint) | key | type (1) | value_len (varint) | value]
//! ...
//! [entry_count (8)][deleted_count (8)][masked crc (4)][magic (4)]
//! ```
//!
//! The CRC covers every byte before it. Files are written to a temporary
//! name and renamed into place, so a reader never sees a partial part.
//! Opened parts are fully loaded; lookups are binary searches.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::types::{decode_entry, encode_entry, Value};
use crate::util::coding::{encode_fixed32, encode_fixed64, read_fixed32, read_fixed64};
use crate::util::crc::{crc32, mask_crc, unmask_crc};
use crate::util::filename::{delete_file, segment_file_path, temp_file_path, write_file_atomic};
use crate::{Error, Result};

use super::{DiskSegment, SegmentIterator};

/// Magic number marking a part file.
pub const PART_MAGIC: u32 = 0x5453_4547;

/// Footer size: entry count (8) + deleted count (8) + crc (4) + magic (4).
pub const PART_FOOTER_SIZE: usize = 24;

/// An immutable sorted run stored in one file.
#[derive(Debug)]
pub struct PartSegment {
    /// Segment id (also the file number).
    id: u64,
    /// Path of the backing file.
    path: PathBuf,
    /// Entries in key order.
    entries: Vec<(Bytes, Value)>,
    /// Number of tombstones.
    deleted_count: usize,
}

impl PartSegment {
    /// Open an existing part file.
    pub fn open(dir: &Path, id: u64) -> Result<Self> {
        let path = segment_file_path(dir, id);
        let data = std::fs::read(&path)?;

        if data.len() < 4 + PART_FOOTER_SIZE {
            return Err(Error::invalid_format(format!(
                "part {} too short: {} bytes",
                id,
                data.len()
            )));
        }

        let footer = &data[data.len() - PART_FOOTER_SIZE..];
        let body_end = data.len() - 8;
        let stored_crc = read_fixed32(&footer[16..20]).unwrap_or(0);
        let trailer_magic = read_fixed32(&footer[20..24]).unwrap_or(0);
        let header_magic = read_fixed32(&data[..4]).unwrap_or(0);

        if header_magic != PART_MAGIC || trailer_magic != PART_MAGIC {
            return Err(Error::invalid_format(format!("part {} has bad magic", id)));
        }

        let expected = unmask_crc(stored_crc);
        let actual = crc32(&data[..body_end]);
        if expected != actual {
            return Err(Error::CrcMismatch { expected, actual });
        }

        let entry_count = read_fixed64(&footer[0..8]).unwrap_or(0) as usize;
        let deleted_count = read_fixed64(&footer[8..16]).unwrap_or(0) as usize;

        let mut cursor = &data[4..data.len() - PART_FOOTER_SIZE];
        let mut entries = Vec::with_capacity(entry_count);
        while !cursor.is_empty() {
            entries.push(decode_entry(&mut cursor)?);
        }

        if entries.len() != entry_count {
            return Err(Error::corruption(format!(
                "part {} holds {} entries, footer says {}",
                id,
                entries.len(),
                entry_count
            )));
        }

        Ok(Self {
            id,
            path,
            entries,
            deleted_count,
        })
    }

    /// Get the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn find(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.as_ref().cmp(key))
    }
}

impl DiskSegment for PartSegment {
    fn id(&self) -> u64 {
        self.id
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn deleted_count(&self) -> usize {
        self.deleted_count
    }

    fn try_get(&self, key: &[u8]) -> Option<Value> {
        self.find(key).ok().map(|i| self.entries[i].1.clone())
    }

    fn key_range(&self) -> Option<(Bytes, Bytes)> {
        match (self.entries.first(), self.entries.last()) {
            (Some((first, _)), Some((last, _))) => Some((first.clone(), last.clone())),
            _ => None,
        }
    }

    fn iter(self: Arc<Self>) -> Box<dyn SegmentIterator> {
        Box::new(PartIterator::new(self))
    }

    fn part_ids(&self) -> Vec<u64> {
        vec![self.id]
    }

    fn drop_segment(&self, exclude: &HashSet<u64>) -> Result<()> {
        if exclude.contains(&self.id) {
            return Ok(());
        }
        delete_file(&self.path)?;
        Ok(())
    }
}

/// Iterator over a [`PartSegment`].
pub struct PartIterator {
    part: Arc<PartSegment>,
    position: usize,
}

impl PartIterator {
    fn new(part: Arc<PartSegment>) -> Self {
        Self { part, position: 0 }
    }
}

impl SegmentIterator for PartIterator {
    fn seek_to_first(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.position = match self.part.find(target) {
            Ok(i) | Err(i) => i,
        };
        Ok(())
    }

    fn valid(&self) -> bool {
        self.position < self.part.entries.len()
    }

    fn key(&self) -> Option<&Bytes> {
        self.part.entries.get(self.position).map(|(k, _)| k)
    }

    fn value(&self) -> Option<&Value> {
        self.part.entries.get(self.position).map(|(_, v)| v)
    }

    fn next(&mut self) -> Result<()> {
        if self.valid() {
            self.position += 1;
        }
        Ok(())
    }
}

/// Accumulates sorted entries and writes them as one part file.
#[derive(Debug)]
pub struct PartBuilder {
    dir: PathBuf,
    id: u64,
    entries: Vec<(Bytes, Value)>,
    deleted_count: usize,
}

impl PartBuilder {
    /// Create a builder for part `id` in `dir`.
    pub fn new(dir: &Path, id: u64) -> Self {
        Self {
            dir: dir.to_path_buf(),
            id,
            entries: Vec::new(),
            deleted_count: 0,
        }
    }

    /// Part id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of appended entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing was appended.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Last appended key.
    pub fn last_key(&self) -> Option<&Bytes> {
        self.entries.last().map(|(k, _)| k)
    }

    /// Append an entry. Keys must be strictly increasing.
    pub fn add(&mut self, key: Bytes, value: Value) -> Result<()> {
        if let Some(last) = self.last_key() {
            if key <= *last {
                return Err(Error::merge(format!(
                    "key appended out of order to part {}",
                    self.id
                )));
            }
        }
        if value.is_deleted() {
            self.deleted_count += 1;
        }
        self.entries.push((key, value));
        Ok(())
    }

    /// Write the part file and return the opened part.
    pub fn finish(self) -> Result<PartSegment> {
        let mut buf = BytesMut::with_capacity(
            4 + PART_FOOTER_SIZE
                + self
                    .entries
                    .iter()
                    .map(|(k, v)| k.len() + v.encoded_len() + 10)
                    .sum::<usize>(),
        );

        encode_fixed32(&mut buf, PART_MAGIC);
        for (key, value) in &self.entries {
            encode_entry(&mut buf, key, value);
        }
        encode_fixed64(&mut buf, self.entries.len() as u64);
        encode_fixed64(&mut buf, self.deleted_count as u64);
        let crc = crc32(&buf);
        encode_fixed32(&mut buf, mask_crc(crc));
        encode_fixed32(&mut buf, PART_MAGIC);

        let path = segment_file_path(&self.dir, self.id);
        write_file_atomic(&temp_file_path(&self.dir, self.id), &path, &buf)?;

        Ok(PartSegment {
            id: self.id,
            path,
            entries: self.entries,
            deleted_count: self.deleted_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::collect_entries;
    use tempfile::tempdir;

    fn build(dir: &Path, id: u64, entries: &[(&str, Option<&str>)]) -> PartSegment {
        let mut builder = PartBuilder::new(dir, id);
        for (k, v) in entries {
            let value = match v {
                Some(v) => Value::put(v.to_string()),
                None => Value::Deleted,
            };
            builder.add(Bytes::from(k.to_string()), value).unwrap();
        }
        builder.finish().unwrap()
    }

    #[test]
    fn test_build_and_open() {
        let dir = tempdir().unwrap();
        let part = build(
            dir.path(),
            7,
            &[("a", Some("1")), ("b", None), ("c", Some("3"))],
        );
        assert_eq!(part.len(), 3);
        assert_eq!(part.deleted_count(), 1);
        assert!(part.path().exists());

        let reopened = PartSegment::open(dir.path(), 7).unwrap();
        assert_eq!(reopened.len(), 3);
        assert_eq!(reopened.deleted_count(), 1);
        assert_eq!(reopened.try_get(b"a"), Some(Value::put("1")));
        assert_eq!(reopened.try_get(b"b"), Some(Value::Deleted));
        assert_eq!(reopened.try_get(b"bb"), None);
        assert_eq!(
            reopened.key_range(),
            Some((Bytes::from("a"), Bytes::from("c")))
        );
    }

    #[test]
    fn test_out_of_order_rejected() {
        let dir = tempdir().unwrap();
        let mut builder = PartBuilder::new(dir.path(), 1);
        builder.add(Bytes::from("b"), Value::put("1")).unwrap();
        assert!(builder.add(Bytes::from("a"), Value::put("2")).is_err());
        assert!(builder.add(Bytes::from("b"), Value::put("2")).is_err());
    }

    #[test]
    fn test_corruption_detected() {
        let dir = tempdir().unwrap();
        let part = build(dir.path(), 3, &[("key", Some("value"))]);

        let mut data = std::fs::read(part.path()).unwrap();
        data[6] ^= 0xff;
        std::fs::write(part.path(), &data).unwrap();

        let err = PartSegment::open(dir.path(), 3).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_iterator_seek() {
        let dir = tempdir().unwrap();
        let part = Arc::new(build(
            dir.path(),
            1,
            &[("a", Some("1")), ("c", Some("3")), ("e", Some("5"))],
        ));

        let mut iter = Arc::clone(&part).iter();
        iter.seek(b"b").unwrap();
        assert_eq!(iter.key().unwrap().as_ref(), b"c");
        iter.seek(b"e").unwrap();
        assert_eq!(iter.value(), Some(&Value::put("5")));
        iter.next().unwrap();
        assert!(!iter.valid());

        iter.seek_to_first().unwrap();
        assert_eq!(collect_entries(iter.as_mut()).unwrap().len(), 3);
    }

    #[test]
    fn test_drop_segment_respects_exclude() {
        let dir = tempdir().unwrap();
        let part = build(dir.path(), 9, &[("a", Some("1"))]);

        let keep: HashSet<u64> = [9].into_iter().collect();
        part.drop_segment(&keep).unwrap();
        assert!(part.path().exists());

        part.drop_segment(&HashSet::new()).unwrap();
        assert!(!part.path().exists());
    }
}
