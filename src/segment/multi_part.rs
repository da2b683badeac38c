//! Disk segment split into ordered parts.
//!
//! A multi-part segment is a descriptor file listing part ids plus the parts
//! themselves. Parts are disjoint and ordered, so part `i`'s last key is
//! strictly less than part `i + 1`'s first key.
//!
//! # Descriptor format
//!
//! ```text
//! [magic (4)][part_count (varint)][part_id (varint)]...[masked crc (4)]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::types::Value;
use crate::util::coding::{decode_varint64, encode_fixed32, encode_varint64, read_fixed32};
use crate::util::crc::{crc32, mask_crc, verify_masked_crc};
use crate::util::filename::{delete_file, multi_part_file_path, temp_file_path, write_file_atomic};
use crate::{Error, Result};

use super::part::PartSegment;
use super::{DiskSegment, EmptyIterator, SegmentIterator};

/// Magic number marking a multi-part descriptor.
pub const MULTI_PART_MAGIC: u32 = 0x5453_4d50;

/// A disk segment made of ordered, non-overlapping parts.
pub struct MultiPartSegment {
    /// Segment id (the descriptor file number).
    id: u64,
    /// Descriptor path.
    path: PathBuf,
    /// Parts in key order.
    parts: Vec<Arc<dyn DiskSegment>>,
    /// First key of every part.
    first_keys: Vec<Bytes>,
    /// Last key of every part.
    last_keys: Vec<Bytes>,
    /// Value of the last key of every part.
    last_values: Vec<Value>,
    /// Total entries.
    len: usize,
    /// Total tombstones.
    deleted_count: usize,
}

impl std::fmt::Debug for MultiPartSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiPartSegment")
            .field("id", &self.id)
            .field("parts", &self.part_ids())
            .field("len", &self.len)
            .finish()
    }
}

impl MultiPartSegment {
    /// Assemble a segment from already persisted parts and write its
    /// descriptor.
    pub fn create(dir: &Path, id: u64, parts: Vec<Arc<dyn DiskSegment>>) -> Result<Self> {
        let segment = Self::from_parts(id, multi_part_file_path(dir, id), parts)?;

        let mut buf = BytesMut::new();
        encode_fixed32(&mut buf, MULTI_PART_MAGIC);
        encode_varint64(&mut buf, segment.parts.len() as u64);
        for part in &segment.parts {
            encode_varint64(&mut buf, part.id());
        }
        let crc = crc32(&buf);
        encode_fixed32(&mut buf, mask_crc(crc));

        write_file_atomic(&temp_file_path(dir, id), &segment.path, &buf)?;
        Ok(segment)
    }

    /// Open an existing segment by reading its descriptor and parts.
    pub fn open(dir: &Path, id: u64) -> Result<Self> {
        let part_ids = read_descriptor(dir, id)?;
        let mut parts: Vec<Arc<dyn DiskSegment>> = Vec::with_capacity(part_ids.len());
        for part_id in part_ids {
            parts.push(Arc::new(PartSegment::open(dir, part_id)?));
        }
        Self::from_parts(id, multi_part_file_path(dir, id), parts)
    }

    fn from_parts(id: u64, path: PathBuf, parts: Vec<Arc<dyn DiskSegment>>) -> Result<Self> {
        let mut first_keys = Vec::with_capacity(parts.len());
        let mut last_keys = Vec::with_capacity(parts.len());
        let mut last_values = Vec::with_capacity(parts.len());
        let mut len = 0;
        let mut deleted_count = 0;

        for part in &parts {
            let (first, last_key) = part
                .key_range()
                .ok_or_else(|| Error::corruption(format!("segment {} has an empty part", id)))?;
            let last_value = part
                .try_get(&last_key)
                .ok_or_else(|| Error::corruption(format!("segment {} part lost its last key", id)))?;

            if let Some(prev) = last_keys.last() {
                if first <= *prev {
                    return Err(Error::corruption(format!(
                        "segment {} has overlapping parts",
                        id
                    )));
                }
            }

            first_keys.push(first);
            last_keys.push(last_key);
            last_values.push(last_value);
            len += part.len();
            deleted_count += part.deleted_count();
        }

        Ok(Self {
            id,
            path,
            parts,
            first_keys,
            last_keys,
            last_values,
            len,
            deleted_count,
        })
    }

    /// Index of the part that could hold `key`.
    fn part_for(&self, key: &[u8]) -> Option<usize> {
        let i = self.last_keys.partition_point(|last| last.as_ref() < key);
        (i < self.parts.len()).then_some(i)
    }
}

/// Read the part ids listed by a descriptor.
pub fn read_descriptor(dir: &Path, id: u64) -> Result<Vec<u64>> {
    let data = std::fs::read(multi_part_file_path(dir, id))?;
    if data.len() < 8 {
        return Err(Error::invalid_format(format!(
            "descriptor {} too short",
            id
        )));
    }
    if read_fixed32(&data[..4]) != Some(MULTI_PART_MAGIC) {
        return Err(Error::invalid_format(format!(
            "descriptor {} has bad magic",
            id
        )));
    }

    let body = &data[..data.len() - 4];
    let stored = read_fixed32(&data[data.len() - 4..]).unwrap_or(0);
    if !verify_masked_crc(body, stored) {
        return Err(Error::corruption(format!(
            "descriptor {} checksum mismatch",
            id
        )));
    }

    let mut cursor = &body[4..];
    let count = decode_varint64(&mut cursor)
        .ok_or_else(|| Error::corruption("descriptor part count truncated"))?;
    let mut ids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        ids.push(
            decode_varint64(&mut cursor)
                .ok_or_else(|| Error::corruption("descriptor part id truncated"))?,
        );
    }
    Ok(ids)
}

impl DiskSegment for MultiPartSegment {
    fn id(&self) -> u64 {
        self.id
    }

    fn len(&self) -> usize {
        self.len
    }

    fn deleted_count(&self) -> usize {
        self.deleted_count
    }

    fn try_get(&self, key: &[u8]) -> Option<Value> {
        let i = self.part_for(key)?;
        self.parts[i].try_get(key)
    }

    fn key_range(&self) -> Option<(Bytes, Bytes)> {
        match (self.first_keys.first(), self.last_keys.last()) {
            (Some(first), Some(last)) => Some((first.clone(), last.clone())),
            _ => None,
        }
    }

    fn iter(self: Arc<Self>) -> Box<dyn SegmentIterator> {
        Box::new(MultiPartIterator::new(self))
    }

    fn part_count(&self) -> usize {
        self.parts.len()
    }

    fn first_keys_of_every_part(&self) -> Vec<Bytes> {
        self.first_keys.clone()
    }

    fn last_keys_of_every_part(&self) -> Vec<Bytes> {
        self.last_keys.clone()
    }

    fn last_values_of_every_part(&self) -> Vec<Value> {
        self.last_values.clone()
    }

    fn part(&self, index: usize) -> Option<Arc<dyn DiskSegment>> {
        self.parts.get(index).cloned()
    }

    fn part_ids(&self) -> Vec<u64> {
        self.parts.iter().map(|p| p.id()).collect()
    }

    fn drop_segment(&self, exclude: &HashSet<u64>) -> Result<()> {
        // Descriptor first, so a crash leaves orphan parts rather than a
        // descriptor pointing at missing files.
        if !exclude.contains(&self.id) {
            delete_file(&self.path)?;
        }
        for part in &self.parts {
            part.drop_segment(exclude)?;
        }
        Ok(())
    }
}

/// Iterator walking the parts of a [`MultiPartSegment`] in order.
pub struct MultiPartIterator {
    segment: Arc<MultiPartSegment>,
    part_index: usize,
    current: Box<dyn SegmentIterator>,
}

impl MultiPartIterator {
    fn new(segment: Arc<MultiPartSegment>) -> Self {
        let mut iter = Self {
            segment,
            part_index: 0,
            current: Box::new(EmptyIterator),
        };
        iter.open_part(0);
        iter
    }

    fn open_part(&mut self, index: usize) {
        self.part_index = index;
        self.current = match self.segment.parts.get(index) {
            Some(part) => Arc::clone(part).iter(),
            None => Box::new(EmptyIterator),
        };
    }

    fn skip_exhausted_parts(&mut self) -> Result<()> {
        while !self.current.valid() && self.part_index + 1 < self.segment.parts.len() {
            self.open_part(self.part_index + 1);
            self.current.seek_to_first()?;
        }
        Ok(())
    }
}

impl SegmentIterator for MultiPartIterator {
    fn seek_to_first(&mut self) -> Result<()> {
        self.open_part(0);
        self.current.seek_to_first()?;
        self.skip_exhausted_parts()
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        match self.segment.part_for(target) {
            Some(i) => {
                self.open_part(i);
                self.current.seek(target)?;
                self.skip_exhausted_parts()
            }
            None => {
                self.open_part(self.segment.parts.len());
                Ok(())
            }
        }
    }

    fn valid(&self) -> bool {
        self.current.valid()
    }

    fn key(&self) -> Option<&Bytes> {
        self.current.key()
    }

    fn value(&self) -> Option<&Value> {
        self.current.value()
    }

    fn next(&mut self) -> Result<()> {
        self.current.next()?;
        self.skip_exhausted_parts()
    }
}
