//! Disk segment creators used as merge output.
//!
//! A creator receives entries in strictly increasing key order and turns them
//! into a new immutable disk segment. A creator that is discarded removes
//! every file it wrote and nothing else.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::types::Value;
use crate::util::filename::{delete_file, multi_part_file_path, segment_file_path, temp_file_path};
use crate::{Error, Result};

use super::multi_part::MultiPartSegment;
use super::part::PartBuilder;
use super::{DiskSegment, NullDiskSegment, SegmentIdGenerator};

/// Builds a new disk segment from sorted entries.
pub trait DiskSegmentCreator: Send {
    /// Id the finished segment will carry.
    fn segment_id(&self) -> u64;

    /// Number of entries appended so far, reused parts included.
    fn len(&self) -> usize;

    /// Check if nothing was appended.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one entry. Keys must be strictly increasing.
    fn append(&mut self, key: Bytes, value: Value) -> Result<()>;

    /// Check if whole parts can be appended by reference.
    fn can_append_part(&self) -> bool {
        false
    }

    /// Append an existing part by reference. Its keys must all be greater
    /// than every key appended so far.
    fn append_part(&mut self, _part: Arc<dyn DiskSegment>) -> Result<()> {
        Err(Error::unsupported("creator cannot append parts"))
    }

    /// Seal the output into a disk segment.
    ///
    /// An empty creator yields the null disk segment and writes nothing.
    fn finish(self: Box<Self>) -> Result<Arc<dyn DiskSegment>>;

    /// Abandon the output and remove its files.
    fn discard(self: Box<Self>) -> Result<()>;
}

/// Writes the whole output as one part file.
pub struct SinglePartCreator {
    dir: PathBuf,
    builder: PartBuilder,
}

impl SinglePartCreator {
    /// Create a creator for segment `id` in `dir`.
    pub fn new(dir: &Path, id: u64) -> Self {
        Self {
            dir: dir.to_path_buf(),
            builder: PartBuilder::new(dir, id),
        }
    }
}

impl DiskSegmentCreator for SinglePartCreator {
    fn segment_id(&self) -> u64 {
        self.builder.id()
    }

    fn len(&self) -> usize {
        self.builder.len()
    }

    fn append(&mut self, key: Bytes, value: Value) -> Result<()> {
        self.builder.add(key, value)
    }

    fn finish(self: Box<Self>) -> Result<Arc<dyn DiskSegment>> {
        if self.builder.is_empty() {
            return Ok(NullDiskSegment::arc());
        }
        Ok(Arc::new(self.builder.finish()?))
    }

    fn discard(self: Box<Self>) -> Result<()> {
        let id = self.builder.id();
        delete_file(&temp_file_path(&self.dir, id))?;
        delete_file(&segment_file_path(&self.dir, id))?;
        Ok(())
    }
}

/// Writes the output as parts of bounded size plus a descriptor.
pub struct MultiPartCreator {
    dir: PathBuf,
    id: u64,
    ids: Arc<SegmentIdGenerator>,
    max_records_per_part: usize,
    /// Part being filled.
    current: Option<PartBuilder>,
    /// Sealed and reused parts, in key order.
    parts: Vec<Arc<dyn DiskSegment>>,
    /// Ids of part files this creator wrote.
    written: Vec<u64>,
    /// Last key appended, across parts.
    last_key: Option<Bytes>,
    len: usize,
}

impl MultiPartCreator {
    /// Create a creator for segment `id` in `dir`.
    pub fn new(
        dir: &Path,
        id: u64,
        ids: Arc<SegmentIdGenerator>,
        max_records_per_part: usize,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            id,
            ids,
            max_records_per_part: max_records_per_part.max(1),
            current: None,
            parts: Vec::new(),
            written: Vec::new(),
            last_key: None,
            len: 0,
        }
    }

    /// Number of parts sealed or reused so far.
    pub fn part_count(&self) -> usize {
        self.parts.len() + usize::from(self.current.is_some())
    }

    fn seal_current(&mut self) -> Result<()> {
        if let Some(builder) = self.current.take() {
            let id = builder.id();
            self.written.push(id);
            let part = builder.finish()?;
            debug!(segment_id = self.id, part_id = id, len = part.len(), "sealed part");
            self.parts.push(Arc::new(part));
        }
        Ok(())
    }

    fn check_order(&self, key: &Bytes) -> Result<()> {
        match &self.last_key {
            Some(last) if key <= last => Err(Error::merge(format!(
                "key appended out of order to segment {}",
                self.id
            ))),
            _ => Ok(()),
        }
    }
}

impl DiskSegmentCreator for MultiPartCreator {
    fn segment_id(&self) -> u64 {
        self.id
    }

    fn len(&self) -> usize {
        self.len
    }

    fn append(&mut self, key: Bytes, value: Value) -> Result<()> {
        self.check_order(&key)?;

        let builder = self
            .current
            .get_or_insert_with(|| PartBuilder::new(&self.dir, self.ids.next_id()));
        builder.add(key.clone(), value)?;
        self.last_key = Some(key);
        self.len += 1;

        if builder.len() >= self.max_records_per_part {
            self.seal_current()?;
        }
        Ok(())
    }

    fn can_append_part(&self) -> bool {
        true
    }

    fn append_part(&mut self, part: Arc<dyn DiskSegment>) -> Result<()> {
        let Some((first, last)) = part.key_range() else {
            return Ok(());
        };
        self.check_order(&first)?;

        self.seal_current()?;
        self.last_key = Some(last);
        self.len += part.len();
        self.parts.push(part);
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<Arc<dyn DiskSegment>> {
        self.seal_current()?;
        if self.parts.is_empty() {
            return Ok(NullDiskSegment::arc());
        }
        let parts = std::mem::take(&mut self.parts);
        match MultiPartSegment::create(&self.dir, self.id, parts) {
            Ok(segment) => Ok(Arc::new(segment)),
            Err(e) => {
                for id in &self.written {
                    let _ = delete_file(&segment_file_path(&self.dir, *id));
                }
                Err(e)
            }
        }
    }

    fn discard(mut self: Box<Self>) -> Result<()> {
        if let Some(builder) = self.current.take() {
            delete_file(&temp_file_path(&self.dir, builder.id()))?;
        }
        for id in &self.written {
            delete_file(&segment_file_path(&self.dir, *id))?;
        }
        delete_file(&temp_file_path(&self.dir, self.id))?;
        delete_file(&multi_part_file_path(&self.dir, self.id))?;
        Ok(())
    }
}
