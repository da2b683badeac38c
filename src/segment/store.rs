//! Disk segment storage: creating merge outputs and reopening segments.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::options::{DiskSegmentMode, Options};
use crate::util::filename::{multi_part_file_path, segment_file_path};
use crate::{Error, Result};

use super::creator::{DiskSegmentCreator, MultiPartCreator, SinglePartCreator};
use super::multi_part::MultiPartSegment;
use super::part::PartSegment;
use super::{DiskSegment, NullDiskSegment, SegmentIdGenerator, NULL_SEGMENT_ID};

/// Factory for disk segments.
pub trait DiskSegmentStore: Send + Sync {
    /// Start a new output segment with a fresh id.
    fn create_creator(&self) -> Result<Box<dyn DiskSegmentCreator>>;

    /// Open a persisted segment by id. Id 0 opens the null segment.
    fn open(&self, id: u64) -> Result<Arc<dyn DiskSegment>>;
}

/// Stores segments as files in the engine directory.
#[derive(Debug)]
pub struct FileSegmentStore {
    dir: PathBuf,
    mode: DiskSegmentMode,
    max_records_per_part: usize,
    ids: Arc<SegmentIdGenerator>,
}

impl FileSegmentStore {
    /// Create a store over `dir`.
    pub fn new(dir: &Path, options: &Options, ids: Arc<SegmentIdGenerator>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            mode: options.disk_segment_mode,
            max_records_per_part: options.max_records_per_part,
            ids,
        }
    }

    /// Engine directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl DiskSegmentStore for FileSegmentStore {
    fn create_creator(&self) -> Result<Box<dyn DiskSegmentCreator>> {
        let id = self.ids.next_id();
        Ok(match self.mode {
            DiskSegmentMode::SingleFile => Box::new(SinglePartCreator::new(&self.dir, id)),
            DiskSegmentMode::MultiPart => Box::new(MultiPartCreator::new(
                &self.dir,
                id,
                Arc::clone(&self.ids),
                self.max_records_per_part,
            )),
        })
    }

    fn open(&self, id: u64) -> Result<Arc<dyn DiskSegment>> {
        if id == NULL_SEGMENT_ID {
            return Ok(NullDiskSegment::arc());
        }
        if multi_part_file_path(&self.dir, id).exists() {
            return Ok(Arc::new(MultiPartSegment::open(&self.dir, id)?));
        }
        if segment_file_path(&self.dir, id).exists() {
            return Ok(Arc::new(PartSegment::open(&self.dir, id)?));
        }
        Err(Error::NotFound(format!("disk segment {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn store(dir: &Path, mode: DiskSegmentMode) -> FileSegmentStore {
        let mut options = Options::default();
        options.disk_segment_mode = mode;
        options.max_records_per_part = 2;
        FileSegmentStore::new(dir, &options, Arc::new(SegmentIdGenerator::new(1)))
    }

    #[test]
    fn test_create_and_open_both_modes() {
        for mode in [DiskSegmentMode::SingleFile, DiskSegmentMode::MultiPart] {
            let dir = tempdir().unwrap();
            let store = store(dir.path(), mode);

            let mut creator = store.create_creator().unwrap();
            for key in ["a", "b", "c"] {
                creator.append(Bytes::from(key), Value::put(key)).unwrap();
            }
            let id = creator.segment_id();
            drop(creator.finish().unwrap());

            let segment = store.open(id).unwrap();
            assert_eq!(segment.len(), 3);
            assert_eq!(segment.try_get(b"b"), Some(Value::put("b")));
            assert_eq!(segment.part_count() > 0, mode.is_multi_part());
        }
    }

    #[test]
    fn test_open_missing_and_null() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), DiskSegmentMode::MultiPart);
        assert!(matches!(store.open(42), Err(Error::NotFound(_))));
        assert_eq!(store.open(NULL_SEGMENT_ID).unwrap().id(), NULL_SEGMENT_ID);
    }
}
