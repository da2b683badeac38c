//! Engine - the storage engine entry point.
//!
//! The Engine coordinates:
//! - The segment layout and its atomic publication
//! - The write path and mutable segment rotation
//! - The flush and bottom merge orchestrators
//! - The manifest and directory lock
//!
//! # Thread Safety
//!
//! The Engine is thread-safe and can be shared across threads using Arc.
//! Reads never block; writes only contend with each other inside the
//! mutable segment, and merges run beside both.

use std::collections::HashSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::compaction::{BottomMerge, FlushMerge, LiveEntryIterator, Maintainer};
use crate::events::{EngineObserver, NoopObserver};
use crate::layout::{LayoutChange, LayoutState, SegmentContext, SegmentLayout};
use crate::manifest::{self, FileManifest, LayoutRecord};
use crate::options::Options;
use crate::segment::{
    DiskSegment, DiskSegmentStore, FileSegmentStore, MemorySegment, MutableSegment,
    SegmentIdGenerator, SegmentIterator,
};
use crate::types::{AddOrUpdateResult, MergeResult, Value};
use crate::util::filename::{
    create_dir_if_missing, delete_file, find_max_file_number, list_files, lock_file_path,
    manifest_file_path, FileType,
};
use crate::{Error, Result};

/// The storage engine.
pub struct Engine {
    /// Engine directory path.
    path: PathBuf,
    /// Layout, store, observer and options shared with the orchestrators.
    ctx: Arc<SegmentContext>,
    /// Manifest, kept for syncing on close.
    manifest: Arc<FileManifest>,
    /// Flush merge orchestrator.
    flush: Arc<FlushMerge>,
    /// Bottom merge orchestrator.
    bottom: Arc<BottomMerge>,
    /// Background merge threads, when enabled.
    maintainer: Mutex<Option<Maintainer>>,
    /// Serializes mutable segment rotation.
    rotation_lock: Mutex<()>,
    /// Serializes atomic read-modify-write operations.
    atomic_update_lock: Mutex<()>,
    /// Rejects writes once set.
    read_only: AtomicBool,
    /// Set by `close`.
    closed: AtomicBool,
    /// Lock file handle (kept open to hold the lock).
    _lock_file: File,
}

impl Engine {
    /// Open an engine at the given path with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        Self::open_with_options(path, Options::default())
    }

    /// Open an engine with custom options.
    pub fn open_with_options(path: impl AsRef<Path>, options: Options) -> Result<Arc<Self>> {
        Self::open_with_observer(path, options, Arc::new(NoopObserver))
    }

    /// Open an engine that reports lifecycle events to `observer`.
    ///
    /// Disk segments named by the manifest are reopened, files no segment
    /// references are removed, and the manifest is rewritten in compacted
    /// form. In-memory segments do not survive a restart.
    pub fn open_with_observer(
        path: impl AsRef<Path>,
        options: Options,
        observer: Arc<dyn EngineObserver>,
    ) -> Result<Arc<Self>> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        let manifest_path = manifest_file_path(&path);

        if !path.exists() {
            if options.create_if_missing {
                create_dir_if_missing(&path)?;
            } else {
                return Err(Error::EngineNotFound(path.display().to_string()));
            }
        } else if options.error_if_exists && manifest_path.exists() {
            return Err(Error::EngineExists(path.display().to_string()));
        }

        let lock_file = Self::acquire_lock(&path)?;

        let recovered = manifest::replay(&manifest_path)?;
        let ids = Arc::new(SegmentIdGenerator::new(1));
        ids.mark_used(recovered.max_segment_id);
        ids.mark_used(find_max_file_number(&path)?);

        let store = Arc::new(FileSegmentStore::new(&path, &options, Arc::clone(&ids)));
        let disk_segment = store.open(recovered.disk_segment)?;
        let bottom_segments = recovered
            .bottom_segments
            .iter()
            .map(|id| store.open(*id))
            .collect::<Result<Vec<_>>>()?;

        let mut live: Vec<&Arc<dyn DiskSegment>> = vec![&disk_segment];
        live.extend(bottom_segments.iter());
        Self::remove_orphans(&path, &live)?;

        let mutable = Arc::new(MemorySegment::new(
            ids.next_id(),
            options.mutable_segment_max_item_count,
        ));
        let mut records = vec![LayoutRecord::MutableSegment(mutable.id())];
        records.extend(recovered.snapshot_records());
        let manifest = Arc::new(FileManifest::rewrite(&path, &records, options.sync_mode)?);

        let layout = SegmentLayout::new(mutable, Vec::new(), disk_segment, bottom_segments);
        info!(
            path = %path.display(),
            disk_segment = layout.disk_segment().id(),
            bottom_segments = layout.bottom_segments().len(),
            "engine opened"
        );

        let enable_background_merges = options.enable_background_merges;
        let ctx = Arc::new(SegmentContext {
            options,
            layout: LayoutState::new(layout, manifest.clone()),
            store,
            observer,
            ids,
        });
        let flush = Arc::new(FlushMerge::new(Arc::clone(&ctx)));
        let bottom = Arc::new(BottomMerge::new(Arc::clone(&ctx)));

        let maintainer = if enable_background_merges {
            Some(Maintainer::start(
                Arc::clone(&ctx),
                Arc::clone(&flush),
                Arc::clone(&bottom),
            )?)
        } else {
            None
        };

        Ok(Arc::new(Self {
            path,
            ctx,
            manifest,
            flush,
            bottom,
            maintainer: Mutex::new(maintainer),
            rotation_lock: Mutex::new(()),
            atomic_update_lock: Mutex::new(()),
            read_only: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            _lock_file: lock_file,
        }))
    }

    /// Acquire the engine lock file.
    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = lock_file_path(path);

        let mut lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&lock_path)?;

        // Try to acquire an exclusive lock
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let fd = lock_file.as_raw_fd();
            let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
            if result != 0 {
                return Err(Error::EngineLocked);
            }
        }

        writeln!(lock_file, "tierdb lock").ok();

        Ok(lock_file)
    }

    /// Delete segment and temp files that no live segment references.
    fn remove_orphans(path: &Path, live: &[&Arc<dyn DiskSegment>]) -> Result<()> {
        let mut referenced = HashSet::new();
        for segment in live {
            referenced.insert(segment.id());
            referenced.extend(segment.part_ids());
        }

        for (file_type, id, file) in list_files(path)? {
            let orphan = match file_type {
                FileType::Segment | FileType::MultiPart => !referenced.contains(&id),
                FileType::Temp => true,
                FileType::Lock | FileType::Manifest => false,
            };
            if orphan {
                warn!(file = %file.display(), "removing unreferenced segment file");
                delete_file(&file)?;
            }
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::EngineClosed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Error::ReadOnlyEngine);
        }
        // A layout the manifest never saw would be lost on restart.
        self.ctx.layout.check_healthy()
    }

    /// Get the value of `key`.
    ///
    /// Tiers are searched newest first; a tombstone reads as missing.
    pub fn try_get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.check_open()?;
        Ok(self.ctx.layout.load().find(key).and_then(Value::into_bytes))
    }

    /// Check if `key` has a live value.
    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.try_get(key)?.is_some())
    }

    /// Insert or overwrite a key.
    pub fn upsert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(
            Bytes::copy_from_slice(key),
            Some(Bytes::copy_from_slice(value)),
        )
        .map(|_| ())
    }

    /// Delete a key by writing a tombstone.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write(Bytes::copy_from_slice(key), None).map(|_| ())
    }

    /// Apply one write to the live mutable segment, rotating it when full.
    fn write(&self, key: Bytes, value: Option<Bytes>) -> Result<AddOrUpdateResult> {
        self.check_writable()?;
        loop {
            let mutable = Arc::clone(self.ctx.layout.load().mutable_segment());
            let result = match &value {
                Some(value) => mutable.upsert(key.clone(), value.clone()),
                None => mutable.delete(key.clone()),
            };

            match result {
                AddOrUpdateResult::RetrySegmentIsFull => {
                    self.move_mutable_segment_forward(mutable.id())?;
                }
                AddOrUpdateResult::RetrySegmentIsFrozen => thread::yield_now(),
                applied => return Ok(applied),
            }
        }
    }

    /// Freeze mutable segment `expected_id` and start a fresh one.
    ///
    /// Does nothing and returns false unless `expected_id` is still the
    /// live, unfrozen, non-empty mutable segment, so concurrent writers that
    /// all hit a full segment rotate it once.
    pub fn move_mutable_segment_forward(&self, expected_id: u64) -> Result<bool> {
        self.check_writable()?;
        let _guard = self.rotation_lock.lock();

        // Only rotation replaces the mutable segment, so this check holds
        // until the publish below.
        {
            let layout = self.ctx.layout.load();
            let mutable = layout.mutable_segment();
            if mutable.id() != expected_id || mutable.is_frozen() || mutable.is_empty() {
                return Ok(false);
            }
        }

        let next = Arc::new(MemorySegment::new(
            self.ctx.ids.next_id(),
            self.ctx.options.mutable_segment_max_item_count,
        ));
        let new_id = next.id();

        self.ctx.layout.update(|old| {
            let mut layout = old.clone();
            let frozen = Arc::clone(&layout.mutable_segment).freeze();
            layout.read_only_segments.insert(0, frozen);
            layout.mutable_segment = next;
            Ok(Some(LayoutChange::new(
                layout,
                vec![
                    LayoutRecord::MutableSegment(new_id),
                    LayoutRecord::ReadOnlySegmentQueued(expected_id),
                ],
            )))
        })?;

        info!(frozen_id = expected_id, new_id, "mutable segment moved forward");
        self.ctx
            .observer
            .on_mutable_segment_moved_forward(expected_id, new_id);
        if let Some(maintainer) = self.maintainer.lock().as_ref() {
            maintainer.notify_flush();
        }
        Ok(true)
    }

    /// Insert `value` only if `key` has no live value. Returns whether it
    /// was inserted.
    pub fn try_atomic_add(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.check_writable()?;
        let _guard = self.atomic_update_lock.lock();
        if self.try_get(key)?.is_some() {
            return Ok(false);
        }
        self.upsert(key, value)?;
        Ok(true)
    }

    /// Overwrite `key` only if it has a live value. Returns whether it was
    /// updated.
    pub fn try_atomic_update(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.check_writable()?;
        let _guard = self.atomic_update_lock.lock();
        if self.try_get(key)?.is_none() {
            return Ok(false);
        }
        self.upsert(key, value)?;
        Ok(true)
    }

    /// Read the live value of `key`, let `update` change it, and write it
    /// back if `update` returns true.
    ///
    /// Returns false when the key is missing or `update` declined.
    pub fn try_atomic_get_and_update<F>(&self, key: &[u8], update: F) -> Result<bool>
    where
        F: FnOnce(&mut Bytes) -> bool,
    {
        self.check_writable()?;
        let _guard = self.atomic_update_lock.lock();
        let Some(mut value) = self.try_get(key)? else {
            return Ok(false);
        };
        if !update(&mut value) {
            return Ok(false);
        }
        self.write(Bytes::copy_from_slice(key), Some(value))?;
        Ok(true)
    }

    /// Insert `value` if `key` is missing, otherwise let `update` change the
    /// existing value and write it back if it returns true.
    ///
    /// Returns true when the key was added.
    pub fn try_atomic_add_or_update<F>(&self, key: &[u8], value: &[u8], update: F) -> Result<bool>
    where
        F: FnOnce(&mut Bytes) -> bool,
    {
        self.check_writable()?;
        let _guard = self.atomic_update_lock.lock();
        match self.try_get(key)? {
            None => {
                self.upsert(key, value)?;
                Ok(true)
            }
            Some(mut existing) => {
                if update(&mut existing) {
                    self.write(Bytes::copy_from_slice(key), Some(existing))?;
                }
                Ok(false)
            }
        }
    }

    /// Delete `key` only if it has a live value. Returns whether it was
    /// deleted.
    pub fn try_delete(&self, key: &[u8]) -> Result<bool> {
        self.check_writable()?;
        let _guard = self.atomic_update_lock.lock();
        if self.try_get(key)?.is_none() {
            return Ok(false);
        }
        self.delete(key)?;
        Ok(true)
    }

    /// Switch read-only mode. While set, every mutator fails with
    /// [`Error::ReadOnlyEngine`].
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
        debug!(read_only, "engine read-only mode changed");
    }

    /// Check if the engine rejects writes.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Iterate live entries in key order.
    ///
    /// Segments are captured when the iterator is created. The mutable
    /// segment is read live, so writes made after this call may or may not
    /// be visible.
    pub fn iter(&self) -> Result<LiveEntryIterator> {
        self.check_open()?;
        let layout = self.ctx.layout.load();

        let mut sources: Vec<Box<dyn SegmentIterator>> = Vec::new();
        sources.push(Arc::clone(layout.mutable_segment()).iter());
        sources.extend(layout.read_only_segments().iter().map(|s| Arc::clone(s).iter()));
        sources.extend(layout.ordered_all_disk_segments().into_iter().map(|s| s.iter()));

        let mut iter = LiveEntryIterator::new(sources);
        iter.seek_to_first()?;
        Ok(iter)
    }

    /// Run a flush merge on a new thread.
    pub fn start_merge_operation(&self) -> Result<JoinHandle<Result<MergeResult>>> {
        self.check_open()?;
        let flush = Arc::clone(&self.flush);
        let handle = thread::Builder::new()
            .name("tierdb-merge-op".to_string())
            .spawn(move || flush.run())?;
        Ok(handle)
    }

    /// Run a bottom merge of `from..=to` on a new thread.
    ///
    /// An invalid range is rejected before the thread starts.
    pub fn start_bottom_segments_merge_operation(
        &self,
        from: usize,
        to: usize,
    ) -> Result<JoinHandle<Result<MergeResult>>> {
        self.check_open()?;
        let len = self.ctx.layout.load().bottom_segments().len();
        if from >= to || to >= len {
            return Err(Error::InvalidMergeRange { from, to, len });
        }

        let bottom = Arc::clone(&self.bottom);
        let handle = thread::Builder::new()
            .name("tierdb-bottom-merge-op".to_string())
            .spawn(move || bottom.run(from, to))?;
        Ok(handle)
    }

    /// Run a flush merge on the calling thread.
    pub fn merge_read_only_segments(&self) -> Result<MergeResult> {
        self.check_open()?;
        self.flush.run()
    }

    /// Run a bottom merge of `from..=to` on the calling thread.
    pub fn merge_bottom_segments(&self, from: usize, to: usize) -> Result<MergeResult> {
        self.check_open()?;
        self.bottom.run(from, to)
    }

    /// Ask a running flush merge to stop. Returns false if none is running.
    pub fn try_cancel_merge_operation(&self) -> bool {
        self.flush.try_cancel()
    }

    /// Ask a running bottom merge to stop. Returns false if none is running.
    pub fn try_cancel_bottom_segments_merge_operation(&self) -> bool {
        self.bottom.try_cancel()
    }

    /// Current layout snapshot.
    pub fn layout(&self) -> Arc<SegmentLayout> {
        self.ctx.layout.load()
    }

    /// Get engine statistics.
    pub fn stats(&self) -> EngineStats {
        let layout = self.ctx.layout.load();
        let disk = |s: &Arc<dyn DiskSegment>| SegmentStats {
            id: s.id(),
            len: s.len(),
            part_count: s.part_count(),
        };

        EngineStats {
            mutable_segment: SegmentStats {
                id: layout.mutable_segment().id(),
                len: layout.mutable_segment().len(),
                part_count: 0,
            },
            read_only_segments: layout
                .read_only_segments()
                .iter()
                .map(|s| SegmentStats {
                    id: s.id(),
                    len: s.len(),
                    part_count: 0,
                })
                .collect(),
            disk_segment: layout
                .has_disk_segment()
                .then(|| disk(layout.disk_segment())),
            bottom_segments: layout.bottom_segments().iter().map(disk).collect(),
        }
    }

    /// Close the engine.
    ///
    /// Running merges are cancelled and the background threads stopped.
    /// Data still in memory segments is discarded.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.flush.try_cancel();
        self.bottom.try_cancel();
        if let Some(maintainer) = self.maintainer.lock().take() {
            maintainer.stop();
        }

        self.manifest.sync()?;
        info!(path = %self.path.display(), "engine closed");
        Ok(())
    }

    /// Get the engine path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Try to close gracefully, ignore errors
        let _ = self.close();
    }
}

/// Size of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentStats {
    /// Segment id.
    pub id: u64,
    /// Number of entries, tombstones included.
    pub len: usize,
    /// Number of parts; zero for single-file and memory segments.
    pub part_count: usize,
}

/// Engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// The live mutable segment.
    pub mutable_segment: SegmentStats,
    /// Read-only segments, newest first.
    pub read_only_segments: Vec<SegmentStats>,
    /// The active disk segment, if any.
    pub disk_segment: Option<SegmentStats>,
    /// Bottom tier, newest first.
    pub bottom_segments: Vec<SegmentStats>,
}

impl EngineStats {
    /// Total entries across all segments, duplicates included.
    pub fn total_entries(&self) -> usize {
        self.mutable_segment.len
            + self.read_only_segments.iter().map(|s| s.len).sum::<usize>()
            + self.disk_segment.as_ref().map_or(0, |s| s.len)
            + self.bottom_segments.iter().map(|s| s.len).sum::<usize>()
    }
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Engine Statistics:")?;
        writeln!(
            f,
            "  Mutable segment {}: {} entries",
            self.mutable_segment.id, self.mutable_segment.len
        )?;
        writeln!(f, "  Read-only segments: {}", self.read_only_segments.len())?;
        match &self.disk_segment {
            Some(disk) => writeln!(
                f,
                "  Disk segment {}: {} entries, {} parts",
                disk.id, disk.len, disk.part_count
            )?,
            None => writeln!(f, "  Disk segment: none")?,
        }
        writeln!(f, "  Bottom segments:")?;
        for segment in &self.bottom_segments {
            writeln!(
                f,
                "    {}: {} entries, {} parts",
                segment.id, segment.len, segment.part_count
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionsBuilder;
    use crate::segment::collect_entries;
    use tempfile::tempdir;

    fn options(mutable_max: usize) -> Options {
        OptionsBuilder::new()
            .mutable_segment_max_item_count(mutable_max)
            .enable_background_merges(false)
            .build()
            .unwrap()
    }

    fn rotate(engine: &Engine) -> bool {
        let id = engine.stats().mutable_segment.id;
        engine.move_mutable_segment_forward(id).unwrap()
    }

    #[test]
    fn test_unlogged_layout_stops_writes() {
        let dir = tempdir().unwrap();
        let engine = Engine::open_with_options(dir.path(), options(100)).unwrap();
        engine.upsert(b"a", b"1").unwrap();

        engine.ctx.layout.mark_poisoned();

        assert!(matches!(engine.upsert(b"b", b"2"), Err(Error::LayoutPoisoned)));
        assert!(matches!(engine.try_atomic_add(b"c", b"3"), Err(Error::LayoutPoisoned)));
        let id = engine.stats().mutable_segment.id;
        let err = engine.move_mutable_segment_forward(id).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            engine.merge_read_only_segments(),
            Err(Error::LayoutPoisoned)
        ));
        // Reads keep working off the live layout.
        assert_eq!(engine.try_get(b"a").unwrap(), Some(Bytes::from("1")));
        assert_eq!(engine.try_get(b"b").unwrap(), None);
    }

    #[test]
    fn test_engine_open_new() {
        let dir = tempdir().unwrap();
        let engine = Engine::open_with_options(dir.path(), options(100)).unwrap();
        assert_eq!(engine.path(), dir.path());
        assert!(manifest_file_path(dir.path()).exists());
    }

    #[test]
    fn test_engine_put_get_delete() {
        let dir = tempdir().unwrap();
        let engine = Engine::open_with_options(dir.path(), options(100)).unwrap();

        engine.upsert(b"hello", b"world").unwrap();
        assert_eq!(engine.try_get(b"hello").unwrap(), Some(Bytes::from("world")));
        assert!(engine.contains_key(b"hello").unwrap());

        engine.delete(b"hello").unwrap();
        assert_eq!(engine.try_get(b"hello").unwrap(), None);
        assert!(!engine.contains_key(b"hello").unwrap());
    }

    #[test]
    fn test_full_segment_rotates() {
        let dir = tempdir().unwrap();
        let engine = Engine::open_with_options(dir.path(), options(2)).unwrap();

        for i in 0..5 {
            engine.upsert(format!("key{}", i).as_bytes(), b"v").unwrap();
        }

        let stats = engine.stats();
        assert_eq!(stats.read_only_segments.len(), 2);
        assert_eq!(stats.mutable_segment.len, 1);
        for i in 0..5 {
            assert!(engine.contains_key(format!("key{}", i).as_bytes()).unwrap());
        }
    }

    #[test]
    fn test_rotation_is_idempotent() {
        let dir = tempdir().unwrap();
        let engine = Engine::open_with_options(dir.path(), options(100)).unwrap();

        let id = engine.stats().mutable_segment.id;
        // Empty segments are never rotated.
        assert!(!engine.move_mutable_segment_forward(id).unwrap());

        engine.upsert(b"a", b"1").unwrap();
        assert!(engine.move_mutable_segment_forward(id).unwrap());
        assert!(!engine.move_mutable_segment_forward(id).unwrap());
        assert_eq!(engine.stats().read_only_segments.len(), 1);
        assert_eq!(engine.try_get(b"a").unwrap(), Some(Bytes::from("1")));
    }

    #[test]
    fn test_mutable_shadows_read_only() {
        let dir = tempdir().unwrap();
        let engine = Engine::open_with_options(dir.path(), options(100)).unwrap();

        engine.upsert(b"a", b"old").unwrap();
        engine.upsert(b"c", b"3").unwrap();
        rotate(&engine);
        engine.upsert(b"a", b"1").unwrap();
        engine.upsert(b"b", b"2").unwrap();

        let entries = collect_entries(&mut engine.iter().unwrap()).unwrap();
        assert_eq!(
            entries,
            vec![
                (Bytes::from("a"), Value::put("1")),
                (Bytes::from("b"), Value::put("2")),
                (Bytes::from("c"), Value::put("3")),
            ]
        );
    }

    #[test]
    fn test_read_only_mode() {
        let dir = tempdir().unwrap();
        let engine = Engine::open_with_options(dir.path(), options(100)).unwrap();
        engine.upsert(b"a", b"1").unwrap();

        engine.set_read_only(true);
        assert!(engine.is_read_only());
        assert!(matches!(engine.upsert(b"b", b"2"), Err(Error::ReadOnlyEngine)));
        assert!(matches!(engine.delete(b"a"), Err(Error::ReadOnlyEngine)));
        assert!(matches!(
            engine.try_atomic_add(b"c", b"3"),
            Err(Error::ReadOnlyEngine)
        ));
        assert_eq!(engine.try_get(b"a").unwrap(), Some(Bytes::from("1")));

        engine.set_read_only(false);
        engine.upsert(b"b", b"2").unwrap();
    }

    #[test]
    fn test_atomic_operations() {
        let dir = tempdir().unwrap();
        let engine = Engine::open_with_options(dir.path(), options(100)).unwrap();

        assert!(engine.try_atomic_add(b"k", b"1").unwrap());
        assert!(!engine.try_atomic_add(b"k", b"2").unwrap());
        assert_eq!(engine.try_get(b"k").unwrap(), Some(Bytes::from("1")));

        assert!(engine.try_atomic_update(b"k", b"3").unwrap());
        assert!(!engine.try_atomic_update(b"missing", b"3").unwrap());
        assert!(!engine.contains_key(b"missing").unwrap());

        assert!(engine
            .try_atomic_get_and_update(b"k", |v| {
                *v = Bytes::from(format!("{}!", String::from_utf8_lossy(v)));
                true
            })
            .unwrap());
        assert_eq!(engine.try_get(b"k").unwrap(), Some(Bytes::from("3!")));
        assert!(!engine.try_atomic_get_and_update(b"k", |_| false).unwrap());

        assert!(engine
            .try_atomic_add_or_update(b"n", b"0", |_| unreachable!())
            .unwrap());
        assert!(!engine
            .try_atomic_add_or_update(b"n", b"0", |v| {
                *v = Bytes::from("1");
                true
            })
            .unwrap());
        assert_eq!(engine.try_get(b"n").unwrap(), Some(Bytes::from("1")));

        assert!(engine.try_delete(b"n").unwrap());
        assert!(!engine.try_delete(b"n").unwrap());
    }

    #[test]
    fn test_concurrent_atomic_counter() {
        let dir = tempdir().unwrap();
        let engine = Engine::open_with_options(dir.path(), options(8)).unwrap();
        engine.upsert(b"counter", b"0").unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    for _ in 0..100 {
                        engine
                            .try_atomic_get_and_update(b"counter", |v| {
                                let n: u64 = std::str::from_utf8(v).unwrap().parse().unwrap();
                                *v = Bytes::from((n + 1).to_string());
                                true
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(engine.try_get(b"counter").unwrap(), Some(Bytes::from("400")));
    }

    #[test]
    fn test_merge_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open_with_options(dir.path(), options(100)).unwrap();
            engine.upsert(b"a", b"1").unwrap();
            engine.upsert(b"b", b"2").unwrap();
            rotate(&engine);
            assert_eq!(engine.merge_read_only_segments().unwrap(), MergeResult::Success);
            assert!(engine.stats().disk_segment.is_some());

            // Only disk segments survive a restart.
            engine.upsert(b"c", b"3").unwrap();
            engine.close().unwrap();
            assert!(matches!(engine.try_get(b"a"), Err(Error::EngineClosed)));
        }

        let engine = Engine::open_with_options(dir.path(), options(100)).unwrap();
        assert_eq!(engine.try_get(b"a").unwrap(), Some(Bytes::from("1")));
        assert_eq!(engine.try_get(b"b").unwrap(), Some(Bytes::from("2")));
        assert_eq!(engine.try_get(b"c").unwrap(), None);
    }

    #[test]
    fn test_reopen_removes_orphans() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open_with_options(dir.path(), options(100)).unwrap();
            engine.upsert(b"a", b"1").unwrap();
            rotate(&engine);
            engine.merge_read_only_segments().unwrap();
        }
        let orphan = dir.path().join("999999.seg");
        let temp = dir.path().join("000042.tmp");
        std::fs::write(&orphan, b"garbage").unwrap();
        std::fs::write(&temp, b"garbage").unwrap();

        let engine = Engine::open_with_options(dir.path(), options(100)).unwrap();
        assert!(!orphan.exists());
        assert!(!temp.exists());
        assert_eq!(engine.try_get(b"a").unwrap(), Some(Bytes::from("1")));

        // Ids continue past everything seen on disk.
        assert!(engine.stats().mutable_segment.id > 999_999);
    }

    #[test]
    fn test_open_errors() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing");
        let no_create = OptionsBuilder::new().create_if_missing(false).build().unwrap();
        assert!(matches!(
            Engine::open_with_options(&missing, no_create),
            Err(Error::EngineNotFound(_))
        ));

        let engine = Engine::open_with_options(dir.path(), options(100)).unwrap();
        assert!(matches!(
            Engine::open_with_options(dir.path(), options(100)),
            Err(Error::EngineLocked)
        ));
        drop(engine);

        let exclusive = OptionsBuilder::new().error_if_exists(true).build().unwrap();
        assert!(matches!(
            Engine::open_with_options(dir.path(), exclusive),
            Err(Error::EngineExists(_))
        ));
    }

    #[test]
    fn test_bottom_merge_range_rejected_up_front() {
        let dir = tempdir().unwrap();
        let engine = Engine::open_with_options(dir.path(), options(100)).unwrap();
        assert!(matches!(
            engine.start_bottom_segments_merge_operation(0, 1),
            Err(Error::InvalidMergeRange { from: 0, to: 1, len: 0 })
        ));
        assert!(matches!(
            engine.merge_bottom_segments(2, 1),
            Err(Error::InvalidMergeRange { .. })
        ));
    }

    #[test]
    fn test_stats_display() {
        let dir = tempdir().unwrap();
        let engine = Engine::open_with_options(dir.path(), options(100)).unwrap();
        engine.upsert(b"a", b"1").unwrap();
        let stats = engine.stats();
        assert_eq!(stats.total_entries(), 1);
        assert!(stats.to_string().contains("Disk segment: none"));
    }
}
