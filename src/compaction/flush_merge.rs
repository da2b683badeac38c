//! Flush merge: read-only segments into the active disk segment.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::events::MergeKind;
use crate::layout::{LayoutChange, SegmentContext};
use crate::manifest::LayoutRecord;
use crate::segment::{NullDiskSegment, ReadOnlySegment, NULL_SEGMENT_ID};
use crate::types::MergeResult;
use crate::{Error, Result};

use super::merger::{MergeOutcome, MergeRequest, MergeSettings, MergeStats, Merger};
use super::{drop_disk_segment, MergeControl};

/// Merges every read-only segment with the active disk segment.
///
/// The result becomes the new active disk segment, or is demoted to the
/// front of the bottom tier when it holds more than
/// `disk_segment_max_item_count` entries.
pub struct FlushMerge {
    ctx: Arc<SegmentContext>,
    control: MergeControl,
}

impl FlushMerge {
    /// Create the orchestrator.
    pub fn new(ctx: Arc<SegmentContext>) -> Self {
        Self {
            ctx,
            control: MergeControl::default(),
        }
    }

    /// Ask a running flush merge to stop.
    pub fn try_cancel(&self) -> bool {
        self.control.try_cancel()
    }

    /// Run one flush merge on the calling thread.
    pub fn run(&self) -> Result<MergeResult> {
        let Some(_guard) = self.control.try_begin() else {
            return Ok(MergeResult::AnotherMergeIsRunning);
        };

        let observer = &self.ctx.observer;
        observer.on_merge_operation_started(MergeKind::Flush);

        match self.merge_locked() {
            Ok((result, stats)) => {
                observer.on_merge_operation_ended(MergeKind::Flush, result, stats.as_ref());
                Ok(result)
            }
            Err(e) => {
                error!(error = %e, "flush merge failed");
                observer.on_merge_operation_failed(MergeKind::Flush, &e);
                Err(e)
            }
        }
    }

    fn merge_locked(&self) -> Result<(MergeResult, Option<MergeStats>)> {
        let options = &self.ctx.options;
        self.ctx.layout.check_healthy()?;
        let snapshot = self.ctx.layout.load();

        let read_only = snapshot.read_only_segments().to_vec();
        if read_only.is_empty() {
            return Ok((MergeResult::NothingToMerge, None));
        }
        if !wait_until_fully_frozen(&read_only, options.read_only_wait_timeout) {
            debug!(segments = read_only.len(), "read-only segments still have writers");
            return Ok((MergeResult::RetryReadonlySegmentsAreNotReady, None));
        }

        let old_disk = Arc::clone(snapshot.disk_segment());
        let request = MergeRequest {
            sources: read_only.iter().map(|s| Arc::clone(s).iter()).collect(),
            base: snapshot.has_disk_segment().then(|| Arc::clone(&old_disk)),
            write_deleted_values: !snapshot.bottom_segments().is_empty(),
        };
        drop(snapshot);

        let creator = self.ctx.store.create_creator()?;
        let merger = Merger::new(MergeSettings::from_options(options), self.control.cancel_flag());
        let (segment, stats) = match merger.merge(request, creator)? {
            MergeOutcome::Completed { segment, stats } => (segment, stats),
            MergeOutcome::Cancelled => return Ok((MergeResult::CancelledByUser, None)),
        };

        let new_id = segment.id();
        let demote = segment.len() > options.disk_segment_max_item_count;
        let merged_ids: Vec<u64> = read_only.iter().map(|s| s.id()).collect();
        let merged: HashSet<u64> = merged_ids.iter().copied().collect();
        let old_disk_id = old_disk.id();

        let published = self.ctx.layout.update(|current| {
            let mut layout = current.clone();
            layout.read_only_segments.retain(|s| !merged.contains(&s.id()));

            let mut records = Vec::with_capacity(4);
            if new_id != NULL_SEGMENT_ID {
                records.push(LayoutRecord::DiskSegmentCreated(new_id));
            }
            if demote {
                layout.bottom_segments.insert(0, Arc::clone(&segment));
                layout.disk_segment = NullDiskSegment::arc();
                records.push(LayoutRecord::BottomSegments(
                    layout.bottom_segments.iter().map(|s| s.id()).collect(),
                ));
                records.push(LayoutRecord::DiskSegmentActivated(NULL_SEGMENT_ID));
            } else {
                layout.disk_segment = Arc::clone(&segment);
                records.push(LayoutRecord::DiskSegmentActivated(new_id));
            }
            records.push(LayoutRecord::ReadOnlySegmentsRemoved(merged_ids.clone()));
            if old_disk_id != NULL_SEGMENT_ID {
                records.push(LayoutRecord::DiskSegmentsRemoved(vec![old_disk_id]));
            }
            Ok(Some(LayoutChange::new(layout, records)))
        });
        let observer = &self.ctx.observer;
        let unlogged = match published {
            Ok(_) => None,
            Err(e @ Error::LayoutNotLogged(_)) => Some(e),
            Err(e) => {
                let base_parts: HashSet<u64> = old_disk.part_ids().into_iter().collect();
                drop_disk_segment(observer.as_ref(), &segment, &base_parts);
                return Err(e);
            }
        };

        if new_id != NULL_SEGMENT_ID {
            observer.on_disk_segment_created(new_id);
            if demote {
                observer.on_disk_segment_demoted(new_id);
            } else {
                observer.on_disk_segment_activated(new_id);
            }
        }

        // The manifest still names the old disk segment until it is logged.
        if unlogged.is_none() {
            let reused: HashSet<u64> = segment.part_ids().into_iter().collect();
            drop_disk_segment(observer.as_ref(), &old_disk, &reused);
        }
        for segment in &read_only {
            segment.release();
        }
        if let Some(e) = unlogged {
            return Err(e);
        }

        info!(
            segment_id = new_id,
            merged = merged_ids.len(),
            entries = segment.len(),
            demoted = demote,
            parts_skipped = stats.parts_skipped,
            elapsed_ms = stats.elapsed_ms,
            "flush merge finished"
        );
        Ok((MergeResult::Success, Some(stats)))
    }
}

/// Wait until no writer is left inside any of `segments`.
fn wait_until_fully_frozen(segments: &[Arc<dyn ReadOnlySegment>], timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if segments.iter().all(|s| s.is_fully_frozen()) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::testing::{files, rotate, test_context, TriggerAfter};
    use crate::options::DiskSegmentMode;
    use crate::segment::{MutableSegment, SegmentIterator};
    use std::sync::Weak;
    use crate::manifest::LayoutRecord;
    use crate::options::Options;
    use crate::segment::MemorySegment;
    use crate::types::Value;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn put(ctx: &SegmentContext, key: &str, value: &str) {
        ctx.layout
            .load()
            .mutable_segment()
            .upsert(Bytes::from(key.to_string()), Bytes::from(value.to_string()));
    }

    #[test]
    fn test_nothing_to_merge() {
        let dir = tempdir().unwrap();
        let (ctx, _, _) = test_context(dir.path(), Options::default());
        let flush = FlushMerge::new(ctx);
        assert_eq!(flush.run().unwrap(), MergeResult::NothingToMerge);
    }

    #[test]
    fn test_flush_activates_new_disk_segment() {
        let dir = tempdir().unwrap();
        let (ctx, log, observer) = test_context(dir.path(), Options::default());
        put(&ctx, "a", "1");
        put(&ctx, "b", "2");
        let frozen = rotate(&ctx);
        put(&ctx, "c", "3");

        let flush = FlushMerge::new(Arc::clone(&ctx));
        assert_eq!(flush.run().unwrap(), MergeResult::Success);

        let layout = ctx.layout.load();
        assert!(layout.read_only_segments().is_empty());
        assert!(layout.has_disk_segment());
        assert_eq!(layout.disk_segment().len(), 2);
        assert_eq!(layout.find(b"a"), Some(Value::put("1")));
        assert_eq!(layout.find(b"c"), Some(Value::put("3")));

        let disk_id = layout.disk_segment().id();
        assert_eq!(
            log.batches().last().unwrap(),
            &vec![
                LayoutRecord::DiskSegmentCreated(disk_id),
                LayoutRecord::DiskSegmentActivated(disk_id),
                LayoutRecord::ReadOnlySegmentsRemoved(vec![frozen]),
            ]
        );
        let events = observer.events();
        assert!(events.contains(&format!("activated {}", disk_id)));
        assert!(events.contains(&"ended Flush Success".to_string()));
    }

    #[test]
    fn test_flush_replaces_previous_disk_segment() {
        let dir = tempdir().unwrap();
        let (ctx, log, _) = test_context(dir.path(), Options::default());
        let flush = FlushMerge::new(Arc::clone(&ctx));

        put(&ctx, "a", "old");
        put(&ctx, "b", "2");
        rotate(&ctx);
        flush.run().unwrap();
        let first = ctx.layout.load().disk_segment().id();

        put(&ctx, "a", "new");
        rotate(&ctx);
        flush.run().unwrap();

        let layout = ctx.layout.load();
        assert_ne!(layout.disk_segment().id(), first);
        assert_eq!(layout.disk_segment().try_get(b"a"), Some(Value::put("new")));
        assert_eq!(layout.disk_segment().len(), 2);
        assert!(log
            .batches()
            .last()
            .unwrap()
            .contains(&LayoutRecord::DiskSegmentsRemoved(vec![first])));
    }

    #[test]
    fn test_flush_demotes_large_output() {
        let dir = tempdir().unwrap();
        let options = Options {
            disk_segment_max_item_count: 2,
            ..Options::default()
        };
        let (ctx, log, observer) = test_context(dir.path(), options);
        let flush = FlushMerge::new(Arc::clone(&ctx));

        for key in ["a", "b", "c"] {
            put(&ctx, key, "v");
        }
        rotate(&ctx);
        assert_eq!(flush.run().unwrap(), MergeResult::Success);

        let layout = ctx.layout.load();
        assert!(!layout.has_disk_segment());
        assert_eq!(layout.bottom_segments().len(), 1);
        let bottom_id = layout.bottom_segments()[0].id();
        assert_eq!(layout.find(b"b"), Some(Value::put("v")));

        let batch = log.batches().last().unwrap().clone();
        assert_eq!(batch[0], LayoutRecord::DiskSegmentCreated(bottom_id));
        assert_eq!(batch[1], LayoutRecord::BottomSegments(vec![bottom_id]));
        assert_eq!(batch[2], LayoutRecord::DiskSegmentActivated(0));
        assert!(observer.events().contains(&format!("demoted {}", bottom_id)));
    }

    #[test]
    fn test_tombstones_kept_above_bottom_tier() {
        let dir = tempdir().unwrap();
        let options = Options {
            disk_segment_max_item_count: 1,
            ..Options::default()
        };
        let (ctx, _, _) = test_context(dir.path(), options);
        let flush = FlushMerge::new(Arc::clone(&ctx));

        // Two entries exceed the limit, so this output lands in the bottom tier.
        put(&ctx, "k", "v1");
        put(&ctx, "z", "v1");
        rotate(&ctx);
        flush.run().unwrap();

        ctx.layout.load().mutable_segment().delete(Bytes::from("k"));
        rotate(&ctx);
        flush.run().unwrap();

        let layout = ctx.layout.load();
        assert_eq!(layout.disk_segment().try_get(b"k"), Some(Value::Deleted));
        assert_eq!(layout.find(b"k"), Some(Value::Deleted));
        assert_eq!(layout.bottom_segments()[0].try_get(b"k"), Some(Value::put("v1")));
    }

    #[test]
    fn test_not_ready_when_writer_inside() {
        let dir = tempdir().unwrap();
        let options = Options {
            read_only_wait_timeout: Duration::from_millis(20),
            ..Options::default()
        };
        let (ctx, _, _) = test_context(dir.path(), options);

        let busy = Arc::new(BusySegment(MemorySegment::new(77, 10)));
        ctx.layout
            .update(|old| {
                let mut layout = old.clone();
                layout.read_only_segments.insert(0, busy.clone());
                Ok(Some(LayoutChange::new(layout, vec![])))
            })
            .unwrap();

        let flush = FlushMerge::new(Arc::clone(&ctx));
        assert_eq!(
            flush.run().unwrap(),
            MergeResult::RetryReadonlySegmentsAreNotReady
        );
        assert_eq!(ctx.layout.load().read_only_segments().len(), 1);
    }

    #[test]
    fn test_cancelled_flush_keeps_layout() {
        let dir = tempdir().unwrap();
        let (ctx, log, _) = test_context(dir.path(), Options::default());
        put(&ctx, "a", "1");
        rotate(&ctx);
        let before = ctx.layout.load();
        let batches = log.batches().len();

        let flush = FlushMerge::new(Arc::clone(&ctx));
        assert!(!flush.try_cancel());
        let result = {
            let _guard = flush.control.try_begin().unwrap();
            assert!(flush.try_cancel());
            flush.merge_locked().unwrap().0
        };

        assert_eq!(result, MergeResult::CancelledByUser);
        let after = ctx.layout.load();
        assert_eq!(
            after.read_only_segments()[0].id(),
            before.read_only_segments()[0].id()
        );
        assert!(!after.has_disk_segment());
        assert_eq!(log.batches().len(), batches);
    }

    #[test]
    fn test_unlogged_flush_is_fatal() {
        let dir = tempdir().unwrap();
        let (ctx, log, observer) = test_context(dir.path(), Options::default());
        let flush = FlushMerge::new(Arc::clone(&ctx));
        put(&ctx, "a", "old");
        rotate(&ctx);
        flush.run().unwrap();
        let first = ctx.layout.load().disk_segment().id();
        let files_before = files(dir.path());

        let frozen = Arc::new(MemorySegment::new(ctx.ids.next_id(), 10));
        frozen.upsert(Bytes::from("a"), Bytes::from("new"));
        let read_only = Arc::clone(&frozen).freeze();
        ctx.layout
            .update(|old| {
                let mut layout = old.clone();
                layout.read_only_segments.insert(0, read_only);
                Ok(Some(LayoutChange::new(layout, vec![])))
            })
            .unwrap();

        log.fail_appends(true);
        let err = flush.run().unwrap_err();
        assert!(matches!(err, Error::LayoutNotLogged(_)));
        assert!(err.is_fatal());

        // The new layout is live, so the merged memory is handed back.
        let layout = ctx.layout.load();
        assert!(layout.read_only_segments().is_empty());
        assert_ne!(layout.disk_segment().id(), first);
        assert_eq!(layout.find(b"a"), Some(Value::put("new")));
        assert!(frozen.is_released());

        // The logged disk segment is still on disk for the next open.
        let files_after = files(dir.path());
        assert!(files_before.iter().all(|f| files_after.contains(f)));

        let events = observer.events();
        assert!(events.contains(&format!("activated {}", layout.disk_segment().id())));
        assert!(events.contains(&"failed Flush".to_string()));
        assert!(!events.iter().any(|e| e.starts_with("can_not_drop")));

        log.fail_appends(false);
        assert!(matches!(flush.run(), Err(Error::LayoutPoisoned)));
    }

    #[test]
    fn test_cancel_mid_flush_keeps_layout_and_base_parts() {
        let dir = tempdir().unwrap();
        let options = Options {
            disk_segment_mode: DiskSegmentMode::MultiPart,
            min_records_per_part: 1,
            max_records_per_part: 4,
            enable_part_skip: true,
            ..Options::default()
        };
        let (ctx, log, observer) = test_context(dir.path(), options);
        let flush = Arc::new(FlushMerge::new(Arc::clone(&ctx)));

        for i in 0..16 {
            put(&ctx, &format!("key{:02}", i * 2), "base");
        }
        rotate(&ctx);
        flush.run().unwrap();
        let base_parts = ctx.layout.load().disk_segment().part_ids();
        assert_eq!(base_parts.len(), 4);

        // Only the second and third base parts overlap the newer keys.
        let newer = Arc::new(MemorySegment::new(ctx.ids.next_id(), 100));
        for k in ["key09", "key10", "key21"] {
            newer.upsert(Bytes::from(k), Bytes::from("new"));
        }
        let segment: Arc<dyn ReadOnlySegment> = Arc::new(CancellingSegment {
            inner: Arc::clone(&newer),
            flush: Arc::downgrade(&flush),
        });
        ctx.layout
            .update(|old| {
                let mut layout = old.clone();
                layout.read_only_segments.insert(0, segment);
                Ok(Some(LayoutChange::new(layout, vec![])))
            })
            .unwrap();
        let before = ctx.layout.load();
        let batches = log.batches().len();
        let files_before = files(dir.path());

        assert_eq!(flush.run().unwrap(), MergeResult::CancelledByUser);

        let after = ctx.layout.load();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(log.batches().len(), batches);
        assert_eq!(files(dir.path()), files_before);
        assert_eq!(after.disk_segment().part_ids(), base_parts);
        assert_eq!(after.find(b"key00"), Some(Value::put("base")));
        assert_eq!(after.find(b"key10"), Some(Value::put("new")));
        assert!(!newer.is_released());
        assert!(observer
            .events()
            .contains(&"ended Flush CancelledByUser".to_string()));
        assert!(!flush.try_cancel());
    }

    /// Read-only segment whose iterator cancels `flush` partway through.
    struct CancellingSegment {
        inner: Arc<MemorySegment>,
        flush: Weak<FlushMerge>,
    }

    impl ReadOnlySegment for CancellingSegment {
        fn id(&self) -> u64 {
            ReadOnlySegment::id(self.inner.as_ref())
        }

        fn len(&self) -> usize {
            ReadOnlySegment::len(self.inner.as_ref())
        }

        fn try_get(&self, key: &[u8]) -> Option<Value> {
            ReadOnlySegment::try_get(self.inner.as_ref(), key)
        }

        fn is_fully_frozen(&self) -> bool {
            true
        }

        fn iter(self: Arc<Self>) -> Box<dyn SegmentIterator> {
            let flush = self.flush.clone();
            let inner = ReadOnlySegment::iter(Arc::clone(&self.inner));
            Box::new(TriggerAfter::new(inner, 2, move || {
                if let Some(flush) = flush.upgrade() {
                    assert!(flush.try_cancel());
                }
            }))
        }

        fn release(&self) {
            ReadOnlySegment::release(self.inner.as_ref());
        }
    }

    /// Read-only segment that always reports a writer inside.
    struct BusySegment(MemorySegment);

    impl ReadOnlySegment for BusySegment {
        fn id(&self) -> u64 {
            ReadOnlySegment::id(&self.0)
        }

        fn len(&self) -> usize {
            ReadOnlySegment::len(&self.0)
        }

        fn try_get(&self, key: &[u8]) -> Option<Value> {
            ReadOnlySegment::try_get(&self.0, key)
        }

        fn is_fully_frozen(&self) -> bool {
            false
        }

        fn iter(self: Arc<Self>) -> Box<dyn SegmentIterator> {
            Box::new(crate::segment::EmptyIterator)
        }

        fn release(&self) {}
    }
}
