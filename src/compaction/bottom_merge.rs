//! Bottom merge: a contiguous range of the bottom tier into one segment.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{error, info};

use crate::events::MergeKind;
use crate::layout::{LayoutChange, SegmentContext};
use crate::manifest::LayoutRecord;
use crate::segment::NULL_SEGMENT_ID;
use crate::types::MergeResult;
use crate::{Error, Result};

use super::merger::{MergeOutcome, MergeRequest, MergeSettings, MergeStats, Merger};
use super::{drop_disk_segment, MergeControl};

/// Merges bottom-tier segments `from..=to` (newest-first indices).
pub struct BottomMerge {
    ctx: Arc<SegmentContext>,
    control: MergeControl,
}

impl BottomMerge {
    /// Create the orchestrator.
    pub fn new(ctx: Arc<SegmentContext>) -> Self {
        Self {
            ctx,
            control: MergeControl::default(),
        }
    }

    /// Ask a running bottom merge to stop.
    pub fn try_cancel(&self) -> bool {
        self.control.try_cancel()
    }

    /// Run one bottom merge on the calling thread.
    ///
    /// The range must hold at least two segments and lie inside the tier.
    pub fn run(&self, from: usize, to: usize) -> Result<MergeResult> {
        if from >= to {
            let len = self.ctx.layout.load().bottom_segments().len();
            return Err(Error::InvalidMergeRange { from, to, len });
        }
        let Some(_guard) = self.control.try_begin() else {
            return Ok(MergeResult::AnotherMergeIsRunning);
        };

        // The tier only shrinks under this lock, so the check holds.
        let len = self.ctx.layout.load().bottom_segments().len();
        if to >= len {
            return Err(Error::InvalidMergeRange { from, to, len });
        }

        let observer = &self.ctx.observer;
        observer.on_merge_operation_started(MergeKind::Bottom);

        match self.merge_locked(from, to) {
            Ok((result, stats)) => {
                observer.on_merge_operation_ended(MergeKind::Bottom, result, stats.as_ref());
                Ok(result)
            }
            Err(e) => {
                error!(from, to, error = %e, "bottom merge failed");
                observer.on_merge_operation_failed(MergeKind::Bottom, &e);
                Err(e)
            }
        }
    }

    fn merge_locked(&self, from: usize, to: usize) -> Result<(MergeResult, Option<MergeStats>)> {
        self.ctx.layout.check_healthy()?;
        let snapshot = self.ctx.layout.load();
        let tier_len = snapshot.bottom_segments().len();
        let selected = snapshot.bottom_segments()[from..=to].to_vec();
        drop(snapshot);

        let selected_ids: Vec<u64> = selected.iter().map(|s| s.id()).collect();
        let Some((base, newer)) = selected.split_last() else {
            return Ok((MergeResult::NothingToMerge, None));
        };

        let request = MergeRequest {
            sources: newer.iter().map(|s| Arc::clone(s).iter()).collect(),
            base: Some(Arc::clone(base)),
            // Older segments below the range may still hold shadowed values.
            write_deleted_values: to + 1 < tier_len,
        };

        let creator = self.ctx.store.create_creator()?;
        let merger = Merger::new(
            MergeSettings::from_options(&self.ctx.options),
            self.control.cancel_flag(),
        );
        let (segment, stats) = match merger.merge(request, creator)? {
            MergeOutcome::Completed { segment, stats } => (segment, stats),
            MergeOutcome::Cancelled => return Ok((MergeResult::CancelledByUser, None)),
        };
        let new_id = segment.id();

        let published = self.ctx.layout.update(|current| {
            let mut layout = current.clone();

            // Flush merges may have prepended segments since the snapshot.
            let start = layout
                .bottom_segments
                .iter()
                .position(|s| s.id() == selected_ids[0])
                .ok_or_else(|| Error::internal("merged bottom segments left the layout"))?;
            let end = start + selected_ids.len();
            let still_contiguous = layout
                .bottom_segments
                .get(start..end)
                .is_some_and(|range| range.iter().map(|s| s.id()).eq(selected_ids.iter().copied()));
            if !still_contiguous {
                return Err(Error::internal("merged bottom segments are no longer contiguous"));
            }

            let replacement = (new_id != NULL_SEGMENT_ID).then(|| Arc::clone(&segment));
            layout.bottom_segments.splice(start..end, replacement);

            let mut records = Vec::with_capacity(3);
            if new_id != NULL_SEGMENT_ID {
                records.push(LayoutRecord::DiskSegmentCreated(new_id));
            }
            records.push(LayoutRecord::BottomSegments(
                layout.bottom_segments.iter().map(|s| s.id()).collect(),
            ));
            records.push(LayoutRecord::DiskSegmentsRemoved(selected_ids.clone()));
            Ok(Some(LayoutChange::new(layout, records)))
        });
        let observer = &self.ctx.observer;
        match published {
            Ok(_) => {}
            Err(e @ Error::LayoutNotLogged(_)) => {
                // Live but unlogged: the manifest still names the merged segments.
                if new_id != NULL_SEGMENT_ID {
                    observer.on_disk_segment_created(new_id);
                }
                return Err(e);
            }
            Err(e) => {
                let base_parts: HashSet<u64> = base.part_ids().into_iter().collect();
                drop_disk_segment(observer.as_ref(), &segment, &base_parts);
                return Err(e);
            }
        }

        if new_id != NULL_SEGMENT_ID {
            observer.on_disk_segment_created(new_id);
        }

        let reused: HashSet<u64> = segment.part_ids().into_iter().collect();
        for old in &selected {
            drop_disk_segment(observer.as_ref(), old, &reused);
        }

        info!(
            segment_id = new_id,
            from,
            to,
            merged = selected_ids.len(),
            entries = segment.len(),
            parts_skipped = stats.parts_skipped,
            elapsed_ms = stats.elapsed_ms,
            "bottom merge finished"
        );
        Ok((MergeResult::Success, Some(stats)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::testing::{files, rotate, test_context};
    use crate::compaction::FlushMerge;
    use crate::options::Options;
    use crate::types::Value;
    use bytes::Bytes;
    use tempfile::tempdir;

    /// Flush `entries` straight into a new bottom segment.
    fn demote(ctx: &Arc<SegmentContext>, flush: &FlushMerge, entries: &[(&str, Option<&str>)]) {
        let mutable = Arc::clone(ctx.layout.load().mutable_segment());
        for (key, value) in entries {
            let key = Bytes::from(key.to_string());
            match value {
                Some(v) => mutable.upsert(key, Bytes::from(v.to_string())),
                None => mutable.delete(key),
            };
        }
        rotate(ctx);
        assert_eq!(flush.run().unwrap(), MergeResult::Success);
    }

    fn setup(dir: &std::path::Path) -> (Arc<SegmentContext>, FlushMerge, BottomMerge) {
        // Any output of more than zero entries is demoted.
        let options = Options {
            disk_segment_max_item_count: 0,
            ..Options::default()
        };
        let (ctx, _, _) = test_context(dir, options);
        let flush = FlushMerge::new(Arc::clone(&ctx));
        let bottom = BottomMerge::new(Arc::clone(&ctx));
        (ctx, flush, bottom)
    }

    fn bottom_ids(ctx: &SegmentContext) -> Vec<u64> {
        ctx.layout
            .load()
            .bottom_segments()
            .iter()
            .map(|s| s.id())
            .collect()
    }

    #[test]
    fn test_invalid_ranges() {
        let dir = tempdir().unwrap();
        let (ctx, flush, bottom) = setup(dir.path());
        demote(&ctx, &flush, &[("a", Some("1"))]);
        demote(&ctx, &flush, &[("b", Some("2"))]);

        assert!(matches!(
            bottom.run(1, 1),
            Err(Error::InvalidMergeRange { from: 1, to: 1, len: 2 })
        ));
        assert!(matches!(
            bottom.run(0, 2),
            Err(Error::InvalidMergeRange { from: 0, to: 2, len: 2 })
        ));
        assert_eq!(bottom_ids(&ctx).len(), 2);
    }

    #[test]
    fn test_merge_prefix_keeps_tail() {
        let dir = tempdir().unwrap();
        let (ctx, flush, bottom) = setup(dir.path());
        demote(&ctx, &flush, &[("k", Some("oldest")), ("x", Some("1"))]);
        demote(&ctx, &flush, &[("k", Some("middle")), ("y", Some("2"))]);
        demote(&ctx, &flush, &[("k", Some("newest")), ("z", None)]);

        let before = bottom_ids(&ctx);
        assert_eq!(before.len(), 3);
        assert_eq!(bottom.run(0, 1).unwrap(), MergeResult::Success);

        let after = bottom_ids(&ctx);
        assert_eq!(after.len(), 2);
        assert_eq!(after[1], before[2]);
        assert!(!before.contains(&after[0]));

        let layout = ctx.layout.load();
        let merged = &layout.bottom_segments()[0];
        assert_eq!(merged.try_get(b"k"), Some(Value::put("newest")));
        assert_eq!(merged.try_get(b"y"), Some(Value::put("2")));
        // A tombstone above an untouched older segment survives.
        assert_eq!(merged.try_get(b"z"), Some(Value::Deleted));
        assert_eq!(layout.find(b"x"), Some(Value::put("1")));
    }

    #[test]
    fn test_merge_whole_tier_drops_tombstones() {
        let dir = tempdir().unwrap();
        let (ctx, flush, bottom) = setup(dir.path());
        demote(&ctx, &flush, &[("a", Some("1")), ("b", Some("1"))]);
        demote(&ctx, &flush, &[("a", None)]);

        assert_eq!(bottom.run(0, 1).unwrap(), MergeResult::Success);

        let layout = ctx.layout.load();
        assert_eq!(layout.bottom_segments().len(), 1);
        let merged = &layout.bottom_segments()[0];
        assert_eq!(merged.try_get(b"a"), None);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_fully_deleted_range_disappears() {
        let dir = tempdir().unwrap();
        let (ctx, flush, bottom) = setup(dir.path());
        demote(&ctx, &flush, &[("a", Some("1"))]);
        demote(&ctx, &flush, &[("a", None)]);

        assert_eq!(bottom.run(0, 1).unwrap(), MergeResult::Success);
        assert!(bottom_ids(&ctx).is_empty());
    }

    #[test]
    fn test_unlogged_merge_keeps_merged_files() {
        let dir = tempdir().unwrap();
        let options = Options {
            disk_segment_max_item_count: 0,
            ..Options::default()
        };
        let (ctx, log, observer) = test_context(dir.path(), options);
        let flush = FlushMerge::new(Arc::clone(&ctx));
        let bottom = BottomMerge::new(Arc::clone(&ctx));
        demote(&ctx, &flush, &[("a", Some("1"))]);
        demote(&ctx, &flush, &[("b", Some("2"))]);
        let files_before = files(dir.path());

        log.fail_appends(true);
        let err = bottom.run(0, 1).unwrap_err();
        assert!(matches!(err, Error::LayoutNotLogged(_)));
        assert!(observer.events().contains(&"failed Bottom".to_string()));

        // Readers see the merged segment while the logged ones stay on disk.
        let layout = ctx.layout.load();
        assert_eq!(layout.bottom_segments().len(), 1);
        assert_eq!(layout.find(b"a"), Some(Value::put("1")));
        assert_eq!(layout.find(b"b"), Some(Value::put("2")));
        let files_after = files(dir.path());
        assert!(files_before.iter().all(|f| files_after.contains(f)));

        log.fail_appends(false);
        assert!(matches!(flush.run(), Err(Error::LayoutPoisoned)));
        assert!(matches!(bottom.run(0, 1), Err(Error::InvalidMergeRange { .. })));
    }

    #[test]
    fn test_cancel_without_running_merge() {
        let dir = tempdir().unwrap();
        let (_, _, bottom) = setup(dir.path());
        assert!(!bottom.try_cancel());
    }
}
