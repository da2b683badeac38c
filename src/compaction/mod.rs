//! Compaction - merging segments into new disk segments.
//!
//! The compaction module is responsible for:
//! - Merging sorted sources into one disk segment ([`Merger`])
//! - Flushing read-only segments into the active disk segment
//!   ([`FlushMerge`]), demoting oversized results into the bottom tier
//! - Merging contiguous ranges of the bottom tier ([`BottomMerge`])
//! - Running both on background threads ([`Maintainer`])
//!
//! # Merge Process
//!
//! 1. Take the merge lock; a second merge of the same kind backs off
//! 2. Snapshot the layout and merge its inputs outside any publish lock
//! 3. Publish the new layout and log the change atomically
//! 4. Drop the segments that were merged away

pub mod background;
pub mod bottom_merge;
pub mod flush_merge;
pub mod merge_iterator;
pub mod merger;

pub use background::Maintainer;
pub use bottom_merge::BottomMerge;
pub use flush_merge::FlushMerge;
pub use merge_iterator::{LiveEntryIterator, MergeIterator};
pub use merger::{MergeOutcome, MergeRequest, MergeSettings, MergeStats, Merger};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::events::EngineObserver;
use crate::segment::{DiskSegment, NULL_SEGMENT_ID};

/// Lock and cancel flag of one orchestrator.
///
/// The flag is only ever raised while a merge holds the lock and is lowered
/// before that lock is released, so a cancel request never outlives the
/// merge it was aimed at.
#[derive(Debug, Default)]
pub(crate) struct MergeControl {
    lock: Mutex<()>,
    cancel: AtomicBool,
    /// Orders cancel requests against the end of a merge.
    cancel_lock: Mutex<()>,
}

/// Held for the duration of one merge.
pub(crate) struct MergeGuard<'a> {
    control: &'a MergeControl,
    lock: Option<MutexGuard<'a, ()>>,
}

impl Drop for MergeGuard<'_> {
    fn drop(&mut self) {
        let _cancel = self.control.cancel_lock.lock();
        self.control.cancel.store(false, Ordering::SeqCst);
        drop(self.lock.take());
    }
}

impl MergeControl {
    /// Take the lock without waiting.
    pub(crate) fn try_begin(&self) -> Option<MergeGuard<'_>> {
        let lock = self.lock.try_lock()?;
        Some(MergeGuard {
            control: self,
            lock: Some(lock),
        })
    }

    /// Ask the running merge to stop. Returns false when none is running.
    pub(crate) fn try_cancel(&self) -> bool {
        let _cancel = self.cancel_lock.lock();
        if !self.lock.is_locked() {
            return false;
        }
        self.cancel.store(true, Ordering::SeqCst);
        true
    }

    pub(crate) fn cancel_flag(&self) -> &AtomicBool {
        &self.cancel
    }
}

/// Delete an obsolete disk segment, keeping the parts in `exclude`.
///
/// Failures are logged and reported, never returned.
pub(crate) fn drop_disk_segment(
    observer: &dyn EngineObserver,
    segment: &Arc<dyn DiskSegment>,
    exclude: &HashSet<u64>,
) {
    let id = segment.id();
    if id == NULL_SEGMENT_ID {
        return;
    }
    match segment.drop_segment(exclude) {
        Ok(()) => debug!(segment_id = id, "dropped disk segment"),
        Err(e) => {
            warn!(segment_id = id, error = %e, "can not drop disk segment");
            observer.on_can_not_drop_disk_segment(id, &e);
        }
    }
}
