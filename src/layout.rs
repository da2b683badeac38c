//! Segment layout and its atomic publication.
//!
//! A [`SegmentLayout`] is an immutable snapshot of every segment visible to
//! readers. [`LayoutState`] holds the current snapshot behind an
//! [`ArcSwap`]: readers load it without locking, while every change goes
//! through [`LayoutState::update`], which serializes transforms under one
//! publish lock and pairs each publish with a manifest append.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::error;

use crate::events::EngineObserver;
use crate::manifest::{LayoutLog, LayoutRecord};
use crate::options::Options;
use crate::segment::{
    DiskSegment, DiskSegmentStore, MutableSegment, NullDiskSegment, ReadOnlySegment,
    SegmentIdGenerator, NULL_SEGMENT_ID,
};
use crate::types::Value;
use crate::{Error, Result};

/// Immutable snapshot of all visible segments.
#[derive(Clone)]
pub struct SegmentLayout {
    pub(crate) mutable_segment: Arc<dyn MutableSegment>,
    /// Newest first.
    pub(crate) read_only_segments: Vec<Arc<dyn ReadOnlySegment>>,
    /// Null segment when there is no active disk segment.
    pub(crate) disk_segment: Arc<dyn DiskSegment>,
    /// Newest first.
    pub(crate) bottom_segments: Vec<Arc<dyn DiskSegment>>,
}

impl SegmentLayout {
    /// Create a layout from its parts.
    pub fn new(
        mutable_segment: Arc<dyn MutableSegment>,
        read_only_segments: Vec<Arc<dyn ReadOnlySegment>>,
        disk_segment: Arc<dyn DiskSegment>,
        bottom_segments: Vec<Arc<dyn DiskSegment>>,
    ) -> Self {
        Self {
            mutable_segment,
            read_only_segments,
            disk_segment,
            bottom_segments,
        }
    }

    /// Layout holding only a mutable segment.
    pub fn with_mutable(mutable_segment: Arc<dyn MutableSegment>) -> Self {
        Self::new(mutable_segment, Vec::new(), NullDiskSegment::arc(), Vec::new())
    }

    /// The live mutable segment.
    pub fn mutable_segment(&self) -> &Arc<dyn MutableSegment> {
        &self.mutable_segment
    }

    /// Read-only segments, newest first.
    pub fn read_only_segments(&self) -> &[Arc<dyn ReadOnlySegment>] {
        &self.read_only_segments
    }

    /// The active disk segment.
    pub fn disk_segment(&self) -> &Arc<dyn DiskSegment> {
        &self.disk_segment
    }

    /// Check if there is an active disk segment.
    pub fn has_disk_segment(&self) -> bool {
        self.disk_segment.id() != NULL_SEGMENT_ID
    }

    /// Bottom tier, newest first.
    pub fn bottom_segments(&self) -> &[Arc<dyn DiskSegment>] {
        &self.bottom_segments
    }

    /// Active disk segment (when present) followed by the bottom tier,
    /// newest first.
    pub fn ordered_all_disk_segments(&self) -> Vec<Arc<dyn DiskSegment>> {
        let mut segments = Vec::with_capacity(self.bottom_segments.len() + 1);
        if self.has_disk_segment() {
            segments.push(Arc::clone(&self.disk_segment));
        }
        segments.extend(self.bottom_segments.iter().cloned());
        segments
    }

    /// Look a key up across every tier, newest first.
    ///
    /// Returns the first version found, tombstones included.
    pub fn find(&self, key: &[u8]) -> Option<Value> {
        if let Some(value) = self.mutable_segment.try_get(key) {
            return Some(value);
        }
        if let Some(value) = self.read_only_segments.iter().find_map(|s| s.try_get(key)) {
            return Some(value);
        }
        if let Some(value) = self.disk_segment.try_get(key) {
            return Some(value);
        }
        self.bottom_segments.iter().find_map(|s| s.try_get(key))
    }

    /// Total entries across tiers, duplicates included.
    #[cfg(test)]
    pub(crate) fn total_len(&self) -> usize {
        self.mutable_segment.len()
            + self.read_only_segments.iter().map(|s| s.len()).sum::<usize>()
            + self.disk_segment.len()
            + self.bottom_segments.iter().map(|s| s.len()).sum::<usize>()
    }
}

impl fmt::Debug for SegmentLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentLayout")
            .field("mutable_segment", &self.mutable_segment.id())
            .field(
                "read_only_segments",
                &self.read_only_segments.iter().map(|s| s.id()).collect::<Vec<_>>(),
            )
            .field("disk_segment", &self.disk_segment.id())
            .field(
                "bottom_segments",
                &self.bottom_segments.iter().map(|s| s.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// A new layout together with the records describing it.
pub struct LayoutChange {
    /// Layout to publish.
    pub layout: SegmentLayout,
    /// Records appended to the manifest after publishing.
    pub records: Vec<LayoutRecord>,
}

impl LayoutChange {
    /// Create a change.
    pub fn new(layout: SegmentLayout, records: Vec<LayoutRecord>) -> Self {
        Self { layout, records }
    }
}

/// Current layout plus the publish protocol.
pub struct LayoutState {
    current: ArcSwap<SegmentLayout>,
    publish_lock: Mutex<()>,
    log: Arc<dyn LayoutLog>,
    /// Set once a published layout could not be logged.
    poisoned: AtomicBool,
}

impl LayoutState {
    /// Create the state with an initial layout.
    pub fn new(initial: SegmentLayout, log: Arc<dyn LayoutLog>) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            publish_lock: Mutex::new(()),
            log,
            poisoned: AtomicBool::new(false),
        }
    }

    /// Load the current snapshot.
    pub fn load(&self) -> Arc<SegmentLayout> {
        self.current.load_full()
    }

    /// Whether a published layout is missing from the log.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn mark_poisoned(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    /// Fail with [`Error::LayoutPoisoned`] once the layout is ahead of the log.
    pub fn check_healthy(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(Error::LayoutPoisoned);
        }
        Ok(())
    }

    /// Compute and publish a new layout.
    ///
    /// `transform` runs under the publish lock against the layout current at
    /// that moment and may decline by returning `Ok(None)`. The new layout is
    /// stored first and its records appended to the log second. An error
    /// from `transform` leaves the layout untouched.
    ///
    /// A failed append cannot be undone, since readers may already hold the
    /// new snapshot. It returns [`Error::LayoutNotLogged`] and poisons the
    /// state: every later update fails with [`Error::LayoutPoisoned`].
    pub fn update<F>(&self, transform: F) -> Result<Option<Arc<SegmentLayout>>>
    where
        F: FnOnce(&SegmentLayout) -> Result<Option<LayoutChange>>,
    {
        let _guard = self.publish_lock.lock();
        self.check_healthy()?;
        let old = self.current.load_full();

        let Some(change) = transform(old.as_ref())? else {
            return Ok(None);
        };

        let new = Arc::new(change.layout);
        self.current.store(Arc::clone(&new));

        if let Err(e) = self.log.append(&change.records) {
            self.poisoned.store(true, Ordering::SeqCst);
            error!(error = %e, records = change.records.len(), "failed to log layout change");
            return Err(Error::LayoutNotLogged(e.to_string()));
        }
        Ok(Some(new))
    }
}

/// Shared collaborators of the write path and the orchestrators.
pub struct SegmentContext {
    /// Engine configuration.
    pub options: Options,
    /// Current layout.
    pub layout: LayoutState,
    /// Disk segment factory.
    pub store: Arc<dyn DiskSegmentStore>,
    /// Lifecycle observer.
    pub observer: Arc<dyn EngineObserver>,
    /// Segment id source.
    pub ids: Arc<SegmentIdGenerator>,
}
