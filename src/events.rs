//! Lifecycle notifications.

use crate::compaction::MergeStats;
use crate::types::MergeResult;
use crate::Error;

/// Which orchestrator a merge notification comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// Read-only segments merged into the active disk segment.
    Flush,
    /// A range of bottom-tier segments merged together.
    Bottom,
}

/// Receives engine lifecycle events.
///
/// Callbacks run on the thread that caused the event, sometimes while a
/// merge lock is held, so they must not call back into merge operations.
#[allow(unused_variables)]
pub trait EngineObserver: Send + Sync {
    /// The mutable segment was frozen and a new one became live.
    fn on_mutable_segment_moved_forward(&self, frozen_id: u64, new_id: u64) {}

    /// A merge acquired its lock and started.
    fn on_merge_operation_started(&self, kind: MergeKind) {}

    /// A merge finished, whatever the outcome.
    fn on_merge_operation_ended(
        &self,
        kind: MergeKind,
        result: MergeResult,
        stats: Option<&MergeStats>,
    ) {
    }

    /// A merge failed with an error.
    fn on_merge_operation_failed(&self, kind: MergeKind, error: &Error) {}

    /// A merge produced a new disk segment.
    fn on_disk_segment_created(&self, id: u64) {}

    /// A disk segment became the active one.
    fn on_disk_segment_activated(&self, id: u64) {}

    /// A disk segment moved into the bottom tier.
    fn on_disk_segment_demoted(&self, id: u64) {}

    /// Removing an obsolete disk segment failed.
    fn on_can_not_drop_disk_segment(&self, id: u64, error: &Error) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl EngineObserver for NoopObserver {}

/// Observer recording events for assertions.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingObserver {
    pub(crate) events: parking_lot::Mutex<Vec<String>>,
    pub(crate) stats: parking_lot::Mutex<Vec<MergeStats>>,
}

#[cfg(test)]
impl RecordingObserver {
    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
impl EngineObserver for RecordingObserver {
    fn on_mutable_segment_moved_forward(&self, frozen_id: u64, new_id: u64) {
        self.push(format!("moved_forward {} {}", frozen_id, new_id));
    }

    fn on_merge_operation_started(&self, kind: MergeKind) {
        self.push(format!("started {:?}", kind));
    }

    fn on_merge_operation_ended(
        &self,
        kind: MergeKind,
        result: MergeResult,
        stats: Option<&MergeStats>,
    ) {
        if let Some(stats) = stats {
            self.stats.lock().push(stats.clone());
        }
        self.push(format!("ended {:?} {:?}", kind, result));
    }

    fn on_merge_operation_failed(&self, kind: MergeKind, _error: &Error) {
        self.push(format!("failed {:?}", kind));
    }

    fn on_disk_segment_created(&self, id: u64) {
        self.push(format!("created {}", id));
    }

    fn on_disk_segment_activated(&self, id: u64) {
        self.push(format!("activated {}", id));
    }

    fn on_disk_segment_demoted(&self, id: u64) {
        self.push(format!("demoted {}", id));
    }

    fn on_can_not_drop_disk_segment(&self, id: u64, _error: &Error) {
        self.push(format!("can_not_drop {}", id));
    }
}
