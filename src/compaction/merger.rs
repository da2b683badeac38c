//! Merger - the k-way merge shared by both orchestrators.
//!
//! The merger takes sorted sources ordered newest first plus an optional
//! base disk segment (always the oldest input) and writes one new disk
//! segment:
//! 1. Pops entries in key order from a merge heap
//! 2. Drops stale versions of a key already processed
//! 3. Drops tombstones unless they must shadow older tiers
//! 4. Reuses whole parts of a multi-part base when nothing interleaves
//! 5. Finishes or discards the output creator

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::options::Options;
use crate::segment::{DiskSegment, DiskSegmentCreator, SegmentIterator};
use crate::Result;

use super::merge_iterator::{MergeEntry, MergeIterator};

/// Statistics from a merge operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Id of the output segment, zero if the output was empty.
    pub output_segment_id: u64,
    /// Number of input sources, base included.
    pub num_sources: usize,
    /// Entries written to the output, reused parts included.
    pub entries_written: u64,
    /// Stale versions dropped.
    pub entries_dropped: u64,
    /// Tombstones dropped.
    pub deletions_dropped: u64,
    /// Base parts reused without rewriting.
    pub parts_skipped: u64,
    /// Time taken in milliseconds.
    pub elapsed_ms: u64,
}

/// Tunables of the merge loop.
#[derive(Debug, Clone, Copy)]
pub struct MergeSettings {
    /// Reuse whole base parts when possible.
    pub enable_part_skip: bool,
    /// Smallest part worth reusing.
    pub min_records_per_part: usize,
}

impl MergeSettings {
    /// Settings taken from engine options.
    pub fn from_options(options: &Options) -> Self {
        Self {
            enable_part_skip: options.enable_part_skip,
            min_records_per_part: options.min_records_per_part,
        }
    }
}

/// Inputs of one merge.
pub struct MergeRequest {
    /// Sorted sources, newest first. The base is not among them.
    pub sources: Vec<Box<dyn SegmentIterator>>,
    /// Oldest input, eligible for part reuse.
    pub base: Option<Arc<dyn DiskSegment>>,
    /// Keep tombstones in the output.
    pub write_deleted_values: bool,
}

/// How a merge ended.
pub enum MergeOutcome {
    /// The output was finished.
    Completed {
        /// The new segment; the null segment if nothing survived.
        segment: Arc<dyn DiskSegment>,
        /// Merge statistics.
        stats: MergeStats,
    },
    /// The cancel flag was raised; the output was discarded.
    Cancelled,
}

/// Executes merges.
pub struct Merger<'a> {
    settings: MergeSettings,
    cancel: &'a AtomicBool,
}

impl<'a> Merger<'a> {
    /// Create a merger that watches `cancel`.
    pub fn new(settings: MergeSettings, cancel: &'a AtomicBool) -> Self {
        Self { settings, cancel }
    }

    /// Merge `request` into `creator`.
    ///
    /// On cancellation or error the creator is discarded, so no files of
    /// the output remain.
    pub fn merge(
        &self,
        request: MergeRequest,
        mut creator: Box<dyn DiskSegmentCreator>,
    ) -> Result<MergeOutcome> {
        let start = Instant::now();
        let mut stats = MergeStats {
            num_sources: request.sources.len() + usize::from(request.base.is_some()),
            ..Default::default()
        };

        match self.run(request, creator.as_mut(), &mut stats) {
            Ok(true) => {
                let segment = creator.finish()?;
                stats.output_segment_id = segment.id();
                stats.elapsed_ms = start.elapsed().as_millis() as u64;
                debug!(
                    segment_id = stats.output_segment_id,
                    written = stats.entries_written,
                    dropped = stats.entries_dropped,
                    deletions_dropped = stats.deletions_dropped,
                    parts_skipped = stats.parts_skipped,
                    "merge finished"
                );
                Ok(MergeOutcome::Completed { segment, stats })
            }
            Ok(false) => {
                debug!(segment_id = creator.segment_id(), "merge cancelled");
                discard_output(creator);
                Ok(MergeOutcome::Cancelled)
            }
            Err(e) => {
                discard_output(creator);
                Err(e)
            }
        }
    }

    /// Returns false when cancelled.
    fn run(
        &self,
        request: MergeRequest,
        creator: &mut dyn DiskSegmentCreator,
        stats: &mut MergeStats,
    ) -> Result<bool> {
        let MergeRequest {
            mut sources,
            base,
            write_deleted_values,
        } = request;

        let base_index = sources.len();
        let skip = base
            .as_ref()
            .and_then(|b| PartSkip::new(b, &self.settings, creator.can_append_part()));
        if let Some(base) = base {
            sources.push(base.iter());
        }

        let mut iter = MergeIterator::new(sources);
        iter.seek_to_first()?;

        let mut prev_key: Option<Bytes> = None;
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Ok(false);
            }
            let Some(entry) = iter.current().cloned() else {
                break;
            };

            if prev_key.as_ref() == Some(&entry.key) {
                stats.entries_dropped += 1;
                iter.next()?;
                continue;
            }

            if entry.source == base_index {
                if let Some(skip) = &skip {
                    if let Some((index, part)) =
                        skip.reusable_part(&entry, iter.peek_other_key(), write_deleted_values)
                    {
                        let len = part.len() as u64;
                        creator.append_part(part)?;
                        stats.entries_written += len;
                        stats.parts_skipped += 1;
                        prev_key = Some(skip.last_keys[index].clone());
                        iter.skip_current_source(skip.next_part_start(index))?;
                        continue;
                    }
                }
            }

            let MergeEntry { key, value, .. } = entry;
            if value.is_deleted() && !write_deleted_values {
                stats.deletions_dropped += 1;
            } else {
                creator.append(key.clone(), value)?;
                stats.entries_written += 1;
            }
            prev_key = Some(key);
            iter.next()?;
        }

        Ok(true)
    }
}

fn discard_output(creator: Box<dyn DiskSegmentCreator>) {
    let id = creator.segment_id();
    if let Err(e) = creator.discard() {
        warn!(segment_id = id, error = %e, "failed to discard merge output");
    }
}

/// Part boundaries of a multi-part base.
struct PartSkip {
    base: Arc<dyn DiskSegment>,
    first_keys: Vec<Bytes>,
    last_keys: Vec<Bytes>,
    min_records: usize,
}

impl PartSkip {
    fn new(
        base: &Arc<dyn DiskSegment>,
        settings: &MergeSettings,
        creator_can_append_part: bool,
    ) -> Option<Self> {
        if !settings.enable_part_skip || !creator_can_append_part || base.part_count() == 0 {
            return None;
        }
        Some(Self {
            base: Arc::clone(base),
            first_keys: base.first_keys_of_every_part(),
            last_keys: base.last_keys_of_every_part(),
            min_records: settings.min_records_per_part,
        })
    }

    /// The part starting at `entry` if it can be appended whole.
    ///
    /// Every other source must be positioned past the part's last key, so
    /// no newer version of any key in the part exists.
    fn reusable_part(
        &self,
        entry: &MergeEntry,
        next_other_key: Option<&Bytes>,
        write_deleted_values: bool,
    ) -> Option<(usize, Arc<dyn DiskSegment>)> {
        let index = self.first_keys.binary_search(&entry.key).ok()?;
        if let Some(next) = next_other_key {
            if self.last_keys[index] >= *next {
                return None;
            }
        }

        let part = self.base.part(index)?;
        if part.len() < self.min_records {
            return None;
        }
        if !write_deleted_values && part.deleted_count() > 0 {
            return None;
        }
        Some((index, part))
    }

    fn next_part_start(&self, index: usize) -> Option<&[u8]> {
        self.first_keys.get(index + 1).map(|k| k.as_ref())
    }
}
