//! Background maintenance - runs both merge orchestrators on their own
//! threads.
//!
//! Each worker sleeps on a condition variable until either the maintenance
//! interval elapses or it is notified, then checks its threshold:
//! - the flush worker merges once `read_only_merge_threshold` read-only
//!   segments are queued
//! - the bottom worker merges the whole tier once it holds
//!   `bottom_merge_threshold` segments

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::layout::SegmentContext;
use crate::types::MergeResult;
use crate::Result;

use super::{BottomMerge, FlushMerge};

/// Wake-up signal of one worker.
#[derive(Default)]
struct Signal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    fn notify(&self) {
        *self.pending.lock() = true;
        self.cond.notify_one();
    }

    /// Wait for a notification or the interval, whichever comes first.
    fn wait(&self, interval: Duration, shutdown: &AtomicBool) {
        let mut pending = self.pending.lock();
        if !*pending && !shutdown.load(Ordering::SeqCst) {
            self.cond.wait_for(&mut pending, interval);
        }
        *pending = false;
    }
}

/// Owner of the background merge threads.
pub struct Maintainer {
    flush_signal: Arc<Signal>,
    bottom_signal: Arc<Signal>,
    shutdown: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Maintainer {
    /// Spawn the flush and bottom merge threads.
    pub fn start(
        ctx: Arc<SegmentContext>,
        flush: Arc<FlushMerge>,
        bottom: Arc<BottomMerge>,
    ) -> Result<Self> {
        let maintainer = Self {
            flush_signal: Arc::new(Signal::default()),
            bottom_signal: Arc::new(Signal::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::with_capacity(2)),
        };

        let flush_worker = FlushWorker {
            ctx: Arc::clone(&ctx),
            flush,
            signal: Arc::clone(&maintainer.flush_signal),
            bottom_signal: Arc::clone(&maintainer.bottom_signal),
            shutdown: Arc::clone(&maintainer.shutdown),
        };
        let bottom_worker = BottomWorker {
            ctx,
            bottom,
            signal: Arc::clone(&maintainer.bottom_signal),
            shutdown: Arc::clone(&maintainer.shutdown),
        };

        let flush_handle = thread::Builder::new()
            .name("tierdb-merge".to_string())
            .spawn(move || flush_worker.run())?;
        maintainer.handles.lock().push(flush_handle);

        let bottom_handle = thread::Builder::new()
            .name("tierdb-bottom-merge".to_string())
            .spawn(move || bottom_worker.run());
        match bottom_handle {
            Ok(handle) => maintainer.handles.lock().push(handle),
            Err(e) => {
                maintainer.stop();
                return Err(e.into());
            }
        }

        debug!("background merge threads started");
        Ok(maintainer)
    }

    /// Wake the flush worker.
    pub fn notify_flush(&self) {
        self.flush_signal.notify();
    }

    /// Check if stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stop both threads and wait for them to exit.
    ///
    /// A merge already running finishes first; cancel it beforehand to
    /// stop sooner.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.flush_signal.notify();
        self.bottom_signal.notify();

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("background merge thread panicked");
            }
        }
    }
}

impl Drop for Maintainer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FlushWorker {
    ctx: Arc<SegmentContext>,
    flush: Arc<FlushMerge>,
    signal: Arc<Signal>,
    bottom_signal: Arc<Signal>,
    shutdown: Arc<AtomicBool>,
}

impl FlushWorker {
    fn run(self) {
        let threshold = self.ctx.options.read_only_merge_threshold.max(1);
        while !self.shutdown.load(Ordering::SeqCst) {
            self.signal
                .wait(self.ctx.options.maintenance_interval, &self.shutdown);
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let queued = self.ctx.layout.load().read_only_segments().len();
            if queued < threshold {
                continue;
            }

            match self.flush.run() {
                Ok(MergeResult::Success) => {
                    let tier = self.ctx.layout.load().bottom_segments().len();
                    if tier >= self.ctx.options.bottom_merge_threshold {
                        self.bottom_signal.notify();
                    }
                }
                Ok(result) => debug!(?result, "background flush merge did not run"),
                Err(e) if e.is_fatal() => {
                    warn!(error = %e, "flush worker stopping");
                    break;
                }
                // Already logged and reported by the orchestrator.
                Err(_) => {}
            }
        }
    }
}

struct BottomWorker {
    ctx: Arc<SegmentContext>,
    bottom: Arc<BottomMerge>,
    signal: Arc<Signal>,
    shutdown: Arc<AtomicBool>,
}

impl BottomWorker {
    fn run(self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            self.signal
                .wait(self.ctx.options.maintenance_interval, &self.shutdown);
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let tier = self.ctx.layout.load().bottom_segments().len();
            if tier < self.ctx.options.bottom_merge_threshold.max(2) {
                continue;
            }

            match self.bottom.run(0, tier - 1) {
                Ok(result) => debug!(?result, tier, "background bottom merge"),
                Err(e) if e.is_fatal() => {
                    warn!(error = %e, "bottom merge worker stopping");
                    break;
                }
                Err(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::testing::{rotate, test_context};
    use crate::options::Options;
    use bytes::Bytes;
    use std::time::Instant;
    use tempfile::tempdir;

    fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn test_signal_wait_times_out() {
        let signal = Signal::default();
        let shutdown = AtomicBool::new(false);
        let start = Instant::now();
        signal.wait(Duration::from_millis(20), &shutdown);
        assert!(start.elapsed() >= Duration::from_millis(15));

        signal.notify();
        let start = Instant::now();
        signal.wait(Duration::from_secs(10), &shutdown);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_background_flush_and_bottom_merge() {
        let dir = tempdir().unwrap();
        let options = Options {
            disk_segment_max_item_count: 0,
            maintenance_interval: Duration::from_millis(10),
            bottom_merge_threshold: 2,
            ..Options::default()
        };
        let (ctx, _, _) = test_context(dir.path(), options);
        let flush = Arc::new(FlushMerge::new(Arc::clone(&ctx)));
        let bottom = Arc::new(BottomMerge::new(Arc::clone(&ctx)));
        let maintainer = Maintainer::start(Arc::clone(&ctx), flush, bottom).unwrap();

        for round in 0..2 {
            ctx.layout
                .load()
                .mutable_segment()
                .upsert(Bytes::from(format!("key{}", round)), Bytes::from("v"));
            rotate(&ctx);
            maintainer.notify_flush();
            assert!(wait_until(Duration::from_secs(5), || {
                ctx.layout.load().read_only_segments().is_empty()
            }));
        }

        // Two demoted segments reach the threshold and collapse into one.
        assert!(wait_until(Duration::from_secs(5), || {
            let layout = ctx.layout.load();
            layout.bottom_segments().len() == 1 && layout.bottom_segments()[0].len() == 2
        }));

        maintainer.stop();
        assert!(maintainer.is_stopped());
    }

    #[test]
    fn test_flush_worker_exits_when_layout_not_logged() {
        let dir = tempdir().unwrap();
        // Only the explicit notify below wakes the workers.
        let options = Options {
            maintenance_interval: Duration::from_secs(60),
            ..Options::default()
        };
        let (ctx, log, _) = test_context(dir.path(), options);
        let flush = Arc::new(FlushMerge::new(Arc::clone(&ctx)));
        let bottom = Arc::new(BottomMerge::new(Arc::clone(&ctx)));
        let maintainer = Maintainer::start(Arc::clone(&ctx), flush, bottom).unwrap();

        ctx.layout
            .load()
            .mutable_segment()
            .upsert(Bytes::from("k"), Bytes::from("v"));
        rotate(&ctx);
        log.fail_appends(true);
        maintainer.notify_flush();

        assert!(wait_until(Duration::from_secs(5), || ctx.layout.is_poisoned()));
        // The flush thread is started first.
        assert!(wait_until(Duration::from_secs(5), || {
            maintainer.handles.lock()[0].is_finished()
        }));
        maintainer.stop();
    }
}
