// Example API Usage
// This file shows how the engine is used

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tierdb::{
    DiskSegmentMode, Engine, EngineObserver, Error, MergeKind, MergeResult, MergeStats,
    OptionsBuilder, SegmentIterator, SyncMode,
};

struct LoggingObserver;

impl EngineObserver for LoggingObserver {
    fn on_merge_operation_ended(&self, kind: MergeKind, result: MergeResult, stats: Option<&MergeStats>) {
        println!("{:?} merge ended: {:?} {:?}", kind, result, stats);
    }

    fn on_can_not_drop_disk_segment(&self, id: u64, error: &Error) {
        eprintln!("segment {} leaked: {}", id, error);
    }
}

fn main() -> Result<(), Error> {
    // ===========================================
    // Basic Usage
    // ===========================================

    // Open engine with default options
    let engine = Engine::open("./my_data")?;

    // Simple upsert/get/delete
    engine.upsert(b"hello", b"world")?;

    let value = engine.try_get(b"hello")?;
    assert_eq!(value, Some(Bytes::from("world")));

    engine.delete(b"hello")?;
    assert_eq!(engine.try_get(b"hello")?, None);
    engine.close()?;
    drop(engine);

    // ===========================================
    // Custom Options
    // ===========================================

    let options = OptionsBuilder::new()
        .mutable_segment_max_item_count(64 * 1024)
        .disk_segment_max_item_count(4 * 1024 * 1024) // larger outputs go to the bottom tier
        .disk_segment_mode(DiskSegmentMode::MultiPart)
        .records_per_part(1024, 64 * 1024)
        .maintenance_interval(Duration::from_millis(250))
        .merge_thresholds(1, 4)
        .sync_mode(SyncMode::Always)
        .build()?;

    let engine = Engine::open_with_observer("./my_data", options, Arc::new(LoggingObserver))?;

    // ===========================================
    // Atomic Read-Modify-Write
    // ===========================================

    // Only inserts when the key is missing
    engine.try_atomic_add(b"counter", b"0")?;

    // Increment in place
    engine.try_atomic_get_and_update(b"counter", |value| {
        let n: u64 = String::from_utf8_lossy(value).parse().unwrap_or(0);
        *value = Bytes::from((n + 1).to_string());
        true
    })?;

    // Insert or update in one step; returns true when added
    let added = engine.try_atomic_add_or_update(b"visits", b"1", |value| {
        *value = Bytes::from("2");
        true
    })?;
    assert!(added);

    // Delete only if present
    engine.try_delete(b"visits")?;

    // ===========================================
    // Iteration
    // ===========================================

    // Live entries in key order, newest value per key
    let mut iter = engine.iter()?;
    while iter.valid() {
        println!(
            "{:?} = {:?}",
            String::from_utf8_lossy(iter.key().unwrap()),
            iter.value().unwrap()
        );
        iter.next()?;
    }

    // ===========================================
    // Maintenance Operations
    // ===========================================

    // Freeze the current write buffer
    let id = engine.stats().mutable_segment.id;
    engine.move_mutable_segment_forward(id)?;

    // Merge read-only segments into the active disk segment
    match engine.start_merge_operation()?.join().unwrap()? {
        MergeResult::Success => println!("flushed"),
        other => println!("flush skipped: {:?}", other),
    }

    // Merge the two newest bottom segments
    if engine.stats().bottom_segments.len() >= 2 {
        engine.merge_bottom_segments(0, 1)?;
    }

    // Cancel whatever is running
    engine.try_cancel_merge_operation();
    engine.try_cancel_bottom_segments_merge_operation();

    // Get statistics
    println!("{}", engine.stats());

    // ===========================================
    // Read-Only Mode
    // ===========================================

    engine.set_read_only(true);
    assert!(matches!(engine.upsert(b"k", b"v"), Err(Error::ReadOnlyEngine)));
    engine.set_read_only(false);

    // ===========================================
    // Graceful Shutdown
    // ===========================================

    // Stops background merges and syncs the manifest
    engine.close()?;

    Ok(())
}
