//! # tierdb
//!
//! An embedded LSM key-value engine with a tiered segment layout.
//!
//! ## Features
//!
//! - **Lock-free reads**: Readers load an immutable layout snapshot
//! - **Tiered segments**: Mutable, read-only, active disk and bottom tiers
//! - **Part-skip merges**: Untouched parts of a multi-part segment are
//!   reused by reference instead of being rewritten
//! - **Background merges**: Flush and bottom merges on their own threads
//! - **Durable layout**: Every layout change is logged to a checksummed
//!   manifest
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tierdb::{Engine, Options};
//!
//! // Open engine
//! let engine = Engine::open("./my_data")?;
//!
//! // Basic operations
//! engine.upsert(b"hello", b"world")?;
//! let value = engine.try_get(b"hello")?;
//! engine.delete(b"hello")?;
//!
//! // Atomic read-modify-write
//! engine.try_atomic_add(b"counter", b"0")?;
//!
//! // Persist everything written so far
//! let id = engine.stats().mutable_segment.id;
//! engine.move_mutable_segment_forward(id)?;
//! engine.merge_read_only_segments()?;
//! ```

// Public modules
pub mod compaction;
pub mod engine;
pub mod error;
pub mod events;
pub mod layout;
pub mod manifest;
pub mod options;
pub mod segment;
pub mod types;

// Internal modules
mod util;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use options::{DiskSegmentMode, Options, OptionsBuilder, SyncMode};
pub use types::{AddOrUpdateResult, MergeResult, Value};

// Engine
pub use engine::{Engine, EngineStats, SegmentStats};

// Layout
pub use layout::SegmentLayout;

// Compaction (re-export useful types)
pub use compaction::{LiveEntryIterator, MergeStats};

// Events
pub use events::{EngineObserver, MergeKind, NoopObserver};

// Segments
pub use segment::SegmentIterator;
