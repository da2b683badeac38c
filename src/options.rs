//! Configuration options for tierdb.

use std::time::Duration;

/// Default item limit of the mutable segment before rotation.
pub const DEFAULT_MUTABLE_SEGMENT_MAX_ITEM_COUNT: usize = 64 * 1024;

/// Default item count above which a freshly merged disk segment is demoted
/// into the bottom tier.
pub const DEFAULT_DISK_SEGMENT_MAX_ITEM_COUNT: usize = 4 * 1024 * 1024;

/// Default number of records a part must hold to be copied by reference.
pub const DEFAULT_MIN_RECORDS_PER_PART: usize = 1024;

/// Default number of records after which a multi-part creator seals a part.
pub const DEFAULT_MAX_RECORDS_PER_PART: usize = 64 * 1024;

/// Default number of read-only segments that triggers a background merge.
pub const DEFAULT_READ_ONLY_MERGE_THRESHOLD: usize = 1;

/// Default number of bottom segments that triggers a background merge.
pub const DEFAULT_BOTTOM_MERGE_THRESHOLD: usize = 4;

/// How disk segments are laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskSegmentMode {
    /// One file per segment.
    SingleFile,
    /// Segments split into parts that merges can reuse without rewriting.
    #[default]
    MultiPart,
}

impl DiskSegmentMode {
    /// Check if segments are split into parts.
    pub fn is_multi_part(&self) -> bool {
        matches!(self, DiskSegmentMode::MultiPart)
    }
}

/// Manifest sync mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Sync on every record (safest, slowest).
    Always,
    /// Sync after N bytes written.
    Bytes {
        /// Number of bytes before sync.
        bytes: usize,
    },
    /// Let OS decide when to sync (fastest, may lose recent records on crash).
    None,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Always
    }
}

/// Engine configuration options.
#[derive(Debug, Clone)]
pub struct Options {
    // === Storage ===
    /// Create the engine directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Return error if the engine directory already holds a manifest.
    pub error_if_exists: bool,

    // === Segments ===
    /// Item limit of the mutable segment; a full segment is rotated.
    pub mutable_segment_max_item_count: usize,

    /// Merged disk segments larger than this are demoted to the bottom tier.
    pub disk_segment_max_item_count: usize,

    /// Disk segment file layout.
    pub disk_segment_mode: DiskSegmentMode,

    /// Minimum part size eligible for the part-skip shortcut.
    pub min_records_per_part: usize,

    /// Part size at which a multi-part creator starts a new part.
    pub max_records_per_part: usize,

    /// Enable copying whole base parts by reference during merges.
    pub enable_part_skip: bool,

    // === Merges ===
    /// How long a flush merge waits for read-only segments to drain writers.
    pub read_only_wait_timeout: Duration,

    /// Run background merge threads.
    pub enable_background_merges: bool,

    /// Wake-up interval of the background merge threads.
    pub maintenance_interval: Duration,

    /// Read-only segment count that triggers a background flush merge.
    pub read_only_merge_threshold: usize,

    /// Bottom segment count that triggers a background bottom merge.
    pub bottom_merge_threshold: usize,

    // === Durability ===
    /// Manifest sync mode.
    pub sync_mode: SyncMode,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            // Storage
            create_if_missing: true,
            error_if_exists: false,

            // Segments
            mutable_segment_max_item_count: DEFAULT_MUTABLE_SEGMENT_MAX_ITEM_COUNT,
            disk_segment_max_item_count: DEFAULT_DISK_SEGMENT_MAX_ITEM_COUNT,
            disk_segment_mode: DiskSegmentMode::default(),
            min_records_per_part: DEFAULT_MIN_RECORDS_PER_PART,
            max_records_per_part: DEFAULT_MAX_RECORDS_PER_PART,
            enable_part_skip: true,

            // Merges
            read_only_wait_timeout: Duration::from_secs(5),
            enable_background_merges: true,
            maintenance_interval: Duration::from_millis(500),
            read_only_merge_threshold: DEFAULT_READ_ONLY_MERGE_THRESHOLD,
            bottom_merge_threshold: DEFAULT_BOTTOM_MERGE_THRESHOLD,

            // Durability
            sync_mode: SyncMode::default(),
        }
    }
}

impl Options {
    /// Create new options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the options.
    pub fn validate(&self) -> crate::Result<()> {
        if self.mutable_segment_max_item_count == 0 {
            return Err(crate::Error::InvalidConfiguration(
                "mutable_segment_max_item_count must be at least 1".into(),
            ));
        }

        if self.disk_segment_max_item_count == 0 {
            return Err(crate::Error::InvalidConfiguration(
                "disk_segment_max_item_count must be at least 1".into(),
            ));
        }

        if self.max_records_per_part == 0 {
            return Err(crate::Error::InvalidConfiguration(
                "max_records_per_part must be at least 1".into(),
            ));
        }

        if self.min_records_per_part > self.max_records_per_part {
            return Err(crate::Error::InvalidConfiguration(
                "min_records_per_part must be <= max_records_per_part".into(),
            ));
        }

        if self.bottom_merge_threshold < 2 {
            return Err(crate::Error::InvalidConfiguration(
                "bottom_merge_threshold must be at least 2".into(),
            ));
        }

        if self.maintenance_interval.is_zero() {
            return Err(crate::Error::InvalidConfiguration(
                "maintenance_interval must be non-zero".into(),
            ));
        }

        Ok(())
    }
}

/// Builder for Options.
#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set create_if_missing.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.options.create_if_missing = value;
        self
    }

    /// Set error_if_exists.
    pub fn error_if_exists(mut self, value: bool) -> Self {
        self.options.error_if_exists = value;
        self
    }

    /// Set mutable_segment_max_item_count.
    pub fn mutable_segment_max_item_count(mut self, count: usize) -> Self {
        self.options.mutable_segment_max_item_count = count;
        self
    }

    /// Set disk_segment_max_item_count.
    pub fn disk_segment_max_item_count(mut self, count: usize) -> Self {
        self.options.disk_segment_max_item_count = count;
        self
    }

    /// Set disk segment mode.
    pub fn disk_segment_mode(mut self, mode: DiskSegmentMode) -> Self {
        self.options.disk_segment_mode = mode;
        self
    }

    /// Set the part size bounds.
    pub fn records_per_part(mut self, min: usize, max: usize) -> Self {
        self.options.min_records_per_part = min;
        self.options.max_records_per_part = max;
        self
    }

    /// Enable or disable the part-skip shortcut.
    pub fn enable_part_skip(mut self, value: bool) -> Self {
        self.options.enable_part_skip = value;
        self
    }

    /// Set read_only_wait_timeout.
    pub fn read_only_wait_timeout(mut self, timeout: Duration) -> Self {
        self.options.read_only_wait_timeout = timeout;
        self
    }

    /// Enable or disable background merges.
    pub fn enable_background_merges(mut self, value: bool) -> Self {
        self.options.enable_background_merges = value;
        self
    }

    /// Set maintenance_interval.
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.options.maintenance_interval = interval;
        self
    }

    /// Set background merge thresholds.
    pub fn merge_thresholds(mut self, read_only: usize, bottom: usize) -> Self {
        self.options.read_only_merge_threshold = read_only;
        self.options.bottom_merge_threshold = bottom;
        self
    }

    /// Set sync mode.
    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.options.sync_mode = mode;
        self
    }

    /// Build the options.
    pub fn build(self) -> crate::Result<Options> {
        self.options.validate()?;
        Ok(self.options)
    }
}
