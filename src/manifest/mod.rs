//! Metadata log recording segment layout transitions.
//!
//! Every layout publish is paired with one manifest record holding the
//! [`LayoutRecord`]s that describe it. On open the log is replayed into a
//! [`RecoveredLayout`] and then rewritten in compacted form.
//!
//! The file format reuses a block framing:
//!
//! ```text
//! +----------+-----------+-----------+--- ... ---+
//! | CRC (4B) | Size (2B) | Type (1B) | Payload   |
//! +----------+-----------+-----------+--- ... ---+
//! ```
//!
//! Blocks are 32KB; records larger than the space left in a block are split
//! into FIRST/MIDDLE/LAST fragments.

mod reader;
mod writer;

pub use reader::ManifestReader;
pub use writer::ManifestWriter;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use crate::options::SyncMode;
use crate::util::coding::{decode_varint64, encode_varint64};
use crate::util::filename::{manifest_file_path, manifest_temp_path, sync_dir};
use crate::{Error, Result};

/// Block size for the manifest (32KB).
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Header size: CRC (4) + Length (2) + Type (1).
pub const HEADER_SIZE: usize = 7;

/// Fragment type of a physical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Zero is reserved for preallocated files.
    Zero = 0,
    /// Complete record in a single fragment.
    Full = 1,
    /// First fragment of a record.
    First = 2,
    /// Middle fragment of a record.
    Middle = 3,
    /// Last fragment of a record.
    Last = 4,
}

impl RecordType {
    /// Create from byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(RecordType::Zero),
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            _ => None,
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Tags identifying each layout record in the encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordTag {
    MutableSegment = 1,
    ReadOnlySegmentQueued = 2,
    DiskSegmentCreated = 3,
    DiskSegmentActivated = 4,
    BottomSegments = 5,
    ReadOnlySegmentsRemoved = 6,
    DiskSegmentsRemoved = 7,
}

impl RecordTag {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(RecordTag::MutableSegment),
            2 => Some(RecordTag::ReadOnlySegmentQueued),
            3 => Some(RecordTag::DiskSegmentCreated),
            4 => Some(RecordTag::DiskSegmentActivated),
            5 => Some(RecordTag::BottomSegments),
            6 => Some(RecordTag::ReadOnlySegmentsRemoved),
            7 => Some(RecordTag::DiskSegmentsRemoved),
            _ => None,
        }
    }
}

/// One change to the segment layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutRecord {
    /// A new mutable segment became live.
    MutableSegment(u64),
    /// A frozen mutable segment joined the read-only list.
    ReadOnlySegmentQueued(u64),
    /// A disk segment was written.
    DiskSegmentCreated(u64),
    /// The active disk segment changed. Zero means none.
    DiskSegmentActivated(u64),
    /// The full bottom tier, newest first.
    BottomSegments(Vec<u64>),
    /// Read-only segments were merged away.
    ReadOnlySegmentsRemoved(Vec<u64>),
    /// Disk segments are no longer referenced.
    DiskSegmentsRemoved(Vec<u64>),
}

impl LayoutRecord {
    fn tag(&self) -> RecordTag {
        match self {
            LayoutRecord::MutableSegment(_) => RecordTag::MutableSegment,
            LayoutRecord::ReadOnlySegmentQueued(_) => RecordTag::ReadOnlySegmentQueued,
            LayoutRecord::DiskSegmentCreated(_) => RecordTag::DiskSegmentCreated,
            LayoutRecord::DiskSegmentActivated(_) => RecordTag::DiskSegmentActivated,
            LayoutRecord::BottomSegments(_) => RecordTag::BottomSegments,
            LayoutRecord::ReadOnlySegmentsRemoved(_) => RecordTag::ReadOnlySegmentsRemoved,
            LayoutRecord::DiskSegmentsRemoved(_) => RecordTag::DiskSegmentsRemoved,
        }
    }

    fn encode_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag() as u8);
        match self {
            LayoutRecord::MutableSegment(id)
            | LayoutRecord::ReadOnlySegmentQueued(id)
            | LayoutRecord::DiskSegmentCreated(id)
            | LayoutRecord::DiskSegmentActivated(id) => {
                encode_varint64(buf, *id);
            }
            LayoutRecord::BottomSegments(ids)
            | LayoutRecord::ReadOnlySegmentsRemoved(ids)
            | LayoutRecord::DiskSegmentsRemoved(ids) => {
                encode_varint64(buf, ids.len() as u64);
                for id in ids {
                    encode_varint64(buf, *id);
                }
            }
        }
    }

    /// Encode a batch of records as one manifest payload.
    pub fn encode_batch(records: &[LayoutRecord]) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 * records.len().max(1));
        for record in records {
            record.encode_to(&mut buf);
        }
        buf.freeze()
    }

    /// Decode a manifest payload into its records.
    pub fn decode_batch(data: &[u8]) -> Result<Vec<LayoutRecord>> {
        let mut cursor = data;
        let mut records = Vec::new();

        while let Some((&tag, rest)) = cursor.split_first() {
            cursor = rest;
            let tag = RecordTag::from_byte(tag)
                .ok_or_else(|| Error::corruption(format!("unknown layout record tag: {}", tag)))?;

            let record = match tag {
                RecordTag::MutableSegment => LayoutRecord::MutableSegment(read_id(&mut cursor)?),
                RecordTag::ReadOnlySegmentQueued => {
                    LayoutRecord::ReadOnlySegmentQueued(read_id(&mut cursor)?)
                }
                RecordTag::DiskSegmentCreated => {
                    LayoutRecord::DiskSegmentCreated(read_id(&mut cursor)?)
                }
                RecordTag::DiskSegmentActivated => {
                    LayoutRecord::DiskSegmentActivated(read_id(&mut cursor)?)
                }
                RecordTag::BottomSegments => LayoutRecord::BottomSegments(read_ids(&mut cursor)?),
                RecordTag::ReadOnlySegmentsRemoved => {
                    LayoutRecord::ReadOnlySegmentsRemoved(read_ids(&mut cursor)?)
                }
                RecordTag::DiskSegmentsRemoved => {
                    LayoutRecord::DiskSegmentsRemoved(read_ids(&mut cursor)?)
                }
            };
            records.push(record);
        }

        Ok(records)
    }
}

fn read_id(cursor: &mut &[u8]) -> Result<u64> {
    decode_varint64(cursor).ok_or_else(|| Error::corruption("truncated layout record"))
}

fn read_ids(cursor: &mut &[u8]) -> Result<Vec<u64>> {
    let count = read_id(cursor)?;
    if count > cursor.len() as u64 {
        return Err(Error::corruption("layout record id count exceeds payload"));
    }
    (0..count).map(|_| read_id(cursor)).collect()
}

/// Destination for layout records.
///
/// Appends happen under the layout publish lock, so implementations see
/// batches in publish order.
pub trait LayoutLog: Send + Sync {
    /// Persist one publish worth of records.
    fn append(&self, records: &[LayoutRecord]) -> Result<()>;
}

/// Disk segments named by a replayed manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveredLayout {
    /// Active disk segment id, zero when none.
    pub disk_segment: u64,
    /// Bottom tier ids, newest first.
    pub bottom_segments: Vec<u64>,
    /// Highest segment id the log ever mentioned.
    pub max_segment_id: u64,
}

impl RecoveredLayout {
    /// Apply one record.
    pub fn apply(&mut self, record: &LayoutRecord) {
        match record {
            LayoutRecord::MutableSegment(id)
            | LayoutRecord::ReadOnlySegmentQueued(id)
            | LayoutRecord::DiskSegmentCreated(id) => self.observe(*id),
            LayoutRecord::DiskSegmentActivated(id) => {
                self.observe(*id);
                self.disk_segment = *id;
            }
            LayoutRecord::BottomSegments(ids) => {
                ids.iter().for_each(|id| self.observe(*id));
                self.bottom_segments = ids.clone();
            }
            LayoutRecord::ReadOnlySegmentsRemoved(_) => {}
            LayoutRecord::DiskSegmentsRemoved(ids) => {
                let removed: HashSet<u64> = ids.iter().copied().collect();
                if removed.contains(&self.disk_segment) {
                    self.disk_segment = 0;
                }
                self.bottom_segments.retain(|id| !removed.contains(id));
            }
        }
    }

    /// Ids of all disk segments the layout references.
    pub fn live_disk_segments(&self) -> Vec<u64> {
        let mut ids = Vec::with_capacity(self.bottom_segments.len() + 1);
        if self.disk_segment != 0 {
            ids.push(self.disk_segment);
        }
        ids.extend_from_slice(&self.bottom_segments);
        ids
    }

    /// Records that recreate this layout in a fresh log.
    pub fn snapshot_records(&self) -> Vec<LayoutRecord> {
        let mut records: Vec<LayoutRecord> = self
            .live_disk_segments()
            .into_iter()
            .map(LayoutRecord::DiskSegmentCreated)
            .collect();
        records.push(LayoutRecord::DiskSegmentActivated(self.disk_segment));
        records.push(LayoutRecord::BottomSegments(self.bottom_segments.clone()));
        records
    }

    fn observe(&mut self, id: u64) {
        self.max_segment_id = self.max_segment_id.max(id);
    }
}

/// Replay a manifest file. A missing file yields an empty layout.
pub fn replay(path: &Path) -> Result<RecoveredLayout> {
    let mut layout = RecoveredLayout::default();
    if !path.exists() {
        return Ok(layout);
    }

    let mut reader = ManifestReader::new(path)?;
    let mut batches = 0usize;
    while let Some(payload) = reader.read_record()? {
        for record in LayoutRecord::decode_batch(&payload)? {
            layout.apply(&record);
        }
        batches += 1;
    }

    debug!(
        batches,
        disk_segment = layout.disk_segment,
        bottom = layout.bottom_segments.len(),
        "replayed manifest"
    );
    Ok(layout)
}

/// Manifest stored as `MANIFEST` in the engine directory.
pub struct FileManifest {
    path: PathBuf,
    writer: Mutex<ManifestWriter>,
}

impl FileManifest {
    /// Replace the manifest with a compacted one holding `records`, then
    /// open it for appending.
    pub fn rewrite(dir: &Path, records: &[LayoutRecord], sync_mode: SyncMode) -> Result<Self> {
        let temp = manifest_temp_path(dir);
        let path = manifest_file_path(dir);

        let mut writer = ManifestWriter::create(&temp, SyncMode::None)?;
        writer.add_record(&LayoutRecord::encode_batch(records))?;
        writer.sync()?;
        drop(writer);

        fs::rename(&temp, &path)?;
        sync_dir(dir)?;

        Ok(Self {
            writer: Mutex::new(ManifestWriter::open_for_append(&path, sync_mode)?),
            path,
        })
    }

    /// Path of the manifest file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Force buffered records to disk.
    pub fn sync(&self) -> Result<()> {
        self.writer.lock().sync()
    }
}

impl LayoutLog for FileManifest {
    fn append(&self, records: &[LayoutRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let payload = LayoutRecord::encode_batch(records);
        self.writer.lock().add_record(&payload)
    }
}

/// Log that keeps batches in memory.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryLayoutLog {
    batches: Mutex<Vec<Vec<LayoutRecord>>>,
    failing: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MemoryLayoutLog {
    pub(crate) fn batches(&self) -> Vec<Vec<LayoutRecord>> {
        self.batches.lock().clone()
    }

    /// Make every later append fail as if the manifest device were full.
    pub(crate) fn fail_appends(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl LayoutLog for MemoryLayoutLog {
    fn append(&self, records: &[LayoutRecord]) -> Result<()> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Io("No space left on device".into()));
        }
        self.batches.lock().push(records.to_vec());
        Ok(())
    }
}
