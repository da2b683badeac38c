//! Manifest log writer.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::options::SyncMode;
use crate::util::crc::crc32_multi;
use crate::Result;

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE};

/// Appends framed records to the manifest file.
///
/// Records are split into fragments so that no fragment crosses a block
/// boundary; each fragment carries a CRC over its type and payload.
pub struct ManifestWriter {
    /// Buffered writer for the manifest file.
    writer: BufWriter<File>,
    /// Current position within the current block.
    block_offset: usize,
    /// Sync mode for durability.
    sync_mode: SyncMode,
    /// Bytes written since last sync.
    bytes_since_sync: usize,
}

impl ManifestWriter {
    /// Create a new, empty manifest file.
    pub fn create(path: &Path, sync_mode: SyncMode) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            writer: BufWriter::with_capacity(BLOCK_SIZE, file),
            block_offset: 0,
            sync_mode,
            bytes_since_sync: 0,
        })
    }

    /// Open an existing manifest for appending.
    pub fn open_for_append(path: &Path, sync_mode: SyncMode) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let file_size = file.metadata()?.len() as usize;
        let block_offset = file_size % BLOCK_SIZE;

        Ok(Self {
            writer: BufWriter::with_capacity(BLOCK_SIZE, file),
            block_offset,
            sync_mode,
            bytes_since_sync: 0,
        })
    }

    /// Append one logical record.
    pub fn add_record(&mut self, data: &[u8]) -> Result<()> {
        let mut left = data.len();
        let mut ptr = 0;
        let mut begin = true;

        // An empty record still emits one FULL fragment.
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;

            if leftover < HEADER_SIZE {
                if leftover > 0 {
                    self.writer.write_all(&[0u8; HEADER_SIZE][..leftover])?;
                    self.bytes_since_sync += leftover;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = left.min(avail);
            let end = left == fragment_length;

            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            self.emit_physical_record(record_type, &data[ptr..ptr + fragment_length])?;

            ptr += fragment_length;
            left -= fragment_length;
            begin = false;

            if left == 0 {
                break;
            }
        }

        self.writer.flush()?;
        self.maybe_sync()
    }

    fn emit_physical_record(&mut self, record_type: RecordType, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= 0xFFFF);
        debug_assert!(self.block_offset + HEADER_SIZE + data.len() <= BLOCK_SIZE);

        let type_byte = [record_type.to_byte()];
        let crc = crc32_multi(&[&type_byte, data]);

        // Header format: CRC (4) + Length (2) + Type (1)
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&crc.to_le_bytes());
        header[4..6].copy_from_slice(&(data.len() as u16).to_le_bytes());
        header[6] = type_byte[0];

        self.writer.write_all(&header)?;
        self.writer.write_all(data)?;

        let record_size = HEADER_SIZE + data.len();
        self.block_offset += record_size;
        self.bytes_since_sync += record_size;

        Ok(())
    }

    fn maybe_sync(&mut self) -> Result<()> {
        match self.sync_mode {
            SyncMode::Always => self.sync(),
            SyncMode::Bytes { bytes } if self.bytes_since_sync >= bytes => self.sync(),
            _ => Ok(()),
        }
    }

    /// Force a sync to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.bytes_since_sync = 0;
        Ok(())
    }
}
