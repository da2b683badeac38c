//! Manifest log reader.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use bytes::Bytes;
use tracing::warn;

use crate::util::crc::crc32_multi;
use crate::{Error, Result};

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE};

/// Reads records back from a manifest file.
///
/// A torn tail (a partially written last record) ends the log cleanly.
pub struct ManifestReader {
    /// Buffered reader for the manifest file.
    reader: BufReader<File>,
    /// Current block buffer.
    buffer: Vec<u8>,
    /// Current position within the buffer.
    buffer_offset: usize,
    /// Valid bytes in the buffer.
    buffer_size: usize,
    /// Whether we've reached EOF.
    eof: bool,
    /// Whether to report corruption or skip.
    checksum_errors_are_fatal: bool,
}

impl ManifestReader {
    /// Open a manifest for reading.
    pub fn new(path: &Path) -> Result<Self> {
        let file = File::open(path)?;

        Ok(Self {
            reader: BufReader::with_capacity(BLOCK_SIZE, file),
            buffer: vec![0u8; BLOCK_SIZE],
            buffer_offset: 0,
            buffer_size: 0,
            eof: false,
            checksum_errors_are_fatal: true,
        })
    }

    /// Set whether checksum errors should be fatal.
    pub fn set_checksum_errors_fatal(&mut self, fatal: bool) {
        self.checksum_errors_are_fatal = fatal;
    }

    /// Read the next logical record.
    ///
    /// Returns None when there are no more records.
    pub fn read_record(&mut self) -> Result<Option<Bytes>> {
        let mut scratch = Vec::new();
        let mut in_fragmented_record = false;

        loop {
            let Some((record_type, data)) = self.read_physical_record()? else {
                if in_fragmented_record {
                    warn!(bytes = scratch.len(), "dropping incomplete manifest record");
                }
                return Ok(None);
            };

            match record_type {
                RecordType::Full => {
                    return Ok(Some(Bytes::from(data)));
                }
                RecordType::First => {
                    scratch.clear();
                    scratch.extend_from_slice(&data);
                    in_fragmented_record = true;
                }
                RecordType::Middle | RecordType::Last if !in_fragmented_record => {
                    if self.checksum_errors_are_fatal {
                        return Err(Error::corruption("unexpected manifest fragment"));
                    }
                }
                RecordType::Middle => {
                    scratch.extend_from_slice(&data);
                }
                RecordType::Last => {
                    scratch.extend_from_slice(&data);
                    return Ok(Some(Bytes::from(scratch)));
                }
                RecordType::Zero => {}
            }
        }
    }

    fn read_physical_record(&mut self) -> Result<Option<(RecordType, Vec<u8>)>> {
        loop {
            if self.buffer_offset + HEADER_SIZE > self.buffer_size {
                if !self.read_block()? {
                    return Ok(None);
                }
                continue;
            }

            let header = &self.buffer[self.buffer_offset..self.buffer_offset + HEADER_SIZE];
            let crc_expected = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let record_type_byte = header[6];

            let Some(record_type) = RecordType::from_byte(record_type_byte) else {
                if self.checksum_errors_are_fatal {
                    return Err(Error::corruption("invalid manifest record type"));
                }
                self.buffer_offset = self.buffer_size;
                continue;
            };

            // Zero padding at the end of a block.
            if record_type == RecordType::Zero && length == 0 {
                self.buffer_offset = self.buffer_size;
                continue;
            }

            if self.buffer_offset + HEADER_SIZE + length > self.buffer_size {
                if self.eof {
                    return Ok(None);
                }
                if self.checksum_errors_are_fatal {
                    return Err(Error::corruption("manifest record extends beyond block"));
                }
                self.buffer_offset = self.buffer_size;
                continue;
            }

            let data_start = self.buffer_offset + HEADER_SIZE;
            let data_end = data_start + length;
            let data = &self.buffer[data_start..data_end];

            let crc_actual = crc32_multi(&[&[record_type_byte], data]);
            if crc_expected != crc_actual {
                if self.eof && data_end == self.buffer_size {
                    // Torn write of the final record.
                    return Ok(None);
                }
                if self.checksum_errors_are_fatal {
                    return Err(Error::CrcMismatch {
                        expected: crc_expected,
                        actual: crc_actual,
                    });
                }
                self.buffer_offset = self.buffer_size;
                continue;
            }

            let data = data.to_vec();
            self.buffer_offset = data_end;
            return Ok(Some((record_type, data)));
        }
    }

    fn read_block(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }

        self.buffer_offset = 0;
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.reader.read(&mut self.buffer[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        self.buffer_size = filled;
        if filled < BLOCK_SIZE {
            self.eof = true;
        }
        Ok(filled > 0)
    }
}
