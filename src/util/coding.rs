//! Encoding utilities for variable-length integers and fixed-width values.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum bytes needed to encode a varint64.
pub const MAX_VARINT64_LEN: usize = 10;

/// Encode a 64-bit unsigned integer as a varint.
///
/// Returns the number of bytes written.
pub fn encode_varint64(buf: &mut BytesMut, mut value: u64) -> usize {
    let mut count = 0;
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
        count += 1;
    }
    buf.put_u8(value as u8);
    count + 1
}

/// Decode a 64-bit varint from a buffer.
///
/// Returns None if the buffer is too short or the varint is malformed.
pub fn decode_varint64(buf: &mut &[u8]) -> Option<u64> {
    let mut result = 0u64;
    let mut shift = 0;

    for _ in 0..MAX_VARINT64_LEN {
        if buf.is_empty() {
            return None;
        }

        let byte = buf.get_u8();
        result |= ((byte & 0x7F) as u64) << shift;

        if byte & 0x80 == 0 {
            return Some(result);
        }

        shift += 7;
    }

    None // Varint too long
}

/// Encode a length-prefixed byte slice.
pub fn encode_length_prefixed(buf: &mut BytesMut, data: &[u8]) {
    encode_varint64(buf, data.len() as u64);
    buf.put_slice(data);
}

/// Decode a length-prefixed byte slice.
pub fn decode_length_prefixed(buf: &mut &[u8]) -> Option<Bytes> {
    let len = decode_varint64(buf)? as usize;
    if buf.len() < len {
        return None;
    }
    let data = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Some(data)
}

/// Encode a fixed 32-bit little-endian integer.
pub fn encode_fixed32(buf: &mut BytesMut, value: u32) {
    buf.put_u32_le(value);
}

/// Encode a fixed 64-bit little-endian integer.
pub fn encode_fixed64(buf: &mut BytesMut, value: u64) {
    buf.put_u64_le(value);
}

/// Read a fixed 32-bit value from a slice without consuming.
pub fn read_fixed32(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
}

/// Read a fixed 64-bit value from a slice without consuming.
pub fn read_fixed64(data: &[u8]) -> Option<u64> {
    if data.len() < 8 {
        return None;
    }
    Some(u64::from_le_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ]))
}
