//! Core types for tierdb.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::util::coding::{decode_length_prefixed, encode_length_prefixed};
use crate::{Error, Result};

/// Value type indicator in encoded entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    /// Normal value.
    Value = 1,
    /// Deletion marker (tombstone).
    Deletion = 2,
}

impl ValueType {
    /// Create from byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(ValueType::Value),
            2 => Some(ValueType::Deletion),
            _ => None,
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Check if this is a deletion marker.
    pub fn is_deletion(&self) -> bool {
        matches!(self, ValueType::Deletion)
    }
}

/// A stored value: either live bytes or a tombstone.
///
/// Tombstones shadow older versions of the same key in lower segments until a
/// merge that reaches the bottom of the segment stack drops them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Live value.
    Put(Bytes),
    /// Tombstone.
    Deleted,
}

impl Value {
    /// Create a live value.
    pub fn put(value: impl Into<Bytes>) -> Self {
        Value::Put(value.into())
    }

    /// Check if this value is a tombstone.
    pub fn is_deleted(&self) -> bool {
        matches!(self, Value::Deleted)
    }

    /// Get the live bytes, if any.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Put(v) => Some(v),
            Value::Deleted => None,
        }
    }

    /// Convert into the live bytes, if any.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Value::Put(v) => Some(v),
            Value::Deleted => None,
        }
    }

    /// Get the encoding type tag.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Put(_) => ValueType::Value,
            Value::Deleted => ValueType::Deletion,
        }
    }

    /// Approximate encoded size.
    pub fn encoded_len(&self) -> usize {
        match self {
            Value::Put(v) => 1 + 10 + v.len(),
            Value::Deleted => 1,
        }
    }
}

/// Encode a key/value entry.
///
/// Format:
/// ```text
/// [key_len (varint)][key][type (1)][value_len (varint)][value]
/// ```
/// The value length and bytes are omitted for tombstones.
pub fn encode_entry(buf: &mut BytesMut, key: &[u8], value: &Value) {
    encode_length_prefixed(buf, key);
    buf.put_u8(value.value_type().to_byte());
    if let Value::Put(v) = value {
        encode_length_prefixed(buf, v);
    }
}

/// Decode a key/value entry written by [`encode_entry`].
pub fn decode_entry(data: &mut &[u8]) -> Result<(Bytes, Value)> {
    let key = decode_length_prefixed(data).ok_or_else(|| Error::corruption("entry key truncated"))?;
    if data.is_empty() {
        return Err(Error::corruption("entry type missing"));
    }
    let value_type =
        ValueType::from_byte(data.get_u8()).ok_or_else(|| Error::corruption("invalid value type"))?;
    let value = match value_type {
        ValueType::Value => Value::Put(
            decode_length_prefixed(data).ok_or_else(|| Error::corruption("entry value truncated"))?,
        ),
        ValueType::Deletion => Value::Deleted,
    };
    Ok((key, value))
}

/// Outcome of a single write into a mutable segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOrUpdateResult {
    /// A new key was inserted.
    Added,
    /// An existing key was overwritten.
    Updated,
    /// The segment reached its item limit; rotate and retry.
    RetrySegmentIsFull,
    /// The segment was frozen by a concurrent rotation; reload and retry.
    RetrySegmentIsFrozen,
}

impl AddOrUpdateResult {
    /// Check if the write was applied.
    pub fn is_applied(&self) -> bool {
        matches!(self, AddOrUpdateResult::Added | AddOrUpdateResult::Updated)
    }
}

/// Outcome of a maintenance merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeResult {
    /// A new segment was built and published.
    Success,
    /// There was nothing to merge.
    NothingToMerge,
    /// Another merge of the same kind is in flight.
    AnotherMergeIsRunning,
    /// Some read-only segment still has writers inside it.
    RetryReadonlySegmentsAreNotReady,
    /// The merge was cancelled; the layout is unchanged.
    CancelledByUser,
}

impl MergeResult {
    /// Check if a retry later could make progress.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MergeResult::AnotherMergeIsRunning | MergeResult::RetryReadonlySegmentsAreNotReady
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type() {
        assert_eq!(ValueType::from_byte(1), Some(ValueType::Value));
        assert_eq!(ValueType::from_byte(2), Some(ValueType::Deletion));
        assert_eq!(ValueType::from_byte(0), None);
        assert!(ValueType::Deletion.is_deletion());
        assert!(!ValueType::Value.is_deletion());
    }

    #[test]
    fn test_value_accessors() {
        let v = Value::put("hello");
        assert!(!v.is_deleted());
        assert_eq!(v.as_bytes(), Some(&Bytes::from("hello")));
        assert_eq!(v.value_type(), ValueType::Value);

        let d = Value::Deleted;
        assert!(d.is_deleted());
        assert_eq!(d.as_bytes(), None);
        assert_eq!(d.into_bytes(), None);
    }

    #[test]
    fn test_entry_encode_decode() {
        let mut buf = BytesMut::new();
        encode_entry(&mut buf, b"key1", &Value::put("value1"));
        encode_entry(&mut buf, b"key2", &Value::Deleted);

        let mut data: &[u8] = &buf;
        let (k1, v1) = decode_entry(&mut data).unwrap();
        let (k2, v2) = decode_entry(&mut data).unwrap();
        assert!(data.is_empty());

        assert_eq!(k1, Bytes::from("key1"));
        assert_eq!(v1, Value::put("value1"));
        assert_eq!(k2, Bytes::from("key2"));
        assert_eq!(v2, Value::Deleted);
    }

    #[test]
    fn test_decode_entry_truncated() {
        let mut buf = BytesMut::new();
        encode_entry(&mut buf, b"key", &Value::put("value"));
        let mut data: &[u8] = &buf[..buf.len() - 2];
        assert!(decode_entry(&mut data).unwrap_err().is_corruption());

        let mut bad: &[u8] = &[1, b'k', 9];
        assert!(decode_entry(&mut bad).is_err());
    }

    #[test]
    fn test_result_classification() {
        assert!(AddOrUpdateResult::Added.is_applied());
        assert!(!AddOrUpdateResult::RetrySegmentIsFull.is_applied());
        assert!(MergeResult::AnotherMergeIsRunning.is_retryable());
        assert!(!MergeResult::Success.is_retryable());
    }
}
