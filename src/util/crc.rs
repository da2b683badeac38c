//! CRC32 checksum utilities.

use crc32fast::Hasher;

/// Compute CRC32 checksum of the given data.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Compute CRC32 checksum of multiple data slices.
pub fn crc32_multi(slices: &[&[u8]]) -> u32 {
    let mut hasher = Hasher::new();
    for slice in slices {
        hasher.update(slice);
    }
    hasher.finalize()
}

/// Mask a CRC value for storage.
///
/// Keeps a stored CRC from matching the CRC of the bytes that contain it.
pub fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282ead8)
}

/// Unmask a masked CRC value.
pub fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(0xa282ead8);
    (rot >> 17) | (rot << 15)
}

/// Verify that data matches expected masked CRC.
pub fn verify_masked_crc(data: &[u8], masked: u32) -> bool {
    crc32(data) == unmask_crc(masked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_empty() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_crc32_multi() {
        let data = b"hello world";
        assert_eq!(crc32(data), crc32_multi(&[b"hello ", b"world"]));
        assert_ne!(crc32(b"hello"), crc32(b"world"));
    }

    #[test]
    fn test_mask_unmask() {
        let original = 0x12345678u32;
        let masked = mask_crc(original);

        assert_ne!(masked, original);
        assert_eq!(unmask_crc(masked), original);
    }

    #[test]
    fn test_verify_masked_crc() {
        let data = b"segment bytes";
        let masked = mask_crc(crc32(data));

        assert!(verify_masked_crc(data, masked));
        assert!(!verify_masked_crc(data, masked + 1));
        assert!(!verify_masked_crc(b"other bytes", masked));
    }
}
