#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Size of one device sector in bytes.
pub const SECTOR_SIZE: u64 = 512;
/// 64-bit words per sector.
pub const SECTOR_U64S: u64 = SECTOR_SIZE / 8;

/// Monotonically increasing 64-bit identifier of one journal entry.
///
/// Sequence 0 is reserved: it means "no entry" in query results
/// (e.g. inode-to-seq lookups) and is never assigned to a real entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JournalSeq(pub u64);

impl JournalSeq {
    pub const NONE: Self = Self(0);

    /// Add an entry count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Subtract an entry count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, count: u64) -> Option<Self> {
        self.0.checked_sub(count).map(Self)
    }
}

/// Inode number as seen by the journal's dirty-inode tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Physical journal bucket number on one device (bucket-granular, not a
/// sector address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketNumber(pub u64);

/// Index of a member device within the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceIndex(pub u32);

/// Identifier of one of the filesystem's B-trees.
///
/// Every journal entry reserves space for one root record per B-tree, so
/// the count here feeds directly into the per-entry suffix reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BtreeId {
    Extents = 0,
    Inodes = 1,
    Dirents = 2,
    Xattrs = 3,
    Alloc = 4,
    Quotas = 5,
}

impl BtreeId {
    pub const COUNT: usize = 6;

    pub const ALL: [Self; Self::COUNT] = [
        Self::Extents,
        Self::Inodes,
        Self::Dirents,
        Self::Xattrs,
        Self::Alloc,
        Self::Quotas,
    ];

    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.get(usize::from(raw)).copied()
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// Number of whole 64-bit words needed to hold `bytes` bytes.
#[must_use]
pub fn u64s_for_bytes(bytes: u64) -> u64 {
    bytes.div_ceil(8)
}

/// Number of whole sectors needed to hold `bytes` bytes.
#[must_use]
pub fn sectors_for_bytes(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE)
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `u64` to `u32` with an explicit error path.
pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

impl fmt::Display for JournalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BucketNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert_eq!(read_le_u64(&bytes, 0).expect("u64"), 0x90AB_CDEF_5678_1234);
    }

    #[test]
    fn test_read_helpers_out_of_range() {
        let bytes = [0_u8; 4];
        assert!(read_le_u64(&bytes, 0).is_err());
        assert!(read_le_u32(&bytes, 1).is_err());
        assert_eq!(
            read_le_u16(&bytes, 3).unwrap_err(),
            ParseError::InsufficientData {
                needed: 2,
                offset: 3,
                actual: 1
            }
        );
    }

    #[test]
    fn test_word_and_sector_rounding() {
        assert_eq!(u64s_for_bytes(0), 0);
        assert_eq!(u64s_for_bytes(1), 1);
        assert_eq!(u64s_for_bytes(8), 1);
        assert_eq!(u64s_for_bytes(9), 2);
        assert_eq!(sectors_for_bytes(0), 0);
        assert_eq!(sectors_for_bytes(512), 1);
        assert_eq!(sectors_for_bytes(513), 2);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 512), Some(0));
        assert_eq!(align_up(1, 512), Some(512));
        assert_eq!(align_up(512, 512), Some(512));
        assert_eq!(align_up(u64::MAX, 512), None);
        assert_eq!(align_up(100, 0), None);
        assert_eq!(align_up(100, 3), None);
    }

    #[test]
    fn test_btree_id_round_trip() {
        for id in BtreeId::ALL {
            assert_eq!(BtreeId::from_u8(id.as_u8()), Some(id));
        }
        assert_eq!(BtreeId::from_u8(BtreeId::COUNT as u8), None);
    }

    #[test]
    fn test_seq_checked_ops() {
        assert_eq!(JournalSeq(10).checked_add(5), Some(JournalSeq(15)));
        assert_eq!(JournalSeq(u64::MAX).checked_add(1), None);
        assert_eq!(JournalSeq(10).checked_sub(10), Some(JournalSeq(0)));
        assert_eq!(JournalSeq(0).checked_sub(1), None);
    }
}
