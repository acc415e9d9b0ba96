#![forbid(unsafe_code)]
//! On-disk journal entry format.
//!
//! One durable entry ("jset") is a little-endian header followed by a
//! payload of 64-bit words:
//!
//! ```text
//! jset_header {
//!     u64  seq;        // this entry's sequence
//!     u64  last_seq;   // oldest still-pinned seq at close time
//!     u32  u64s_used;  // payload length in 64-bit words
//!     u32  flags;
//! }
//! ```
//!
//! The payload is a sequence of `jset_entry` records, each one header word
//! `{ u16 u64s; u8 btree_id; u8 type; u8 level; u8 pad[3] }` followed by
//! `u64s` payload words (the bkey payload). The encoded entry is padded
//! with zeroes to a whole number of sectors.

use tfs_error::{Result, TfsError};
use tfs_types::{
    read_le_u32, read_le_u64, u64_to_usize, BtreeId, BucketNumber, JournalSeq, ParseError,
    SECTOR_SIZE,
};

/// Encoded size of the jset header in bytes.
pub const JSET_HEADER_BYTES: usize = 24;
/// Header size in 64-bit words.
pub const JSET_HEADER_U64S: u64 = (JSET_HEADER_BYTES as u64) / 8;
/// Per-record overhead: one word of `jset_entry` header.
pub const JSET_KEYS_OVERHEAD_U64S: u64 = 1;
/// Upper bound on one encoded extent bkey, in words.
pub const BKEY_EXTENT_U64S_MAX: u64 = 12;

/// Words reserved at the tail of every open entry so the guaranteed-always
/// records (one B-tree root per tree) can be appended at write time without
/// re-checking capacity.
#[must_use]
pub fn entry_suffix_u64s() -> u64 {
    BtreeId::COUNT as u64 * (JSET_KEYS_OVERHEAD_U64S + BKEY_EXTENT_U64S_MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsetHeader {
    pub seq: JournalSeq,
    pub last_seq: JournalSeq,
    pub u64s_used: u32,
    pub flags: u32,
}

impl JsetHeader {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.seq.0.to_le_bytes());
        out.extend_from_slice(&self.last_seq.0.to_le_bytes());
        out.extend_from_slice(&self.u64s_used.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, ParseError> {
        Ok(Self {
            seq: JournalSeq(read_le_u64(bytes, 0)?),
            last_seq: JournalSeq(read_le_u64(bytes, 8)?),
            u64s_used: read_le_u32(bytes, 16)?,
            flags: read_le_u32(bytes, 20)?,
        })
    }
}

/// Record types carried in a jset payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JsetEntryType {
    /// B-tree keys inserted by a metadata mutation. A header word with
    /// zero payload words is also the padding record `res_put` emits for
    /// unused reservation space.
    BtreeKeys = 0,
    /// A B-tree root, recorded at write time in the reserved suffix.
    BtreeRoot = 1,
    /// A blacklisted sequence range `[start, end]`.
    Blacklist = 2,
}

impl JsetEntryType {
    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::BtreeKeys),
            1 => Some(Self::BtreeRoot),
            2 => Some(Self::Blacklist),
            _ => None,
        }
    }
}

/// One decoded payload record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsetEntry {
    pub entry_type: JsetEntryType,
    pub btree_id: u8,
    pub level: u8,
    pub payload: Vec<u64>,
}

impl JsetEntry {
    #[must_use]
    pub fn new(entry_type: JsetEntryType, btree_id: u8, level: u8, payload: Vec<u64>) -> Self {
        Self {
            entry_type,
            btree_id,
            level,
            payload,
        }
    }

    /// Total words this record occupies, header word included.
    #[must_use]
    pub fn u64s(&self) -> u64 {
        JSET_KEYS_OVERHEAD_U64S + self.payload.len() as u64
    }

    #[must_use]
    pub fn btree(&self) -> Option<BtreeId> {
        BtreeId::from_u8(self.btree_id)
    }

    /// Pack the record header into its on-disk word.
    pub fn header_word(&self) -> Result<u64> {
        let u64s = u16::try_from(self.payload.len())
            .map_err(|_| ParseError::IntegerConversion { field: "entry_u64s" })?;
        Ok(pack_entry_header(
            u64s,
            self.btree_id,
            self.entry_type as u8,
            self.level,
        ))
    }
}

/// Pack one `jset_entry` header word.
#[must_use]
pub fn pack_entry_header(u64s: u16, btree_id: u8, entry_type: u8, level: u8) -> u64 {
    let mut bytes = [0_u8; 8];
    bytes[0..2].copy_from_slice(&u64s.to_le_bytes());
    bytes[2] = btree_id;
    bytes[3] = entry_type;
    bytes[4] = level;
    u64::from_le_bytes(bytes)
}

fn unpack_entry_header(word: u64) -> (u16, u8, u8, u8) {
    let bytes = word.to_le_bytes();
    let u64s = u16::from_le_bytes([bytes[0], bytes[1]]);
    (u64s, bytes[2], bytes[3], bytes[4])
}

/// A fully decoded journal entry, for replay implementers and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Jset {
    pub header: JsetHeader,
    pub entries: Vec<JsetEntry>,
}

impl Jset {
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, ParseError> {
        let header = JsetHeader::decode(bytes)?;
        let used = u64_to_usize(u64::from(header.u64s_used), "u64s_used")?;

        let mut words = Vec::with_capacity(used);
        for i in 0..used {
            words.push(read_le_u64(bytes, JSET_HEADER_BYTES + i * 8)?);
        }

        let mut entries = Vec::new();
        let mut pos = 0_usize;
        while pos < words.len() {
            let (u64s, btree_id, raw_type, level) = unpack_entry_header(words[pos]);
            let entry_type =
                JsetEntryType::from_u8(raw_type).ok_or(ParseError::InvalidField {
                    field: "entry_type",
                    reason: "unknown jset entry type",
                })?;
            let payload_len = usize::from(u64s);
            let end = pos + 1 + payload_len;
            if end > words.len() {
                return Err(ParseError::InsufficientData {
                    needed: payload_len * 8,
                    offset: JSET_HEADER_BYTES + (pos + 1) * 8,
                    actual: (words.len() - pos - 1) * 8,
                });
            }
            entries.push(JsetEntry {
                entry_type,
                btree_id,
                level,
                payload: words[pos + 1..end].to_vec(),
            });
            pos = end;
        }

        Ok(Self { header, entries })
    }
}

/// Serialize a header plus payload words, zero-padded to whole sectors.
#[must_use]
pub fn encode_entry(header: &JsetHeader, words: &[u64]) -> Vec<u8> {
    debug_assert_eq!(words.len(), header.u64s_used as usize);
    let unpadded = JSET_HEADER_BYTES + words.len() * 8;
    let padded = unpadded.div_ceil(SECTOR_SIZE as usize) * SECTOR_SIZE as usize;

    let mut out = Vec::with_capacity(padded);
    header.encode_into(&mut out);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out.resize(padded, 0);
    out
}

/// The superblock journal section: the fixed list of journal buckets on
/// one device, as a bare little-endian u64 array.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SbJournalSection {
    pub buckets: Vec<BucketNumber>,
}

impl SbJournalSection {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.buckets.len() * 8);
        for b in &self.buckets {
            out.extend_from_slice(&b.0.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, ParseError> {
        if bytes.len() % 8 != 0 {
            return Err(ParseError::InvalidField {
                field: "journal_buckets",
                reason: "section length is not a multiple of 8",
            });
        }
        let mut buckets = Vec::with_capacity(bytes.len() / 8);
        for i in 0..bytes.len() / 8 {
            buckets.push(BucketNumber(read_le_u64(bytes, i * 8)?));
        }
        Ok(Self { buckets })
    }

    /// Grow the section to `nr` bucket slots, zero-filled.
    pub fn resize(&mut self, nr: usize) -> Result<()> {
        if nr > self.buckets.len() {
            self.buckets
                .try_reserve_exact(nr - self.buckets.len())
                .map_err(|_| TfsError::Oom("superblock journal section"))?;
            self.buckets.resize(nr, BucketNumber(0));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let h = JsetHeader {
            seq: JournalSeq(7),
            last_seq: JournalSeq(3),
            u64s_used: 42,
            flags: 0,
        };
        let mut bytes = Vec::new();
        h.encode_into(&mut bytes);
        assert_eq!(bytes.len(), JSET_HEADER_BYTES);
        assert_eq!(JsetHeader::decode(&bytes).expect("decode"), h);
    }

    #[test]
    fn header_decode_truncated() {
        assert!(JsetHeader::decode(&[0_u8; 23]).is_err());
    }

    #[test]
    fn entry_header_word_round_trip() {
        let word = pack_entry_header(5, 2, 1, 3);
        assert_eq!(unpack_entry_header(word), (5, 2, 1, 3));
    }

    #[test]
    fn encode_pads_to_sector() {
        let h = JsetHeader {
            seq: JournalSeq(1),
            last_seq: JournalSeq(1),
            u64s_used: 1,
            flags: 0,
        };
        let bytes = encode_entry(&h, &[0xDEAD_BEEF]);
        assert_eq!(bytes.len(), SECTOR_SIZE as usize);
        assert!(bytes[32..].iter().all(|b| *b == 0));
    }

    #[test]
    fn jset_decode_walks_entries() {
        let entry = JsetEntry::new(
            JsetEntryType::BtreeKeys,
            BtreeId::Extents.as_u8(),
            0,
            vec![0x11, 0x22],
        );
        let root = JsetEntry::new(JsetEntryType::BtreeRoot, BtreeId::Inodes.as_u8(), 1, vec![9]);

        let mut words = vec![entry.header_word().expect("header")];
        words.extend_from_slice(&entry.payload);
        words.push(root.header_word().expect("header"));
        words.extend_from_slice(&root.payload);

        let h = JsetHeader {
            seq: JournalSeq(4),
            last_seq: JournalSeq(2),
            u64s_used: u32::try_from(words.len()).expect("fits"),
            flags: 0,
        };
        let bytes = encode_entry(&h, &words);
        let jset = Jset::decode(&bytes).expect("decode");
        assert_eq!(jset.header, h);
        assert_eq!(jset.entries, vec![entry, root]);
    }

    #[test]
    fn jset_decode_rejects_overlong_entry() {
        // One entry header claiming more payload words than the jset holds.
        let words = vec![pack_entry_header(4, 0, 0, 0)];
        let h = JsetHeader {
            seq: JournalSeq(1),
            last_seq: JournalSeq(1),
            u64s_used: 1,
            flags: 0,
        };
        let bytes = encode_entry(&h, &words);
        assert!(Jset::decode(&bytes).is_err());
    }

    #[test]
    fn padding_records_decode_as_empty_btree_keys() {
        let words = vec![pack_entry_header(0, 0, 0, 0); 3];
        let h = JsetHeader {
            seq: JournalSeq(9),
            last_seq: JournalSeq(9),
            u64s_used: 3,
            flags: 0,
        };
        let jset = Jset::decode(&encode_entry(&h, &words)).expect("decode");
        assert_eq!(jset.entries.len(), 3);
        assert!(jset
            .entries
            .iter()
            .all(|e| e.entry_type == JsetEntryType::BtreeKeys && e.payload.is_empty()));
    }

    #[test]
    fn sb_section_round_trip() {
        let section = SbJournalSection {
            buckets: vec![BucketNumber(3), BucketNumber(17), BucketNumber(99)],
        };
        let bytes = section.encode();
        assert_eq!(SbJournalSection::decode(&bytes).expect("decode"), section);
        assert!(SbJournalSection::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn suffix_reserve_covers_one_root_per_btree() {
        assert_eq!(
            entry_suffix_u64s(),
            BtreeId::COUNT as u64 * (1 + BKEY_EXTENT_U64S_MAX)
        );
    }
}
