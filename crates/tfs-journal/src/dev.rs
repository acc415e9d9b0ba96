#![forbid(unsafe_code)]
//! Per-device journal bucket rings.
//!
//! Each journal device owns a fixed list of large contiguous on-disk
//! extents ("journal buckets") recorded in its superblock journal
//! section. Writes round-robin through `cur_idx`; `last_idx` is the
//! oldest bucket still holding live entries. A bucket becomes reusable
//! once the highest sequence written into it is at or below
//! `last_seq_ondisk`.

use tfs_error::{Result, TfsError};
use tfs_types::{BucketNumber, DeviceIndex, JournalSeq};

use crate::jset::SbJournalSection;

/// Lower bound on journal buckets per device.
pub const JOURNAL_BUCKETS_MIN: usize = 8;

/// Journal sizing at device init: 1/256 of the device's buckets, at least
/// [`JOURNAL_BUCKETS_MIN`], at most 1024 buckets or 512 MiB, whichever is
/// smaller.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn journal_buckets_for_device(nbuckets: u64, bucket_sectors: u64) -> usize {
    let by_size = ((1_u64 << 20) / bucket_sectors.max(1)).min(1 << 10);
    let upper = by_size.max(JOURNAL_BUCKETS_MIN as u64);
    (nbuckets >> 8).clamp(JOURNAL_BUCKETS_MIN as u64, upper) as usize
}

/// The allocator's accounting interface, implemented by the external
/// block allocator (or by [`MkfsBucketSource`] at mkfs time).
pub trait BucketAllocator: Send + Sync {
    /// Allocate one bucket on `dev`.
    fn alloc_bucket(&self, dev: DeviceIndex) -> Result<BucketNumber>;

    /// Return a bucket obtained from [`alloc_bucket`](Self::alloc_bucket)
    /// that will not be used after all.
    fn release_bucket(&self, dev: DeviceIndex, bucket: BucketNumber);

    /// Record `bucket` as journal metadata in the allocator's accounting.
    fn mark_journal_bucket(&self, dev: DeviceIndex, bucket: BucketNumber);
}

/// Bucket source for a filesystem that is still being created: hands out
/// sequential buckets without touching the (not yet running) allocator's
/// open-bucket machinery.
#[derive(Debug)]
pub struct MkfsBucketSource {
    next: std::sync::atomic::AtomicU64,
    limit: u64,
}

impl MkfsBucketSource {
    #[must_use]
    pub fn new(first_bucket: u64, limit: u64) -> Self {
        Self {
            next: std::sync::atomic::AtomicU64::new(first_bucket),
            limit,
        }
    }
}

impl BucketAllocator for MkfsBucketSource {
    fn alloc_bucket(&self, _dev: DeviceIndex) -> Result<BucketNumber> {
        let bucket = self.next.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        if bucket >= self.limit {
            return Err(TfsError::NoSpace);
        }
        Ok(BucketNumber(bucket))
    }

    fn release_bucket(&self, _dev: DeviceIndex, _bucket: BucketNumber) {}

    // mkfs accounting is rebuilt from the superblock when the allocator
    // first comes up, so there is nothing to record here.
    fn mark_journal_bucket(&self, _dev: DeviceIndex, _bucket: BucketNumber) {}
}

/// Circular bucket allocation state for one journal device.
#[derive(Debug)]
pub struct DeviceRing {
    pub(crate) dev: DeviceIndex,
    pub(crate) bucket_sectors: u64,
    pub(crate) buckets: Vec<BucketNumber>,
    /// Highest sequence written into each bucket.
    pub(crate) bucket_seq: Vec<u64>,
    pub(crate) cur_idx: usize,
    pub(crate) last_idx: usize,
    /// Sectors already consumed in the current bucket.
    pub(crate) cur_bucket_offset: u64,
    /// Cleared by `dev_journal_stop`; an inactive ring takes no writes.
    pub(crate) active: bool,
}

impl DeviceRing {
    /// Build the runtime ring from a device's superblock journal section.
    pub fn from_superblock(
        dev: DeviceIndex,
        section: &SbJournalSection,
        bucket_sectors: u64,
    ) -> Result<Self> {
        let mut buckets = Vec::new();
        let mut bucket_seq = Vec::new();
        buckets
            .try_reserve_exact(section.buckets.len())
            .map_err(|_| TfsError::Oom("journal bucket ring"))?;
        bucket_seq
            .try_reserve_exact(section.buckets.len())
            .map_err(|_| TfsError::Oom("journal bucket seq ring"))?;
        buckets.extend_from_slice(&section.buckets);
        bucket_seq.resize(section.buckets.len(), 0);

        Ok(Self {
            dev,
            bucket_sectors,
            buckets,
            bucket_seq,
            cur_idx: 0,
            last_idx: 0,
            cur_bucket_offset: 0,
            active: true,
        })
    }

    #[must_use]
    pub fn nr(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn cur_idx(&self) -> usize {
        self.cur_idx
    }

    #[must_use]
    pub fn last_idx(&self) -> usize {
        self.last_idx
    }

    #[must_use]
    pub fn buckets(&self) -> &[BucketNumber] {
        &self.buckets
    }

    fn sectors_remaining(&self) -> u64 {
        self.bucket_sectors.saturating_sub(self.cur_bucket_offset)
    }

    fn can_advance(&self, last_seq_ondisk: JournalSeq) -> bool {
        if self.nr() == 0 {
            return false;
        }
        let next = (self.cur_idx + 1) % self.nr();
        if next != self.last_idx {
            return true;
        }
        // The oldest bucket is reusable once every entry in it fell below
        // the oldest sequence any on-disk entry still needs. Seq 0 marks
        // a never-written bucket.
        let oldest = self.bucket_seq[self.last_idx];
        oldest == 0 || oldest < last_seq_ondisk.0
    }

    fn advance(&mut self, last_seq_ondisk: JournalSeq) -> bool {
        if !self.can_advance(last_seq_ondisk) {
            return false;
        }
        let next = (self.cur_idx + 1) % self.nr();
        if next == self.last_idx {
            self.last_idx = (self.last_idx + 1) % self.nr();
        }
        self.cur_idx = next;
        self.cur_bucket_offset = 0;
        true
    }

    /// Sectors this device can accept for the next entry in one
    /// contiguous run (entries never span buckets).
    pub(crate) fn sectors_available(&self, last_seq_ondisk: JournalSeq) -> u64 {
        if self.nr() == 0 {
            return 0;
        }
        let remaining = self.sectors_remaining();
        if remaining > 0 {
            remaining
        } else if self.can_advance(last_seq_ondisk) {
            self.bucket_sectors
        } else {
            0
        }
    }

    /// Claim `sectors` for entry `seq`, returning the target bucket and
    /// the sector offset inside it.
    pub(crate) fn take_sectors(
        &mut self,
        seq: JournalSeq,
        sectors: u64,
        last_seq_ondisk: JournalSeq,
    ) -> Option<(BucketNumber, u64)> {
        if self.nr() == 0 || sectors > self.bucket_sectors {
            return None;
        }
        if sectors > self.sectors_remaining() && !self.advance(last_seq_ondisk) {
            return None;
        }
        let offset = self.cur_bucket_offset;
        self.cur_bucket_offset += sectors;
        self.bucket_seq[self.cur_idx] = self.bucket_seq[self.cur_idx].max(seq.0);
        Some((self.buckets[self.cur_idx], offset))
    }

    /// Insert a freshly allocated bucket at `last_idx`, shifting the live
    /// span upward, exactly as superblock growth records it.
    pub(crate) fn insert_bucket(&mut self, bucket: BucketNumber) {
        let nr = self.nr();
        self.buckets.insert(self.last_idx, bucket);
        self.bucket_seq.insert(self.last_idx, 0);
        if self.last_idx < nr {
            if self.cur_idx >= self.last_idx {
                self.cur_idx += 1;
            }
            self.last_idx += 1;
        }
    }

    /// Undo an insert from a failed growth pass. Only buckets no write
    /// has touched may be removed.
    pub(crate) fn remove_unused_bucket(&mut self, bucket: BucketNumber) -> bool {
        let Some(pos) = self.buckets.iter().position(|b| *b == bucket) else {
            return false;
        };
        if self.bucket_seq[pos] != 0 {
            return false;
        }
        if pos == self.cur_idx && self.cur_bucket_offset != 0 {
            return false;
        }
        self.buckets.remove(pos);
        self.bucket_seq.remove(pos);
        if self.last_idx > pos {
            self.last_idx -= 1;
        }
        if self.cur_idx > pos {
            self.cur_idx -= 1;
        }
        let len = self.nr();
        if len == 0 {
            self.cur_idx = 0;
            self.last_idx = 0;
        } else {
            self.cur_idx = self.cur_idx.min(len - 1);
            self.last_idx = self.last_idx.min(len - 1);
        }
        true
    }
}
