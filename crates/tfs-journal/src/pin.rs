#![forbid(unsafe_code)]
//! Journal pin FIFO.
//!
//! Every live sequence number owns one pin list: a refcount of mutations
//! whose effects are not yet visible on the underlying B-trees, plus the
//! flushers registered against that sequence. While the refcount is
//! non-zero the sequence cannot be reclaimed; the FIFO front is
//! `last_seq`, the oldest sequence still holding journal space.

use std::collections::VecDeque;
use tfs_error::{Result, TfsError};
use tfs_types::JournalSeq;

/// Outcome a registered flusher reports back to the reclaim engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The flusher made its state durable; reclaim may continue.
    Flushed,
    /// The flusher cannot make progress right now (e.g. allocator
    /// pressure); reclaim yields and retries later.
    Blocked,
}

/// A flusher invoked by reclaim before its sequence is released.
pub type PinFlushFn = Box<dyn FnMut(JournalSeq) -> FlushOutcome + Send>;

pub(crate) struct PinEntry {
    pub(crate) label: &'static str,
    pub(crate) flush: PinFlushFn,
}

#[derive(Default)]
pub(crate) struct PinList {
    pub(crate) count: u32,
    pub(crate) pending: VecDeque<PinEntry>,
    /// Labels of flushers that already ran, retained for debug output.
    pub(crate) flushed: Vec<&'static str>,
}

/// Bounded ring of pin lists indexed by sequence number.
///
/// Invariant: when non-empty, the lists cover exactly the sequences
/// `[base_seq, base_seq + len)` with no gaps.
pub(crate) struct PinFifo {
    base_seq: u64,
    lists: VecDeque<PinList>,
    capacity: usize,
}

impl PinFifo {
    pub(crate) fn new(capacity: usize) -> Result<Self> {
        let mut lists = VecDeque::new();
        lists
            .try_reserve_exact(capacity)
            .map_err(|_| TfsError::Oom("journal pin fifo"))?;
        Ok(Self {
            base_seq: 0,
            lists,
            capacity,
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.lists.len() >= self.capacity
    }

    pub(crate) fn used(&self) -> usize {
        self.lists.len()
    }

    /// The oldest live sequence. Zero when nothing is pinned yet.
    pub(crate) fn last_seq(&self) -> JournalSeq {
        if self.lists.is_empty() {
            JournalSeq::NONE
        } else {
            JournalSeq(self.base_seq)
        }
    }

    /// Push the pin list for a freshly created sequence.
    pub(crate) fn push(&mut self, seq: JournalSeq, count: u32) {
        debug_assert!(!self.is_full());
        if self.lists.is_empty() {
            self.base_seq = seq.0;
        } else {
            debug_assert_eq!(seq.0, self.base_seq + self.lists.len() as u64);
        }
        self.lists.push_back(PinList {
            count,
            pending: VecDeque::new(),
            flushed: Vec::new(),
        });
    }

    pub(crate) fn get_mut(&mut self, seq: JournalSeq) -> Option<&mut PinList> {
        let idx = seq.0.checked_sub(self.base_seq)?;
        self.lists.get_mut(usize::try_from(idx).ok()?)
    }

    pub(crate) fn front(&self) -> Option<&PinList> {
        self.lists.front()
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut PinList> {
        self.lists.front_mut()
    }

    /// Drop the front list, advancing `last_seq`.
    pub(crate) fn pop_front(&mut self) {
        debug_assert!(!self.lists.is_empty());
        self.lists.pop_front();
        self.base_seq += 1;
    }

    /// Iterate `(seq, list)` pairs from `last_seq` upward.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (JournalSeq, &PinList)> + '_ {
        self.lists
            .iter()
            .enumerate()
            .map(|(i, l)| (JournalSeq(self.base_seq + i as u64), l))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fifo(capacity: usize) -> PinFifo {
        PinFifo::new(capacity).expect("alloc pin fifo")
    }

    #[test]
    fn push_pop_advances_last_seq() {
        let mut f = fifo(8);
        assert_eq!(f.last_seq(), JournalSeq::NONE);

        f.push(JournalSeq(1), 1);
        f.push(JournalSeq(2), 1);
        assert_eq!(f.last_seq(), JournalSeq(1));
        assert_eq!(f.used(), 2);

        f.pop_front();
        assert_eq!(f.last_seq(), JournalSeq(2));
        f.pop_front();
        assert!(f.is_empty());
    }

    #[test]
    fn full_detection() {
        let mut f = fifo(2);
        f.push(JournalSeq(5), 0);
        assert!(!f.is_full());
        f.push(JournalSeq(6), 1);
        assert!(f.is_full());
    }

    #[test]
    fn get_mut_by_seq() {
        let mut f = fifo(4);
        f.push(JournalSeq(10), 1);
        f.push(JournalSeq(11), 2);

        assert_eq!(f.get_mut(JournalSeq(10)).expect("present").count, 1);
        assert_eq!(f.get_mut(JournalSeq(11)).expect("present").count, 2);
        assert!(f.get_mut(JournalSeq(9)).is_none());
        assert!(f.get_mut(JournalSeq(12)).is_none());
    }

    #[test]
    fn iter_yields_sequences_in_order() {
        let mut f = fifo(4);
        f.push(JournalSeq(3), 0);
        f.push(JournalSeq(4), 1);
        let seqs: Vec<_> = f.iter().map(|(s, _)| s.0).collect();
        assert_eq!(seqs, vec![3, 4]);
    }
}
