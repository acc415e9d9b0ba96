#![forbid(unsafe_code)]
//! Packed reservation state.
//!
//! Five logically distinct fields share one 64-bit atomic so the
//! reservation fast path is a single compare-and-swap:
//!
//! ```text
//! bits  0..20   offset inside the open entry, in u64 words
//!       20      index of the open buffer (0 or 1)
//!       21      previous buffer has a write in flight
//!       22..43  outstanding reservation count on buffer 0
//!       43..64  outstanding reservation count on buffer 1
//! ```
//!
//! The offset field carries two sentinels above any reachable offset:
//! `OFFSET_CLOSED` (no entry is open) and `OFFSET_ERROR` (the journal is
//! halted). The packed word lives in memory only and is never written to
//! disk, so the layout is endian-independent by construction.

use std::sync::atomic::{AtomicU64, Ordering};

const OFFSET_BITS: u32 = 20;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// Sentinel offset: the journal latched an error; no entry will open again.
pub const OFFSET_ERROR: u32 = (1 << OFFSET_BITS) - 1;
/// Sentinel offset: no entry is currently open.
pub const OFFSET_CLOSED: u32 = OFFSET_ERROR - 1;

const IDX_SHIFT: u32 = 20;
const PREV_UNWRITTEN_SHIFT: u32 = 21;
const COUNT_BITS: u32 = 21;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;
const COUNT0_SHIFT: u32 = 22;
const COUNT1_SHIFT: u32 = 43;

/// Maximum outstanding reservations per buffer.
pub const COUNT_MAX: u32 = (1 << COUNT_BITS) - 1;

/// Unpacked view of the reservation word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResState {
    /// Words already reserved inside the open entry, or a sentinel.
    pub offset: u32,
    /// Which of the two buffers is (or was last) open.
    pub idx: usize,
    /// The other buffer has a write in flight.
    pub prev_buf_unwritten: bool,
    /// Outstanding reservations per buffer.
    pub count: [u32; 2],
}

impl ResState {
    /// Initial state: nothing open, nothing in flight.
    #[must_use]
    pub const fn closed() -> Self {
        Self {
            offset: OFFSET_CLOSED,
            idx: 0,
            prev_buf_unwritten: false,
            count: [0, 0],
        }
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_u64(v: u64) -> Self {
        Self {
            offset: (v & OFFSET_MASK) as u32,
            idx: ((v >> IDX_SHIFT) & 1) as usize,
            prev_buf_unwritten: (v >> PREV_UNWRITTEN_SHIFT) & 1 != 0,
            count: [
                ((v >> COUNT0_SHIFT) & COUNT_MASK) as u32,
                ((v >> COUNT1_SHIFT) & COUNT_MASK) as u32,
            ],
        }
    }

    #[must_use]
    pub fn to_u64(self) -> u64 {
        debug_assert!(u64::from(self.offset) <= OFFSET_MASK);
        debug_assert!(self.idx <= 1);
        debug_assert!(self.count[0] <= COUNT_MAX && self.count[1] <= COUNT_MAX);
        u64::from(self.offset)
            | ((self.idx as u64) << IDX_SHIFT)
            | (u64::from(self.prev_buf_unwritten) << PREV_UNWRITTEN_SHIFT)
            | (u64::from(self.count[0]) << COUNT0_SHIFT)
            | (u64::from(self.count[1]) << COUNT1_SHIFT)
    }

    /// An entry is open iff the offset is below both sentinels.
    #[must_use]
    pub fn is_open(self) -> bool {
        self.offset < OFFSET_CLOSED
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self.offset == OFFSET_ERROR
    }

    /// Take one reservation reference on buffer `idx`.
    pub fn inc_count(&mut self, idx: usize) {
        debug_assert!(self.count[idx] < COUNT_MAX);
        self.count[idx] += 1;
    }

    /// Drop one reservation reference on buffer `idx`.
    pub fn dec_count(&mut self, idx: usize) {
        debug_assert!(self.count[idx] > 0);
        self.count[idx] -= 1;
    }
}

/// The shared atomic reservation word.
#[derive(Debug)]
pub struct ReservationState {
    v: AtomicU64,
}

impl ReservationState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            v: AtomicU64::new(ResState::closed().to_u64()),
        }
    }

    #[must_use]
    pub fn load(&self) -> ResState {
        ResState::from_u64(self.v.load(Ordering::Acquire))
    }

    /// Single CAS attempt; on failure returns the state actually observed.
    pub fn compare_exchange(&self, old: ResState, new: ResState) -> Result<(), ResState> {
        self.v
            .compare_exchange(
                old.to_u64(),
                new.to_u64(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(ResState::from_u64)
    }
}

impl Default for ReservationState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn closed_state_round_trips() {
        let s = ResState::closed();
        assert_eq!(ResState::from_u64(s.to_u64()), s);
        assert!(!s.is_open());
        assert!(!s.is_error());
    }

    #[test]
    fn sentinels_are_distinct_and_above_offsets() {
        assert!(OFFSET_CLOSED < OFFSET_ERROR);
        assert_eq!(u64::from(OFFSET_ERROR), OFFSET_MASK);
    }

    #[test]
    fn open_closed_error_classification() {
        let mut s = ResState::closed();
        s.offset = 0;
        assert!(s.is_open());
        s.offset = OFFSET_CLOSED - 1;
        assert!(s.is_open());
        s.offset = OFFSET_CLOSED;
        assert!(!s.is_open() && !s.is_error());
        s.offset = OFFSET_ERROR;
        assert!(s.is_error());
    }

    #[test]
    fn cas_succeeds_only_against_current_value() {
        let state = ReservationState::new();
        let old = state.load();
        let mut new = old;
        new.offset = 0;
        new.inc_count(0);
        state.compare_exchange(old, new).expect("first cas");
        assert!(state.compare_exchange(old, new).is_err());
        assert_eq!(state.load(), new);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn pack_unpack_round_trip(
            offset in 0_u32..=OFFSET_ERROR,
            idx in 0_usize..2,
            prev in any::<bool>(),
            c0 in 0_u32..=COUNT_MAX,
            c1 in 0_u32..=COUNT_MAX,
        ) {
            let s = ResState {
                offset,
                idx,
                prev_buf_unwritten: prev,
                count: [c0, c1],
            };
            prop_assert_eq!(ResState::from_u64(s.to_u64()), s);
        }

        #[test]
        fn distinct_states_pack_distinctly(
            a_off in 0_u32..=OFFSET_ERROR,
            b_off in 0_u32..=OFFSET_ERROR,
            c0 in 0_u32..=COUNT_MAX,
            c1 in 0_u32..=COUNT_MAX,
        ) {
            let a = ResState { offset: a_off, idx: 0, prev_buf_unwritten: false, count: [c0, c1] };
            let b = ResState { offset: b_off, idx: 0, prev_buf_unwritten: false, count: [c0, c1] };
            prop_assert_eq!(a == b, a.to_u64() == b.to_u64());
        }
    }
}
