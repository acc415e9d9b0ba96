#![forbid(unsafe_code)]
//! Write-ahead journal core for TarnFS metadata mutations.
//!
//! The journal serializes B-tree key inserts into append-only log
//! entries, replicated to every active journal device before a
//! reservation is acknowledged as durable. Producers reserve space in
//! the currently open entry through a lock-free compare-and-swap
//! protocol; two staging buffers alternate so the next entry can fill
//! while the previous one is still being written; a pin FIFO ties
//! outstanding mutations to the oldest unflushed sequence so journal
//! space is only reclaimed once the downstream flushers caught up.

pub mod dev;
pub mod jset;
pub mod pin;
pub mod state;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use tfs_error::{Result, TfsError};
use tfs_types::{
    sectors_for_bytes, u64s_for_bytes, BucketNumber, DeviceIndex, InodeNumber, JournalSeq,
    ParseError, SECTOR_U64S,
};

use crate::dev::{BucketAllocator, DeviceRing};
use crate::jset::{
    encode_entry, entry_suffix_u64s, JsetEntry, JsetEntryType, JsetHeader, SbJournalSection,
    JSET_HEADER_BYTES,
};
use crate::pin::{FlushOutcome, PinEntry, PinFifo, PinFlushFn};
use crate::state::{ResState, ReservationState, OFFSET_CLOSED, OFFSET_ERROR};

// ---------------------------------------------------------------------------
// External seams
// ---------------------------------------------------------------------------

/// Replicated entry submission, implemented by the block I/O layer.
///
/// `write_bucket` must not return until the data is durable on that
/// device (the core issues one call per replica, in parallel, and treats
/// the entry as durable only once every call returned `Ok`).
pub trait JournalIo: Send + Sync {
    fn write_bucket(
        &self,
        dev: DeviceIndex,
        bucket: BucketNumber,
        sector_offset: u64,
        data: &[u8],
    ) -> Result<()>;
}

/// Source of the guaranteed-always records appended at write time: at
/// most one current root per B-tree, each sized within the per-entry
/// suffix reservation.
pub trait BtreeRootsSource: Send + Sync {
    fn roots(&self) -> Vec<JsetEntry>;
}

/// Allocator callback invoked when the buffer-switch counter wraps.
/// Integration point for the allocator's bucket GC; the journal itself
/// has no invariant tied to it.
pub trait BucketSeqHook: Send + Sync {
    fn bucket_seq_cleanup(&self);
}

/// Continuation registered against a flush or open event. Receives `Ok`
/// once the event's entry is durable, or `Err(JournalIo)` if the journal
/// halted first.
pub type FlushCallback = Box<dyn FnOnce(Result<()>) + Send>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct JournalConfig {
    /// Initial size of each staging buffer, in bytes. Power of two.
    pub entry_size_min: usize,
    /// Upper bound the buffers may grow to on demand. Power of two.
    pub entry_size_max: usize,
    /// Capacity of the pin FIFO (maximum live sequences).
    pub pin_fifo_size: usize,
    /// Delay before an open entry is force-written.
    pub write_delay: Duration,
    /// Period of the background reclaim tick.
    pub reclaim_delay: Duration,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            entry_size_min: 64 * 1024,
            entry_size_max: 4 * 1024 * 1024,
            pin_fifo_size: 4096,
            write_delay: Duration::from_millis(1000),
            reclaim_delay: Duration::from_millis(100),
        }
    }
}

impl JournalConfig {
    fn validate(&self) -> Result<()> {
        let invalid = |reason| {
            TfsError::Parse(ParseError::InvalidField {
                field: "journal_config",
                reason,
            })
        };
        if !self.entry_size_min.is_power_of_two() || !self.entry_size_max.is_power_of_two() {
            return Err(invalid("entry sizes must be powers of two"));
        }
        if self.entry_size_min < 4096 || self.entry_size_min > self.entry_size_max {
            return Err(invalid("entry_size_min out of range"));
        }
        let max_words = (self.entry_size_max as u64) / 8 + entry_suffix_u64s();
        if max_words >= u64::from(OFFSET_CLOSED) {
            return Err(invalid("entry_size_max exceeds the reservation offset field"));
        }
        if self.pin_fifo_size < 2 {
            return Err(invalid("pin_fifo_size must be at least 2"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Entry buffers
// ---------------------------------------------------------------------------

fn alloc_arena(words: usize) -> Result<Box<[AtomicU64]>> {
    let mut v = Vec::new();
    v.try_reserve_exact(words)
        .map_err(|_| TfsError::Oom("journal entry buffer"))?;
    v.resize_with(words, || AtomicU64::new(0));
    Ok(v.into_boxed_slice())
}

/// Staging area for one in-construction log entry.
///
/// The word arena and the inode Bloom filter are written lock-free by
/// reservation holders; everything else is touched under the core mutex
/// or while this buffer is quiescent (sealed with no outstanding
/// reservations).
struct EntryBuffer {
    /// Sequence of the entry staged here; published before the open
    /// state so the reservation fast path can read it without the lock.
    seq: AtomicU64,
    words: RwLock<Box<[AtomicU64]>>,
    size_bytes: AtomicUsize,
    /// Payload words currently in the buffer: pre-seeded records while
    /// closed, the sealed length once switched out.
    u64s: AtomicU32,
    /// Sectors the device ring offered when this entry was opened.
    disk_sectors: AtomicU64,
    /// `last_seq` recorded into the header when the entry was sealed.
    sealed_last_seq: AtomicU64,
    /// 256-bit Bloom filter of inode numbers touched by this entry.
    has_inode: [AtomicU64; 4],
    wait: Mutex<Vec<FlushCallback>>,
}

impl EntryBuffer {
    fn with_size(bytes: usize) -> Result<Self> {
        Ok(Self {
            seq: AtomicU64::new(0),
            words: RwLock::new(alloc_arena(bytes / 8)?),
            size_bytes: AtomicUsize::new(bytes),
            u64s: AtomicU32::new(0),
            disk_sectors: AtomicU64::new(0),
            sealed_last_seq: AtomicU64::new(0),
            has_inode: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            wait: Mutex::new(Vec::new()),
        })
    }

    fn size(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// Replace the arena with a larger one. Caller guarantees the buffer
    /// is quiescent.
    fn grow(&self, bytes: usize) -> Result<()> {
        let arena = alloc_arena(bytes / 8)?;
        *self.words.write() = arena;
        self.size_bytes.store(bytes, Ordering::Relaxed);
        Ok(())
    }

    fn store_word(&self, pos: usize, word: u64) {
        let arena = self.words.read();
        debug_assert!(pos < arena.len());
        if let Some(slot) = arena.get(pos) {
            slot.store(word, Ordering::Release);
        }
    }

    fn store_words(&self, pos: usize, src: &[u64]) {
        let arena = self.words.read();
        debug_assert!(pos + src.len() <= arena.len());
        for (i, word) in src.iter().enumerate() {
            if let Some(slot) = arena.get(pos + i) {
                slot.store(*word, Ordering::Release);
            }
        }
    }

    fn snapshot_words(&self, count: usize) -> Vec<u64> {
        let arena = self.words.read();
        let count = count.min(arena.len());
        (0..count).map(|i| arena[i].load(Ordering::Acquire)).collect()
    }

    fn reset_for_open(&self, seq: u64) {
        self.seq.store(seq, Ordering::Release);
        self.u64s.store(0, Ordering::Release);
        self.sealed_last_seq.store(0, Ordering::Relaxed);
        for word in &self.has_inode {
            word.store(0, Ordering::Release);
        }
    }

    /// Append a record while the buffer is closed (start-time seeding).
    fn seed_entry(&self, entry: &JsetEntry) -> Result<()> {
        let pos = self.u64s.load(Ordering::Acquire) as usize;
        let need = usize::try_from(entry.u64s())
            .map_err(|_| ParseError::IntegerConversion { field: "entry_u64s" })?;
        if pos + need > self.words.read().len() {
            return Err(TfsError::NoSpace);
        }
        self.store_word(pos, entry.header_word()?);
        self.store_words(pos + 1, &entry.payload);
        self.u64s
            .store(u32::try_from(pos + need).unwrap_or(u32::MAX), Ordering::Release);
        Ok(())
    }

    fn bloom_set(&self, bit: usize) {
        self.has_inode[bit / 64].fetch_or(1 << (bit % 64), Ordering::Release);
    }

    fn bloom_test(&self, bit: usize) -> bool {
        self.has_inode[bit / 64].load(Ordering::Acquire) & (1 << (bit % 64)) != 0
    }

    fn push_waiter(&self, cb: FlushCallback) {
        self.wait.lock().push(cb);
    }

    fn take_waiters(&self) -> Vec<FlushCallback> {
        std::mem::take(&mut *self.wait.lock())
    }
}

fn inode_hash(inode: InodeNumber) -> usize {
    // Fibonacci hash down to the filter's 256 bits.
    #[allow(clippy::cast_possible_truncation)]
    {
        (inode.0.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 56) as usize
    }
}

// ---------------------------------------------------------------------------
// Reservations
// ---------------------------------------------------------------------------

/// A caller-exclusive word range inside the currently open entry.
///
/// Obtained from [`Journal::res_get`], filled through
/// [`Journal::res_write`] / [`Journal::res_add_entry`], and returned
/// with [`Journal::res_put`]. Unwritten granted space is padded with
/// empty records at put time.
#[derive(Debug)]
pub struct Reservation {
    seq: JournalSeq,
    idx: usize,
    offset: u32,
    u64s: u32,
    written: u32,
}

impl Reservation {
    #[must_use]
    pub fn seq(&self) -> JournalSeq {
        self.seq
    }

    /// Word offset of this reservation inside the entry payload.
    #[must_use]
    pub fn offset_u64s(&self) -> u32 {
        self.offset
    }

    /// Granted size in words (`need_min ≤ granted ≤ need_max`).
    #[must_use]
    pub fn u64s(&self) -> u32 {
        self.u64s
    }

    #[must_use]
    pub fn remaining_u64s(&self) -> u32 {
        self.u64s - self.written
    }
}

// ---------------------------------------------------------------------------
// The journal core
// ---------------------------------------------------------------------------

struct JournalInner {
    /// Sequence of the current (newest) entry.
    seq: u64,
    pin: PinFifo,
    /// Highest `last_seq` recorded by a completed entry write.
    last_seq_ondisk: u64,
    devs: Vec<DeviceRing>,
    /// Sectors offered to the currently open entry.
    cur_buf_sectors: u64,
    /// Sector budget sealed for the previous (closing) entry.
    prev_buf_sectors: u64,
    /// Requested arena growth for the next open, in bytes. Zero = none.
    buf_size_want: usize,
    write_deadline: Option<Instant>,
    need_write_since: Option<Instant>,
    blocked_since: Option<Instant>,
    /// Continuations waiting for any entry to open (`open_seq_async`).
    async_wait: Vec<FlushCallback>,
    /// Continuations to run right after the core mutex is dropped.
    deferred: Vec<FlushCallback>,
    /// Devices targeted by the write currently in flight.
    writing_devs: Vec<DeviceIndex>,
    /// Buffer switches since the last bucket-GC hook invocation.
    switch_count: u64,
    started: bool,
    stopping: bool,
    roots_source: Option<Arc<dyn BtreeRootsSource>>,
    bucket_seq_hook: Option<Arc<dyn BucketSeqHook>>,
}

enum SwitchOutcome<'a> {
    Error(MutexGuard<'a, JournalInner>),
    Inuse(MutexGuard<'a, JournalInner>),
    Closed(MutexGuard<'a, JournalInner>),
    Unlocked,
}

enum Pass<'a> {
    Done(Reservation),
    Retry,
    Blocked(MutexGuard<'a, JournalInner>),
}

/// One filesystem instance owns one `Journal`; there is no global state.
pub struct Journal {
    state: ReservationState,
    /// Capacity of the open entry in payload words; published with
    /// release ordering before the open state becomes visible.
    cur_entry_u64s: AtomicU32,
    need_write: AtomicBool,
    bufs: [EntryBuffer; 2],
    inner: Mutex<JournalInner>,
    /// Reservation, flush and shutdown waiters.
    wait: Condvar,
    /// Delayed-write and reclaim worker wakeups.
    timer: Condvar,
    /// Serializes reclaim passes (worker vs. inline slow path).
    reclaim_lock: Mutex<()>,
    io: Arc<dyn JournalIo>,
    config: JournalConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Journal {
    pub fn new(config: JournalConfig, io: Arc<dyn JournalIo>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: ReservationState::new(),
            cur_entry_u64s: AtomicU32::new(0),
            need_write: AtomicBool::new(false),
            bufs: [
                EntryBuffer::with_size(config.entry_size_min)?,
                EntryBuffer::with_size(config.entry_size_min)?,
            ],
            inner: Mutex::new(JournalInner {
                seq: 0,
                pin: PinFifo::new(config.pin_fifo_size)?,
                last_seq_ondisk: 0,
                devs: Vec::new(),
                cur_buf_sectors: 0,
                prev_buf_sectors: 0,
                buf_size_want: 0,
                write_deadline: None,
                need_write_since: None,
                blocked_since: None,
                async_wait: Vec::new(),
                deferred: Vec::new(),
                writing_devs: Vec::new(),
                switch_count: 0,
                started: false,
                stopping: false,
                roots_source: None,
                bucket_seq_hook: None,
            }),
            wait: Condvar::new(),
            timer: Condvar::new(),
            reclaim_lock: Mutex::new(()),
            io,
            config,
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn set_roots_source(&self, src: Arc<dyn BtreeRootsSource>) {
        self.inner.lock().roots_source = Some(src);
    }

    pub fn set_bucket_seq_hook(&self, hook: Arc<dyn BucketSeqHook>) {
        self.inner.lock().bucket_seq_hook = Some(hook);
    }

    // -- observers ----------------------------------------------------------

    #[must_use]
    pub fn cur_seq(&self) -> JournalSeq {
        JournalSeq(self.inner.lock().seq)
    }

    #[must_use]
    pub fn last_seq(&self) -> JournalSeq {
        self.inner.lock().pin.last_seq()
    }

    #[must_use]
    pub fn last_seq_ondisk(&self) -> JournalSeq {
        JournalSeq(self.inner.lock().last_seq_ondisk)
    }

    /// The oldest sequence whose write has not completed.
    #[must_use]
    pub fn last_unwritten_seq(&self) -> JournalSeq {
        let inner = self.inner.lock();
        let mut seq = inner.seq;
        if self.state.load().prev_buf_unwritten {
            seq = seq.saturating_sub(1);
        }
        JournalSeq(seq)
    }

    /// True once the journal latched its error state.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.state.load().is_error()
    }

    // -- reservation fast path ----------------------------------------------

    fn res_get_fast(&self, words_min: u32, words_max: u32) -> Option<Reservation> {
        loop {
            let old = self.state.load();
            if !old.is_open() {
                return None;
            }
            let cap = self.cur_entry_u64s.load(Ordering::Acquire);
            let free = cap.saturating_sub(old.offset);
            if free < words_min {
                return None;
            }
            let take = free.min(words_max);

            let mut new = old;
            new.offset += take;
            new.inc_count(old.idx);
            if self.state.compare_exchange(old, new).is_ok() {
                let seq = self.bufs[old.idx].seq.load(Ordering::Acquire);
                return Some(Reservation {
                    seq: JournalSeq(seq),
                    idx: old.idx,
                    offset: old.offset,
                    u64s: take,
                    written: 0,
                });
            }
        }
    }

    /// Reserve between `bytes_min` and `bytes_max` bytes in the open
    /// entry, blocking while the journal is full. The granted range is
    /// exclusively this caller's until `res_put`.
    pub fn res_get(&self, bytes_min: usize, bytes_max: usize) -> Result<Reservation> {
        let words_min = u64s_for_bytes(bytes_min as u64).max(1);
        let words_max = u64s_for_bytes(bytes_max as u64).max(words_min);
        let words_min =
            u32::try_from(words_min).map_err(|_| TfsError::NoSpace)?;
        #[allow(clippy::cast_possible_truncation)]
        let words_max = words_max.min(u64::from(OFFSET_CLOSED)) as u32;
        if words_min >= OFFSET_CLOSED {
            return Err(TfsError::NoSpace);
        }

        loop {
            match self.res_get_pass(words_min, words_max)? {
                Pass::Done(res) => return Ok(res),
                Pass::Retry => {}
                Pass::Blocked(mut inner) => {
                    if inner.stopping {
                        return Err(TfsError::Interrupted);
                    }
                    self.wait.wait(&mut inner);
                    if inner.stopping {
                        return Err(TfsError::Interrupted);
                    }
                }
            }
        }
    }

    /// One slow-path attempt: retry the fast path under the lock, switch
    /// the buffer, open the next entry, or report that the caller must
    /// wait (returning the still-held guard so no wakeup is lost).
    fn res_get_pass(&self, words_min: u32, words_max: u32) -> Result<Pass<'_>> {
        if let Some(res) = self.res_get_fast(words_min, words_max) {
            return Ok(Pass::Done(res));
        }

        let mut inner = self.inner.lock();
        // Recheck after taking the lock so a racing open is not answered
        // with an unnecessary switch.
        if let Some(res) = self.res_get_fast(words_min, words_max) {
            return Ok(Pass::Done(res));
        }

        // The entry filled while the on-disk ring had room for a bigger
        // one: ask for a larger buffer at the next open.
        let s = self.state.load();
        if s.is_open() {
            let buf = &self.bufs[s.idx];
            let size = buf.size();
            if (size as u64) >> 9 < buf.disk_sectors.load(Ordering::Relaxed)
                && size < self.config.entry_size_max
            {
                inner.buf_size_want = inner
                    .buf_size_want
                    .max(size * 2)
                    .min(self.config.entry_size_max);
            }
        }

        match self.buf_switch(inner, false) {
            SwitchOutcome::Error(_inner) => return Err(TfsError::JournalIo),
            SwitchOutcome::Inuse(mut inner) => {
                // Previous entry still being written out.
                trace!(target: "tfs::journal", "journal_entry_full");
                if inner.blocked_since.is_none() {
                    inner.blocked_since = Some(Instant::now());
                }
                return Ok(Pass::Blocked(inner));
            }
            SwitchOutcome::Unlocked => return Ok(Pass::Retry),
            SwitchOutcome::Closed(guard) => inner = guard,
        }

        match self.open_entry(&mut inner) {
            Ok(true) => {
                let cbs = Self::take_deferred(&mut inner);
                drop(inner);
                for cb in cbs {
                    cb(Ok(()));
                }
                Ok(Pass::Retry)
            }
            Ok(false) => {
                // Journal full. Reclaim directly; the slow path must not
                // rely on the periodic tick for forward progress.
                drop(inner);
                trace!(target: "tfs::journal", "journal_full");
                self.reclaim_tick();

                let mut inner = self.inner.lock();
                if let Some(res) = self.res_get_fast(words_min, words_max) {
                    return Ok(Pass::Done(res));
                }
                if self.state.load().is_open() {
                    return Ok(Pass::Retry);
                }
                match self.open_entry(&mut inner) {
                    Ok(true) => {
                        let cbs = Self::take_deferred(&mut inner);
                        drop(inner);
                        for cb in cbs {
                            cb(Ok(()));
                        }
                        Ok(Pass::Retry)
                    }
                    Ok(false) => {
                        if inner.blocked_since.is_none() {
                            inner.blocked_since = Some(Instant::now());
                        }
                        Ok(Pass::Blocked(inner))
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Write `words` into the reserved range, advancing the cursor.
    pub fn res_write(&self, res: &mut Reservation, words: &[u64]) -> Result<()> {
        let len = u32::try_from(words.len()).map_err(|_| TfsError::NoSpace)?;
        if res.written + len > res.u64s {
            return Err(TfsError::NoSpace);
        }
        self.bufs[res.idx].store_words((res.offset + res.written) as usize, words);
        res.written += len;
        Ok(())
    }

    /// Frame and write one payload record into the reserved range.
    pub fn res_add_entry(&self, res: &mut Reservation, entry: &JsetEntry) -> Result<()> {
        let need = u32::try_from(entry.u64s()).map_err(|_| TfsError::NoSpace)?;
        if res.written + need > res.u64s {
            return Err(TfsError::NoSpace);
        }
        let base = (res.offset + res.written) as usize;
        self.bufs[res.idx].store_word(base, entry.header_word()?);
        self.bufs[res.idx].store_words(base + 1, &entry.payload);
        res.written += need;
        Ok(())
    }

    /// Record `inode` in the entry's Bloom filter. The held reservation
    /// keeps the buffer from being reopened under us, so the unlocked
    /// filter write is safe.
    pub fn res_mark_inode(&self, res: &Reservation, inode: InodeNumber) {
        self.bufs[res.idx].bloom_set(inode_hash(inode));
    }

    /// Release a reservation. Unwritten granted words are padded with
    /// empty records; the last holder of a sealed buffer submits its
    /// write.
    pub fn res_put(&self, mut res: Reservation) {
        while res.written < res.u64s {
            let pad = jset::pack_entry_header(0, 0, JsetEntryType::BtreeKeys as u8, 0);
            self.bufs[res.idx].store_word((res.offset + res.written) as usize, pad);
            res.written += 1;
        }
        self.buf_put(res.idx, false);
    }

    fn buf_put(&self, idx: usize, need_write_just_set: bool) {
        let new = loop {
            let old = self.state.load();
            let mut new = old;
            new.dec_count(idx);
            if self.state.compare_exchange(old, new).is_ok() {
                break new;
            }
        };
        if new.count[idx] == 0 && idx != new.idx && new.prev_buf_unwritten {
            // Last holder of the sealed buffer: the write is ours.
            self.journal_write(idx, need_write_just_set);
        }
    }

    // -- buffer switch state machine ----------------------------------------

    /// The single `Open -> Closed` edge: atomically close the current
    /// entry, flip to the other buffer and mark the outgoing write in
    /// flight. On success the core mutex is released inside this call
    /// (`Unlocked`) and the outgoing buffer's synthetic "open" reference
    /// is dropped, which may submit the write.
    fn buf_switch<'a>(
        &'a self,
        guard: MutexGuard<'a, JournalInner>,
        need_write_just_set: bool,
    ) -> SwitchOutcome<'a> {
        let mut inner = guard;

        let old = loop {
            let old = self.state.load();
            if old.offset == OFFSET_CLOSED {
                return SwitchOutcome::Closed(inner);
            }
            if old.offset == OFFSET_ERROR {
                return SwitchOutcome::Error(inner);
            }
            if old.prev_buf_unwritten {
                return SwitchOutcome::Inuse(inner);
            }

            let mut new = old;
            // The switcher holds one reference itself so the sealed
            // length below is published before any res_put can submit.
            new.inc_count(old.idx);
            new.offset = OFFSET_CLOSED;
            new.idx ^= 1;
            new.prev_buf_unwritten = true;
            debug_assert_eq!(new.count[new.idx], 0);

            if self.state.compare_exchange(old, new).is_ok() {
                break old;
            }
        };

        self.need_write.store(false, Ordering::Release);

        let out_idx = old.idx;
        let buf = &self.bufs[out_idx];
        buf.u64s.store(old.offset, Ordering::Release);

        let sealed_bytes =
            JSET_HEADER_BYTES as u64 + (u64::from(old.offset) + entry_suffix_u64s()) * 8;
        inner.prev_buf_sectors = sectors_for_bytes(sealed_bytes);
        debug_assert!(inner.prev_buf_sectors <= inner.cur_buf_sectors);

        self.reclaim_fast(&mut inner);
        buf.sealed_last_seq
            .store(inner.pin.last_seq().0, Ordering::Release);

        // New sequence; its pin starts with one reference held by the
        // open/writing state.
        Self::pin_new_entry(&mut inner);
        self.bufs[out_idx ^ 1].reset_for_open(inner.seq);

        inner.write_deadline = None;
        inner.switch_count += 1;
        let hook = if inner.switch_count > 1 << 14 {
            inner.switch_count = 0;
            inner.bucket_seq_hook.clone()
        } else {
            None
        };

        debug!(
            target: "tfs::journal",
            sealed_seq = inner.seq - 1,
            new_seq = inner.seq,
            u64s = old.offset,
            "journal_buf_switch"
        );

        drop(inner);

        if let Some(hook) = hook {
            hook.bucket_seq_cleanup();
        }

        self.buf_put(out_idx, need_write_just_set);
        SwitchOutcome::Unlocked
    }

    fn pin_new_entry(inner: &mut JournalInner) {
        inner.seq += 1;
        inner.pin.push(JournalSeq(inner.seq), 1);
    }

    fn pin_new_empty_entry(inner: &mut JournalInner) {
        inner.seq += 1;
        inner.pin.push(JournalSeq(inner.seq), 0);
    }

    // -- opening a new entry ------------------------------------------------

    /// Open the current (closed) buffer for reservations. Runs under the
    /// core mutex. `Ok(false)` means the journal is full: the pin FIFO
    /// has no room or the device rings cannot offer sectors.
    fn open_entry(&self, inner: &mut JournalInner) -> Result<bool> {
        let s = self.state.load();
        debug_assert!(!s.is_open());
        if s.is_error() {
            return Err(TfsError::JournalIo);
        }
        if inner.pin.is_full() {
            return Ok(false);
        }

        let sectors = self.entry_sectors(inner)?;
        if sectors == 0 {
            return Ok(false);
        }

        let idx = s.idx;
        let buf = &self.bufs[idx];

        if inner.buf_size_want > buf.size() {
            let want = inner.buf_size_want.min(self.config.entry_size_max);
            buf.grow(want)?;
            inner.buf_size_want = 0;
        }

        buf.disk_sectors.store(sectors, Ordering::Relaxed);
        let usable = sectors.min((buf.size() as u64) >> 9);
        inner.cur_buf_sectors = usable;

        // Usable payload words: total minus the header, minus the suffix
        // kept back for the per-btree root records added at write time.
        let u64s = (usable * SECTOR_U64S)
            .saturating_sub(jset::JSET_HEADER_U64S)
            .saturating_sub(entry_suffix_u64s());
        #[allow(clippy::cast_possible_truncation)]
        let u64s = u64s.min(u64::from(OFFSET_CLOSED - 1)) as u32;

        let seeded = buf.u64s.load(Ordering::Acquire);
        if u64s <= seeded {
            return Ok(false);
        }

        // Must be visible before the open state is published.
        self.cur_entry_u64s.store(u64s, Ordering::Release);

        loop {
            let old = self.state.load();
            if old.offset == OFFSET_ERROR {
                return Err(TfsError::JournalIo);
            }
            debug_assert_eq!(old.offset, OFFSET_CLOSED);
            let mut new = old;
            new.offset = seeded;
            if self.state.compare_exchange(old, new).is_ok() {
                break;
            }
        }

        if let Some(since) = inner.blocked_since.take() {
            #[allow(clippy::cast_possible_truncation)]
            let blocked_ms = since.elapsed().as_millis() as u64;
            debug!(target: "tfs::journal", blocked_ms, "journal_res_unblocked");
        }

        inner.write_deadline = Some(Instant::now() + self.config.write_delay);
        inner.deferred.append(&mut inner.async_wait);

        debug!(
            target: "tfs::journal",
            seq = inner.seq,
            u64s,
            sectors = usable,
            "journal_entry_open"
        );

        self.timer.notify_all();
        self.wait.notify_all();
        Ok(true)
    }

    /// Sectors the device rings can offer the next entry: the minimum
    /// across active devices, since the entry is replicated to each. A
    /// sealed previous entry that has not claimed its ring space yet
    /// still holds its sector budget, so that is subtracted off.
    fn entry_sectors(&self, inner: &JournalInner) -> Result<u64> {
        let last_seq_ondisk = JournalSeq(inner.last_seq_ondisk);
        let pending = if self.state.load().prev_buf_unwritten && inner.writing_devs.is_empty() {
            inner.prev_buf_sectors
        } else {
            0
        };

        let mut sectors = u64::MAX;
        let mut any = false;
        for ring in inner.devs.iter().filter(|r| r.active && r.nr() > 0) {
            any = true;
            let avail = ring.sectors_available(last_seq_ondisk);
            sectors = sectors.min(avail.saturating_sub(pending));
        }
        if !any {
            return Err(TfsError::ReadOnly);
        }
        Ok(sectors.min((self.config.entry_size_max as u64) >> 9))
    }

    fn take_deferred(inner: &mut JournalInner) -> Vec<FlushCallback> {
        std::mem::take(&mut inner.deferred)
    }

    // -- write submission and completion ------------------------------------

    fn journal_write(&self, idx: usize, need_write_just_set: bool) {
        let buf = &self.bufs[idx];
        let seq = JournalSeq(buf.seq.load(Ordering::Acquire));

        if self.state.load().is_error() {
            // Halted after sealing: drop the write on the floor; halt()
            // already woke every waiter with the error.
            trace!(target: "tfs::journal", seq = seq.0, "journal_write_skipped_error");
            return;
        }

        if !need_write_just_set {
            let since = self.inner.lock().need_write_since.take();
            if let Some(since) = since {
                #[allow(clippy::cast_possible_truncation)]
                let delay_ms = since.elapsed().as_millis() as u64;
                debug!(target: "tfs::journal", seq = seq.0, delay_ms, "journal_write_delay");
            }
        }

        // Gather the btree roots without the core mutex; the sealed
        // buffer is quiescent, so the arena appends below are exclusive.
        let roots_source = self.inner.lock().roots_source.clone();
        let roots = roots_source.map(|src| src.roots()).unwrap_or_default();

        let mut u64s = buf.u64s.load(Ordering::Acquire);
        let budget = entry_suffix_u64s();
        let mut suffix_used = 0_u64;
        for entry in &roots {
            let need = entry.u64s();
            if suffix_used + need > budget {
                warn!(target: "tfs::journal", seq = seq.0, "journal_root_suffix_overflow");
                break;
            }
            match entry.header_word() {
                Ok(word) => {
                    buf.store_word(u64s as usize, word);
                    buf.store_words(u64s as usize + 1, &entry.payload);
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        u64s += need as u32;
                    }
                    suffix_used += need;
                }
                Err(err) => {
                    warn!(target: "tfs::journal", seq = seq.0, error = %err, "journal_root_entry_invalid");
                }
            }
        }

        let header = JsetHeader {
            seq,
            last_seq: JournalSeq(buf.sealed_last_seq.load(Ordering::Acquire)),
            u64s_used: u64s,
            flags: 0,
        };
        let bytes = encode_entry(&header, &buf.snapshot_words(u64s as usize));
        let sectors = sectors_for_bytes(bytes.len() as u64);

        // Claim on-disk space on every active device.
        let mut inner = self.inner.lock();
        debug_assert!(sectors <= inner.prev_buf_sectors);
        let last_seq_ondisk = JournalSeq(inner.last_seq_ondisk);
        let mut targets = Vec::new();
        let mut ring_full = false;
        for ring in inner.devs.iter_mut().filter(|r| r.active && r.nr() > 0) {
            match ring.take_sectors(seq, sectors, last_seq_ondisk) {
                Some((bucket, sector_offset)) => {
                    targets.push((ring.dev, bucket, sector_offset));
                }
                None => {
                    ring_full = true;
                    break;
                }
            }
        }
        if targets.is_empty() || ring_full {
            drop(inner);
            error!(target: "tfs::journal", seq = seq.0, "journal_write_no_replica_target");
            self.halt();
            return;
        }
        inner.writing_devs = targets.iter().map(|t| t.0).collect();
        drop(inner);

        info!(
            target: "tfs::journal",
            seq = seq.0,
            sectors,
            replicas = targets.len(),
            "journal_write_submit"
        );

        // Parallel submission; durable only once every replica acked.
        let mut write_failed = false;
        std::thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|(dev, bucket, sector_offset)| {
                    let io = &self.io;
                    let bytes = &bytes;
                    scope.spawn(move || io.write_bucket(*dev, *bucket, *sector_offset, bytes))
                })
                .collect();
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        error!(target: "tfs::journal", seq = seq.0, error = %err, "journal_write_failed");
                        write_failed = true;
                    }
                    Err(_) => {
                        error!(target: "tfs::journal", seq = seq.0, "journal_write_panicked");
                        write_failed = true;
                    }
                }
            }
        });

        if write_failed {
            self.inner.lock().writing_devs.clear();
            self.halt();
            return;
        }

        self.write_done(idx, seq, header.last_seq);
    }

    fn write_done(&self, idx: usize, seq: JournalSeq, last_seq: JournalSeq) {
        let mut inner = self.inner.lock();
        inner.last_seq_ondisk = inner.last_seq_ondisk.max(last_seq.0);

        loop {
            let old = self.state.load();
            let mut new = old;
            new.prev_buf_unwritten = false;
            if self.state.compare_exchange(old, new).is_ok() {
                break;
            }
        }

        // Drop the open/writing reference on this sequence's pin.
        if let Some(list) = inner.pin.get_mut(seq) {
            debug_assert!(list.count > 0);
            list.count = list.count.saturating_sub(1);
        }
        self.reclaim_fast(&mut inner);

        inner.writing_devs.clear();

        // A flush came in while this write was in flight: push the next
        // one out immediately.
        if self.need_write.load(Ordering::Acquire) {
            inner.write_deadline = Some(Instant::now());
        }

        let waiters = self.bufs[idx].take_waiters();
        self.wait.notify_all();
        self.timer.notify_all();
        drop(inner);

        info!(target: "tfs::journal", seq = seq.0, last_seq = last_seq.0, "journal_write_done");
        for cb in waiters {
            cb(Ok(()));
        }
    }

    // -- halt ---------------------------------------------------------------

    /// Latch the error state: no reservation will ever succeed again and
    /// every waiter observes `JournalIo`. Irreversible until re-mount.
    pub fn halt(&self) {
        loop {
            let old = self.state.load();
            if old.is_error() {
                return;
            }
            let mut new = old;
            new.offset = OFFSET_ERROR;
            if self.state.compare_exchange(old, new).is_ok() {
                break;
            }
        }

        warn!(target: "tfs::journal", "journal_halt");

        let mut inner = self.inner.lock();
        let mut cbs = std::mem::take(&mut inner.async_wait);
        cbs.append(&mut inner.deferred);
        for buf in &self.bufs {
            cbs.append(&mut buf.take_waiters());
        }
        self.wait.notify_all();
        self.timer.notify_all();
        drop(inner);

        for cb in cbs {
            cb(Err(TfsError::JournalIo));
        }
    }

    // -- pins and reclaim ---------------------------------------------------

    /// Take a reference on `seq`'s pin list, keeping the sequence from
    /// being reclaimed until [`pin_put`](Self::pin_put).
    pub fn pin_add(&self, seq: JournalSeq) -> Option<JournalPin> {
        let mut inner = self.inner.lock();
        let list = inner.pin.get_mut(seq)?;
        list.count += 1;
        Some(JournalPin { seq })
    }

    pub fn pin_put(&self, pin: JournalPin) {
        let mut inner = self.inner.lock();
        if let Some(list) = inner.pin.get_mut(pin.seq) {
            debug_assert!(list.count > 0);
            list.count = list.count.saturating_sub(1);
            if list.count == 0 {
                self.reclaim_fast(&mut inner);
                self.timer.notify_all();
            }
        }
    }

    /// Register a flusher to run before `seq` is reclaimed. Returns
    /// false if the sequence is no longer live.
    pub fn register_flusher(&self, seq: JournalSeq, label: &'static str, flush: PinFlushFn) -> bool {
        let mut inner = self.inner.lock();
        match inner.pin.get_mut(seq) {
            Some(list) => {
                list.pending.push_back(PinEntry { label, flush });
                true
            }
            None => false,
        }
    }

    /// Pop released sequences off the FIFO front. The newest list always
    /// stays so `last_seq <= cur_seq` holds.
    fn reclaim_fast(&self, inner: &mut JournalInner) {
        let mut advanced = false;
        while inner.pin.used() > 1 {
            let front = inner.pin.front().expect("fifo checked non-empty");
            if front.count != 0 || !front.pending.is_empty() {
                break;
            }
            inner.pin.pop_front();
            advanced = true;
        }
        if advanced {
            trace!(
                target: "tfs::journal::reclaim",
                last_seq = inner.pin.last_seq().0,
                "journal_reclaim_advance"
            );
            self.wait.notify_all();
        }
    }

    /// Drain the oldest pinned sequences: run registered flushers for
    /// zero-refcount sequences, advance `last_seq`, wake reservation
    /// waiters. Runs from the periodic worker and inline from the
    /// reservation slow path.
    pub fn reclaim_tick(&self) {
        let _tick = self.reclaim_lock.lock();
        loop {
            let mut inner = self.inner.lock();
            self.reclaim_fast(&mut inner);

            let seq = inner.pin.last_seq();
            let entry = match inner.pin.front_mut() {
                Some(front) if front.count == 0 && !front.pending.is_empty() => {
                    front.pending.pop_front()
                }
                _ => None,
            };
            let Some(mut entry) = entry else {
                return;
            };
            drop(inner);

            // Flushers run without the core mutex; they may call back
            // into the journal (pin_put and friends).
            let outcome = (entry.flush)(seq);

            let mut inner = self.inner.lock();
            match outcome {
                FlushOutcome::Flushed => {
                    trace!(
                        target: "tfs::journal::reclaim",
                        seq = seq.0,
                        flusher = entry.label,
                        "journal_pin_flushed"
                    );
                    if let Some(list) = inner.pin.get_mut(seq) {
                        list.flushed.push(entry.label);
                    }
                }
                FlushOutcome::Blocked => {
                    // Back-pressure: put it back and yield; producers
                    // stay blocked until the flusher can make progress.
                    debug!(
                        target: "tfs::journal::reclaim",
                        seq = seq.0,
                        flusher = entry.label,
                        "journal_reclaim_blocked"
                    );
                    if let Some(list) = inner.pin.get_mut(seq) {
                        list.pending.push_front(entry);
                    }
                    return;
                }
            }
        }
    }

    // -- inode -> seq map ---------------------------------------------------

    /// The most recent unflushed sequence that may have touched `inode`,
    /// or [`JournalSeq::NONE`]. False positives force a spurious flush;
    /// false negatives cannot happen.
    #[must_use]
    pub fn inode_journal_seq(&self, inode: InodeNumber) -> JournalSeq {
        let bit = inode_hash(inode);
        if !self.bufs[0].bloom_test(bit) && !self.bufs[1].bloom_test(bit) {
            return JournalSeq::NONE;
        }

        let inner = self.inner.lock();
        let s = self.state.load();
        if self.bufs[s.idx].bloom_test(bit) {
            JournalSeq(inner.seq)
        } else if self.bufs[s.idx ^ 1].bloom_test(bit) {
            JournalSeq(inner.seq.saturating_sub(1))
        } else {
            JournalSeq::NONE
        }
    }

    // -- synchronous flush primitives ---------------------------------------

    /// Block until `seq` is durable on every replica.
    pub fn flush_seq(&self, seq: JournalSeq) -> Result<()> {
        loop {
            let mut inner = self.inner.lock();
            debug_assert!(seq.0 <= inner.seq);
            if self.state.load().is_error() {
                return Err(TfsError::JournalIo);
            }

            if seq.0 < inner.seq {
                let in_flight =
                    seq.0 + 1 == inner.seq && self.state.load().prev_buf_unwritten;
                if !in_flight {
                    return Ok(());
                }
                // fall through to wait
            } else {
                let s = self.state.load();
                if s.is_open() {
                    let just_set = !self.need_write.swap(true, Ordering::AcqRel);
                    if just_set {
                        inner.need_write_since = Some(Instant::now());
                    }
                    match self.buf_switch(inner, just_set) {
                        SwitchOutcome::Error(_inner) => return Err(TfsError::JournalIo),
                        SwitchOutcome::Unlocked => continue,
                        SwitchOutcome::Closed(_inner) => continue,
                        SwitchOutcome::Inuse(guard) => {
                            inner = guard;
                            // wait for the previous write to finish
                        }
                    }
                } else {
                    // Current entry exists but was never opened; nothing
                    // is staged for it yet. Open it so the delayed write
                    // can push it out, then re-evaluate.
                    let opened = self.open_entry(&mut inner)?;
                    let cbs = Self::take_deferred(&mut inner);
                    drop(inner);
                    for cb in cbs {
                        cb(Ok(()));
                    }
                    if opened {
                        continue;
                    }
                    let mut inner = self.inner.lock();
                    if inner.stopping {
                        return Err(TfsError::Interrupted);
                    }
                    self.wait.wait(&mut inner);
                    continue;
                }
            }

            if inner.stopping {
                return Err(TfsError::Interrupted);
            }
            self.wait.wait(&mut inner);
            if inner.stopping {
                return Err(TfsError::Interrupted);
            }
        }
    }

    /// Register `cont` to run once `seq` is durable, forcing a write if
    /// `seq` is the open entry.
    pub fn flush_seq_async(&self, seq: JournalSeq, cont: FlushCallback) {
        let mut inner = self.inner.lock();
        debug_assert!(seq.0 <= inner.seq);
        if self.state.load().is_error() {
            drop(inner);
            cont(Err(TfsError::JournalIo));
            return;
        }

        let s = self.state.load();
        if seq.0 == inner.seq {
            self.bufs[s.idx].push_waiter(cont);
            if s.is_open() {
                let just_set = !self.need_write.swap(true, Ordering::AcqRel);
                if just_set {
                    inner.need_write_since = Some(Instant::now());
                }
                match self.buf_switch(inner, just_set) {
                    SwitchOutcome::Error(_inner) => {
                        // halt() drains the waiter we just registered.
                    }
                    SwitchOutcome::Unlocked
                    | SwitchOutcome::Inuse(_)
                    | SwitchOutcome::Closed(_) => {}
                }
            }
        } else if seq.0 + 1 == inner.seq && s.prev_buf_unwritten {
            // Completion drains the list under the same lock, so the
            // registration cannot race with it.
            self.bufs[s.idx ^ 1].push_waiter(cont);
        } else {
            drop(inner);
            cont(Ok(()));
        }
    }

    /// Register `cont` for `seq`'s write completion without forcing a
    /// write; the fill level or the delayed-write timer triggers it.
    pub fn wait_on_seq_async(&self, seq: JournalSeq, cont: FlushCallback) {
        let inner = self.inner.lock();
        debug_assert!(seq.0 <= inner.seq);
        if self.state.load().is_error() {
            drop(inner);
            cont(Err(TfsError::JournalIo));
            return;
        }

        let s = self.state.load();
        if seq.0 == inner.seq {
            self.bufs[s.idx].push_waiter(cont);
        } else if seq.0 + 1 == inner.seq && s.prev_buf_unwritten {
            self.bufs[s.idx ^ 1].push_waiter(cont);
        } else {
            drop(inner);
            cont(Ok(()));
        }
    }

    /// Flush the open entry (or the last closed one when nothing is
    /// open) and wait for it.
    pub fn flush(&self) -> Result<()> {
        let Some(seq) = self.flush_target() else {
            return Ok(());
        };
        self.flush_seq(seq)
    }

    pub fn flush_async(&self, cont: FlushCallback) {
        let Some(seq) = self.flush_target() else {
            cont(Ok(()));
            return;
        };
        self.flush_seq_async(seq, cont);
    }

    fn flush_target(&self) -> Option<JournalSeq> {
        let inner = self.inner.lock();
        if self.state.load().is_open() {
            Some(JournalSeq(inner.seq))
        } else if inner.seq > 0 {
            Some(JournalSeq(inner.seq - 1))
        } else {
            None
        }
    }

    /// Produce a durable barrier with no real mutation: reserve one
    /// record's worth of space just to create a sequence, then flush it.
    pub fn meta(&self) -> Result<()> {
        let res = self.res_get(8, 8)?;
        let seq = res.seq();
        self.res_put(res);
        self.flush_seq(seq)
    }

    pub fn meta_async(&self, cont: FlushCallback) -> Result<()> {
        let res = self.res_get(8, 8)?;
        let seq = res.seq();
        self.res_put(res);
        self.flush_seq_async(seq, cont);
        Ok(())
    }

    /// Used by interior B-tree updates, which record roots in every
    /// entry and so only need *an* entry, not a reservation. `Ok(true)`:
    /// `seq` already exists or is open (`cont` ran). `Ok(false)`: the
    /// journal is full; `cont` queued for the next open.
    pub fn open_seq_async(&self, seq: JournalSeq, cont: FlushCallback) -> Result<bool> {
        let mut inner = self.inner.lock();
        debug_assert!(seq.0 <= inner.seq);
        if seq.0 < inner.seq || self.state.load().is_open() {
            drop(inner);
            cont(Ok(()));
            return Ok(true);
        }

        match self.open_entry(&mut inner) {
            Ok(true) => {
                let cbs = Self::take_deferred(&mut inner);
                drop(inner);
                cont(Ok(()));
                for cb in cbs {
                    cb(Ok(()));
                }
                Ok(true)
            }
            Ok(false) => {
                inner.async_wait.push(cont);
                drop(inner);
                self.reclaim_tick();
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    // -- delayed work -------------------------------------------------------

    /// Close and submit the open entry if there is one. Returns true
    /// when there is nothing to flush and no write is in flight.
    fn flush_write(&self) -> bool {
        let mut inner = self.inner.lock();
        let mut ret = !self.state.load().prev_buf_unwritten;

        if !self.state.load().is_open() {
            return ret;
        }

        let just_set = !self.need_write.swap(true, Ordering::AcqRel);
        if just_set {
            inner.need_write_since = Some(Instant::now());
        }
        if let SwitchOutcome::Unlocked = self.buf_switch(inner, just_set) {
            ret = false;
        }
        ret
    }

    fn write_worker(&self) {
        loop {
            let mut inner = self.inner.lock();
            if inner.stopping {
                return;
            }
            match inner.write_deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        inner.write_deadline = None;
                        drop(inner);
                        self.flush_write();
                    } else {
                        let _ = self.timer.wait_for(&mut inner, deadline - now);
                    }
                }
                None => {
                    self.timer.wait(&mut inner);
                }
            }
        }
    }

    fn reclaim_worker(&self) {
        loop {
            let mut inner = self.inner.lock();
            if inner.stopping {
                return;
            }
            let _ = self.timer.wait_for(&mut inner, self.config.reclaim_delay);
            if inner.stopping {
                return;
            }
            drop(inner);
            self.reclaim_tick();
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Register a device's journal bucket ring, built from its
    /// superblock journal section.
    pub fn dev_journal_init(
        &self,
        dev: DeviceIndex,
        section: &SbJournalSection,
        bucket_sectors: u64,
    ) -> Result<()> {
        let ring = DeviceRing::from_superblock(dev, section, bucket_sectors)?;
        let mut inner = self.inner.lock();
        if inner.devs.iter().any(|r| r.dev == dev) {
            return Err(TfsError::Parse(ParseError::InvalidField {
                field: "device",
                reason: "journal device already registered",
            }));
        }
        info!(
            target: "tfs::journal::dev",
            dev = dev.0,
            buckets = ring.nr(),
            bucket_sectors,
            "journal_dev_init"
        );
        inner.devs.push(ring);
        Ok(())
    }

    pub fn dev_journal_exit(&self, dev: DeviceIndex) {
        self.inner.lock().devs.retain(|r| r.dev != dev);
    }

    /// Number of journal buckets currently in `dev`'s ring.
    #[must_use]
    pub fn dev_journal_nr(&self, dev: DeviceIndex) -> Option<usize> {
        self.inner
            .lock()
            .devs
            .iter()
            .find(|r| r.dev == dev)
            .map(DeviceRing::nr)
    }

    /// Stop writing to `dev` and wait until no in-flight write targets
    /// it.
    pub fn dev_journal_stop(&self, dev: DeviceIndex) {
        let mut inner = self.inner.lock();
        if let Some(ring) = inner.devs.iter_mut().find(|r| r.dev == dev) {
            ring.active = false;
        }
        while inner.writing_devs.contains(&dev) {
            if inner.stopping {
                break;
            }
            self.wait.wait(&mut inner);
        }
        info!(target: "tfs::journal::dev", dev = dev.0, "journal_dev_stop");
    }

    /// Bring the journal online: skip past blacklisted sequence ranges,
    /// create the first real sequence, and start the delayed-write and
    /// reclaim workers.
    pub fn start(self: &Arc<Self>, blacklisted: &[(u64, u64)]) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            debug_assert!(!inner.started);
            inner.started = true;

            // Blacklisted sequences get empty, unpinned entries so they
            // are never reused; replay must not trust them.
            let skip_to = blacklisted.iter().map(|r| r.1).max().unwrap_or(0);
            while inner.seq < skip_to {
                Self::pin_new_empty_entry(&mut inner);
            }

            // The switch only initializes the next entry when it closes
            // one; the very first entry is initialized here.
            Self::pin_new_entry(&mut inner);
            let idx = self.state.load().idx;
            self.bufs[idx].reset_for_open(inner.seq);

            // Record the blacklisted ranges with the first entry we
            // write, so replay after the next crash still sees them.
            for (start, end) in blacklisted {
                let entry =
                    JsetEntry::new(JsetEntryType::Blacklist, 0, 0, vec![*start, *end]);
                if let Err(err) = self.bufs[idx].seed_entry(&entry) {
                    warn!(target: "tfs::journal", error = %err, "journal_blacklist_seed_failed");
                }
            }

            info!(
                target: "tfs::journal",
                seq = inner.seq,
                blacklisted = blacklisted.len(),
                "journal_start"
            );
        }

        let mut workers = self.workers.lock();
        let write = Arc::clone(self);
        workers.push(
            std::thread::Builder::new()
                .name("tfs-journal-write".to_owned())
                .spawn(move || write.write_worker())?,
        );
        let reclaim = Arc::clone(self);
        workers.push(
            std::thread::Builder::new()
                .name("tfs-journal-reclaim".to_owned())
                .spawn(move || reclaim.reclaim_worker())?,
        );
        Ok(())
    }

    /// Flush whatever is outstanding, then stop the workers and wake all
    /// remaining waiters with `Interrupted`.
    pub fn stop(&self) {
        loop {
            if self.flush_write() || self.state.load().is_error() {
                break;
            }
            let mut inner = self.inner.lock();
            let _ = self
                .wait
                .wait_for(&mut inner, Duration::from_millis(50));
        }

        {
            let mut inner = self.inner.lock();
            inner.stopping = true;
        }
        self.wait.notify_all();
        self.timer.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
        info!(target: "tfs::journal", "journal_stop");
    }

    // -- device bucket allocation -------------------------------------------

    /// Grow `dev`'s journal to `target_nr` buckets. Shrink is
    /// unsupported and returns `Ok` without change. The superblock
    /// section is resized first; buckets are then allocated one by one
    /// and inserted at `last_idx`, each marked as journal metadata. On a
    /// mid-way failure, buckets no write has touched are released again.
    pub fn set_nr_journal_buckets(
        &self,
        dev: DeviceIndex,
        target_nr: usize,
        allocator: &dyn BucketAllocator,
        section: &mut SbJournalSection,
    ) -> Result<()> {
        let current_nr = {
            let mut inner = self.inner.lock();
            let ring = Self::ring_mut(&mut inner, dev)?;
            let nr = ring.nr();
            if target_nr > nr {
                // Reserve up front so the per-bucket inserts cannot fail
                // with the lock held.
                ring.buckets
                    .try_reserve_exact(target_nr - nr)
                    .map_err(|_| TfsError::Oom("journal bucket ring"))?;
                ring.bucket_seq
                    .try_reserve_exact(target_nr - nr)
                    .map_err(|_| TfsError::Oom("journal bucket seq ring"))?;
            }
            nr
        };
        if target_nr <= current_nr {
            return Ok(());
        }

        section.resize(target_nr)?;

        let mut added = Vec::new();
        let result = loop {
            {
                let inner = self.inner.lock();
                let nr = inner
                    .devs
                    .iter()
                    .find(|r| r.dev == dev)
                    .map_or(0, DeviceRing::nr);
                if nr >= target_nr {
                    break Ok(());
                }
            }

            let bucket = match allocator.alloc_bucket(dev) {
                Ok(bucket) => bucket,
                Err(err) => break Err(err),
            };

            {
                let mut inner = self.inner.lock();
                let ring = Self::ring_mut(&mut inner, dev)?;
                ring.insert_bucket(bucket);
            }
            allocator.mark_journal_bucket(dev, bucket);
            added.push(bucket);
        };

        if result.is_err() {
            // Back out what no write has used yet.
            let mut release = Vec::new();
            {
                let mut inner = self.inner.lock();
                if let Ok(ring) = Self::ring_mut(&mut inner, dev) {
                    for bucket in added {
                        if ring.remove_unused_bucket(bucket) {
                            release.push(bucket);
                        }
                    }
                }
            }
            for bucket in release {
                allocator.release_bucket(dev, bucket);
            }
        } else {
            info!(
                target: "tfs::journal::dev",
                dev = dev.0,
                nr = target_nr,
                "journal_buckets_grown"
            );
        }

        // Keep the superblock section an exact mirror of the ring.
        {
            let mut inner = self.inner.lock();
            let ring = Self::ring_mut(&mut inner, dev)?;
            section.buckets.clear();
            section.buckets.extend_from_slice(ring.buckets());
        }

        result
    }

    /// Size and allocate a fresh device's journal
    /// (`nr = clamp(nbuckets / 256, MIN, min(1024, 512 MiB))`).
    pub fn dev_journal_alloc(
        &self,
        dev: DeviceIndex,
        nbuckets: u64,
        bucket_sectors: u64,
        allocator: &dyn BucketAllocator,
        section: &mut SbJournalSection,
    ) -> Result<()> {
        let nr = dev::journal_buckets_for_device(nbuckets, bucket_sectors);
        self.set_nr_journal_buckets(dev, nr, allocator, section)
    }

    fn ring_mut<'a>(
        inner: &'a mut JournalInner,
        dev: DeviceIndex,
    ) -> Result<&'a mut DeviceRing> {
        inner
            .devs
            .iter_mut()
            .find(|r| r.dev == dev)
            .ok_or(TfsError::Parse(ParseError::InvalidField {
                field: "device",
                reason: "no journal ring registered for device",
            }))
    }

    // -- debug --------------------------------------------------------------

    /// Plain-text snapshot of the reservation state and device rings.
    #[must_use]
    pub fn debug_render(&self) -> String {
        let inner = self.inner.lock();
        let s = self.state.load();
        let mut out = String::new();

        let _ = writeln!(out, "active journal entries:\t{}", inner.pin.used());
        let _ = writeln!(out, "seq:\t\t\t{}", inner.seq);
        let _ = writeln!(out, "last_seq:\t\t{}", inner.pin.last_seq());
        let _ = writeln!(out, "last_seq_ondisk:\t{}", inner.last_seq_ondisk);
        let _ = writeln!(out, "reservation count:\t{}", s.count[s.idx]);
        let _ = writeln!(out, "reservation offset:\t{}", s.offset);
        let _ = writeln!(
            out,
            "current entry u64s:\t{}",
            self.cur_entry_u64s.load(Ordering::Acquire)
        );
        let _ = writeln!(out, "cur entry sectors:\t{}", inner.cur_buf_sectors);
        let _ = writeln!(out, "prev entry sectors:\t{}", inner.prev_buf_sectors);
        let _ = writeln!(out, "io in flight:\t\t{}", s.prev_buf_unwritten);
        let _ = writeln!(
            out,
            "need write:\t\t{}",
            self.need_write.load(Ordering::Acquire)
        );
        let _ = writeln!(out, "dirty:\t\t\t{}", s.is_open());
        let _ = writeln!(out, "started:\t\t{}", inner.started);

        for ring in &inner.devs {
            let _ = writeln!(out, "dev {}:", ring.dev);
            let _ = writeln!(out, "\tnr\t\t{}", ring.nr());
            if ring.nr() > 0 {
                let _ = writeln!(
                    out,
                    "\tcur_idx\t\t{} (seq {})",
                    ring.cur_idx(),
                    ring.bucket_seq[ring.cur_idx()]
                );
                let _ = writeln!(
                    out,
                    "\tlast_idx\t{} (seq {})",
                    ring.last_idx(),
                    ring.bucket_seq[ring.last_idx()]
                );
            }
        }
        out
    }

    /// Plain-text snapshot of the pin FIFO.
    #[must_use]
    pub fn pins_render(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();
        for (seq, list) in inner.pin.iter() {
            let _ = writeln!(out, "{}: count {}", seq, list.count);
            for entry in &list.pending {
                let _ = writeln!(out, "\t{}", entry.label);
            }
            if !list.flushed.is_empty() {
                let _ = writeln!(out, "flushed:");
                for label in &list.flushed {
                    let _ = writeln!(out, "\t{label}");
                }
            }
        }
        out
    }
}

/// A reference holding a sequence in the pin FIFO; while it exists the
/// sequence's journal space is not reclaimed.
#[derive(Debug)]
pub struct JournalPin {
    seq: JournalSeq,
}

impl JournalPin {
    #[must_use]
    pub fn seq(&self) -> JournalSeq {
        self.seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jset::Jset;
    use proptest::prelude::*;

    #[derive(Default)]
    struct MemJournalIo {
        writes: Mutex<Vec<(DeviceIndex, BucketNumber, u64, Vec<u8>)>>,
        fail: AtomicBool,
    }

    impl MemJournalIo {
        fn decoded(&self) -> Vec<Jset> {
            self.writes
                .lock()
                .iter()
                .map(|(_, _, _, bytes)| Jset::decode(bytes).expect("decode jset"))
                .collect()
        }
    }

    impl JournalIo for MemJournalIo {
        fn write_bucket(
            &self,
            dev: DeviceIndex,
            bucket: BucketNumber,
            sector_offset: u64,
            data: &[u8],
        ) -> Result<()> {
            if self.fail.load(Ordering::Acquire) {
                return Err(TfsError::JournalIo);
            }
            self.writes
                .lock()
                .push((dev, bucket, sector_offset, data.to_vec()));
            Ok(())
        }
    }

    fn small_config() -> JournalConfig {
        JournalConfig {
            entry_size_min: 4096,
            entry_size_max: 16 * 4096,
            pin_fifo_size: 16,
            write_delay: Duration::from_millis(1000),
            reclaim_delay: Duration::from_millis(10),
        }
    }

    fn started_journal(config: JournalConfig) -> (Arc<Journal>, Arc<MemJournalIo>) {
        let io = Arc::new(MemJournalIo::default());
        let io_dyn: Arc<dyn JournalIo> = io.clone();
        let journal = Arc::new(Journal::new(config, io_dyn).expect("journal init"));
        let section = SbJournalSection {
            buckets: (100..108).map(BucketNumber).collect(),
        };
        journal
            .dev_journal_init(DeviceIndex(0), &section, 64)
            .expect("dev init");
        journal.start(&[]).expect("start");
        (journal, io)
    }

    #[test]
    fn sequential_grants_are_disjoint() {
        let (journal, io) = started_journal(small_config());

        let a = journal.res_get(16, 16).expect("first reservation");
        let b = journal.res_get(16, 16).expect("second reservation");
        assert_eq!(a.seq(), JournalSeq(1));
        assert_eq!(b.seq(), JournalSeq(1));
        assert_eq!(a.offset_u64s(), 0);
        assert_eq!(b.offset_u64s(), 2);
        assert_eq!(a.u64s(), 2);

        let seq = a.seq();
        journal.res_put(a);
        journal.res_put(b);
        journal.flush_seq(seq).expect("flush");

        let entries = io.decoded();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].header.seq, JournalSeq(1));
        assert_eq!(entries[0].header.u64s_used, 4);

        journal.stop();
    }

    #[test]
    fn halt_latches_error_state() {
        let (journal, io) = started_journal(small_config());

        journal.halt();
        assert!(journal.is_error());
        assert!(matches!(journal.res_get(8, 8), Err(TfsError::JournalIo)));
        assert!(matches!(
            journal.flush_seq(journal.cur_seq()),
            Err(TfsError::JournalIo)
        ));
        assert!(io.decoded().is_empty());

        journal.stop();
    }

    #[test]
    fn meta_produces_strictly_increasing_durable_seqs() {
        let (journal, io) = started_journal(small_config());

        journal.meta().expect("first barrier");
        journal.meta().expect("second barrier");

        let seqs: Vec<u64> = io.decoded().iter().map(|j| j.header.seq.0).collect();
        assert_eq!(seqs, vec![1, 2]);

        journal.stop();
    }

    #[test]
    fn start_records_blacklisted_ranges() {
        let io = Arc::new(MemJournalIo::default());
        let io_dyn: Arc<dyn JournalIo> = io.clone();
        let journal = Arc::new(Journal::new(small_config(), io_dyn).expect("journal init"));
        let section = SbJournalSection {
            buckets: (100..108).map(BucketNumber).collect(),
        };
        journal
            .dev_journal_init(DeviceIndex(0), &section, 64)
            .expect("dev init");
        journal.start(&[(1, 3)]).expect("start");

        assert_eq!(journal.cur_seq(), JournalSeq(4));
        journal.meta().expect("barrier");

        let entries = io.decoded();
        assert_eq!(entries[0].header.seq, JournalSeq(4));
        assert_eq!(entries[0].header.last_seq, JournalSeq(4));
        let blacklist: Vec<_> = entries[0]
            .entries
            .iter()
            .filter(|e| e.entry_type == JsetEntryType::Blacklist)
            .collect();
        assert_eq!(blacklist.len(), 1);
        assert_eq!(blacklist[0].payload, vec![1, 3]);

        journal.stop();
    }

    #[test]
    fn config_validation_rejects_bad_shapes() {
        let io: Arc<dyn JournalIo> = Arc::new(MemJournalIo::default());

        let mut cfg = small_config();
        cfg.entry_size_min = 5000;
        assert!(Journal::new(cfg, Arc::clone(&io)).is_err());

        let mut cfg = small_config();
        cfg.entry_size_min = cfg.entry_size_max * 2;
        assert!(Journal::new(cfg, Arc::clone(&io)).is_err());

        let mut cfg = small_config();
        cfg.pin_fifo_size = 1;
        assert!(Journal::new(cfg, Arc::clone(&io)).is_err());
    }

    #[test]
    fn debug_renders_cover_state_and_pins() {
        let (journal, _io) = started_journal(small_config());

        let res = journal.res_get(8, 8).expect("reservation");
        let debug = journal.debug_render();
        assert!(debug.contains("seq:"));
        assert!(debug.contains("last_seq_ondisk:"));
        assert!(debug.contains("dev 0:"));

        let pins = journal.pins_render();
        assert!(pins.contains("1: count"));

        journal.res_put(res);
        journal.stop();
    }

    #[test]
    fn seq_invariants_hold_after_traffic() {
        let (journal, _io) = started_journal(small_config());

        for _ in 0..5 {
            journal.meta().expect("barrier");
        }
        let last_ondisk = journal.last_seq_ondisk();
        let last = journal.last_seq();
        let cur = journal.cur_seq();
        assert!(last_ondisk <= last, "{last_ondisk} > {last}");
        assert!(last <= cur, "{last} > {cur}");

        journal.stop();
    }

    #[test]
    fn dev_journal_alloc_sizes_from_device_geometry() {
        let io: Arc<dyn JournalIo> = Arc::new(MemJournalIo::default());
        let journal = Journal::new(JournalConfig::default(), io).expect("journal init");
        journal
            .dev_journal_init(DeviceIndex(0), &SbJournalSection::default(), 1024)
            .expect("dev init");

        let source = crate::dev::MkfsBucketSource::new(0, 1 << 20);
        let mut section = SbJournalSection::default();
        journal
            .dev_journal_alloc(DeviceIndex(0), 1 << 16, 1024, &source, &mut section)
            .expect("alloc");

        // 1/256 of the device's buckets.
        assert_eq!(journal.dev_journal_nr(DeviceIndex(0)), Some(256));
        assert_eq!(section.buckets.len(), 256);
    }

    #[test]
    fn last_unwritten_seq_matches_cur_when_idle() {
        let (journal, _io) = started_journal(small_config());
        journal.meta().expect("barrier");
        assert_eq!(journal.last_unwritten_seq(), journal.cur_seq());
        journal.stop();
    }

    #[test]
    fn wait_on_seq_async_self_completes_for_written_seqs() {
        let (journal, _io) = started_journal(small_config());
        journal.meta().expect("barrier");

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        journal.wait_on_seq_async(
            JournalSeq(1),
            Box::new(move |outcome| {
                assert!(outcome.is_ok());
                flag.store(true, Ordering::Release);
            }),
        );
        assert!(fired.load(Ordering::Acquire));

        journal.stop();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn grants_are_disjoint_and_sum_to_payload(sizes in prop::collection::vec(1_usize..8, 1..16)) {
            let (journal, io) = started_journal(small_config());

            let mut taken: Vec<(u32, u32)> = Vec::new();
            let mut reservations = Vec::new();
            for words in &sizes {
                let res = journal.res_get(words * 8, words * 8).expect("reservation");
                prop_assert_eq!(res.seq(), JournalSeq(1));
                for (offset, len) in &taken {
                    let disjoint = res.offset_u64s() + res.u64s() <= *offset
                        || offset + len <= res.offset_u64s();
                    prop_assert!(disjoint, "overlapping grants");
                }
                taken.push((res.offset_u64s(), res.u64s()));
                reservations.push(res);
            }

            let total: u32 = taken.iter().map(|(_, len)| *len).sum();
            for res in reservations {
                journal.res_put(res);
            }
            journal.flush_seq(JournalSeq(1)).expect("flush");

            let entries = io.decoded();
            prop_assert_eq!(entries[0].header.seq, JournalSeq(1));
            prop_assert_eq!(entries[0].header.u64s_used, total);

            journal.stop();
        }
    }
}
