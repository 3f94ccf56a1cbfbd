//! Shared-memory layout of the slot map
//!
//! `#[repr(C)]` structures that live in the mapped region. Every field is an
//! atomic (or never-written padding) so that references into the mapping are
//! sound while other processes mutate it concurrently.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::entry::{CacheKey, EntryBasics, EntryFlags};

/// Magic bytes at the start of the map region
pub(crate) const MAP_MAGIC: u64 = u64::from_le_bytes(*b"SLOTMAP1");

/// Map format version
pub(crate) const MAP_VERSION: u32 = 2;

/// Size of the fixed header at the start of the region
pub(crate) const MAP_HEADER_SIZE: usize = 64;

/// Size of one anchor
pub(crate) const ANCHOR_SIZE: usize = 80;

/// Lock word bit held by the exclusive writer; the low bits count readers
const WRITER: u32 = 1 << 31;

/// Anchor holds nothing
pub(crate) const STATE_EMPTY: u32 = 0;
/// Anchor is being filled by its writer
pub(crate) const STATE_WRITING: u32 = 1;
/// Anchor is indexed and readable
pub(crate) const STATE_READY: u32 = 2;

// =============================================================================
// Map header
// =============================================================================

/// Header at offset 0 of the mapping
#[repr(C)]
pub(crate) struct MapHeader {
    pub magic: AtomicU64,       // 0..8
    pub version: AtomicU32,     // 8..12
    pub capacity: AtomicU32,    // 12..16
    pub count: AtomicU32,       // 16..20
    pub victim: AtomicU32,      // 20..24
    pub probe_limit: AtomicU32, // 24..28
    _reserved: AtomicU32,       // 28..32
    pub sequence: AtomicU64,    // 32..40
    _pad: [u8; 24],             // 40..64
}

const _: () = assert!(std::mem::size_of::<MapHeader>() == MAP_HEADER_SIZE);

// =============================================================================
// Anchor
// =============================================================================

/// One slot's index entry and lock
///
/// Fields other than `lock`, `state` and `key` are written only by the
/// exclusive lock holder and read by lock holders, so relaxed ordering
/// suffices for them; the lock word publishes them.
#[repr(C)]
pub(crate) struct Anchor {
    lock: AtomicU32,                // 0..4
    state: AtomicU32,               // 4..8
    waiting_to_be_freed: AtomicU32, // 8..12
    _reserved: AtomicU32,           // 12..16
    key: [AtomicU64; 2],            // 16..32
    payload_size: AtomicU64,        // 32..40
    timestamp: AtomicU64,           // 40..48
    last_ref: AtomicU64,            // 48..56
    expires: AtomicU64,             // 56..64
    last_modified: AtomicU64,       // 64..72
    refcount_flags: AtomicU64,      // 72..80
}

const _: () = assert!(std::mem::size_of::<Anchor>() == ANCHOR_SIZE);

impl Anchor {
    // -------------------------------------------------------------------------
    // Lock word
    // -------------------------------------------------------------------------

    /// Take the exclusive lock; fails if anyone holds the anchor
    pub fn lock_exclusive(&self) -> bool {
        self.lock
            .compare_exchange(0, WRITER, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock_exclusive(&self) {
        self.lock.store(0, Ordering::Release);
    }

    /// Take a shared lock; fails while a writer holds the anchor
    pub fn lock_shared(&self) -> bool {
        let mut current = self.lock.load(Ordering::Acquire);
        loop {
            if current & WRITER != 0 {
                return false;
            }
            match self.lock.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a shared lock, returning the number of readers left
    pub fn unlock_shared(&self) -> u32 {
        self.lock.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn writing(&self) -> bool {
        self.lock.load(Ordering::Acquire) & WRITER != 0
    }

    pub fn readers(&self) -> u32 {
        self.lock.load(Ordering::Acquire) & !WRITER
    }

    pub fn reading(&self) -> bool {
        self.readers() > 0
    }

    // -------------------------------------------------------------------------
    // State and key
    // -------------------------------------------------------------------------

    pub fn state(&self) -> u32 {
        self.state.load(Ordering::SeqCst)
    }

    pub fn set_state(&self, state: u32) {
        self.state.store(state, Ordering::SeqCst);
    }

    pub fn empty(&self) -> bool {
        self.state() == STATE_EMPTY
    }

    pub fn same_key(&self, key: &CacheKey) -> bool {
        let [lo, hi] = key.words();
        self.key[0].load(Ordering::SeqCst) == lo && self.key[1].load(Ordering::SeqCst) == hi
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::from_words([
            self.key[0].load(Ordering::SeqCst),
            self.key[1].load(Ordering::SeqCst),
        ])
    }

    pub fn set_key(&self, key: &CacheKey) {
        let [lo, hi] = key.words();
        self.key[0].store(lo, Ordering::SeqCst);
        self.key[1].store(hi, Ordering::SeqCst);
    }

    pub fn waiting_to_be_freed(&self) -> bool {
        self.waiting_to_be_freed.load(Ordering::Acquire) != 0
    }

    pub fn mark_waiting_to_be_freed(&self) {
        self.waiting_to_be_freed.store(1, Ordering::Release);
    }

    // -------------------------------------------------------------------------
    // Basics
    // -------------------------------------------------------------------------

    pub fn basics(&self) -> EntryBasics {
        let packed = self.refcount_flags.load(Ordering::Relaxed);
        EntryBasics {
            payload_size: self.payload_size.load(Ordering::Relaxed),
            timestamp: self.timestamp.load(Ordering::Relaxed) as i64,
            last_ref: self.last_ref.load(Ordering::Relaxed) as i64,
            expires: self.expires.load(Ordering::Relaxed) as i64,
            last_modified: self.last_modified.load(Ordering::Relaxed) as i64,
            refcount: (packed >> 16) as u32,
            flags: EntryFlags((packed & 0xFFFF) as u16),
        }
    }

    pub fn set_basics(&self, basics: &EntryBasics) {
        self.payload_size.store(basics.payload_size, Ordering::Relaxed);
        self.timestamp.store(basics.timestamp as u64, Ordering::Relaxed);
        self.last_ref.store(basics.last_ref as u64, Ordering::Relaxed);
        self.expires.store(basics.expires as u64, Ordering::Relaxed);
        self.last_modified.store(basics.last_modified as u64, Ordering::Relaxed);
        let packed = ((basics.refcount as u64) << 16) | basics.flags.0 as u64;
        self.refcount_flags.store(packed, Ordering::Relaxed);
    }

    /// Forget the key and metadata; the caller holds the exclusive lock
    pub fn rewind(&self) {
        self.set_state(STATE_EMPTY);
        self.key[0].store(0, Ordering::SeqCst);
        self.key[1].store(0, Ordering::SeqCst);
        self.set_basics(&EntryBasics::default());
        self.waiting_to_be_freed.store(0, Ordering::Release);
    }
}
