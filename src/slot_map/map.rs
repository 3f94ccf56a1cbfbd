//! Slot map implementation
//!
//! A fixed-capacity key → slot directory living in a shared file mapping.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use memmap2::{MmapMut, MmapOptions};

use crate::entry::{CacheKey, EntryBasics, SlotId};
use crate::error::{Result, StoreError};

use super::anchor::{
    Anchor, MapHeader, ANCHOR_SIZE, MAP_HEADER_SIZE, MAP_MAGIC, MAP_VERSION, STATE_READY,
    STATE_WRITING,
};

/// Upper bound on anchors probed per lookup
pub const DEFAULT_PROBE_LIMIT: u32 = 64;

/// Upper bound on anchors examined by one [`SlotMap::purge_one`] call
const PURGE_SEARCH_LIMIT: u32 = 10_000;

/// Snapshot of one indexed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorView {
    pub slot: SlotId,
    pub key: CacheKey,
    pub basics: EntryBasics,
}

/// Lock-state census of the whole map
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapStats {
    pub count: u32,
    pub capacity: u32,
    pub readable: u32,
    pub writeable: u32,
    pub idle: u32,
    pub readers: u32,
    pub waiting_to_be_freed: u32,
}

/// Shared key → slot directory with per-slot read/write locks
///
/// ## Concurrency
/// Every cooperating process maps the same file. All coordination goes
/// through the per-anchor lock word; no operation blocks. Contention is
/// reported as [`StoreError::Busy`] and the caller decides whether to retry.
///
/// A key lives in one of the `probe_limit` anchors following its home
/// position (linear probing, wrapping). A writer claiming an empty anchor
/// publishes its key before re-checking the probe window for a competing
/// writer of the same key, so two writers of one key cannot both succeed.
pub struct SlotMap {
    path: PathBuf,
    // keeps the mapping alive; all access goes through `base`
    _mmap: MmapMut,
    base: NonNull<u8>,
    capacity: u32,
    probe_limit: u32,
}

impl SlotMap {
    /// Create (or reset) the shared map at `path` with room for `capacity` entries
    ///
    /// Only the owning process calls this; everybody else [`attach`](Self::attach)es.
    pub fn create(path: &Path, capacity: u32, probe_limit: u32) -> Result<Self> {
        if capacity == 0 {
            return Err(StoreError::ConfigFatal(format!(
                "slot map {} needs a positive capacity",
                path.display()
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(Self::region_size(capacity) as u64)?;

        // SAFETY: the file was sized above and stays open for the mapping's
        // lifetime; all concurrent access goes through atomics.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let base = Self::base_of(&mut mmap)?;

        let probe_limit = probe_limit.clamp(1, capacity);
        let map = Self {
            path: path.to_path_buf(),
            _mmap: mmap,
            base,
            capacity,
            probe_limit,
        };

        let header = map.header();
        header.version.store(MAP_VERSION, Ordering::Relaxed);
        header.capacity.store(capacity, Ordering::Relaxed);
        header.probe_limit.store(probe_limit, Ordering::Relaxed);
        header.count.store(0, Ordering::Relaxed);
        header.victim.store(0, Ordering::Relaxed);
        header.sequence.store(sequence_seed(), Ordering::Relaxed);
        header.magic.store(MAP_MAGIC, Ordering::Release);

        tracing::debug!(path = %path.display(), capacity, probe_limit, "created slot map");
        Ok(map)
    }

    /// Attach to a map created by another process (or another instance)
    pub fn attach(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len() as usize;
        if file_len < MAP_HEADER_SIZE {
            return Err(StoreError::Unavailable(format!(
                "slot map {} is not initialized",
                path.display()
            )));
        }

        // SAFETY: see `create`
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let base = Self::base_of(&mut mmap)?;

        // SAFETY: the region holds at least a header and is page aligned
        let header = unsafe { &*(base.as_ptr() as *const MapHeader) };
        if header.magic.load(Ordering::Acquire) != MAP_MAGIC {
            return Err(StoreError::Unavailable(format!(
                "slot map {} has no valid header",
                path.display()
            )));
        }
        let version = header.version.load(Ordering::Relaxed);
        if version != MAP_VERSION {
            return Err(StoreError::Unavailable(format!(
                "slot map {} has unsupported version {}",
                path.display(),
                version
            )));
        }

        let capacity = header.capacity.load(Ordering::Relaxed);
        let probe_limit = header.probe_limit.load(Ordering::Relaxed);
        if capacity == 0 || file_len < Self::region_size(capacity) {
            return Err(StoreError::Unavailable(format!(
                "slot map {} is truncated",
                path.display()
            )));
        }

        tracing::debug!(path = %path.display(), capacity, "attached slot map");
        Ok(Self {
            path: path.to_path_buf(),
            _mmap: mmap,
            base,
            capacity,
            probe_limit: probe_limit.clamp(1, capacity),
        })
    }

    /// Bytes needed for a map of `capacity` entries
    pub fn region_size(capacity: u32) -> usize {
        MAP_HEADER_SIZE + capacity as usize * ANCHOR_SIZE
    }

    // =========================================================================
    // Writing
    // =========================================================================

    /// Reserve a slot for `key` and lock it for writing
    ///
    /// Reuses the slot already holding `key` when nobody has it locked;
    /// otherwise claims an empty slot in the key's probe window.
    pub fn open_for_writing(&self, key: &CacheKey) -> Result<SlotId> {
        // An existing version of this key gets overwritten in place
        for slot in self.probe_window(key) {
            let anchor = self.anchor(slot);
            if anchor.empty() || !anchor.same_key(key) {
                continue;
            }
            if !anchor.lock_exclusive() {
                tracing::debug!(path = %self.path.display(), slot, "cannot open busy entry for writing");
                return Err(StoreError::Busy);
            }
            if !anchor.empty() && anchor.same_key(key) {
                anchor.set_basics(&EntryBasics::default());
                anchor.set_state(STATE_WRITING);
                tracing::debug!(path = %self.path.display(), slot, "reopened existing entry for writing");
                return Ok(slot);
            }
            // freed under our feet; keep looking
            anchor.unlock_exclusive();
        }

        for slot in self.probe_window(key) {
            let anchor = self.anchor(slot);
            if !anchor.empty() || !anchor.lock_exclusive() {
                continue;
            }
            if !anchor.empty() {
                anchor.unlock_exclusive();
                continue;
            }

            anchor.set_key(key);
            anchor.set_basics(&EntryBasics::default());
            anchor.set_state(STATE_WRITING);
            self.header().count.fetch_add(1, Ordering::AcqRel);

            if self.has_rival(key, slot) {
                self.free_locked(anchor);
                anchor.unlock_exclusive();
                tracing::debug!(path = %self.path.display(), slot, "lost race for key; backing off");
                return Err(StoreError::Busy);
            }

            tracing::debug!(path = %self.path.display(), slot, "opened entry for writing");
            return Ok(slot);
        }

        tracing::debug!(path = %self.path.display(), key = %key, "no free slot in probe window");
        Err(StoreError::Full)
    }

    /// Update the metadata of a slot locked for writing
    pub fn set_basics(&self, slot: SlotId, basics: &EntryBasics) -> Result<()> {
        let anchor = self.writing_anchor(slot)?;
        anchor.set_basics(basics);
        Ok(())
    }

    /// Release the write lock
    ///
    /// With `link_to_index` the entry becomes readable; otherwise the slot is
    /// freed (abandoned write).
    pub fn close_for_writing(&self, slot: SlotId, link_to_index: bool) -> Result<()> {
        let anchor = self.writing_anchor(slot)?;
        if link_to_index && !anchor.waiting_to_be_freed() {
            anchor.set_state(STATE_READY);
            anchor.unlock_exclusive();
            tracing::debug!(path = %self.path.display(), slot, "closed entry for writing");
        } else {
            self.free_locked(anchor);
            anchor.unlock_exclusive();
            tracing::debug!(path = %self.path.display(), slot, "aborted entry for writing");
        }
        Ok(())
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// Find `key` and lock its slot for reading
    pub fn open_for_reading(&self, key: &CacheKey) -> Result<(SlotId, AnchorView)> {
        let mut busy = false;
        for slot in self.probe_window(key) {
            let anchor = self.anchor(slot);
            if anchor.empty() || !anchor.same_key(key) {
                continue;
            }
            match self.open_for_reading_at(slot, key) {
                Ok(view) => return Ok((slot, view)),
                Err(StoreError::Busy) => busy = true,
                Err(_) => {}
            }
        }
        if busy {
            Err(StoreError::Busy)
        } else {
            Err(StoreError::NotFound)
        }
    }

    /// Lock a known slot for reading, verifying it still holds `key`
    pub fn open_for_reading_at(&self, slot: SlotId, key: &CacheKey) -> Result<AnchorView> {
        let anchor = self.checked_anchor(slot)?;
        if !anchor.lock_shared() {
            tracing::debug!(path = %self.path.display(), slot, "cannot open busy entry for reading");
            return Err(StoreError::Busy);
        }

        if anchor.state() != STATE_READY || !anchor.same_key(key) || anchor.waiting_to_be_freed() {
            self.release_shared(anchor);
            return Err(StoreError::NotFound);
        }

        tracing::debug!(path = %self.path.display(), slot, "opened entry for reading");
        Ok(self.view(slot, anchor))
    }

    /// Drop one read lock; the last reader frees a slot marked for freeing
    pub fn close_for_reading(&self, slot: SlotId) -> Result<()> {
        let anchor = self.checked_anchor(slot)?;
        if !anchor.reading() {
            return Err(StoreError::InvalidState(format!(
                "slot {} is not locked for reading",
                slot
            )));
        }
        self.release_shared(anchor);
        tracing::debug!(path = %self.path.display(), slot, "closed entry for reading");
        Ok(())
    }

    /// Inspect a slot the caller holds a read lock on
    ///
    /// Returns `None` when the slot is not read-locked or no longer indexed.
    pub fn peek_at_reader(&self, slot: SlotId) -> Option<AnchorView> {
        let anchor = self.checked_anchor(slot).ok()?;
        if anchor.reading() && anchor.state() == STATE_READY {
            Some(self.view(slot, anchor))
        } else {
            None
        }
    }

    /// Unlocked, possibly torn view of any indexed slot
    pub fn peek_at_entry(&self, slot: SlotId) -> Option<AnchorView> {
        let anchor = self.checked_anchor(slot).ok()?;
        if anchor.state() == STATE_READY {
            Some(self.view(slot, anchor))
        } else {
            None
        }
    }

    // =========================================================================
    // Freeing
    // =========================================================================

    /// Remove a slot from the index
    ///
    /// Frees immediately when nobody holds the slot (returns `true`);
    /// otherwise marks it so the last lock holder frees it.
    pub fn free(&self, slot: SlotId) -> Result<bool> {
        let anchor = self.checked_anchor(slot)?;
        if anchor.lock_exclusive() {
            self.free_locked(anchor);
            anchor.unlock_exclusive();
            return Ok(true);
        }

        if anchor.empty() {
            return Ok(false);
        }
        anchor.mark_waiting_to_be_freed();

        // the last holder may have left before seeing the mark
        if anchor.lock_exclusive() {
            self.free_locked(anchor);
            anchor.unlock_exclusive();
            return Ok(true);
        }

        tracing::debug!(path = %self.path.display(), slot, "marked entry to be freed");
        Ok(false)
    }

    /// Remove whatever slot holds `key`
    pub fn free_by_key(&self, key: &CacheKey) -> Result<bool> {
        for slot in self.probe_window(key) {
            let anchor = self.anchor(slot);
            if !anchor.empty() && anchor.same_key(key) {
                return self.free(slot);
            }
        }
        Ok(false)
    }

    /// Free one readable entry, scanning from a rotating shared cursor
    pub fn purge_one(&self) -> Option<SlotId> {
        let search_limit = PURGE_SEARCH_LIMIT.min(self.capacity);
        for _ in 0..search_limit {
            let victim = self.header().victim.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            let slot = victim % self.capacity;
            let anchor = self.anchor(slot);
            if anchor.lock_exclusive() {
                if anchor.state() == STATE_READY {
                    self.free_locked(anchor);
                    anchor.unlock_exclusive();
                    tracing::debug!(path = %self.path.display(), slot, "purged entry");
                    return Some(slot);
                }
                anchor.unlock_exclusive();
            }
        }
        tracing::debug!(path = %self.path.display(), "no entries to purge");
        None
    }

    /// Free one readable entry from `key`'s probe window
    ///
    /// Makes room for `key` when its window is full but the map is not.
    pub fn purge_near(&self, key: &CacheKey) -> Option<SlotId> {
        for slot in self.probe_window(key) {
            let anchor = self.anchor(slot);
            if anchor.lock_exclusive() {
                if anchor.state() == STATE_READY {
                    self.free_locked(anchor);
                    anchor.unlock_exclusive();
                    tracing::debug!(path = %self.path.display(), slot, "purged neighbor entry");
                    return Some(slot);
                }
                anchor.unlock_exclusive();
            }
        }
        None
    }

    // =========================================================================
    // Rebuild
    // =========================================================================

    /// Index an entry found on disk at `slot`
    ///
    /// Skips slots already in use and keys already indexed elsewhere.
    pub fn import(&self, slot: SlotId, key: &CacheKey, basics: &EntryBasics) -> Result<bool> {
        let anchor = self.checked_anchor(slot)?;
        if !anchor.lock_exclusive() {
            return Ok(false);
        }
        if !anchor.empty() || self.has_rival(key, slot) {
            anchor.unlock_exclusive();
            return Ok(false);
        }

        anchor.set_key(key);
        anchor.set_basics(basics);
        self.header().count.fetch_add(1, Ordering::AcqRel);
        anchor.set_state(STATE_READY);
        anchor.unlock_exclusive();
        Ok(true)
    }

    // =========================================================================
    // Write sequence
    // =========================================================================

    /// Number ordering committed writes across processes and restarts
    pub fn next_sequence(&self) -> u64 {
        self.header().sequence.fetch_add(1, Ordering::AcqRel)
    }

    /// Keep future sequence numbers above one found on disk
    pub fn observe_sequence(&self, seen: u64) {
        self.header()
            .sequence
            .fetch_max(seen.saturating_add(1), Ordering::AcqRel);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_limit(&self) -> u32 {
        self.capacity
    }

    pub fn entry_count(&self) -> u32 {
        self.header().count.load(Ordering::Acquire)
    }

    pub fn full(&self) -> bool {
        self.entry_count() >= self.capacity
    }

    pub fn probe_limit(&self) -> u32 {
        self.probe_limit
    }

    pub fn valid_slot(&self, slot: SlotId) -> bool {
        slot < self.capacity
    }

    /// Census of lock states across all anchors
    pub fn stats(&self) -> MapStats {
        let mut stats = MapStats {
            count: self.entry_count(),
            capacity: self.capacity,
            ..MapStats::default()
        };
        for slot in 0..self.capacity {
            let anchor = self.anchor(slot);
            let readers = anchor.readers();
            if anchor.writing() {
                stats.writeable += 1;
            } else if readers > 0 {
                stats.readable += 1;
                stats.readers += readers;
            } else {
                stats.idle += 1;
            }
            if anchor.waiting_to_be_freed() {
                stats.waiting_to_be_freed += 1;
            }
        }
        stats
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn base_of(mmap: &mut MmapMut) -> Result<NonNull<u8>> {
        NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| StoreError::Unavailable("slot map mapping is null".to_string()))
    }

    fn header(&self) -> &MapHeader {
        // SAFETY: the mapping is at least MAP_HEADER_SIZE bytes (checked at
        // create/attach) and page aligned; MapHeader is all atomics.
        unsafe { &*(self.base.as_ptr() as *const MapHeader) }
    }

    fn anchor(&self, slot: SlotId) -> &Anchor {
        debug_assert!(slot < self.capacity);
        let offset = MAP_HEADER_SIZE + slot as usize * ANCHOR_SIZE;
        // SAFETY: slot < capacity keeps the anchor inside the mapping;
        // offsets are multiples of 8 from a page-aligned base; Anchor is
        // all atomics, valid for any bit pattern another process writes.
        unsafe { &*(self.base.as_ptr().add(offset) as *const Anchor) }
    }

    fn checked_anchor(&self, slot: SlotId) -> Result<&Anchor> {
        if !self.valid_slot(slot) {
            return Err(StoreError::InvalidState(format!(
                "slot {} out of range (limit {})",
                slot, self.capacity
            )));
        }
        Ok(self.anchor(slot))
    }

    fn writing_anchor(&self, slot: SlotId) -> Result<&Anchor> {
        let anchor = self.checked_anchor(slot)?;
        if !anchor.writing() || anchor.state() != STATE_WRITING {
            return Err(StoreError::InvalidState(format!(
                "slot {} is not locked for writing",
                slot
            )));
        }
        Ok(anchor)
    }

    fn home(&self, key: &CacheKey) -> u32 {
        let [lo, hi] = key.words();
        (lo.wrapping_add(hi) % self.capacity as u64) as u32
    }

    fn probe_window(&self, key: &CacheKey) -> impl Iterator<Item = SlotId> {
        let home = self.home(key);
        let capacity = self.capacity;
        (0..self.probe_limit).map(move |i| (home + i) % capacity)
    }

    /// Another anchor in the probe window holds `key`
    fn has_rival(&self, key: &CacheKey, own: SlotId) -> bool {
        self.probe_window(key).any(|slot| {
            let anchor = self.anchor(slot);
            slot != own && !anchor.empty() && anchor.same_key(key)
        })
    }

    /// Clear an anchor held exclusively by the caller
    fn free_locked(&self, anchor: &Anchor) {
        if !anchor.empty() {
            self.header().count.fetch_sub(1, Ordering::AcqRel);
        }
        anchor.rewind();
    }

    fn release_shared(&self, anchor: &Anchor) {
        if anchor.unlock_shared() == 0 && anchor.waiting_to_be_freed() && anchor.lock_exclusive() {
            if anchor.waiting_to_be_freed() {
                self.free_locked(anchor);
            }
            anchor.unlock_exclusive();
        }
    }

    fn view(&self, slot: SlotId, anchor: &Anchor) -> AnchorView {
        AnchorView {
            slot,
            key: anchor.key(),
            basics: anchor.basics(),
        }
    }
}

// SAFETY: the mapped region is only accessed through atomics, and `base`
// stays valid for as long as `_mmap` is owned.
unsafe impl Send for SlotMap {}
unsafe impl Sync for SlotMap {}

impl std::fmt::Debug for SlotMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotMap")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("count", &self.entry_count())
            .finish()
    }
}

/// Starting sequence of a new map
///
/// Microseconds since the epoch, so a map recreated after a restart keeps
/// numbering above the copies its predecessor wrote.
fn sequence_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_micros() as u64)
}
