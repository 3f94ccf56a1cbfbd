//! Backend abstraction
//!
//! The capability set every storage backend offers the coordinator. The
//! coordinator only ever talks to `dyn Backend`, so new storage engines
//! plug in without touching placement or aggregation code.

use std::ops::AddAssign;
use std::path::Path;

use crate::config::{BackendKind, DirConfig, ProcessRole};
use crate::entry::{CacheKey, StoreEntry};
use crate::error::Result;
use crate::transfer::Transfer;

/// Load figure meaning "idle"; loads range over `[0, MAX_LOAD]`
pub const MAX_LOAD: u32 = 1000;

/// Counters a backend reports; summed across backends by the coordinator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub capacity_bytes: u64,
    pub current_size: u64,
    pub entry_count: u64,
    pub entry_limit: u64,
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub io_errors: u64,
    pub evictions: u64,
    pub rebuilt: u64,
    pub corrupt: u64,
    pub open_reads: u64,
    pub open_writes: u64,
}

impl AddAssign for BackendStats {
    fn add_assign(&mut self, other: Self) {
        self.capacity_bytes += other.capacity_bytes;
        self.current_size += other.current_size;
        self.entry_count += other.entry_count;
        self.entry_limit += other.entry_limit;
        self.reads += other.reads;
        self.writes += other.writes;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.io_errors += other.io_errors;
        self.evictions += other.evictions;
        self.rebuilt += other.rebuilt;
        self.corrupt += other.corrupt;
        self.open_reads += other.open_reads;
        self.open_writes += other.open_writes;
    }
}

/// A configured storage area
pub trait Backend: Send + Sync {
    fn id(&self) -> u16;
    fn path(&self) -> &Path;
    fn kind(&self) -> BackendKind;

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Prepare on-disk structures; leaves existing ones untouched
    fn create(&self) -> Result<()>;

    /// Attach to on-disk and shared structures and start any rebuild
    fn init(&mut self) -> Result<()>;

    /// Apply a changed configuration in place
    fn reconfigure(&mut self, config: &DirConfig) -> Result<()>;

    /// Whether a rebuild job is still scanning
    fn is_rebuilding(&self) -> bool;

    /// Block until the rebuild job (if any) finishes
    fn wait_for_rebuild(&self) -> Result<()>;

    // -------------------------------------------------------------------------
    // Placement
    // -------------------------------------------------------------------------

    /// Admission test; `Some(load)` when the entry may be stored here
    fn can_store(&self, entry: &StoreEntry, size: u64) -> Option<u32>;

    /// Start writing a new entry; records the disk anchor in `entry`
    fn create_store_io(&self, entry: &mut StoreEntry) -> Result<Transfer>;

    /// Start reading an entry previously found or written here
    fn open_store_io(&self, entry: &mut StoreEntry) -> Result<Transfer>;

    /// Look up a key; the returned entry holds a read lock on its slot
    fn get(&self, key: &CacheKey) -> Result<Option<StoreEntry>>;

    /// The caller starts using the entry
    fn reference(&self, entry: &StoreEntry);

    /// The caller stopped using the entry; `true` if it should stay cached
    fn dereference(&self, entry: &StoreEntry) -> bool;

    /// Remove the entry from the index
    fn unlink(&self, entry: &mut StoreEntry) -> Result<()>;

    /// Forget the entry's slot without removing it from the index
    fn disconnect(&self, entry: &mut StoreEntry);

    /// Evict entries while full
    fn maintain(&self);

    /// Flush written data to stable storage
    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn full(&self) -> bool;

    // -------------------------------------------------------------------------
    // Limits and stats
    // -------------------------------------------------------------------------

    fn max_size(&self) -> u64;

    /// Low-water mark
    fn min_size(&self) -> u64 {
        self.max_size() / 100 * 90
    }

    fn current_size(&self) -> u64;
    fn current_count(&self) -> u64;
    fn min_object_size(&self) -> u64;
    fn max_object_size(&self) -> u64;
    fn read_only(&self) -> bool;
    fn reports_stats(&self) -> bool;
    fn stats(&self) -> BackendStats;

    /// Human-readable report
    fn stat(&self) -> String;

    // -------------------------------------------------------------------------
    // Process roles
    // -------------------------------------------------------------------------

    /// Whether only a dedicated disker may perform this backend's I/O
    fn needs_dedicated_process(&self) -> bool;

    fn role(&self) -> ProcessRole;

    /// Whether this process touches the backend at all
    fn is_active_in_this_process(&self) -> bool {
        match self.role() {
            ProcessRole::Standalone | ProcessRole::Worker => true,
            ProcessRole::Disker => self.needs_dedicated_process(),
        }
    }

    /// Whether this process opens the backing file
    fn does_io_in_this_process(&self) -> bool {
        match self.role() {
            ProcessRole::Standalone => true,
            ProcessRole::Worker => !self.needs_dedicated_process(),
            ProcessRole::Disker => self.needs_dedicated_process(),
        }
    }

    /// Replace the selected flag shown in reports
    fn set_selected(&self, selected: bool);
}

/// Admission checks shared by every backend
///
/// Rejects policy-excluded entries, sizes outside the object size range,
/// read-only backends, and backends already at or over their maximum size.
pub fn base_can_store(backend: &dyn Backend, entry: &StoreEntry, size: u64) -> bool {
    admits(backend, entry, size) && backend.current_size() < backend.max_size()
}

/// [`base_can_store`] without the capacity test
///
/// For backends that make room on demand: a full slot engine still accepts
/// entries and evicts in `create_store_io`.
pub fn admits(backend: &dyn Backend, entry: &StoreEntry, size: u64) -> bool {
    if entry.basics.flags.rejects_disk() {
        return false;
    }
    if !object_size_fits(backend, size, entry.size_hint().1) {
        return false;
    }
    !backend.read_only()
}

/// Whether `size` is in the backend's object size range
///
/// A size that is still growing is not held to the minimum yet.
pub fn object_size_fits(backend: &dyn Backend, size: u64, size_known: bool) -> bool {
    if size > backend.max_object_size() {
        return false;
    }
    !size_known || size >= backend.min_object_size()
}
