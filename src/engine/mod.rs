//! Slot-mapped disk store
//!
//! One database file per backend, split into a versioned header and
//! fixed-size slots. Keys map to slots through the shared [`SlotMap`];
//! payload bytes move through the configured [`DiskFile`] strategy.
//!
//! ## Files
//! ```text
//! {dir}/cache.db              db header + slots
//! {dir or shm_dir}/cache.map  shared slot map
//! ```
//!
//! ## Write path
//! 1. `create_store_io` claims a slot in the map and blanks its cell header
//! 2. the transfer appends payload bytes after the cell header
//! 3. `close(WroteAll)` writes the cell header, then links the slot
//!
//! The cell header is written last, so a crash at any point leaves a slot
//! that rebuild treats as free.

pub mod layout;
mod rebuild;
mod state;

pub use rebuild::RebuildStats;

use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::backend::{admits, Backend, BackendStats, MAX_LOAD};
use crate::config::{BackendKind, DirConfig, IoStrategyKind, ProcessRole, StoreConfig};
use crate::entry::{BackendId, CacheKey, DiskAnchor, StoreEntry};
use crate::error::{Result, StoreError};
use crate::io::{self, DiskFile, IoOp, IoOutcome};
use crate::removal;
use crate::slot_map::SlotMap;
use crate::transfer::{SlotRange, Transfer, TransferTarget};

use self::state::{Counters, EngineCore};
use self::layout::{DbHeader, CELL_HEADER_SIZE, DB_HEADER_SIZE, SLOT_LIMIT};

/// Database file name inside a cache dir
pub const DB_FILE_NAME: &str = "cache.db";

/// Most victims one `maintain` call frees
const MAX_FREED_PER_MAINTAIN: u32 = 1000;

/// The slot-mapped backend
pub struct SlotEngine {
    id: BackendId,
    config: DirConfig,
    role: ProcessRole,
    map_path: PathBuf,
    slot_size: u64,
    slot_count: u32,
    min_object_size: u64,
    core: Option<Arc<EngineCore>>,
    rebuild: Mutex<Option<JoinHandle<RebuildStats>>>,
    last_rebuild: Mutex<Option<RebuildStats>>,
    selected: AtomicBool,
}

impl SlotEngine {
    /// Describe a backend; nothing is touched on disk until `create`/`init`
    pub fn new(id: BackendId, dir: &DirConfig, store: &StoreConfig) -> Result<Self> {
        let config = store.resolved_dir(dir);
        let slot_size = config.max_object_size.unwrap_or(store.max_object_size);
        let min_object_size = config.min_object_size.unwrap_or(0);

        if config.kind != BackendKind::Slots {
            return Err(StoreError::ConfigFatal(format!(
                "slot engine cannot serve {} dirs",
                config.kind
            )));
        }
        if slot_size <= CELL_HEADER_SIZE {
            return Err(StoreError::ConfigFatal(format!(
                "cache dir {} max object size {} must exceed the {} byte cell header",
                config.path.display(),
                slot_size,
                CELL_HEADER_SIZE
            )));
        }

        let wanted = layout::wanted_slots(config.capacity_bytes, slot_size);
        if wanted == 0 {
            return Err(StoreError::ConfigFatal(format!(
                "cache dir {} capacity {} cannot hold the db header and one {} byte slot",
                config.path.display(),
                config.capacity_bytes,
                slot_size
            )));
        }
        let slot_count = wanted.min(SLOT_LIMIT) as u32;

        let usable = layout::slot_offset(slot_size, slot_count);
        let waste = config.capacity_bytes - usable;
        if wanted > SLOT_LIMIT && waste > slot_size.max(1024) {
            tracing::warn!(
                backend = id,
                entries = slot_count,
                entry_size = slot_size,
                db_size = config.capacity_bytes,
                usable_size = usable,
                waste,
                "cache dir config wastes space"
            );
        }

        let map_dir = store.shm_dir.clone().unwrap_or_else(|| config.path.clone());
        let map_path = match &store.shm_dir {
            Some(_) => map_dir.join(format!("cache_{}.map", id)),
            None => map_dir.join("cache.map"),
        };

        Ok(Self {
            id,
            role: store.role,
            map_path,
            slot_size,
            slot_count,
            min_object_size,
            config,
            core: None,
            rebuild: Mutex::new(None),
            last_rebuild: Mutex::new(None),
            selected: AtomicBool::new(false),
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.config.path.join(DB_FILE_NAME)
    }

    pub fn map_path(&self) -> &Path {
        &self.map_path
    }

    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    pub fn entry_limit(&self) -> u32 {
        self.slot_count
    }

    /// Payload bytes one slot can hold
    pub fn payload_limit(&self) -> u64 {
        self.slot_size - CELL_HEADER_SIZE
    }

    /// Result of the last finished rebuild
    pub fn last_rebuild(&self) -> Option<RebuildStats> {
        *self.last_rebuild.lock()
    }

    fn core(&self) -> Result<&Arc<EngineCore>> {
        self.core.as_ref().ok_or_else(|| {
            StoreError::Unavailable(format!(
                "cache dir {} is not initialized in this process",
                self.config.path.display()
            ))
        })
    }

    fn map_owner(&self) -> bool {
        self.role != ProcessRole::Worker
    }

    /// Check (or write) the db header of an opened file
    fn check_db_header(&self, disk: &dyn DiskFile, timeout: Duration) -> Result<()> {
        let read = IoOp::Read {
            offset: 0,
            len: DB_HEADER_SIZE as usize,
        };
        let region = match io::execute(disk, read, timeout)? {
            IoOutcome::Read(bytes) => bytes,
            IoOutcome::Wrote(_) => Bytes::new(),
        };
        let expected = DbHeader::new(self.slot_size, self.slot_count);

        match DbHeader::decode(&region)? {
            Some(found) if found.slot_size != self.slot_size => Err(StoreError::ConfigFatal(format!(
                "{} holds {} byte slots but max object size is {}",
                self.db_path().display(),
                found.slot_size,
                self.slot_size
            ))),
            Some(found) if found.slot_count == self.slot_count => Ok(()),
            other => {
                if let Some(found) = other {
                    tracing::warn!(
                        backend = self.id,
                        old = found.slot_count,
                        new = self.slot_count,
                        "slot count changed; updating db header"
                    );
                }
                let write = IoOp::Write {
                    offset: 0,
                    data: Bytes::from(expected.encode()?),
                };
                io::execute(disk, write, timeout)?;
                Ok(())
            }
        }
    }

    fn start_rebuild(&self, core: &Arc<EngineCore>) -> Result<()> {
        let disk = match &core.file {
            Some(file) => Arc::clone(file),
            // the owner scans even when another process does the I/O
            None => io::open(&IoStrategyKind::Blocking, &self.db_path())?,
        };
        core.rebuilding.store(true, Ordering::Release);

        let core = Arc::clone(core);
        let verify = self.config.verify_payloads;
        let handle = std::thread::Builder::new()
            .name(format!("rebuild-{}", self.id))
            .spawn(move || rebuild::run(&core, disk.as_ref(), verify))?;
        *self.rebuild.lock() = Some(handle);
        Ok(())
    }

    fn occupancy_load(core: &EngineCore) -> u32 {
        let limit = core.map.entry_limit().max(1) as u64;
        (core.map.entry_count() as u64 * MAX_LOAD as u64 / limit) as u32
    }

    fn weak_target(core: &Arc<EngineCore>) -> Weak<dyn TransferTarget> {
        let weak: Weak<EngineCore> = Arc::downgrade(core);
        weak
    }

    fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.config.io_timeout_ms)
    }
}

impl Backend for SlotEngine {
    fn id(&self) -> BackendId {
        self.id
    }

    fn path(&self) -> &Path {
        &self.config.path
    }

    fn kind(&self) -> BackendKind {
        self.config.kind
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.config.path)?;
        let db_path = self.db_path();
        if db_path.exists() {
            tracing::debug!(path = %db_path.display(), "db file already exists");
            return Ok(());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&db_path)?;
        file.set_len(self.config.capacity_bytes)?;
        file.write_all_at(&DbHeader::new(self.slot_size, self.slot_count).encode()?, 0)?;
        file.sync_all()?;

        tracing::info!(
            backend = self.id,
            path = %db_path.display(),
            size = self.config.capacity_bytes,
            "created db file"
        );
        Ok(())
    }

    fn init(&mut self) -> Result<()> {
        if self.core.is_some() {
            return Ok(());
        }

        let map = if self.map_owner() {
            if let Some(parent) = self.map_path.parent() {
                fs::create_dir_all(parent)?;
            }
            SlotMap::create(&self.map_path, self.slot_count, self.config.probe_limit)?
        } else {
            SlotMap::attach(&self.map_path)?
        };
        if map.entry_limit() != self.slot_count {
            return Err(StoreError::ConfigFatal(format!(
                "shared map {} has {} slots, expected {}",
                self.map_path.display(),
                map.entry_limit(),
                self.slot_count
            )));
        }

        let file = if self.does_io_in_this_process() {
            let disk = io::open(&self.config.io, &self.db_path())?;
            self.check_db_header(disk.as_ref(), self.io_timeout())?;
            Some(disk)
        } else {
            None
        };

        let core = Arc::new(EngineCore {
            id: self.id,
            db_path: self.db_path(),
            slot_size: self.slot_size,
            map,
            file,
            policy: Mutex::new(removal::build(self.config.removal_policy)),
            counters: Counters::default(),
            rebuilding: AtomicBool::new(false),
            io_timeout: self.io_timeout(),
        });

        tracing::info!(
            backend = self.id,
            disk_bytes = self.config.capacity_bytes,
            entries = self.slot_count,
            does_io = core.file.is_some(),
            "cache dir limits"
        );

        if self.map_owner() {
            self.start_rebuild(&core)?;
        }
        self.core = Some(core);
        Ok(())
    }

    fn reconfigure(&mut self, dir: &DirConfig) -> Result<()> {
        if dir.path != self.config.path {
            return Err(StoreError::ConfigFatal(format!(
                "cannot move cache dir {} to {}",
                self.config.path.display(),
                dir.path.display()
            )));
        }
        if dir.max_object_size != self.config.max_object_size
            || dir.capacity_bytes != self.config.capacity_bytes
        {
            tracing::warn!(
                backend = self.id,
                "cannot change max object size or capacity of a running cache dir; restart to apply"
            );
        }
        if dir.removal_policy != self.config.removal_policy || dir.io != self.config.io {
            tracing::warn!(backend = self.id, "removal policy and I/O strategy changes need a restart");
        }

        self.min_object_size = dir.min_object_size.unwrap_or(0);
        self.config.min_object_size = dir.min_object_size;
        self.config.read_only = dir.read_only;
        self.config.report_stats = dir.report_stats;
        self.config.verify_payloads = dir.verify_payloads;
        self.config.io_timeout_ms = dir.io_timeout_ms;
        tracing::info!(backend = self.id, read_only = dir.read_only, "reconfigured cache dir");
        Ok(())
    }

    fn is_rebuilding(&self) -> bool {
        self.core
            .as_ref()
            .map_or(false, |core| core.rebuilding.load(Ordering::Acquire))
    }

    fn wait_for_rebuild(&self) -> Result<()> {
        let handle = self.rebuild.lock().take();
        if let Some(handle) = handle {
            let stats = handle
                .join()
                .map_err(|_| StoreError::InvalidState("rebuild thread panicked".to_string()))?;
            *self.last_rebuild.lock() = Some(stats);
        }
        Ok(())
    }

    // =========================================================================
    // Placement
    // =========================================================================

    fn can_store(&self, entry: &StoreEntry, size: u64) -> Option<u32> {
        let core = self.core.as_ref()?;
        // a full map still admits; create_store_io evicts to make room
        if !admits(self, entry, size) {
            return None;
        }
        let file = core.file.as_ref()?;
        if file.shed_load() {
            return None;
        }
        Some(file.load().unwrap_or_else(|| Self::occupancy_load(core)))
    }

    fn create_store_io(&self, entry: &mut StoreEntry) -> Result<Transfer> {
        let core = self.core()?;
        // fail before claiming a slot this process cannot write
        core.disk()?;

        if core.map.full() {
            self.maintain();
            if core.map.full() {
                return Err(StoreError::Full);
            }
        }

        let (size, known) = entry.size_hint();
        if size > core.payload_limit() {
            return Err(StoreError::SizeRejected {
                size,
                min: self.min_object_size,
                max: core.payload_limit(),
            });
        }

        let slot = match core.map.open_for_writing(&entry.key) {
            Err(StoreError::Full) => match core.map.purge_near(&entry.key) {
                Some(victim) => {
                    core.policy.lock().remove(victim);
                    core.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    core.map.open_for_writing(&entry.key)?
                }
                None => return Err(StoreError::Full),
            },
            other => other?,
        };
        core.policy.lock().remove(slot);
        if let Err(e) = core.map.set_basics(slot, &entry.basics) {
            core.abort_write(slot);
            return Err(e);
        }

        let range = SlotRange {
            backend: self.id,
            slot,
            disk_offset: core.slot_offset(slot) + CELL_HEADER_SIZE,
            payload_end: core.payload_limit(),
        };
        let mut transfer = Transfer::writer(
            Self::weak_target(core),
            range,
            entry.key,
            entry.basics,
            known.then_some(size),
            self.io_timeout(),
        );

        // blank the old cell header before any payload lands
        let blank = Bytes::from(layout::blank_cell());
        if let Err(e) = transfer.write_header(core.slot_offset(slot), blank) {
            tracing::error!(backend = self.id, slot, error = %e, "cannot claim slot");
            return Err(e);
        }

        entry.disk = Some(DiskAnchor {
            backend: self.id,
            slot,
            read_locked: false,
        });

        tracing::debug!(
            backend = self.id,
            slot,
            offset = core.slot_offset(slot),
            expected = size,
            "created store io"
        );
        Ok(transfer)
    }

    fn open_store_io(&self, entry: &mut StoreEntry) -> Result<Transfer> {
        let core = self.core()?;
        core.disk()?;
        let anchor = entry.anchor_on(self.id).ok_or(StoreError::NotFound)?;

        let view = if anchor.read_locked {
            match core.map.peek_at_reader(anchor.slot) {
                Some(view) if view.key == entry.key => view,
                _ => {
                    let _ = core.map.close_for_reading(anchor.slot);
                    entry.disk = None;
                    tracing::warn!(backend = self.id, slot = anchor.slot, "lost locked slot");
                    return Err(StoreError::NotFound);
                }
            }
        } else {
            core.map.open_for_reading_at(anchor.slot, &entry.key)?
        };

        if view.basics.payload_size > core.payload_limit() {
            core.close_read(anchor.slot);
            return Err(StoreError::Corrupt(format!(
                "slot {} claims {} payload bytes",
                anchor.slot, view.basics.payload_size
            )));
        }

        // the transfer now owns the read lock
        entry.disk = Some(DiskAnchor {
            read_locked: false,
            ..anchor
        });
        entry.basics = view.basics;
        entry.expected_size = Some(view.basics.payload_size);

        let range = SlotRange {
            backend: self.id,
            slot: anchor.slot,
            disk_offset: core.slot_offset(anchor.slot) + CELL_HEADER_SIZE,
            payload_end: view.basics.payload_size,
        };
        Ok(Transfer::reader(
            Self::weak_target(core),
            range,
            entry.key,
            view.basics,
            self.io_timeout(),
        ))
    }

    fn get(&self, key: &CacheKey) -> Result<Option<StoreEntry>> {
        let core = self.core()?;
        match core.map.open_for_reading(key) {
            Ok((slot, view)) => {
                let size = view.basics.payload_size;
                Ok(Some(StoreEntry {
                    key: *key,
                    basics: view.basics,
                    expected_size: Some(size),
                    accumulated: size,
                    disk: Some(DiskAnchor {
                        backend: self.id,
                        slot,
                        read_locked: true,
                    }),
                }))
            }
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn reference(&self, entry: &StoreEntry) {
        if let (Ok(core), Some(anchor)) = (self.core(), entry.anchor_on(self.id)) {
            core.policy.lock().referenced(anchor.slot);
        }
    }

    fn dereference(&self, entry: &StoreEntry) -> bool {
        if let (Ok(core), Some(anchor)) = (self.core(), entry.anchor_on(self.id)) {
            core.policy.lock().dereferenced(anchor.slot);
        }
        true
    }

    fn unlink(&self, entry: &mut StoreEntry) -> Result<()> {
        let core = self.core()?;
        let Some(anchor) = entry.anchor_on(self.id) else {
            return Ok(());
        };
        if anchor.read_locked {
            core.map.close_for_reading(anchor.slot)?;
        }
        entry.disk = None;

        let still_ours = core
            .map
            .peek_at_entry(anchor.slot)
            .map_or(false, |view| view.key == entry.key);
        if still_ours {
            core.evict(anchor.slot);
            tracing::debug!(backend = self.id, slot = anchor.slot, "unlinked entry");
        }
        Ok(())
    }

    fn disconnect(&self, entry: &mut StoreEntry) {
        if let Some(anchor) = entry.anchor_on(self.id) {
            if anchor.read_locked {
                if let Ok(core) = self.core() {
                    core.close_read(anchor.slot);
                }
            }
            entry.disk = None;
        }
    }

    fn maintain(&self) {
        let Some(core) = self.core.as_ref() else {
            return;
        };
        if core.rebuilding.load(Ordering::Acquire) {
            tracing::debug!(backend = self.id, "skipping maintenance during rebuild");
            return;
        }
        if !core.map.full() {
            return;
        }

        let mut freed = 0;
        while freed < MAX_FREED_PER_MAINTAIN && core.map.full() {
            let victim = core.policy.lock().pick_victim();
            match victim {
                Some(slot) => {
                    core.evict(slot);
                }
                None => match core.map.purge_one() {
                    Some(slot) => {
                        core.policy.lock().remove(slot);
                    }
                    None => break,
                },
            }
            freed += 1;
        }
        core.counters
            .evictions
            .fetch_add(freed as u64, Ordering::Relaxed);
        tracing::debug!(backend = self.id, freed, "maintenance freed entries");

        if core.map.full() {
            tracing::warn!(backend = self.id, freed, "cache dir is still full after maintenance");
        }
    }

    fn sync(&self) -> Result<()> {
        match self.core.as_ref().and_then(|core| core.file.as_ref()) {
            Some(file) => file.sync(),
            None => Ok(()),
        }
    }

    fn full(&self) -> bool {
        self.core.as_ref().map_or(false, |core| core.map.full())
    }

    // =========================================================================
    // Limits and stats
    // =========================================================================

    fn max_size(&self) -> u64 {
        self.config.capacity_bytes
    }

    fn current_size(&self) -> u64 {
        self.core
            .as_ref()
            .map_or(DB_HEADER_SIZE, |core| core.current_size())
    }

    fn current_count(&self) -> u64 {
        self.core
            .as_ref()
            .map_or(0, |core| core.map.entry_count() as u64)
    }

    fn min_object_size(&self) -> u64 {
        self.min_object_size
    }

    /// Largest payload a slot holds; the cell header takes the rest
    fn max_object_size(&self) -> u64 {
        self.payload_limit()
    }

    fn read_only(&self) -> bool {
        self.config.read_only
    }

    fn reports_stats(&self) -> bool {
        self.config.report_stats
    }

    fn stats(&self) -> BackendStats {
        match &self.core {
            Some(core) => core.stats(self.config.capacity_bytes),
            None => BackendStats {
                capacity_bytes: self.config.capacity_bytes,
                current_size: DB_HEADER_SIZE,
                entry_limit: self.slot_count as u64,
                ..BackendStats::default()
            },
        }
    }

    fn stat(&self) -> String {
        let stats = self.stats();
        let max = self.max_size().max(1);
        let limit = stats.entry_limit.max(1);
        let mut out = String::new();
        out.push_str(&format!("Store Directory #{} ({}): {}\n", self.id, self.kind(), self.path().display()));
        out.push_str(&format!("Maximum Size: {} KB\n", self.max_size() >> 10));
        out.push_str(&format!(
            "Current Size: {} KB {:.2}%\n",
            stats.current_size >> 10,
            100.0 * stats.current_size as f64 / max as f64
        ));
        out.push_str(&format!(
            "Current entries: {} {:.2}%\n",
            stats.entry_count,
            100.0 * stats.entry_count as f64 / limit as f64
        ));
        out.push_str(&format!("Maximum entries: {}\n", stats.entry_limit));
        if let Some(file) = self.core.as_ref().and_then(|core| core.file.as_ref()) {
            out.push_str(&format!(
                "I/O strategy: {} ({} pending)\n",
                file.strategy(),
                file.pending()
            ));
        }
        out.push_str(&format!(
            "Reads: {} ({} bytes), writes: {} ({} bytes), errors: {}\n",
            stats.reads, stats.bytes_read, stats.writes, stats.bytes_written, stats.io_errors
        ));
        out.push_str(&format!("Evictions: {}\n", stats.evictions));
        out.push_str("Flags:");
        if self.selected.load(Ordering::Relaxed) {
            out.push_str(" SELECTED");
        }
        if self.read_only() {
            out.push_str(" READ-ONLY");
        }
        out.push('\n');
        out
    }

    // =========================================================================
    // Process roles
    // =========================================================================

    fn needs_dedicated_process(&self) -> bool {
        matches!(self.config.io, IoStrategyKind::Queued { .. })
    }

    fn role(&self) -> ProcessRole {
        self.role
    }

    fn set_selected(&self, selected: bool) {
        self.selected.store(selected, Ordering::Relaxed);
    }
}

impl Drop for SlotEngine {
    fn drop(&mut self) {
        if let Err(e) = self.wait_for_rebuild() {
            tracing::error!(backend = self.id, error = %e, "rebuild did not finish cleanly");
        }
    }
}
