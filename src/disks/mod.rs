//! Multi-backend coordinator
//!
//! Owns every configured backend, places new entries with the configured
//! selection strategy, routes later operations to the backend named by an
//! entry's disk anchor, and sums capacity and stats across backends.
//!
//! ## Concurrency:
//! - Placement, lookup and routing take `&self`
//! - `init` and `reconfigure` take `&mut self` (exclusive access)
//! - Selection cursors are atomics

mod select;

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::backend::{Backend, BackendStats};
use crate::config::{BackendKind, DirConfig, SelectionStrategy, StoreConfig, MAX_BACKENDS};
use crate::engine::SlotEngine;
use crate::entry::{BackendId, CacheKey, StoreEntry};
use crate::error::{Result, StoreError};
use crate::transfer::Transfer;

/// Object size limits across active backends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limits {
    pub largest_min_object_size: Option<u64>,
    pub largest_max_object_size: Option<u64>,
    /// Second largest distinct max object size
    pub second_largest_max_object_size: Option<u64>,
}

/// The set of configured backends
pub struct Disks {
    backends: Vec<Box<dyn Backend>>,
    config: StoreConfig,
    selection: SelectionStrategy,
    limits: Limits,
    round_robin: AtomicUsize,
    lookup_cursor: AtomicUsize,
}

impl Disks {
    /// Build one backend per configured dir; nothing touches disk yet
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let backends = config
            .dirs
            .iter()
            .enumerate()
            .map(|(index, dir)| build_backend(index as BackendId, dir, &config))
            .collect::<Result<Vec<_>>>()?;

        let mut disks = Self {
            backends,
            selection: config.selection,
            config,
            limits: Limits::default(),
            round_robin: AtomicUsize::new(0),
            lookup_cursor: AtomicUsize::new(0),
        };
        disks.update_limits();
        Ok(disks)
    }

    /// Coordinate already constructed backends (for other backend variants)
    pub fn from_backends(backends: Vec<Box<dyn Backend>>, selection: SelectionStrategy) -> Result<Self> {
        if backends.len() > MAX_BACKENDS {
            return Err(StoreError::ConfigFatal(format!(
                "{} backends configured; at most {} are supported",
                backends.len(),
                MAX_BACKENDS
            )));
        }
        let mut disks = Self {
            backends,
            config: StoreConfig {
                selection,
                ..StoreConfig::default()
            },
            selection,
            limits: Limits::default(),
            round_robin: AtomicUsize::new(0),
            lookup_cursor: AtomicUsize::new(0),
        };
        disks.update_limits();
        Ok(disks)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Prepare on-disk structures of every active backend
    pub fn create(&self) -> Result<()> {
        if self.backends.is_empty() {
            tracing::warn!("no cache dirs are configured");
        }
        for backend in self.active() {
            backend.create()?;
        }
        Ok(())
    }

    /// Open every backend and start their rebuilds
    ///
    /// Backends this process does not serve still initialize, so that the
    /// process owning their shared maps creates and rebuilds them.
    pub fn init(&mut self) -> Result<()> {
        for backend in self.backends.iter_mut() {
            backend.init()?;
        }
        self.update_limits();
        tracing::info!(
            strategy = %self.selection,
            backends = self.backends.len(),
            "using {} store dir selection",
            self.selection
        );
        Ok(())
    }

    /// Block until every backend finished rebuilding
    pub fn wait_for_rebuild(&self) -> Result<()> {
        for backend in &self.backends {
            backend.wait_for_rebuild()?;
        }
        Ok(())
    }

    pub fn is_rebuilding(&self) -> bool {
        self.backends.iter().any(|b| b.is_rebuilding())
    }

    /// Apply a new configuration
    ///
    /// Dirs are matched by path: known ones are reconfigured in place, new
    /// ones are created and initialized, missing ones are dropped.
    pub fn reconfigure(&mut self, config: StoreConfig) -> Result<()> {
        config.validate()?;
        if config.role != self.config.role || config.shm_dir != self.config.shm_dir {
            tracing::warn!("process role and shm_dir changes need a restart");
        }

        let known = |dir: &DirConfig| self.backends.iter().any(|b| b.path() == dir.path);
        let mut used: Vec<BackendId> = self
            .backends
            .iter()
            .filter(|b| config.dirs.iter().any(|dir| dir.path == b.path()))
            .map(|b| b.id())
            .collect();

        // bring new dirs up first so a failure leaves the running set intact
        let mut added = Vec::new();
        for dir in config.dirs.iter().filter(|dir| !known(dir)) {
            let id = (0..MAX_BACKENDS as BackendId)
                .find(|id| !used.contains(id))
                .ok_or_else(|| StoreError::ConfigFatal("backend id space exhausted".to_string()))?;
            used.push(id);
            let mut backend = build_backend(id, dir, &config)?;
            backend.create()?;
            backend.init()?;
            tracing::info!(backend = id, path = %dir.path.display(), "added cache dir");
            added.push(backend);
        }

        let mut old: Vec<Option<Box<dyn Backend>>> = self.backends.drain(..).map(Some).collect();
        let mut added = added.into_iter();
        for dir in &config.dirs {
            let existing = old
                .iter_mut()
                .find(|slot| slot.as_ref().map_or(false, |b| b.path() == dir.path))
                .and_then(Option::take);
            match existing {
                Some(mut backend) => {
                    if let Err(e) = backend.reconfigure(&config.resolved_dir(dir)) {
                        tracing::warn!(backend = backend.id(), error = %e, "keeping previous settings");
                    }
                    self.backends.push(backend);
                }
                None => self.backends.extend(added.next()),
            }
        }
        for dropped in old.into_iter().flatten() {
            tracing::info!(backend = dropped.id(), path = %dropped.path().display(), "removing cache dir");
        }

        self.selection = config.selection;
        self.config = config;
        self.update_limits();
        tracing::info!(strategy = %self.selection, "reconfigured store dirs");
        Ok(())
    }

    // =========================================================================
    // Placement
    // =========================================================================

    /// Pick a backend for a new entry, if any accepts it
    pub fn select_backend(&self, entry: &StoreEntry) -> Option<BackendId> {
        let index = match self.selection {
            SelectionStrategy::RoundRobin => {
                select::round_robin(&self.backends, entry, &self.round_robin)
            }
            SelectionStrategy::LeastLoad => select::least_load(&self.backends, entry),
        };
        index.map(|i| self.backends[i].id())
    }

    /// Bytes to keep buffering before placement can be decided
    ///
    /// Zero once the final size is known or more data would not change
    /// which backends accept the entry. Entries growing past the second
    /// largest max object size are placed right away, accepting that the
    /// chosen backend may still reject them later.
    pub fn accumulate_more(&self, entry: &StoreEntry) -> u64 {
        if entry.expected_size.is_some() {
            return 0;
        }
        let accumulated = entry.accumulated;

        if let Some(min) = self.limits.largest_min_object_size {
            if accumulated < min {
                return min - accumulated;
            }
        }
        if let Some(second) = self.limits.second_largest_max_object_size {
            if accumulated <= second {
                return second - accumulated + 1;
            }
        }

        tracing::debug!(
            accumulated,
            limits = ?self.limits,
            "no need to accumulate more"
        );
        0
    }

    /// Select a backend and start writing `entry` there
    ///
    /// `Ok(None)` means no backend accepts the entry; it simply stays
    /// uncached.
    pub fn create_store_io(&self, entry: &mut StoreEntry) -> Result<Option<Transfer>> {
        let Some(id) = self.select_backend(entry) else {
            tracing::debug!(key = %entry.key, "no cache dir accepts entry");
            return Ok(None);
        };
        let backend = self.routed(id)?;
        backend.create_store_io(entry).map(Some)
    }

    /// Start reading an entry from the backend holding it
    pub fn open_store_io(&self, entry: &mut StoreEntry) -> Result<Transfer> {
        self.anchored(entry)?.open_store_io(entry)
    }

    /// Ask each active backend for `key`, rotating the starting point
    pub fn get(&self, key: &CacheKey) -> Result<Option<StoreEntry>> {
        let count = self.backends.len();
        if count == 0 {
            return Ok(None);
        }
        let start = self.lookup_cursor.fetch_add(1, Ordering::Relaxed);
        for n in 0..count {
            let backend = &self.backends[(start + n + 1) % count];
            if !backend.is_active_in_this_process() {
                continue;
            }
            match backend.get(key) {
                Ok(Some(entry)) => {
                    tracing::debug!(backend = backend.id(), key = %key, "cache dir has entry");
                    return Ok(Some(entry));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(backend = backend.id(), key = %key, error = %e, "lookup failed")
                }
            }
        }
        tracing::debug!(key = %key, dirs = count, "no cache dir has entry");
        Ok(None)
    }

    pub fn reference(&self, entry: &StoreEntry) {
        if let Ok(backend) = self.anchored(entry) {
            backend.reference(entry);
        }
    }

    pub fn dereference(&self, entry: &StoreEntry) -> bool {
        match self.anchored(entry) {
            Ok(backend) => backend.dereference(entry),
            Err(_) => true,
        }
    }

    /// Remove an entry from its backend
    pub fn unlink(&self, entry: &mut StoreEntry) -> Result<()> {
        if !entry.has_disk() {
            return Ok(());
        }
        self.anchored(entry)?.unlink(entry)
    }

    /// Detach an entry from its backend without removing it
    pub fn disconnect(&self, entry: &mut StoreEntry) {
        if let Ok(backend) = self.anchored(entry) {
            backend.disconnect(entry);
        }
    }

    /// Remove `key` from whichever backends hold it
    pub fn evict_if_found(&self, key: &CacheKey) -> Result<bool> {
        let mut found = false;
        for backend in self.active() {
            if let Some(mut entry) = backend.get(key)? {
                backend.unlink(&mut entry)?;
                found = true;
            }
        }
        Ok(found)
    }

    pub fn maintain(&self) {
        for backend in &self.backends {
            backend.maintain();
        }
    }

    pub fn sync(&self) -> Result<()> {
        for backend in &self.backends {
            backend.sync()?;
        }
        Ok(())
    }

    // =========================================================================
    // Limits and stats
    // =========================================================================

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Largest object any backend accepts
    pub fn max_object_size(&self) -> Option<u64> {
        self.limits.largest_max_object_size
    }

    pub fn max_size(&self) -> u64 {
        self.reporting().map(|b| b.max_size()).sum()
    }

    pub fn min_size(&self) -> u64 {
        self.reporting().map(|b| b.min_size()).sum()
    }

    pub fn current_size(&self) -> u64 {
        self.reporting().map(|b| b.current_size()).sum()
    }

    pub fn current_count(&self) -> u64 {
        self.reporting().map(|b| b.current_count()).sum()
    }

    pub fn stats(&self) -> BackendStats {
        let mut total = BackendStats::default();
        for backend in self.reporting() {
            total += backend.stats();
        }
        total
    }

    /// Per-backend text report
    pub fn stat(&self) -> String {
        let mut out = format!(
            "Store Directory Statistics:\nStore Entries: {}\nMaximum Swap Size: {} KB\nCurrent Store Swap Size: {} KB\n",
            self.current_count(),
            self.max_size() >> 10,
            self.current_size() >> 10
        );
        for backend in &self.backends {
            out.push('\n');
            out.push_str(&backend.stat());
        }
        out
    }

    pub fn selection(&self) -> SelectionStrategy {
        self.selection
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn backend(&self, id: BackendId) -> Option<&dyn Backend> {
        self.backends
            .iter()
            .find(|b| b.id() == id)
            .map(|b| b.as_ref())
    }

    pub fn backends(&self) -> impl Iterator<Item = &dyn Backend> {
        self.backends.iter().map(|b| b.as_ref())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn active(&self) -> impl Iterator<Item = &dyn Backend> {
        self.backends()
            .filter(|b| b.is_active_in_this_process())
    }

    fn reporting(&self) -> impl Iterator<Item = &dyn Backend> {
        self.backends().filter(|b| b.reports_stats())
    }

    fn routed(&self, id: BackendId) -> Result<&dyn Backend> {
        self.backend(id)
            .ok_or_else(|| StoreError::Unavailable(format!("no backend with id {}", id)))
    }

    fn anchored(&self, entry: &StoreEntry) -> Result<&dyn Backend> {
        let anchor = entry.disk.ok_or(StoreError::NotFound)?;
        self.routed(anchor.backend)
    }

    /// Recompute object size limits over active backends
    fn update_limits(&mut self) {
        let active: Vec<&dyn Backend> = self.active().collect();

        let largest_min = active.iter().map(|b| b.min_object_size()).max();

        let mut maxima: Vec<u64> = active.iter().map(|b| b.max_object_size()).collect();
        maxima.sort_unstable_by(|a, b| b.cmp(a));
        maxima.dedup();

        self.limits = Limits {
            largest_min_object_size: largest_min,
            largest_max_object_size: maxima.first().copied(),
            second_largest_max_object_size: maxima.get(1).copied(),
        };
        tracing::debug!(limits = ?self.limits, "updated store dir limits");
    }
}

fn build_backend(id: BackendId, dir: &DirConfig, config: &StoreConfig) -> Result<Box<dyn Backend>> {
    match dir.kind {
        BackendKind::Slots => Ok(Box::new(SlotEngine::new(id, dir, config)?)),
    }
}

impl std::fmt::Debug for Disks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disks")
            .field("backends", &self.backends.len())
            .field("selection", &self.selection)
            .field("limits", &self.limits)
            .finish()
    }
}
