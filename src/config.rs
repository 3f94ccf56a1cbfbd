//! Configuration for slotcache
//!
//! Centralized configuration with sensible defaults, builders, and TOML
//! loading. Validation happens when a store is built from the config; any
//! problem found there is a [`StoreError::ConfigFatal`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::engine::layout::DB_HEADER_SIZE;
use crate::error::{Result, StoreError};

/// Most backends a store can hold (backend ids must stay small)
pub const MAX_BACKENDS: usize = 64;

/// Default per-backend cap on object size
pub const DEFAULT_MAX_OBJECT_SIZE: u64 = 32 * 1024;

/// Main configuration for a store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    // -------------------------------------------------------------------------
    // Placement
    // -------------------------------------------------------------------------
    /// How a backend is chosen for a new entry
    pub selection: SelectionStrategy,

    /// Global object size floor, used by dirs that set none
    pub min_object_size: u64,

    /// Global object size cap, used by dirs that set none
    pub max_object_size: u64,

    // -------------------------------------------------------------------------
    // Processes
    // -------------------------------------------------------------------------
    /// What this process does in a multi-process deployment
    pub role: ProcessRole,

    /// Where shared slot maps live (defaults to each dir's path)
    pub shm_dir: Option<PathBuf>,

    // -------------------------------------------------------------------------
    // Backends
    // -------------------------------------------------------------------------
    /// Configured cache dirs, in id order
    pub dirs: Vec<DirConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dirs: Vec::new(),
            selection: SelectionStrategy::LeastLoad,
            min_object_size: 0,
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
            role: ProcessRole::Standalone,
            shm_dir: None,
        }
    }
}

impl StoreConfig {
    /// Create a new config builder
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|e| StoreError::ConfigFatal(format!("invalid store config: {}", e)))
    }

    /// Read and parse a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            StoreError::ConfigFatal(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| StoreError::Serialization(format!("cannot render config: {}", e)))
    }

    /// Object size floor that applies to `dir`
    pub fn dir_min_object_size(&self, dir: &DirConfig) -> u64 {
        dir.min_object_size.unwrap_or(self.min_object_size)
    }

    /// Object size cap that applies to `dir`
    ///
    /// The global cap never exceeds what the dir's database can hold.
    pub fn dir_max_object_size(&self, dir: &DirConfig) -> u64 {
        dir.max_object_size.unwrap_or_else(|| {
            let room = dir.capacity_bytes.saturating_sub(DB_HEADER_SIZE);
            self.max_object_size.min(room)
        })
    }

    /// Copy of `dir` with the global object size limits filled in
    pub fn resolved_dir(&self, dir: &DirConfig) -> DirConfig {
        DirConfig {
            min_object_size: Some(self.dir_min_object_size(dir)),
            max_object_size: Some(self.dir_max_object_size(dir)),
            ..dir.clone()
        }
    }

    /// Reject configurations no store can run with
    pub fn validate(&self) -> Result<()> {
        if self.dirs.len() > MAX_BACKENDS {
            return Err(StoreError::ConfigFatal(format!(
                "{} cache dirs configured; at most {} are supported",
                self.dirs.len(),
                MAX_BACKENDS
            )));
        }
        for dir in &self.dirs {
            dir.validate()?;
            if self.dir_max_object_size(dir) == 0 {
                return Err(StoreError::ConfigFatal(format!(
                    "cache dir {} has a zero max object size",
                    dir.path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Builder for StoreConfig
#[derive(Default)]
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    /// Add a cache dir
    pub fn dir(mut self, dir: DirConfig) -> Self {
        self.config.dirs.push(dir);
        self
    }

    /// Set the backend selection strategy
    pub fn selection(mut self, selection: SelectionStrategy) -> Self {
        self.config.selection = selection;
        self
    }

    /// Set the global minimum object size (in bytes)
    pub fn min_object_size(mut self, size: u64) -> Self {
        self.config.min_object_size = size;
        self
    }

    /// Set the global maximum object size (in bytes)
    pub fn max_object_size(mut self, size: u64) -> Self {
        self.config.max_object_size = size;
        self
    }

    /// Set this process's role
    pub fn role(mut self, role: ProcessRole) -> Self {
        self.config.role = role;
        self
    }

    /// Set the directory for shared slot maps
    pub fn shm_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.shm_dir = Some(path.into());
        self
    }

    pub fn build(self) -> StoreConfig {
        self.config
    }
}

// =============================================================================
// Per-dir configuration
// =============================================================================

/// One configured backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirConfig {
    /// Storage engine type
    pub kind: BackendKind,

    /// Directory holding the backend's files
    /// Internal structure:
    ///   {path}/
    ///     ├── cache.db     (db header + slots)
    ///     └── cache.map    (shared slot map, unless shm_dir is set)
    pub path: PathBuf,

    /// Size of the database file (in bytes)
    pub capacity_bytes: u64,

    /// Overrides the global minimum object size
    pub min_object_size: Option<u64>,

    /// Overrides the global maximum object size; also the slot size
    pub max_object_size: Option<u64>,

    /// Refuse new entries
    pub read_only: bool,

    /// Eviction order
    pub removal_policy: RemovalPolicyKind,

    /// Anchors searched per key in the slot map
    pub probe_limit: u32,

    /// Check payload checksums during rebuild
    pub verify_payloads: bool,

    /// Longest wait for one I/O completion (milliseconds)
    pub io_timeout_ms: u64,

    /// Include this backend in aggregated stats
    pub report_stats: bool,

    /// How disk I/O is performed
    pub io: IoStrategyKind,
}

impl Default for DirConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Slots,
            path: PathBuf::from("./slotcache_data"),
            capacity_bytes: 64 * 1024 * 1024, // 64 MB
            min_object_size: None,
            max_object_size: None,
            read_only: false,
            io: IoStrategyKind::Blocking,
            removal_policy: RemovalPolicyKind::Lru,
            probe_limit: crate::slot_map::DEFAULT_PROBE_LIMIT,
            verify_payloads: true,
            io_timeout_ms: 5000,
            report_stats: true,
        }
    }
}

impl DirConfig {
    /// Create a new dir config builder for `path`
    pub fn builder(path: impl Into<PathBuf>) -> DirConfigBuilder {
        DirConfigBuilder {
            config: DirConfig {
                path: path.into(),
                ..DirConfig::default()
            },
        }
    }

    fn validate(&self) -> Result<()> {
        if self.capacity_bytes == 0 {
            return Err(StoreError::ConfigFatal(format!(
                "cache dir {} has zero capacity",
                self.path.display()
            )));
        }
        if self.max_object_size == Some(0) {
            return Err(StoreError::ConfigFatal(format!(
                "cache dir {} has a zero max object size",
                self.path.display()
            )));
        }
        if let IoStrategyKind::Queued {
            workers,
            max_pending,
        } = self.io
        {
            if workers == 0 || max_pending == 0 {
                return Err(StoreError::ConfigFatal(format!(
                    "cache dir {} needs at least one disker worker and queue slot",
                    self.path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Builder for DirConfig
pub struct DirConfigBuilder {
    config: DirConfig,
}

impl DirConfigBuilder {
    /// Set the database file size (in bytes)
    pub fn capacity_bytes(mut self, bytes: u64) -> Self {
        self.config.capacity_bytes = bytes;
        self
    }

    /// Set the minimum object size (in bytes)
    pub fn min_object_size(mut self, size: u64) -> Self {
        self.config.min_object_size = Some(size);
        self
    }

    /// Set the maximum object size, which is also the slot size (in bytes)
    pub fn max_object_size(mut self, size: u64) -> Self {
        self.config.max_object_size = Some(size);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    /// Set the I/O strategy
    pub fn io(mut self, io: IoStrategyKind) -> Self {
        self.config.io = io;
        self
    }

    pub fn removal_policy(mut self, policy: RemovalPolicyKind) -> Self {
        self.config.removal_policy = policy;
        self
    }

    pub fn probe_limit(mut self, limit: u32) -> Self {
        self.config.probe_limit = limit;
        self
    }

    pub fn verify_payloads(mut self, verify: bool) -> Self {
        self.config.verify_payloads = verify;
        self
    }

    /// Set the I/O timeout (in milliseconds)
    pub fn io_timeout_ms(mut self, ms: u64) -> Self {
        self.config.io_timeout_ms = ms;
        self
    }

    pub fn report_stats(mut self, report: bool) -> Self {
        self.config.report_stats = report;
        self
    }

    pub fn build(self) -> DirConfig {
        self.config
    }
}

// =============================================================================
// Enumerations
// =============================================================================

/// Storage engine type of a dir
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Slot-mapped single-file store
    Slots,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Slots => f.write_str("slots"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "slots" | "rock" => Ok(BackendKind::Slots),
            other => Err(StoreError::ConfigFatal(format!(
                "unsupported cache dir type {:?}",
                other
            ))),
        }
    }
}

/// Backend selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionStrategy {
    /// Rotate through backends, first acceptable wins
    #[serde(rename = "round-robin")]
    RoundRobin,
    /// Least loaded, ties broken by best size fit then free space
    #[serde(rename = "least-load", alias = "least-loaded")]
    LeastLoad,
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionStrategy::RoundRobin => f.write_str("round-robin"),
            SelectionStrategy::LeastLoad => f.write_str("least-load"),
        }
    }
}

impl FromStr for SelectionStrategy {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "round-robin" => Ok(SelectionStrategy::RoundRobin),
            "least-load" | "least-loaded" => Ok(SelectionStrategy::LeastLoad),
            other => Err(StoreError::ConfigFatal(format!(
                "unknown store_dir_select_algorithm {:?}",
                other
            ))),
        }
    }
}

/// How a backend performs disk I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum IoStrategyKind {
    /// Syscalls inline on the submitting thread
    Blocking,
    /// Dedicated disker threads behind a bounded queue
    Queued { workers: usize, max_pending: usize },
}

/// Eviction order of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemovalPolicyKind {
    Lru,
    Fifo,
}

/// Role of this process in a multi-process deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessRole {
    /// Single process doing everything
    Standalone,
    /// Serves requests; attaches to shared maps created elsewhere
    Worker,
    /// Owns backing files that need a dedicated I/O process
    Disker,
}
