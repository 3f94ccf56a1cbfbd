//! # slotcache
//!
//! Disk cache storage engine for a caching proxy:
//! - Slot-mapped single-file backends with a binary on-disk format
//! - A key → slot index in shared memory, safe across cooperating processes
//! - Pluggable blocking or queued (disker) I/O with a completion queue
//! - Crash-safe rebuild of the index from disk at startup
//! - Round-robin or least-load placement across several backends
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Disks (coordinator)                     │
//! │        select backend · accumulate more · aggregate          │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ dyn Backend
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                  SlotEngine (per cache dir)                  │
//! │        create/open store io · get · maintain · rebuild       │
//! └──────────┬──────────────────────────────────┬───────────────┘
//!            │                                  │
//!            ▼                                  ▼
//!   ┌─────────────────┐                ┌─────────────────┐
//!   │    Transfer     │───requests────▶│    DiskFile     │
//!   │ (read / write)  │◀─completions───│ blocking/queued │
//!   └────────┬────────┘                └─────────────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │     SlotMap     │  shared mmap, per-slot read/write locks
//!   └─────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod entry;

pub mod slot_map;
pub mod io;
pub mod removal;
pub mod transfer;
pub mod backend;
pub mod engine;
pub mod disks;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, StoreError};
pub use config::{DirConfig, StoreConfig};
pub use entry::{CacheKey, EntryBasics, StoreEntry};
pub use backend::Backend;
pub use engine::SlotEngine;
pub use disks::Disks;
pub use transfer::{CloseHow, Transfer};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of slotcache
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
