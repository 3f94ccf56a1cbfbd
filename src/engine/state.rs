//! State shared between a slot engine, its transfers and its rebuild job

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::backend::BackendStats;
use crate::entry::{BackendId, CacheKey, EntryBasics, SlotId};
use crate::error::{Result, StoreError};
use crate::io::{self, DiskFile, IoOp};
use crate::removal::RemovalPolicy;
use crate::slot_map::SlotMap;
use crate::transfer::{IoKind, TransferTarget};

use super::layout::{slot_offset, CellHeader, CELL_HEADER_SIZE, DB_HEADER_SIZE};

/// Monotonic I/O and maintenance counters
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub io_errors: AtomicU64,
    pub evictions: AtomicU64,
    pub rebuilt: AtomicU64,
    pub corrupt: AtomicU64,
}

/// Everything a transfer or the rebuild job needs from its engine
///
/// ## Concurrency:
/// - `map`: cross-process, lock-free (per-slot lock words)
/// - `policy`: Mutex, touched once per store/evict/reference
/// - counters and `rebuilding`: atomics
pub(crate) struct EngineCore {
    pub id: BackendId,
    pub db_path: PathBuf,
    pub slot_size: u64,
    pub map: SlotMap,
    /// `None` when another process performs this backend's I/O
    pub file: Option<Arc<dyn DiskFile>>,
    pub policy: Mutex<Box<dyn RemovalPolicy>>,
    pub counters: Counters,
    pub rebuilding: AtomicBool,
    pub io_timeout: Duration,
}

impl EngineCore {
    pub fn slot_offset(&self, slot: SlotId) -> u64 {
        slot_offset(self.slot_size, slot)
    }

    /// Payload bytes one slot can hold
    pub fn payload_limit(&self) -> u64 {
        self.slot_size - CELL_HEADER_SIZE
    }

    pub fn current_size(&self) -> u64 {
        DB_HEADER_SIZE + self.slot_size * self.map.entry_count() as u64
    }

    pub fn stats(&self, capacity_bytes: u64) -> BackendStats {
        let map = self.map.stats();
        let c = &self.counters;
        BackendStats {
            capacity_bytes,
            current_size: self.current_size(),
            entry_count: map.count as u64,
            entry_limit: map.capacity as u64,
            reads: c.reads.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            bytes_read: c.bytes_read.load(Ordering::Relaxed),
            bytes_written: c.bytes_written.load(Ordering::Relaxed),
            io_errors: c.io_errors.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            rebuilt: c.rebuilt.load(Ordering::Relaxed),
            corrupt: c.corrupt.load(Ordering::Relaxed),
            open_reads: map.readers as u64,
            open_writes: map.writeable as u64,
        }
    }

    /// Release a slot and stop tracking it
    pub fn evict(&self, slot: SlotId) -> bool {
        self.policy.lock().remove(slot);
        match self.map.free(slot) {
            Ok(freed) => freed,
            Err(e) => {
                tracing::warn!(backend = self.id, slot, error = %e, "cannot free slot");
                false
            }
        }
    }
}

impl TransferTarget for EngineCore {
    fn disk(&self) -> Result<Arc<dyn DiskFile>> {
        self.file.clone().ok_or_else(|| {
            StoreError::Unavailable(format!(
                "{} is not accessed by this process",
                self.db_path.display()
            ))
        })
    }

    fn commit_write(
        &self,
        slot: SlotId,
        key: &CacheKey,
        basics: &EntryBasics,
        payload_crc: u32,
    ) -> Result<()> {
        let disk = self.disk()?;
        let sequence = self.map.next_sequence();
        let cell = CellHeader::new(*key, *basics, payload_crc, sequence).encode()?;
        let op = IoOp::Write {
            offset: self.slot_offset(slot),
            data: Bytes::from(cell),
        };
        if let Err(e) = io::execute(disk.as_ref(), op, self.io_timeout) {
            self.counters.io_errors.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        self.map.set_basics(slot, basics)?;
        self.map.close_for_writing(slot, true)?;
        self.policy.lock().add(slot);
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            backend = self.id,
            slot,
            key = %key,
            size = basics.payload_size,
            sequence,
            "committed entry"
        );
        Ok(())
    }

    fn abort_write(&self, slot: SlotId) {
        if let Err(e) = self.map.close_for_writing(slot, false) {
            tracing::warn!(backend = self.id, slot, error = %e, "cannot abort write");
        }
    }

    fn close_read(&self, slot: SlotId) {
        if let Err(e) = self.map.close_for_reading(slot) {
            tracing::warn!(backend = self.id, slot, error = %e, "cannot close read");
        }
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn validate_read(&self, slot: SlotId, key: &CacheKey) -> bool {
        self.map
            .peek_at_reader(slot)
            .map_or(false, |view| view.key == *key)
    }

    fn record_io(&self, op: IoKind, bytes: usize, ok: bool) {
        if !ok {
            self.counters.io_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let counter = match op {
            IoKind::Read => &self.counters.bytes_read,
            IoKind::Write => &self.counters.bytes_written,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}
