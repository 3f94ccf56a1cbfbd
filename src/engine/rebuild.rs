//! Rebuild the slot map from the database file
//!
//! Scans every slot's cell header in order. Slots with a valid header are
//! imported into the shared map; everything else (blank, torn, truncated,
//! or failing checksum) is left free. Readers arriving mid-scan simply miss.
//!
//! Freeing a slot does not touch the disk, so a key may have several valid
//! copies. The one with the highest write sequence wins wherever it sits.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::entry::{CacheKey, SlotId};
use crate::error::{Result, StoreError};
use crate::io::{self, DiskFile, IoOp, IoOutcome};

use super::state::EngineCore;
use super::layout::{CellHeader, CELL_HEADER_SIZE};

/// Outcome of one rebuild pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildStats {
    pub scanned: u32,
    pub valid: u32,
    pub empty: u32,
    pub corrupt: u32,
    /// Valid slots superseded by a newer copy of their key
    pub duplicates: u32,
    pub elapsed: Duration,
}

enum SlotState {
    Empty,
    Corrupt(String),
    Valid(CellHeader),
}

/// Scan all slots, importing the valid ones
pub(crate) fn run(core: &EngineCore, disk: &dyn DiskFile, verify_payloads: bool) -> RebuildStats {
    let started = Instant::now();
    let mut stats = RebuildStats::default();
    tracing::info!(
        backend = core.id,
        path = %core.db_path.display(),
        slots = core.map.entry_limit(),
        "rebuilding slot map"
    );

    // newest copy imported so far, per key
    let mut newest: HashMap<CacheKey, (SlotId, u64)> = HashMap::new();

    for slot in 0..core.map.entry_limit() {
        stats.scanned += 1;
        let cell = match inspect(core, disk, slot, verify_payloads) {
            SlotState::Empty => {
                stats.empty += 1;
                continue;
            }
            SlotState::Corrupt(reason) => {
                tracing::debug!(backend = core.id, slot, %reason, "skipping corrupt slot");
                stats.corrupt += 1;
                continue;
            }
            SlotState::Valid(cell) => cell,
        };
        core.map.observe_sequence(cell.sequence);

        if let Some(&(indexed, sequence)) = newest.get(&cell.key) {
            stats.duplicates += 1;
            if sequence >= cell.sequence {
                tracing::debug!(backend = core.id, slot, newer = indexed, "skipping stale copy");
                continue;
            }
            tracing::debug!(backend = core.id, slot, stale = indexed, "replacing stale copy");
            core.evict(indexed);
            newest.remove(&cell.key);
            stats.valid -= 1;
        }

        match core.map.import(slot, &cell.key, &cell.basics) {
            Ok(true) => {
                core.policy.lock().add(slot);
                newest.insert(cell.key, (slot, cell.sequence));
                stats.valid += 1;
            }
            // a live writer already owns the key
            Ok(false) => stats.duplicates += 1,
            Err(e) => {
                tracing::warn!(backend = core.id, slot, error = %e, "cannot import slot");
                stats.corrupt += 1;
            }
        }
    }

    stats.elapsed = started.elapsed();
    core.counters
        .rebuilt
        .fetch_add(stats.valid as u64, Ordering::Relaxed);
    core.counters
        .corrupt
        .fetch_add(stats.corrupt as u64, Ordering::Relaxed);
    core.rebuilding.store(false, Ordering::Release);

    if stats.corrupt > 0 {
        tracing::warn!(backend = core.id, corrupt = stats.corrupt, "rebuild found corrupt slots");
    }
    tracing::info!(
        backend = core.id,
        valid = stats.valid,
        empty = stats.empty,
        duplicates = stats.duplicates,
        elapsed_ms = stats.elapsed.as_millis() as u64,
        "rebuild finished"
    );
    stats
}

fn inspect(core: &EngineCore, disk: &dyn DiskFile, slot: SlotId, verify: bool) -> SlotState {
    let offset = core.slot_offset(slot);
    let cell = match read(core, disk, offset, CELL_HEADER_SIZE as usize) {
        Ok(bytes) => bytes,
        Err(e) => return SlotState::Corrupt(e.to_string()),
    };
    if cell.iter().all(|&b| b == 0) && cell.len() == CELL_HEADER_SIZE as usize {
        return SlotState::Empty;
    }

    let header = match CellHeader::decode(&cell) {
        Ok(header) => header,
        Err(e) => return SlotState::Corrupt(e.to_string()),
    };

    let size = header.basics.payload_size;
    if size == 0 || size > core.payload_limit() {
        return SlotState::Corrupt(format!("invalid payload size {}", size));
    }

    if verify {
        let payload = match read(core, disk, offset + CELL_HEADER_SIZE, size as usize) {
            Ok(bytes) => bytes,
            Err(e) => return SlotState::Corrupt(e.to_string()),
        };
        if payload.len() as u64 != size {
            return SlotState::Corrupt(format!(
                "payload truncated to {} of {} bytes",
                payload.len(),
                size
            ));
        }
        if crc32fast::hash(&payload) != header.payload_crc {
            return SlotState::Corrupt("payload checksum mismatch".to_string());
        }
    }

    SlotState::Valid(header)
}

fn read(core: &EngineCore, disk: &dyn DiskFile, offset: u64, len: usize) -> Result<bytes::Bytes> {
    match io::execute(disk, IoOp::Read { offset, len }, core.io_timeout)? {
        IoOutcome::Read(bytes) => Ok(bytes),
        IoOutcome::Wrote(_) => Err(StoreError::InvalidState("read returned a write".to_string())),
    }
}
