//! On-disk layout of a slot database
//!
//! ```text
//! [db header: DB_HEADER_SIZE][slot 0][slot 1]...[slot N-1]
//! slot = [cell header: CELL_HEADER_SIZE][payload ...]
//! ```
//!
//! The db header is bincode followed by zero padding. A cell header is
//! a little-endian CRC32 of bytes `4..CELL_HEADER_SIZE` followed by a
//! bincode body; bytes after the body are ignored when decoding, so newer
//! writers may append fields.

use serde::{Deserialize, Serialize};

use crate::entry::{CacheKey, EntryBasics, SlotId};
use crate::error::{Result, StoreError};

/// Bytes reserved at the start of the database file
pub const DB_HEADER_SIZE: u64 = 16 * 1024;

/// Bytes reserved at the start of every slot
pub const CELL_HEADER_SIZE: u64 = 128;

/// Most slots one database may hold
pub const SLOT_LIMIT: u64 = 0xFF_FFFF;

const DB_MAGIC: [u8; 8] = *b"SLOTCDB\0";
const DB_VERSION: u32 = 1;

const CELL_MAGIC: u32 = 0x534C_4345;
const CELL_VERSION: u16 = 2;

/// Absolute file offset of a slot
pub fn slot_offset(slot_size: u64, slot: SlotId) -> u64 {
    DB_HEADER_SIZE + slot as u64 * slot_size
}

/// Slots that fit in `capacity` bytes, before clamping to [`SLOT_LIMIT`]
pub fn wanted_slots(capacity: u64, slot_size: u64) -> u64 {
    capacity.saturating_sub(DB_HEADER_SIZE) / slot_size
}

// =============================================================================
// Db header
// =============================================================================

/// Versioning record at offset 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbHeader {
    magic: [u8; 8],
    pub version: u32,
    pub slot_size: u64,
    pub slot_count: u32,
}

impl DbHeader {
    pub fn new(slot_size: u64, slot_count: u32) -> Self {
        Self {
            magic: DB_MAGIC,
            version: DB_VERSION,
            slot_size,
            slot_count,
        }
    }

    /// Full header region, zero padded
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let mut region = vec![0u8; DB_HEADER_SIZE as usize];
        region[..body.len()].copy_from_slice(&body);
        Ok(region)
    }

    /// `None` for an all-zero (never initialized) region
    pub fn decode(region: &[u8]) -> Result<Option<Self>> {
        if region.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        let header: DbHeader = bincode::deserialize(region)
            .map_err(|e| StoreError::Corrupt(format!("unreadable db header: {}", e)))?;
        if header.magic != DB_MAGIC {
            return Err(StoreError::Corrupt("db header magic mismatch".to_string()));
        }
        if header.version != DB_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported db version {}",
                header.version
            )));
        }
        Ok(Some(header))
    }
}

// =============================================================================
// Cell header
// =============================================================================

/// Per-slot record written after the payload is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellHeader {
    magic: u32,
    version: u16,
    pub key: CacheKey,
    pub basics: EntryBasics,
    pub payload_crc: u32,
    /// Commit order; the highest copy of a key is the current one
    pub sequence: u64,
}

impl CellHeader {
    pub fn new(key: CacheKey, basics: EntryBasics, payload_crc: u32, sequence: u64) -> Self {
        Self {
            magic: CELL_MAGIC,
            version: CELL_VERSION,
            key,
            basics,
            payload_crc,
            sequence,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let mut cell = vec![0u8; CELL_HEADER_SIZE as usize];
        if body.len() > cell.len() - 4 {
            return Err(StoreError::Serialization(format!(
                "cell header body of {} bytes does not fit",
                body.len()
            )));
        }
        cell[4..4 + body.len()].copy_from_slice(&body);
        let crc = crc32fast::hash(&cell[4..]);
        cell[..4].copy_from_slice(&crc.to_le_bytes());
        Ok(cell)
    }

    pub fn decode(cell: &[u8]) -> Result<Self> {
        if cell.len() < CELL_HEADER_SIZE as usize {
            return Err(StoreError::Corrupt(format!(
                "short cell header ({} bytes)",
                cell.len()
            )));
        }
        let cell = &cell[..CELL_HEADER_SIZE as usize];
        let stored = u32::from_le_bytes([cell[0], cell[1], cell[2], cell[3]]);
        if stored != crc32fast::hash(&cell[4..]) {
            return Err(StoreError::Corrupt("cell header checksum mismatch".to_string()));
        }
        let header: CellHeader = bincode::deserialize(&cell[4..])
            .map_err(|e| StoreError::Corrupt(format!("unreadable cell header: {}", e)))?;
        if header.magic != CELL_MAGIC {
            return Err(StoreError::Corrupt("cell header magic mismatch".to_string()));
        }
        if header.version != CELL_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported cell version {}",
                header.version
            )));
        }
        Ok(header)
    }
}

/// Cell header of a slot that holds nothing readable
pub fn blank_cell() -> Vec<u8> {
    vec![0u8; CELL_HEADER_SIZE as usize]
}
