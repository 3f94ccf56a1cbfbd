//! Cache keys and store entries
//!
//! The caller-side view of a cached object: an opaque 16-byte key, the small
//! fixed metadata persisted next to the payload, and an optional
//! [`DiskAnchor`] naming the backend slot that holds the object.
//!
//! Entries never point into a backend's slot map. The anchor is a weak,
//! id-based back-reference that backends re-validate before use.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Index of a slot inside one backend
pub type SlotId = u32;

/// Index of a backend inside the coordinator
pub type BackendId = u16;

/// Size of a cache key in bytes
pub const KEY_SIZE: usize = 16;

// =============================================================================
// CacheKey
// =============================================================================

/// Fixed-size opaque binary key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct CacheKey([u8; KEY_SIZE]);

impl CacheKey {
    pub const fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice that must be exactly [`KEY_SIZE`] bytes long
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            StoreError::InvalidState(format!(
                "cache key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// The key as two little-endian words (the slot map stores keys this way)
    pub fn words(&self) -> [u64; 2] {
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&self.0[..8]);
        hi.copy_from_slice(&self.0[8..]);
        [u64::from_le_bytes(lo), u64::from_le_bytes(hi)]
    }

    pub fn from_words(words: [u64; 2]) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        bytes[..8].copy_from_slice(&words[0].to_le_bytes());
        bytes[8..].copy_from_slice(&words[1].to_le_bytes());
        Self(bytes)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", hex::encode_upper(self.0))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl FromStr for CacheKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| StoreError::InvalidState(format!("invalid hex key {:?}: {}", s, e)))?;
        Self::from_slice(&bytes)
    }
}

// =============================================================================
// Entry metadata
// =============================================================================

/// Entry flag bits persisted with the entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryFlags(pub u16);

impl EntryFlags {
    /// Generated internally; never stored on disk
    pub const SPECIAL: u16 = 1 << 0;
    /// Marked for release by the caller
    pub const RELEASE_REQUEST: u16 = 1 << 1;
    /// Private (per-client) key; never shared
    pub const PRIVATE: u16 = 1 << 2;

    pub fn contains(&self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    pub fn set(&mut self, bit: u16) {
        self.0 |= bit;
    }

    pub fn clear(&mut self, bit: u16) {
        self.0 &= !bit;
    }

    /// Whether policy forbids putting this entry on disk
    pub fn rejects_disk(&self) -> bool {
        self.contains(Self::SPECIAL) || self.contains(Self::PRIVATE)
    }
}

/// Small fixed metadata stored alongside every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntryBasics {
    /// Payload bytes stored in the slot (cell header excluded)
    pub payload_size: u64,
    /// Creation time (unix seconds)
    pub timestamp: i64,
    /// Last reference time (unix seconds)
    pub last_ref: i64,
    /// Expiry time (unix seconds, negative when unknown)
    pub expires: i64,
    /// Last-modified time (unix seconds, negative when unknown)
    pub last_modified: i64,
    pub refcount: u32,
    pub flags: EntryFlags,
}

/// Current unix time in seconds
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// =============================================================================
// StoreEntry
// =============================================================================

/// Weak reference from an entry to the slot that holds it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskAnchor {
    pub backend: BackendId,
    pub slot: SlotId,
    /// The entry holds a read lock on the slot (taken by a lookup)
    pub read_locked: bool,
}

/// Caller-owned description of a cacheable object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub key: CacheKey,
    pub basics: EntryBasics,
    /// Final payload size when already known (e.g. from a length header)
    pub expected_size: Option<u64>,
    /// Payload bytes accumulated in memory so far
    pub accumulated: u64,
    pub disk: Option<DiskAnchor>,
}

impl StoreEntry {
    pub fn new(key: CacheKey) -> Self {
        let now = unix_now();
        Self {
            key,
            basics: EntryBasics {
                timestamp: now,
                last_ref: now,
                expires: -1,
                last_modified: -1,
                ..EntryBasics::default()
            },
            expected_size: None,
            accumulated: 0,
            disk: None,
        }
    }

    /// Entry whose final payload size is known up front
    pub fn with_size(key: CacheKey, size: u64) -> Self {
        let mut entry = Self::new(key);
        entry.expected_size = Some(size);
        entry
    }

    /// Record more payload bytes arriving from the producer
    pub fn accumulate(&mut self, bytes: u64) {
        self.accumulated += bytes;
    }

    /// Payload size used for placement, and whether it is the final size
    pub fn size_hint(&self) -> (u64, bool) {
        match self.expected_size {
            Some(size) => (size, true),
            None => (self.accumulated, false),
        }
    }

    pub fn has_disk(&self) -> bool {
        self.disk.is_some()
    }

    /// Anchor if the entry lives on the given backend
    pub fn anchor_on(&self, backend: BackendId) -> Option<DiskAnchor> {
        self.disk.filter(|anchor| anchor.backend == backend)
    }
}

// =============================================================================
// EntryTable
// =============================================================================

/// Stable handle to an entry stored in an [`EntryTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u32);

/// Arena of entries addressed by [`EntryId`], indexed by key
///
/// Freed ids are recycled, so an id is only meaningful while its entry lives.
#[derive(Debug, Default)]
pub struct EntryTable {
    slots: Vec<Option<StoreEntry>>,
    free: Vec<u32>,
    by_key: HashMap<CacheKey, EntryId>,
}

impl EntryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, replacing (and returning) any entry with the same key
    pub fn insert(&mut self, entry: StoreEntry) -> (EntryId, Option<StoreEntry>) {
        let previous = self
            .by_key
            .get(&entry.key)
            .copied()
            .and_then(|id| self.remove(id));

        let key = entry.key;
        let id = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(entry);
                EntryId(index)
            }
            None => {
                self.slots.push(Some(entry));
                EntryId((self.slots.len() - 1) as u32)
            }
        };
        self.by_key.insert(key, id);
        (id, previous)
    }

    pub fn get(&self, id: EntryId) -> Option<&StoreEntry> {
        self.slots.get(id.0 as usize).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut StoreEntry> {
        self.slots.get_mut(id.0 as usize).and_then(|slot| slot.as_mut())
    }

    pub fn find(&self, key: &CacheKey) -> Option<EntryId> {
        self.by_key.get(key).copied()
    }

    pub fn remove(&mut self, id: EntryId) -> Option<StoreEntry> {
        let entry = self.slots.get_mut(id.0 as usize)?.take()?;
        self.by_key.remove(&entry.key);
        self.free.push(id.0);
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &StoreEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|e| (EntryId(i as u32), e)))
    }
}
