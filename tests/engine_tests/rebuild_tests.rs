//! Tests for rebuilding the slot map from disk
//!
//! These tests verify:
//! - Committed entries survive a restart byte for byte
//! - Torn cell headers, truncated files and bad payloads are skipped
//! - A write that never committed leaves its slot free
//! - The newest copy of a rewritten key wins wherever it sits
//! - Db header checks on reopen

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use slotcache::engine::layout::{slot_offset, CELL_HEADER_SIZE, DB_HEADER_SIZE};
use slotcache::{
    Backend, CacheKey, CloseHow, DirConfig, SlotEngine, StoreConfig, StoreEntry, StoreError,
};
use tempfile::TempDir;

const SLOT_SIZE: u64 = 1024;
const SLOTS: u64 = 8;

// =============================================================================
// Helper Functions
// =============================================================================

fn dir_config(path: &Path, verify: bool) -> DirConfig {
    DirConfig::builder(path)
        .capacity_bytes(DB_HEADER_SIZE + SLOTS * SLOT_SIZE)
        .max_object_size(SLOT_SIZE)
        .verify_payloads(verify)
        .build()
}

fn start(dir: &DirConfig) -> SlotEngine {
    let mut engine = SlotEngine::new(0, dir, &StoreConfig::default()).unwrap();
    engine.create().unwrap();
    engine.init().unwrap();
    engine.wait_for_rebuild().unwrap();
    engine
}

fn key(n: u8) -> CacheKey {
    CacheKey::new([n; 16])
}

fn payload(n: u8) -> Vec<u8> {
    (0..200 + n as usize * 50).map(|i| (i as u8).wrapping_mul(n + 1)).collect()
}

/// Store entries 0..count and return the slot of each
fn populate(engine: &SlotEngine, count: u8) -> Vec<u32> {
    (0..count)
        .map(|n| {
            let data = payload(n);
            let mut entry = StoreEntry::with_size(key(n), data.len() as u64);
            let mut transfer = engine.create_store_io(&mut entry).unwrap();
            transfer.write(Bytes::from(data), Some(0), None).unwrap();
            transfer.close(CloseHow::WroteAll).unwrap();
            entry.disk.unwrap().slot
        })
        .collect()
}

fn load(engine: &SlotEngine, key: &CacheKey) -> Option<Vec<u8>> {
    let mut entry = engine.get(key).unwrap()?;
    let size = entry.basics.payload_size as usize;
    let mut transfer = engine.open_store_io(&mut entry).unwrap();

    let out = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&out);
    transfer
        .read(
            0,
            size,
            Box::new(move |result: slotcache::Result<Bytes>| {
                sink.lock().extend_from_slice(&result.unwrap())
            }),
        )
        .unwrap();
    transfer.wait().unwrap();
    transfer.close(CloseHow::ReaderDone).unwrap();

    let data = out.lock().clone();
    Some(data)
}

/// Store `data` under `key` and return its slot
fn store(engine: &SlotEngine, key: &CacheKey, data: &[u8]) -> u32 {
    let mut entry = StoreEntry::with_size(*key, data.len() as u64);
    let mut transfer = engine.create_store_io(&mut entry).unwrap();
    transfer.write(Bytes::copy_from_slice(data), Some(0), None).unwrap();
    transfer.close(CloseHow::WroteAll).unwrap();
    entry.disk.unwrap().slot
}

fn unlink(engine: &SlotEngine, key: &CacheKey) {
    let mut entry = engine.get(key).unwrap().unwrap();
    engine.unlink(&mut entry).unwrap();
}

fn scribble(db_path: &Path, offset: u64, bytes: &[u8]) {
    let file = OpenOptions::new().write(true).open(db_path).unwrap();
    file.write_all_at(bytes, offset).unwrap();
    file.sync_all().unwrap();
}

// =============================================================================
// Restart Tests
// =============================================================================

#[test]
fn test_entries_survive_restart() {
    let temp_dir = TempDir::new().unwrap();
    let dir = dir_config(temp_dir.path(), true);
    {
        let engine = start(&dir);
        populate(&engine, 5);
        engine.sync().unwrap();
    }

    let engine = start(&dir);
    let stats = engine.last_rebuild().unwrap();
    assert_eq!(stats.scanned, SLOTS as u32);
    assert_eq!(stats.valid, 5);
    assert_eq!(stats.empty, SLOTS as u32 - 5);
    assert_eq!(stats.corrupt, 0);
    assert_eq!(engine.current_count(), 5);
    assert_eq!(engine.stats().rebuilt, 5);

    for n in 0..5 {
        assert_eq!(load(&engine, &key(n)).unwrap(), payload(n));
    }
}

#[test]
fn test_fresh_db_rebuilds_empty() {
    let temp_dir = TempDir::new().unwrap();
    let engine = start(&dir_config(temp_dir.path(), true));

    let stats = engine.last_rebuild().unwrap();
    assert_eq!(stats.valid, 0);
    assert_eq!(stats.empty, SLOTS as u32);
    assert!(!engine.is_rebuilding());
}

#[test]
fn test_rebuilt_entries_are_evictable() {
    let temp_dir = TempDir::new().unwrap();
    let dir = dir_config(temp_dir.path(), true);
    {
        let engine = start(&dir);
        populate(&engine, SLOTS as u8);
    }

    let engine = start(&dir);
    assert!(engine.full());
    engine.maintain();
    assert!(!engine.full());
}

// =============================================================================
// Crash Recovery Tests
// =============================================================================

#[test]
fn test_garbage_cell_header_is_skipped() {
    let temp_dir = TempDir::new().unwrap();
    let dir = dir_config(temp_dir.path(), true);
    let (slots, db_path) = {
        let engine = start(&dir);
        (populate(&engine, 3), engine.db_path())
    };

    scribble(&db_path, slot_offset(SLOT_SIZE, slots[1]) + 8, &[0xFF; 40]);

    let engine = start(&dir);
    let stats = engine.last_rebuild().unwrap();
    assert_eq!(stats.valid, 2);
    assert_eq!(stats.corrupt, 1);
    assert_eq!(engine.current_count(), 2);

    assert!(load(&engine, &key(1)).is_none());
    assert_eq!(load(&engine, &key(0)).unwrap(), payload(0));
    assert_eq!(load(&engine, &key(2)).unwrap(), payload(2));

    // the skipped slot is free for new writes
    populate(&engine, 2);
    assert_eq!(load(&engine, &key(1)).unwrap(), payload(1));
}

#[test]
fn test_truncated_file_keeps_whole_slots() {
    let temp_dir = TempDir::new().unwrap();
    let dir = dir_config(temp_dir.path(), true);
    let (slots, db_path) = {
        let engine = start(&dir);
        (populate(&engine, 4), engine.db_path())
    };

    // cut the file in the middle of the last written payload
    let last = *slots.iter().max().unwrap();
    let cut = slot_offset(SLOT_SIZE, last) + CELL_HEADER_SIZE + 10;
    OpenOptions::new()
        .write(true)
        .open(&db_path)
        .unwrap()
        .set_len(cut)
        .unwrap();

    let engine = start(&dir);
    let stats = engine.last_rebuild().unwrap();
    assert_eq!(stats.valid, 3);
    assert_eq!(engine.current_count(), 3);
    for (n, slot) in slots.iter().enumerate() {
        let found = load(&engine, &key(n as u8));
        if *slot == last {
            assert!(found.is_none());
        } else {
            assert_eq!(found.unwrap(), payload(n as u8));
        }
    }
}

#[test]
fn test_payload_checksum_verification() {
    let temp_dir = TempDir::new().unwrap();
    let (slots, db_path) = {
        let engine = start(&dir_config(temp_dir.path(), true));
        (populate(&engine, 2), engine.db_path())
    };
    scribble(&db_path, slot_offset(SLOT_SIZE, slots[0]) + CELL_HEADER_SIZE + 5, b"X");

    let verified = start(&dir_config(temp_dir.path(), true));
    assert_eq!(verified.last_rebuild().unwrap().corrupt, 1);
    assert!(verified.get(&key(0)).unwrap().is_none());
    drop(verified);

    // without verification only the cell header is checked
    let trusting = start(&dir_config(temp_dir.path(), false));
    assert_eq!(trusting.last_rebuild().unwrap().valid, 2);
}

#[test]
fn test_uncommitted_write_is_lost_after_crash() {
    let temp_dir = TempDir::new().unwrap();
    let dir = dir_config(temp_dir.path(), true);
    {
        let engine = start(&dir);
        populate(&engine, 2);

        // overwrite key 1 but never commit: the process "dies" mid-write
        let mut entry = StoreEntry::new(key(1));
        let mut transfer = engine.create_store_io(&mut entry).unwrap();
        transfer.write(Bytes::from_static(b"half"), Some(0), None).unwrap();
        transfer.wait().unwrap();
        std::mem::forget(transfer);
    }

    let engine = start(&dir);
    assert_eq!(engine.last_rebuild().unwrap().valid, 1);
    assert_eq!(load(&engine, &key(0)).unwrap(), payload(0));
    assert!(load(&engine, &key(1)).is_none());
}

// =============================================================================
// Rewrite Tests
// =============================================================================

#[test]
fn test_rewritten_key_restores_newest_copy() {
    let temp_dir = TempDir::new().unwrap();
    let dir = dir_config(temp_dir.path(), true);
    // both keys hash to slot 7 of 8
    let neighbor = CacheKey::from_words([7, 0]);
    let rewritten = CacheKey::from_words([7, 8]);
    {
        let engine = start(&dir);
        assert_eq!(store(&engine, &neighbor, b"neighbor"), 7);
        // the first version wraps around to slot 0
        assert_eq!(store(&engine, &rewritten, b"OLD-VERSION"), 0);
        unlink(&engine, &neighbor);
        unlink(&engine, &rewritten);

        // the rewrite lands at home, ahead of the stale copy in probe order
        // but behind it in scan order
        assert_eq!(store(&engine, &rewritten, b"NEW-VERSION"), 7);
        assert_eq!(load(&engine, &rewritten).unwrap(), b"NEW-VERSION");
        engine.sync().unwrap();
    }

    let engine = start(&dir);
    let stats = engine.last_rebuild().unwrap();
    assert_eq!(stats.valid, 1);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(engine.current_count(), 1);
    assert_eq!(load(&engine, &rewritten).unwrap(), b"NEW-VERSION");
    assert!(load(&engine, &neighbor).is_none());
    drop(engine);

    // the stale slot stays on disk, so every restart must resolve it again
    let engine = start(&dir);
    assert_eq!(engine.last_rebuild().unwrap().valid, 1);
    assert_eq!(load(&engine, &rewritten).unwrap(), b"NEW-VERSION");
}

#[test]
fn test_stale_copy_after_newest_is_skipped() {
    let temp_dir = TempDir::new().unwrap();
    let dir = dir_config(temp_dir.path(), true);
    let neighbor = CacheKey::from_words([6, 0]);
    let rewritten = CacheKey::from_words([6, 8]);
    {
        let engine = start(&dir);
        assert_eq!(store(&engine, &neighbor, b"neighbor"), 6);
        assert_eq!(store(&engine, &rewritten, b"OLD-VERSION"), 7);
        unlink(&engine, &neighbor);
        unlink(&engine, &rewritten);
        assert_eq!(store(&engine, &rewritten, b"NEW-VERSION"), 6);
        engine.sync().unwrap();
    }

    let engine = start(&dir);
    let stats = engine.last_rebuild().unwrap();
    assert_eq!(stats.valid, 1);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(load(&engine, &rewritten).unwrap(), b"NEW-VERSION");

    // a rewrite after the restart outranks both copies on disk
    assert_eq!(store(&engine, &rewritten, b"NEWEST"), 6);
    drop(engine);

    let engine = start(&dir);
    assert_eq!(load(&engine, &rewritten).unwrap(), b"NEWEST");
}

// =============================================================================
// Db Header Tests
// =============================================================================

#[test]
fn test_garbage_db_header_fails_init() {
    let temp_dir = TempDir::new().unwrap();
    let dir = dir_config(temp_dir.path(), true);
    let db_path = {
        let engine = start(&dir);
        engine.db_path()
    };
    scribble(&db_path, 0, b"definitely not a slot database header");

    let mut engine = SlotEngine::new(0, &dir, &StoreConfig::default()).unwrap();
    engine.create().unwrap();
    assert!(matches!(engine.init(), Err(StoreError::Corrupt(_))));
}

#[test]
fn test_changed_slot_size_is_fatal() {
    let temp_dir = TempDir::new().unwrap();
    drop(start(&dir_config(temp_dir.path(), true)));

    let resized = DirConfig::builder(temp_dir.path())
        .capacity_bytes(DB_HEADER_SIZE + SLOTS * SLOT_SIZE)
        .max_object_size(SLOT_SIZE * 2)
        .build();
    let mut engine = SlotEngine::new(0, &resized, &StoreConfig::default()).unwrap();
    assert!(matches!(engine.init(), Err(StoreError::ConfigFatal(_))));
}
