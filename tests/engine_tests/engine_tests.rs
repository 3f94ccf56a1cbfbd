//! Tests for SlotEngine
//!
//! These tests verify:
//! - Payload round trips through both I/O strategies
//! - Admission checks (size, flags, read-only, load)
//! - Eviction when the backend fills up
//! - Lookups hold a read lock until released
//! - A worker attached to the owner's map sees its entries

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use slotcache::config::{IoStrategyKind, ProcessRole};
use slotcache::engine::layout::DB_HEADER_SIZE;
use slotcache::entry::EntryFlags;
use slotcache::{
    Backend, CacheKey, CloseHow, DirConfig, SlotEngine, StoreConfig, StoreEntry, StoreError,
};
use tempfile::TempDir;

const SLOT_SIZE: u64 = 1024;

// =============================================================================
// Helper Functions
// =============================================================================

fn dir_config(path: &Path, slots: u64) -> DirConfig {
    DirConfig::builder(path)
        .capacity_bytes(DB_HEADER_SIZE + slots * SLOT_SIZE)
        .max_object_size(SLOT_SIZE)
        .build()
}

fn start(dir: &DirConfig, store: &StoreConfig) -> SlotEngine {
    let mut engine = SlotEngine::new(0, dir, store).unwrap();
    engine.create().unwrap();
    engine.init().unwrap();
    engine.wait_for_rebuild().unwrap();
    engine
}

fn setup_engine(slots: u64) -> (TempDir, SlotEngine) {
    let temp_dir = TempDir::new().unwrap();
    let engine = start(&dir_config(temp_dir.path(), slots), &StoreConfig::default());
    (temp_dir, engine)
}

fn key(n: u8) -> CacheKey {
    CacheKey::new([n; 16])
}

fn store(engine: &SlotEngine, key: CacheKey, data: &[u8]) -> StoreEntry {
    let mut entry = StoreEntry::with_size(key, data.len() as u64);
    let mut transfer = engine.create_store_io(&mut entry).unwrap();
    transfer
        .write(Bytes::copy_from_slice(data), Some(0), None)
        .unwrap();
    transfer.close(CloseHow::WroteAll).unwrap();
    entry
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

// =============================================================================
// Construction Tests
// =============================================================================

#[test]
fn test_new_rejects_unusable_geometry() {
    let temp_dir = TempDir::new().unwrap();
    let store = StoreConfig::default();

    let tiny_slots = DirConfig::builder(temp_dir.path())
        .capacity_bytes(DB_HEADER_SIZE + 4096)
        .max_object_size(128)
        .build();
    assert!(matches!(
        SlotEngine::new(0, &tiny_slots, &store),
        Err(StoreError::ConfigFatal(_))
    ));

    let no_room = DirConfig::builder(temp_dir.path())
        .capacity_bytes(DB_HEADER_SIZE + SLOT_SIZE - 1)
        .max_object_size(SLOT_SIZE)
        .build();
    assert!(matches!(
        SlotEngine::new(0, &no_room, &store),
        Err(StoreError::ConfigFatal(_))
    ));
}

#[test]
fn test_geometry_follows_config() {
    let (_temp, engine) = setup_engine(8);
    assert_eq!(engine.entry_limit(), 8);
    assert_eq!(engine.slot_size(), SLOT_SIZE);
    assert_eq!(engine.payload_limit(), SLOT_SIZE - 128);
    assert_eq!(engine.max_object_size(), SLOT_SIZE - 128);
    assert_eq!(engine.current_size(), DB_HEADER_SIZE);
    assert!(engine.db_path().exists());
    assert!(engine.map_path().exists());
}

#[test]
fn test_create_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let dir = dir_config(temp_dir.path(), 4);
    let engine = start(&dir, &StoreConfig::default());
    store(&engine, key(1), b"kept");

    engine.create().unwrap();
    assert_eq!(load(&engine, &key(1)).unwrap(), b"kept");
}

#[test]
fn test_uninitialized_engine_is_unavailable() {
    let temp_dir = TempDir::new().unwrap();
    let engine = SlotEngine::new(0, &dir_config(temp_dir.path(), 4), &StoreConfig::default()).unwrap();

    assert!(matches!(engine.get(&key(1)), Err(StoreError::Unavailable(_))));
    assert!(engine.can_store(&StoreEntry::new(key(1)), 10).is_none());
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_round_trip_blocking() {
    let (_temp, engine) = setup_engine(8);
    let payloads: Vec<Vec<u8>> = (0..5u8).map(|n| vec![n; 100 + n as usize * 150]).collect();

    for (n, payload) in payloads.iter().enumerate() {
        store(&engine, key(n as u8), payload);
    }
    assert_eq!(engine.current_count(), 5);

    for (n, payload) in payloads.iter().enumerate() {
        assert_eq!(&load(&engine, &key(n as u8)).unwrap(), payload);
    }
    assert!(load(&engine, &key(99)).is_none());
}

#[test]
fn test_round_trip_queued() {
    let temp_dir = TempDir::new().unwrap();
    let dir = DirConfig::builder(temp_dir.path())
        .capacity_bytes(DB_HEADER_SIZE + 8 * SLOT_SIZE)
        .max_object_size(SLOT_SIZE)
        .io(IoStrategyKind::Queued {
            workers: 3,
            max_pending: 64,
        })
        .build();
    let engine = start(&dir, &StoreConfig::default());
    assert!(engine.needs_dedicated_process());

    let mut entry = StoreEntry::new(key(1));
    let mut transfer = engine.create_store_io(&mut entry).unwrap();
    let mut expected = Vec::new();
    for chunk in 0..8u8 {
        let data = vec![chunk; 100];
        let offset = if chunk == 0 { Some(0) } else { None };
        transfer.write(Bytes::from(data.clone()), offset, None).unwrap();
        expected.extend_from_slice(&data);
    }
    transfer.close(CloseHow::WroteAll).unwrap();

    assert_eq!(load(&engine, &key(1)).unwrap(), expected);
}

#[test]
fn test_overwrite_replaces_payload() {
    let (_temp, engine) = setup_engine(4);
    let first = store(&engine, key(1), b"version one");
    let second = store(&engine, key(1), b"version two, longer");

    assert_eq!(first.disk.unwrap().slot, second.disk.unwrap().slot);
    assert_eq!(engine.current_count(), 1);
    assert_eq!(load(&engine, &key(1)).unwrap(), b"version two, longer");
}

#[test]
fn test_stats_count_io() {
    let (_temp, engine) = setup_engine(4);
    store(&engine, key(1), &[1u8; 300]);
    load(&engine, &key(1)).unwrap();

    let stats = engine.stats();
    assert_eq!(stats.writes, 1);
    assert_eq!(stats.reads, 1);
    assert_eq!(stats.bytes_written, 300);
    assert_eq!(stats.bytes_read, 300);
    assert_eq!(stats.entry_count, 1);
    assert_eq!(stats.current_size, DB_HEADER_SIZE + SLOT_SIZE);
}

// =============================================================================
// Admission Tests
// =============================================================================

#[test]
fn test_can_store_checks_size_and_flags() {
    let (_temp, engine) = setup_engine(4);
    let entry = StoreEntry::new(key(1));

    assert_eq!(engine.can_store(&entry, 10), Some(0));
    assert_eq!(engine.can_store(&entry, engine.payload_limit()), Some(0));
    assert!(engine.can_store(&entry, engine.payload_limit() + 1).is_none());

    let mut private = StoreEntry::new(key(2));
    private.basics.flags.set(EntryFlags::PRIVATE);
    assert!(engine.can_store(&private, 10).is_none());
}

#[test]
fn test_can_store_reports_occupancy_load() {
    let (_temp, engine) = setup_engine(4);
    store(&engine, key(1), b"a");
    store(&engine, key(2), b"b");
    assert_eq!(engine.can_store(&StoreEntry::new(key(3)), 1), Some(500));
}

#[test]
fn test_read_only_refuses_new_entries() {
    let temp_dir = TempDir::new().unwrap();
    let dir = dir_config(temp_dir.path(), 4);
    let mut engine = start(&dir, &StoreConfig::default());
    store(&engine, key(1), b"before");

    let mut read_only = dir.clone();
    read_only.read_only = true;
    engine.reconfigure(&read_only).unwrap();

    assert!(engine.read_only());
    assert!(engine.can_store(&StoreEntry::new(key(2)), 10).is_none());
    assert!(engine.stat().contains("READ-ONLY"));
    assert_eq!(load(&engine, &key(1)).unwrap(), b"before");
}

#[test]
fn test_reconfigure_rejects_moved_path() {
    let temp_dir = TempDir::new().unwrap();
    let dir = dir_config(temp_dir.path(), 4);
    let mut engine = start(&dir, &StoreConfig::default());

    let moved = dir_config(&temp_dir.path().join("elsewhere"), 4);
    assert!(matches!(engine.reconfigure(&moved), Err(StoreError::ConfigFatal(_))));
}

#[test]
fn test_oversized_known_entry_is_rejected() {
    let (_temp, engine) = setup_engine(4);
    let mut entry = StoreEntry::with_size(key(1), SLOT_SIZE);
    assert!(matches!(
        engine.create_store_io(&mut entry),
        Err(StoreError::SizeRejected { .. })
    ));
    assert!(entry.disk.is_none());
    assert_eq!(engine.current_count(), 0);
}

// =============================================================================
// Eviction Tests
// =============================================================================

#[test]
fn test_full_backend_evicts_least_recently_used() {
    let (_temp, engine) = setup_engine(2);
    let first = store(&engine, key(1), b"first");
    store(&engine, key(2), b"second");
    assert!(engine.full());

    // touching the first entry makes the second one the oldest
    engine.reference(&first);
    assert!(engine.dereference(&first));

    store(&engine, key(3), b"third");
    assert!(engine.current_count() <= 2);
    assert!(load(&engine, &key(2)).is_none());
    assert_eq!(load(&engine, &key(1)).unwrap(), b"first");
    assert_eq!(load(&engine, &key(3)).unwrap(), b"third");
    assert!(engine.stats().evictions >= 1);
}

#[test]
fn test_maintain_frees_until_not_full() {
    let (_temp, engine) = setup_engine(2);
    store(&engine, key(1), b"one");
    store(&engine, key(2), b"two");
    assert!(engine.full());

    engine.maintain();
    assert!(!engine.full());
    assert_eq!(engine.current_count(), 1);
    assert!(load(&engine, &key(1)).is_none());
}

#[test]
fn test_full_backend_with_all_slots_locked_reports_full() {
    let (_temp, engine) = setup_engine(2);
    store(&engine, key(1), b"one");
    store(&engine, key(2), b"two");
    let _a = engine.get(&key(1)).unwrap().unwrap();
    let _b = engine.get(&key(2)).unwrap().unwrap();

    let mut entry = StoreEntry::new(key(3));
    assert!(matches!(engine.create_store_io(&mut entry), Err(StoreError::Full)));
    assert_eq!(engine.current_count(), 2);
}

// =============================================================================
// Lookup and Unlink Tests
// =============================================================================

#[test]
fn test_get_holds_read_lock_until_disconnect() {
    let (_temp, engine) = setup_engine(4);
    store(&engine, key(1), b"locked");

    let mut found = engine.get(&key(1)).unwrap().unwrap();
    let anchor = found.disk.unwrap();
    assert!(anchor.read_locked);
    assert_eq!(found.expected_size, Some(6));

    let mut rewrite = StoreEntry::new(key(1));
    assert!(matches!(engine.create_store_io(&mut rewrite), Err(StoreError::Busy)));

    engine.disconnect(&mut found);
    assert!(found.disk.is_none());
    store(&engine, key(1), b"rewritten");
    assert_eq!(load(&engine, &key(1)).unwrap(), b"rewritten");
}

#[test]
fn test_unlink_removes_entry() {
    let (_temp, engine) = setup_engine(4);
    store(&engine, key(1), b"doomed");

    let mut found = engine.get(&key(1)).unwrap().unwrap();
    engine.unlink(&mut found).unwrap();

    assert!(found.disk.is_none());
    assert_eq!(engine.current_count(), 0);
    assert!(engine.get(&key(1)).unwrap().is_none());
}

#[test]
fn test_unlink_while_reading_is_deferred() {
    let (_temp, engine) = setup_engine(4);
    store(&engine, key(1), b"still readable");

    let mut reader_entry = engine.get(&key(1)).unwrap().unwrap();
    let mut transfer = engine.open_store_io(&mut reader_entry).unwrap();

    let mut other = engine.get(&key(1)).unwrap().unwrap();
    engine.unlink(&mut other).unwrap();
    assert!(engine.get(&key(1)).unwrap().is_none());
    assert_eq!(engine.current_count(), 1);

    // the open reader still gets the whole payload
    let out = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&out);
    transfer
        .read(
            0,
            64,
            Box::new(move |result: slotcache::Result<Bytes>| {
                sink.lock().extend_from_slice(&result.unwrap())
            }),
        )
        .unwrap();
    transfer.wait().unwrap();
    transfer.close(CloseHow::ReaderDone).unwrap();

    assert_eq!(&*out.lock(), b"still readable");
    assert_eq!(engine.current_count(), 0);
}

#[test]
fn test_stale_anchor_is_rejected() {
    let (_temp, engine) = setup_engine(4);
    let mut entry = store(&engine, key(1), b"payload");

    let mut found = engine.get(&key(1)).unwrap().unwrap();
    engine.unlink(&mut found).unwrap();

    assert!(matches!(engine.open_store_io(&mut entry), Err(StoreError::NotFound)));
}

#[test]
fn test_stat_report() {
    let (_temp, engine) = setup_engine(4);
    store(&engine, key(1), b"x");
    engine.set_selected(true);

    let report = engine.stat();
    assert!(report.contains("Store Directory #0"));
    assert!(report.contains("Current entries: 1"));
    assert!(report.contains("Maximum entries: 4"));
    assert!(report.contains("I/O strategy: blocking"));
    assert!(report.contains("SELECTED"));
}

// =============================================================================
// Process Role Tests
// =============================================================================

#[test]
fn test_worker_reads_entries_written_by_owner() {
    let temp_dir = TempDir::new().unwrap();
    let dir = dir_config(temp_dir.path(), 4);
    let owner = start(&dir, &StoreConfig::default());
    store(&owner, key(1), b"shared across processes");

    let worker_config = StoreConfig::builder().role(ProcessRole::Worker).build();
    let mut worker = SlotEngine::new(0, &dir, &worker_config).unwrap();
    worker.init().unwrap();
    assert!(!worker.is_rebuilding());

    assert_eq!(load(&worker, &key(1)).unwrap(), b"shared across processes");
    store(&worker, key(2), b"from the worker");
    assert_eq!(load(&owner, &key(2)).unwrap(), b"from the worker");
    assert_eq!(owner.current_count(), 2);
}

#[test]
fn test_worker_without_io_rights_cannot_transfer() {
    let temp_dir = TempDir::new().unwrap();
    let dir = DirConfig::builder(temp_dir.path())
        .capacity_bytes(DB_HEADER_SIZE + 4 * SLOT_SIZE)
        .max_object_size(SLOT_SIZE)
        .io(IoStrategyKind::Queued {
            workers: 1,
            max_pending: 16,
        })
        .build();
    let owner = start(&dir, &StoreConfig::default());
    store(&owner, key(1), b"on disk");

    let worker_config = StoreConfig::builder().role(ProcessRole::Worker).build();
    let mut worker = SlotEngine::new(0, &dir, &worker_config).unwrap();
    worker.init().unwrap();
    assert!(!worker.does_io_in_this_process());

    // index lookups still work, payload I/O does not
    let mut found = worker.get(&key(1)).unwrap().unwrap();
    assert!(matches!(worker.open_store_io(&mut found), Err(StoreError::Unavailable(_))));
    worker.disconnect(&mut found);

    let mut entry = StoreEntry::new(key(2));
    assert!(matches!(worker.create_store_io(&mut entry), Err(StoreError::Unavailable(_))));
    assert!(worker.can_store(&entry, 10).is_none());
}
