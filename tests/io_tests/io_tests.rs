//! Tests for the I/O strategies
//!
//! These tests verify:
//! - Blocking reads and writes complete through the reply channel
//! - Queued completions carry the id of their request
//! - Short reads at end of file
//! - Load shedding and shutdown of the queued strategy

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel;
use slotcache::config::IoStrategyKind;
use slotcache::io::{self, BlockingFile, DiskFile, IoOp, IoOutcome, IoRequest, QueuedFile};
use slotcache::StoreError;
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_file(len: u64) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("disk.db");
    let file = std::fs::File::create(&path).unwrap();
    file.set_len(len).unwrap();
    (temp_dir, path)
}

fn open_rw(path: &Path) -> std::fs::File {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .unwrap()
}

fn read_back(disk: &dyn DiskFile, offset: u64, len: usize) -> Bytes {
    match io::execute(disk, IoOp::Read { offset, len }, TIMEOUT).unwrap() {
        IoOutcome::Read(data) => data,
        other => panic!("unexpected outcome {:?}", other),
    }
}

// =============================================================================
// Blocking Strategy Tests
// =============================================================================

#[test]
fn test_blocking_write_then_read() {
    let (_temp, path) = setup_file(4096);
    let disk = BlockingFile::new(open_rw(&path));

    let written = io::execute(
        &disk,
        IoOp::Write {
            offset: 100,
            data: Bytes::from_static(b"hello disk"),
        },
        TIMEOUT,
    )
    .unwrap();
    assert_eq!(written, IoOutcome::Wrote(10));
    assert_eq!(read_back(&disk, 100, 10), Bytes::from_static(b"hello disk"));
    assert!(disk.load().is_none());
    assert!(!disk.needs_dedicated_process());
}

#[test]
fn test_blocking_completion_is_queued_before_submit_returns() {
    let (_temp, path) = setup_file(4096);
    let disk = BlockingFile::new(open_rw(&path));
    let (reply, completions) = channel::unbounded();

    disk.submit(IoRequest {
        id: 7,
        op: IoOp::Read { offset: 0, len: 16 },
        reply,
    })
    .unwrap();

    let completion = completions.try_recv().unwrap();
    assert_eq!(completion.id, 7);
    assert!(completion.result.is_ok());
}

#[test]
fn test_read_past_end_is_short() {
    let (_temp, path) = setup_file(64);
    let disk = BlockingFile::new(open_rw(&path));

    assert_eq!(read_back(&disk, 60, 16).len(), 4);
    assert!(read_back(&disk, 1000, 16).is_empty());
}

#[test]
fn test_open_uses_configured_strategy() {
    let (_temp, path) = setup_file(4096);

    let blocking = io::open(&IoStrategyKind::Blocking, &path).unwrap();
    assert_eq!(blocking.strategy(), "blocking");

    let queued = io::open(
        &IoStrategyKind::Queued {
            workers: 2,
            max_pending: 16,
        },
        &path,
    )
    .unwrap();
    assert_eq!(queued.strategy(), "queued");
    assert!(queued.needs_dedicated_process());
    assert_eq!(queued.load(), Some(0));
}

// =============================================================================
// Queued Strategy Tests
// =============================================================================

#[test]
fn test_queued_completions_match_requests_by_id() {
    let (_temp, path) = setup_file(64 * 1024);
    let disk = QueuedFile::new(open_rw(&path), &path, 4, 1024).unwrap();
    let (reply, completions) = channel::unbounded();

    let mut expected = HashMap::new();
    for id in 0..32u64 {
        let data = Bytes::from(vec![id as u8; 512]);
        disk.submit(IoRequest {
            id,
            op: IoOp::Write {
                offset: id * 1024,
                data,
            },
            reply: reply.clone(),
        })
        .unwrap();
        expected.insert(id, 512usize);
    }

    for _ in 0..32 {
        let completion = completions.recv_timeout(TIMEOUT).unwrap();
        let len = expected.remove(&completion.id).unwrap();
        assert_eq!(completion.result.unwrap(), IoOutcome::Wrote(len));
    }
    assert!(expected.is_empty());

    for id in 0..32u64 {
        let data = read_back(&disk, id * 1024, 512);
        assert!(data.iter().all(|b| *b == id as u8));
    }
}

#[test]
fn test_queued_sheds_load_past_limit() {
    let (_temp, path) = setup_file(4096);
    let disk = QueuedFile::new(open_rw(&path), &path, 1, 1).unwrap();

    // rendezvous replies keep the single disker parked after each request
    let (reply, completions) = channel::bounded(0);
    let mut accepted = 0;
    let mut shed = 0;
    for id in 0..3 {
        let request = IoRequest {
            id,
            op: IoOp::Read { offset: 0, len: 8 },
            reply: reply.clone(),
        };
        match disk.submit(request) {
            Ok(()) => accepted += 1,
            Err(StoreError::Busy) => shed += 1,
            Err(e) => panic!("unexpected error {}", e),
        }
    }
    assert!(shed >= 1);
    assert!(accepted >= 1);

    for _ in 0..accepted {
        completions.recv_timeout(TIMEOUT).unwrap();
    }
}

#[test]
fn test_queued_rejects_after_shutdown() {
    let (_temp, path) = setup_file(4096);
    let disk = QueuedFile::new(open_rw(&path), &path, 2, 8).unwrap();
    disk.shutdown();

    let (reply, _completions) = channel::unbounded();
    let result = disk.submit(IoRequest {
        id: 1,
        op: IoOp::Read { offset: 0, len: 8 },
        reply,
    });
    assert!(matches!(result, Err(StoreError::Unavailable(_))));
    assert_eq!(disk.pending(), 0);
}
