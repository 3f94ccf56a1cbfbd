//! Async I/O strategies
//!
//! Positional reads and writes against one backing file, completed through
//! an explicit completion queue. A caller submits an [`IoRequest`] tagged
//! with a [`RequestId`] and a reply channel; the strategy sends exactly one
//! [`IoCompletion`] carrying the same id back on that channel.
//!
//! Completions are never guaranteed to arrive in submission order, even for
//! the same file. Consumers match them by id.
//!
//! ## Strategies
//! - [`BlockingFile`]: performs the syscall inside `submit` and queues the
//!   completion before returning.
//! - [`QueuedFile`]: hands requests to dedicated I/O threads (the "disker")
//!   and sheds load past a pending-request limit.

mod blocking;
mod queued;

pub use blocking::BlockingFile;
pub use queued::QueuedFile;

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use crossbeam::channel::{self, Sender};

use crate::config::IoStrategyKind;
use crate::error::{Result, StoreError};

/// Identifies one request within the reply channel it was submitted with
pub type RequestId = u64;

/// What to do
#[derive(Debug, Clone)]
pub enum IoOp {
    /// Read up to `len` bytes at `offset`; short reads happen at end of file
    Read { offset: u64, len: usize },
    /// Write all of `data` at `offset`
    Write { offset: u64, data: Bytes },
}

/// A request plus where to send its completion
#[derive(Debug)]
pub struct IoRequest {
    pub id: RequestId,
    pub op: IoOp,
    pub reply: Sender<IoCompletion>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoOutcome {
    Read(Bytes),
    Wrote(usize),
}

/// Result of one request
#[derive(Debug)]
pub struct IoCompletion {
    pub id: RequestId,
    pub result: io::Result<IoOutcome>,
}

/// One backing file behind an I/O strategy
pub trait DiskFile: Send + Sync {
    /// Queue a request; its completion arrives on `request.reply`
    ///
    /// Fails without sending a completion when the strategy refuses work.
    fn submit(&self, request: IoRequest) -> Result<()>;

    /// Current load in `[0, 1000]`, or `None` if the strategy does not track it
    fn load(&self) -> Option<u32>;

    /// Whether new work should be refused right now
    fn shed_load(&self) -> bool;

    /// Requests submitted but not yet completed
    fn pending(&self) -> usize;

    /// Flush file data to stable storage
    fn sync(&self) -> Result<()>;

    /// Whether I/O must be performed by a dedicated disker
    fn needs_dedicated_process(&self) -> bool;

    /// Strategy name for reports
    fn strategy(&self) -> &'static str;
}

/// Open `path` for positional I/O using the configured strategy
pub fn open(kind: &IoStrategyKind, path: &Path) -> Result<Arc<dyn DiskFile>> {
    let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    let disk: Arc<dyn DiskFile> = match *kind {
        IoStrategyKind::Blocking => Arc::new(BlockingFile::new(file)),
        IoStrategyKind::Queued {
            workers,
            max_pending,
        } => Arc::new(QueuedFile::new(file, path, workers, max_pending)?),
    };
    tracing::debug!(path = %path.display(), strategy = disk.strategy(), "opened backing file");
    Ok(disk)
}

/// Submit one request and block until it completes
///
/// Used off the transfer path (rebuild, db header) where nothing else
/// waits on the same channel.
pub fn execute(disk: &dyn DiskFile, op: IoOp, timeout: Duration) -> Result<IoOutcome> {
    let (reply, completions) = channel::bounded(1);
    disk.submit(IoRequest { id: 0, op, reply })?;
    let completion = completions
        .recv_timeout(timeout)
        .map_err(|_| StoreError::Io(io::Error::new(io::ErrorKind::TimedOut, "I/O timed out")))?;
    Ok(completion.result?)
}

/// Perform a request against an open file
pub(crate) fn perform(file: &File, op: &IoOp) -> io::Result<IoOutcome> {
    match op {
        IoOp::Read { offset, len } => read_at(file, *offset, *len).map(IoOutcome::Read),
        IoOp::Write { offset, data } => {
            file.write_all_at(data, *offset)?;
            Ok(IoOutcome::Wrote(data.len()))
        }
    }
}

fn read_at(file: &File, offset: u64, len: usize) -> io::Result<Bytes> {
    let mut buf = BytesMut::zeroed(len);
    let mut filled = 0;
    while filled < len {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf.freeze())
}

/// Deliver a completion; a vanished receiver means the transfer was dropped
pub(crate) fn complete(reply: &Sender<IoCompletion>, id: RequestId, result: io::Result<IoOutcome>) {
    if reply.send(IoCompletion { id, result }).is_err() {
        tracing::debug!(id, "discarding completion for closed transfer");
    }
}
