//! Transfer state machine
//!
//! One in-progress read or write against a single slot. A transfer owns its
//! completion queue: every request it submits is tagged with a fresh
//! [`RequestId`] and the callback registered for it runs when the caller
//! pumps completions with [`Transfer::poll`] or [`Transfer::wait`].
//!
//! ## Lifecycle
//! ```text
//! Open ──write()/read()──▶ Transferring ──close(how)──▶ Closed(how)
//! ```
//! `close` consumes the transfer, so closing twice cannot be expressed.
//! Dropping an unclosed transfer releases its slot the way `WriterGone` /
//! `ReaderDone` would.
//!
//! The transfer holds only a weak reference to its backend; once the
//! backend is gone every operation reports [`StoreError::Unavailable`].

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use crate::entry::{BackendId, CacheKey, EntryBasics, SlotId};
use crate::error::{Result, StoreError};
use crate::io::{DiskFile, IoCompletion, IoOp, IoOutcome, IoRequest, RequestId};

/// Runs with the bytes read (empty at or past the end of the payload)
pub type ReadCallback = Box<dyn FnOnce(Result<Bytes>) + Send>;

/// Runs with the number of bytes written
pub type WriteCallback = Box<dyn FnOnce(Result<usize>) + Send>;

/// Backend side of a transfer
pub trait TransferTarget: Send + Sync {
    /// File handle to submit I/O to
    fn disk(&self) -> Result<Arc<dyn DiskFile>>;

    /// Make a completely written slot readable
    fn commit_write(
        &self,
        slot: SlotId,
        key: &CacheKey,
        basics: &EntryBasics,
        payload_crc: u32,
    ) -> Result<()>;

    /// Give up a slot locked for writing
    fn abort_write(&self, slot: SlotId);

    /// Drop the read lock held by a read transfer
    fn close_read(&self, slot: SlotId);

    /// Whether `slot` still holds `key` under a read lock
    fn validate_read(&self, slot: SlotId, key: &CacheKey) -> bool;

    /// Account for finished I/O
    fn record_io(&self, op: IoKind, bytes: usize, ok: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
}

/// Why a transfer is closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseHow {
    /// Every byte was written; publish the entry
    WroteAll,
    /// The producer went away; discard the slot
    WriterGone,
    /// The reader is finished, whether or not it read everything
    ReaderDone,
    /// An I/O failure ended the transfer
    Error,
}

/// Outcome of a successful close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed {
    pub how: CloseHow,
    pub backend: BackendId,
    pub slot: SlotId,
    /// Metadata as committed (writes) or as read (reads)
    pub basics: EntryBasics,
}

enum Pending {
    Read(ReadCallback),
    Write(Option<WriteCallback>),
    /// Slot bookkeeping outside the payload
    Header,
}

/// Live state of one read or write against a slot
pub struct Transfer {
    target: Weak<dyn TransferTarget>,
    backend: BackendId,
    slot: SlotId,
    key: CacheKey,
    basics: EntryBasics,
    mode: Mode,

    /// Absolute file offset of payload byte 0
    disk_offset: u64,
    /// Payload bytes this transfer may touch
    payload_end: u64,
    /// Size the writer announced up front, if any
    expected_end: Option<u64>,
    /// Next append position (writes) or highest byte requested (reads)
    offset_in_payload: u64,
    /// Whether the first payload write was accepted
    appending: bool,

    next_id: RequestId,
    completions: Receiver<IoCompletion>,
    reply: Sender<IoCompletion>,
    pending: HashMap<RequestId, Pending>,
    crc: crc32fast::Hasher,
    io_timeout: Duration,

    failure: Option<String>,
    released: bool,
}

/// Where a transfer's payload lives
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotRange {
    pub backend: BackendId,
    pub slot: SlotId,
    pub disk_offset: u64,
    pub payload_end: u64,
}

impl Transfer {
    pub(crate) fn writer(
        target: Weak<dyn TransferTarget>,
        range: SlotRange,
        key: CacheKey,
        basics: EntryBasics,
        expected_end: Option<u64>,
        io_timeout: Duration,
    ) -> Self {
        Self::new(target, range, key, basics, Mode::Write, expected_end, io_timeout)
    }

    pub(crate) fn reader(
        target: Weak<dyn TransferTarget>,
        range: SlotRange,
        key: CacheKey,
        basics: EntryBasics,
        io_timeout: Duration,
    ) -> Self {
        Self::new(target, range, key, basics, Mode::Read, None, io_timeout)
    }

    fn new(
        target: Weak<dyn TransferTarget>,
        range: SlotRange,
        key: CacheKey,
        basics: EntryBasics,
        mode: Mode,
        expected_end: Option<u64>,
        io_timeout: Duration,
    ) -> Self {
        let (reply, completions) = channel::unbounded();
        tracing::debug!(
            backend = range.backend,
            slot = range.slot,
            ?mode,
            payload_end = range.payload_end,
            "opened transfer"
        );
        Self {
            target,
            backend: range.backend,
            slot: range.slot,
            key,
            basics,
            mode,
            disk_offset: range.disk_offset,
            payload_end: range.payload_end,
            expected_end,
            offset_in_payload: 0,
            appending: false,
            next_id: 1,
            completions,
            reply,
            pending: HashMap::new(),
            crc: crc32fast::Hasher::new(),
            io_timeout,
            failure: None,
            released: false,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn backend(&self) -> BackendId {
        self.backend
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Metadata the transfer will commit, or that the reader found
    pub fn basics(&self) -> &EntryBasics {
        &self.basics
    }

    /// Update the metadata to commit (timestamps, flags)
    pub fn set_basics(&mut self, basics: EntryBasics) {
        let payload_size = self.basics.payload_size;
        self.basics = basics;
        if self.mode == Mode::Read {
            self.basics.payload_size = payload_size;
        }
    }

    /// Bytes appended so far (writes)
    pub fn offset(&self) -> u64 {
        self.offset_in_payload
    }

    pub fn payload_end(&self) -> u64 {
        self.payload_end
    }

    /// Requests submitted whose callbacks have not run yet
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Whether the backing slot still holds this transfer's entry
    pub fn is_valid(&self) -> bool {
        match self.target.upgrade() {
            Some(target) => match self.mode {
                Mode::Read => target.validate_read(self.slot, &self.key),
                Mode::Write => !self.released && self.failure.is_none(),
            },
            None => false,
        }
    }

    // =========================================================================
    // I/O
    // =========================================================================

    /// Append `data` to the payload
    ///
    /// `offset` must be `Some(0)` for the first write and afterwards either
    /// `None` (append) or the current end. Exceeding the slot aborts the
    /// whole transfer.
    pub fn write(
        &mut self,
        data: Bytes,
        offset: Option<u64>,
        callback: Option<WriteCallback>,
    ) -> Result<RequestId> {
        if self.mode != Mode::Write {
            return Err(StoreError::InvalidState(
                "write on a read transfer".to_string(),
            ));
        }
        if self.released {
            return Err(StoreError::InvalidState(
                "write on an aborted transfer".to_string(),
            ));
        }
        if let Some(reason) = &self.failure {
            return Err(StoreError::InvalidState(format!(
                "write on a failed transfer: {}",
                reason
            )));
        }

        match offset {
            Some(at) if at != self.offset_in_payload => {
                return Err(StoreError::InvalidState(format!(
                    "non-sequential write at {} (expected {})",
                    at, self.offset_in_payload
                )));
            }
            None if !self.appending => {
                return Err(StoreError::InvalidState(
                    "first write must be at offset 0".to_string(),
                ));
            }
            _ => {}
        }

        let end = self.offset_in_payload + data.len() as u64;
        if end > self.payload_end {
            tracing::warn!(
                slot = self.slot,
                size = end,
                limit = self.payload_end,
                expected = ?self.expected_end,
                "write exceeds slot; aborting transfer"
            );
            self.abort(format!("payload of {} bytes exceeds slot", end));
            return Err(StoreError::SizeRejected {
                size: end,
                min: 0,
                max: self.payload_end,
            });
        }

        let disk = self.disk()?;
        let id = self.take_id();
        let request = IoRequest {
            id,
            op: IoOp::Write {
                offset: self.disk_offset + self.offset_in_payload,
                data: data.clone(),
            },
            reply: self.reply.clone(),
        };
        if let Err(e) = disk.submit(request) {
            self.abort(format!("write submission failed: {}", e));
            return Err(e);
        }

        self.crc.update(&data);
        self.offset_in_payload = end;
        self.appending = true;
        self.pending.insert(id, Pending::Write(callback));
        Ok(id)
    }

    /// Queue a write at an absolute file offset outside the payload
    ///
    /// Lands before the entry is committed. Not counted as payload and
    /// never reported to a callback; a failure fails the transfer.
    pub(crate) fn write_header(&mut self, offset: u64, data: Bytes) -> Result<RequestId> {
        let disk = self.disk()?;
        let id = self.take_id();
        disk.submit(IoRequest {
            id,
            op: IoOp::Write { offset, data },
            reply: self.reply.clone(),
        })?;
        self.pending.insert(id, Pending::Header);
        Ok(id)
    }

    /// Read up to `len` payload bytes starting at `offset`
    pub fn read(&mut self, offset: u64, len: usize, callback: ReadCallback) -> Result<RequestId> {
        if self.mode != Mode::Read {
            return Err(StoreError::InvalidState(
                "read on a write transfer".to_string(),
            ));
        }

        let id = self.take_id();
        if offset >= self.payload_end || len == 0 {
            self.pending.insert(id, Pending::Read(callback));
            crate::io::complete(&self.reply, id, Ok(IoOutcome::Read(Bytes::new())));
            return Ok(id);
        }

        let len = (len as u64).min(self.payload_end - offset) as usize;
        let disk = self.disk()?;
        disk.submit(IoRequest {
            id,
            op: IoOp::Read {
                offset: self.disk_offset + offset,
                len,
            },
            reply: self.reply.clone(),
        })?;

        self.offset_in_payload = self.offset_in_payload.max(offset + len as u64);
        self.pending.insert(id, Pending::Read(callback));
        Ok(id)
    }

    /// Run callbacks for completions that have already arrived
    pub fn poll(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(completion) = self.completions.try_recv() {
            self.dispatch(completion);
            handled += 1;
        }
        handled
    }

    /// Block until every submitted request has completed
    pub fn wait(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.io_timeout;
        while !self.pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.completions.recv_timeout(remaining) {
                Ok(completion) => self.dispatch(completion),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(StoreError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{} I/O requests still pending", self.pending.len()),
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Finish the transfer
    ///
    /// For writes, `WroteAll` waits for outstanding writes and publishes the
    /// entry; any failure discards the slot and is returned. Every other
    /// reason releases the slot.
    pub fn close(mut self, how: CloseHow) -> Result<Closed> {
        let result = match self.mode {
            Mode::Write => self.close_write(how),
            Mode::Read => self.close_read(how),
        };
        self.released = true;
        tracing::debug!(slot = self.slot, ?how, ok = result.is_ok(), "closed transfer");
        result
    }

    fn close_write(&mut self, how: CloseHow) -> Result<Closed> {
        if self.released {
            return Err(StoreError::InvalidState(format!(
                "write already aborted: {}",
                self.failure.as_deref().unwrap_or("unknown reason")
            )));
        }

        if how != CloseHow::WroteAll {
            self.abort(format!("closed with {:?}", how));
            return match how {
                CloseHow::ReaderDone => Err(StoreError::InvalidState(
                    "reader close on a write transfer".to_string(),
                )),
                _ => Ok(self.closed(how)),
            };
        }

        if let Err(e) = self.wait() {
            self.abort(e.to_string());
            return Err(e);
        }
        if let Some(reason) = self.failure.clone() {
            self.abort(reason.clone());
            return Err(StoreError::Io(io::Error::new(io::ErrorKind::Other, reason)));
        }
        if self.offset_in_payload == 0 {
            self.abort("closed without payload".to_string());
            return Err(StoreError::InvalidState(
                "cannot commit an empty payload".to_string(),
            ));
        }

        let target = self.target()?;
        self.basics.payload_size = self.offset_in_payload;
        let payload_crc = self.crc.clone().finalize();
        if let Err(e) = target.commit_write(self.slot, &self.key, &self.basics, payload_crc) {
            tracing::error!(slot = self.slot, error = %e, "failed to commit write");
            target.abort_write(self.slot);
            self.released = true;
            return Err(e);
        }
        self.released = true;
        Ok(self.closed(how))
    }

    fn close_read(&mut self, how: CloseHow) -> Result<Closed> {
        self.pending.clear();
        if let Some(target) = self.target.upgrade() {
            target.close_read(self.slot);
        }
        self.released = true;
        if how == CloseHow::WroteAll {
            return Err(StoreError::InvalidState(
                "writer close on a read transfer".to_string(),
            ));
        }
        Ok(self.closed(how))
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn take_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn target(&self) -> Result<Arc<dyn TransferTarget>> {
        self.target.upgrade().ok_or_else(|| {
            StoreError::Unavailable(format!("backend {} is gone", self.backend))
        })
    }

    fn disk(&self) -> Result<Arc<dyn DiskFile>> {
        self.target()?.disk()
    }

    fn closed(&self, how: CloseHow) -> Closed {
        Closed {
            how,
            backend: self.backend,
            slot: self.slot,
            basics: self.basics,
        }
    }

    fn dispatch(&mut self, completion: IoCompletion) {
        let Some(pending) = self.pending.remove(&completion.id) else {
            tracing::debug!(id = completion.id, "ignoring unknown completion");
            return;
        };
        let target = self.target.upgrade();

        match pending {
            Pending::Read(callback) => {
                let result = completion.result.map_err(StoreError::from).map(|outcome| match outcome {
                    IoOutcome::Read(bytes) => bytes,
                    IoOutcome::Wrote(_) => Bytes::new(),
                });
                if let Some(target) = &target {
                    let bytes = result.as_ref().map(|b| b.len()).unwrap_or(0);
                    target.record_io(IoKind::Read, bytes, result.is_ok());
                }
                callback(result);
            }
            Pending::Write(callback) => {
                let result = completion.result.map_err(StoreError::from).map(|outcome| match outcome {
                    IoOutcome::Wrote(n) => n,
                    IoOutcome::Read(_) => 0,
                });
                if let Err(e) = &result {
                    tracing::error!(slot = self.slot, error = %e, "slot write failed");
                    self.failure.get_or_insert_with(|| e.to_string());
                }
                if let Some(target) = &target {
                    target.record_io(IoKind::Write, *result.as_ref().unwrap_or(&0), result.is_ok());
                }
                if let Some(callback) = callback {
                    callback(result);
                }
            }
            Pending::Header => {
                if let Err(e) = completion.result {
                    tracing::error!(slot = self.slot, error = %e, "slot header write failed");
                    self.failure.get_or_insert_with(|| e.to_string());
                    if let Some(target) = &target {
                        target.record_io(IoKind::Write, 0, false);
                    }
                }
            }
        }
    }

    /// Drain outstanding writes and give the slot back
    fn abort(&mut self, reason: String) {
        if self.released {
            return;
        }
        if self.mode == Mode::Write {
            if let Err(e) = self.wait() {
                tracing::error!(slot = self.slot, error = %e, "abandoning slot with writes in flight");
            }
        }
        self.failure.get_or_insert(reason);
        if let Some(target) = self.target.upgrade() {
            match self.mode {
                Mode::Write => target.abort_write(self.slot),
                Mode::Read => target.close_read(self.slot),
            }
        }
        self.released = true;
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        if !self.released {
            tracing::debug!(slot = self.slot, mode = ?self.mode, "releasing dropped transfer");
            self.abort("transfer dropped".to_string());
        }
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("backend", &self.backend)
            .field("slot", &self.slot)
            .field("mode", &self.mode)
            .field("offset", &self.offset_in_payload)
            .field("payload_end", &self.payload_end)
            .field("in_flight", &self.pending.len())
            .finish()
    }
}
