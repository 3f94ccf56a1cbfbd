//! Queued strategy
//!
//! A pool of dedicated I/O threads shares one request queue. With more than
//! one thread, completions for the same file routinely arrive out of order.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{Result, StoreError};

use super::{complete, perform, DiskFile, IoRequest};

/// Hands requests to dedicated disker threads
pub struct QueuedFile {
    file: Arc<File>,
    queue: Mutex<Option<Sender<IoRequest>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
}

impl QueuedFile {
    pub fn new(file: File, path: &Path, workers: usize, max_pending: usize) -> Result<Self> {
        let file = Arc::new(file);
        let pending = Arc::new(AtomicUsize::new(0));
        let (sender, receiver) = channel::unbounded::<IoRequest>();

        let mut handles = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let file = Arc::clone(&file);
            let receiver = receiver.clone();
            let pending = Arc::clone(&pending);
            let handle = std::thread::Builder::new()
                .name(format!("disker-{}", index))
                .spawn(move || disker_loop(file, receiver, pending))?;
            handles.push(handle);
        }

        tracing::info!(
            path = %path.display(),
            workers = handles.len(),
            max_pending,
            "started disker threads"
        );

        Ok(Self {
            file,
            queue: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            pending,
            max_pending: max_pending.max(1),
        })
    }

    /// Stop accepting requests and wait for queued ones to finish
    pub fn shutdown(&self) {
        self.queue.lock().take();
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                tracing::error!("disker thread panicked");
            }
        }
    }
}

fn disker_loop(file: Arc<File>, requests: Receiver<IoRequest>, pending: Arc<AtomicUsize>) {
    for request in requests.iter() {
        let result = perform(&file, &request.op);
        if let Err(e) = &result {
            tracing::error!(id = request.id, error = %e, "queued I/O failed");
        }
        pending.fetch_sub(1, Ordering::AcqRel);
        complete(&request.reply, request.id, result);
    }
}

impl DiskFile for QueuedFile {
    fn submit(&self, request: IoRequest) -> Result<()> {
        let queue = self.queue.lock();
        let sender = queue
            .as_ref()
            .ok_or_else(|| StoreError::Unavailable("disker has shut down".to_string()))?;

        if self.pending.fetch_add(1, Ordering::AcqRel) >= self.max_pending {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!(id = request.id, max_pending = self.max_pending, "shedding I/O request");
            return Err(StoreError::Busy);
        }

        sender.send(request).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            StoreError::Unavailable("disker queue closed".to_string())
        })
    }

    fn load(&self) -> Option<u32> {
        let pending = self.pending.load(Ordering::Acquire).min(self.max_pending);
        Some((pending * 1000 / self.max_pending) as u32)
    }

    fn shed_load(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn needs_dedicated_process(&self) -> bool {
        true
    }

    fn strategy(&self) -> &'static str {
        "queued"
    }
}

impl Drop for QueuedFile {
    fn drop(&mut self) {
        self.shutdown();
    }
}
