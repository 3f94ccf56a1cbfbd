//! Synchronous strategy

use std::fs::File;

use crate::error::Result;

use super::{complete, perform, DiskFile, IoRequest};

/// Performs every request inside `submit`
pub struct BlockingFile {
    file: File,
}

impl BlockingFile {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl DiskFile for BlockingFile {
    fn submit(&self, request: IoRequest) -> Result<()> {
        let result = perform(&self.file, &request.op);
        if let Err(e) = &result {
            tracing::error!(id = request.id, error = %e, "blocking I/O failed");
        }
        complete(&request.reply, request.id, result);
        Ok(())
    }

    fn load(&self) -> Option<u32> {
        None
    }

    fn shed_load(&self) -> bool {
        false
    }

    fn pending(&self) -> usize {
        0
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn needs_dedicated_process(&self) -> bool {
        false
    }

    fn strategy(&self) -> &'static str {
        "blocking"
    }
}
