//! File-backed non-volatile memory for the daemon.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::StorageError;
use crate::hal::NvMemory;

/// Flash-sector emulation over a plain file.
///
/// Writes are verified by reading the file back, mirroring the program-and
/// -verify cycle of the real medium.
pub struct FileNv {
    path: PathBuf,
    capacity: usize,
}

impl FileNv {
    /// Open or create the backing file.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            fs::write(&path, vec![0u8; capacity])
                .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
            debug!(path = %path.display(), capacity, "created storage file");
        }
        Ok(Self { path, capacity })
    }
}

impl NvMemory for FileNv {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), StorageError> {
        let data = fs::read(&self.path).map_err(|e| StorageError::ReadFailed(e.to_string()))?;
        if buf.len() > self.capacity {
            return Err(StorageError::ReadFailed("out of bounds".into()));
        }
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = data.get(i).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        if data.len() > self.capacity {
            return Err(StorageError::WriteFailed("record exceeds capacity".into()));
        }
        fs::write(&self.path, data).map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        let readback =
            fs::read(&self.path).map_err(|e| StorageError::ReadFailed(e.to_string()))?;
        if readback != data {
            return Err(StorageError::VerifyFailed);
        }
        Ok(())
    }
}
