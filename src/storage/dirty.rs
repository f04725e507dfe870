//! Persisted dirty flag
//!
//! A marker file next to the data directory records whether the store was
//! shut down cleanly. The steady-state engine sets it while mutations are
//! in flight; crash recovery runs whenever it is found set at startup and
//! clears it only after the whole pipeline completes.

use crate::storage::error::StorageResult;
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the marker file under the base path
const DIRTY_FILE_NAME: &str = "DIRTY";

/// File-presence dirty flag
#[derive(Debug)]
pub struct DirtyFlag {
    path: PathBuf,
}

impl DirtyFlag {
    pub fn new(base_path: &Path) -> Self {
        Self {
            path: base_path.join(DIRTY_FILE_NAME),
        }
    }

    /// Whether the store is marked dirty
    pub fn is_dirty(&self) -> bool {
        self.path.exists()
    }

    /// Mark the store dirty; idempotent
    pub fn mark_dirty(&self) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::File::create(&self.path)?;
        Ok(())
    }

    /// Mark the store clean; idempotent
    pub fn mark_clean(&self) -> StorageResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
