//! On-disk layout of series files
//!
//! Series files are sharded across `16^D` directories named by the first
//! `D` hex digits of the fingerprint; the remaining `16 − D` digits form
//! the file stem:
//!
//! ```text
//! <base>/
//!   <shard-hex-D-digits>/
//!     <stem-hex-(16−D)-digits>.db   # series file
//!   orphaned/
//!     <shard-hex-D-digits>/
//!       <same filename>             # quarantined by recovery
//! ```

use crate::storage::types::{Fingerprint, FP_HEX_LEN};
use std::path::{Path, PathBuf};

/// Suffix of series file names
pub const SERIES_FILE_SUFFIX: &str = ".db";

/// Name of the quarantine directory under the base path
pub const ORPHANED_DIR: &str = "orphaned";

/// Maps fingerprints to shard directories and file names, and back
#[derive(Debug, Clone)]
pub struct SeriesLayout {
    base_path: PathBuf,
    dir_name_len: usize,
}

impl SeriesLayout {
    /// Create a layout rooted at `base_path` with `dir_name_len` hex
    /// digits of sharding
    ///
    /// # Panics
    /// Panics if `dir_name_len` is not in `1..FP_HEX_LEN`.
    pub fn new(base_path: impl Into<PathBuf>, dir_name_len: usize) -> Self {
        assert!(
            dir_name_len >= 1 && dir_name_len < FP_HEX_LEN,
            "SeriesLayout: dir_name_len must be in 1..{}",
            FP_HEX_LEN
        );
        Self {
            base_path: base_path.into(),
            dir_name_len,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn dir_name_len(&self) -> usize {
        self.dir_name_len
    }

    /// Expected length of a well-formed series file name
    pub fn file_name_len(&self) -> usize {
        FP_HEX_LEN - self.dir_name_len + SERIES_FILE_SUFFIX.len()
    }

    /// Shard directory name for a fingerprint (first `D` hex digits)
    pub fn shard_name(&self, fp: Fingerprint) -> String {
        fp.to_string()[..self.dir_name_len].to_string()
    }

    /// Series file name for a fingerprint (remaining digits plus suffix)
    pub fn file_name(&self, fp: Fingerprint) -> String {
        format!("{}{}", &fp.to_string()[self.dir_name_len..], SERIES_FILE_SUFFIX)
    }

    /// Full path of the series file for a fingerprint
    pub fn series_path(&self, fp: Fingerprint) -> PathBuf {
        self.base_path
            .join(self.shard_name(fp))
            .join(self.file_name(fp))
    }

    /// Quarantine directory for a shard
    pub fn orphaned_dir(&self, shard_name: &str) -> PathBuf {
        self.base_path.join(ORPHANED_DIR).join(shard_name)
    }

    /// Quarantine destination for a file
    pub fn orphaned_path(&self, shard_name: &str, file_name: &str) -> PathBuf {
        self.orphaned_dir(shard_name).join(file_name)
    }

    /// Check that a file name has the well-formed shape: correct total
    /// length and the series suffix
    pub fn is_well_formed_name(&self, file_name: &str) -> bool {
        file_name.len() == self.file_name_len() && file_name.ends_with(SERIES_FILE_SUFFIX)
    }

    /// Recover the fingerprint from a shard directory name and a
    /// well-formed file name; hex digits are accepted in either case
    pub fn fingerprint_from_parts(&self, shard_name: &str, file_name: &str) -> Option<Fingerprint> {
        if !self.is_well_formed_name(file_name) || shard_name.len() != self.dir_name_len {
            return None;
        }
        let stem = &file_name[..file_name.len() - SERIES_FILE_SUFFIX.len()];
        format!("{}{}", shard_name, stem).parse().ok()
    }

    /// All `16^D` candidate shard directories, in order; most may not
    /// exist on disk
    pub fn shard_dirs(&self) -> impl Iterator<Item = PathBuf> + '_ {
        let width = self.dir_name_len;
        (0u64..1 << (4 * width)).map(move |i| {
            self.base_path.join(format!("{:0width$x}", i, width = width))
        })
    }
}
