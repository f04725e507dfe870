//! Archive indexes for evicted series
//!
//! Series evicted from memory leave two index entries behind: fingerprint
//! → metric (authoritative archive membership) and fingerprint → time
//! range. Crash recovery only needs iteration, membership tests and
//! deletes, so the backend is abstracted by the small [`ArchiveIndex`]
//! trait; [`FileIndex`] is the crate's backend, an in-memory map with JSON
//! persistence.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::Fingerprint;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Key/value store keyed by fingerprint, as needed by recovery
///
/// All operations take `&self` so entries can be deleted from inside a
/// `for_each` over the same index.
pub trait ArchiveIndex<V> {
    /// Visit every entry. The callback receives a decoded copy of each
    /// value, which stays valid across deletes; returning an error stops
    /// the iteration and propagates.
    fn for_each(
        &self,
        f: &mut dyn FnMut(Fingerprint, &V) -> StorageResult<()>,
    ) -> StorageResult<()>;

    /// Look up the value for a fingerprint
    fn get(&self, fp: Fingerprint) -> StorageResult<Option<V>>;

    /// Membership test
    fn has(&self, fp: Fingerprint) -> StorageResult<bool>;

    /// Insert or replace an entry
    fn insert(&self, fp: Fingerprint, value: V) -> StorageResult<()>;

    /// Delete an entry, returning whether it was present. Deleting an
    /// absent key is not an error.
    fn delete(&self, fp: Fingerprint) -> StorageResult<bool>;

    /// Number of entries
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Serialization format for JSON persistence
#[derive(Serialize, Deserialize)]
struct FileIndexData<V> {
    version: u32,
    entries: HashMap<Fingerprint, V>,
}

/// In-memory fingerprint index with JSON persistence
///
/// Follows the layout of the other persisted indexes: loaded in the
/// constructor, dirty-tracked, written back by `persist` and best-effort
/// on drop. `in_memory` builds an unpersisted instance for tests and
/// embedders with their own backend.
#[derive(Debug)]
pub struct FileIndex<V: Clone + Serialize + DeserializeOwned> {
    entries: RwLock<HashMap<Fingerprint, V>>,
    path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl<V> FileIndex<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    /// Open an index backed by a JSON file, loading it if present
    pub fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let entries = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            entries: RwLock::new(entries),
            path: Some(path),
            dirty: AtomicBool::new(false),
        })
    }

    /// Create an index with no backing file
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            path: None,
            dirty: AtomicBool::new(false),
        }
    }

    fn load_from_file(path: &Path) -> StorageResult<HashMap<Fingerprint, V>> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let data: FileIndexData<V> = serde_json::from_reader(reader).map_err(|e| {
            StorageError::Serialization(format!("Failed to load index {:?}: {}", path, e))
        })?;

        Ok(data.entries)
    }

    /// Persist the index to its JSON file, if it has one and has changed
    pub fn persist(&self) -> StorageResult<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = FileIndexData {
            version: 1,
            entries: self.read_guard()?.clone(),
        };

        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &data).map_err(|e| {
            StorageError::Serialization(format!("Failed to persist index {:?}: {}", path, e))
        })?;

        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    fn read_guard(&self) -> StorageResult<RwLockReadGuard<'_, HashMap<Fingerprint, V>>> {
        self.entries
            .read()
            .map_err(|e| StorageError::Index(format!("poisoned index lock: {}", e)))
    }

    fn write_guard(&self) -> StorageResult<RwLockWriteGuard<'_, HashMap<Fingerprint, V>>> {
        self.entries
            .write()
            .map_err(|e| StorageError::Index(format!("poisoned index lock: {}", e)))
    }
}

impl<V> ArchiveIndex<V> for FileIndex<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    fn for_each(
        &self,
        f: &mut dyn FnMut(Fingerprint, &V) -> StorageResult<()>,
    ) -> StorageResult<()> {
        // Iterate over a key snapshot so the callback may delete entries,
        // including from this very index. Keys are visited in order to
        // keep iteration deterministic.
        let mut keys: Vec<Fingerprint> = self.read_guard()?.keys().copied().collect();
        keys.sort_unstable();

        for fp in keys {
            let value = match self.read_guard()?.get(&fp) {
                Some(value) => value.clone(),
                // Deleted by an earlier callback invocation
                None => continue,
            };
            f(fp, &value)?;
        }
        Ok(())
    }

    fn get(&self, fp: Fingerprint) -> StorageResult<Option<V>> {
        Ok(self.read_guard()?.get(&fp).cloned())
    }

    fn has(&self, fp: Fingerprint) -> StorageResult<bool> {
        Ok(self.read_guard()?.contains_key(&fp))
    }

    fn insert(&self, fp: Fingerprint, value: V) -> StorageResult<()> {
        self.write_guard()?.insert(fp, value);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn delete(&self, fp: Fingerprint) -> StorageResult<bool> {
        let removed = self.write_guard()?.remove(&fp).is_some();
        if removed {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(removed)
    }

    fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or(0)
    }
}

impl<V: Clone + Serialize + DeserializeOwned> Drop for FileIndex<V> {
    fn drop(&mut self) {
        // Best-effort persist, mirroring the other persisted indexes
        if self.path.is_some() && self.dirty.load(Ordering::Acquire) {
            if let Ok(entries) = self.entries.get_mut() {
                let data = FileIndexData {
                    version: 1,
                    entries: std::mem::take(entries),
                };
                if let Some(path) = &self.path {
                    if let Ok(file) = File::create(path) {
                        let _ = serde_json::to_writer_pretty(BufWriter::new(file), &data);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{Metric, TimeRange};
    use tempfile::tempdir;

    #[test]
    fn test_basic_operations() {
        let index: FileIndex<TimeRange> = FileIndex::in_memory();
        let fp = Fingerprint(1);

        assert!(!index.has(fp).unwrap());
        assert!(index.get(fp).unwrap().is_none());

        index.insert(fp, TimeRange::new(10, 20)).unwrap();
        assert!(index.has(fp).unwrap());
        assert_eq!(index.get(fp).unwrap(), Some(TimeRange::new(10, 20)));
        assert_eq!(index.len(), 1);

        assert!(index.delete(fp).unwrap());
        assert!(!index.delete(fp).unwrap()); // absent key is not an error
        assert!(index.is_empty());
    }

    #[test]
    fn test_for_each_visits_in_order() {
        let index: FileIndex<TimeRange> = FileIndex::in_memory();
        for i in [3u64, 1, 2] {
            index.insert(Fingerprint(i), TimeRange::new(0, i as i64)).unwrap();
        }

        let mut seen = Vec::new();
        index
            .for_each(&mut |fp, _| {
                seen.push(fp);
                Ok(())
            })
            .unwrap();

        assert_eq!(seen, vec![Fingerprint(1), Fingerprint(2), Fingerprint(3)]);
    }

    #[test]
    fn test_for_each_early_exit() {
        let index: FileIndex<TimeRange> = FileIndex::in_memory();
        for i in 0..5u64 {
            index.insert(Fingerprint(i), TimeRange::new(0, 0)).unwrap();
        }

        let mut visited = 0;
        let result = index.for_each(&mut |_, _| {
            visited += 1;
            if visited == 2 {
                Err(StorageError::Index("stop".to_string()))
            } else {
                Ok(())
            }
        });

        assert!(result.is_err());
        assert_eq!(visited, 2);
    }

    #[test]
    fn test_delete_during_iteration() {
        let index: FileIndex<TimeRange> = FileIndex::in_memory();
        for i in 0..4u64 {
            index.insert(Fingerprint(i), TimeRange::new(0, 0)).unwrap();
        }

        // Each callback deletes its own entry and the next one; deleted
        // entries must be skipped, and iterated values stay usable.
        let mut seen = Vec::new();
        index
            .for_each(&mut |fp, range| {
                seen.push((fp, *range));
                index.delete(fp).unwrap();
                index.delete(Fingerprint(fp.0 + 1)).unwrap();
                Ok(())
            })
            .unwrap();

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, Fingerprint(0));
        assert_eq!(seen[1].0, Fingerprint(2));
        assert!(index.is_empty());
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archived_metrics.json");
        let fp = Fingerprint(0xbeef);

        {
            let index: FileIndex<Metric> = FileIndex::open(&path).unwrap();
            index
                .insert(fp, Metric::new().label("job", "api"))
                .unwrap();
            index.persist().unwrap();
        }

        {
            let index: FileIndex<Metric> = FileIndex::open(&path).unwrap();
            assert_eq!(index.len(), 1);
            assert_eq!(
                index.get(fp).unwrap().unwrap().get("job"),
                Some("api")
            );
        }
    }

    #[test]
    fn test_persist_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archived_ranges.json");

        {
            let index: FileIndex<TimeRange> = FileIndex::open(&path).unwrap();
            index.insert(Fingerprint(7), TimeRange::new(1, 2)).unwrap();
            // No explicit persist
        }

        let index: FileIndex<TimeRange> = FileIndex::open(&path).unwrap();
        assert_eq!(index.get(Fingerprint(7)).unwrap(), Some(TimeRange::new(1, 2)));
    }
}
