//! Inverted label indexes
//!
//! Two maps answer label queries: label name → set of values, and label
//! pair → set of fingerprints. The steady-state engine never mutates them
//! synchronously; all writes go through [`LabelIndexSink`], a worker
//! thread consuming an unbounded queue, so indexing cannot stall the
//! ingest path. A flush barrier makes all prior enqueues visible before it
//! returns — crash recovery issues it exactly once, at the end of the
//! label rebuild.

use crate::index::LabelPair;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Fingerprint, Metric};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

/// Inverted index over label names, values and fingerprints
#[derive(Debug)]
pub struct LabelIndex {
    /// label name → known values
    name_to_values: HashMap<String, HashSet<String>>,
    /// label pair → fingerprints carrying it
    pair_to_fps: HashMap<LabelPair, HashSet<Fingerprint>>,
    /// Path to persistence file
    path: Option<PathBuf>,
    /// Track if modified since last save
    dirty: bool,
}

/// Serialization format for JSON persistence
///
/// Pairs are flattened to `name=value` strings so they can key a JSON
/// object; `name_to_values` is derivable and not stored.
#[derive(Serialize, Deserialize)]
struct LabelIndexData {
    version: u32,
    pairs: HashMap<String, Vec<Fingerprint>>,
}

impl LabelIndex {
    /// Open a label index backed by a JSON file, loading it if present
    pub fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let mut index = Self {
            name_to_values: HashMap::new(),
            pair_to_fps: HashMap::new(),
            path: Some(path.clone()),
            dirty: false,
        };

        if path.exists() {
            index.load_from_file(&path)?;
        }
        Ok(index)
    }

    /// Create a label index with no backing file
    pub fn in_memory() -> Self {
        Self {
            name_to_values: HashMap::new(),
            pair_to_fps: HashMap::new(),
            path: None,
            dirty: false,
        }
    }

    fn load_from_file(&mut self, path: &Path) -> StorageResult<()> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let data: LabelIndexData = serde_json::from_reader(reader).map_err(|e| {
            StorageError::Serialization(format!("Failed to load label index: {}", e))
        })?;

        for (key, fps) in data.pairs {
            let (name, value) = key.split_once('=').ok_or_else(|| {
                StorageError::Serialization(format!("Malformed label pair key {:?}", key))
            })?;
            let pair = LabelPair::new(name, value);
            self.name_to_values
                .entry(pair.name.clone())
                .or_default()
                .insert(pair.value.clone());
            self.pair_to_fps.insert(pair, fps.into_iter().collect());
        }
        Ok(())
    }

    /// Add every label pair of a metric for a fingerprint
    pub fn index_metric(&mut self, fp: Fingerprint, metric: &Metric) {
        for (name, value) in metric.iter() {
            let inserted = self
                .pair_to_fps
                .entry(LabelPair::new(name, value))
                .or_default()
                .insert(fp);
            if inserted {
                self.name_to_values
                    .entry(name.to_string())
                    .or_default()
                    .insert(value.to_string());
                self.dirty = true;
            }
        }
    }

    /// Remove every label pair of a metric for a fingerprint
    ///
    /// A value disappears from the name index once no fingerprint carries
    /// its pair any more; empty sets are pruned.
    pub fn unindex_metric(&mut self, fp: Fingerprint, metric: &Metric) {
        for (name, value) in metric.iter() {
            let pair = LabelPair::new(name, value);
            let emptied = match self.pair_to_fps.get_mut(&pair) {
                Some(fps) => {
                    if fps.remove(&fp) {
                        self.dirty = true;
                    }
                    fps.is_empty()
                }
                None => continue,
            };
            if emptied {
                self.pair_to_fps.remove(&pair);
                if let Some(values) = self.name_to_values.get_mut(name) {
                    values.remove(value);
                    if values.is_empty() {
                        self.name_to_values.remove(name);
                    }
                }
            }
        }
    }

    /// All values known for a label name, sorted
    pub fn values_for_name(&self, name: &str) -> Vec<String> {
        let mut values: Vec<String> = self
            .name_to_values
            .get(name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        values.sort_unstable();
        values
    }

    /// All fingerprints carrying a label pair, sorted
    pub fn fingerprints_for_pair(&self, pair: &LabelPair) -> Vec<Fingerprint> {
        let mut fps: Vec<Fingerprint> = self
            .pair_to_fps
            .get(pair)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        fps.sort_unstable();
        fps
    }

    /// All indexed label names, sorted
    pub fn label_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.name_to_values.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Number of distinct label pairs indexed
    pub fn pair_count(&self) -> usize {
        self.pair_to_fps.len()
    }

    /// Persist the index to its JSON file, if it has one and has changed
    pub fn persist(&mut self) -> StorageResult<()> {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => return Ok(()),
        };
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = LabelIndexData {
            version: 1,
            pairs: self
                .pair_to_fps
                .iter()
                .map(|(pair, fps)| {
                    let mut fps: Vec<Fingerprint> = fps.iter().copied().collect();
                    fps.sort_unstable();
                    (format!("{}={}", pair.name, pair.value), fps)
                })
                .collect(),
        };

        let file = File::create(&path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &data).map_err(|e| {
            StorageError::Serialization(format!("Failed to persist label index: {}", e))
        })?;

        self.dirty = false;
        Ok(())
    }
}

/// Operations consumed by the sink worker
enum SinkOp {
    Index(Fingerprint, Metric),
    Unindex(Fingerprint, Metric),
    Flush(mpsc::Sender<()>),
    Shutdown,
}

/// Asynchronous writer for the label indexes
///
/// Producers enqueue index/unindex operations; a dedicated worker thread
/// applies them in order. `flush` is the barrier: when it returns, every
/// operation enqueued before it has been applied.
pub struct LabelIndexSink {
    tx: mpsc::Sender<SinkOp>,
    index: Arc<RwLock<LabelIndex>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LabelIndexSink {
    /// Start the worker thread over the given index
    pub fn new(index: LabelIndex) -> Self {
        let index = Arc::new(RwLock::new(index));
        let (tx, rx) = mpsc::channel();

        let worker_index = Arc::clone(&index);
        let handle = thread::spawn(move || sink_loop(rx, worker_index));

        Self {
            tx,
            index,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue indexing of a metric's label pairs
    pub fn index_metric(&self, fp: Fingerprint, metric: Metric) -> StorageResult<()> {
        self.send(SinkOp::Index(fp, metric))
    }

    /// Enqueue removal of a metric's label pairs
    pub fn unindex_metric(&self, fp: Fingerprint, metric: Metric) -> StorageResult<()> {
        self.send(SinkOp::Unindex(fp, metric))
    }

    /// Barrier: block until all previously enqueued operations are applied
    pub fn flush(&self) -> StorageResult<()> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.send(SinkOp::Flush(ack_tx))?;
        ack_rx
            .recv()
            .map_err(|_| StorageError::Index("label index sink worker is gone".to_string()))
    }

    /// Flush, then persist the underlying index
    pub fn persist(&self) -> StorageResult<()> {
        self.flush()?;
        self.write_index()?.persist()
    }

    /// All fingerprints carrying a label pair, sorted
    pub fn fingerprints_for_pair(&self, pair: &LabelPair) -> StorageResult<Vec<Fingerprint>> {
        Ok(self.read_index()?.fingerprints_for_pair(pair))
    }

    /// All values known for a label name, sorted
    pub fn values_for_name(&self, name: &str) -> StorageResult<Vec<String>> {
        Ok(self.read_index()?.values_for_name(name))
    }

    /// All indexed label names, sorted
    pub fn label_names(&self) -> StorageResult<Vec<String>> {
        Ok(self.read_index()?.label_names())
    }

    fn send(&self, op: SinkOp) -> StorageResult<()> {
        self.tx
            .send(op)
            .map_err(|_| StorageError::Index("label index sink queue is closed".to_string()))
    }

    fn read_index(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, LabelIndex>> {
        self.index
            .read()
            .map_err(|e| StorageError::Index(format!("poisoned label index lock: {}", e)))
    }

    fn write_index(&self) -> StorageResult<std::sync::RwLockWriteGuard<'_, LabelIndex>> {
        self.index
            .write()
            .map_err(|e| StorageError::Index(format!("poisoned label index lock: {}", e)))
    }
}

impl Drop for LabelIndexSink {
    fn drop(&mut self) {
        let _ = self.tx.send(SinkOp::Shutdown);
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn sink_loop(rx: mpsc::Receiver<SinkOp>, index: Arc<RwLock<LabelIndex>>) {
    while let Ok(op) = rx.recv() {
        match op {
            SinkOp::Index(fp, metric) => match index.write() {
                Ok(mut index) => index.index_metric(fp, &metric),
                Err(e) => tracing::error!("Label index lock poisoned, dropping op: {}", e),
            },
            SinkOp::Unindex(fp, metric) => match index.write() {
                Ok(mut index) => index.unindex_metric(fp, &metric),
                Err(e) => tracing::error!("Label index lock poisoned, dropping op: {}", e),
            },
            SinkOp::Flush(ack) => {
                // The queue is FIFO; everything enqueued before this
                // barrier has been applied by now.
                let _ = ack.send(());
            }
            SinkOp::Shutdown => break,
        }
    }
}
