//! # Tempora
//!
//! Time-series storage layer with crash recovery and on-disk
//! reconciliation.
//!
//! Series data lives in per-series append-only files of fixed-size chunk
//! records, sharded across directories named by fingerprint prefixes.
//! Evicted series leave entries in two archive indexes; label queries are
//! served by inverted label indexes maintained by an asynchronous sink.
//! When the store was not shut down cleanly, [`CrashRecovery`] scans the
//! file tree, sanitises every file, reconciles it with the checkpointed
//! in-memory state, prunes dangling index entries, and rebuilds the label
//! indexes.
//!
//! ## Modules
//!
//! - [`storage`]: chunk record codec, file layout, dirty flag, counters
//! - [`index`]: archive indexes and the label index sink
//! - [`recovery`]: the crash recovery driver
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tempora::{
//!     CrashRecovery, DirtyFlag, FileIndex, LabelIndex, LabelIndexSink, MemStats, Metric,
//!     SeriesLayout, SeriesMap, TimeRange,
//! };
//! use std::path::Path;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let base = Path::new("/var/lib/tempora");
//!     let layout = SeriesLayout::new(base, 2);
//!     let dirty = DirtyFlag::new(base);
//!
//!     let archived_metrics: FileIndex<Metric> =
//!         FileIndex::open(base.join("archived_metrics.json"))?;
//!     let archived_ranges: FileIndex<TimeRange> =
//!         FileIndex::open(base.join("archived_ranges.json"))?;
//!     let sink = LabelIndexSink::new(LabelIndex::open(base.join("label_index.json"))?);
//!     let stats = MemStats::new();
//!
//!     // The live map comes from the heads checkpoint loader.
//!     let mut series_map = SeriesMap::new();
//!
//!     if dirty.is_dirty() {
//!         CrashRecovery::new(&layout, &archived_metrics, &archived_ranges, &sink, &dirty, &stats)
//!             .run(&mut series_map)?;
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod index;
pub mod recovery;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    now, read_chunk, read_chunk_descs, write_chunk, ChunkData, ChunkDescriptor, DirtyFlag,
    Fingerprint, MemStats, MemorySeries, Metric, SeriesLayout, SeriesMap, StorageError,
    StorageResult, TimeRange, Timestamp, CHUNK_DESCS_OFFSET_UNKNOWN, CHUNK_HEADER_LEN, CHUNK_LEN,
    CHUNK_LEN_WITH_HEADER, FP_HEX_LEN, ORPHANED_DIR, SERIES_FILE_SUFFIX,
};

pub use index::{ArchiveIndex, FileIndex, LabelIndex, LabelIndexSink, LabelPair};

pub use recovery::CrashRecovery;

pub use config::{Config, ConfigError, LoggingConfig, StorageConfig};
