//! Tempora storage layer
//!
//! On-disk primitives shared by the steady-state engine and crash
//! recovery:
//! - Fixed-size chunk records in per-series append-only files
//! - The sharded directory layout mapping fingerprints to paths
//! - The persisted dirty flag and in-memory accounting counters

pub mod chunk;
pub mod dirty;
pub mod error;
pub mod layout;
pub mod stats;
pub mod types;

pub use chunk::{
    read_chunk, read_chunk_descs, write_chunk, ChunkData, ChunkDescriptor, CHUNK_HEADER_LEN,
    CHUNK_LEN, CHUNK_LEN_WITH_HEADER,
};
pub use dirty::DirtyFlag;
pub use error::{StorageError, StorageResult};
pub use layout::{SeriesLayout, ORPHANED_DIR, SERIES_FILE_SUFFIX};
pub use stats::MemStats;
pub use types::{
    now, Fingerprint, MemorySeries, Metric, SeriesMap, TimeRange, Timestamp,
    CHUNK_DESCS_OFFSET_UNKNOWN, FP_HEX_LEN,
};
