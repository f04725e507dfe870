//! Core data types for the Tempora storage layer
//!
//! This module defines the fundamental types used throughout the storage
//! and recovery layer:
//! - `Fingerprint`: 64-bit series identifier, hex-encoded for file paths
//! - `Metric`: the label set identifying a series
//! - `TimeRange`: first/last timestamp bounds of an archived series
//! - `MemorySeries`: per-series recovery state recovered from the checkpoint

use chrono::Utc;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use crate::storage::chunk::ChunkDescriptor;
use crate::storage::error::StorageError;

/// Unix timestamp in milliseconds
pub type Timestamp = i64;

/// Current wall-clock time in milliseconds
pub fn now() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// Number of hex digits in a rendered fingerprint
pub const FP_HEX_LEN: usize = 16;

/// Opaque 64-bit identifier of a series
///
/// Rendered as a zero-padded lowercase 16-hex-digit string; the leading
/// digits name the shard directory and the rest form the series file stem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != FP_HEX_LEN {
            return Err(StorageError::Corruption(format!(
                "Fingerprint must be {} hex digits, got {:?}",
                FP_HEX_LEN, s
            )));
        }
        let value = u64::from_str_radix(s, 16).map_err(|e| {
            StorageError::Corruption(format!("Invalid fingerprint {:?}: {}", s, e))
        })?;
        Ok(Fingerprint(value))
    }
}

// Fingerprints key JSON-persisted index maps, so they serialize as their
// hex string form rather than as a number.
impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FpVisitor;

        impl Visitor<'_> for FpVisitor {
            type Value = Fingerprint;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a {}-digit hex string", FP_HEX_LEN)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Fingerprint, E> {
                v.parse().map_err(|e: StorageError| E::custom(e.to_string()))
            }
        }

        deserializer.deserialize_str(FpVisitor)
    }
}

/// The label set identifying a series
///
/// Labels are kept sorted by name so that rendering and fingerprinting are
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    labels: BTreeMap<String, String>,
}

impl Metric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: add a label
    pub fn label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    /// Get a label value by name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    /// Iterate over (name, value) pairs in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Compute the canonical fingerprint of this label set (FNV-1a 64)
    ///
    /// The steady-state writer derives series file names from this; during
    /// recovery fingerprints come from the file names instead.
    pub fn fingerprint(&self) -> Fingerprint {
        const OFFSET: u64 = 0xcbf29ce484222325;
        const PRIME: u64 = 0x100000001b3;

        let mut hash = OFFSET;
        let mut byte = |b: u8| {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(PRIME);
        };
        for (name, value) in &self.labels {
            for b in name.bytes() {
                byte(b);
            }
            byte(0xff);
            for b in value.bytes() {
                byte(b);
            }
            byte(0xff);
        }
        Fingerprint(hash)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.labels.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", name, value)?;
        }
        write!(f, "}}")
    }
}

/// First/last timestamp bounds of an archived series (closed interval)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// First timestamp covered, in milliseconds
    pub first: Timestamp,
    /// Last timestamp covered, in milliseconds
    pub last: Timestamp,
}

impl TimeRange {
    pub fn new(first: Timestamp, last: Timestamp) -> Self {
        Self { first, last }
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, timestamp: Timestamp) -> bool {
        timestamp >= self.first && timestamp <= self.last
    }

    /// Check if this range overlaps with another
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.first <= other.last && self.last >= other.first
    }
}

/// Sentinel for `MemorySeries::chunk_descs_offset`: the number of chunks
/// already on disk is unknown.
pub const CHUNK_DESCS_OFFSET_UNKNOWN: isize = -1;

/// Per-series state as recovered from the heads checkpoint
///
/// `chunk_descs` covers the tail of the series. `chunk_descs_offset` is the
/// number of descriptors logically on disk *before* the first one held here
/// (−1 when unknown), and `persist_watermark` counts the leading descriptors
/// of `chunk_descs` that are already mirrored on disk; everything past the
/// watermark exists only in memory.
#[derive(Debug, Clone)]
pub struct MemorySeries {
    /// The label set of the series
    pub metric: Metric,
    /// Ordered chunk descriptors covering the tail of the series
    pub chunk_descs: Vec<ChunkDescriptor>,
    /// On-disk descriptors preceding `chunk_descs[0]`; −1 means unknown
    pub chunk_descs_offset: isize,
    /// Leading descriptors of `chunk_descs` already persisted
    pub persist_watermark: usize,
    /// True iff no open head chunk exists in memory
    pub head_chunk_closed: bool,
    /// Modification time of the series file as last known
    pub mod_time: Option<SystemTime>,
}

impl MemorySeries {
    /// Create a series with no in-memory chunks, as after unarchiving
    pub fn new(metric: Metric) -> Self {
        Self {
            metric,
            chunk_descs: Vec::new(),
            chunk_descs_offset: CHUNK_DESCS_OFFSET_UNKNOWN,
            persist_watermark: 0,
            head_chunk_closed: true,
            mod_time: None,
        }
    }

    /// Number of descriptors currently holding a loaded chunk
    pub fn loaded_chunks(&self) -> usize {
        self.chunk_descs.iter().filter(|cd| cd.chunk.is_some()).count()
    }
}

/// Fingerprint → series map recovered from the heads checkpoint
pub type SeriesMap = HashMap<Fingerprint, MemorySeries>;
