//! Process-wide memory accounting
//!
//! Tracks how many chunk descriptors and loaded chunks are held in memory
//! across all series. The totals are adjusted by whichever code adds or
//! releases descriptors; during recovery that is the recovery driver.
//! Atomics, because the label-index sink thread runs concurrently.

use std::sync::atomic::{AtomicI64, Ordering};

/// Atomic totals of in-memory chunk descriptors and loaded chunks
#[derive(Debug, Default)]
pub struct MemStats {
    mem_chunk_descs: AtomicI64,
    mem_chunks: AtomicI64,
}

impl MemStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chunk_descs(&self, n: i64) {
        self.mem_chunk_descs.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sub_chunk_descs(&self, n: i64) {
        self.mem_chunk_descs.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn add_chunks(&self, n: i64) {
        self.mem_chunks.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sub_chunks(&self, n: i64) {
        self.mem_chunks.fetch_sub(n, Ordering::Relaxed);
    }

    /// Current total of in-memory chunk descriptors
    pub fn chunk_descs(&self) -> i64 {
        self.mem_chunk_descs.load(Ordering::Relaxed)
    }

    /// Current total of loaded chunks
    pub fn chunks(&self) -> i64 {
        self.mem_chunks.load(Ordering::Relaxed)
    }
}
