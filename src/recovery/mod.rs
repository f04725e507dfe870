//! Crash recovery and on-disk reconciliation
//!
//! Restores a self-consistent view of the three sources of truth after an
//! unclean shutdown: the per-series chunk files on disk, the live series
//! recovered from the heads checkpoint, and the archive and label
//! indexes.
//!
//! The entry point is [`CrashRecovery::run`]. Files recovery refuses to
//! trust end up under `orphaned/<shard>/`; every loss is announced in the
//! log, never silently absorbed.

mod archive_cleanup;
mod driver;
mod sanitize;

pub use driver::CrashRecovery;
