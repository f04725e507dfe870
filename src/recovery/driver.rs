//! Crash recovery driver
//!
//! Runs once at startup when the persistent layout was not cleanly shut
//! down, and restores a self-consistent view of the series file tree, the
//! checkpointed live series, and the archive and label indexes:
//!
//! 1. Mark the persistence dirty (if it is not already).
//! 2. Scan every shard directory and sanitise every series file,
//!    collecting the set of fingerprints seen on disk.
//! 3. Repair live series whose file has vanished.
//! 4. Clean up the archive indexes against the seen set and the live map.
//! 5. Rebuild the label indexes from the live and archived metrics and
//!    wait for the sink to drain.
//! 6. Clear the dirty flag.
//!
//! Recovery is single-threaded and synchronous; the label index sink is
//! its only concurrent collaborator. Every repair is idempotent, so a
//! crash during recovery leaves a state a subsequent run can handle.

use crate::index::{ArchiveIndex, LabelIndexSink};
use crate::storage::dirty::DirtyFlag;
use crate::storage::error::StorageResult;
use crate::storage::layout::SeriesLayout;
use crate::storage::stats::MemStats;
use crate::storage::types::{Fingerprint, Metric, SeriesMap, TimeRange};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;

/// Orchestrates crash recovery over one data directory
pub struct CrashRecovery<'a> {
    pub(super) layout: &'a SeriesLayout,
    pub(super) archived_metrics: &'a dyn ArchiveIndex<Metric>,
    pub(super) archived_ranges: &'a dyn ArchiveIndex<TimeRange>,
    pub(super) label_sink: &'a LabelIndexSink,
    pub(super) dirty: &'a DirtyFlag,
    pub(super) stats: &'a MemStats,
    pub(super) pedantic_checks: bool,
}

impl<'a> CrashRecovery<'a> {
    pub fn new(
        layout: &'a SeriesLayout,
        archived_metrics: &'a dyn ArchiveIndex<Metric>,
        archived_ranges: &'a dyn ArchiveIndex<TimeRange>,
        label_sink: &'a LabelIndexSink,
        dirty: &'a DirtyFlag,
        stats: &'a MemStats,
    ) -> Self {
        Self {
            layout,
            archived_metrics,
            archived_ranges,
            label_sink,
            dirty,
            stats,
            pedantic_checks: false,
        }
    }

    /// Builder method: force the full reconciliation path even for series
    /// that look consistent (a debugging aid)
    pub fn pedantic_checks(mut self, enabled: bool) -> Self {
        self.pedantic_checks = enabled;
        self
    }

    /// Run crash recovery to completion
    ///
    /// `series_map` is the live map recovered from the heads checkpoint;
    /// it is repaired in place. On success the dirty flag is cleared. An
    /// error leaves the flag set, so the next startup recovers again.
    pub fn run(&self, series_map: &mut SeriesMap) -> StorageResult<()> {
        tracing::warn!("Starting crash recovery. The store is inoperational until complete.");
        if !self.dirty.is_dirty() {
            self.dirty.mark_dirty()?;
        }

        let mut fps_seen: HashSet<Fingerprint> = HashSet::new();
        let mut count: u64 = 0;

        tracing::info!("Scanning series files.");
        for dir in self.layout.shard_dirs() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                if let Some(fp) = self.sanitize_series(&dir, &entry, series_map) {
                    fps_seen.insert(fp);
                }
                count += 1;
                if count % 10_000 == 0 {
                    tracing::info!("{} files scanned.", count);
                }
            }
        }
        tracing::info!("File scan complete. {} series found.", fps_seen.len());

        tracing::info!("Checking for series without series file.");
        self.check_series_without_file(series_map, &mut fps_seen);
        tracing::info!("Check for series without series file complete.");

        self.clean_up_archive_indexes(series_map, &fps_seen)?;
        self.rebuild_label_indexes(series_map)?;

        self.dirty.mark_clean()?;
        tracing::warn!("Crash recovery complete.");
        Ok(())
    }

    /// Repair live series that have no series file on disk
    ///
    /// A head-closed series with no file is a total loss: it is dropped
    /// from the live map and its archive remnants are purged. A series
    /// with an open head keeps its checkpointed head chunks; only the
    /// persisted prefix is gone, and the loss is announced.
    fn check_series_without_file(
        &self,
        series_map: &mut SeriesMap,
        fps_seen: &mut HashSet<Fingerprint>,
    ) {
        let missing: Vec<Fingerprint> = series_map
            .keys()
            .filter(|fp| !fps_seen.contains(fp))
            .copied()
            .collect();

        for fp in missing {
            let head_chunk_closed = match series_map.get(&fp) {
                Some(s) => s.head_chunk_closed,
                None => continue,
            };

            if head_chunk_closed {
                // Everything including the head chunk was already
                // persisted, but nothing is on disk. The series is lost
                // completely; clean up the remnants.
                let s = match series_map.remove(&fp) {
                    Some(s) => s,
                    None => continue,
                };
                self.stats.sub_chunk_descs(s.chunk_descs.len() as i64);
                self.stats.sub_chunks(s.loaded_chunks() as i64);
                if let Err(e) = self.purge_archived_metric(fp) {
                    // Purging didn't work, so try to unindex the metric,
                    // just in case it is in the label indexes.
                    tracing::error!(
                        "Failed to purge archived metric for fingerprint {}: {}. Unindexing it instead.",
                        fp,
                        e
                    );
                    if let Err(e) = self.label_sink.unindex_metric(fp, s.metric.clone()) {
                        tracing::error!(
                            "Failed to unindex metric for fingerprint {}: {}",
                            fp,
                            e
                        );
                    }
                }
                tracing::warn!("Lost series detected: fingerprint {}, metric {}.", fp, s.metric);
                continue;
            }

            // Only the chunks from the checkpoint survive. Adjust things
            // accordingly.
            let s = match series_map.get_mut(&fp) {
                Some(s) => s,
                None => continue,
            };
            if s.persist_watermark > 0 || s.chunk_descs_offset != 0 {
                let min_lost_chunks = s.persist_watermark as isize + s.chunk_descs_offset;
                if min_lost_chunks <= 0 {
                    tracing::warn!(
                        "Possible loss of chunks for fingerprint {}, metric {}.",
                        fp,
                        s.metric
                    );
                } else {
                    tracing::warn!(
                        "Lost at least {} chunks for fingerprint {}, metric {}.",
                        min_lost_chunks,
                        fp,
                        s.metric
                    );
                }
                let released = s.persist_watermark.min(s.chunk_descs.len());
                let released_loaded = s.chunk_descs[..released]
                    .iter()
                    .filter(|cd| cd.chunk.is_some())
                    .count();
                s.chunk_descs.drain(..released);
                self.stats.sub_chunk_descs(released as i64);
                self.stats.sub_chunks(released_loaded as i64);
                s.persist_watermark = 0;
                s.chunk_descs_offset = 0;
            }
            // Add the fingerprint so that the seen set is complete.
            fps_seen.insert(fp);
        }
    }

    /// Drop a fingerprint from both archive indexes
    pub(super) fn purge_archived_metric(&self, fp: Fingerprint) -> StorageResult<()> {
        self.archived_metrics.delete(fp)?;
        self.archived_ranges.delete(fp)?;
        Ok(())
    }

    /// Re-enqueue every live and archived metric into the label index
    /// sink, then wait for the sink to drain
    fn rebuild_label_indexes(&self, series_map: &SeriesMap) -> StorageResult<()> {
        let mut count: u64 = 0;
        tracing::info!("Rebuilding label indexes.");

        tracing::info!("Indexing metrics in memory.");
        for (fp, s) in series_map.iter() {
            self.label_sink.index_metric(*fp, s.metric.clone())?;
            count += 1;
            if count % 10_000 == 0 {
                tracing::info!("{} metrics queued for indexing.", count);
            }
        }

        tracing::info!("Indexing archived metrics.");
        self.archived_metrics.for_each(&mut |fp, metric| {
            self.label_sink.index_metric(fp, metric.clone())?;
            count += 1;
            if count % 10_000 == 0 {
                tracing::info!("{} metrics queued for indexing.", count);
            }
            Ok(())
        })?;

        tracing::info!("All requests for rebuilding the label indexes queued. Waiting for the sink to drain.");
        self.label_sink.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{FileIndex, LabelIndex, LabelPair};
    use crate::storage::chunk::{
        write_chunk, ChunkData, ChunkDescriptor, CHUNK_LEN_WITH_HEADER,
    };
    use crate::storage::types::{MemorySeries, Timestamp, CHUNK_DESCS_OFFSET_UNKNOWN};
    use std::fs::{File, OpenOptions};
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::SystemTime;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        layout: SeriesLayout,
        archived_metrics: FileIndex<Metric>,
        archived_ranges: FileIndex<TimeRange>,
        sink: LabelIndexSink,
        dirty: DirtyFlag,
        stats: MemStats,
        _dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            Self {
                layout: SeriesLayout::new(dir.path(), 2),
                archived_metrics: FileIndex::in_memory(),
                archived_ranges: FileIndex::in_memory(),
                sink: LabelIndexSink::new(LabelIndex::in_memory()),
                dirty: DirtyFlag::new(dir.path()),
                stats: MemStats::new(),
                _dir: dir,
            }
        }

        fn recovery(&self) -> CrashRecovery<'_> {
            CrashRecovery::new(
                &self.layout,
                &self.archived_metrics,
                &self.archived_ranges,
                &self.sink,
                &self.dirty,
                &self.stats,
            )
        }

        /// Write a series file with one chunk per (first, last) pair and
        /// return its mtime
        fn write_series_file(
            &self,
            fp: Fingerprint,
            bounds: &[(Timestamp, Timestamp)],
        ) -> SystemTime {
            let path = self.layout.series_path(fp);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            let mut file = File::create(&path).unwrap();
            for &(first, last) in bounds {
                write_chunk(&mut file, &ChunkData::new(first, last)).unwrap();
            }
            file.sync_all().unwrap();
            drop(file);
            std::fs::metadata(&path).unwrap().modified().unwrap()
        }

        fn append_bytes(&self, fp: Fingerprint, n: usize) {
            let path = self.layout.series_path(fp);
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&vec![0xab; n]).unwrap();
        }

        fn file_size(&self, fp: Fingerprint) -> u64 {
            std::fs::metadata(self.layout.series_path(fp)).unwrap().len()
        }

        /// All files below the shard directories (not the orphaned tree)
        fn shard_files(&self) -> Vec<PathBuf> {
            let mut files = Vec::new();
            for dir in self.layout.shard_dirs() {
                let entries = match std::fs::read_dir(&dir) {
                    Ok(entries) => entries,
                    Err(_) => continue,
                };
                for entry in entries {
                    files.push(entry.unwrap().path());
                }
            }
            files.sort();
            files
        }
    }

    fn metric(job: &str) -> Metric {
        Metric::new().label("job", job)
    }

    /// An evicted (persisted) descriptor
    fn desc(first: Timestamp, last: Timestamp) -> ChunkDescriptor {
        ChunkDescriptor::evicted(first, last)
    }

    /// A descriptor holding a resident chunk, as checkpointed head chunks do
    fn head_desc(first: Timestamp, last: Timestamp) -> ChunkDescriptor {
        ChunkDescriptor::resident(ChunkData::new(first, last))
    }

    fn live_series(
        metric: Metric,
        chunk_descs: Vec<ChunkDescriptor>,
        offset: isize,
        watermark: usize,
        head_closed: bool,
        mod_time: Option<SystemTime>,
    ) -> MemorySeries {
        let mut s = MemorySeries::new(metric);
        s.chunk_descs = chunk_descs;
        s.chunk_descs_offset = offset;
        s.persist_watermark = watermark;
        s.head_chunk_closed = head_closed;
        s.mod_time = mod_time;
        s
    }

    #[test]
    fn test_aligned_file_consistent_checkpoint_fast_path() {
        // S1: file size 5 chunks, checkpoint claims offset 3 + watermark 2,
        // matching mtime. The fast path must not mutate anything.
        let fx = Fixture::new();
        let fp = Fingerprint(0x01);
        let mtime = fx.write_series_file(fp, &[(10, 20), (20, 30), (30, 40), (40, 50), (50, 60)]);

        let mut map = SeriesMap::new();
        map.insert(
            fp,
            live_series(
                metric("api"),
                vec![desc(40, 50), desc(50, 60), head_desc(60, 70)],
                3,
                2,
                false,
                Some(mtime),
            ),
        );

        fx.recovery().run(&mut map).unwrap();

        let s = &map[&fp];
        assert_eq!(s.chunk_descs_offset, 3);
        assert_eq!(s.persist_watermark, 2);
        assert_eq!(s.chunk_descs.len(), 3);
        assert_eq!(s.mod_time, Some(mtime));
        assert!(!s.head_chunk_closed);
        assert!(!fx.dirty.is_dirty());
    }

    #[test]
    fn test_trailing_garbage_truncated_and_stitched() {
        // S2: same series, but the file carries 17 stray bytes. They must
        // be trimmed and the slow path must stitch file and checkpoint.
        let fx = Fixture::new();
        let fp = Fingerprint(0x02);
        let bounds = [(10, 20), (20, 30), (30, 40), (40, 50), (50, 60)];
        let mtime = fx.write_series_file(fp, &bounds);
        fx.append_bytes(fp, 17);

        let mut map = SeriesMap::new();
        map.insert(
            fp,
            live_series(
                metric("api"),
                vec![desc(40, 50), desc(50, 60), head_desc(60, 70)],
                3,
                2,
                false,
                Some(mtime),
            ),
        );

        fx.recovery().run(&mut map).unwrap();

        assert_eq!(fx.file_size(fp), 5 * CHUNK_LEN_WITH_HEADER as u64);
        let s = &map[&fp];
        // All 5 on-disk descriptors plus the surviving open head
        assert_eq!(s.chunk_descs.len(), 6);
        assert_eq!(s.persist_watermark, 5);
        assert_eq!(s.chunk_descs_offset, 0);
        assert_eq!(s.chunk_descs[5].first_time, 60);
        assert!(!s.head_chunk_closed);
    }

    #[test]
    fn test_missing_file_head_closed_is_lost_series() {
        // S3: head-closed series with no file is a total loss; the live
        // entry goes away and the archive remnants are purged.
        let fx = Fixture::new();
        let fp = Fingerprint(0x02);
        let m = metric("gone");

        let mut map = SeriesMap::new();
        map.insert(fp, live_series(m.clone(), vec![desc(10, 20)], 0, 1, true, None));
        fx.archived_metrics.insert(fp, m.clone()).unwrap();
        fx.archived_ranges.insert(fp, TimeRange::new(10, 20)).unwrap();

        fx.recovery().run(&mut map).unwrap();

        assert!(!map.contains_key(&fp));
        assert!(!fx.archived_metrics.has(fp).unwrap());
        assert!(!fx.archived_ranges.has(fp).unwrap());
        // Nothing indexes the lost metric
        assert!(fx
            .sink
            .fingerprints_for_pair(&LabelPair::new("job", "gone"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_orphan_file_is_quarantined() {
        // S4: a file whose stem length does not match the naming scheme is
        // moved under orphaned/<shard>/ without touching any state.
        let fx = Fixture::new();
        let shard_dir = fx.layout.base_path().join("de");
        std::fs::create_dir_all(&shard_dir).unwrap();
        std::fs::write(shard_dir.join("deadbeef.db"), b"junk").unwrap();

        let mut map = SeriesMap::new();
        fx.recovery().run(&mut map).unwrap();

        assert!(!shard_dir.join("deadbeef.db").exists());
        assert!(fx
            .layout
            .orphaned_path("de", "deadbeef.db")
            .exists());
        assert!(map.is_empty());
        assert!(fx.archived_metrics.is_empty());
    }

    #[test]
    fn test_half_archived_series_is_unarchived() {
        // S5: archived metric without a time-range entry gets unarchived
        // into the live map so its chunks stay reachable.
        let fx = Fixture::new();
        let fp = Fingerprint(0x03);
        let m = metric("half");
        fx.write_series_file(fp, &[(10, 20), (20, 30)]);
        fx.archived_metrics.insert(fp, m.clone()).unwrap();

        let mut map = SeriesMap::new();
        fx.recovery().run(&mut map).unwrap();

        assert!(!fx.archived_metrics.has(fp).unwrap());
        let s = &map[&fp];
        assert_eq!(s.metric, m);
        assert_eq!(s.persist_watermark, 2);
        assert_eq!(s.chunk_descs_offset, 0);
        assert_eq!(s.chunk_descs.len(), 2);
        assert!(s.head_chunk_closed);
        assert_eq!(
            fx.sink
                .fingerprints_for_pair(&LabelPair::new("job", "half"))
                .unwrap(),
            vec![fp]
        );
    }

    #[test]
    fn test_overlapping_stitch() {
        // S6: checkpoint holds 5 descriptors, the file 4 chunks ending at
        // 90. The first checkpointed descriptor with first_time >= 90 is
        // index 4, so the stitched sequence is the 4 file chunks plus that
        // one survivor.
        let fx = Fixture::new();
        let fp = Fingerprint(0x04);
        let mtime = fx.write_series_file(fp, &[(0, 30), (30, 60), (60, 80), (80, 90)]);

        let mut map = SeriesMap::new();
        map.insert(
            fp,
            live_series(
                metric("api"),
                vec![
                    desc(0, 30),
                    desc(30, 60),
                    head_desc(60, 75),
                    head_desc(80, 95),
                    head_desc(100, 110),
                ],
                // Offset/mtime mismatch forces the slow path
                CHUNK_DESCS_OFFSET_UNKNOWN,
                2,
                false,
                Some(mtime),
            ),
        );

        fx.recovery().run(&mut map).unwrap();

        let s = &map[&fp];
        assert_eq!(s.chunk_descs.len(), 5);
        assert_eq!(s.persist_watermark, 4);
        assert_eq!(s.chunk_descs_offset, 0);
        assert!(!s.head_chunk_closed);
        // The four file chunks, then the surviving head chunk
        let firsts: Vec<Timestamp> = s.chunk_descs.iter().map(|cd| cd.first_time).collect();
        assert_eq!(firsts, vec![0, 30, 60, 80, 100]);
        // Stitch monotonicity: sorted and non-overlapping
        for pair in s.chunk_descs.windows(2) {
            assert!(pair[0].first_time <= pair[1].first_time);
            assert!(pair[0].last_time <= pair[1].first_time);
        }
    }

    #[test]
    fn test_file_fully_supersedes_head() {
        // Stitch path where no checkpointed descriptor starts at or after
        // the on-disk tail: the file wins and the head closes.
        let fx = Fixture::new();
        let fp = Fingerprint(0x05);
        fx.write_series_file(fp, &[(0, 50), (50, 100)]);

        let mut map = SeriesMap::new();
        map.insert(
            fp,
            live_series(
                metric("api"),
                vec![head_desc(20, 40), head_desc(60, 80)],
                CHUNK_DESCS_OFFSET_UNKNOWN,
                0,
                false,
                None,
            ),
        );

        fx.recovery().run(&mut map).unwrap();

        let s = &map[&fp];
        assert_eq!(s.chunk_descs.len(), 2);
        assert_eq!(s.persist_watermark, 2);
        assert_eq!(s.chunk_descs_offset, 0);
        assert!(s.head_chunk_closed);
        assert_eq!(s.chunk_descs[1].last_time, 100);
    }

    #[test]
    fn test_head_closed_series_treated_as_freshly_unarchived() {
        // Mismatching checkpoint with a closed head: the in-memory
        // descriptors are released and the file becomes authoritative.
        let fx = Fixture::new();
        let fp = Fingerprint(0x06);
        fx.write_series_file(fp, &[(10, 20), (20, 30), (30, 40)]);

        let mut map = SeriesMap::new();
        map.insert(
            fp,
            live_series(metric("api"), vec![desc(10, 20)], 1, 1, true, None),
        );
        fx.stats.add_chunk_descs(1);

        fx.recovery().run(&mut map).unwrap();

        let s = &map[&fp];
        assert!(s.chunk_descs.is_empty());
        assert_eq!(s.chunk_descs_offset, 3);
        assert_eq!(s.persist_watermark, 0);
        assert!(s.mod_time.is_some());
        assert_eq!(fx.stats.chunk_descs(), 0);
    }

    #[test]
    fn test_missing_file_open_head_keeps_checkpoint_chunks() {
        // Step 5 loss accounting: the persisted prefix is dropped, the
        // open-head chunks survive, and the series counts as seen.
        let fx = Fixture::new();
        let fp = Fingerprint(0x07);

        let mut map = SeriesMap::new();
        map.insert(
            fp,
            live_series(
                metric("survivor"),
                vec![desc(10, 20), head_desc(30, 40)],
                2,
                1,
                false,
                None,
            ),
        );
        fx.stats.add_chunk_descs(2);
        fx.stats.add_chunks(1);

        fx.recovery().run(&mut map).unwrap();

        let s = &map[&fp];
        assert_eq!(s.chunk_descs.len(), 1);
        assert_eq!(s.chunk_descs[0].first_time, 30);
        assert_eq!(s.persist_watermark, 0);
        assert_eq!(s.chunk_descs_offset, 0);
        assert_eq!(fx.stats.chunk_descs(), 1);
        assert_eq!(fx.stats.chunks(), 1);
        // Still live, and indexed
        assert_eq!(
            fx.sink
                .fingerprints_for_pair(&LabelPair::new("job", "survivor"))
                .unwrap(),
            vec![fp]
        );
    }

    #[test]
    fn test_missing_file_unknown_offset_logs_possible_loss() {
        // min_lost_chunks <= 0 can only come from the unknown-offset
        // sentinel; the state must still normalise.
        let fx = Fixture::new();
        let fp = Fingerprint(0x08);

        let mut map = SeriesMap::new();
        map.insert(
            fp,
            live_series(
                metric("maybe"),
                vec![head_desc(30, 40)],
                CHUNK_DESCS_OFFSET_UNKNOWN,
                0,
                false,
                None,
            ),
        );

        fx.recovery().run(&mut map).unwrap();

        let s = &map[&fp];
        assert_eq!(s.chunk_descs_offset, 0);
        assert_eq!(s.persist_watermark, 0);
        assert_eq!(s.chunk_descs.len(), 1);
    }

    #[test]
    fn test_archived_file_without_index_entry_is_quarantined() {
        // A file for a series that is neither live nor archived cannot be
        // trusted.
        let fx = Fixture::new();
        let fp = Fingerprint(0x09);
        fx.write_series_file(fp, &[(10, 20)]);

        let mut map = SeriesMap::new();
        fx.recovery().run(&mut map).unwrap();

        assert!(!fx.layout.series_path(fp).exists());
        let shard = fx.layout.shard_name(fp);
        let name = fx.layout.file_name(fp);
        assert!(fx.layout.orphaned_path(&shard, &name).exists());
    }

    #[test]
    fn test_empty_file_is_quarantined() {
        let fx = Fixture::new();
        let fp = Fingerprint(0x0a);
        fx.write_series_file(fp, &[]);

        let mut map = SeriesMap::new();
        fx.recovery().run(&mut map).unwrap();

        assert!(!fx.layout.series_path(fp).exists());
    }

    #[test]
    fn test_stale_archive_entries_are_purged() {
        // Pass A: an archive entry with no file at all, and one whose
        // series came back live, are both dropped from both indexes.
        let fx = Fixture::new();

        let unknown = Fingerprint(0x10);
        fx.archived_metrics.insert(unknown, metric("unknown")).unwrap();
        fx.archived_ranges.insert(unknown, TimeRange::new(0, 1)).unwrap();

        let live = Fingerprint(0x11);
        let mtime = fx.write_series_file(live, &[(10, 20)]);
        fx.archived_metrics.insert(live, metric("live")).unwrap();
        fx.archived_ranges.insert(live, TimeRange::new(10, 20)).unwrap();

        let mut map = SeriesMap::new();
        map.insert(
            live,
            live_series(metric("live"), Vec::new(), 1, 0, false, Some(mtime)),
        );

        fx.recovery().run(&mut map).unwrap();

        assert!(!fx.archived_metrics.has(unknown).unwrap());
        assert!(!fx.archived_ranges.has(unknown).unwrap());
        assert!(!fx.archived_metrics.has(live).unwrap());
        assert!(!fx.archived_ranges.has(live).unwrap());
        assert!(map.contains_key(&live));
    }

    #[test]
    fn test_dangling_time_range_entry_is_purged() {
        // Pass B: a time-range entry without a metric entry is dropped.
        let fx = Fixture::new();
        let fp = Fingerprint(0x12);
        fx.archived_ranges.insert(fp, TimeRange::new(0, 1)).unwrap();

        let mut map = SeriesMap::new();
        fx.recovery().run(&mut map).unwrap();

        assert!(fx.archived_ranges.is_empty());
    }

    #[test]
    fn test_quarantine_closure() {
        // Invariant 1: after recovery no shard file has an ill-formed name
        // or a misaligned size.
        let fx = Fixture::new();

        // A valid archived series
        let ok = Fingerprint(0x20);
        fx.write_series_file(ok, &[(10, 20)]);
        fx.archived_metrics.insert(ok, metric("ok")).unwrap();
        fx.archived_ranges.insert(ok, TimeRange::new(10, 20)).unwrap();

        // A misaligned archived series
        let ragged = Fingerprint(0x21);
        fx.write_series_file(ragged, &[(10, 20), (20, 30)]);
        fx.append_bytes(ragged, 100);
        fx.archived_metrics.insert(ragged, metric("ragged")).unwrap();
        fx.archived_ranges.insert(ragged, TimeRange::new(10, 30)).unwrap();

        // Assorted junk
        let shard_dir = fx.layout.base_path().join("ff");
        std::fs::create_dir_all(&shard_dir).unwrap();
        std::fs::write(shard_dir.join("not-a-series"), b"junk").unwrap();
        std::fs::write(shard_dir.join("zzzzzzzzzzzzzz.db"), b"junk").unwrap();

        let mut map = SeriesMap::new();
        fx.recovery().run(&mut map).unwrap();

        for path in fx.shard_files() {
            let name = path.file_name().unwrap().to_str().unwrap();
            assert!(fx.layout.is_well_formed_name(name), "bad name kept: {:?}", path);
            let size = std::fs::metadata(&path).unwrap().len();
            assert_eq!(size % CHUNK_LEN_WITH_HEADER as u64, 0, "misaligned: {:?}", path);
        }
    }

    #[test]
    fn test_dual_archive_presence_invariant() {
        // Invariant 2: after recovery, membership in the two archive
        // indexes is identical, and disjoint from the live map.
        let fx = Fixture::new();

        let archived = Fingerprint(0x30);
        fx.write_series_file(archived, &[(10, 20)]);
        fx.archived_metrics.insert(archived, metric("a")).unwrap();
        fx.archived_ranges.insert(archived, TimeRange::new(10, 20)).unwrap();

        let half = Fingerprint(0x31);
        fx.write_series_file(half, &[(10, 20)]);
        fx.archived_metrics.insert(half, metric("b")).unwrap();

        let dangling = Fingerprint(0x32);
        fx.archived_ranges.insert(dangling, TimeRange::new(0, 1)).unwrap();

        let mut map = SeriesMap::new();
        fx.recovery().run(&mut map).unwrap();

        let mut metric_fps = Vec::new();
        fx.archived_metrics
            .for_each(&mut |fp, _| {
                metric_fps.push(fp);
                Ok(())
            })
            .unwrap();
        for fp in &metric_fps {
            assert!(fx.archived_ranges.has(*fp).unwrap());
            assert!(!map.contains_key(fp));
        }
        let mut range_fps = Vec::new();
        fx.archived_ranges
            .for_each(&mut |fp, _| {
                range_fps.push(fp);
                Ok(())
            })
            .unwrap();
        for fp in &range_fps {
            assert!(fx.archived_metrics.has(*fp).unwrap());
        }
        assert_eq!(metric_fps, vec![archived]);
    }

    #[test]
    fn test_label_index_equivalence() {
        // Invariant 6: the label index holds exactly the pairs derivable
        // from live plus archived metrics.
        let fx = Fixture::new();

        let live_fp = Fingerprint(0x40);
        let mtime = fx.write_series_file(live_fp, &[(10, 20)]);
        let mut map = SeriesMap::new();
        map.insert(
            live_fp,
            live_series(metric("live"), Vec::new(), 1, 0, false, Some(mtime)),
        );

        let archived_fp = Fingerprint(0x41);
        fx.write_series_file(archived_fp, &[(10, 20)]);
        fx.archived_metrics.insert(archived_fp, metric("arch")).unwrap();
        fx.archived_ranges
            .insert(archived_fp, TimeRange::new(10, 20))
            .unwrap();

        fx.recovery().run(&mut map).unwrap();

        assert_eq!(
            fx.sink
                .fingerprints_for_pair(&LabelPair::new("job", "live"))
                .unwrap(),
            vec![live_fp]
        );
        assert_eq!(
            fx.sink
                .fingerprints_for_pair(&LabelPair::new("job", "arch"))
                .unwrap(),
            vec![archived_fp]
        );
        assert_eq!(fx.sink.values_for_name("job").unwrap(), vec!["arch", "live"]);
    }

    #[test]
    fn test_recovery_is_idempotent() {
        // Invariant 4: a second run over the recovered state changes
        // nothing.
        let fx = Fixture::new();

        // Live series on the fast path
        let live_fp = Fingerprint(0x50);
        let mtime = fx.write_series_file(live_fp, &[(10, 20), (20, 30)]);
        let mut map = SeriesMap::new();
        map.insert(
            live_fp,
            live_series(
                metric("live"),
                vec![desc(10, 20), desc(20, 30)],
                0,
                2,
                false,
                Some(mtime),
            ),
        );

        // Properly archived series
        let archived_fp = Fingerprint(0x51);
        fx.write_series_file(archived_fp, &[(10, 20)]);
        fx.archived_metrics.insert(archived_fp, metric("arch")).unwrap();
        fx.archived_ranges
            .insert(archived_fp, TimeRange::new(10, 20))
            .unwrap();

        // Half-archived series, unarchived by the first run
        let half_fp = Fingerprint(0x52);
        fx.write_series_file(half_fp, &[(10, 20)]);
        fx.archived_metrics.insert(half_fp, metric("half")).unwrap();

        // Orphan, quarantined by the first run
        let shard_dir = fx.layout.base_path().join("ab");
        std::fs::create_dir_all(&shard_dir).unwrap();
        std::fs::write(shard_dir.join("junk.db"), b"junk").unwrap();

        fx.recovery().run(&mut map).unwrap();

        let snapshot: Vec<(Fingerprint, usize, isize, usize, bool)> = {
            let mut rows: Vec<_> = map
                .iter()
                .map(|(fp, s)| {
                    (
                        *fp,
                        s.chunk_descs.len(),
                        s.chunk_descs_offset,
                        s.persist_watermark,
                        s.head_chunk_closed,
                    )
                })
                .collect();
            rows.sort_by_key(|row| row.0);
            rows
        };
        let files_before = fx.shard_files();
        let descs_before = fx.stats.chunk_descs();

        fx.recovery().run(&mut map).unwrap();

        let snapshot_after: Vec<(Fingerprint, usize, isize, usize, bool)> = {
            let mut rows: Vec<_> = map
                .iter()
                .map(|(fp, s)| {
                    (
                        *fp,
                        s.chunk_descs.len(),
                        s.chunk_descs_offset,
                        s.persist_watermark,
                        s.head_chunk_closed,
                    )
                })
                .collect();
            rows.sort_by_key(|row| row.0);
            rows
        };

        assert_eq!(snapshot, snapshot_after);
        assert_eq!(files_before, fx.shard_files());
        assert_eq!(descs_before, fx.stats.chunk_descs());
        assert!(fx.archived_metrics.has(archived_fp).unwrap());
        assert!(!fx.dirty.is_dirty());
    }

    #[test]
    fn test_dirty_flag_set_during_run_and_cleared_after() {
        let fx = Fixture::new();
        assert!(!fx.dirty.is_dirty());

        let mut map = SeriesMap::new();
        fx.recovery().run(&mut map).unwrap();
        assert!(!fx.dirty.is_dirty());

        // A pre-set flag is also cleared
        fx.dirty.mark_dirty().unwrap();
        fx.recovery().run(&mut map).unwrap();
        assert!(!fx.dirty.is_dirty());
    }

    #[test]
    fn test_pedantic_checks_force_slow_path() {
        // With pedantic checks the consistent series from S1 still goes
        // through full reconciliation; the result must describe the file.
        let fx = Fixture::new();
        let fp = Fingerprint(0x60);
        let mtime = fx.write_series_file(fp, &[(10, 20), (20, 30), (30, 40)]);

        let mut map = SeriesMap::new();
        map.insert(
            fp,
            live_series(
                metric("api"),
                vec![desc(20, 30), desc(30, 40), head_desc(40, 55)],
                1,
                2,
                false,
                Some(mtime),
            ),
        );

        fx.recovery().pedantic_checks(true).run(&mut map).unwrap();

        let s = &map[&fp];
        // Slow path re-derives everything from the file
        assert_eq!(s.chunk_descs_offset, 0);
        assert_eq!(s.persist_watermark, 3);
        assert_eq!(s.chunk_descs.len(), 4);
        assert!(!s.head_chunk_closed);
    }
}
