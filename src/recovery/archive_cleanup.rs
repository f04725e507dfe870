//! Archive index clean-up
//!
//! Two passes over the archive indexes, strictly in order. Pass A walks
//! fingerprint → metric: entries for unknown files or for series that came
//! back as live are dropped from both indexes; entries missing from the
//! time-range index are unarchived into the live map so their data is not
//! lost. Pass B walks fingerprint → time range and drops every entry whose
//! fingerprint is no longer in the metric index (including those Pass A
//! just removed).
//!
//! Index backend errors propagate and abort recovery.

use crate::recovery::driver::CrashRecovery;
use crate::storage::chunk::read_chunk_descs;
use crate::storage::error::StorageResult;
use crate::storage::types::{now, Fingerprint, MemorySeries, SeriesMap};
use std::collections::HashSet;

impl CrashRecovery<'_> {
    pub(super) fn clean_up_archive_indexes(
        &self,
        series_map: &mut SeriesMap,
        fps_seen: &HashSet<Fingerprint>,
    ) -> StorageResult<()> {
        tracing::info!("Cleaning up archive indexes.");

        let mut count: u64 = 0;
        self.archived_metrics.for_each(&mut |fp, metric| {
            count += 1;
            if count % 10_000 == 0 {
                tracing::info!("{} archived metrics checked.", count);
            }

            let seen = fps_seen.contains(&fp);
            let in_memory = seen && series_map.contains_key(&fp);
            if !seen || in_memory {
                if in_memory {
                    tracing::warn!(
                        "Archive clean-up: Fingerprint {} is not archived. Purging from archive indexes.",
                        fp
                    );
                }
                if !seen {
                    tracing::warn!(
                        "Archive clean-up: Fingerprint {} is unknown. Purging from archive indexes.",
                        fp
                    );
                }
                // It's fine if the fingerprint is already gone from
                // either index.
                self.archived_metrics.delete(fp)?;
                self.archived_ranges.delete(fp)?;
                return Ok(());
            }

            // Legitimately archived. Make sure it is in the time-range
            // index, too.
            if self.archived_ranges.has(fp)? {
                return Ok(());
            }

            // Half-broken archive entry. Unarchive the series so its data
            // stays reachable.
            tracing::warn!(
                "Archive clean-up: Fingerprint {} is not in the time-range index. Unarchiving it for recovery.",
                fp
            );
            self.archived_metrics.delete(fp)?;

            let path = self.layout.series_path(fp);
            let cds = read_chunk_descs(&path, now())?;
            self.stats.add_chunk_descs(cds.len() as i64);
            let mod_time = std::fs::metadata(&path)?.modified()?;

            let mut series = MemorySeries::new(metric.clone());
            series.persist_watermark = cds.len();
            series.chunk_descs_offset = 0;
            series.chunk_descs = cds;
            // Record the file mtime so the next recovery run takes the
            // fast path for this series.
            series.mod_time = Some(mod_time);
            series_map.insert(fp, series);
            Ok(())
        })?;

        count = 0;
        self.archived_ranges.for_each(&mut |fp, _range| {
            count += 1;
            if count % 10_000 == 0 {
                tracing::info!("{} archived time ranges checked.", count);
            }

            if self.archived_metrics.has(fp)? {
                return Ok(());
            }
            tracing::warn!(
                "Archive clean-up: Purging unknown fingerprint {} from the time-range index.",
                fp
            );
            let deleted = self.archived_ranges.delete(fp)?;
            if !deleted {
                // Recovery is single-threaded; a key observed during
                // iteration must still be deletable.
                tracing::error!(
                    "Fingerprint {} to be deleted from the time-range index not found. This should never happen.",
                    fp
                );
            }
            Ok(())
        })?;

        tracing::info!("Clean-up of archive indexes complete.");
        Ok(())
    }
}
