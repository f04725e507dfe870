//! Series file sanitisation and checkpoint reconciliation
//!
//! One series file at a time: validate the name, trim misaligned sizes,
//! refuse empties, then reconcile the file against what the checkpoint
//! claims about the series (or, for archived series, against the archive
//! index). Files recovery refuses to trust are quarantined under
//! `orphaned/<shard>/`.

use crate::recovery::driver::CrashRecovery;
use crate::storage::chunk::{read_chunk_descs, CHUNK_LEN_WITH_HEADER};
use crate::storage::types::{now, Fingerprint, SeriesMap, CHUNK_DESCS_OFFSET_UNKNOWN};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A directory entry that passed the size checks of the sanitiser
pub(super) struct SeriesFile {
    pub path: PathBuf,
    pub shard: String,
    pub name: String,
    /// Extraneous bytes trimmed from the end; 0 when the file was aligned
    pub bytes_trimmed: u64,
    pub chunks_in_file: usize,
    pub mod_time: SystemTime,
}

impl CrashRecovery<'_> {
    /// Sanitise one on-disk series file
    ///
    /// Returns the fingerprint derived from the shard and file name if the
    /// file was successfully sanitised; `None` means the file was
    /// quarantined (or could not even be named) and must not count as
    /// seen.
    ///
    /// The steps, in order:
    /// - a file whose name does not comply with the naming scheme is moved
    ///   into the orphaned directory;
    /// - if the size is not a multiple of the chunk record size, the
    ///   extraneous bytes are truncated away; if truncation fails, the
    ///   file is quarantined;
    /// - a file that is empty (also after truncation) is quarantined;
    /// - a series present in the live map has its checkpoint state
    ///   reconciled with the file;
    /// - a series absent from the live map must be present in the archive
    ///   index, or the file is quarantined.
    pub(super) fn sanitize_series(
        &self,
        dir: &Path,
        entry: &fs::DirEntry,
        series_map: &mut SeriesMap,
    ) -> Option<Fingerprint> {
        let shard = dir
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_name_os = entry.file_name();
        let path = dir.join(&file_name_os);

        let name = match file_name_os.to_str() {
            Some(name) if self.layout.is_well_formed_name(name) => name.to_string(),
            _ => {
                tracing::warn!("Unexpected series file name {:?}.", path);
                self.quarantine(&shard, &file_name_os.to_string_lossy(), &path);
                return None;
            }
        };

        let fp = match self.layout.fingerprint_from_parts(&shard, &name) {
            Some(fp) => fp,
            None => {
                tracing::warn!("Error parsing file name {:?}.", path);
                self.quarantine(&shard, &name, &path);
                return None;
            }
        };

        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                tracing::error!("Could not stat file {:?}: {}", path, e);
                self.quarantine(&shard, &name, &path);
                return None;
            }
        };
        let mod_time = match meta.modified() {
            Ok(mod_time) => mod_time,
            Err(e) => {
                tracing::error!("Could not read mtime of file {:?}: {}", path, e);
                self.quarantine(&shard, &name, &path);
                return None;
            }
        };

        let size = meta.len();
        let record_len = CHUNK_LEN_WITH_HEADER as u64;
        let bytes_to_trim = size % record_len;
        let chunks_in_file = (size / record_len) as usize;

        if bytes_to_trim != 0 {
            tracing::warn!(
                "Truncating file {:?} to exactly {} chunks, trimming {} extraneous bytes.",
                path,
                chunks_in_file,
                bytes_to_trim
            );
            let file = match OpenOptions::new().write(true).open(&path) {
                Ok(file) => file,
                Err(e) => {
                    tracing::error!("Could not open file {:?}: {}", path, e);
                    self.quarantine(&shard, &name, &path);
                    return None;
                }
            };
            if let Err(e) = file.set_len(size - bytes_to_trim) {
                tracing::error!("Failed to truncate file {:?}: {}", path, e);
                self.quarantine(&shard, &name, &path);
                return None;
            }
        }

        if chunks_in_file == 0 {
            tracing::warn!("No chunks left in file {:?}.", path);
            self.quarantine(&shard, &name, &path);
            return None;
        }

        let file = SeriesFile {
            path,
            shard,
            name,
            bytes_trimmed: bytes_to_trim,
            chunks_in_file,
            mod_time,
        };

        if series_map.contains_key(&fp) {
            self.reconcile_checkpoint(fp, &file, series_map)
        } else {
            self.verify_archived(fp, &file)
        }
    }

    /// Reconcile a live series' checkpoint state with its series file
    fn reconcile_checkpoint(
        &self,
        fp: Fingerprint,
        file: &SeriesFile,
        series_map: &mut SeriesMap,
    ) -> Option<Fingerprint> {
        let s = match series_map.get_mut(&fp) {
            Some(s) => s,
            // The caller just checked membership; a miss here is a bug.
            None => unreachable!("live series map entry vanished during reconciliation"),
        };

        if !self.pedantic_checks
            && file.bytes_trimmed == 0
            && s.chunk_descs_offset != CHUNK_DESCS_OFFSET_UNKNOWN
            && file.chunks_in_file as isize == s.chunk_descs_offset + s.persist_watermark as isize
            && s.mod_time == Some(file.mod_time)
        {
            // Everything is consistent. We are good.
            return Some(fp);
        }

        // The series file cannot be assumed consistent with the
        // checkpoint, so take a closer look.
        if s.head_chunk_closed {
            // The easy case: the checkpoint contributed no open-head
            // chunks. Treat the series as freshly unarchived, with no
            // chunks or descriptors in memory.
            tracing::warn!(
                "Treating recovered metric {}, fingerprint {}, as freshly unarchived, with {} chunks in series file.",
                s.metric,
                fp,
                file.chunks_in_file
            );
            let released = std::mem::take(&mut s.chunk_descs);
            self.stats.sub_chunk_descs(released.len() as i64);
            self.stats
                .sub_chunks(released.iter().filter(|cd| cd.chunk.is_some()).count() as i64);
            s.chunk_descs_offset = file.chunks_in_file as isize;
            s.persist_watermark = 0;
            s.mod_time = Some(file.mod_time);
            return Some(fp);
        }

        // The tricky one: the checkpoint holds open-head chunks, but some
        // of them might already be in the series file. Take the last time
        // of the most recent chunk in the file, find the oldest
        // checkpointed chunk with a first time at or after it, throw away
        // the older checkpointed chunks, and stitch the parts together.

        // First, drop the already-persisted prefix from memory.
        let released = s.persist_watermark.min(s.chunk_descs.len());
        let released_loaded = s.chunk_descs[..released]
            .iter()
            .filter(|cd| cd.chunk.is_some())
            .count();
        s.chunk_descs.drain(..released);
        self.stats.sub_chunk_descs(released as i64);
        self.stats.sub_chunks(released_loaded as i64);

        let cds = match read_chunk_descs(&file.path, now()) {
            Ok(cds) => cds,
            Err(e) => {
                tracing::error!(
                    "Failed to load chunk descriptors for metric {}, fingerprint {}: {}",
                    s.metric,
                    fp,
                    e
                );
                self.quarantine(&file.shard, &file.name, &file.path);
                return None;
            }
        };
        if cds.is_empty() {
            // A non-empty file yielded no descriptors (records entirely
            // in the future); nothing to stitch against.
            tracing::error!(
                "No usable chunk descriptors in series file {:?} for metric {}, fingerprint {}.",
                file.path,
                s.metric,
                fp
            );
            self.quarantine(&file.shard, &file.name, &file.path);
            return None;
        }
        self.stats.add_chunk_descs(cds.len() as i64);
        s.persist_watermark = cds.len();
        s.chunk_descs_offset = 0;
        s.mod_time = Some(file.mod_time);

        let last_time_on_disk = cds[cds.len() - 1].last_time;
        match s
            .chunk_descs
            .iter()
            .position(|cd| cd.first_time >= last_time_on_disk)
        {
            None => {
                // The file fully supersedes the in-memory head.
                tracing::warn!(
                    "Recovered metric {}, fingerprint {}: all {} chunks recovered from series file.",
                    s.metric,
                    fp,
                    file.chunks_in_file
                );
                let released = std::mem::take(&mut s.chunk_descs);
                self.stats.sub_chunk_descs(released.len() as i64);
                self.stats
                    .sub_chunks(released.iter().filter(|cd| cd.chunk.is_some()).count() as i64);
                s.chunk_descs = cds;
                s.head_chunk_closed = true;
            }
            Some(keep_idx) => {
                tracing::warn!(
                    "Recovered metric {}, fingerprint {}: recovered {} chunks from series file, recovered {} chunks from checkpoint.",
                    s.metric,
                    fp,
                    file.chunks_in_file,
                    s.chunk_descs.len() - keep_idx
                );
                let dropped_loaded = s.chunk_descs[..keep_idx]
                    .iter()
                    .filter(|cd| cd.chunk.is_some())
                    .count();
                s.chunk_descs.drain(..keep_idx);
                self.stats.sub_chunk_descs(keep_idx as i64);
                self.stats.sub_chunks(dropped_loaded as i64);

                let tail = std::mem::take(&mut s.chunk_descs);
                s.chunk_descs = cds;
                s.chunk_descs.extend(tail);
            }
        }
        Some(fp)
    }

    /// Verify that a series absent from the live map is legitimately
    /// archived
    fn verify_archived(&self, fp: Fingerprint, file: &SeriesFile) -> Option<Fingerprint> {
        match self.archived_metrics.get(fp) {
            Err(e) => {
                tracing::error!(
                    "Fingerprint {} assumed archived but couldn't be looked up in the archive index: {}",
                    fp,
                    e
                );
                self.quarantine(&file.shard, &file.name, &file.path);
                None
            }
            Ok(None) => {
                tracing::warn!(
                    "Fingerprint {} assumed archived but couldn't be found in the archive index.",
                    fp
                );
                self.quarantine(&file.shard, &file.name, &file.path);
                None
            }
            Ok(Some(_)) => Some(fp),
        }
    }

    /// Move an untrusted file into `orphaned/<shard>/`, deleting it if the
    /// move fails; never fatal
    pub(super) fn quarantine(&self, shard: &str, file_name: &str, path: &Path) {
        if let Err(e) = self.try_quarantine(shard, file_name, path) {
            tracing::error!(
                "Failed to move series file {:?} to the orphaned directory, deleting it instead: {}",
                path,
                e
            );
            if let Err(e) = fs::remove_file(path) {
                tracing::error!("Even deleting file {:?} did not work: {}", path, e);
            }
        }
    }

    fn try_quarantine(&self, shard: &str, file_name: &str, path: &Path) -> std::io::Result<()> {
        let orphaned_dir = self.layout.orphaned_dir(shard);
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(&orphaned_dir)?;
        fs::rename(path, self.layout.orphaned_path(shard, file_name))
    }
}
