//! Merge
//!
//! The compactor: picks winners across all sealed segments, copies the live
//! ones into fresh segments, and swaps them in.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::codec::{self, unix_nanos, Entry};
use crate::config::Config;
use crate::error::{IgniteError, Result};
use crate::hint::HintWriter;
use crate::index::{rebuild_by_scan, rebuild_from_hints, EntryLocation, Index, RecordPointer, VersionTable};
use crate::segment::{hint_path, segment_file_name, sync_dir, tmp_path, Segment, SegmentManager};

use super::{CompactionReport, MergeMarker};

/// Runs compaction passes, at most one at a time
pub struct Compactor {
    /// Held for the whole pass, and while reaping
    running: Mutex<()>,
    hint_files: bool,
    min_segments: usize,
    live_ratio: f64,
}

impl Compactor {
    pub fn new(config: &Config) -> Self {
        Self {
            running: Mutex::new(()),
            hint_files: config.hint_files,
            min_segments: config.compaction_min_segments.max(1),
            live_ratio: config.compaction_live_ratio,
        }
    }

    /// Compact every sealed segment, waiting for a running pass to finish
    pub fn run(&self, segments: &SegmentManager, index: &Index, cancel: &CancelToken) -> Result<CompactionReport> {
        let _running = self.running.lock();
        self.compact_locked(segments, index, cancel)
    }

    /// Like [`run`](Self::run), but returns `Ok(None)` if a pass is already running
    pub fn try_run(
        &self,
        segments: &SegmentManager,
        index: &Index,
        cancel: &CancelToken,
    ) -> Result<Option<CompactionReport>> {
        let Some(_running) = self.running.try_lock() else {
            return Ok(None);
        };
        self.compact_locked(segments, index, cancel).map(Some)
    }

    /// Background policy: run only when enough sealed data is dead
    pub fn maybe_run(
        &self,
        segments: &SegmentManager,
        index: &Index,
        cancel: &CancelToken,
    ) -> Result<Option<CompactionReport>> {
        if !self.should_compact(segments, index) {
            return Ok(None);
        }
        self.try_run(segments, index, cancel)
    }

    /// True when there are at least `min_segments` sealed segments and the
    /// live fraction of their bytes is below `live_ratio`
    pub fn should_compact(&self, segments: &SegmentManager, index: &Index) -> bool {
        let sealed = segments.sealed_segments();
        if sealed.len() < self.min_segments {
            return false;
        }

        let sealed_bytes: u64 = sealed.iter().map(|s| s.len().unwrap_or(0)).sum();
        if sealed_bytes == 0 {
            return false;
        }
        let live = index.live_bytes_by_segment();
        let live_bytes: u64 = sealed
            .iter()
            .map(|s| live.get(&s.id()).copied().unwrap_or(0))
            .sum();

        let ratio = live_bytes as f64 / sealed_bytes as f64;
        debug!(
            sealed = sealed.len(),
            sealed_bytes,
            live_bytes,
            ratio,
            threshold = self.live_ratio,
            "compaction check"
        );
        ratio < self.live_ratio
    }

    /// Delete retired segments no reader holds; returns how many remain
    ///
    /// Skipped (reporting the current backlog) while a pass is running.
    pub fn reap(&self, segments: &SegmentManager) -> Result<usize> {
        let Some(_running) = self.running.try_lock() else {
            return Ok(segments.retired_count());
        };
        self.reap_locked(segments)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_locked()
    }

    /// Block until no pass is running
    pub fn wait_idle(&self) {
        drop(self.running.lock());
    }

    fn reap_locked(&self, segments: &SegmentManager) -> Result<usize> {
        let remaining = segments.reap();
        if remaining == 0 && MergeMarker::path(segments.dir()).exists() {
            // Source unlinks must be durable before the marker goes
            sync_dir(segments.dir())?;
            MergeMarker::remove(segments.dir())?;
            debug!("merge fully applied, marker removed");
        }
        Ok(remaining)
    }

    fn compact_locked(
        &self,
        segments: &SegmentManager,
        index: &Index,
        cancel: &CancelToken,
    ) -> Result<CompactionReport> {
        let started = Instant::now();

        // The previous merge's marker must survive until its sources are gone
        if self.reap_locked(segments)? > 0 {
            debug!("retired segments still in use, skipping compaction");
            return Ok(CompactionReport::default());
        }

        let candidates = segments.sealed_segments();
        if candidates.is_empty() {
            return Ok(CompactionReport::default());
        }
        cancel.check()?;

        let source_ids: Vec<u16> = candidates.iter().map(|s| s.id()).collect();
        let source_bytes: u64 = candidates.iter().map(|s| s.len().unwrap_or(0)).sum();
        info!(sources = ?source_ids, source_bytes, "compaction started");

        // Pass 1: newest version of every key across the candidates
        let mut table = VersionTable::new();
        for segment in &candidates {
            cancel.check()?;
            let hinted = self.hint_files && rebuild_from_hints(&mut table, segment)?.is_some();
            if !hinted {
                rebuild_by_scan(&mut table, segment)?;
            }
        }

        // Pass 2: copy live winners, in disk order
        let mut winners: Vec<RecordPointer> = table.into_live().collect();
        winners.sort_by_key(|pointer| (pointer.segment_id, pointer.offset));
        let handles: HashMap<u16, Arc<Segment>> =
            candidates.iter().map(|s| (s.id(), s.clone())).collect();

        let mut output = MergeOutput::new(segments, self.hint_files);
        let mut moves: Vec<(RecordPointer, Option<RecordPointer>)> = Vec::new();
        let mut expired: Vec<RecordPointer> = Vec::new();
        let mut superseded = 0u64;

        let copied = (|| -> Result<()> {
            let now = unix_nanos();
            for winner in &winners {
                cancel.check()?;
                if !index.points_to(winner) {
                    superseded += 1;
                    continue;
                }

                let segment = handles.get(&winner.segment_id).ok_or_else(|| {
                    IgniteError::internal("winner references a segment outside the merge")
                        .with_segment(winner.segment_id)
                })?;
                let raw = segment.read_at(winner.offset, winner.entry_size as usize)?;
                let entry = codec::decode(raw.clone()).map_err(|e| {
                    e.with_segment(winner.segment_id)
                        .with_offset(winner.offset)
                        .with_path(segment.path())
                })?;

                if entry.is_expired(now) {
                    expired.push(winner.clone());
                    continue;
                }

                let location = output.append(&raw, &entry)?;
                moves.push((winner.clone(), Some(RecordPointer::new(winner.key.clone(), location))));
            }
            Ok(())
        })();

        if let Err(e) = copied {
            output.discard();
            warn!(error = %e, "compaction aborted, sources untouched");
            return Err(e);
        }
        let installed = output.finish()?;

        // Last chance to back out
        if let Err(e) = cancel.check() {
            discard_segments(&installed);
            return Err(e);
        }

        // Commit point
        let output_ids: Vec<u16> = installed.iter().map(|s| s.id()).collect();
        let marker = MergeMarker {
            sources: source_ids.clone(),
            outputs: output_ids.clone(),
        };
        if let Err(e) = marker.write(segments.dir()) {
            // The rename may have landed; a marker must never outlive its outputs
            if let Err(remove_err) = MergeMarker::remove(segments.dir()) {
                warn!(error = %remove_err, "failed to remove merge marker after a failed write");
            }
            discard_segments(&installed);
            warn!(error = %e, "compaction aborted before commit");
            return Err(e);
        }

        for segment in &installed {
            segments.install(segment.clone());
        }
        let keys_written = moves.len() as u64;
        let keys_expired = expired.len() as u64;
        let applied = index.apply_moves(
            moves
                .into_iter()
                .chain(expired.into_iter().map(|pointer| (pointer, None))),
        );
        // Release our own handles so the reaper only waits on readers
        drop(handles);
        drop(candidates);
        segments.retire(&source_ids);
        let remaining = self.reap_locked(segments)?;

        let output_bytes: u64 = installed.iter().map(|s| s.len().unwrap_or(0)).sum();
        let report = CompactionReport {
            sources: source_ids,
            outputs: output_ids,
            keys_written,
            keys_expired,
            keys_superseded: superseded + (keys_written + keys_expired - applied as u64),
            bytes_reclaimed: source_bytes.saturating_sub(output_bytes),
            duration: started.elapsed(),
        };

        info!(
            sources = ?report.sources,
            outputs = ?report.outputs,
            keys_written = report.keys_written,
            keys_expired = report.keys_expired,
            bytes_reclaimed = report.bytes_reclaimed,
            retired_pending = remaining,
            elapsed_ms = report.duration.as_millis() as u64,
            "compaction finished"
        );
        Ok(report)
    }
}

// =============================================================================
// Merge Output
// =============================================================================

/// Output segments of one pass, written under temporary names
struct MergeOutput<'a> {
    segments: &'a SegmentManager,
    hint_files: bool,
    current: Option<OutputSegment>,
    sealed: Vec<OutputSegment>,
}

struct OutputSegment {
    id: u16,
    final_path: PathBuf,
    tmp_path: PathBuf,
    segment: Segment,
    size: u64,
    /// Hint records, kept only when hint files are enabled
    hints: Vec<(Bytes, EntryLocation)>,
}

impl<'a> MergeOutput<'a> {
    fn new(segments: &'a SegmentManager, hint_files: bool) -> Self {
        Self {
            segments,
            hint_files,
            current: None,
            sealed: Vec::new(),
        }
    }

    /// Copy one encoded entry verbatim; rotates at the segment size threshold
    fn append(&mut self, raw: &[u8], entry: &Entry) -> Result<EntryLocation> {
        let len = raw.len() as u64;
        let max_size = self.segments.max_segment_size();

        let full = self
            .current
            .as_ref()
            .map(|out| out.size > 0 && out.size + len > max_size)
            .unwrap_or(false);
        if full {
            self.seal_current()?;
        }
        if self.current.is_none() {
            self.current = Some(self.open_next()?);
        }
        let Some(out) = self.current.as_mut() else {
            return Err(IgniteError::internal("merge output missing after open"));
        };

        out.segment.write_at(out.size, raw)?;
        let location = EntryLocation {
            segment_id: out.id,
            offset: out.size,
            entry_size: u32::try_from(len)
                .map_err(|_| IgniteError::internal("merged entry size exceeds u32"))?,
            value_size: entry.header.value_size,
            timestamp: entry.header.timestamp,
        };
        out.size += len;
        if self.hint_files {
            out.hints.push((entry.key.clone(), location));
        }
        Ok(location)
    }

    fn open_next(&self) -> Result<OutputSegment> {
        let id = self.segments.allocate_id()?;
        let final_path = self
            .segments
            .dir()
            .join(segment_file_name(self.segments.prefix(), id, unix_nanos()));
        let tmp_path = tmp_path(&final_path);
        let segment = Segment::create_at(&tmp_path, id)?;
        debug!(segment_id = id, "merge output opened");

        Ok(OutputSegment {
            id,
            final_path,
            tmp_path,
            segment,
            size: 0,
            hints: Vec::new(),
        })
    }

    fn seal_current(&mut self) -> Result<()> {
        if let Some(out) = self.current.take() {
            let synced = out.segment.sync();
            self.sealed.push(out);
            synced?;
        }
        Ok(())
    }

    /// Seal, write hints, rename into place, and reopen read-only
    ///
    /// On failure every output file is removed.
    fn finish(mut self) -> Result<Vec<Arc<Segment>>> {
        match self.finish_inner() {
            Ok(installed) => Ok(installed),
            Err(e) => {
                self.discard();
                Err(e)
            }
        }
    }

    fn finish_inner(&mut self) -> Result<Vec<Arc<Segment>>> {
        self.seal_current()?;

        let mut installed = Vec::with_capacity(self.sealed.len());
        for out in &self.sealed {
            if self.hint_files {
                let mut writer = HintWriter::create(&out.final_path, out.id)?;
                for (key, location) in &out.hints {
                    writer.add(key, location)?;
                }
                writer.finish()?;
            }

            fs::rename(&out.tmp_path, &out.final_path).map_err(|e| {
                IgniteError::from_io(e, "failed to rename merge output")
                    .with_segment(out.id)
                    .with_path(&out.final_path)
            })?;
            installed.push(Arc::new(Segment::open_read_only(&out.final_path, out.id)?));
        }
        if !installed.is_empty() {
            sync_dir(self.segments.dir())?;
        }
        Ok(installed)
    }

    /// Remove every file this pass created
    fn discard(&mut self) {
        let outputs = self.current.take().into_iter().chain(self.sealed.drain(..));
        for out in outputs {
            let OutputSegment {
                id,
                final_path,
                tmp_path,
                segment,
                ..
            } = out;
            drop(segment);
            for path in [tmp_path, hint_path(&final_path), final_path] {
                remove_quietly(&path, id);
            }
        }
    }
}

fn discard_segments(installed: &[Arc<Segment>]) {
    for segment in installed {
        remove_quietly(&segment.hint_path(), segment.id());
        remove_quietly(segment.path(), segment.id());
    }
}

fn remove_quietly(path: &Path, segment_id: u16) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(segment_id, path = %path.display(), error = %e, "failed to remove merge output"),
    }
}
