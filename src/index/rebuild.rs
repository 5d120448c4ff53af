//! Index Rebuild
//!
//! Reconstructs the key directory from disk at startup. Every entry seen
//! (from a hint or a scan) is offered to a [`VersionTable`], which keeps the
//! newest version per key by `(timestamp, segment_id, offset)`. Because the
//! comparison never depends on visiting order, hints and scans can be mixed
//! freely and give the same result.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{IgniteError, Result};
use crate::hint::HintReader;
use crate::segment::{ScanStop, Segment};

use super::{EntryLocation, Index, RecordPointer};

// =============================================================================
// Version Table
// =============================================================================

/// Newest known version of every key, tombstones included
#[derive(Debug, Default)]
pub struct VersionTable {
    versions: HashMap<Arc<[u8]>, RecordPointer, ahash::RandomState>,
    max_timestamp: u64,
}

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer one on-disk version of `key`; returns true if it is now the newest
    pub fn observe(&mut self, key: &[u8], location: EntryLocation) -> bool {
        self.max_timestamp = self.max_timestamp.max(location.timestamp);

        match self.versions.get_mut(key) {
            Some(current) => {
                if location.version() > current.version() {
                    let key = current.key.clone();
                    *current = RecordPointer::new(key, location);
                    true
                } else {
                    false
                }
            }
            None => {
                let key: Arc<[u8]> = Arc::from(key);
                self.versions.insert(key.clone(), RecordPointer::new(key, location));
                true
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&RecordPointer> {
        self.versions.get(key)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Highest timestamp observed, tombstones included
    pub fn max_timestamp(&self) -> u64 {
        self.max_timestamp
    }

    /// Every winning version, tombstones included
    pub fn into_versions(self) -> impl Iterator<Item = RecordPointer> {
        self.versions.into_values()
    }

    /// Winning versions that are live values (tombstones dropped)
    pub fn into_live(self) -> impl Iterator<Item = RecordPointer> {
        self.into_versions().filter(|pointer| !pointer.is_tombstone())
    }
}

// =============================================================================
// Recovery Results
// =============================================================================

/// How one segment was recovered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecovery {
    pub segment_id: u16,
    /// True if a valid hint file was used (the segment is sealed)
    pub from_hint: bool,
    /// Records replayed from this segment
    pub entries: u64,
    pub file_len: u64,
    /// Length of the intact prefix (== `file_len` unless the scan stopped early)
    pub valid_len: u64,
    /// Newest timestamp among this segment's entries (0 if empty)
    pub max_timestamp: u64,
    pub stop: Option<ScanStop>,
}

/// Result of a full index rebuild
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Per-segment results, in segment-id order
    pub segments: Vec<SegmentRecovery>,
    /// Live keys in the rebuilt index
    pub keys: usize,
    /// Total records replayed across all segments
    pub entries: u64,
    /// Highest timestamp seen on disk; seeds the write clock
    pub max_timestamp: u64,
}

impl RecoveryReport {
    pub fn segment(&self, id: u16) -> Option<&SegmentRecovery> {
        self.segments.iter().find(|s| s.segment_id == id)
    }

    /// True if the segment was recovered from a valid hint
    pub fn is_hinted(&self, id: u16) -> bool {
        self.segment(id).map(|s| s.from_hint).unwrap_or(false)
    }

    pub fn hints_used(&self) -> usize {
        self.segments.iter().filter(|s| s.from_hint).count()
    }

    /// Every early scan stop (torn tail or corruption)
    pub fn corrupted(&self) -> impl Iterator<Item = &ScanStop> {
        self.segments.iter().filter_map(|s| s.stop.as_ref())
    }
}

// =============================================================================
// Rebuild
// =============================================================================

/// Replay a segment's hint file into `table`
///
/// Returns `Ok(None)` when the segment has no usable hint. A hint that
/// fails validation, or that references bytes past the end of the segment,
/// is deleted so the segment is treated as unsealed and gets a fresh one.
/// Any other failure to read the hint is returned as is.
pub fn rebuild_from_hints(table: &mut VersionTable, segment: &Segment) -> Result<Option<SegmentRecovery>> {
    let hint_path = segment.hint_path();
    if !hint_path.exists() {
        return Ok(None);
    }

    let file_len = segment.len()?;
    let reader = match HintReader::open(&hint_path, segment.id()) {
        Ok(reader) => reader,
        Err(e) if e.is_corruption() => {
            warn!(segment_id = segment.id(), error = %e, "discarding invalid hint file");
            discard_hint(segment);
            return Ok(None);
        }
        Err(e) if e.is_not_found() => return Ok(None),
        // Permission and I/O failures are not evidence of a bad hint
        Err(e) => return Err(e),
    };

    let out_of_bounds = reader
        .entries()
        .iter()
        .any(|e| e.location.offset + e.location.entry_size as u64 > file_len);
    if out_of_bounds {
        warn!(segment_id = segment.id(), file_len, "hint references data past end of segment, discarding");
        discard_hint(segment);
        return Ok(None);
    }

    let mut max_timestamp = 0;
    for entry in reader.entries() {
        max_timestamp = max_timestamp.max(entry.location.timestamp);
        table.observe(&entry.key, entry.location);
    }

    Ok(Some(SegmentRecovery {
        segment_id: segment.id(),
        from_hint: true,
        entries: reader.entry_count() as u64,
        file_len,
        valid_len: file_len,
        max_timestamp,
        stop: None,
    }))
}

/// Replay every intact entry of a segment into `table`
///
/// A checksum failure or torn entry ends recovery of this segment at that
/// offset; earlier entries stay recovered.
pub fn rebuild_by_scan(table: &mut VersionTable, segment: &Segment) -> Result<SegmentRecovery> {
    let mut scanner = segment.scan()?;
    let mut entries = 0u64;
    let mut max_timestamp = 0;

    for scanned in scanner.by_ref() {
        let scanned = scanned?;
        max_timestamp = max_timestamp.max(scanned.entry.header.timestamp);
        table.observe(
            &scanned.entry.key,
            EntryLocation {
                segment_id: segment.id(),
                offset: scanned.offset,
                entry_size: scanned.entry_size(),
                value_size: scanned.entry.header.value_size,
                timestamp: scanned.entry.header.timestamp,
            },
        );
        entries += 1;
    }

    let stop = scanner.stop().cloned();
    if let Some(stop) = &stop {
        warn!(
            segment_id = stop.segment_id,
            offset = stop.offset,
            reason = ?stop.reason,
            discarded = scanner.file_len() - stop.offset,
            "segment scan stopped early"
        );
    }

    Ok(SegmentRecovery {
        segment_id: segment.id(),
        from_hint: false,
        entries,
        file_len: scanner.file_len(),
        valid_len: scanner.valid_len(),
        max_timestamp,
        stop,
    })
}

/// Rebuild `index` from `segments` (ascending id order), preferring hints
pub fn rebuild(index: &Index, segments: &[Arc<Segment>], use_hints: bool) -> Result<RecoveryReport> {
    let mut table = VersionTable::new();
    let mut report = RecoveryReport::default();

    for segment in segments {
        let recovered = recover_segment(&mut table, segment, use_hints).map_err(|e| {
            IgniteError::recovery_failed(format!("failed to recover segment {}", segment.id()))
                .with_segment(segment.id())
                .with_path(segment.path())
                .with_source(e)
        })?;
        report.entries += recovered.entries;
        report.segments.push(recovered);
    }

    report.max_timestamp = table.max_timestamp();
    index.replace_all(table.into_live());
    report.keys = index.len();

    info!(
        segments = report.segments.len(),
        hints_used = report.hints_used(),
        entries = report.entries,
        keys = report.keys,
        "index rebuilt"
    );
    Ok(report)
}

fn recover_segment(table: &mut VersionTable, segment: &Segment, use_hints: bool) -> Result<SegmentRecovery> {
    if use_hints {
        if let Some(recovered) = rebuild_from_hints(table, segment)? {
            return Ok(recovered);
        }
    }
    rebuild_by_scan(table, segment)
}

fn discard_hint(segment: &Segment) {
    if let Err(e) = fs::remove_file(segment.hint_path()) {
        warn!(segment_id = segment.id(), error = %e, "failed to remove invalid hint file");
    }
}
