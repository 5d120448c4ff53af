//! Segment Module
//!
//! Append-only data files holding encoded entries, plus the manager that
//! owns their lifecycle (discovery, rotation, id allocation, retirement).
//!
//! ## Naming
//! ```text
//! {prefix}_{id:05}_{created_unix_nanos}.seg     segment file
//! {prefix}_{id:05}_{created_unix_nanos}.hint    hint file for a sealed segment
//! *.tmp                                         in-progress output, removed at startup
//! ```
//!
//! The zero-padded id makes lexicographic order match numeric order, so the
//! newest segment is always the last one in a sorted directory listing.

mod file;
mod manager;
mod scanner;

use std::fs::File;
use std::path::{Path, PathBuf};

pub use file::Segment;
pub use manager::{discover_segments, SegmentManager, SegmentStats, SegmentWriter};
pub use scanner::{ScanStop, ScannedEntry, SegmentScanner, StopReason};

use crate::error::{IgniteError, Result};

/// Extension of segment data files
pub const SEGMENT_EXTENSION: &str = "seg";

/// Extension of hint files
pub const HINT_EXTENSION: &str = "hint";

/// Suffix appended to files that are still being written
pub const TMP_SUFFIX: &str = ".tmp";

/// Largest segment id; ids are never reused or wrapped
pub const MAX_SEGMENT_ID: u16 = u16::MAX;

/// Components of a parsed segment filename
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentName {
    pub id: u16,
    pub created_ns: u64,
}

/// Generate a segment filename
/// (prefix "segment", id 42, ts 1700) → "segment_00042_1700.seg"
pub fn segment_file_name(prefix: &str, id: u16, created_ns: u64) -> String {
    format!("{}_{:05}_{}.{}", prefix, id, created_ns, SEGMENT_EXTENSION)
}

/// Parse a segment filename produced by [`segment_file_name`]
///
/// Returns `None` for anything else: other prefixes, hint files, temp files,
/// id zero, or ids not padded to five digits.
pub fn parse_segment_file_name(file_name: &str, prefix: &str) -> Option<SegmentName> {
    let rest = file_name.strip_prefix(prefix)?.strip_prefix('_')?;
    let stem = rest.strip_suffix(SEGMENT_EXTENSION)?.strip_suffix('.')?;
    let (id_str, ts_str) = stem.split_once('_')?;

    if id_str.len() != 5 || !id_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if ts_str.is_empty() || !ts_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let id: u16 = id_str.parse().ok()?;
    if id == 0 {
        return None;
    }
    let created_ns = ts_str.parse().ok()?;

    Some(SegmentName { id, created_ns })
}

/// Hint file path for a segment: same stem, `.hint` extension
pub fn hint_path(segment_path: &Path) -> PathBuf {
    segment_path.with_extension(HINT_EXTENSION)
}

/// Temporary sibling of `path` (`name` → `name.tmp`)
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

/// True for leftovers of interrupted writes
pub fn is_tmp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(TMP_SUFFIX))
        .unwrap_or(false)
}

/// fsync a directory so creates, renames and unlinks inside it are durable
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|handle| handle.sync_all())
        .map_err(|e| IgniteError::from_io(e, "failed to sync directory").with_path(dir))
}
