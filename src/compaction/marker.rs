//! Merge Marker
//!
//! A small record, written once merged outputs are durable, naming the
//! source segments a merge replaces. If the process dies before the sources
//! are gone, startup finds the marker and finishes the deletion.
//!
//! ## File Format
//! ```text
//! [Len: u32][CRC32: u32][bincode(MergeMarker)]
//! ```
//!
//! Written to `MERGE.marker.tmp`, fsynced, then renamed over `MERGE.marker`.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{IgniteError, Result};
use crate::segment::{discover_segments, hint_path, sync_dir, tmp_path};

/// Name of the marker file within the segment directory
pub const MARKER_FILENAME: &str = "MERGE.marker";

/// Length (4) + CRC (4)
const FRAME_HEADER_SIZE: usize = 8;

/// Sources replaced by a committed merge, and the outputs replacing them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeMarker {
    pub sources: Vec<u16>,
    pub outputs: Vec<u16>,
}

impl MergeMarker {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MARKER_FILENAME)
    }

    /// Durably write the marker into `dir`
    pub fn write(&self, dir: &Path) -> Result<()> {
        let path = Self::path(dir);
        let tmp = tmp_path(&path);

        let body = bincode::serialize(self).map_err(|e| {
            IgniteError::internal("failed to serialize merge marker").with_source(e)
        })?;
        let len = u32::try_from(body.len())
            .map_err(|_| IgniteError::internal("merge marker too large"))?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let result = (|| -> io::Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&len.to_le_bytes())?;
            file.write_all(&crc.to_le_bytes())?;
            file.write_all(&body)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        })();

        result.map_err(|e| {
            let _ = fs::remove_file(&tmp);
            IgniteError::from_io(e, "failed to write merge marker").with_path(&path)
        })?;
        sync_dir(dir)
    }

    /// Read the marker from `dir`, `Ok(None)` if there is none
    pub fn read(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(dir);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(IgniteError::from_io(e, "failed to read merge marker").with_path(&path))
            }
        };

        if data.len() < FRAME_HEADER_SIZE {
            return Err(IgniteError::corrupted("merge marker truncated").with_path(&path));
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&data[0..4]);
        let len = u32::from_le_bytes(raw) as usize;
        raw.copy_from_slice(&data[4..8]);
        let stored_crc = u32::from_le_bytes(raw);

        let body = &data[FRAME_HEADER_SIZE..];
        if body.len() != len {
            return Err(IgniteError::corrupted("merge marker length mismatch").with_path(&path));
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            return Err(IgniteError::corrupted("merge marker checksum mismatch").with_path(&path));
        }

        let marker = bincode::deserialize(body).map_err(|e| {
            IgniteError::corrupted("merge marker does not decode")
                .with_path(&path)
                .with_source(e)
        })?;
        Ok(Some(marker))
    }

    /// Delete the marker (missing is fine)
    pub fn remove(dir: &Path) -> Result<()> {
        let path = Self::path(dir);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IgniteError::from_io(e, "failed to remove merge marker").with_path(&path)),
        }
    }
}

/// Finish a merge that committed but did not clean up before shutdown
///
/// Deletes every listed source segment (and its hint) still on disk, then
/// the marker. A marker that fails validation is discarded: without it both
/// the sources and the outputs stay, and last-writer-wins resolves the
/// duplicates. Returns the marker that was acted on.
pub fn recover_interrupted_merge(dir: &Path, prefix: &str) -> Result<Option<MergeMarker>> {
    let marker = match MergeMarker::read(dir) {
        Ok(Some(marker)) => marker,
        Ok(None) => return Ok(None),
        Err(e) if e.is_corruption() => {
            warn!(error = %e, "discarding unreadable merge marker");
            MergeMarker::remove(dir)?;
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let mut deleted = 0usize;
    for (name, path) in discover_segments(dir, prefix)? {
        if !marker.sources.contains(&name.id) {
            continue;
        }
        for file in [hint_path(&path), path] {
            match fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(IgniteError::from_io(e, "failed to delete merged source segment")
                        .with_segment(name.id)
                        .with_path(&file))
                }
            }
        }
        deleted += 1;
    }

    sync_dir(dir)?;
    MergeMarker::remove(dir)?;
    info!(
        sources = ?marker.sources,
        outputs = ?marker.outputs,
        deleted,
        "finished interrupted merge"
    );
    Ok(Some(marker))
}
