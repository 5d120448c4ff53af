//! Hint Writer
//!
//! Streams hint entries to a temporary file, then seals it with a footer
//! and renames it over the final path.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{IgniteError, Result};
use crate::index::{EntryLocation, VersionTable};
use crate::segment::{hint_path, sync_dir, tmp_path, Segment};

use super::HINT_MAGIC;

/// Outcome of writing a hint file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintSummary {
    pub segment_id: u16,
    pub path: PathBuf,
    pub entry_count: u64,
}

/// Builder for one hint file
pub struct HintWriter {
    segment_id: u16,
    /// Final hint path (next to the segment)
    path: PathBuf,
    /// Temporary path written until `finish()`
    tmp_path: PathBuf,
    writer: BufWriter<File>,
    entry_count: u64,
    /// Running CRC over the entries block
    hasher: crc32fast::Hasher,
}

impl HintWriter {
    /// Start a hint for the segment stored at `segment_path`
    pub fn create(segment_path: &Path, segment_id: u16) -> Result<Self> {
        let path = hint_path(segment_path);
        let tmp_path = tmp_path(&path);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| {
                IgniteError::from_io(e, "failed to create hint file")
                    .with_segment(segment_id)
                    .with_path(&tmp_path)
            })?;

        Ok(Self {
            segment_id,
            path,
            tmp_path,
            writer: BufWriter::new(file),
            entry_count: 0,
            hasher: crc32fast::Hasher::new(),
        })
    }

    /// Append one record; the location must belong to this writer's segment
    pub fn add(&mut self, key: &[u8], location: &EntryLocation) -> Result<()> {
        if location.segment_id != self.segment_id {
            return Err(IgniteError::internal(format!(
                "hint for segment {} given an entry from segment {}",
                self.segment_id, location.segment_id
            )));
        }
        let key_size = u32::try_from(key.len())
            .map_err(|_| IgniteError::invalid_input("hint key does not fit in a u32 length"))?;

        let mut fixed = [0u8; 30];
        fixed[0..4].copy_from_slice(&key_size.to_le_bytes());
        self.write_hashed(&fixed[0..4])?;
        self.write_hashed(key)?;

        fixed[4..6].copy_from_slice(&location.segment_id.to_le_bytes());
        fixed[6..14].copy_from_slice(&location.offset.to_le_bytes());
        fixed[14..22].copy_from_slice(&location.timestamp.to_le_bytes());
        fixed[22..26].copy_from_slice(&location.entry_size.to_le_bytes());
        fixed[26..30].copy_from_slice(&location.value_size.to_le_bytes());
        self.write_hashed(&fixed[4..30])?;

        self.entry_count += 1;
        Ok(())
    }

    fn write_hashed(&mut self, bytes: &[u8]) -> Result<()> {
        self.hasher.update(bytes);
        self.writer.write_all(bytes).map_err(|e| {
            IgniteError::from_io(e, "failed to write hint file")
                .with_segment(self.segment_id)
                .with_path(&self.tmp_path)
        })
    }

    /// Write the footer, fsync, and rename into place
    pub fn finish(mut self) -> Result<HintSummary> {
        let crc = self.hasher.clone().finalize();

        let result = (|| -> std::io::Result<()> {
            self.writer.write_all(HINT_MAGIC)?;
            self.writer.write_all(&self.entry_count.to_le_bytes())?;
            self.writer.write_all(&crc.to_le_bytes())?;
            self.writer.flush()?;
            self.writer.get_ref().sync_all()?;
            fs::rename(&self.tmp_path, &self.path)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&self.tmp_path);
            return Err(IgniteError::from_io(e, "failed to finalize hint file")
                .with_segment(self.segment_id)
                .with_path(&self.path));
        }
        if let Some(dir) = self.path.parent() {
            sync_dir(dir)?;
        }

        Ok(HintSummary {
            segment_id: self.segment_id,
            path: self.path,
            entry_count: self.entry_count,
        })
    }

    /// Drop the partial file without producing a hint
    pub fn abandon(self) {
        let tmp_path = self.tmp_path.clone();
        drop(self.writer);
        if let Err(e) = fs::remove_file(&tmp_path) {
            warn!(path = %tmp_path.display(), error = %e, "failed to remove abandoned hint file");
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }
}

/// Scan a sealed segment and write its hint file
///
/// Keeps the newest entry per key (tombstones included) and writes them in
/// offset order. If the segment has a torn or corrupt region, the hint covers
/// the intact prefix only, matching what a scan would recover.
pub fn write_segment_hint(segment: &Segment) -> Result<HintSummary> {
    let mut table = VersionTable::new();
    let mut scanner = segment.scan()?;
    for scanned in scanner.by_ref() {
        let scanned = scanned?;
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
    }
    if let Some(stop) = scanner.stop() {
        warn!(
            segment_id = segment.id(),
            offset = stop.offset,
            reason = ?stop.reason,
            "hint covers only the intact prefix of the segment"
        );
    }

    let mut records: Vec<_> = table.into_versions().collect();
    records.sort_by_key(|pointer| pointer.offset);

    let mut writer = HintWriter::create(segment.path(), segment.id())?;
    for pointer in &records {
        if let Err(e) = writer.add(&pointer.key, &pointer.location()) {
            writer.abandon();
            return Err(e);
        }
    }
    let summary = writer.finish()?;

    debug!(
        segment_id = summary.segment_id,
        entries = summary.entry_count,
        "hint file written"
    );
    Ok(summary)
}
