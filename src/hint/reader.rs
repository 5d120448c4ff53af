//! Hint Reader
//!
//! Loads and validates a complete hint file. Any structural problem (missing
//! footer, bad magic, CRC mismatch, count mismatch, foreign segment id) is
//! reported as `SegmentCorrupted`; callers fall back to scanning the segment.

use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::{IgniteError, Result};
use crate::index::EntryLocation;

use super::{HintEntry, ENTRY_FIXED_SIZE, FOOTER_SIZE, HINT_MAGIC};

/// A validated hint file, fully parsed
#[derive(Debug)]
pub struct HintReader {
    path: PathBuf,
    segment_id: u16,
    entries: Vec<HintEntry>,
}

impl HintReader {
    /// Read and validate the hint at `path`, which must describe `segment_id`
    pub fn open(path: &Path, segment_id: u16) -> Result<Self> {
        let data = fs::read(path).map_err(|e| {
            IgniteError::from_io(e, "failed to read hint file")
                .with_segment(segment_id)
                .with_path(path)
        })?;
        let corrupt = |msg: String| IgniteError::corrupted(msg).with_segment(segment_id).with_path(path);

        if data.len() < FOOTER_SIZE {
            return Err(corrupt(format!("hint file too small: {} bytes", data.len())));
        }

        // Footer: magic | entry_count | crc
        let footer_start = data.len() - FOOTER_SIZE;
        let footer = &data[footer_start..];
        if &footer[0..4] != HINT_MAGIC {
            return Err(corrupt("hint file has bad magic".to_string()));
        }
        let entry_count = u64::from_le_bytes(to_array(&footer[4..12]));
        let stored_crc = u32::from_le_bytes(to_array(&footer[12..16]));

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data[..footer_start]);
        if hasher.finalize() != stored_crc {
            return Err(corrupt("hint file checksum mismatch".to_string()));
        }

        // Entries block
        let block = Bytes::from(data).slice(..footer_start);
        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos < block.len() {
            if block.len() - pos < 4 {
                return Err(corrupt(format!("truncated hint entry at {}", pos)));
            }
            let key_size = u32::from_le_bytes(to_array(&block[pos..pos + 4])) as usize;
            let key_start = pos + 4;
            let fixed_start = key_start + key_size;
            if key_size == 0 || block.len() < fixed_start + (ENTRY_FIXED_SIZE - 4) {
                return Err(corrupt(format!("malformed hint entry at {}", pos)));
            }

            let fixed = &block[fixed_start..fixed_start + ENTRY_FIXED_SIZE - 4];
            let location = EntryLocation {
                segment_id: u16::from_le_bytes(to_array(&fixed[0..2])),
                offset: u64::from_le_bytes(to_array(&fixed[2..10])),
                timestamp: u64::from_le_bytes(to_array(&fixed[10..18])),
                entry_size: u32::from_le_bytes(to_array(&fixed[18..22])),
                value_size: u32::from_le_bytes(to_array(&fixed[22..26])),
            };
            if location.segment_id != segment_id {
                return Err(corrupt(format!(
                    "hint entry names segment {}, expected {}",
                    location.segment_id, segment_id
                )));
            }

            entries.push(HintEntry {
                key: block.slice(key_start..fixed_start),
                location,
            });
            pos = fixed_start + ENTRY_FIXED_SIZE - 4;
        }

        if entries.len() as u64 != entry_count {
            return Err(corrupt(format!(
                "hint footer claims {} entries, found {}",
                entry_count,
                entries.len()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            segment_id,
            entries,
        })
    }

    pub fn entries(&self) -> &[HintEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<HintEntry> {
        self.entries
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn segment_id(&self) -> u16 {
        self.segment_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn to_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut raw = [0u8; N];
    raw.copy_from_slice(bytes);
    raw
}
