//! Segment File
//!
//! A single append-only data file. All I/O is positional (`pread`/`pwrite`),
//! so one shared handle serves any number of concurrent readers while the
//! writer appends at the tail.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::codec::{self, Entry, unix_nanos};
use crate::error::{IgniteError, Result};

use super::{hint_path, segment_file_name, sync_dir, SegmentScanner};

/// Handle to one segment file
///
/// Shared as `Arc<Segment>`: the manager's table holds one reference, every
/// in-flight read holds another. A retired segment is only deleted once its
/// last reference is gone.
#[derive(Debug)]
pub struct Segment {
    id: u16,
    path: PathBuf,
    file: File,
}

impl Segment {
    /// Create a new, empty segment file in `dir`
    pub fn create(dir: &Path, prefix: &str, id: u16) -> Result<Self> {
        let path = dir.join(segment_file_name(prefix, id, unix_nanos()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                IgniteError::from_io(e, "failed to create segment file")
                    .with_segment(id)
                    .with_path(&path)
            })?;
        // The new name must survive a crash before entries are acknowledged
        sync_dir(dir)?;

        Ok(Self { id, path, file })
    }

    /// Create (or truncate) a segment file at an explicit path
    ///
    /// Used for merge outputs, which are written under a temporary name.
    pub fn create_at(path: &Path, id: u16) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                IgniteError::from_io(e, "failed to create segment file")
                    .with_segment(id)
                    .with_path(path)
            })?;

        Ok(Self {
            id,
            path: path.to_path_buf(),
            file,
        })
    }

    /// Open an existing segment for reading and appending
    pub fn open(path: &Path, id: u16) -> Result<Self> {
        Self::open_with(path, id, true)
    }

    /// Open an existing sealed segment for reading only
    pub fn open_read_only(path: &Path, id: u16) -> Result<Self> {
        Self::open_with(path, id, false)
    }

    fn open_with(path: &Path, id: u16, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| {
                IgniteError::from_io(e, "failed to open segment file")
                    .with_segment(id)
                    .with_path(path)
            })?;

        Ok(Self {
            id,
            path: path.to_path_buf(),
            file,
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read `len` raw bytes starting at `offset`
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, offset).map_err(|e| {
            IgniteError::from_io(e, "failed to read segment")
                .with_segment(self.id)
                .with_offset(offset)
                .with_path(&self.path)
        })?;
        Ok(Bytes::from(buf))
    }

    /// Read and verify the entry of `entry_size` bytes at `offset`
    ///
    /// One read covers header, key and value; a checksum or header failure
    /// is reported as `SegmentCorrupted` with the segment and offset attached.
    pub fn read_entry(&self, offset: u64, entry_size: u32) -> Result<Entry> {
        let raw = self.read_at(offset, entry_size as usize)?;
        codec::decode(raw).map_err(|e| e.with_segment(self.id).with_offset(offset).with_path(&self.path))
    }

    /// Sequential scan over every intact entry, stopping at the first bad one
    pub fn scan(&self) -> Result<SegmentScanner> {
        SegmentScanner::open(&self.path, self.id)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write `buf` at `offset`
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, offset).map_err(|e| {
            IgniteError::from_io(e, "failed to append to segment")
                .with_segment(self.id)
                .with_offset(offset)
                .with_path(&self.path)
        })
    }

    /// Cut the file back to `len` bytes
    pub fn truncate(&self, len: u64) -> Result<()> {
        self.file.set_len(len).map_err(|e| {
            IgniteError::from_io(e, "failed to truncate segment")
                .with_segment(self.id)
                .with_offset(len)
                .with_path(&self.path)
        })
    }

    /// fsync data and metadata
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(|e| {
            IgniteError::from_io(e, "failed to sync segment")
                .with_segment(self.id)
                .with_path(&self.path)
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of this segment's hint file (whether or not it exists)
    pub fn hint_path(&self) -> PathBuf {
        hint_path(&self.path)
    }

    /// Current on-disk length
    pub fn len(&self) -> Result<u64> {
        let metadata = self.file.metadata().map_err(|e| {
            IgniteError::from_io(e, "failed to stat segment")
                .with_segment(self.id)
                .with_path(&self.path)
        })?;
        Ok(metadata.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
