//! Segment Scanner
//!
//! Sequential iteration over the entries of a segment file, oldest first.
//! The scan ends cleanly at end of file, or at the first torn or corrupt
//! entry; in the latter case [`SegmentScanner::stop`] says where and why.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use bytes::Bytes;

use crate::codec::{self, Entry, HEADER_SIZE};
use crate::error::{IgniteError, Result};

/// Buffered read size for scans
const SCAN_BUFFER_SIZE: usize = 256 * 1024;

/// One intact entry found by a scan
#[derive(Debug, Clone)]
pub struct ScannedEntry {
    /// Byte offset of the entry within its segment
    pub offset: u64,
    pub entry: Entry,
}

impl ScannedEntry {
    pub fn key(&self) -> &[u8] {
        &self.entry.key
    }

    pub fn entry_size(&self) -> u32 {
        self.entry.entry_size() as u32
    }
}

/// Why a scan stopped before end of file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Fewer bytes than a header remained
    TruncatedHeader,
    /// Header promised more bytes than the file holds
    TruncatedPayload,
    /// Header failed to parse (bad version, empty key, absurd sizes)
    BadHeader,
    /// Entry bytes do not match their CRC
    ChecksumMismatch,
}

/// Where a scan stopped early
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanStop {
    pub segment_id: u16,
    pub offset: u64,
    pub reason: StopReason,
}

/// Iterator over the entries of one segment
pub struct SegmentScanner {
    segment_id: u16,
    reader: BufReader<File>,
    /// Offset of the next entry (== end of the last intact entry)
    offset: u64,
    file_len: u64,
    stop: Option<ScanStop>,
    done: bool,
}

impl SegmentScanner {
    /// Open a scanner with its own file handle positioned at offset 0
    pub fn open(path: &Path, segment_id: u16) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            IgniteError::from_io(e, "failed to open segment for scanning")
                .with_segment(segment_id)
                .with_path(path)
        })?;
        let file_len = file
            .metadata()
            .map_err(|e| IgniteError::from_io(e, "failed to stat segment").with_segment(segment_id))?
            .len();

        Ok(Self {
            segment_id,
            reader: BufReader::with_capacity(SCAN_BUFFER_SIZE, file),
            offset: 0,
            file_len,
            stop: None,
            done: false,
        })
    }

    /// Length of the intact prefix scanned so far
    ///
    /// After the iterator is exhausted this is where a torn tail begins,
    /// or the file length if the whole segment is intact.
    pub fn valid_len(&self) -> u64 {
        self.offset
    }

    /// File length observed when the scanner was opened
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// The early stop, if the scan hit a torn or corrupt entry
    pub fn stop(&self) -> Option<&ScanStop> {
        self.stop.as_ref()
    }

    fn halt(&mut self, reason: StopReason) -> Option<Result<ScannedEntry>> {
        self.stop = Some(ScanStop {
            segment_id: self.segment_id,
            offset: self.offset,
            reason,
        });
        self.done = true;
        None
    }

    fn io_failure(&mut self, err: std::io::Error) -> Option<Result<ScannedEntry>> {
        self.done = true;
        Some(Err(IgniteError::from_io(err, "failed to read segment during scan")
            .with_segment(self.segment_id)
            .with_offset(self.offset)))
    }
}

impl Iterator for SegmentScanner {
    type Item = Result<ScannedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let remaining = self.file_len.saturating_sub(self.offset);
        if remaining == 0 {
            self.done = true;
            return None;
        }
        if remaining < HEADER_SIZE as u64 {
            return self.halt(StopReason::TruncatedHeader);
        }

        // Read and parse the fixed-size header
        let mut header_buf = [0u8; HEADER_SIZE];
        if let Err(e) = self.reader.read_exact(&mut header_buf) {
            return self.io_failure(e);
        }
        let header = match codec::decode_header(&header_buf) {
            Ok(h) => h,
            Err(_) => return self.halt(StopReason::BadHeader),
        };

        let entry_size = header.entry_size();
        if entry_size > u32::MAX as u64 {
            return self.halt(StopReason::BadHeader);
        }
        if entry_size > remaining {
            return self.halt(StopReason::TruncatedPayload);
        }

        // Read the payload into the same buffer so the CRC covers one slice
        let mut buf = Vec::with_capacity(entry_size as usize);
        buf.extend_from_slice(&header_buf);
        buf.resize(entry_size as usize, 0);
        if let Err(e) = self.reader.read_exact(&mut buf[HEADER_SIZE..]) {
            return self.io_failure(e);
        }

        if !codec::verify(&buf) {
            return self.halt(StopReason::ChecksumMismatch);
        }

        let payload = Bytes::from(buf).slice(HEADER_SIZE..);
        let entry = match codec::decode_payload(header, payload) {
            Ok(entry) => entry,
            Err(_) => return self.halt(StopReason::BadHeader),
        };

        let offset = self.offset;
        self.offset += entry_size;
        Some(Ok(ScannedEntry { offset, entry }))
    }
}
