//! Hint Files
//!
//! Compact per-segment summaries that let startup rebuild the index without
//! reading values. A valid hint also marks its segment as sealed.
//!
//! ## File Format
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ Entries (variable, one per distinct key in the segment)       │
//! │   [KeySize: u32][Key][SegmentId: u16][Offset: u64]            │
//! │   [Timestamp: u64][EntrySize: u32][ValueSize: u32]            │
//! │   (ValueSize = u32::MAX means tombstone)                      │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Footer (16 bytes)                                             │
//! │   Magic: "IGHT" (4) | EntryCount: u64 (8) | CRC32: u32 (4)    │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The CRC covers the entries block. Hints are written to `*.hint.tmp` and
//! renamed into place, so a hint file either exists complete or not at all.

mod reader;
mod writer;

use bytes::Bytes;

use crate::index::EntryLocation;

pub use reader::HintReader;
pub use writer::{write_segment_hint, HintSummary, HintWriter};

// =============================================================================
// Shared Constants (used by writer and reader)
// =============================================================================

/// Magic bytes identifying an ignitekv hint file
pub(crate) const HINT_MAGIC: &[u8; 4] = b"IGHT";

/// Footer size: Magic (4) + EntryCount (8) + CRC (4) = 16 bytes
pub(crate) const FOOTER_SIZE: usize = 16;

/// Fixed part of each hint entry: KeySize (4) + SegmentId (2) + Offset (8)
/// + Timestamp (8) + EntrySize (4) + ValueSize (4) = 30 bytes
pub(crate) const ENTRY_FIXED_SIZE: usize = 30;

/// One hint record: a key and the location of its newest entry in the segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintEntry {
    pub key: Bytes,
    pub location: EntryLocation,
}

impl HintEntry {
    pub fn is_tombstone(&self) -> bool {
        self.location.is_tombstone()
    }
}
