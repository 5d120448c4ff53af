//! Compaction Module
//!
//! Rewrites the sealed segments into fresh ones holding only the newest live
//! entry of each key, then retires the originals.
//!
//! ## Protocol
//! ```text
//!  sealed segments ──pass 1──▶ winner per key (hint or scan)
//!                  ──pass 2──▶ copy live winners into *.seg.tmp (+ hints)
//!                              fsync, rename into place
//!                  ──commit──▶ write MERGE.marker
//!                              install outputs, CAS-repoint index
//!                              retire sources ─▶ reaper deletes when unused
//!                              remove MERGE.marker once all sources are gone
//! ```
//!
//! Anything that fails before the marker is written deletes the outputs and
//! leaves sources and index untouched.

mod marker;
mod merge;

use std::time::Duration;

pub use marker::{recover_interrupted_merge, MergeMarker, MARKER_FILENAME};
pub use merge::Compactor;

/// Summary of one compaction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Segment ids that were merged and retired
    pub sources: Vec<u16>,
    /// Segment ids produced by the merge
    pub outputs: Vec<u16>,
    /// Live entries copied into the outputs
    pub keys_written: u64,
    /// Winners dropped because their TTL had passed
    pub keys_expired: u64,
    /// Winners skipped because a newer write or delete landed meanwhile
    pub keys_superseded: u64,
    /// Source bytes minus output bytes
    pub bytes_reclaimed: u64,
    pub duration: Duration,
}

impl CompactionReport {
    /// True when the pass found nothing to merge
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
