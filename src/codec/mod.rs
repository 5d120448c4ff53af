//! Entry Codec
//!
//! Self-describing, checksummed records appended to segment files.
//!
//! ## Entry Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (30 bytes, little-endian)                             │
//! │   CRC32: u32 (4)      | Timestamp: u64 (8)                   │
//! │   ExpiresAt: u64 (8)  | Version: u16 (2)                     │
//! │   KeySize: u32 (4)    | ValueSize: u32 (4)                   │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Key (KeySize bytes)                                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Value (ValueSize bytes, absent for tombstones)               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! - CRC32 covers every byte after the CRC field (rest of header + key + value)
//! - `ValueSize = u32::MAX` marks a tombstone; an empty value is `ValueSize = 0`
//! - `ExpiresAt = 0` means the entry never expires

mod entry;

pub use entry::{
    checksum, decode, decode_header, decode_payload, encode, encode_into, unix_nanos, verify,
    Entry, EntryHeader,
};

// =============================================================================
// Shared Constants (used by encoder, decoder, segment scanner, hint files)
// =============================================================================

/// Header size: CRC (4) + Timestamp (8) + ExpiresAt (8) + Version (2)
/// + KeySize (4) + ValueSize (4) = 30 bytes
pub const HEADER_SIZE: usize = 30;

/// Current entry format version
pub const FORMAT_VERSION: u16 = 1;

/// Sentinel value size indicating a tombstone (deleted key)
pub const TOMBSTONE_MARKER: u32 = u32::MAX;

/// `expires_at` value for entries without a TTL
pub const NO_EXPIRY: u64 = 0;
