//! Entry encoding and decoding
//!
//! Encoding is infallible apart from size limits; decoding treats every
//! inconsistency (short buffer, unknown version, checksum mismatch) as
//! `SegmentCorrupted` so callers can stop a scan at the first bad entry.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::error::{IgniteError, Result};

use super::{FORMAT_VERSION, HEADER_SIZE, NO_EXPIRY, TOMBSTONE_MARKER};

// Field offsets inside the header
const TIMESTAMP_AT: usize = 4;
const EXPIRES_AT: usize = 12;
const VERSION_AT: usize = 20;
const KEY_SIZE_AT: usize = 22;
const VALUE_SIZE_AT: usize = 26;

/// Parsed entry header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// CRC32 over everything after this field
    pub checksum: u32,
    /// Write timestamp (nanoseconds since the Unix epoch)
    pub timestamp: u64,
    /// Expiry instant in nanoseconds, `NO_EXPIRY` if none
    pub expires_at: u64,
    pub version: u16,
    pub key_size: u32,
    /// Value length, or `TOMBSTONE_MARKER` for deletes
    pub value_size: u32,
}

impl EntryHeader {
    pub fn is_tombstone(&self) -> bool {
        self.value_size == TOMBSTONE_MARKER
    }

    /// Number of value bytes stored on disk (zero for tombstones)
    pub fn stored_value_len(&self) -> u64 {
        if self.is_tombstone() {
            0
        } else {
            self.value_size as u64
        }
    }

    /// Bytes following the header: key plus stored value
    pub fn payload_len(&self) -> u64 {
        self.key_size as u64 + self.stored_value_len()
    }

    /// Full on-disk size of the entry
    pub fn entry_size(&self) -> u64 {
        HEADER_SIZE as u64 + self.payload_len()
    }

    /// True when the entry carries a TTL that has passed at `now`
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at != NO_EXPIRY && now >= self.expires_at
    }
}

/// A fully decoded, checksum-verified entry
///
/// `key` and `value` are slices of the buffer the entry was read into,
/// so decoding does not copy the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub header: EntryHeader,
    pub key: Bytes,
    /// `None` for tombstones
    pub value: Option<Bytes>,
}

impl Entry {
    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    pub fn is_tombstone(&self) -> bool {
        self.header.is_tombstone()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.header.is_expired(now)
    }

    pub fn entry_size(&self) -> u64 {
        self.header.entry_size()
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode an entry into a fresh buffer (`value = None` means tombstone)
pub fn encode(key: &[u8], value: Option<&[u8]>, timestamp: u64, expires_at: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_into(&mut buf, key, value, timestamp, expires_at)?;
    Ok(buf)
}

/// Encode an entry into `buf`, replacing its contents
///
/// Reusing one buffer across appends avoids an allocation per write.
pub fn encode_into(
    buf: &mut Vec<u8>,
    key: &[u8],
    value: Option<&[u8]>,
    timestamp: u64,
    expires_at: u64,
) -> Result<()> {
    if key.is_empty() {
        return Err(IgniteError::validation("key", "non_empty", "key must not be empty"));
    }
    let key_size = u32::try_from(key.len())
        .map_err(|_| IgniteError::validation("key", "max_size", "key does not fit in a u32 length"))?;

    let value_size = match value {
        Some(v) => match u32::try_from(v.len()) {
            Ok(len) if len != TOMBSTONE_MARKER => len,
            _ => {
                return Err(IgniteError::validation(
                    "value",
                    "max_size",
                    "value must be shorter than u32::MAX bytes",
                ))
            }
        },
        None => TOMBSTONE_MARKER,
    };

    buf.clear();
    buf.reserve(HEADER_SIZE + key.len() + value.map_or(0, <[u8]>::len));

    // CRC placeholder, patched once the rest of the entry is in place
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&timestamp.to_le_bytes());
    buf.extend_from_slice(&expires_at.to_le_bytes());
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&key_size.to_le_bytes());
    buf.extend_from_slice(&value_size.to_le_bytes());
    buf.extend_from_slice(key);
    if let Some(v) = value {
        buf.extend_from_slice(v);
    }

    let crc = checksum(&buf[TIMESTAMP_AT..]);
    buf[..TIMESTAMP_AT].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// CRC32 of the bytes an entry checksum covers
pub fn checksum(covered: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(covered);
    hasher.finalize()
}

// =============================================================================
// Decoding
// =============================================================================

/// Parse and sanity-check the fixed-size header at the start of `buf`
///
/// Does not verify the checksum; that needs the whole entry (see [`verify`]).
pub fn decode_header(buf: &[u8]) -> Result<EntryHeader> {
    if buf.len() < HEADER_SIZE {
        return Err(IgniteError::corrupted(format!(
            "truncated entry header: {} of {} bytes",
            buf.len(),
            HEADER_SIZE
        )));
    }

    let header = EntryHeader {
        checksum: read_u32(buf, 0),
        timestamp: read_u64(buf, TIMESTAMP_AT),
        expires_at: read_u64(buf, EXPIRES_AT),
        version: read_u16(buf, VERSION_AT),
        key_size: read_u32(buf, KEY_SIZE_AT),
        value_size: read_u32(buf, VALUE_SIZE_AT),
    };

    if header.version != FORMAT_VERSION {
        return Err(IgniteError::corrupted(format!(
            "unsupported entry version {}",
            header.version
        )));
    }

    // Zero-length keys are never written; a zero here means garbage or padding
    if header.key_size == 0 {
        return Err(IgniteError::corrupted("entry header has an empty key"));
    }

    Ok(header)
}

/// Split a payload (bytes after the header) into key and value
pub fn decode_payload(header: EntryHeader, payload: Bytes) -> Result<Entry> {
    if payload.len() as u64 != header.payload_len() {
        return Err(IgniteError::corrupted(format!(
            "payload length {} does not match header ({} expected)",
            payload.len(),
            header.payload_len()
        )));
    }

    let key_end = header.key_size as usize;
    let key = payload.slice(..key_end);
    let value = if header.is_tombstone() {
        None
    } else {
        Some(payload.slice(key_end..))
    };

    Ok(Entry { header, key, value })
}

/// Check the stored CRC of a complete entry against its contents
pub fn verify(entry: &[u8]) -> bool {
    if entry.len() < HEADER_SIZE {
        return false;
    }
    read_u32(entry, 0) == checksum(&entry[TIMESTAMP_AT..])
}

/// Decode and verify a complete entry
pub fn decode(entry: Bytes) -> Result<Entry> {
    let header = decode_header(&entry)?;

    if entry.len() as u64 != header.entry_size() {
        return Err(IgniteError::corrupted(format!(
            "entry length {} does not match header ({} expected)",
            entry.len(),
            header.entry_size()
        )));
    }

    let actual = checksum(&entry[TIMESTAMP_AT..]);
    if actual != header.checksum {
        return Err(IgniteError::corrupted("entry checksum mismatch")
            .with_detail("expected_crc", format!("{:#010x}", header.checksum))
            .with_detail("actual_crc", format!("{:#010x}", actual)));
    }

    decode_payload(header, entry.slice(HEADER_SIZE..))
}

/// Wall-clock time in nanoseconds since the Unix epoch
pub fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&buf[at..at + 2]);
    u16::from_le_bytes(raw)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}
