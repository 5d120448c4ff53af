//! Tests for the entry codec
//!
//! These tests verify:
//! - Header layout and little-endian field placement
//! - Tombstone and TTL encoding
//! - Checksum verification and corruption detection
//! - Rejection of malformed headers

use bytes::Bytes;
use ignitekv::codec::{
    self, checksum, decode, decode_header, decode_payload, encode, encode_into, verify, FORMAT_VERSION,
    HEADER_SIZE, NO_EXPIRY, TOMBSTONE_MARKER,
};
use ignitekv::ErrorCode;

// =============================================================================
// Helper Functions
// =============================================================================

fn encode_value(key: &[u8], value: &[u8], timestamp: u64) -> Vec<u8> {
    encode(key, Some(value), timestamp, NO_EXPIRY).unwrap()
}

fn read_u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn read_u64_at(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

// =============================================================================
// Layout Tests
// =============================================================================

#[test]
fn test_header_size_is_thirty_bytes() {
    assert_eq!(HEADER_SIZE, 30);
}

#[test]
fn test_encoded_length_is_header_plus_payload() {
    let buf = encode_value(b"key", b"value", 1);

    assert_eq!(buf.len(), HEADER_SIZE + 3 + 5);
}

#[test]
fn test_header_fields_are_little_endian() {
    let buf = encode(b"abc", Some(b"hello"), 0x0102_0304_0506_0708, 0x1111_2222_3333_4444).unwrap();

    assert_eq!(read_u64_at(&buf, 4), 0x0102_0304_0506_0708);
    assert_eq!(read_u64_at(&buf, 12), 0x1111_2222_3333_4444);
    assert_eq!(u16::from_le_bytes([buf[20], buf[21]]), FORMAT_VERSION);
    assert_eq!(read_u32_at(&buf, 22), 3);
    assert_eq!(read_u32_at(&buf, 26), 5);
    assert_eq!(&buf[30..33], b"abc");
    assert_eq!(&buf[33..], b"hello");
}

#[test]
fn test_checksum_covers_everything_after_crc_field() {
    let buf = encode_value(b"k", b"v", 42);

    assert_eq!(read_u32_at(&buf, 0), checksum(&buf[4..]));
}

#[test]
fn test_tombstone_uses_marker_and_has_no_value_bytes() {
    let buf = encode(b"gone", None, 7, NO_EXPIRY).unwrap();

    assert_eq!(buf.len(), HEADER_SIZE + 4);
    assert_eq!(read_u32_at(&buf, 26), TOMBSTONE_MARKER);

    let entry = decode(Bytes::from(buf)).unwrap();
    assert!(entry.is_tombstone());
    assert_eq!(entry.value, None);
    assert_eq!(entry.header.stored_value_len(), 0);
}

#[test]
fn test_empty_value_is_not_a_tombstone() {
    let entry = decode(Bytes::from(encode_value(b"k", b"", 1))).unwrap();

    assert!(!entry.is_tombstone());
    assert_eq!(entry.value.as_deref(), Some(&b""[..]));
}

// =============================================================================
// Decode Tests
// =============================================================================

#[test]
fn test_decode_returns_key_value_and_metadata() {
    let buf = encode(b"user:1", Some(b"alice"), 99, 1_000).unwrap();
    let size = buf.len() as u64;

    let entry = decode(Bytes::from(buf)).unwrap();

    assert_eq!(entry.key.as_ref(), b"user:1");
    assert_eq!(entry.value.as_deref(), Some(&b"alice"[..]));
    assert_eq!(entry.timestamp(), 99);
    assert_eq!(entry.header.expires_at, 1_000);
    assert_eq!(entry.entry_size(), size);
}

#[test]
fn test_decode_header_then_payload() {
    let buf = encode_value(b"split", b"parts", 5);
    let header = decode_header(&buf).unwrap();

    assert_eq!(header.payload_len(), 10);

    let payload = Bytes::copy_from_slice(&buf[HEADER_SIZE..]);
    let entry = decode_payload(header, payload).unwrap();
    assert_eq!(entry.key.as_ref(), b"split");
    assert_eq!(entry.value.as_deref(), Some(&b"parts"[..]));
}

#[test]
fn test_decode_payload_rejects_wrong_length() {
    let buf = encode_value(b"key", b"value", 5);
    let header = decode_header(&buf).unwrap();

    let short = Bytes::copy_from_slice(&buf[HEADER_SIZE..buf.len() - 1]);
    let err = decode_payload(header, short).unwrap_err();
    assert_eq!(err.code(), ErrorCode::SegmentCorrupted);
}

#[test]
fn test_encode_into_reuses_buffer() {
    let mut buf = Vec::new();
    encode_into(&mut buf, b"first-key", Some(b"a long first value"), 1, NO_EXPIRY).unwrap();
    encode_into(&mut buf, b"k2", Some(b"v"), 2, NO_EXPIRY).unwrap();

    assert_eq!(buf.len(), HEADER_SIZE + 3);
    let entry = decode(Bytes::from(buf)).unwrap();
    assert_eq!(entry.key.as_ref(), b"k2");
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_flipped_value_bit_fails_checksum() {
    let mut buf = encode_value(b"key", b"value", 1);
    let last = buf.len() - 1;
    buf[last] ^= 0x01;

    assert!(!verify(&buf));
    let err = decode(Bytes::from(buf)).unwrap_err();
    assert!(err.is_corruption());
    assert!(err.details().contains_key("expected_crc"));
    assert!(err.details().contains_key("actual_crc"));
}

#[test]
fn test_flipped_timestamp_bit_fails_checksum() {
    let mut buf = encode_value(b"key", b"value", 1);
    buf[4] ^= 0x80;

    assert!(!verify(&buf));
    assert!(decode(Bytes::from(buf)).is_err());
}

#[test]
fn test_truncated_header_is_corruption() {
    let buf = encode_value(b"key", b"value", 1);

    let err = decode_header(&buf[..HEADER_SIZE - 1]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::SegmentCorrupted);
    assert!(!verify(&buf[..10]));
}

#[test]
fn test_truncated_entry_is_corruption() {
    let buf = encode_value(b"key", b"value", 1);

    let err = decode(Bytes::copy_from_slice(&buf[..buf.len() - 2])).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn test_unknown_version_rejected() {
    let mut buf = encode_value(b"key", b"value", 1);
    buf[20..22].copy_from_slice(&2u16.to_le_bytes());

    let err = decode_header(&buf).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn test_zeroed_header_rejected() {
    let zeros = [0u8; HEADER_SIZE + 8];

    // version 0 and key_size 0 are both invalid
    assert!(decode_header(&zeros).is_err());
}

// =============================================================================
// Validation and Expiry Tests
// =============================================================================

#[test]
fn test_empty_key_rejected() {
    let err = encode(b"", Some(b"value"), 1, NO_EXPIRY).unwrap_err();

    assert_eq!(err.code(), ErrorCode::InvalidInput);
}

#[test]
fn test_expiry_semantics() {
    let never = decode(Bytes::from(encode_value(b"k", b"v", 1))).unwrap();
    assert!(!never.is_expired(u64::MAX));

    let ttl = decode(Bytes::from(encode(b"k", Some(b"v"), 1, 500).unwrap())).unwrap();
    assert!(!ttl.is_expired(499));
    assert!(ttl.is_expired(500));
    assert!(ttl.is_expired(501));
}

#[test]
fn test_unix_nanos_is_after_2020() {
    // 2020-01-01T00:00:00Z
    assert!(codec::unix_nanos() > 1_577_836_800_000_000_000);
}
