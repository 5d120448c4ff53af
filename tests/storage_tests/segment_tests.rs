//! Tests for segment files
//!
//! These tests verify:
//! - Segment filename generation and parsing
//! - Positional reads and writes
//! - Sequential scans, including where and why they stop early
//! - Directory sync

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use ignitekv::codec::{encode, HEADER_SIZE, NO_EXPIRY};
use ignitekv::segment::{
    hint_path, is_tmp_file, parse_segment_file_name, segment_file_name, sync_dir, tmp_path,
    Segment, SegmentScanner, StopReason,
};
use ignitekv::ErrorCode;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

/// Create segment 1 in a temp dir and write `entries` back to back
fn setup_segment(entries: &[(&[u8], Option<&[u8]>)]) -> (TempDir, Segment, Vec<u64>) {
    let temp_dir = TempDir::new().unwrap();
    let segment = Segment::create(temp_dir.path(), "segment", 1).unwrap();

    let mut offsets = Vec::new();
    let mut offset = 0u64;
    for (i, (key, value)) in entries.iter().enumerate() {
        let buf = encode(key, *value, i as u64 + 1, NO_EXPIRY).unwrap();
        segment.write_at(offset, &buf).unwrap();
        offsets.push(offset);
        offset += buf.len() as u64;
    }
    segment.sync().unwrap();
    (temp_dir, segment, offsets)
}

fn append_raw(path: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

fn scan_keys(path: &Path) -> (Vec<Vec<u8>>, SegmentScanner) {
    let mut scanner = SegmentScanner::open(path, 1).unwrap();
    let keys = scanner
        .by_ref()
        .map(|item| item.unwrap().key().to_vec())
        .collect();
    (keys, scanner)
}

// =============================================================================
// Naming Tests
// =============================================================================

#[test]
fn test_segment_file_name_format() {
    assert_eq!(segment_file_name("segment", 42, 1700), "segment_00042_1700.seg");
    assert_eq!(segment_file_name("db", 65535, 1), "db_65535_1.seg");
}

#[test]
fn test_parse_segment_file_name() {
    let name = parse_segment_file_name("segment_00042_1700.seg", "segment").unwrap();

    assert_eq!(name.id, 42);
    assert_eq!(name.created_ns, 1700);
}

#[test]
fn test_parse_rejects_foreign_files() {
    let prefix = "segment";

    assert!(parse_segment_file_name("other_00001_1.seg", prefix).is_none());
    assert!(parse_segment_file_name("segment_00001_1.hint", prefix).is_none());
    assert!(parse_segment_file_name("segment_00001_1.seg.tmp", prefix).is_none());
    assert!(parse_segment_file_name("segment_1_1.seg", prefix).is_none());
    assert!(parse_segment_file_name("segment_00000_1.seg", prefix).is_none());
    assert!(parse_segment_file_name("segment_00001_.seg", prefix).is_none());
    assert!(parse_segment_file_name("segment_0000a_1.seg", prefix).is_none());
    assert!(parse_segment_file_name("MERGE.marker", prefix).is_none());
}

#[test]
fn test_parse_does_not_match_longer_prefix() {
    // "seg" must not claim files of a store prefixed "segment"
    assert!(parse_segment_file_name("segment_00001_1.seg", "seg").is_none());
}

#[test]
fn test_hint_and_tmp_paths() {
    let seg = PathBuf::from("/data/segment_00003_99.seg");

    assert_eq!(hint_path(&seg), PathBuf::from("/data/segment_00003_99.hint"));
    assert_eq!(tmp_path(&seg), PathBuf::from("/data/segment_00003_99.seg.tmp"));
    assert!(is_tmp_file(&tmp_path(&seg)));
    assert!(!is_tmp_file(&seg));
}

// =============================================================================
// Read/Write Tests
// =============================================================================

#[test]
fn test_create_names_file_by_id() {
    let temp_dir = TempDir::new().unwrap();
    let segment = Segment::create(temp_dir.path(), "segment", 7).unwrap();

    let file_name = segment.path().file_name().unwrap().to_str().unwrap().to_string();
    let parsed = parse_segment_file_name(&file_name, "segment").unwrap();
    assert_eq!(parsed.id, 7);
    assert_eq!(segment.id(), 7);
    assert!(segment.is_empty().unwrap());
}

#[test]
fn test_read_entry_at_offsets() {
    let (_temp, segment, offsets) = setup_segment(&[
        (b"a", Some(b"one")),
        (b"bb", Some(b"two")),
        (b"ccc", None),
    ]);

    let second = segment
        .read_entry(offsets[1], (HEADER_SIZE + 2 + 3) as u32)
        .unwrap();
    assert_eq!(second.key.as_ref(), b"bb");
    assert_eq!(second.value.as_deref(), Some(&b"two"[..]));

    let third = segment.read_entry(offsets[2], (HEADER_SIZE + 3) as u32).unwrap();
    assert!(third.is_tombstone());
}

#[test]
fn test_read_entry_reports_location_on_corruption() {
    let (_temp, segment, _) = setup_segment(&[(b"key", Some(b"value"))]);
    segment.write_at(HEADER_SIZE as u64 + 3, b"VALUE").unwrap();

    let err = segment.read_entry(0, (HEADER_SIZE + 8) as u32).unwrap_err();
    assert_eq!(err.code(), ErrorCode::SegmentCorrupted);
    assert_eq!(err.segment_id(), Some(1));
    assert_eq!(err.offset(), Some(0));
    assert_eq!(err.path(), Some(segment.path()));
}

#[test]
fn test_read_past_end_is_io_error() {
    let (_temp, segment, _) = setup_segment(&[(b"key", Some(b"value"))]);

    let err = segment.read_at(1_000, 10).unwrap_err();
    assert!(err.code().is_io());
}

#[test]
fn test_truncate_shrinks_file() {
    let (_temp, segment, offsets) = setup_segment(&[(b"a", Some(b"1")), (b"b", Some(b"2"))]);

    segment.truncate(offsets[1]).unwrap();
    assert_eq!(segment.len().unwrap(), offsets[1]);
}

// =============================================================================
// Scan Tests
// =============================================================================

#[test]
fn test_scan_intact_segment() {
    let (_temp, segment, offsets) = setup_segment(&[
        (b"a", Some(b"1")),
        (b"b", None),
        (b"c", Some(b"3")),
    ]);

    let scanned: Vec<_> = segment.scan().unwrap().map(|e| e.unwrap()).collect();
    assert_eq!(scanned.len(), 3);
    assert_eq!(scanned.iter().map(|e| e.offset).collect::<Vec<_>>(), offsets);
    assert!(scanned[1].entry.is_tombstone());

    let (_, scanner) = scan_keys(segment.path());
    assert!(scanner.stop().is_none());
    assert_eq!(scanner.valid_len(), scanner.file_len());
}

#[test]
fn test_scan_empty_segment() {
    let (_temp, segment, _) = setup_segment(&[]);

    let (keys, scanner) = scan_keys(segment.path());
    assert!(keys.is_empty());
    assert_eq!(scanner.valid_len(), 0);
    assert!(scanner.stop().is_none());
}

#[test]
fn test_scan_stops_at_truncated_header() {
    let (_temp, segment, _) = setup_segment(&[(b"a", Some(b"1"))]);
    let intact = segment.len().unwrap();
    append_raw(segment.path(), &[0xFF; 10]);

    let (keys, scanner) = scan_keys(segment.path());
    assert_eq!(keys, vec![b"a".to_vec()]);
    assert_eq!(scanner.valid_len(), intact);
    let stop = scanner.stop().unwrap();
    assert_eq!(stop.reason, StopReason::TruncatedHeader);
    assert_eq!(stop.offset, intact);
}

#[test]
fn test_scan_stops_at_truncated_payload() {
    let (_temp, segment, _) = setup_segment(&[(b"a", Some(b"1"))]);
    let intact = segment.len().unwrap();

    let torn = encode(b"b", Some(b"a much longer value"), 9, NO_EXPIRY).unwrap();
    append_raw(segment.path(), &torn[..torn.len() - 4]);

    let (keys, scanner) = scan_keys(segment.path());
    assert_eq!(keys.len(), 1);
    assert_eq!(scanner.valid_len(), intact);
    assert_eq!(scanner.stop().unwrap().reason, StopReason::TruncatedPayload);
}

#[test]
fn test_scan_stops_at_checksum_mismatch() {
    let (_temp, segment, offsets) = setup_segment(&[
        (b"a", Some(b"1")),
        (b"b", Some(b"2")),
        (b"c", Some(b"3")),
    ]);
    // Corrupt the value byte of "b"
    segment.write_at(offsets[1] + HEADER_SIZE as u64 + 1, b"X").unwrap();

    let (keys, scanner) = scan_keys(segment.path());
    assert_eq!(keys, vec![b"a".to_vec()]);
    assert_eq!(scanner.valid_len(), offsets[1]);
    let stop = scanner.stop().unwrap();
    assert_eq!(stop.reason, StopReason::ChecksumMismatch);
    assert_eq!(stop.segment_id, 1);
}

#[test]
fn test_scan_stops_at_zeroed_header() {
    let (_temp, segment, _) = setup_segment(&[(b"a", Some(b"1"))]);
    append_raw(segment.path(), &[0u8; 64]);

    let (keys, scanner) = scan_keys(segment.path());
    assert_eq!(keys.len(), 1);
    assert_eq!(scanner.stop().unwrap().reason, StopReason::BadHeader);
}

// =============================================================================
// Directory Sync Tests
// =============================================================================

#[test]
fn test_sync_dir() {
    let temp_dir = TempDir::new().unwrap();
    Segment::create(temp_dir.path(), "segment", 1).unwrap();

    sync_dir(temp_dir.path()).unwrap();
}

#[test]
fn test_sync_dir_missing_directory() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("missing");

    let err = sync_dir(&missing).unwrap_err();

    assert_eq!(err.code(), ErrorCode::NotFound);
    assert_eq!(err.path(), Some(missing.as_path()));
}
