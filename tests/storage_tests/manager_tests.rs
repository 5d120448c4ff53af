//! Tests for SegmentManager
//!
//! These tests verify:
//! - Opening/creating the segment directory
//! - Appends, offsets and timestamps
//! - Rotation at the size threshold
//! - Restart: resuming the active segment, truncating torn tails
//! - Startup cleanup of temp files and orphaned hints
//! - Retiring and reaping segments
//! - Sealed snapshots racing with rotation
//! - Segment id exhaustion

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam::channel;
use ignitekv::codec::{encode, HEADER_SIZE, NO_EXPIRY};
use ignitekv::config::{Config, SyncStrategy};
use ignitekv::index::Index;
use ignitekv::segment::{segment_file_name, SegmentManager};
use ignitekv::ErrorCode;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

/// Key "key_NN" (6 bytes) + 10 byte value
const ENTRY_SIZE: u64 = (HEADER_SIZE + 6 + 10) as u64;

fn config_for(path: &Path, max_segment_size: u64) -> Config {
    Config::builder()
        .data_dir(path)
        .max_segment_size(max_segment_size)
        .sync_strategy(SyncStrategy::EveryWrite)
        .hint_files(false)
        .build()
}

fn open_manager(config: &Config) -> (SegmentManager, Index) {
    let index = Index::new();
    let (manager, _report) = SegmentManager::open(config, &index, None).unwrap();
    (manager, index)
}

fn key(i: usize) -> Vec<u8> {
    format!("key_{:02}", i).into_bytes()
}

fn put(manager: &SegmentManager, index: &Index, i: usize) {
    let mut writer = manager.writer().unwrap();
    let pointer = writer.append(&key(i), Some(b"0123456789"), NO_EXPIRY).unwrap();
    index.put(pointer);
}

fn segment_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".seg"))
        .collect();
    names.sort();
    names
}

// =============================================================================
// Open/Create Tests
// =============================================================================

#[test]
fn test_open_creates_directory_and_first_segment() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_for(&temp_dir.path().join("db"), 1024);

    let (manager, index) = open_manager(&config);

    assert!(config.segment_path().is_dir());
    assert_eq!(manager.active_id(), 1);
    assert_eq!(manager.segment_count(), 1);
    assert!(manager.sealed_segments().is_empty());
    assert!(index.is_empty());
    assert_eq!(segment_files(&config.segment_path()).len(), 1);
}

// =============================================================================
// Append Tests
// =============================================================================

#[test]
fn test_append_returns_sequential_offsets() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, _index) = open_manager(&config_for(temp_dir.path(), 4096));

    let mut writer = manager.writer().unwrap();
    let first = writer.append(b"key_00", Some(b"0123456789"), NO_EXPIRY).unwrap();
    let second = writer.append(b"key_01", Some(b"0123456789"), NO_EXPIRY).unwrap();

    assert_eq!(first.segment_id, 1);
    assert_eq!(first.offset, 0);
    assert_eq!(first.entry_size as u64, ENTRY_SIZE);
    assert_eq!(second.offset, ENTRY_SIZE);
    assert_eq!(writer.active_size(), 2 * ENTRY_SIZE);
}

#[test]
fn test_timestamps_strictly_increase() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, _index) = open_manager(&config_for(temp_dir.path(), 1 << 20));

    let mut writer = manager.writer().unwrap();
    let mut last = 0;
    for i in 0..200 {
        let pointer = writer.append(&key(i % 100), Some(b"v"), NO_EXPIRY).unwrap();
        assert!(pointer.timestamp > last);
        last = pointer.timestamp;
    }
}

#[test]
fn test_tombstone_pointer() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, _index) = open_manager(&config_for(temp_dir.path(), 4096));

    let mut writer = manager.writer().unwrap();
    let pointer = writer.append(b"gone", None, NO_EXPIRY).unwrap();
    drop(writer);

    assert!(pointer.is_tombstone());
    assert!(manager.read(&pointer).unwrap().is_tombstone());
}

#[test]
fn test_read_back_through_manager() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, index) = open_manager(&config_for(temp_dir.path(), 4096));
    put(&manager, &index, 3);

    let pointer = index.get(b"key_03").unwrap();
    let entry = manager.read(&pointer).unwrap();
    assert_eq!(entry.value.as_deref(), Some(&b"0123456789"[..]));
}

// =============================================================================
// Rotation Tests
// =============================================================================

#[test]
fn test_exact_fill_rotates_on_next_write() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, index) = open_manager(&config_for(temp_dir.path(), 3 * ENTRY_SIZE));

    for i in 0..3 {
        put(&manager, &index, i);
    }
    // Exactly full, still active
    assert_eq!(manager.active_id(), 1);
    assert_eq!(manager.stats().active_size, 3 * ENTRY_SIZE);

    put(&manager, &index, 3);
    assert_eq!(manager.active_id(), 2);
    let pointer = index.get(b"key_03").unwrap();
    assert_eq!(pointer.segment_id, 2);
    assert_eq!(pointer.offset, 0);

    let sealed = manager.sealed_segments();
    assert_eq!(sealed.len(), 1);
    assert_eq!(sealed[0].len().unwrap(), 3 * ENTRY_SIZE);
}

#[test]
fn test_rotation_notifies_listener() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_for(temp_dir.path(), 2 * ENTRY_SIZE);
    let index = Index::new();
    let (tx, rx) = channel::unbounded();
    let (manager, _) = SegmentManager::open(&config, &index, Some(tx)).unwrap();

    for i in 0..5 {
        put(&manager, &index, i);
    }

    let sealed: Vec<u16> = rx.try_iter().collect();
    assert_eq!(sealed, vec![1, 2]);
    assert_eq!(manager.active_id(), 3);
}

#[test]
fn test_entry_larger_than_segment_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, _index) = open_manager(&config_for(temp_dir.path(), 64));

    let mut writer = manager.writer().unwrap();
    let err = writer.append(b"key", Some(&[0u8; 64]), NO_EXPIRY).unwrap_err();

    assert_eq!(err.code(), ErrorCode::InvalidInput);
    assert_eq!(writer.active_size(), 0);
}

#[test]
fn test_oversize_entry_does_not_rotate() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, index) = open_manager(&config_for(temp_dir.path(), 2 * ENTRY_SIZE));
    put(&manager, &index, 0);

    let mut writer = manager.writer().unwrap();
    assert!(writer.append(b"big", Some(&[0u8; 128]), NO_EXPIRY).is_err());
    drop(writer);

    assert_eq!(manager.active_id(), 1);
}

// =============================================================================
// Restart Tests
// =============================================================================

#[test]
fn test_reopen_resumes_active_segment() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_for(temp_dir.path(), 4096);
    {
        let (manager, index) = open_manager(&config);
        put(&manager, &index, 0);
        put(&manager, &index, 1);
        manager.close().unwrap();
    }

    let index = Index::new();
    let (manager, report) = SegmentManager::open(&config, &index, None).unwrap();

    assert_eq!(manager.active_id(), 1);
    assert_eq!(manager.stats().active_size, 2 * ENTRY_SIZE);
    assert_eq!(report.keys, 2);
    assert_eq!(index.len(), 2);

    // New writes land after the recovered entries
    put(&manager, &index, 2);
    assert_eq!(index.get(b"key_02").unwrap().offset, 2 * ENTRY_SIZE);
}

#[test]
fn test_reopen_continues_timestamps() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_for(temp_dir.path(), 4096);
    let before = {
        let (manager, index) = open_manager(&config);
        put(&manager, &index, 0);
        index.get(b"key_00").unwrap().timestamp
    };

    let (manager, index) = open_manager(&config);
    put(&manager, &index, 0);
    assert!(index.get(b"key_00").unwrap().timestamp > before);
}

#[test]
fn test_reopen_truncates_torn_tail() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_for(temp_dir.path(), 4096);
    let path = {
        let (manager, index) = open_manager(&config);
        put(&manager, &index, 0);
        manager.handle(1).unwrap().path().to_path_buf()
    };

    let torn = encode(b"key_01", Some(b"0123456789"), u64::MAX / 2, NO_EXPIRY).unwrap();
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&torn[..torn.len() / 2]).unwrap();
    drop(file);

    let index = Index::new();
    let (manager, report) = SegmentManager::open(&config, &index, None).unwrap();

    assert_eq!(fs::metadata(&path).unwrap().len(), ENTRY_SIZE);
    assert_eq!(report.corrupted().count(), 1);
    assert!(index.get(b"key_01").is_none());

    put(&manager, &index, 1);
    assert_eq!(index.get(b"key_01").unwrap().offset, ENTRY_SIZE);
}

#[test]
fn test_reopen_full_segment_starts_next_id() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_for(temp_dir.path(), 2 * ENTRY_SIZE);
    {
        let (manager, index) = open_manager(&config);
        put(&manager, &index, 0);
        put(&manager, &index, 1);
    }

    let (manager, _index) = open_manager(&config);
    assert_eq!(manager.active_id(), 2);
    assert_eq!(manager.sealed_segments().len(), 1);
}

// =============================================================================
// Startup Cleanup Tests
// =============================================================================

#[test]
fn test_open_removes_tmp_files_and_orphan_hints() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_for(temp_dir.path(), 4096);
    let dir = config.segment_path();
    fs::create_dir_all(&dir).unwrap();

    fs::write(dir.join("segment_00009_1.seg.tmp"), b"partial").unwrap();
    fs::write(dir.join("segment_00008_1.hint"), b"orphan").unwrap();
    fs::write(dir.join("unrelated.txt"), b"keep").unwrap();
    fs::write(dir.join("other_00001_1.hint"), b"keep").unwrap();

    let _ = open_manager(&config);

    assert!(!dir.join("segment_00009_1.seg.tmp").exists());
    assert!(!dir.join("segment_00008_1.hint").exists());
    assert!(dir.join("unrelated.txt").exists());
    assert!(dir.join("other_00001_1.hint").exists());
}

#[test]
fn test_open_ignores_other_prefixes() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_for(temp_dir.path(), 4096);
    let dir = config.segment_path();
    fs::create_dir_all(&dir).unwrap();

    let foreign = encode(b"foreign", Some(b"x"), 1, NO_EXPIRY).unwrap();
    fs::write(dir.join(segment_file_name("other", 1, 1)), foreign).unwrap();

    let (manager, index) = open_manager(&config);
    assert!(index.is_empty());
    assert_eq!(manager.segment_count(), 1);
}

#[test]
fn test_duplicate_segment_ids_fail_recovery() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_for(temp_dir.path(), 4096);
    let dir = config.segment_path();
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(segment_file_name("segment", 1, 100)), b"").unwrap();
    fs::write(dir.join(segment_file_name("segment", 1, 200)), b"").unwrap();

    let index = Index::new();
    let err = SegmentManager::open(&config, &index, None).err().unwrap();
    assert_eq!(err.code(), ErrorCode::RecoveryFailed);
}

// =============================================================================
// Retire/Reap Tests
// =============================================================================

#[test]
fn test_reap_waits_for_readers() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, index) = open_manager(&config_for(temp_dir.path(), ENTRY_SIZE));
    put(&manager, &index, 0);
    put(&manager, &index, 1);

    let sealed = manager.handle(1).unwrap();
    let path = sealed.path().to_path_buf();

    assert_eq!(manager.retire(&[1]), 1);
    assert!(manager.handle(1).is_none());

    // A reader still holds the segment
    assert_eq!(manager.reap(), 1);
    assert!(path.exists());
    assert_eq!(sealed.read_entry(0, ENTRY_SIZE as u32).unwrap().key.as_ref(), b"key_00");

    drop(sealed);
    assert_eq!(manager.reap(), 0);
    assert!(!path.exists());
    assert_eq!(manager.retired_count(), 0);
}

#[test]
fn test_retire_unknown_id_is_ignored() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, _index) = open_manager(&config_for(temp_dir.path(), 4096));

    assert_eq!(manager.retire(&[42]), 0);
    assert_eq!(manager.reap(), 0);
}

#[test]
fn test_sealed_segments_never_include_active_during_rotation() {
    let temp_dir = TempDir::new().unwrap();
    // One entry per segment: every put after the first rotates
    let (manager, index) = open_manager(&config_for(temp_dir.path(), ENTRY_SIZE));
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..500 {
                put(&manager, &index, i % 100);
            }
            done.store(true, Ordering::SeqCst);
        });

        s.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                let sealed: Vec<u16> = manager.sealed_segments().iter().map(|s| s.id()).collect();
                // Still active after the snapshot means it was active during it
                let active = manager.active_id();
                assert!(!sealed.contains(&active), "sealed {:?} include active {}", sealed, active);
            }
        });
    });

    assert_eq!(manager.sealed_segments().len(), 499);
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_writer_after_close_fails() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, _index) = open_manager(&config_for(temp_dir.path(), 4096));

    manager.close().unwrap();
    // Second close is harmless at this level
    manager.close().unwrap();

    let err = manager.writer().err().unwrap();
    assert_eq!(err.code(), ErrorCode::Closed);
}

#[test]
fn test_stats_reflect_segments() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, index) = open_manager(&config_for(temp_dir.path(), 2 * ENTRY_SIZE));
    for i in 0..5 {
        put(&manager, &index, i);
    }

    let stats = manager.stats();
    assert_eq!(stats.segment_count, 3);
    assert_eq!(stats.sealed_count, 2);
    assert_eq!(stats.active_id, 3);
    assert_eq!(stats.active_size, ENTRY_SIZE);
    assert_eq!(stats.total_bytes, 5 * ENTRY_SIZE);
    assert_eq!(stats.retired_count, 0);
}

// =============================================================================
// Id Exhaustion Tests
// =============================================================================

#[test]
fn test_segment_id_exhausted_on_rotation() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_for(temp_dir.path(), 2 * ENTRY_SIZE);
    let dir = config.segment_path();
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(segment_file_name("segment", u16::MAX, 1)), b"").unwrap();

    let (manager, index) = open_manager(&config);
    assert_eq!(manager.active_id(), u16::MAX);
    put(&manager, &index, 0);
    put(&manager, &index, 1);

    let mut writer = manager.writer().unwrap();
    let err = writer.append(b"key_02", Some(b"0123456789"), NO_EXPIRY).unwrap_err();
    assert_eq!(err.code(), ErrorCode::SegmentIdExhausted);
    drop(writer);

    // Existing data stays readable
    let pointer = index.get(b"key_01").unwrap();
    assert!(manager.read(&pointer).is_ok());
}

#[test]
fn test_segment_id_exhausted_on_open() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_for(temp_dir.path(), 2 * ENTRY_SIZE);
    let dir = config.segment_path();
    fs::create_dir_all(&dir).unwrap();

    let mut full = encode(b"key_00", Some(b"0123456789"), 1, NO_EXPIRY).unwrap();
    full.extend(encode(b"key_01", Some(b"0123456789"), 2, NO_EXPIRY).unwrap());
    fs::write(dir.join(segment_file_name("segment", u16::MAX, 1)), full).unwrap();

    let index = Index::new();
    let err = SegmentManager::open(&config, &index, None).err().unwrap();
    assert_eq!(err.code(), ErrorCode::SegmentIdExhausted);
}
