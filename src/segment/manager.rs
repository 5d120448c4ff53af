//! Segment Manager
//!
//! Owns every segment file of a store and coordinates writes to them.
//!
//! ## Responsibilities
//! - Discover existing segments on startup and rebuild the index from them
//! - Choose (or create) the active segment, truncating a torn tail
//! - Append entries, rotating to a fresh segment at the size threshold
//! - Hand out monotonically increasing segment ids
//! - Retire compacted segments and delete them once no reader holds them

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam::channel::Sender;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::codec::{self, unix_nanos, Entry, TOMBSTONE_MARKER};
use crate::config::{Config, SyncStrategy};
use crate::error::{ErrorCode, IgniteError, Result};
use crate::index::{self, Index, RecordPointer, RecoveryReport};

use super::{
    is_tmp_file, parse_segment_file_name, Segment, SegmentName, HINT_EXTENSION, MAX_SEGMENT_ID,
    SEGMENT_EXTENSION,
};

/// Manages the segment files of one store
///
/// ## Concurrency:
/// - `active`: Mutex; holding it *is* the single-writer lock
/// - `segments`: RwLock (many concurrent readers, exclusive on rotate/install/retire)
/// - `next_id`: Atomic counter (lock-free)
/// - Lock order: `active` → `segments`; readers take `segments` alone or
///   after the index read lock, never the other way round
pub struct SegmentManager {
    /// Directory holding segment and hint files
    dir: PathBuf,
    prefix: String,
    max_segment_size: u64,
    sync_strategy: SyncStrategy,

    /// Every readable segment, active one included, keyed by id
    segments: RwLock<BTreeMap<u16, Arc<Segment>>>,

    /// Append state of the active segment
    active: Mutex<ActiveSegment>,

    /// Next id to hand out; may reach `MAX_SEGMENT_ID + 1` (exhausted)
    next_id: AtomicU32,

    /// Compacted segments waiting for their last reader to finish
    retired: Mutex<Vec<RetiredSegment>>,

    /// Receives the id of every segment sealed by rotation
    seal_listener: Option<Sender<u16>>,
}

struct ActiveSegment {
    segment: Arc<Segment>,
    /// Bytes of intact entries (the append offset)
    size: u64,
    /// Entries appended since the last fsync
    unsynced: usize,
    /// Last timestamp handed out; timestamps strictly increase
    last_timestamp: u64,
    /// Reused encode buffer
    buf: Vec<u8>,
    closed: bool,
}

struct RetiredSegment {
    id: u16,
    path: PathBuf,
    hint_path: PathBuf,
    /// Dropped right before the files are deleted
    handle: Option<Arc<Segment>>,
}

/// Point-in-time view of the segment set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentStats {
    /// Readable segments, active one included
    pub segment_count: usize,
    pub sealed_count: usize,
    pub total_bytes: u64,
    pub active_id: u16,
    pub active_size: u64,
    /// Retired segments not yet deleted
    pub retired_count: usize,
}

impl SegmentManager {
    /// Open or create the segment set described by `config`
    ///
    /// On startup:
    /// 1. Create the segment directory if it doesn't exist
    /// 2. Delete leftover `*.tmp` files from interrupted writes
    /// 3. Discover segment files, ordered by id
    /// 4. Delete hint files whose segment no longer exists
    /// 5. Rebuild `index` (hints where valid, full scans elsewhere)
    /// 6. Pick the active segment: resume the newest one unless it is sealed,
    ///    full, or older than another segment's data, truncating a torn
    ///    tail; otherwise create the next id
    /// 7. Queue every other unhinted segment on `seal_listener`
    pub fn open(
        config: &Config,
        index: &Index,
        seal_listener: Option<Sender<u16>>,
    ) -> Result<(Self, RecoveryReport)> {
        let dir = config.segment_path();
        let prefix = config.segment_prefix.as_str();

        // Step 1: Create directory
        fs::create_dir_all(&dir).map_err(|e| {
            IgniteError::from_io(e, "failed to create segment directory").with_path(&dir)
        })?;

        // Step 2: Remove temp files
        remove_tmp_files(&dir)?;

        // Step 3: Discover segments
        let discovered = discover_segments(&dir, prefix)?;

        // Step 4: Remove orphaned hints
        remove_orphan_hints(&dir, prefix, &discovered)?;

        // Step 5: Open handles and rebuild the index
        let newest_id = discovered.last().map(|(name, _)| name.id);
        let mut opened = Vec::with_capacity(discovered.len());
        for (name, path) in &discovered {
            let segment = if Some(name.id) == newest_id {
                Segment::open(path, name.id)?
            } else {
                Segment::open_read_only(path, name.id)?
            };
            opened.push(Arc::new(segment));
        }
        let report = index::rebuild(index, &opened, config.hint_files)?;

        // Step 6: Choose the active segment
        let (active, active_size) = match opened.last() {
            None => (Arc::new(Segment::create(&dir, prefix, 1)?), 0),
            Some(newest) => {
                let recovered = report.segment(newest.id()).ok_or_else(|| {
                    IgniteError::internal("newest segment missing from recovery report")
                        .with_segment(newest.id())
                })?;

                // Only the segment holding the newest data may take appends;
                // a merge output can carry the highest id with older entries
                let holds_newest = recovered.entries == 0 || recovered.max_timestamp >= report.max_timestamp;
                if recovered.from_hint || recovered.valid_len >= config.max_segment_size || !holds_newest {
                    let id = newest.id().checked_add(1).ok_or_else(id_exhausted)?;
                    (Arc::new(Segment::create(&dir, prefix, id)?), 0)
                } else {
                    if recovered.valid_len < recovered.file_len {
                        warn!(
                            segment_id = newest.id(),
                            valid_len = recovered.valid_len,
                            file_len = recovered.file_len,
                            "truncating torn tail of active segment"
                        );
                        newest.truncate(recovered.valid_len)?;
                        newest.sync()?;
                    }
                    (newest.clone(), recovered.valid_len)
                }
            }
        };

        let mut table: BTreeMap<u16, Arc<Segment>> =
            opened.iter().map(|segment| (segment.id(), segment.clone())).collect();
        table.insert(active.id(), active.clone());

        // Step 7: Queue hint generation for sealed segments without one
        if config.hint_files {
            if let Some(listener) = &seal_listener {
                for segment in opened.iter().filter(|s| s.id() != active.id()) {
                    if !report.is_hinted(segment.id()) {
                        let _ = listener.send(segment.id());
                    }
                }
            }
        }

        info!(
            dir = %dir.display(),
            segments = table.len(),
            active_id = active.id(),
            active_size,
            "segment manager opened"
        );

        let manager = Self {
            dir,
            prefix: prefix.to_string(),
            max_segment_size: config.max_segment_size,
            sync_strategy: config.sync_strategy,
            next_id: AtomicU32::new(active.id() as u32 + 1),
            active: Mutex::new(ActiveSegment {
                segment: active,
                size: active_size,
                unsynced: 0,
                last_timestamp: report.max_timestamp,
                buf: Vec::new(),
                closed: false,
            }),
            segments: RwLock::new(table),
            retired: Mutex::new(Vec::new()),
            seal_listener,
        };
        Ok((manager, report))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Acquire the single-writer lock
    pub fn writer(&self) -> Result<SegmentWriter<'_>> {
        let active = self.active.lock();
        if active.closed {
            return Err(IgniteError::closed());
        }
        Ok(SegmentWriter { manager: self, active })
    }

    /// Hand out the next segment id
    pub fn allocate_id(&self) -> Result<u16> {
        self.next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                (next <= MAX_SEGMENT_ID as u32).then_some(next + 1)
            })
            .map(|id| id as u16)
            .map_err(|_| id_exhausted())
    }

    /// fsync the active segment
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer()?;
        writer.sync()
    }

    /// Sync the active segment and refuse further writes
    ///
    /// Waits for any in-flight append, since it needs the writer lock.
    pub fn close(&self) -> Result<()> {
        let mut active = self.active.lock();
        if active.closed {
            return Ok(());
        }
        active.segment.sync()?;
        active.unsynced = 0;
        active.closed = true;
        debug!(active_id = active.segment.id(), "segment manager closed");
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Shared handle to a segment, if it is still readable
    pub fn handle(&self, id: u16) -> Option<Arc<Segment>> {
        self.segments.read().get(&id).cloned()
    }

    /// Read and verify the entry a pointer references
    pub fn read(&self, pointer: &RecordPointer) -> Result<Entry> {
        let segment = self.handle(pointer.segment_id).ok_or_else(|| {
            IgniteError::not_found(format!("segment {} is not readable", pointer.segment_id))
                .with_segment(pointer.segment_id)
                .with_offset(pointer.offset)
        })?;
        segment.read_entry(pointer.offset, pointer.entry_size)
    }

    /// Every segment except the active one, ascending by id
    pub fn sealed_segments(&self) -> Vec<Arc<Segment>> {
        // Hold the writer lock so a rotation cannot slip its fresh active
        // segment into the table between the two reads
        let active = self.active.lock();
        let active_id = active.segment.id();
        self.segments
            .read()
            .values()
            .filter(|segment| segment.id() != active_id)
            .cloned()
            .collect()
    }

    pub fn active_id(&self) -> u16 {
        self.active.lock().segment.id()
    }

    // =========================================================================
    // Compaction Support
    // =========================================================================

    /// Make a finished merge output readable
    pub fn install(&self, segment: Arc<Segment>) {
        self.segments.write().insert(segment.id(), segment);
    }

    /// Remove segments from the readable set and queue them for deletion
    ///
    /// Readers that already hold a handle keep reading; the files go away in
    /// [`reap`](Self::reap) once the last handle is dropped.
    pub fn retire(&self, ids: &[u16]) -> usize {
        let removed: Vec<Arc<Segment>> = {
            let mut segments = self.segments.write();
            ids.iter().filter_map(|id| segments.remove(id)).collect()
        };

        let count = removed.len();
        let mut retired = self.retired.lock();
        retired.extend(removed.into_iter().map(|segment| RetiredSegment {
            id: segment.id(),
            path: segment.path().to_path_buf(),
            hint_path: segment.hint_path(),
            handle: Some(segment),
        }));
        count
    }

    /// Delete retired segments nobody is reading; returns how many remain
    pub fn reap(&self) -> usize {
        let mut retired = self.retired.lock();
        retired.retain_mut(|entry| {
            if let Some(handle) = &entry.handle {
                if Arc::strong_count(handle) > 1 {
                    return true;
                }
            }
            // Close our handle before unlinking
            entry.handle = None;

            match remove_if_exists(&entry.path).and_then(|_| remove_if_exists(&entry.hint_path)) {
                Ok(()) => {
                    debug!(segment_id = entry.id, "retired segment deleted");
                    false
                }
                Err(e) => {
                    warn!(segment_id = entry.id, error = %e, "failed to delete retired segment, will retry");
                    true
                }
            }
        });
        retired.len()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn max_segment_size(&self) -> u64 {
        self.max_segment_size
    }

    /// Next id that would be allocated (for testing/debugging)
    pub fn next_id(&self) -> u32 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    pub fn stats(&self) -> SegmentStats {
        let (active_id, active_size) = {
            let active = self.active.lock();
            (active.segment.id(), active.size)
        };
        let segments: Vec<Arc<Segment>> = self.segments.read().values().cloned().collect();
        let total_bytes = segments
            .iter()
            .map(|segment| {
                if segment.id() == active_id {
                    active_size
                } else {
                    segment.len().unwrap_or(0)
                }
            })
            .sum();

        SegmentStats {
            segment_count: segments.len(),
            sealed_count: segments.len().saturating_sub(1),
            total_bytes,
            active_id,
            active_size,
            retired_count: self.retired_count(),
        }
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Exclusive append access to the active segment
///
/// Holding a `SegmentWriter` serializes all writers. Callers update the
/// index before dropping it so index order matches log order.
pub struct SegmentWriter<'a> {
    manager: &'a SegmentManager,
    active: MutexGuard<'a, ActiveSegment>,
}

impl SegmentWriter<'_> {
    /// Append an entry (`value = None` writes a tombstone)
    ///
    /// Steps:
    /// 1. Assign a timestamp strictly greater than the previous one
    /// 2. Encode the entry
    /// 3. Rotate if it would push a non-empty segment past the threshold
    /// 4. Write at the tail; on failure truncate back to the old size
    /// 5. fsync according to the sync strategy
    pub fn append(&mut self, key: &[u8], value: Option<&[u8]>, expires_at: u64) -> Result<RecordPointer> {
        let max_segment_size = self.manager.max_segment_size;

        // Step 1 + 2: Timestamp and encode
        let timestamp = self.next_timestamp();
        codec::encode_into(&mut self.active.buf, key, value, timestamp, expires_at)?;
        let entry_size = self.active.buf.len() as u64;

        let stored_size = u32::try_from(entry_size).ok().filter(|_| entry_size <= max_segment_size);
        let Some(stored_size) = stored_size else {
            return Err(IgniteError::validation(
                "entry",
                "max_size",
                format!(
                    "entry of {} bytes exceeds the {} byte segment size",
                    entry_size, max_segment_size
                ),
            ));
        };

        // Step 3: Rotate (an empty segment always accepts the entry)
        if self.active.size > 0 && self.active.size + entry_size > max_segment_size {
            self.rotate()?;
        }

        // Step 4: Write
        let offset = self.active.size;
        if let Err(e) = self.active.segment.write_at(offset, &self.active.buf) {
            self.roll_back(offset);
            return Err(e);
        }
        self.active.size += entry_size;
        self.active.unsynced += 1;

        // Step 5: Sync
        if let Err(e) = self.sync_per_strategy() {
            self.roll_back(offset);
            return Err(e);
        }

        Ok(RecordPointer {
            key: Arc::from(key),
            segment_id: self.active.segment.id(),
            offset,
            entry_size: stored_size,
            value_size: value.map_or(TOMBSTONE_MARKER, |v| v.len() as u32),
            timestamp,
        })
    }

    /// fsync the active segment now
    pub fn sync(&mut self) -> Result<()> {
        self.active.segment.sync()?;
        self.active.unsynced = 0;
        Ok(())
    }

    pub fn active_id(&self) -> u16 {
        self.active.segment.id()
    }

    /// Bytes written to the active segment so far
    pub fn active_size(&self) -> u64 {
        self.active.size
    }

    fn next_timestamp(&mut self) -> u64 {
        let timestamp = unix_nanos().max(self.active.last_timestamp + 1);
        self.active.last_timestamp = timestamp;
        timestamp
    }

    fn sync_per_strategy(&mut self) -> Result<()> {
        let due = match self.manager.sync_strategy {
            SyncStrategy::EveryWrite => true,
            SyncStrategy::EveryNEntries { count } => self.active.unsynced >= count,
        };
        if due {
            self.sync()?;
        }
        Ok(())
    }

    /// Undo a failed append so the file never keeps a half-written tail
    fn roll_back(&mut self, offset: u64) {
        if let Err(e) = self.active.segment.truncate(offset) {
            warn!(
                segment_id = self.active.segment.id(),
                offset,
                error = %e,
                "failed to truncate after a failed append"
            );
        }
        self.active.size = offset;
    }

    /// Seal the active segment and start the next one
    fn rotate(&mut self) -> Result<()> {
        let id = self.manager.allocate_id()?;
        self.active.segment.sync()?;

        let fresh = Arc::new(Segment::create(&self.manager.dir, &self.manager.prefix, id)?);
        self.manager.segments.write().insert(id, fresh.clone());

        let sealed = std::mem::replace(&mut self.active.segment, fresh);
        let sealed_size = self.active.size;
        self.active.size = 0;
        self.active.unsynced = 0;

        info!(sealed_id = sealed.id(), sealed_size, active_id = id, "segment rotated");

        if let Some(listener) = &self.manager.seal_listener {
            let _ = listener.send(sealed.id());
        }
        Ok(())
    }
}

// =============================================================================
// Directory Helpers
// =============================================================================

/// Find every segment file with `prefix` in `dir`, ascending by id
pub fn discover_segments(dir: &Path, prefix: &str) -> Result<Vec<(SegmentName, PathBuf)>> {
    let mut found: Vec<(SegmentName, PathBuf)> = Vec::new();

    for entry in read_dir(dir)? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(name) = parse_segment_file_name(file_name, prefix) {
            found.push((name, path));
        }
    }

    found.sort_by_key(|(name, _)| name.id);

    let mut seen = HashSet::new();
    for (name, path) in &found {
        if !seen.insert(name.id) {
            return Err(IgniteError::recovery_failed(format!(
                "two segment files share id {}",
                name.id
            ))
            .with_segment(name.id)
            .with_path(path));
        }
    }

    Ok(found)
}

fn remove_tmp_files(dir: &Path) -> Result<()> {
    for entry in read_dir(dir)? {
        let path = entry.path();
        if path.is_file() && is_tmp_file(&path) {
            info!(path = %path.display(), "removing leftover temp file");
            remove_if_exists(&path)
                .map_err(|e| IgniteError::from_io(e, "failed to remove temp file").with_path(&path))?;
        }
    }
    Ok(())
}

fn remove_orphan_hints(dir: &Path, prefix: &str, segments: &[(SegmentName, PathBuf)]) -> Result<()> {
    let owned_prefix = format!("{}_", prefix);
    for entry in read_dir(dir)? {
        let path = entry.path();
        let is_own_hint = path.extension().and_then(|e| e.to_str()) == Some(HINT_EXTENSION)
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&owned_prefix))
                .unwrap_or(false);
        if !is_own_hint {
            continue;
        }

        let segment_path = path.with_extension(SEGMENT_EXTENSION);
        if !segments.iter().any(|(_, p)| *p == segment_path) {
            info!(path = %path.display(), "removing orphaned hint file");
            remove_if_exists(&path)
                .map_err(|e| IgniteError::from_io(e, "failed to remove hint file").with_path(&path))?;
        }
    }
    Ok(())
}

fn read_dir(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| IgniteError::from_io(e, "failed to list segment directory").with_path(dir))?;
    entries
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| IgniteError::from_io(e, "failed to list segment directory").with_path(dir))
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn id_exhausted() -> IgniteError {
    IgniteError::new(
        ErrorCode::SegmentIdExhausted,
        format!("all segment ids up to {} are in use", MAX_SEGMENT_ID),
    )
}
