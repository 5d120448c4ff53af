//! Engine Module
//!
//! The public storage engine that coordinates all components.
//!
//! ## Responsibilities
//! - Validate input and route reads/writes to the index and segments
//! - Enforce the single-writer / multi-reader discipline
//! - Run crash recovery on open
//! - Own the background worker (hint files, compaction, reaping)

mod worker;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel;
use parking_lot::Mutex;
use tracing::{info, trace, warn};

use crate::cancel::CancelToken;
use crate::codec::{unix_nanos, NO_EXPIRY};
use crate::compaction::{recover_interrupted_merge, CompactionReport, Compactor};
use crate::config::Config;
use crate::error::{IgniteError, Result};
use crate::index::{Index, RecoveryReport};
use crate::segment::SegmentManager;

use self::worker::Worker;

/// State shared between the engine handle and its background worker
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) index: Index,
    pub(crate) segments: SegmentManager,
    pub(crate) compactor: Compactor,
    /// Fired at close; aborts background compaction between entries
    pub(crate) shutdown: CancelToken,
}

/// Point-in-time engine statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    /// Live keys in the index
    pub keys: usize,
    /// Readable segments, active one included
    pub segment_count: usize,
    pub sealed_segments: usize,
    pub active_segment_id: u16,
    pub active_segment_size: u64,
    /// Bytes across all readable segments
    pub total_bytes: u64,
    /// Bytes of entries the index still references
    pub live_bytes: u64,
    /// Compacted segments awaiting deletion
    pub retired_segments: usize,
    pub compaction_running: bool,
}

/// The main storage engine
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
///
/// - **Writes** (put/delete): serialized by the segment manager's writer lock.
///   The index is updated before the lock is released, so the index always
///   reflects log order.
/// - **Reads** (get): take the index read lock only to copy a pointer and pin
///   its segment, then read from disk with no lock held.
/// - **Compaction**: runs beside both; it repoints keys with compare-and-set
///   and never blocks writers for longer than one index update.
///
/// All methods take `&self`; share an engine across threads with `Arc<Engine>`.
pub struct Engine {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
    closed: AtomicBool,
    recovery: RecoveryReport,
}

impl Engine {
    /// Open or create an engine with the given config
    ///
    /// On startup:
    /// 1. Validate config and create the segment directory
    /// 2. Finish any merge that committed but did not clean up
    /// 3. Open the segment manager (discovery, index rebuild, active segment)
    /// 4. Start the background worker
    pub fn open(config: Config) -> Result<Self> {
        // Step 1: Validate and create directories
        config.validate()?;
        let segment_dir = config.segment_path();
        fs::create_dir_all(&segment_dir).map_err(|e| {
            IgniteError::from_io(e, "failed to create data directory").with_path(&segment_dir)
        })?;

        // Step 2: Interrupted merge
        recover_interrupted_merge(&segment_dir, &config.segment_prefix)?;

        // Step 3: Segments and index
        let index = Index::new();
        let (sealed_tx, sealed_rx) = channel::unbounded();
        let (segments, recovery) = SegmentManager::open(&config, &index, Some(sealed_tx))?;
        let compactor = Compactor::new(&config);

        let shared = Arc::new(Shared {
            config,
            index,
            segments,
            compactor,
            shutdown: CancelToken::new(),
        });

        // Step 4: Background worker
        let worker = Worker::spawn(shared.clone(), sealed_rx)?;

        info!(
            dir = %segment_dir.display(),
            keys = recovery.keys,
            segments = recovery.segments.len(),
            hints_used = recovery.hints_used(),
            "engine opened"
        );

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
            recovery,
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().data_dir(path).build())
    }

    /// Open with the three most commonly tuned settings
    pub fn open_with(data_dir: impl Into<PathBuf>, segment_size: u64, compaction_interval: Duration) -> Result<Self> {
        Self::open(
            Config::builder()
                .data_dir(data_dir)
                .max_segment_size(segment_size)
                .compaction_interval(compaction_interval)
                .build(),
        )
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get a value by key
    ///
    /// Returns `Ok(None)` for absent, deleted, and expired keys.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.get_with(key, &CancelToken::none())
    }

    /// [`get`](Self::get) with cancellation
    pub fn get_with(&self, key: &[u8], cancel: &CancelToken) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        self.validate_key(key)?;
        cancel.check()?;

        // Copy the pointer and pin its segment under the index read lock
        let shared = &self.shared;
        let found = shared
            .index
            .with_pointer(key, |pointer| (pointer.clone(), shared.segments.handle(pointer.segment_id)));
        let Some((pointer, handle)) = found else {
            trace!("get: key not in index");
            return Ok(None);
        };
        let segment = handle.ok_or_else(|| {
            IgniteError::not_found("index references a segment that is not readable")
                .with_segment(pointer.segment_id)
                .with_offset(pointer.offset)
        })?;

        cancel.check()?;
        let entry = segment.read_entry(pointer.offset, pointer.entry_size)?;

        if entry.key.as_ref() != key {
            return Err(IgniteError::corrupted("entry key does not match the index")
                .with_key(key, "get")
                .with_detail("segment_id", pointer.segment_id)
                .with_detail("offset", pointer.offset)
                .with_detail("path", segment.path().display()));
        }
        if entry.is_expired(unix_nanos()) {
            return Ok(None);
        }
        Ok(entry.value)
    }

    /// True if the index holds `key` (an expired key counts until compacted)
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.shared.index.contains_key(key)
    }

    /// Snapshot of all keys in the index
    pub fn keys(&self) -> Vec<Bytes> {
        self.shared
            .index
            .keys()
            .into_iter()
            .map(|key| Bytes::copy_from_slice(&key))
            .collect()
    }

    /// Number of keys in the index
    pub fn len(&self) -> usize {
        self.shared.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.index.is_empty()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Put a key-value pair
    ///
    /// Steps:
    /// 1. Validate key and value sizes
    /// 2. Acquire the writer lock
    /// 3. Append the entry to the active segment
    /// 4. Point the index at it, then release the lock
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with(key, value, None, &CancelToken::none())
    }

    /// Put a key-value pair that reads as absent once `ttl` has passed
    pub fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<()> {
        self.put_with(key, value, Some(ttl), &CancelToken::none())
    }

    /// [`put`](Self::put) with optional TTL and cancellation
    pub fn put_with(&self, key: &[u8], value: &[u8], ttl: Option<Duration>, cancel: &CancelToken) -> Result<()> {
        // Step 1: Validate
        self.ensure_open()?;
        self.validate_key(key)?;
        if value.len() > self.shared.config.max_value_size {
            return Err(IgniteError::validation(
                "value",
                "max_size",
                format!(
                    "value of {} bytes exceeds the {} byte limit",
                    value.len(),
                    self.shared.config.max_value_size
                ),
            ));
        }
        let expires_at = match ttl {
            None => NO_EXPIRY,
            Some(ttl) if ttl.is_zero() => {
                return Err(IgniteError::validation("ttl", "positive", "ttl must be greater than zero"))
            }
            Some(ttl) => unix_nanos().saturating_add(u64::try_from(ttl.as_nanos()).unwrap_or(u64::MAX)),
        };
        cancel.check()?;

        // Step 2: Writer lock
        let mut writer = self.shared.segments.writer()?;
        cancel.check()?;

        // Step 3 + 4: Append, then index (commit point is the append)
        let pointer = writer.append(key, Some(value), expires_at)?;
        self.shared.index.put(pointer);
        Ok(())
    }

    /// Delete a key
    ///
    /// Appends a tombstone and drops the key from the index. Deleting an
    /// absent key is a no-op.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.delete_with(key, &CancelToken::none())
    }

    /// [`delete`](Self::delete) with cancellation
    pub fn delete_with(&self, key: &[u8], cancel: &CancelToken) -> Result<()> {
        self.ensure_open()?;
        self.validate_key(key)?;
        cancel.check()?;

        let mut writer = self.shared.segments.writer()?;
        cancel.check()?;

        if !self.shared.index.contains_key(key) {
            return Ok(());
        }
        writer.append(key, None, NO_EXPIRY)?;
        self.shared.index.delete(key);
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Compact every sealed segment now
    ///
    /// Waits for a background pass if one is running. Aborted (`Cancelled`)
    /// if the engine is closed mid-pass.
    pub fn compact(&self) -> Result<CompactionReport> {
        self.ensure_open()?;
        let shared = &self.shared;
        shared.compactor.run(&shared.segments, &shared.index, &shared.shutdown)
    }

    /// fsync the active segment
    pub fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.segments.sync()
    }

    /// Close the engine gracefully
    ///
    /// Stops the background worker (aborting a running compaction), waits
    /// for in-flight writes, syncs the active segment, and deletes retired
    /// segments that are no longer read. A second call returns `Closed`.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(IgniteError::closed());
        }

        let shared = &self.shared;
        shared.shutdown.cancel();
        if let Some(worker) = self.worker.lock().take() {
            worker.stop();
        }

        let synced = shared.segments.close();
        shared.compactor.wait_idle();
        if let Err(e) = shared.compactor.reap(&shared.segments) {
            warn!(error = %e, "failed to reap retired segments at close");
        }

        info!(keys = shared.index.len(), "engine closed");
        synced
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> EngineStats {
        let shared = &self.shared;
        let segments = shared.segments.stats();
        let live_bytes = shared.index.live_bytes_by_segment().values().sum();

        EngineStats {
            keys: shared.index.len(),
            segment_count: segments.segment_count,
            sealed_segments: segments.sealed_count,
            active_segment_id: segments.active_id,
            active_segment_size: segments.active_size,
            total_bytes: segments.total_bytes,
            live_bytes,
            retired_segments: segments.retired_count,
            compaction_running: shared.compactor.is_running(),
        }
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.shared.config.data_dir
    }

    /// Directory holding segment and hint files
    pub fn segment_dir(&self) -> &Path {
        self.shared.segments.dir()
    }

    /// What startup recovered
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// The segment manager (for tooling and tests)
    pub fn segments(&self) -> &SegmentManager {
        &self.shared.segments
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(IgniteError::closed())
        } else {
            Ok(())
        }
    }

    fn validate_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(IgniteError::validation("key", "non_empty", "key must not be empty"));
        }
        if key.len() > self.shared.config.max_key_size {
            return Err(IgniteError::validation(
                "key",
                "max_size",
                format!(
                    "key of {} bytes exceeds the {} byte limit",
                    key.len(),
                    self.shared.config.max_key_size
                ),
            ));
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.close() {
                warn!(error = %e, "error closing engine on drop");
            }
        }
    }
}
