//! Configuration for ignitekv
//!
//! Centralized configuration with sensible defaults. A `Config` is built once,
//! validated at open time, and owned by the engine from then on.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::HEADER_SIZE;
use crate::error::{IgniteError, Result};

/// Default maximum segment size (1 GiB)
pub const DEFAULT_SEGMENT_SIZE: u64 = 1024 * 1024 * 1024;

/// Upper bound for `max_segment_size`: entry sizes are stored as `u32`
pub const MAX_SEGMENT_SIZE: u64 = u32::MAX as u64;

/// Default interval between background compaction checks (5 hours)
pub const DEFAULT_COMPACTION_INTERVAL: Duration = Duration::from_secs(5 * 60 * 60);

/// Main configuration for an ignitekv instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     └── {segment_dir}/
    ///           ├── {prefix}_00001_{ts}.seg
    ///           ├── {prefix}_00001_{ts}.hint
    ///           └── MERGE.marker     (only while a merge is being finalized)
    pub data_dir: PathBuf,

    /// Subdirectory of `data_dir` holding segment and hint files
    pub segment_dir: String,

    /// Filename prefix of segment files
    pub segment_prefix: String,

    /// Size threshold at which the active segment is rotated (in bytes)
    pub max_segment_size: u64,

    /// Largest accepted key (in bytes)
    pub max_key_size: usize,

    /// Largest accepted value (in bytes)
    pub max_value_size: usize,

    // -------------------------------------------------------------------------
    // Durability Configuration
    // -------------------------------------------------------------------------
    /// How often the active segment is fsynced between rotations
    pub sync_strategy: SyncStrategy,

    /// Write a hint file for every sealed segment
    pub hint_files: bool,

    // -------------------------------------------------------------------------
    // Compaction Configuration
    // -------------------------------------------------------------------------
    /// Interval between background compaction checks (zero disables the timer)
    pub compaction_interval: Duration,

    /// Minimum number of sealed segments before background compaction runs
    pub compaction_min_segments: usize,

    /// Background compaction runs when the live fraction of sealed bytes
    /// drops below this ratio
    pub compaction_live_ratio: f64,
}

/// Segment sync strategy: how often to fsync appended entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStrategy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync after N unsynced entries (balanced durability/performance)
    EveryNEntries { count: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./ignite_data"),
            segment_dir: "segments".to_string(),
            segment_prefix: "segment".to_string(),
            max_segment_size: DEFAULT_SEGMENT_SIZE,
            max_key_size: 64 * 1024,         // 64 KB
            max_value_size: 64 * 1024 * 1024, // 64 MB
            sync_strategy: SyncStrategy::EveryNEntries { count: 100 },
            hint_files: true,
            compaction_interval: DEFAULT_COMPACTION_INTERVAL,
            compaction_min_segments: 2,
            compaction_live_ratio: 0.5,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Directory holding segment, hint and marker files
    pub fn segment_path(&self) -> PathBuf {
        self.data_dir.join(&self.segment_dir)
    }

    /// Check every field, returning the first violation as `InvalidInput`
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(IgniteError::validation(
                "data_dir",
                "required",
                "data directory must not be empty",
            ));
        }

        if self.segment_dir.trim().is_empty() || Path::new(&self.segment_dir).is_absolute() {
            return Err(IgniteError::validation(
                "segment_dir",
                "relative_path",
                format!("segment directory must be a non-empty relative path, got {:?}", self.segment_dir),
            ));
        }

        let prefix_ok = !self.segment_prefix.is_empty()
            && self
                .segment_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !prefix_ok {
            return Err(IgniteError::validation(
                "segment_prefix",
                "charset",
                format!(
                    "segment prefix must be non-empty ASCII alphanumerics or '-', got {:?}",
                    self.segment_prefix
                ),
            ));
        }

        if self.max_segment_size <= HEADER_SIZE as u64 || self.max_segment_size > MAX_SEGMENT_SIZE {
            return Err(IgniteError::validation(
                "max_segment_size",
                "range",
                format!(
                    "segment size must be in ({}, {}], got {}",
                    HEADER_SIZE, MAX_SEGMENT_SIZE, self.max_segment_size
                ),
            ));
        }

        // Entries larger than a segment are rejected at append time
        if self.max_key_size == 0 || self.max_key_size >= u32::MAX as usize {
            return Err(IgniteError::validation(
                "max_key_size",
                "range",
                format!("key limit must be in [1, {}), got {}", u32::MAX, self.max_key_size),
            ));
        }

        if self.max_value_size >= u32::MAX as usize {
            return Err(IgniteError::validation(
                "max_value_size",
                "range",
                format!("value limit must be below {}", u32::MAX),
            ));
        }

        if let SyncStrategy::EveryNEntries { count: 0 } = self.sync_strategy {
            return Err(IgniteError::validation(
                "sync_strategy",
                "positive",
                "EveryNEntries count must be at least 1",
            ));
        }

        if !(0.0..=1.0).contains(&self.compaction_live_ratio) {
            return Err(IgniteError::validation(
                "compaction_live_ratio",
                "range",
                format!("live ratio must be within [0, 1], got {}", self.compaction_live_ratio),
            ));
        }

        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the segment subdirectory name
    pub fn segment_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.segment_dir = dir.into();
        self
    }

    /// Set the segment filename prefix
    pub fn segment_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.segment_prefix = prefix.into();
        self
    }

    /// Set the rotation threshold (in bytes)
    pub fn max_segment_size(mut self, size: u64) -> Self {
        self.config.max_segment_size = size;
        self
    }

    /// Set the largest accepted key (in bytes)
    pub fn max_key_size(mut self, size: usize) -> Self {
        self.config.max_key_size = size;
        self
    }

    /// Set the largest accepted value (in bytes)
    pub fn max_value_size(mut self, size: usize) -> Self {
        self.config.max_value_size = size;
        self
    }

    /// Set the sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Enable or disable hint files for sealed segments
    pub fn hint_files(mut self, enabled: bool) -> Self {
        self.config.hint_files = enabled;
        self
    }

    /// Set the background compaction interval (zero disables it)
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.config.compaction_interval = interval;
        self
    }

    /// Set the minimum sealed segment count for background compaction
    pub fn compaction_min_segments(mut self, count: usize) -> Self {
        self.config.compaction_min_segments = count;
        self
    }

    /// Set the live-data ratio below which background compaction runs
    pub fn compaction_live_ratio(mut self, ratio: f64) -> Self {
        self.config.compaction_live_ratio = ratio;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
