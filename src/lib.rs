//! # IgniteKV
//!
//! An embedded, Bitcask-style key-value storage engine with:
//! - Append-only, checksummed segment files
//! - An in-memory hash index pointing at the newest entry of every key
//! - Hint files for fast startup
//! - Background compaction that reclaims superseded and expired entries
//! - Single-writer/multi-reader concurrency model
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                               │
//! │            (Single Writer / Multi Reader)                    │
//! └──────────┬──────────────────┬────────────────────┬──────────┘
//!            │                  │                    │
//!            ▼                  ▼                    ▼
//!     ┌─────────────┐    ┌─────────────┐     ┌──────────────┐
//!     │    Index    │    │  Segments   │     │    Worker    │
//!     │  (RwLock)   │    │  (Append)   │     │ hints/merge  │
//!     └─────────────┘    └──────┬──────┘     └──────┬───────┘
//!                               │                   │
//!                               ▼                   ▼
//!                        ┌─────────────┐     ┌──────────────┐
//!                        │ *.seg files │◀────│  Compactor   │
//!                        │ *.hint files│     │ MERGE.marker │
//!                        └─────────────┘     └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use ignitekv::{Config, Engine};
//!
//! let engine = Engine::open(Config::builder().data_dir("./data").build())?;
//! engine.put(b"name", b"ignite")?;
//! assert_eq!(engine.get(b"name")?.as_deref(), Some(&b"ignite"[..]));
//! engine.close()?;
//! # Ok::<(), ignitekv::IgniteError>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod cancel;

pub mod codec;
pub mod segment;
pub mod index;
pub mod hint;
pub mod compaction;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{ErrorCode, IgniteError, Result};
pub use config::{Config, SyncStrategy};
pub use cancel::CancelToken;
pub use compaction::CompactionReport;
pub use engine::{Engine, EngineStats};
pub use index::RecordPointer;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of IgniteKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
