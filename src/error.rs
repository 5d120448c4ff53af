//! Error types for ignitekv
//!
//! Every failure is one [`IgniteError`]: a shared set of fields (code,
//! message, cause, details) plus an [`ErrorContext`] payload naming the
//! component-specific location of the failure.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type alias using IgniteError
pub type Result<T> = std::result::Result<T, IgniteError>;

/// Boxed cause attached to an error
pub type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    /// Bad configuration, empty key, oversize key or value
    InvalidInput,

    /// Key absent, or a pointer referencing an unknown segment
    NotFound,

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    /// Checksum mismatch or header parse failure
    SegmentCorrupted,

    /// Generic filesystem failure
    Io,

    /// Refinement of `Io`: no space left on device
    DiskFull,

    /// Refinement of `Io`: insufficient permissions
    PermissionDenied,

    /// Refinement of `Io`: filesystem mounted read-only
    FilesystemReadonly,

    /// Startup could not reconstruct a consistent index
    RecoveryFailed,

    /// All segment ids have been handed out
    SegmentIdExhausted,

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    /// Operation observed a cancellation before its commit point
    Cancelled,

    /// Operation on a closed engine
    Closed,

    /// Broken internal invariant
    Internal,
}

impl ErrorCode {
    /// Stable string form, suitable for logs and metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::SegmentCorrupted => "SEGMENT_CORRUPTED",
            ErrorCode::Io => "IO_ERROR",
            ErrorCode::DiskFull => "DISK_FULL",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::FilesystemReadonly => "FILESYSTEM_READONLY",
            ErrorCode::RecoveryFailed => "RECOVERY_FAILED",
            ErrorCode::SegmentIdExhausted => "SEGMENT_ID_EXHAUSTED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Closed => "CLOSED",
            ErrorCode::Internal => "INTERNAL_ERROR",
        }
    }

    /// True for `Io` and its refined classifications
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            ErrorCode::Io
                | ErrorCode::DiskFull
                | ErrorCode::PermissionDenied
                | ErrorCode::FilesystemReadonly
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component-specific payload of an error
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ErrorContext {
    /// No extra location information
    #[default]
    General,

    /// Rejected input: which field, which rule
    Validation { field: String, rule: String },

    /// Failure inside a segment, hint, or marker file
    Storage {
        segment_id: Option<u16>,
        offset: Option<u64>,
        path: Option<PathBuf>,
    },

    /// Failure while operating on the index
    Index {
        key: Option<Vec<u8>>,
        operation: &'static str,
    },
}

/// Unified error type for ignitekv operations
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct IgniteError {
    code: ErrorCode,
    message: String,
    #[source]
    source: Option<BoxedCause>,
    details: BTreeMap<String, String>,
    context: ErrorContext,
}

impl IgniteError {
    /// Create an error with the given code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            details: BTreeMap::new(),
            context: ErrorContext::General,
        }
    }

    // =========================================================================
    // Constructors
    // =========================================================================

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// An `InvalidInput` error naming the offending field and violated rule
    pub fn validation(
        field: impl Into<String>,
        rule: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut err = Self::new(ErrorCode::InvalidInput, message);
        err.context = ErrorContext::Validation {
            field: field.into(),
            rule: rule.into(),
        };
        err
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SegmentCorrupted, message)
    }

    pub fn recovery_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RecoveryFailed, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "operation cancelled before commit")
    }

    pub fn closed() -> Self {
        Self::new(ErrorCode::Closed, "engine is closed")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Wrap an I/O error, refining its code from the underlying OS error
    pub fn from_io(err: io::Error, message: impl Into<String>) -> Self {
        let code = classify_io(&err);
        let mut wrapped = Self::new(code, message).with_source(err);
        if let Some(hint) = remediation(code) {
            wrapped = wrapped.with_detail("suggestion", hint);
        }
        wrapped
    }

    // =========================================================================
    // Builders
    // =========================================================================

    pub fn with_source<E>(mut self, cause: E) -> Self
    where
        E: Into<BoxedCause>,
    {
        self.source = Some(cause.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }

    pub fn with_segment(mut self, id: u16) -> Self {
        if let ErrorContext::Storage { segment_id, .. } = self.storage_context() {
            *segment_id = Some(id);
        }
        self
    }

    pub fn with_offset(mut self, at: u64) -> Self {
        if let ErrorContext::Storage { offset, .. } = self.storage_context() {
            *offset = Some(at);
        }
        self
    }

    pub fn with_path(mut self, file: &Path) -> Self {
        if let ErrorContext::Storage { path, .. } = self.storage_context() {
            *path = Some(file.to_path_buf());
        }
        self
    }

    pub fn with_key(mut self, k: &[u8], op: &'static str) -> Self {
        self.context = ErrorContext::Index {
            key: Some(k.to_vec()),
            operation: op,
        };
        self
    }

    fn storage_context(&mut self) -> &mut ErrorContext {
        if !matches!(self.context, ErrorContext::Storage { .. }) {
            self.context = ErrorContext::Storage {
                segment_id: None,
                offset: None,
                path: None,
            };
        }
        &mut self.context
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &BTreeMap<String, String> {
        &self.details
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Segment the failure happened in, if known
    pub fn segment_id(&self) -> Option<u16> {
        match &self.context {
            ErrorContext::Storage { segment_id, .. } => *segment_id,
            _ => None,
        }
    }

    /// Byte offset of the failure within its segment, if known
    pub fn offset(&self) -> Option<u64> {
        match &self.context {
            ErrorContext::Storage { offset, .. } => *offset,
            _ => None,
        }
    }

    /// Key an index operation failed on
    pub fn key(&self) -> Option<&[u8]> {
        match &self.context {
            ErrorContext::Index { key, .. } => key.as_deref(),
            _ => None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.context {
            ErrorContext::Storage { path, .. } => path.as_deref(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    pub fn is_corruption(&self) -> bool {
        self.code == ErrorCode::SegmentCorrupted
    }
}

impl From<io::Error> for IgniteError {
    fn from(err: io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}

/// Map an OS-level failure onto the refined I/O codes
fn classify_io(err: &io::Error) -> ErrorCode {
    match err.kind() {
        io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
        io::ErrorKind::StorageFull => ErrorCode::DiskFull,
        io::ErrorKind::ReadOnlyFilesystem => ErrorCode::FilesystemReadonly,
        io::ErrorKind::NotFound => ErrorCode::NotFound,
        _ => ErrorCode::Io,
    }
}

fn remediation(code: ErrorCode) -> Option<&'static str> {
    match code {
        ErrorCode::DiskFull => Some("free up disk space or move the data directory"),
        ErrorCode::PermissionDenied => Some("check directory permissions for the data directory"),
        ErrorCode::FilesystemReadonly => Some("remount the filesystem with write permissions"),
        _ => None,
    }
}
