//! Cancellation tokens
//!
//! A [`CancelToken`] is checked at fixed points of an operation (before
//! taking locks, before the commit point, between compaction entries). Once
//! an operation has committed, cancelling has no effect on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{IgniteError, Result};

/// Cooperative cancellation flag with an optional deadline
///
/// Clones share the same flag, so one handle can cancel work running on
/// another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    /// `None` for tokens that can only expire through the deadline
    flag: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that can be cancelled through [`cancel`](Self::cancel)
    pub fn new() -> Self {
        Self {
            flag: Some(Arc::new(AtomicBool::new(false))),
            deadline: None,
        }
    }

    /// A token that never fires (no allocation)
    pub fn none() -> Self {
        Self::default()
    }

    /// A cancellable token that also fires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().deadline(Instant::now() + timeout)
    }

    /// Attach (or replace) a deadline
    pub fn deadline(mut self, at: Instant) -> Self {
        self.deadline = Some(at);
        self
    }

    /// Cancel every clone of this token
    pub fn cancel(&self) {
        if let Some(flag) = &self.flag {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        let flagged = self
            .flag
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false);
        flagged || self.deadline.map(|at| Instant::now() >= at).unwrap_or(false)
    }

    /// `Err(Cancelled)` once the token has fired
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(IgniteError::cancelled())
        } else {
            Ok(())
        }
    }
}
