//! Query context: deadline and cancellation
//!
//! The dispatcher polls the context before submitting each per-segment
//! search and at merge boundaries. An in-flight kernel call is never
//! interrupted; it completes or fails on its own.

use magnetite_core::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Deadline and cancellation flag carried by a query.
#[derive(Clone, Default)]
pub struct QueryContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl QueryContext {
    /// A context with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation; checked at the next poll point.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether the context was cancelled or its deadline passed.
    pub fn is_done(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        matches!(self.deadline, Some(deadline) if Instant::now() >= deadline)
    }

    /// Error out if cancelled or expired.
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.is_done() {
            return Err(Error::cancelled(operation));
        }
        Ok(())
    }
}
