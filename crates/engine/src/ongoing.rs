//! Reference counts over in-flight segment usage
//!
//! Queries, merges and index builds register the segments they touch
//! here. The TTL cleaner skips any segment with a positive count, so a
//! blob stays on disk until the last operation using it lets go.
//! Acquisition is RAII: the guard releases on every exit path, panics
//! included.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Shared refcount map keyed by segment rowid.
#[derive(Default)]
pub struct OngoingOps {
    counts: Mutex<HashMap<i64, usize>>,
}

impl OngoingOps {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a set of segments, returning a guard that releases them on
    /// drop.
    pub fn acquire(self: &Arc<Self>, segment_ids: Vec<i64>) -> OngoingGuard {
        {
            let mut counts = self.counts.lock();
            for id in &segment_ids {
                *counts.entry(*id).or_insert(0) += 1;
            }
        }
        OngoingGuard {
            ops: Arc::clone(self),
            segment_ids,
        }
    }

    /// Whether a segment is currently pinned.
    pub fn is_pinned(&self, segment_id: i64) -> bool {
        self.counts.lock().contains_key(&segment_id)
    }

    /// Snapshot of all pinned segment ids.
    pub fn snapshot(&self) -> HashSet<i64> {
        self.counts.lock().keys().copied().collect()
    }

    fn release(&self, segment_ids: &[i64]) {
        let mut counts = self.counts.lock();
        for id in segment_ids {
            if let Some(count) = counts.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    counts.remove(id);
                }
            }
        }
    }
}

/// RAII pin over a set of segments.
pub struct OngoingGuard {
    ops: Arc<OngoingOps>,
    segment_ids: Vec<i64>,
}

impl Drop for OngoingGuard {
    fn drop(&mut self) {
        self.ops.release(&self.segment_ids);
    }
}
