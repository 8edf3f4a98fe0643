//! Bounded retry tracking for failed index builds
//!
//! A segment whose build keeps failing must not wedge the build pool in a
//! retry loop. After `max_attempts` failures the segment is skip-listed:
//! it stays TO_INDEX in the catalog but future sweeps pass it over until
//! the tracker is cleared by an index-schema change.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::warn;

/// Default build attempts before a segment is skip-listed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Failure counts keyed by (collection, file id).
pub struct IndexFailedTracker {
    attempts: Mutex<HashMap<(String, String), u32>>,
    max_attempts: u32,
}

impl Default for IndexFailedTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl IndexFailedTracker {
    /// A tracker allowing `max_attempts` failures per segment.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            max_attempts,
        }
    }

    /// Record one failed build attempt.
    pub fn record_failure(&self, collection_id: &str, file_id: &str) {
        let mut attempts = self.attempts.lock();
        let count = attempts
            .entry((collection_id.to_string(), file_id.to_string()))
            .or_insert(0);
        *count += 1;
        if *count >= self.max_attempts {
            warn!(
                collection = collection_id,
                file = file_id,
                attempts = *count,
                "index build skip-listed after repeated failures"
            );
        }
    }

    /// Whether future sweeps should pass this segment over.
    pub fn should_skip(&self, collection_id: &str, file_id: &str) -> bool {
        self.attempts
            .lock()
            .get(&(collection_id.to_string(), file_id.to_string()))
            .is_some_and(|count| *count >= self.max_attempts)
    }

    /// Forget a successfully built segment.
    pub fn record_success(&self, collection_id: &str, file_id: &str) {
        self.attempts
            .lock()
            .remove(&(collection_id.to_string(), file_id.to_string()));
    }

    /// Clear a collection's failures (index-schema change).
    pub fn clear_collection(&self, collection_id: &str) {
        self.attempts
            .lock()
            .retain(|(collection, _), _| collection != collection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_after_max_attempts() {
        let tracker = IndexFailedTracker::new(2);
        assert!(!tracker.should_skip("c1", "f1"));

        tracker.record_failure("c1", "f1");
        assert!(!tracker.should_skip("c1", "f1"));

        tracker.record_failure("c1", "f1");
        assert!(tracker.should_skip("c1", "f1"));
    }

    #[test]
    fn success_resets_the_count() {
        let tracker = IndexFailedTracker::new(2);
        tracker.record_failure("c1", "f1");
        tracker.record_success("c1", "f1");
        tracker.record_failure("c1", "f1");
        assert!(!tracker.should_skip("c1", "f1"));
    }

    #[test]
    fn clear_collection_is_scoped() {
        let tracker = IndexFailedTracker::new(1);
        tracker.record_failure("c1", "f1");
        tracker.record_failure("c2", "f2");
        assert!(tracker.should_skip("c1", "f1"));
        assert!(tracker.should_skip("c2", "f2"));

        tracker.clear_collection("c1");
        assert!(!tracker.should_skip("c1", "f1"));
        assert!(tracker.should_skip("c2", "f2"));
    }

    #[test]
    fn segments_are_tracked_independently() {
        let tracker = IndexFailedTracker::new(1);
        tracker.record_failure("c1", "f1");
        assert!(tracker.should_skip("c1", "f1"));
        assert!(!tracker.should_skip("c1", "f2"));
    }
}
