//! Byte-budget LRU cache of decoded segments
//!
//! Query workers go through this cache instead of hitting the blob store
//! per search. The budget is in bytes, not entries, because segment
//! sizes vary by orders of magnitude. Eviction is pin-aware: an entry
//! whose segment is pinned by an in-flight operation is skipped and
//! reconsidered once the pin drops: a pinned segment's data must stay
//! reachable for the duration of the query holding it.

use lru::LruCache;
use magnetite_core::{Result, SegmentData, SegmentMeta, SegmentStore};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

struct CacheInner {
    entries: LruCache<i64, Arc<SegmentData>>,
    bytes: u64,
}

/// Shared LRU over decoded segment payloads, keyed by catalog rowid.
pub struct SegmentCache {
    inner: Mutex<CacheInner>,
    budget: u64,
}

impl SegmentCache {
    /// A cache bounded to `budget` bytes of decoded payloads.
    pub fn new(budget: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                bytes: 0,
            }),
            budget,
        }
    }

    /// Fetch a segment, loading through `store` on a miss.
    ///
    /// `pinned` reports whether a given segment id may not be evicted
    /// right now; over-budget pinned entries are deferred, not dropped.
    pub fn get_or_load(
        &self,
        segment: &SegmentMeta,
        store: &dyn SegmentStore,
        pinned: &dyn Fn(i64) -> bool,
    ) -> Result<Arc<SegmentData>> {
        if let Some(hit) = self.inner.lock().entries.get(&segment.id) {
            return Ok(Arc::clone(hit));
        }

        // Load outside the lock: segment decode is the expensive part and
        // concurrent queries for different segments must not serialize on it.
        let data = Arc::new(store.load_segment(segment)?);
        let bytes = data.approx_bytes();

        let mut inner = self.inner.lock();
        if inner.entries.put(segment.id, Arc::clone(&data)).is_none() {
            inner.bytes += bytes;
        }
        self.evict_over_budget(&mut inner, pinned);
        Ok(data)
    }

    /// Drop one entry (a deleted or rewritten segment).
    pub fn evict(&self, segment_id: i64) {
        let mut inner = self.inner.lock();
        if let Some(data) = inner.entries.pop(&segment_id) {
            inner.bytes = inner.bytes.saturating_sub(data.approx_bytes());
        }
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.bytes = 0;
    }

    /// Bytes currently held.
    pub fn bytes(&self) -> u64 {
        self.inner.lock().bytes
    }

    /// Number of cached segments.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    fn evict_over_budget(&self, inner: &mut CacheInner, pinned: &dyn Fn(i64) -> bool) {
        // Pop from the cold end; pinned entries get re-inserted, which
        // promotes them, but a pinned segment is in active use anyway.
        let mut deferred = Vec::new();
        while inner.bytes > self.budget {
            match inner.entries.pop_lru() {
                Some((id, data)) => {
                    if pinned(id) {
                        deferred.push((id, data));
                    } else {
                        inner.bytes = inner.bytes.saturating_sub(data.approx_bytes());
                        debug!(segment = id, "evicted segment from cache");
                    }
                }
                None => break,
            }
        }
        for (id, data) in deferred {
            inner.entries.put(id, data);
        }
    }
}
