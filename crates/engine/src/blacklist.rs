//! Per-collection soft-delete masks
//!
//! A deleted vector id is masked at search time until compaction has
//! physically rewritten every segment that held it. Each entry remembers
//! the LSN of its DELETE record: WAL truncation must not advance past an
//! entry that compaction has not applied yet, or a restart would forget
//! the deletion. The registry is keyed by root collection: partitions
//! share their parent's mask.

use dashmap::DashMap;
use magnetite_core::Lsn;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

type Mask = Arc<RwLock<HashMap<i64, Lsn>>>;

/// Soft-deleted vector ids per root collection.
#[derive(Default)]
pub struct BlacklistRegistry {
    masks: DashMap<String, Mask>,
}

impl BlacklistRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn mask(&self, collection_id: &str) -> Mask {
        self.masks
            .entry(collection_id.to_string())
            .or_default()
            .clone()
    }

    /// Record deleted ids with the LSN of their DELETE record.
    pub fn add(&self, collection_id: &str, ids: &[i64], lsn: Lsn) {
        let mask = self.mask(collection_id);
        let mut guard = mask.write();
        for id in ids {
            guard.insert(*id, lsn);
        }
    }

    /// Whether an id is currently masked.
    pub fn contains(&self, collection_id: &str, id: i64) -> bool {
        match self.masks.get(collection_id) {
            Some(mask) => mask.read().contains_key(&id),
            None => false,
        }
    }

    /// Snapshot of masked ids for the search kernel.
    pub fn snapshot(&self, collection_id: &str) -> HashSet<i64> {
        match self.masks.get(collection_id) {
            Some(mask) => mask.read().keys().copied().collect(),
            None => HashSet::new(),
        }
    }

    /// Number of masked ids.
    pub fn len(&self, collection_id: &str) -> usize {
        match self.masks.get(collection_id) {
            Some(mask) => mask.read().len(),
            None => 0,
        }
    }

    /// Unmask ids whose deletion compaction has physically applied.
    pub fn clear_applied(&self, collection_id: &str, ids: &[i64]) {
        if let Some(mask) = self.masks.get(collection_id) {
            let mut guard = mask.write();
            for id in ids {
                guard.remove(id);
            }
        }
    }

    /// Oldest DELETE LSN not yet applied by compaction, per collection.
    ///
    /// WAL truncation takes the minimum of this and the flush watermarks:
    /// a delete record must survive on disk until its mask entry is gone.
    pub fn min_pending_lsn(&self) -> Option<Lsn> {
        let mut min = None;
        for entry in self.masks.iter() {
            for lsn in entry.value().read().values() {
                min = Some(match min {
                    None => *lsn,
                    Some(m) if *lsn < m => *lsn,
                    Some(m) => m,
                });
            }
        }
        min
    }

    /// Drop a collection's mask entirely (collection drop / drop-all).
    pub fn remove_collection(&self, collection_id: &str) {
        self.masks.remove(collection_id);
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.masks.clear();
    }
}
