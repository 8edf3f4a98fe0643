//! In-memory accumulator of not-yet-flushed writes
//!
//! One buffer per (sub-)collection: inserts targeting a partition
//! accumulate under the partition's own collection id, so a flush seals
//! per-partition segments naturally. Deletes are tombstones by LSN; a
//! drain drops buffered rows that were tombstoned after insertion.
//!
//! The buffer is purely in memory. Durability comes from the WAL in
//! front of it, and sealing drained rows into segments is the engine's
//! job, since it owns the catalog and the blob store.

use dashmap::DashMap;
use magnetite_core::{Error, Lsn, Result, VectorBatch};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::mem::size_of;
use std::sync::Arc;

/// Bytes one buffered row occupies (id + vector).
fn row_bytes(dim: usize) -> u64 {
    (dim * size_of::<f32>() + size_of::<i64>()) as u64
}

#[derive(Default)]
struct MemCollection {
    dim: usize,
    ids: Vec<i64>,
    data: Vec<f32>,
    deletes: HashMap<i64, Lsn>,
    max_lsn: Lsn,
}

/// Rows drained from one collection's buffer, tombstones applied.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainedRows {
    /// Surviving row ids.
    pub ids: Vec<i64>,
    /// Vector dimension.
    pub dim: usize,
    /// Surviving vectors, row-major.
    pub data: Vec<f32>,
    /// Highest LSN that contributed to this buffer.
    pub max_lsn: Lsn,
}

impl DrainedRows {
    /// Number of surviving rows.
    pub fn row_count(&self) -> usize {
        self.ids.len()
    }
}

/// Per-collection accumulators of pending inserts and deletes.
#[derive(Default)]
pub struct MemBuffer {
    collections: DashMap<String, Arc<Mutex<MemCollection>>>,
}

impl MemBuffer {
    /// An empty buffer set.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, collection_id: &str) -> Arc<Mutex<MemCollection>> {
        self.collections
            .entry(collection_id.to_string())
            .or_default()
            .clone()
    }

    /// Buffer a batch for one (sub-)collection at the given LSN.
    pub fn append(
        &self,
        collection_id: &str,
        expected_dim: usize,
        batch: &VectorBatch,
        lsn: Lsn,
    ) -> Result<()> {
        if batch.dim != expected_dim {
            return Err(Error::dimension_mismatch(expected_dim, batch.dim));
        }
        let entry = self.entry(collection_id);
        let mut buffer = entry.lock();
        if buffer.dim == 0 {
            buffer.dim = batch.dim;
        } else if buffer.dim != batch.dim {
            return Err(Error::dimension_mismatch(buffer.dim, batch.dim));
        }
        buffer.ids.extend_from_slice(&batch.ids);
        buffer.data.extend_from_slice(&batch.data);
        buffer.max_lsn = buffer.max_lsn.max(lsn);
        Ok(())
    }

    /// Record tombstones against one (sub-)collection.
    pub fn append_delete(&self, collection_id: &str, ids: &[i64], lsn: Lsn) {
        let entry = self.entry(collection_id);
        let mut buffer = entry.lock();
        for id in ids {
            buffer.deletes.insert(*id, lsn);
        }
        buffer.max_lsn = buffer.max_lsn.max(lsn);
    }

    /// Buffered bytes for one collection.
    pub fn collection_bytes(&self, collection_id: &str) -> u64 {
        match self.collections.get(collection_id) {
            Some(entry) => {
                let buffer = entry.lock();
                buffer.ids.len() as u64 * row_bytes(buffer.dim)
            }
            None => 0,
        }
    }

    /// Buffered bytes across all collections.
    pub fn size_bytes(&self) -> u64 {
        self.collections
            .iter()
            .map(|entry| {
                let buffer = entry.value().lock();
                buffer.ids.len() as u64 * row_bytes(buffer.dim)
            })
            .sum()
    }

    /// Buffered (undeleted) row count for one collection.
    pub fn row_count(&self, collection_id: &str) -> usize {
        match self.collections.get(collection_id) {
            Some(entry) => {
                let buffer = entry.lock();
                buffer
                    .ids
                    .iter()
                    .filter(|id| !buffer.deletes.contains_key(id))
                    .count()
            }
            None => 0,
        }
    }

    /// Whether a collection has anything to seal.
    pub fn has_pending(&self, collection_id: &str) -> bool {
        match self.collections.get(collection_id) {
            Some(entry) => {
                let buffer = entry.lock();
                !buffer.ids.is_empty() || !buffer.deletes.is_empty()
            }
            None => false,
        }
    }

    /// Collections that currently hold pending data.
    pub fn collections_with_pending(&self) -> Vec<String> {
        self.collections
            .iter()
            .filter(|entry| {
                let buffer = entry.value().lock();
                !buffer.ids.is_empty() || !buffer.deletes.is_empty()
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Atomically take a collection's buffered rows, dropping rows that
    /// were tombstoned after insertion. Returns `None` when there was
    /// nothing buffered (tombstones alone still clear and bump the LSN
    /// watermark, since they only mask already-flushed data).
    pub fn drain(&self, collection_id: &str) -> Option<DrainedRows> {
        let entry = self.collections.get(collection_id)?.clone();
        let mut buffer = entry.lock();
        if buffer.ids.is_empty() && buffer.deletes.is_empty() {
            return None;
        }

        let dim = buffer.dim;
        let max_lsn = buffer.max_lsn;
        let ids = std::mem::take(&mut buffer.ids);
        let data = std::mem::take(&mut buffer.data);
        let deletes = std::mem::take(&mut buffer.deletes);
        drop(buffer);

        let mut kept_ids = Vec::with_capacity(ids.len());
        let mut kept_data = Vec::with_capacity(data.len());
        for (row, id) in ids.iter().enumerate() {
            if deletes.contains_key(id) {
                continue;
            }
            kept_ids.push(*id);
            kept_data.extend_from_slice(&data[row * dim..(row + 1) * dim]);
        }

        Some(DrainedRows {
            ids: kept_ids,
            dim,
            data: kept_data,
            max_lsn,
        })
    }

    /// Drop one collection's buffer entirely.
    pub fn remove_collection(&self, collection_id: &str) {
        self.collections.remove(collection_id);
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.collections.clear();
    }
}

/// Split drained rows into chunks that respect the segment size target.
pub fn split_rows(rows: &DrainedRows, target_segment_size: u64) -> Vec<DrainedRows> {
    if rows.ids.is_empty() {
        return Vec::new();
    }
    let per_row = row_bytes(rows.dim);
    let rows_per_segment = (target_segment_size / per_row).max(1) as usize;

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < rows.ids.len() {
        let end = (start + rows_per_segment).min(rows.ids.len());
        chunks.push(DrainedRows {
            ids: rows.ids[start..end].to_vec(),
            dim: rows.dim,
            data: rows.data[start * rows.dim..end * rows.dim].to_vec(),
            max_lsn: rows.max_lsn,
        });
        start = end;
    }
    chunks
}
