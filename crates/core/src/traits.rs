//! Collaborator contracts at the engine's seams
//!
//! The engine treats segment persistence, ANN search and index building as
//! external collaborators behind these traits. The storage crate ships
//! reference implementations (file-backed blobs, an exact-scan kernel, a
//! flat builder); swapping in a real ANN library or a remote blob store is
//! a trait implementation away and invisible to the engine.

use crate::error::Result;
use crate::types::{IndexSpec, MetricType, SegmentData, SegmentMeta};
use std::collections::HashSet;

/// Persistence of segment payloads and index artifacts.
///
/// Blobs live under `<data>/<collection_id>/<segment_group>/<file_id>`; a
/// raw segment and its built index are siblings in the same group
/// directory. Content is opaque above this interface.
pub trait SegmentStore: Send + Sync {
    /// Write a raw segment payload. Returns the blob size in bytes.
    fn write_segment(&self, segment: &SegmentMeta, data: &SegmentData) -> Result<u64>;

    /// Write a built index artifact. Returns the blob size in bytes.
    fn write_artifact(&self, segment: &SegmentMeta, artifact: &[u8]) -> Result<u64>;

    /// Load a segment for searching, decoding either a raw payload or an
    /// index artifact according to the segment's kind.
    fn load_segment(&self, segment: &SegmentMeta) -> Result<SegmentData>;

    /// Delete the segment's blob file. Missing files are not an error;
    /// the TTL cleaner may race a previous partial cleanup.
    fn delete_segment(&self, segment: &SegmentMeta) -> Result<()>;

    /// Remove a segment-group directory if it is empty.
    fn remove_group_dir(&self, collection_id: &str, segment_group: &str) -> Result<()>;

    /// Remove a collection directory. With `force` false only an empty
    /// directory is removed; with `force` true the whole tree goes.
    fn remove_collection_dir(&self, collection_id: &str, force: bool) -> Result<()>;
}

/// Padded per-query search results from one segment.
///
/// `ids` and `distances` hold `nq * k` entries, row-major by query; rows
/// with fewer than `k` hits are padded with id `-1`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHits {
    /// Result ids, `-1` for padding.
    pub ids: Vec<i64>,
    /// Kernel scores aligned with `ids`.
    pub distances: Vec<f32>,
    /// Results per query row.
    pub k: usize,
}

/// Top-k search over one decoded segment.
pub trait SearchKernel: Send + Sync {
    /// Search `queries` (`nq * dim` floats, row-major) against a segment,
    /// ranking by `metric` and skipping ids in `blacklist`. `nprobe` is
    /// advisory for cluster-pruning kernels; exact kernels ignore it.
    #[allow(clippy::too_many_arguments)]
    fn search(
        &self,
        data: &SegmentData,
        queries: &[f32],
        dim: usize,
        k: usize,
        nprobe: usize,
        metric: MetricType,
        blacklist: &HashSet<i64>,
    ) -> Result<SearchHits>;
}

/// Builds an ANN index artifact from a raw segment.
pub trait IndexBuilder: Send + Sync {
    /// Produce an artifact blob for the given spec. The artifact must be
    /// loadable by the paired [`SegmentStore`] implementation.
    fn build(&self, data: &SegmentData, spec: &IndexSpec) -> Result<Vec<u8>>;
}
