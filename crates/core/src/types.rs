//! Core types for the Magnetite vector store
//!
//! This module defines the foundational types shared by every layer:
//! - Lsn: position in the write-ahead log
//! - MetricType / IndexKind: per-collection search configuration
//! - SegmentKind: the segment lifecycle state machine
//! - CollectionSchema / SegmentMeta: catalog rows
//! - VectorBatch / SegmentData: dense vector payloads

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Log sequence number: a monotonic 64-bit position in the WAL.
///
/// The upper 32 bits carry wall-clock seconds and the lower 32 bits a
/// per-second sequence, so LSNs are roughly time-correlated. Ordering is
/// always by numeric value; the time component is informational only.
pub type Lsn = u64;

/// Pack wall-clock seconds and a sequence number into an [`Lsn`].
pub fn compose_lsn(unix_secs: u64, seq: u32) -> Lsn {
    (unix_secs << 32) | u64::from(seq)
}

/// Extract the wall-clock seconds component of an [`Lsn`].
pub fn lsn_secs(lsn: Lsn) -> u64 {
    lsn >> 32
}

/// Current time in microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Today's date bucket in `YYYYMMDD` form, derived from the epoch clock.
///
/// Segments record the bucket they were created in so age-based archival
/// can reason about calendar days without parsing timestamps.
pub fn date_bucket() -> i64 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let days = secs / 86_400;
    // civil-from-days (Howard Hinnant's algorithm), good for 1970..2100
    let z = days as i64 + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    y * 10_000 + m * 100 + d
}

/// Schema version stamped into newly created collection rows.
pub const CURRENT_META_VERSION: &str = "0.1";

/// RAW segments at or above this row count are promoted to TO_INDEX.
pub const BUILD_INDEX_THRESHOLD: u64 = 4096;

/// Upper bound on `k` for a top-k query.
pub const MAX_TOPK: usize = 16_384;

/// Upper bound on `nprobe`.
pub const MAX_NPROBE: usize = 16_384;

/// Rewrite a segment during compaction once this fraction of its rows is
/// soft-deleted.
pub const COMPACT_THRESHOLD: f64 = 0.1;

static ID_SOURCE: AtomicU64 = AtomicU64::new(0);

/// Process-wide monotonic id source.
///
/// Seeded from the microsecond clock on first use so ids stay unique across
/// restarts; strictly increasing within a process. The ids double as
/// generated collection/partition names and blob file names.
pub fn next_id() -> u64 {
    let seed = now_micros() as u64;
    let mut current = ID_SOURCE.load(Ordering::Relaxed);
    loop {
        let next = current.max(seed).wrapping_add(1);
        match ID_SOURCE.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => current = actual,
        }
    }
}

// ============================================================================
// Metric / index configuration
// ============================================================================

/// Distance metric of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    /// Squared Euclidean distance; smaller is closer.
    L2,
    /// Inner product; larger is closer.
    Ip,
    /// Hamming distance over binary vectors; smaller is closer.
    Hamming,
    /// Jaccard distance over binary vectors; smaller is closer.
    Jaccard,
}

impl MetricType {
    /// Catalog integer representation.
    pub fn as_i32(self) -> i32 {
        match self {
            MetricType::L2 => 1,
            MetricType::Ip => 2,
            MetricType::Hamming => 3,
            MetricType::Jaccard => 4,
        }
    }

    /// Parse the catalog integer representation.
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(MetricType::L2),
            2 => Some(MetricType::Ip),
            3 => Some(MetricType::Hamming),
            4 => Some(MetricType::Jaccard),
            _ => None,
        }
    }

    /// Whether this metric operates on binary vectors.
    pub fn is_binary(self) -> bool {
        matches!(self, MetricType::Hamming | MetricType::Jaccard)
    }

    /// Whether a larger kernel score means a closer match.
    ///
    /// Top-k merges use this to pick the comparator: inner product ranks
    /// descending, every distance metric ranks ascending.
    pub fn larger_is_closer(self) -> bool {
        matches!(self, MetricType::Ip)
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricType::L2 => "L2",
            MetricType::Ip => "IP",
            MetricType::Hamming => "HAMMING",
            MetricType::Jaccard => "JACCARD",
        };
        write!(f, "{}", s)
    }
}

/// ANN index family recorded per collection and per segment.
///
/// The builder and kernel are external collaborators; the engine only
/// tracks which family a segment was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    /// Flat (exact) index over float vectors; the default.
    Idmap,
    /// Inverted-file index with flat residuals.
    IvfFlat,
    /// Inverted-file index with 8-bit scalar quantization.
    IvfSq8,
    /// Hierarchical navigable small-world graph.
    Hnsw,
    /// Flat index over binary vectors.
    BinIdmap,
}

impl IndexKind {
    /// Catalog integer representation.
    pub fn as_i32(self) -> i32 {
        match self {
            IndexKind::Idmap => 1,
            IndexKind::IvfFlat => 2,
            IndexKind::IvfSq8 => 3,
            IndexKind::Hnsw => 4,
            IndexKind::BinIdmap => 5,
        }
    }

    /// Parse the catalog integer representation.
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(IndexKind::Idmap),
            2 => Some(IndexKind::IvfFlat),
            3 => Some(IndexKind::IvfSq8),
            4 => Some(IndexKind::Hnsw),
            5 => Some(IndexKind::BinIdmap),
            _ => None,
        }
    }

    /// The kind a collection falls back to when its index is dropped.
    pub fn default_for(metric: MetricType) -> Self {
        if metric.is_binary() {
            IndexKind::BinIdmap
        } else {
            IndexKind::Idmap
        }
    }
}

/// Index configuration passed to create-index and returned by describe-index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    /// Index family to build.
    pub kind: IndexKind,
    /// Opaque builder parameters (JSON).
    pub params: serde_json::Value,
    /// Metric the index ranks by.
    pub metric: MetricType,
}

// ============================================================================
// Collection catalog row
// ============================================================================

/// Lifecycle state of a collection row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionState {
    /// Serving reads and writes.
    Normal,
    /// Soft-deleted; retained until the TTL cleaner removes it.
    ToDelete,
}

impl CollectionState {
    /// Catalog integer representation.
    pub fn as_i32(self) -> i32 {
        match self {
            CollectionState::Normal => 0,
            CollectionState::ToDelete => 1,
        }
    }

    /// Parse the catalog integer representation.
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(CollectionState::Normal),
            1 => Some(CollectionState::ToDelete),
            _ => None,
        }
    }
}

/// Catalog row describing a collection or a partition.
///
/// A partition is a collection row whose `owner` names its parent and whose
/// `partition_tag` is non-empty; it reuses the parent's vector schema.
/// Nesting is forbidden: a row with a non-empty `owner` cannot itself own
/// children.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSchema {
    /// Catalog rowid; -1 until persisted.
    pub id: i64,
    /// Stable collection identifier (generated when empty at create).
    pub collection_id: String,
    /// Lifecycle state.
    pub state: CollectionState,
    /// Vector dimension; every insert must match.
    pub dimension: usize,
    /// Creation timestamp, microseconds.
    pub created_on: i64,
    /// Reserved per-collection flags.
    pub flag: i64,
    /// Segments are merged until they approach this many bytes.
    pub target_segment_size: u64,
    /// Current index family.
    pub index: IndexKind,
    /// Opaque index parameters (JSON text).
    pub index_params: String,
    /// Distance metric.
    pub metric: MetricType,
    /// Parent collection id; empty for a root collection.
    pub owner: String,
    /// Partition tag; empty for a root collection.
    pub partition_tag: String,
    /// Meta schema version the row was written with.
    pub version: String,
    /// Last LSN whose effects are durable in segments.
    pub flush_lsn: Lsn,
}

impl CollectionSchema {
    /// A fresh root-collection row with the given id, dimension and metric.
    ///
    /// Index configuration starts at the metric's default; timestamps and
    /// the rowid are filled in by the catalog.
    pub fn new(collection_id: impl Into<String>, dimension: usize, metric: MetricType) -> Self {
        Self {
            id: -1,
            collection_id: collection_id.into(),
            state: CollectionState::Normal,
            dimension,
            created_on: 0,
            flag: 0,
            target_segment_size: 0,
            index: IndexKind::default_for(metric),
            index_params: "{}".to_string(),
            metric,
            owner: String::new(),
            partition_tag: String::new(),
            version: CURRENT_META_VERSION.to_string(),
            flush_lsn: 0,
        }
    }

    /// Whether this row is a partition of another collection.
    pub fn is_partition(&self) -> bool {
        !self.owner.is_empty()
    }
}

// ============================================================================
// Segment catalog row
// ============================================================================

/// Lifecycle state of a segment.
///
/// ```text
/// NEW ──flush ok──▶ RAW ──threshold──▶ TO_INDEX ──builder ok──▶ INDEX
///  │                 │
///  │                 └──merge picks──▶ NEW_MERGE ──ok──▶ RAW
///  ├──flush fail──▶ TO_DELETE
///  └──build──▶ NEW_INDEX ──ok──▶ INDEX, fail──▶ TO_DELETE
/// BACKUP ──index drop──▶ RAW      TO_DELETE ──TTL──▶ removed
/// ```
///
/// Only {RAW, TO_INDEX, INDEX} are visible to queries. The shadow states
/// {NEW, NEW_MERGE, NEW_INDEX} have blobs on disk but stay invisible until
/// the producing operation commits; survivors are purged at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentKind {
    /// Being written by a flush; invisible.
    New,
    /// Flushed raw vectors; searchable and mergeable.
    Raw,
    /// Raw segment queued for index build; still searchable.
    ToIndex,
    /// Built index artifact; searchable.
    Index,
    /// Tombstoned; blob retained until the TTL cleaner runs.
    ToDelete,
    /// Being written by a merge; invisible.
    NewMerge,
    /// Being written by an index build; invisible.
    NewIndex,
    /// Raw sibling kept after an index build; revived on index change.
    Backup,
}

impl SegmentKind {
    /// Catalog integer representation.
    pub fn as_i32(self) -> i32 {
        match self {
            SegmentKind::New => 0,
            SegmentKind::Raw => 1,
            SegmentKind::ToIndex => 2,
            SegmentKind::Index => 3,
            SegmentKind::ToDelete => 4,
            SegmentKind::NewMerge => 5,
            SegmentKind::NewIndex => 6,
            SegmentKind::Backup => 7,
        }
    }

    /// Parse the catalog integer representation.
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(SegmentKind::New),
            1 => Some(SegmentKind::Raw),
            2 => Some(SegmentKind::ToIndex),
            3 => Some(SegmentKind::Index),
            4 => Some(SegmentKind::ToDelete),
            5 => Some(SegmentKind::NewMerge),
            6 => Some(SegmentKind::NewIndex),
            7 => Some(SegmentKind::Backup),
            _ => None,
        }
    }

    /// Whether queries may read this segment.
    pub fn is_visible(self) -> bool {
        matches!(
            self,
            SegmentKind::Raw | SegmentKind::ToIndex | SegmentKind::Index
        )
    }

    /// Whether this is an uncommitted shadow state.
    pub fn is_shadow(self) -> bool {
        matches!(
            self,
            SegmentKind::New | SegmentKind::NewMerge | SegmentKind::NewIndex
        )
    }
}

/// Catalog row describing one segment file.
///
/// `dimension`, `metric`, `index_params` and `target_segment_size` are not
/// stored on the segment row; the catalog fills them in from the owning
/// collection when it materializes a `SegmentMeta`.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentMeta {
    /// Catalog rowid; -1 until persisted.
    pub id: i64,
    /// Owning (sub-)collection.
    pub collection_id: String,
    /// Segments sharing this id share an on-disk directory; a raw segment
    /// and its built index are siblings with the same group.
    pub segment_group: String,
    /// Unique blob name within the group directory.
    pub file_id: String,
    /// Lifecycle state.
    pub kind: SegmentKind,
    /// Blob size in bytes.
    pub bytes: u64,
    /// Number of vectors in the segment.
    pub row_count: u64,
    /// Date bucket (`YYYYMMDD`) the segment was created in.
    pub date: i64,
    /// Index family of the payload (the collection default for raw data).
    pub index: IndexKind,
    /// Creation timestamp, microseconds.
    pub created_on: i64,
    /// Last state-change timestamp, microseconds. The TTL cleaner measures
    /// the TO_DELETE grace period from this.
    pub updated_at: i64,
    /// LSN the producing flush covered.
    pub flush_lsn: Lsn,
    /// Vector dimension, copied from the owning collection.
    pub dimension: usize,
    /// Distance metric, copied from the owning collection.
    pub metric: MetricType,
    /// Index parameters, copied from the owning collection.
    pub index_params: String,
    /// Merge target, copied from the owning collection.
    pub target_segment_size: u64,
}

impl SegmentMeta {
    /// A blank row owned by `collection_id`; the catalog assigns ids,
    /// copies collection attributes and stamps timestamps on insert.
    pub fn new(collection_id: impl Into<String>) -> Self {
        Self {
            id: -1,
            collection_id: collection_id.into(),
            segment_group: String::new(),
            file_id: String::new(),
            kind: SegmentKind::New,
            bytes: 0,
            row_count: 0,
            date: 0,
            index: IndexKind::Idmap,
            created_on: 0,
            updated_at: 0,
            flush_lsn: 0,
            dimension: 0,
            metric: MetricType::L2,
            index_params: "{}".to_string(),
            target_segment_size: 0,
        }
    }
}

// ============================================================================
// Vector payloads
// ============================================================================

/// A dense batch of vectors with their ids, row-major.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorBatch {
    /// One id per row.
    pub ids: Vec<i64>,
    /// Vector dimension.
    pub dim: usize,
    /// `ids.len() * dim` floats, row-major.
    pub data: Vec<f32>,
}

impl VectorBatch {
    /// Build a batch, checking that `data` is `ids.len() * dim` floats.
    pub fn new(ids: Vec<i64>, dim: usize, data: Vec<f32>) -> Option<Self> {
        if dim == 0 || data.len() != ids.len() * dim {
            return None;
        }
        Some(Self { ids, dim, data })
    }

    /// Number of vectors in the batch.
    pub fn row_count(&self) -> usize {
        self.ids.len()
    }

    /// Approximate in-memory footprint in bytes.
    pub fn approx_bytes(&self) -> u64 {
        (self.data.len() * std::mem::size_of::<f32>() + self.ids.len() * std::mem::size_of::<i64>())
            as u64
    }

    /// The `row`-th vector.
    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.dim..(row + 1) * self.dim]
    }
}

/// Decoded contents of one segment blob: the unit the search kernel scans.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentData {
    /// One id per row.
    pub ids: Vec<i64>,
    /// Vector dimension.
    pub dim: usize,
    /// `ids.len() * dim` floats, row-major.
    pub data: Vec<f32>,
}

impl SegmentData {
    /// Number of vectors in the segment.
    pub fn row_count(&self) -> usize {
        self.ids.len()
    }

    /// Approximate in-memory footprint in bytes.
    pub fn approx_bytes(&self) -> u64 {
        (self.data.len() * std::mem::size_of::<f32>() + self.ids.len() * std::mem::size_of::<i64>())
            as u64
    }

    /// The `row`-th vector.
    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.dim..(row + 1) * self.dim]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_compose_orders_by_time_then_seq() {
        let a = compose_lsn(100, 7);
        let b = compose_lsn(100, 8);
        let c = compose_lsn(101, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(lsn_secs(c), 101);
    }

    #[test]
    fn next_id_is_strictly_increasing() {
        let a = next_id();
        let b = next_id();
        let c = next_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn metric_round_trip_and_ordering() {
        for m in [
            MetricType::L2,
            MetricType::Ip,
            MetricType::Hamming,
            MetricType::Jaccard,
        ] {
            assert_eq!(MetricType::from_i32(m.as_i32()), Some(m));
        }
        assert!(MetricType::Ip.larger_is_closer());
        assert!(!MetricType::L2.larger_is_closer());
        assert!(MetricType::Jaccard.is_binary());
        assert_eq!(MetricType::from_i32(99), None);
    }

    #[test]
    fn index_kind_defaults_follow_metric() {
        assert_eq!(IndexKind::default_for(MetricType::L2), IndexKind::Idmap);
        assert_eq!(
            IndexKind::default_for(MetricType::Hamming),
            IndexKind::BinIdmap
        );
    }

    #[test]
    fn segment_kind_visibility() {
        assert!(SegmentKind::Raw.is_visible());
        assert!(SegmentKind::ToIndex.is_visible());
        assert!(SegmentKind::Index.is_visible());
        for k in [
            SegmentKind::New,
            SegmentKind::NewMerge,
            SegmentKind::NewIndex,
            SegmentKind::ToDelete,
            SegmentKind::Backup,
        ] {
            assert!(!k.is_visible());
        }
        assert!(SegmentKind::NewMerge.is_shadow());
        assert!(!SegmentKind::Backup.is_shadow());
    }

    #[test]
    fn segment_kind_round_trip() {
        for v in 0..8 {
            let kind = SegmentKind::from_i32(v).unwrap();
            assert_eq!(kind.as_i32(), v);
        }
        assert_eq!(SegmentKind::from_i32(8), None);
    }

    #[test]
    fn vector_batch_validates_shape() {
        assert!(VectorBatch::new(vec![1, 2], 4, vec![0.0; 8]).is_some());
        assert!(VectorBatch::new(vec![1, 2], 4, vec![0.0; 7]).is_none());
        assert!(VectorBatch::new(vec![1], 0, vec![]).is_none());

        let batch = VectorBatch::new(vec![1, 2], 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(batch.row(1), &[3.0, 4.0]);
        assert_eq!(batch.row_count(), 2);
    }

    #[test]
    fn date_bucket_is_plausible() {
        let bucket = date_bucket();
        assert!(bucket > 20_200_101);
        assert!(bucket < 21_000_101);
        let month = (bucket / 100) % 100;
        let day = bucket % 100;
        assert!((1..=12).contains(&month));
        assert!((1..=31).contains(&day));
    }

    #[test]
    fn partition_predicate() {
        let mut schema = CollectionSchema::new("c1", 8, MetricType::L2);
        assert!(!schema.is_partition());
        schema.owner = "parent".to_string();
        assert!(schema.is_partition());
    }
}
