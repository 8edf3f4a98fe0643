//! Core types, errors and collaborator contracts for Magnetite
//!
//! This crate is the bottom of the dependency graph. It defines:
//! - Catalog row types and the segment lifecycle state machine
//! - The unified error type with its frozen wire codes
//! - Trait seams for segment persistence, search kernels and index builders
//!
//! No I/O happens here; every higher layer depends on this crate and
//! nothing else in the workspace.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, ErrorCode, Result};
pub use traits::{IndexBuilder, SearchHits, SearchKernel, SegmentStore};
pub use types::{
    compose_lsn, date_bucket, lsn_secs, next_id, now_micros, CollectionSchema, CollectionState,
    IndexKind, IndexSpec, Lsn, MetricType, SegmentData, SegmentKind, SegmentMeta, VectorBatch,
    BUILD_INDEX_THRESHOLD, COMPACT_THRESHOLD, CURRENT_META_VERSION, MAX_NPROBE, MAX_TOPK,
};
