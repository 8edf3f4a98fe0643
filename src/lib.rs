//! Magnetite: the storage-and-execution core of a vector database
//!
//! Vectors enter through a write-ahead log into per-collection memory
//! buffers, seal into immutable on-disk segments, get merged and indexed
//! by background workers, and answer top-k similarity queries with
//! soft-delete masking and partition scoping.
//!
//! This crate is the facade over the workspace: it re-exports the engine
//! API and the core types needed to drive it.
//!
//! # Example
//!
//! ```no_run
//! use magnetite::{CollectionSchema, Engine, EngineConfig, MetricType, QueryContext, VectorBatch};
//!
//! # fn main() -> magnetite::Result<()> {
//! let engine = Engine::open(EngineConfig::new("/var/lib/magnetite"))?;
//!
//! let mut schema = CollectionSchema::new("embeddings", 4, MetricType::L2);
//! engine.create_collection(&mut schema)?;
//!
//! let batch = VectorBatch::new(
//!     vec![1, 2],
//!     4,
//!     vec![0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0],
//! )
//! .unwrap();
//! engine.insert("embeddings", "", &batch)?;
//! engine.flush("embeddings")?;
//!
//! let hits = engine.query(
//!     &QueryContext::new(),
//!     "embeddings",
//!     &[],
//!     2,
//!     16,
//!     &[0.0, 0.0, 0.0, 0.0],
//! )?;
//! assert_eq!(hits.ids[0], 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use magnetite_core::{
    CollectionSchema, CollectionState, Error, ErrorCode, IndexKind, IndexSpec, Lsn, MetricType,
    Result, SearchHits, SegmentKind, SegmentMeta, VectorBatch,
};
pub use magnetite_engine::{Engine, EngineConfig, QueryContext, QueryResult};
