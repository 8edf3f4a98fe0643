//! Segment persistence and search primitives for Magnetite
//!
//! Reference implementations of the engine's collaborator traits:
//! - [`LocalSegmentStore`]: file-per-segment blobs under the data root
//! - [`BruteForceKernel`]: exact scan with SIMD-dispatched distances
//! - [`FlatIndexBuilder`]: flat artifacts behind the index-builder seam
//! - [`SegmentCache`]: byte-budget LRU with pin-aware eviction

#![warn(missing_docs)]
#![warn(clippy::all)]

mod blob;
mod cache;
pub mod distance;
mod index;
mod kernel;

pub use blob::LocalSegmentStore;
pub use cache::SegmentCache;
pub use index::{decode_artifact, encode_artifact, FlatIndexBuilder};
pub use kernel::BruteForceKernel;
