//! The Magnetite engine
//!
//! This crate orchestrates the lower layers into the public storage-and-
//! execution core:
//! - `Engine`: the facade (collections, partitions, writes, indexes,
//!   queries, admin)
//! - `MemBuffer`: WAL-fronted in-memory accumulator
//! - maintenance workers: merge, compaction, index builds, TTL cleanup
//! - query dispatch: concurrent fan-out with blacklist masking
//!
//! The engine is the only component that coordinates across layers:
//! catalog + WAL + blob store + background work.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod blacklist;
mod config;
mod context;
mod engine;
mod index_tracker;
mod maintenance;
mod mem_buffer;
mod ongoing;
mod query;
mod wait_notify;
mod worker_pool;

pub use blacklist::BlacklistRegistry;
pub use config::{EngineConfig, CONFIG_FILE_NAME};
pub use context::QueryContext;
pub use engine::{Engine, QueryResult};
pub use index_tracker::IndexFailedTracker;
pub use mem_buffer::MemBuffer;
pub use ongoing::{OngoingGuard, OngoingOps};
pub use wait_notify::WaitNotify;
pub use worker_pool::WorkerPool;
