//! Transactional catalog for Magnetite
//!
//! This crate owns `meta.db`: the durable record of collections,
//! partitions and segment files with their lifecycle state. Every
//! multi-row mutation is a single SQLite transaction; the engine above
//! relies on that for its shadow-state commit protocol.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod store;

pub use store::MetaStore;
