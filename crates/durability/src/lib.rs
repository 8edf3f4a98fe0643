//! Write-ahead log for Magnetite
//!
//! An acknowledged write must survive a crash before it reaches a
//! segment. This crate provides the append-only record log that makes
//! that promise: framed, checksummed records in size-rotated files named
//! by their first LSN, with ordered replay and truncation once segments
//! have caught up.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod manager;
mod record;

pub use manager::{WalConfig, WalManager};
pub use record::{encode_frame, read_frame, FrameRead, WalOperation, WalRecord, MAX_FRAME_LEN};
