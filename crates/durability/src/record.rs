//! WAL record types and frame codec
//!
//! Each record captures one state-changing operation:
//! - Insert: a dense vector batch bound for one (sub-)collection
//! - Delete: soft-deleted vector ids
//! - Flush: marker that a collection's memory was sealed to segments
//!
//! ## Frame format
//!
//! Records are framed as `[len: u32 LE][crc32: u32 LE][bincode payload]`.
//! The CRC covers the payload only. A short or mismatching tail is how a
//! crash mid-append looks; the reader treats it as the end of the log,
//! not as corruption of committed data.

use magnetite_core::{Error, Lsn, Result, VectorBatch};
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Maximum accepted frame payload, a guard against reading garbage
/// lengths from a damaged file.
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// The operation a WAL record describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalOperation {
    /// Insert a batch of vectors.
    Insert(VectorBatch),
    /// Soft-delete vectors by id.
    Delete(Vec<i64>),
    /// The collection's in-memory buffer was flushed through this LSN.
    Flush,
}

impl WalOperation {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WalOperation::Insert(_) => "insert",
            WalOperation::Delete(_) => "delete",
            WalOperation::Flush => "flush",
        }
    }
}

/// One write-ahead log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Position in the log; assigned by the writer, strictly increasing.
    pub lsn: Lsn,
    /// Root collection the operation targets.
    pub collection_id: String,
    /// Partition tag, empty for the root collection. Replay re-resolves
    /// the tag because partition ids are not stable across a drop/create.
    pub partition_tag: String,
    /// The operation payload.
    pub op: WalOperation,
}

/// Encode a record into a framed byte vector.
pub fn encode_frame(record: &WalRecord) -> Result<Vec<u8>> {
    let payload =
        bincode::serialize(record).map_err(|e| Error::serialization(e.to_string()))?;
    let crc = crc32fast::hash(&payload);
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Outcome of pulling one frame off a reader.
#[derive(Debug)]
pub enum FrameRead {
    /// A complete, checksummed record.
    Record(WalRecord),
    /// Clean end of file.
    Eof,
    /// A short or mismatching tail: the end of what was durably written.
    TornTail {
        /// Why the tail was rejected.
        reason: String,
    },
}

/// Read one frame. Distinguishes clean EOF, a torn tail (crash during
/// append) and a decodable record.
pub fn read_frame(reader: &mut impl Read) -> Result<FrameRead> {
    let mut header = [0u8; 8];
    match read_exact_or_eof(reader, &mut header)? {
        0 => return Ok(FrameRead::Eof),
        8 => {}
        n => {
            return Ok(FrameRead::TornTail {
                reason: format!("partial frame header ({} of 8 bytes)", n),
            })
        }
    }

    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_LEN {
        return Ok(FrameRead::TornTail {
            reason: format!("frame length {} exceeds limit", len),
        });
    }

    let mut payload = vec![0u8; len as usize];
    let got = read_exact_or_eof(reader, &mut payload)?;
    if got != payload.len() {
        return Ok(FrameRead::TornTail {
            reason: format!("partial frame payload ({} of {} bytes)", got, len),
        });
    }

    if crc32fast::hash(&payload) != crc {
        return Ok(FrameRead::TornTail {
            reason: "frame checksum mismatch".to_string(),
        });
    }

    let record = bincode::deserialize(&payload)
        .map_err(|e| Error::corruption(format!("undecodable WAL record: {}", e)))?;
    Ok(FrameRead::Record(record))
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
