//! Reference index builder
//!
//! Real ANN families live behind the [`IndexBuilder`] trait; this module
//! ships the flat reference implementation whose artifact is the segment
//! payload re-encoded behind a typed header. Search over such an
//! artifact is an exact scan, which keeps the engine's lifecycle (build,
//! commit, serve, drop) fully exercisable without an ANN dependency.
//!
//! Artifact layout: `[magic "MGIX"][kind: i32 LE][bincode SegmentData]`.

use magnetite_core::{Error, IndexBuilder, IndexKind, IndexSpec, Result, SegmentData};

const ARTIFACT_MAGIC: &[u8; 4] = b"MGIX";

/// Encode an artifact blob for `kind` around a segment payload.
pub fn encode_artifact(kind: IndexKind, data: &SegmentData) -> Result<Vec<u8>> {
    let payload = bincode::serialize(data).map_err(|e| Error::serialization(e.to_string()))?;
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(ARTIFACT_MAGIC);
    out.extend_from_slice(&kind.as_i32().to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode an artifact blob into its index kind and payload.
pub fn decode_artifact(bytes: &[u8]) -> Result<(IndexKind, SegmentData)> {
    if bytes.len() < 8 || &bytes[..4] != ARTIFACT_MAGIC {
        return Err(Error::corruption("index artifact magic mismatch"));
    }
    let kind_raw = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let kind = IndexKind::from_i32(kind_raw)
        .ok_or_else(|| Error::corruption(format!("unknown index kind {}", kind_raw)))?;
    let data = bincode::deserialize(&bytes[8..])
        .map_err(|e| Error::corruption(format!("undecodable index artifact: {}", e)))?;
    Ok((kind, data))
}

/// Builder producing flat artifacts for any requested kind.
#[derive(Debug, Default)]
pub struct FlatIndexBuilder;

impl IndexBuilder for FlatIndexBuilder {
    fn build(&self, data: &SegmentData, spec: &IndexSpec) -> Result<Vec<u8>> {
        if data.row_count() == 0 {
            return Err(Error::invalid_argument("cannot index an empty segment"));
        }
        if spec.metric.is_binary() {
            return Err(Error::invalid_argument(format!(
                "metric {} needs a binary index builder",
                spec.metric
            )));
        }
        encode_artifact(spec.kind, data)
    }
}
