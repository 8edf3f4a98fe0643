//! File-backed segment store
//!
//! Blobs live under `<data>/<collection_id>/<segment_group>/<file_id>`.
//! A raw segment and its index sibling share the group directory. The
//! payload codec is private to this store: raw segments are a bincode
//! `SegmentData`, index artifacts carry a small header in front (see
//! [`crate::index`]) so a loaded blob always decodes to `SegmentData`.

use crate::index::decode_artifact;
use magnetite_core::{Error, Result, SegmentData, SegmentKind, SegmentMeta, SegmentStore};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Local-filesystem implementation of [`SegmentStore`].
pub struct LocalSegmentStore {
    data_path: PathBuf,
}

impl LocalSegmentStore {
    /// A store rooted at the engine's data directory.
    pub fn new(data_path: impl AsRef<Path>) -> Self {
        Self {
            data_path: data_path.as_ref().to_path_buf(),
        }
    }

    fn segment_path(&self, segment: &SegmentMeta) -> PathBuf {
        self.data_path
            .join(&segment.collection_id)
            .join(&segment.segment_group)
            .join(&segment.file_id)
    }

    fn write_bytes(&self, segment: &SegmentMeta, bytes: &[u8]) -> Result<u64> {
        let path = self.segment_path(segment);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&path)?;
        file.write_all(bytes)?;
        file.sync_data()?;
        debug!(file = %path.display(), bytes = bytes.len(), "wrote segment blob");
        Ok(bytes.len() as u64)
    }
}

impl SegmentStore for LocalSegmentStore {
    fn write_segment(&self, segment: &SegmentMeta, data: &SegmentData) -> Result<u64> {
        let bytes =
            bincode::serialize(data).map_err(|e| Error::serialization(e.to_string()))?;
        self.write_bytes(segment, &bytes)
    }

    fn write_artifact(&self, segment: &SegmentMeta, artifact: &[u8]) -> Result<u64> {
        self.write_bytes(segment, artifact)
    }

    fn load_segment(&self, segment: &SegmentMeta) -> Result<SegmentData> {
        let path = self.segment_path(segment);
        let bytes = fs::read(&path)?;
        let data = if segment.kind == SegmentKind::Index {
            decode_artifact(&bytes)?.1
        } else {
            bincode::deserialize(&bytes).map_err(|e| {
                Error::corruption(format!("undecodable segment {}: {}", path.display(), e))
            })?
        };
        if data.data.len() != data.ids.len() * data.dim {
            return Err(Error::corruption(format!(
                "segment {} shape mismatch: {} ids, dim {}, {} floats",
                path.display(),
                data.ids.len(),
                data.dim,
                data.data.len()
            )));
        }
        Ok(data)
    }

    fn delete_segment(&self, segment: &SegmentMeta) -> Result<()> {
        let path = self.segment_path(segment);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(file = %path.display(), "erased segment blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_group_dir(&self, collection_id: &str, segment_group: &str) -> Result<()> {
        let dir = self.data_path.join(collection_id).join(segment_group);
        if !dir.exists() {
            return Ok(());
        }
        if fs::read_dir(&dir)?.next().is_none() {
            fs::remove_dir(&dir)?;
            debug!(dir = %dir.display(), "removed segment group directory");
        }
        Ok(())
    }

    fn remove_collection_dir(&self, collection_id: &str, force: bool) -> Result<()> {
        let dir = self.data_path.join(collection_id);
        if !dir.exists() {
            return Ok(());
        }
        if force {
            fs::remove_dir_all(&dir)?;
            debug!(dir = %dir.display(), "removed collection directory");
        } else if fs::read_dir(&dir)?.next().is_none() {
            fs::remove_dir(&dir)?;
            debug!(dir = %dir.display(), "removed empty collection directory");
        }
        Ok(())
    }
}
