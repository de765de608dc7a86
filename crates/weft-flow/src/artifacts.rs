//! Artifact storage for large task results.
//!
//! A task declared with `persist` hands its result to the artifact store and
//! returns an [`ArtifactRef`] in its place. Downstream tasks receive the ref
//! as-is, never auto-dereferenced, and fetch the payload explicitly when
//! they want it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use weft_core::config::ArtifactSerializerKind;
use weft_core::ArtifactId;

use crate::error::{Error, Result};
use crate::value::TaskValue;

/// Opaque handle to a stored blob.
///
/// Serializes as `{"$weft_artifact": "<id>"}` so a ref can travel through
/// the value model (and the result cache) like any other value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Identifier of the blob within the store.
    #[serde(rename = "$weft_artifact")]
    pub id: ArtifactId,
}

impl ArtifactRef {
    /// Encodes the ref as a task value.
    #[must_use]
    pub fn to_value(&self) -> TaskValue {
        serde_json::to_value(self).unwrap_or(TaskValue::Null)
    }

    /// Decodes a ref from a task value, if it is one.
    #[must_use]
    pub fn from_value(value: &TaskValue) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Handle-based blob store.
pub trait ArtifactStore: Send + Sync {
    /// Stores `value` and returns a handle to it.
    ///
    /// # Errors
    ///
    /// Returns a [`Error::Artifact`] when the backend cannot persist the blob.
    fn put(&self, value: &TaskValue) -> Result<ArtifactRef>;

    /// Fetches the value behind `artifact`.
    ///
    /// # Errors
    ///
    /// Returns a [`Error::Artifact`] when the handle is unknown or the blob
    /// cannot be decoded.
    fn get(&self, artifact: &ArtifactRef) -> Result<TaskValue>;

    /// Removes the blob behind `artifact`. Deleting an unknown handle is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns a [`Error::Artifact`] for backend faults.
    fn delete(&self, artifact: &ArtifactRef) -> Result<()>;
}

/// Handle → value map. Lives and dies with the process.
#[derive(Default)]
pub struct InMemoryArtifactStore {
    blobs: Mutex<HashMap<ArtifactId, TaskValue>>,
}

impl InMemoryArtifactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.lock().expect("artifact lock poisoned").len()
    }

    /// True when the store holds no blobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn put(&self, value: &TaskValue) -> Result<ArtifactRef> {
        let id = ArtifactId::new();
        self.blobs
            .lock()
            .expect("artifact lock poisoned")
            .insert(id, value.clone());
        Ok(ArtifactRef { id })
    }

    fn get(&self, artifact: &ArtifactRef) -> Result<TaskValue> {
        self.blobs
            .lock()
            .expect("artifact lock poisoned")
            .get(&artifact.id)
            .cloned()
            .ok_or_else(|| Error::artifact(format!("unknown artifact {}", artifact.id)))
    }

    fn delete(&self, artifact: &ArtifactRef) -> Result<()> {
        self.blobs
            .lock()
            .expect("artifact lock poisoned")
            .remove(&artifact.id);
        Ok(())
    }
}

/// Binary envelope used by the bincode serializer: a version tag plus the
/// JSON-encoded payload text. Framing the text keeps the codec
/// self-describing enough to round-trip arbitrary task values.
#[derive(Serialize, Deserialize)]
struct BinaryEnvelope {
    version: u32,
    payload: String,
}

const BINARY_ENVELOPE_VERSION: u32 = 1;

/// One blob file per handle under a root directory. Holds no in-memory copy
/// of stored values.
pub struct FileSystemArtifactStore {
    root: PathBuf,
    serializer: ArtifactSerializerKind,
}

impl FileSystemArtifactStore {
    /// Creates a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns a [`Error::Artifact`] when the root cannot be created.
    pub fn new(root: impl Into<PathBuf>, serializer: ArtifactSerializerKind) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::artifact_with_source("failed to create artifact root", e))?;
        Ok(Self { root, serializer })
    }

    fn path_for(&self, id: ArtifactId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn encode(&self, value: &TaskValue) -> Result<Vec<u8>> {
        match self.serializer {
            ArtifactSerializerKind::Json => serde_json::to_vec(value)
                .map_err(|e| Error::artifact_with_source("failed to encode artifact", e)),
            ArtifactSerializerKind::Bincode => {
                let payload = serde_json::to_string(value)
                    .map_err(|e| Error::artifact_with_source("failed to encode artifact", e))?;
                bincode::serialize(&BinaryEnvelope {
                    version: BINARY_ENVELOPE_VERSION,
                    payload,
                })
                .map_err(|e| Error::artifact_with_source("failed to frame artifact", e))
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<TaskValue> {
        match self.serializer {
            ArtifactSerializerKind::Json => serde_json::from_slice(bytes)
                .map_err(|e| Error::artifact_with_source("failed to decode artifact", e)),
            ArtifactSerializerKind::Bincode => {
                let envelope: BinaryEnvelope = bincode::deserialize(bytes)
                    .map_err(|e| Error::artifact_with_source("failed to unframe artifact", e))?;
                serde_json::from_str(&envelope.payload)
                    .map_err(|e| Error::artifact_with_source("failed to decode artifact", e))
            }
        }
    }
}

impl ArtifactStore for FileSystemArtifactStore {
    fn put(&self, value: &TaskValue) -> Result<ArtifactRef> {
        let id = ArtifactId::new();
        let bytes = self.encode(value)?;
        std::fs::write(self.path_for(id), bytes)
            .map_err(|e| Error::artifact_with_source("failed to write artifact", e))?;
        Ok(ArtifactRef { id })
    }

    fn get(&self, artifact: &ArtifactRef) -> Result<TaskValue> {
        let path = self.path_for(artifact.id);
        let bytes = std::fs::read(&path)
            .map_err(|e| Error::artifact_with_source(format!("unknown artifact {}", artifact.id), e))?;
        self.decode(&bytes)
    }

    fn delete(&self, artifact: &ArtifactRef) -> Result<()> {
        match std::fs::remove_file(self.path_for(artifact.id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::artifact_with_source("failed to delete artifact", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_store_roundtrip_and_delete() {
        let store = InMemoryArtifactStore::new();
        let r = store.put(&json!([1, 2, 3])).unwrap();
        assert_eq!(store.get(&r).unwrap(), json!([1, 2, 3]));
        assert_eq!(store.len(), 1);

        store.delete(&r).unwrap();
        assert!(store.is_empty());
        assert!(store.get(&r).is_err());
        // Deleting again is a no-op.
        store.delete(&r).unwrap();
    }

    #[test]
    fn ref_value_roundtrip() {
        let store = InMemoryArtifactStore::new();
        let r = store.put(&json!("payload")).unwrap();
        let as_value = r.to_value();
        let back = ArtifactRef::from_value(&as_value).unwrap();
        assert_eq!(back, r);
        assert!(ArtifactRef::from_value(&json!({"plain": 1})).is_none());
    }

    #[test]
    fn filesystem_store_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            FileSystemArtifactStore::new(dir.path(), ArtifactSerializerKind::Json).unwrap();
        let value = json!({"rows": [1, 2, 3], "label": "x"});
        let r = store.put(&value).unwrap();
        assert_eq!(store.get(&r).unwrap(), value);
    }

    #[test]
    fn filesystem_store_bincode_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            FileSystemArtifactStore::new(dir.path(), ArtifactSerializerKind::Bincode).unwrap();
        let value = json!({"nested": {"values": [true, null, 1.5]}});
        let r = store.put(&value).unwrap();
        assert_eq!(store.get(&r).unwrap(), value);

        // The blob on disk is the binary envelope, not raw JSON.
        let raw = std::fs::read(store.path_for(r.id)).unwrap();
        assert!(serde_json::from_slice::<TaskValue>(&raw).is_err());
    }

    #[test]
    fn filesystem_get_unknown_handle_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            FileSystemArtifactStore::new(dir.path(), ArtifactSerializerKind::Json).unwrap();
        let r = ArtifactRef {
            id: ArtifactId::new(),
        };
        assert!(store.get(&r).is_err());
        store.delete(&r).unwrap();
    }
}
