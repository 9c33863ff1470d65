use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use stepcore::store::validate_component;
use stepcore::{Artifact, ArtifactRequest, ArtifactStore, StorageKey, StoreError};
use tokio::sync::RwLock;

/// Process-local artifact store, for tests and one-off runs.
///
/// Workspace paths resolve under a scratch directory; nothing else touches
/// the filesystem.
pub struct MemoryArtifactStore {
    artifacts: RwLock<HashMap<StorageKey, Artifact>>,
    scratch_root: PathBuf,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::with_scratch_root(std::env::temp_dir().join("stepflow"))
    }

    pub fn with_scratch_root(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            artifacts: RwLock::new(HashMap::new()),
            scratch_root: scratch_root.into(),
        }
    }

    pub async fn len(&self) -> usize {
        self.artifacts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.artifacts.read().await.is_empty()
    }

    /// Keys of every stored artifact, sorted
    pub async fn keys(&self) -> Vec<StorageKey> {
        let mut keys: Vec<StorageKey> = self.artifacts.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for MemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn save(&self, request: ArtifactRequest) -> Result<StorageKey, StoreError> {
        let key = request.key.storage_key();
        let mut artifacts = self.artifacts.write().await;
        if artifacts.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }

        tracing::debug!("Saving artifact {} ({:?})", key, request.data.shape());
        artifacts.insert(
            key.clone(),
            Artifact {
                key: key.clone(),
                kind: request.kind,
                data: request.data,
                metadata: request.metadata,
                created_at: Utc::now(),
            },
        );
        Ok(key)
    }

    async fn load(&self, key: &str) -> Result<Artifact, StoreError> {
        self.artifacts
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.artifacts.read().await.contains_key(key))
    }

    fn workspace_path(&self, workspace_id: &str) -> Result<PathBuf, StoreError> {
        validate_component(workspace_id)?;
        Ok(self.scratch_root.join(workspace_id))
    }
}
