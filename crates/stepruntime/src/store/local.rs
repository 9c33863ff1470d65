use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use stepcore::store::{validate_component, DataShape};
use stepcore::{
    Artifact, ArtifactKey, ArtifactKind, ArtifactMetadata, ArtifactRequest, ArtifactStore,
    StorageKey, StoreError,
};
use tokio::io::AsyncWriteExt;

/// Sidecar written next to every payload so a load can restore kind, shape
/// and metadata.
#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    kind: ArtifactKind,
    shape: DataShape,
    metadata: ArtifactMetadata,
    created_at: DateTime<Utc>,
}

/// Filesystem-backed artifact store.
///
/// Layout under the root directory:
///
/// ```text
/// artifacts/{workspace}/{workflow}/{execution}/{node}/{filename}
/// meta/{workspace}/{workflow}/{execution}/{node}/{filename}.json
/// workspaces/{workspace}/
/// ```
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn payload_path(&self, key: &ArtifactKey) -> PathBuf {
        key.components()
            .iter()
            .fold(self.root.join("artifacts"), |path, c| path.join(c))
    }

    fn sidecar_path(&self, key: &ArtifactKey) -> PathBuf {
        let [workspace, workflow, execution, node, filename] = key.components();
        self.root
            .join("meta")
            .join(workspace)
            .join(workflow)
            .join(execution)
            .join(node)
            .join(format!("{}.json", filename))
    }
}

/// Creates `path` exclusively, failing if it already exists. A file that
/// could not be fully written is removed again.
async fn write_new(path: &Path, bytes: &[u8], key: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => StoreError::AlreadyExists(key.to_string()),
            _ => StoreError::from(e),
        })?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await
    }
    .await;
    drop(file);

    if let Err(e) = written {
        discard(path).await;
        return Err(e.into());
    }
    Ok(())
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!("Failed to remove partial artifact file {}: {}", path.display(), e);
    }
}

async fn read_existing(path: &Path, key: &str) -> Result<Vec<u8>, StoreError> {
    tokio::fs::read(path).await.map_err(|e| match e.kind() {
        ErrorKind::NotFound => StoreError::NotFound(key.to_string()),
        _ => StoreError::from(e),
    })
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn save(&self, request: ArtifactRequest) -> Result<StorageKey, StoreError> {
        let key = request.key.storage_key();
        let payload = request.data.to_bytes()?;
        let sidecar = Sidecar {
            kind: request.kind,
            shape: request.data.shape(),
            metadata: request.metadata,
            created_at: Utc::now(),
        };

        let sidecar = serde_json::to_vec_pretty(&sidecar)?;

        // The sidecar is what makes a key visible, so it goes last and the
        // payload is rolled back if it cannot be written.
        let payload_path = self.payload_path(&request.key);
        write_new(&payload_path, &payload, &key).await?;
        if let Err(e) = write_new(&self.sidecar_path(&request.key), &sidecar, &key).await {
            discard(&payload_path).await;
            return Err(e);
        }

        tracing::debug!("Wrote artifact {} ({} bytes)", key, payload.len());
        Ok(key)
    }

    async fn load(&self, key: &str) -> Result<Artifact, StoreError> {
        let parsed = ArtifactKey::parse(key)?;
        let sidecar: Sidecar =
            serde_json::from_slice(&read_existing(&self.sidecar_path(&parsed), key).await?)?;
        let bytes = read_existing(&self.payload_path(&parsed), key).await?;

        Ok(Artifact {
            key: key.to_string(),
            kind: sidecar.kind,
            data: sidecar.shape.decode(bytes)?,
            metadata: sidecar.metadata,
            created_at: sidecar.created_at,
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let parsed = ArtifactKey::parse(key)?;
        Ok(tokio::fs::try_exists(self.sidecar_path(&parsed)).await?)
    }

    fn workspace_path(&self, workspace_id: &str) -> Result<PathBuf, StoreError> {
        validate_component(workspace_id)?;
        let path = self.root.join("workspaces").join(workspace_id);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }
}
