//! Artifact persistence contract consumed by units and the coordinator.
//!
//! Artifacts are addressed by a storage key derived from five path
//! components, `{workspace_id}/{workflow_id}/{execution_id}/{node_id}/{filename}`.
//! Because the execution and node ids are part of the key, concurrent writes
//! from different nodes of one run never collide.

use crate::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

pub type StorageKey = String;

/// Free-form metadata stored next to an artifact.
pub type ArtifactMetadata = HashMap<String, serde_json::Value>;

/// The five components an artifact key is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub workspace_id: String,
    pub workflow_id: String,
    pub execution_id: String,
    pub node_id: String,
    pub filename: String,
}

impl ArtifactKey {
    pub fn new(
        workspace_id: impl Into<String>,
        workflow_id: impl Into<String>,
        execution_id: impl Into<String>,
        node_id: impl Into<String>,
        filename: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let key = Self {
            workspace_id: workspace_id.into(),
            workflow_id: workflow_id.into(),
            execution_id: execution_id.into(),
            node_id: node_id.into(),
            filename: filename.into(),
        };
        for component in key.components() {
            validate_component(component)?;
        }
        Ok(key)
    }

    /// Parses a storage key produced by [`ArtifactKey::storage_key`].
    pub fn parse(key: &str) -> Result<Self, StoreError> {
        let parts: Vec<&str> = key.split('/').collect();
        let [workspace_id, workflow_id, execution_id, node_id, filename] = parts.as_slice() else {
            return Err(StoreError::InvalidKey {
                component: key.to_string(),
                reason: "expected five '/'-separated components".to_string(),
            });
        };
        Self::new(*workspace_id, *workflow_id, *execution_id, *node_id, *filename)
    }

    pub fn components(&self) -> [&str; 5] {
        [
            &self.workspace_id,
            &self.workflow_id,
            &self.execution_id,
            &self.node_id,
            &self.filename,
        ]
    }

    pub fn storage_key(&self) -> StorageKey {
        self.to_string()
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.components().join("/"))
    }
}

/// Rejects components that would escape or split the key hierarchy.
pub fn validate_component(component: &str) -> Result<(), StoreError> {
    let reason = if component.is_empty() {
        "must not be empty"
    } else if component.contains('/') || component.contains('\\') {
        "must not contain path separators"
    } else if component == "." || component == ".." {
        "must not be a relative path segment"
    } else {
        return Ok(());
    };
    Err(StoreError::InvalidKey {
        component: component.to_string(),
        reason: reason.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Raw,
    Table,
    Statistics,
    Plot,
    Document,
}

/// Artifact payload in its logical shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "content", rename_all = "snake_case")]
pub enum ArtifactData {
    Bytes(Vec<u8>),
    Text(String),
    Structured(serde_json::Value),
}

impl ArtifactData {
    /// Serialized byte form, as written to byte-oriented backends.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        match self {
            ArtifactData::Bytes(b) => Ok(b.clone()),
            ArtifactData::Text(t) => Ok(t.as_bytes().to_vec()),
            ArtifactData::Structured(v) => Ok(serde_json::to_vec(v)?),
        }
    }

    pub fn shape(&self) -> DataShape {
        match self {
            ArtifactData::Bytes(_) => DataShape::Bytes,
            ArtifactData::Text(_) => DataShape::Text,
            ArtifactData::Structured(_) => DataShape::Structured,
        }
    }

    pub fn as_structured(&self) -> Option<&serde_json::Value> {
        match self {
            ArtifactData::Structured(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ArtifactData::Text(t) => Some(t),
            _ => None,
        }
    }
}

/// Discriminant of [`ArtifactData`], recorded by byte-oriented backends so
/// a load can restore the original shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataShape {
    Bytes,
    Text,
    Structured,
}

impl DataShape {
    pub fn decode(&self, bytes: Vec<u8>) -> Result<ArtifactData, StoreError> {
        match self {
            DataShape::Bytes => Ok(ArtifactData::Bytes(bytes)),
            DataShape::Text => String::from_utf8(bytes)
                .map(ArtifactData::Text)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            DataShape::Structured => Ok(ArtifactData::Structured(serde_json::from_slice(&bytes)?)),
        }
    }
}

/// Everything a save needs.
#[derive(Debug, Clone)]
pub struct ArtifactRequest {
    pub key: ArtifactKey,
    pub kind: ArtifactKind,
    pub data: ArtifactData,
    pub metadata: ArtifactMetadata,
}

impl ArtifactRequest {
    pub fn new(key: ArtifactKey, kind: ArtifactKind, data: ArtifactData) -> Self {
        Self {
            key,
            kind,
            data,
            metadata: ArtifactMetadata::new(),
        }
    }

    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A previously saved artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub key: StorageKey,
    pub kind: ArtifactKind,
    pub data: ArtifactData,
    pub metadata: ArtifactMetadata,
    pub created_at: DateTime<Utc>,
}

/// Persists and retrieves named artifacts.
///
/// Implementations must accept concurrent saves to distinct keys without
/// external locking. Keys are write-once: saving over an existing key fails
/// with [`StoreError::AlreadyExists`].
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist `request.data` under the key derived from `request.key`.
    async fn save(&self, request: ArtifactRequest) -> Result<StorageKey, StoreError>;

    /// Retrieve a previously saved artifact, or [`StoreError::NotFound`].
    async fn load(&self, key: &str) -> Result<Artifact, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Workspace-scoped directory for units that need direct file access.
    fn workspace_path(&self, workspace_id: &str) -> Result<PathBuf, StoreError>;
}
