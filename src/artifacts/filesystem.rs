// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Filesystem artifact backend
//!
//! Stores each payload under `<root>/<run>/<slot>/` as a `manifest.json`
//! (file list + metadata) next to a `files/` tree holding the content.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use super::{ArtifactBackend, ArtifactPayload, ArtifactRef};
use crate::errors::{DeployflowError, DeployflowResult};

const MANIFEST: &str = "manifest.json";
const FILES_DIR: &str = "files";

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    files: Vec<String>,
    metadata: BTreeMap<String, String>,
    hash: String,
}

/// Payloads persisted below a state directory
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a backend rooted at `root`
    pub fn new(root: PathBuf) -> DeployflowResult<Self> {
        if !root.exists() {
            std::fs::create_dir_all(&root).map_err(|e| DeployflowError::FileWriteError {
                path: root.clone(),
                error: e.to_string(),
            })?;
        }

        Ok(Self { root })
    }

    /// Backend under `<state_dir>/artifacts`
    pub fn in_state_dir(state_dir: &Path) -> DeployflowResult<Self> {
        Self::new(state_dir.join("artifacts"))
    }

    fn slot_dir(&self, artifact: &ArtifactRef) -> PathBuf {
        self.root.join(&artifact.run_id).join(&artifact.slot)
    }

    /// Reject paths that would escape the slot directory
    fn checked_path(slot_dir: &Path, relative: &str) -> DeployflowResult<PathBuf> {
        let rel = Path::new(relative);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));

        if relative.is_empty() || escapes {
            return Err(DeployflowError::StateError {
                message: format!("Artifact file path '{}' is not a relative path", relative),
            });
        }

        Ok(slot_dir.join(FILES_DIR).join(rel))
    }
}

#[async_trait]
impl ArtifactBackend for FilesystemBackend {
    async fn write(
        &self,
        artifact: &ArtifactRef,
        payload: &ArtifactPayload,
    ) -> DeployflowResult<String> {
        let dir = self.slot_dir(artifact);

        // A stale directory from an interrupted write is replaced
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }

        for (relative, content) in &payload.files {
            let path = Self::checked_path(&dir, relative)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, content)
                .await
                .map_err(|e| DeployflowError::FileWriteError {
                    path: path.clone(),
                    error: e.to_string(),
                })?;
        }

        let manifest = Manifest {
            files: payload.files.keys().cloned().collect(),
            metadata: payload.metadata.clone(),
            hash: payload.content_hash(),
        };
        tokio::fs::create_dir_all(&dir).await?;
        let manifest_path = dir.join(MANIFEST);
        tokio::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
            .await
            .map_err(|e| DeployflowError::FileWriteError {
                path: manifest_path,
                error: e.to_string(),
            })?;

        Ok(dir.display().to_string())
    }

    async fn read(&self, artifact: &ArtifactRef) -> DeployflowResult<ArtifactPayload> {
        let dir = self.slot_dir(artifact);
        let manifest_path = dir.join(MANIFEST);

        if !manifest_path.exists() {
            return Err(DeployflowError::NotProduced {
                slot: artifact.slot.clone(),
                reason: format!("no payload at {}", dir.display()),
            });
        }

        let content = tokio::fs::read_to_string(&manifest_path)
            .await
            .map_err(|e| DeployflowError::FileReadError {
                path: manifest_path.clone(),
                error: e.to_string(),
            })?;
        let manifest: Manifest = serde_json::from_str(&content)?;

        let mut payload = ArtifactPayload {
            files: BTreeMap::new(),
            metadata: manifest.metadata,
        };
        for relative in manifest.files {
            let path = Self::checked_path(&dir, &relative)?;
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| DeployflowError::FileReadError {
                    path: path.clone(),
                    error: e.to_string(),
                })?;
            payload.files.insert(relative, bytes);
        }

        if payload.content_hash() != manifest.hash {
            return Err(DeployflowError::StateError {
                message: format!("Artifact '{}' does not match its recorded hash", artifact),
            });
        }

        Ok(payload)
    }

    async fn remove(&self, artifact: &ArtifactRef) -> DeployflowResult<()> {
        let dir = self.slot_dir(artifact);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    async fn remove_run(&self, run_id: &str) -> DeployflowResult<()> {
        let dir = self.root.join(run_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}
