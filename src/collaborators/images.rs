// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Local image repository
//!
//! Records pushed tags per repository, optionally persisted as a JSON index.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;

use super::{ImageRef, ImageRepository};
use crate::errors::{DeployflowError, DeployflowResult};

/// repository → tag → digest
type TagIndex = BTreeMap<String, BTreeMap<String, String>>;

/// Image repository backed by an in-memory (and optionally on-disk) index
pub struct LocalImageRepository {
    host: String,
    index_path: Option<PathBuf>,
    index: Mutex<TagIndex>,
}

impl LocalImageRepository {
    /// Repository persisted at `index_path`, loading any existing index
    pub fn new(host: impl Into<String>, index_path: PathBuf) -> DeployflowResult<Self> {
        let index = if index_path.exists() {
            let content = std::fs::read_to_string(&index_path).map_err(|e| {
                DeployflowError::FileReadError {
                    path: index_path.clone(),
                    error: e.to_string(),
                }
            })?;
            serde_json::from_str(&content)?
        } else {
            TagIndex::new()
        };

        Ok(Self {
            host: host.into(),
            index_path: Some(index_path),
            index: Mutex::new(index),
        })
    }

    /// Repository index under `<state_dir>/images.json`
    pub fn in_state_dir(host: impl Into<String>, state_dir: &Path) -> DeployflowResult<Self> {
        Self::new(host, state_dir.join("images.json"))
    }

    /// Repository that is never written to disk
    pub fn in_memory(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            index_path: None,
            index: Mutex::new(TagIndex::new()),
        }
    }

    /// Digest stored for a tag
    pub async fn digest(&self, repository: &str, tag: &str) -> Option<String> {
        let index = self.index.lock().await;
        index.get(repository).and_then(|tags| tags.get(tag)).cloned()
    }
}

#[async_trait]
impl ImageRepository for LocalImageRepository {
    fn registry(&self) -> &str {
        &self.host
    }

    async fn push(&self, repository: &str, tag: &str, digest: &str) -> DeployflowResult<ImageRef> {
        if tag.is_empty() {
            return Err(DeployflowError::BuildFailed {
                action: repository.to_string(),
                reason: "cannot push an image with an empty tag".into(),
                help: None,
            });
        }

        let mut index = self.index.lock().await;
        index
            .entry(repository.to_string())
            .or_default()
            .insert(tag.to_string(), digest.to_string());

        if let Some(path) = &self.index_path {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, serde_json::to_string_pretty(&*index)?)
                .await
                .map_err(|e| DeployflowError::FileWriteError {
                    path: tmp.clone(),
                    error: e.to_string(),
                })?;
            tokio::fs::rename(&tmp, path).await?;
        }

        let uri = self.uri_for_tag(repository, tag);
        info!(%uri, "Image pushed");

        Ok(ImageRef {
            repository: repository.to_string(),
            tag: tag.to_string(),
            uri,
            digest: digest.to_string(),
        })
    }

    async fn tags(&self, repository: &str) -> DeployflowResult<Vec<String>> {
        let index = self.index.lock().await;
        Ok(index
            .get(repository)
            .map(|tags| tags.keys().cloned().collect())
            .unwrap_or_default())
    }
}
