// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Local source provider
//!
//! Treats `<base_dir>/<repository>` as the checkout of a repository.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use super::{SourceProvider, SOURCE_VERSION};
use crate::artifacts::{short_hash, ArtifactPayload, ContentHasher};
use crate::errors::{DeployflowError, DeployflowResult};

/// Directories never copied into a source artifact
const IGNORED_DIRS: &[&str] = &[".git", ".deployflow"];

/// Sources read from local directories
pub struct LocalSourceProvider {
    base_dir: PathBuf,
}

impl LocalSourceProvider {
    /// Create a provider resolving repositories below `base_dir`
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Directory holding a repository's checkout
    pub fn checkout_dir(&self, repository: &str) -> PathBuf {
        self.base_dir.join(repository)
    }

    /// Read every file below `dir`, keyed by `/`-separated relative path
    pub fn collect_files(dir: &Path) -> DeployflowResult<BTreeMap<String, Vec<u8>>> {
        let pattern = dir.join("**").join("*").to_string_lossy().to_string();
        let mut files = BTreeMap::new();

        for entry in glob::glob(&pattern)?.filter_map(Result::ok) {
            if !entry.is_file() {
                continue;
            }
            let Ok(relative) = entry.strip_prefix(dir) else {
                continue;
            };
            if Self::is_ignored(relative) {
                continue;
            }

            let content = std::fs::read(&entry).map_err(|e| DeployflowError::FileReadError {
                path: entry.clone(),
                error: e.to_string(),
            })?;
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.insert(key, content);
        }

        Ok(files)
    }

    fn is_ignored(relative: &Path) -> bool {
        relative.components().any(|c| match c {
            Component::Normal(name) => IGNORED_DIRS.iter().any(|d| name == *d),
            _ => false,
        })
    }
}

#[async_trait]
impl SourceProvider for LocalSourceProvider {
    async fn fetch(&self, repository: &str, branch: &str) -> DeployflowResult<ArtifactPayload> {
        let dir = self.checkout_dir(repository);
        if !dir.is_dir() {
            return Err(DeployflowError::SourceUnavailable {
                repository: repository.to_string(),
                branch: branch.to_string(),
                reason: format!("{} is not a directory", dir.display()),
            });
        }

        let files = Self::collect_files(&dir).map_err(|e| DeployflowError::SourceUnavailable {
            repository: repository.to_string(),
            branch: branch.to_string(),
            reason: e.to_string(),
        })?;

        let mut hasher = ContentHasher::new();
        hasher.hash_files(&files);
        let hash = hasher.finalize();
        let version = short_hash(&hash).to_string();

        debug!(repository, branch, %version, files = files.len(), "Source fetched");

        Ok(ArtifactPayload {
            files,
            metadata: BTreeMap::new(),
        }
        .with_metadata("repository", repository)
        .with_metadata("branch", branch)
        .with_metadata(SOURCE_VERSION, version))
    }
}
