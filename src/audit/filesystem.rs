// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Filesystem-based audit store
//!
//! Layout below the audit directory:
//! - `templates/<environment>/<version>.json`
//! - `runs/<run_id>.json`

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::{AuditStore, RunRecord};
use crate::errors::{DeployflowError, DeployflowResult};
use crate::template::Template;

/// Audit records stored as JSON files
pub struct FilesystemAuditStore {
    audit_dir: PathBuf,
}

impl FilesystemAuditStore {
    /// Create an audit store in `audit_dir`
    pub fn new(audit_dir: PathBuf) -> DeployflowResult<Self> {
        if !audit_dir.exists() {
            std::fs::create_dir_all(&audit_dir).map_err(|e| DeployflowError::StateError {
                message: format!("Failed to create audit directory: {}", e),
            })?;
        }

        Ok(Self { audit_dir })
    }

    /// Store under `<state_dir>/audit`
    pub fn in_state_dir(state_dir: &Path) -> DeployflowResult<Self> {
        Self::new(state_dir.join("audit"))
    }

    fn template_path(&self, environment: &str, version: &str) -> PathBuf {
        self.audit_dir
            .join("templates")
            .join(environment)
            .join(format!("{}.json", version))
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.audit_dir.join("runs").join(format!("{}.json", run_id))
    }

    async fn write(path: &Path, content: String) -> DeployflowResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                DeployflowError::StateError {
                    message: format!("Failed to create audit directory: {}", e),
                }
            })?;
        }

        tokio::fs::write(path, content)
            .await
            .map_err(|e| DeployflowError::FileWriteError {
                path: path.to_path_buf(),
                error: e.to_string(),
            })
    }
}

#[async_trait]
impl AuditStore for FilesystemAuditStore {
    async fn record_template(
        &self,
        environment: &str,
        template: &Template,
    ) -> DeployflowResult<String> {
        let version = template.fingerprint();
        let path = self.template_path(environment, &version);

        // Content-addressed: an existing file already holds this version
        if !path.exists() {
            Self::write(&path, template.to_json()).await?;
        }

        Ok(version)
    }

    async fn load_template(&self, environment: &str, version: &str) -> DeployflowResult<Template> {
        let path = self.template_path(environment, version);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| DeployflowError::FileReadError {
                path: path.clone(),
                error: e.to_string(),
            })?;
        Template::from_json(&content)
    }

    async fn record_run(&self, record: &RunRecord) -> DeployflowResult<()> {
        let json = serde_json::to_string_pretty(record)?;
        Self::write(&self.run_path(&record.run_id), json).await
    }

    async fn list_runs(&self) -> DeployflowResult<Vec<RunRecord>> {
        let runs_dir = self.audit_dir.join("runs");
        let mut runs = Vec::new();

        if !runs_dir.exists() {
            return Ok(runs);
        }

        let mut entries = tokio::fs::read_dir(&runs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            // Skip unreadable records rather than failing the listing
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                if let Ok(record) = serde_json::from_str::<RunRecord>(&content) {
                    runs.push(record);
                }
            }
        }

        runs.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(runs)
    }

    async fn load_run(&self, run_id: &str) -> DeployflowResult<Option<RunRecord>> {
        let path = self.run_path(run_id);
        if !path.exists() {
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| DeployflowError::FileReadError {
                path: path.clone(),
                error: e.to_string(),
            })?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}
