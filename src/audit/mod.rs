// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Run audit trail
//!
//! Keeps every deployed template version per environment and the resolved
//! parameter set of every run.

mod filesystem;

pub use filesystem::FilesystemAuditStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::errors::DeployflowResult;
use crate::template::Template;

/// Trait for audit storage
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Store a template deployed to `environment`, returning its version
    async fn record_template(&self, environment: &str, template: &Template)
        -> DeployflowResult<String>;

    /// Load a recorded template version
    async fn load_template(&self, environment: &str, version: &str) -> DeployflowResult<Template>;

    /// Store the outcome of a run
    async fn record_run(&self, record: &RunRecord) -> DeployflowResult<()>;

    /// All recorded runs, oldest first
    async fn list_runs(&self) -> DeployflowResult<Vec<RunRecord>>;

    /// Load one run
    async fn load_run(&self, run_id: &str) -> DeployflowResult<Option<RunRecord>>;
}

/// Persisted summary of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub pipeline: String,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    /// `succeeded` or `failed`
    pub status: String,
    #[serde(default)]
    pub failed_stage: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Deferred parameters resolved during the run
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// environment → template version deployed by the run
    #[serde(default)]
    pub template_versions: BTreeMap<String, String>,
}

impl RunRecord {
    /// Run duration, zero if the clock went backwards
    pub fn duration(&self) -> std::time::Duration {
        self.finished_at
            .duration_since(self.started_at)
            .unwrap_or_default()
    }
}
