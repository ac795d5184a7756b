// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! External collaborators
//!
//! The orchestrator assumes four primitives: a source provider, a build
//! runner, an image repository and a template engine. Each is a trait so a
//! run can be wired to real services or to the local implementations
//! shipped here.

mod build;
mod engine;
mod images;
mod source;

pub use build::ShellBuildRunner;
pub use engine::LocalTemplateEngine;
pub use images::LocalImageRepository;
pub use source::LocalSourceProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime};

use crate::artifacts::ArtifactPayload;
use crate::errors::DeployflowResult;
use crate::template::DeploymentRequest;

/// Metadata key holding the fetched source version
pub const SOURCE_VERSION: &str = "source_version";

/// Fetches source checkouts
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Fetch `branch` of `repository` as an artifact payload.
    /// The payload's metadata carries `source_version`.
    async fn fetch(&self, repository: &str, branch: &str) -> DeployflowResult<ArtifactPayload>;
}

/// What a build needs to run
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub run_id: String,
    pub action: String,
    pub source: ArtifactPayload,
    pub commands: Vec<String>,
    pub shell: String,
    pub runtime: Option<String>,
    pub env: HashMap<String, String>,
    pub exported_variables: Vec<String>,
    /// Globs of files to collect after the build
    pub artifacts: Vec<String>,
    /// Repository the build pushes to, exposed as `REPOSITORY_URI`
    pub repository_uri: Option<String>,
}

impl BuildRequest {
    /// Version of the source being built
    pub fn source_version(&self) -> &str {
        self.source.metadata(SOURCE_VERSION).unwrap_or("unknown")
    }
}

/// What a successful build produced
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    /// Exported variables that the build set
    pub exports: BTreeMap<String, String>,
    /// Collected artifact files
    pub files: BTreeMap<String, Vec<u8>>,
    pub stdout: String,
    pub duration: Duration,
}

/// Runs build commands
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn build(&self, request: &BuildRequest) -> DeployflowResult<BuildOutput>;
}

/// A pushed image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
    pub uri: String,
    pub digest: String,
}

/// Container image repository
#[async_trait]
pub trait ImageRepository: Send + Sync {
    /// Registry host, e.g. `registry.local`
    fn registry(&self) -> &str;

    /// URI of a repository, e.g. `registry.local/user-repository`
    fn repository_uri(&self, repository: &str) -> String {
        format!("{}/{}", self.registry(), repository)
    }

    /// URI of a tagged image
    fn uri_for_tag(&self, repository: &str, tag: &str) -> String {
        format!("{}:{}", self.repository_uri(repository), tag)
    }

    /// Publish an image under `tag`
    async fn push(&self, repository: &str, tag: &str, digest: &str) -> DeployflowResult<ImageRef>;

    /// Tags present in a repository, sorted
    async fn tags(&self, repository: &str) -> DeployflowResult<Vec<String>>;
}

/// A resource as the engine created it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployedResource {
    pub resource_type: String,
    pub physical_id: String,
    pub properties: serde_json::Value,
}

/// Stable state of an environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentState {
    pub environment: String,
    /// Desired-state fingerprint of the request that produced this state
    pub fingerprint: String,
    pub template_version: String,
    pub parameters: BTreeMap<String, String>,
    pub resources: BTreeMap<String, DeployedResource>,
    pub outputs: BTreeMap<String, String>,
    /// Incremented on every applied change
    pub version: u64,
    pub updated_at: SystemTime,
}

/// Executes fully-resolved deployment requests
#[async_trait]
pub trait TemplateEngine: Send + Sync {
    /// Current stable state of an environment, if it exists
    async fn current(&self, environment: &str) -> DeployflowResult<Option<EnvironmentState>>;

    /// Create or update an environment. On failure the environment keeps
    /// its previous state.
    async fn apply(&self, request: &DeploymentRequest) -> DeployflowResult<EnvironmentState>;
}
