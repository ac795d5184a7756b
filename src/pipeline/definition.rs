// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Pipeline definition structures
//!
//! Defines the schema for .deployflow.yaml files.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Pipeline definition from .deployflow.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline version (for future compatibility)
    #[serde(default = "default_version")]
    pub version: String,

    /// Pipeline name
    pub name: String,

    /// Pipeline description
    #[serde(default)]
    pub description: Option<String>,

    /// Stages in execution order
    pub stages: Vec<Stage>,

    /// Global environment variables passed to every build
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Where run state is kept
    #[serde(default)]
    pub state: StateConfig,
}

fn default_version() -> String {
    "1".to_string()
}

impl Pipeline {
    /// Load pipeline from a YAML (or `.toml`) file
    pub fn from_file(path: &Path) -> Result<Self, crate::DeployflowError> {
        if !path.exists() {
            return Err(crate::DeployflowError::PipelineNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::DeployflowError::FileReadError {
                path: path.to_path_buf(),
                error: e.to_string(),
            }
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Parse pipeline from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, crate::DeployflowError> {
        serde_yaml::from_str(yaml).map_err(Into::into)
    }

    /// Parse pipeline from TOML string
    pub fn from_toml(content: &str) -> Result<Self, crate::DeployflowError> {
        toml::from_str(content).map_err(Into::into)
    }

    /// Serialize pipeline to YAML
    pub fn to_yaml(&self) -> Result<String, crate::DeployflowError> {
        serde_yaml::to_string(self).map_err(Into::into)
    }

    /// Get all stage names
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Iterate over every action with the index of its stage
    pub fn actions(&self) -> impl Iterator<Item = (usize, &Action)> {
        self.stages
            .iter()
            .enumerate()
            .flat_map(|(idx, stage)| stage.actions.iter().map(move |a| (idx, a)))
    }

    /// Find an action by name
    pub fn find_action(&self, name: &str) -> Option<(usize, &Action)> {
        self.actions().find(|(_, a)| a.name == name)
    }

    /// Deferred parameters declared by build actions, as `(name, exporter)`
    pub fn declared_parameters(&self) -> Vec<(String, String)> {
        self.actions()
            .flat_map(|(_, action)| {
                action
                    .exported_variables()
                    .iter()
                    .map(|var| (parameter_name(&action.name, var), action.name.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// Registry name of a variable exported by an action: `<action>.<variable>`
pub fn parameter_name(action: &str, variable: &str) -> String {
    format!("{}.{}", action, variable)
}

/// A group of actions that run concurrently
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name (must be unique within pipeline)
    pub name: String,

    /// Stage description
    #[serde(default)]
    pub description: Option<String>,

    /// Actions run in parallel within the stage
    pub actions: Vec<Action>,
}

/// A unit of work inside a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Action name (must be unique within pipeline)
    pub name: String,

    /// Action description
    #[serde(default)]
    pub description: Option<String>,

    /// What the action runs
    pub kind: ActionKind,

    /// Consumed artifact slots, in order
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Produced artifact slots, in order
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Environment variables for this action
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Action {
    /// Get the kind name for this action
    pub fn kind_name(&self) -> &str {
        match &self.kind {
            ActionKind::Source { .. } => "source",
            ActionKind::Build { .. } => "build",
            ActionKind::Synthesize { .. } => "synthesize",
            ActionKind::Deploy { .. } => "deploy",
        }
    }

    /// Variables this action exports into the parameter registry
    pub fn exported_variables(&self) -> &[String] {
        match &self.kind {
            ActionKind::Build {
                exported_variables, ..
            } => exported_variables,
            _ => &[],
        }
    }

    /// Deferred parameters this action reads at execution time
    pub fn imported_parameters(&self) -> Vec<&str> {
        match &self.kind {
            ActionKind::Deploy {
                parameter_overrides,
                ..
            } => parameter_overrides
                .values()
                .filter_map(ParameterValue::deferred)
                .collect(),
            _ => vec![],
        }
    }

    /// Artifacts this action reads, including the deploy template's artifact
    pub fn consumed_artifacts(&self) -> Vec<&str> {
        let mut consumed: Vec<&str> = self.inputs.iter().map(String::as_str).collect();
        if let ActionKind::Deploy { template, .. } = &self.kind {
            if !consumed.contains(&template.artifact.as_str()) {
                consumed.push(template.artifact.as_str());
            }
        }
        consumed
    }
}

/// Action specification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ActionKind {
    /// Fetch a source checkout
    Source {
        /// Repository coordinate
        repository: String,

        /// Branch or ref to fetch
        #[serde(default = "default_branch")]
        branch: String,
    },

    /// Build and publish a container image
    Build {
        /// Build commands, run in order in one shell session
        commands: Vec<String>,

        /// Shell to use (bash, sh, etc.)
        #[serde(default = "default_shell")]
        shell: String,

        /// Runtime image selector for the build environment
        #[serde(default)]
        runtime: Option<String>,

        /// Variables exported into the parameter registry
        #[serde(default)]
        exported_variables: Vec<String>,

        /// Image published by this build
        #[serde(default)]
        image: Option<ImageConfig>,

        /// Files collected into the output artifact
        #[serde(default)]
        artifacts: Vec<String>,
    },

    /// Synthesize a deployment template
    Synthesize {
        /// Environment description inside the source artifact
        #[serde(default = "default_environment_file")]
        environment: PathBuf,

        /// Template (stack) name
        stack: String,
    },

    /// Create or update an environment from a template
    Deploy {
        /// Target environment (stack) name
        stack: String,

        /// Template location inside an input artifact
        template: ArtifactPath,

        /// Template parameter values
        #[serde(default)]
        parameter_overrides: BTreeMap<String, ParameterValue>,
    },
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_environment_file() -> PathBuf {
    PathBuf::from("environment.yaml")
}

/// Image published by a build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Repository name
    pub repository: String,

    /// Exported variable holding the tag
    #[serde(default = "default_tag_variable")]
    pub tag_variable: String,

    /// Container name written into imagedefinitions.json
    #[serde(default)]
    pub container_name: Option<String>,
}

fn default_tag_variable() -> String {
    "imageTag".to_string()
}

impl ImageConfig {
    /// Container name, defaulting to the repository name
    pub fn container_name(&self) -> &str {
        self.container_name.as_deref().unwrap_or(&self.repository)
    }
}

/// A file inside an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPath {
    /// Artifact slot
    pub artifact: String,
    /// Path inside the artifact
    pub path: String,
}

impl std::fmt::Display for ArtifactPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.artifact, self.path)
    }
}

/// Value for a template parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// Read from the parameter registry at deploy time
    Deferred {
        /// Registry name (`<action>.<variable>`)
        from: String,
    },

    /// Fixed value
    Literal(String),
}

impl ParameterValue {
    /// Registry name if this value is deferred
    pub fn deferred(&self) -> Option<&str> {
        match self {
            Self::Deferred { from } => Some(from),
            Self::Literal(_) => None,
        }
    }
}

/// Run state configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// State directory
    #[serde(default = "default_state_dir")]
    pub directory: PathBuf,

    /// Image registry host used for repository URIs
    #[serde(default = "default_registry")]
    pub registry: String,

    /// Artifact storage
    #[serde(default)]
    pub artifacts: ArtifactConfig,

    /// Limits enforced by the template engine
    #[serde(default)]
    pub quota: QuotaConfig,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            directory: default_state_dir(),
            registry: default_registry(),
            artifacts: ArtifactConfig::default(),
            quota: QuotaConfig::default(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".deployflow")
}

fn default_registry() -> String {
    "registry.local".to_string()
}

/// Artifact storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// Write payloads to the state directory
    #[serde(default = "default_true")]
    pub persist: bool,

    /// Keep payloads after all consumers ran
    #[serde(default)]
    pub retain: bool,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            persist: true,
            retain: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Template engine limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Maximum resources per environment
    #[serde(default = "default_max_resources")]
    pub max_resources: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_resources: default_max_resources(),
        }
    }
}

fn default_max_resources() -> usize {
    200
}
