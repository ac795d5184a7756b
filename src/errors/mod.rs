// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Error types
//!
//! Every failure a pipeline run can surface is a variant of
//! [`DeployflowError`]. Variants carry a stable diagnostic code so reports
//! and tests can match on the failure kind without parsing messages.

mod recovery;

pub use recovery::RecoverySuggestion;

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for deployflow operations
pub type DeployflowResult<T> = Result<T, DeployflowError>;

/// Main error type for deployflow
#[derive(Error, Debug, Diagnostic)]
pub enum DeployflowError {
    // ─────────────────────────────────────────────────────────────────────────
    // Collaborator Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Source '{repository}' (branch '{branch}') is unavailable: {reason}")]
    #[diagnostic(
        code(deployflow::source_unavailable),
        help("Check that the repository exists and the branch can be fetched")
    )]
    SourceUnavailable {
        repository: String,
        branch: String,
        reason: String,
    },

    #[error("Build '{action}' failed: {reason}")]
    #[diagnostic(code(deployflow::build_failed))]
    BuildFailed {
        action: String,
        reason: String,
        #[help]
        help: Option<String>,
    },

    #[error("Tool '{tool}' not found")]
    #[diagnostic(code(deployflow::tool_not_found), help("{suggestion}"))]
    ToolNotFound { tool: String, suggestion: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Deferred Parameter Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Parameter '{name}' was already exported in this run")]
    #[diagnostic(
        code(deployflow::duplicate_export),
        help("A deferred parameter has exactly one writer per run")
    )]
    DuplicateExport { name: String },

    #[error("Parameter '{name}' was never exported: {reason}")]
    #[diagnostic(code(deployflow::never_exported))]
    NeverExported { name: String, reason: String },

    #[error("Parameter '{name}' is not declared")]
    #[diagnostic(
        code(deployflow::undeclared_parameter),
        help("Deferred parameters are declared by a build action's exported_variables")
    )]
    UndeclaredParameter { name: String },

    #[error("Action '{action}' cannot export '{name}': it is owned by '{owner}'")]
    #[diagnostic(code(deployflow::export_not_owned))]
    ExportNotOwned {
        name: String,
        action: String,
        owner: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Artifact Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Artifact '{slot}' was not produced: {reason}")]
    #[diagnostic(code(deployflow::not_produced))]
    NotProduced { slot: String, reason: String },

    #[error("Artifact '{slot}' has already been written")]
    #[diagnostic(
        code(deployflow::artifact_already_written),
        help("Every artifact has exactly one producer and is written once per run")
    )]
    ArtifactAlreadyWritten { slot: String },

    #[error("Artifact '{slot}' has no file '{path}'")]
    #[diagnostic(code(deployflow::artifact_file_missing))]
    ArtifactFileMissing { slot: String, path: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Template / Deployment Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Template placeholder '{name}' has no resolved value")]
    #[diagnostic(
        code(deployflow::unresolved_placeholder),
        help("Add a parameter override for '{name}' to the deploy action")
    )]
    UnresolvedPlaceholder { name: String },

    #[error("Value supplied for '{name}', which the template does not declare")]
    #[diagnostic(code(deployflow::parameter_mismatch))]
    ParameterMismatch { name: String },

    #[error("Invalid environment name '{name}'")]
    #[diagnostic(
        code(deployflow::invalid_environment_name),
        help("Environment names start with a letter and contain only letters, digits and '-'")
    )]
    InvalidEnvironmentName { name: String },

    #[error("Invalid template: {reason}")]
    #[diagnostic(code(deployflow::invalid_template))]
    InvalidTemplate { reason: String },

    #[error("Resource '{resource}' conflicts with environment '{owner}'")]
    #[diagnostic(
        code(deployflow::resource_conflict),
        help("Physical resource names must be unique across environments")
    )]
    ResourceConflict { resource: String, owner: String },

    #[error("Quota exceeded for environment '{environment}': {reason}")]
    #[diagnostic(code(deployflow::quota_exceeded))]
    QuotaExceeded { environment: String, reason: String },

    #[error("Deployment of '{environment}' rolled back: {reason}")]
    #[diagnostic(
        code(deployflow::rollback),
        help("The environment was left at its previous stable state")
    )]
    Rollback { environment: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Pipeline Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Pipeline file not found: {path}")]
    #[diagnostic(
        code(deployflow::pipeline_not_found),
        help("Create a .deployflow.yaml or pass --pipeline")
    )]
    PipelineNotFound { path: PathBuf },

    #[error("Invalid pipeline configuration: {reason}")]
    #[diagnostic(code(deployflow::invalid_pipeline))]
    InvalidPipeline {
        reason: String,
        #[help]
        help: Option<String>,
    },

    #[error("Action '{action}' consumes unknown artifact '{artifact}'")]
    #[diagnostic(
        code(deployflow::unknown_artifact),
        help("Check that an action lists '{artifact}' in its outputs")
    )]
    UnknownArtifact { action: String, artifact: String },

    #[error("Artifact '{artifact}' is produced by both '{first}' and '{second}'")]
    #[diagnostic(code(deployflow::duplicate_producer))]
    DuplicateProducer {
        artifact: String,
        first: String,
        second: String,
    },

    #[error("Circular dependency detected")]
    #[diagnostic(
        code(deployflow::circular_dependency),
        help("Review artifact inputs and parameter references to remove the cycle")
    )]
    CircularDependency { actions: Vec<String> },

    #[error("Action '{action}' not found in pipeline")]
    #[diagnostic(code(deployflow::action_not_found))]
    ActionNotFound { action: String },

    #[error("Pipeline run was cancelled")]
    #[diagnostic(code(deployflow::cancelled))]
    Cancelled,

    // ─────────────────────────────────────────────────────────────────────────
    // IO/System Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Failed to read file '{path}': {error}")]
    #[diagnostic(code(deployflow::file_read_error))]
    FileReadError { path: PathBuf, error: String },

    #[error("Failed to write file '{path}': {error}")]
    #[diagnostic(code(deployflow::file_write_error))]
    FileWriteError { path: PathBuf, error: String },

    #[error("State error: {message}")]
    #[diagnostic(code(deployflow::state_error))]
    StateError { message: String },

    #[error("IO error: {message}")]
    #[diagnostic(code(deployflow::io_error))]
    Io { message: String },

    #[error("YAML parsing error: {message}")]
    #[diagnostic(code(deployflow::yaml_error))]
    Yaml { message: String },

    #[error("JSON parsing error: {message}")]
    #[diagnostic(code(deployflow::json_error))]
    Json { message: String },

    #[error("TOML parsing error: {message}")]
    #[diagnostic(code(deployflow::toml_error))]
    Toml { message: String },

    #[error("Glob pattern error: {message}")]
    #[diagnostic(code(deployflow::glob_error))]
    GlobPattern { message: String },
}

impl From<std::io::Error> for DeployflowError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_yaml::Error> for DeployflowError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml { message: e.to_string() }
    }
}

impl From<serde_json::Error> for DeployflowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json { message: e.to_string() }
    }
}

impl From<toml::de::Error> for DeployflowError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml { message: e.to_string() }
    }
}

impl From<glob::PatternError> for DeployflowError {
    fn from(e: glob::PatternError) -> Self {
        Self::GlobPattern { message: e.to_string() }
    }
}

impl DeployflowError {
    /// Create a tool not found error with installation suggestion
    pub fn tool_not_found(tool: &str) -> Self {
        Self::ToolNotFound {
            tool: tool.to_string(),
            suggestion: format!("Install {} and ensure it's in your PATH", tool),
        }
    }

    /// Create a build failure, deriving a hint from the build's stderr
    pub fn build_failed(action: &str, stderr: &str, exit_code: i32) -> Self {
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        let reason = if tail.is_empty() {
            format!("exited with code {}", exit_code)
        } else {
            format!("exited with code {}: {}", exit_code, tail.join("\n"))
        };

        Self::BuildFailed {
            action: action.to_string(),
            reason,
            help: Self::parse_build_error(stderr),
        }
    }

    fn parse_build_error(stderr: &str) -> Option<String> {
        if stderr.contains("command not found") {
            Some("A build command is missing from the runtime image.".into())
        } else if stderr.contains("permission denied") || stderr.contains("Permission denied") {
            Some("The build lacks permissions; privileged builds may be required for images.".into())
        } else if stderr.contains("denied: ") || stderr.contains("unauthorized") {
            Some("Pushing the image was rejected. Check repository credentials.".into())
        } else {
            None
        }
    }

    /// The stable diagnostic code of this error, e.g. `deployflow::build_failed`
    pub fn code_str(&self) -> String {
        self.code().map(|c| c.to_string()).unwrap_or_default()
    }

    /// Whether this error means the target environment was left untouched
    /// or restored to its previous state.
    pub fn preserves_environment(&self) -> bool {
        matches!(
            self,
            Self::UnresolvedPlaceholder { .. }
                | Self::ParameterMismatch { .. }
                | Self::InvalidEnvironmentName { .. }
                | Self::ResourceConflict { .. }
                | Self::QuotaExceeded { .. }
                | Self::Rollback { .. }
        )
    }
}
