// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Error recovery suggestions
//!
//! Provides actionable suggestions for recovering from failed runs.

use super::DeployflowError;

/// A recovery suggestion with concrete steps
#[derive(Debug, Clone)]
pub struct RecoverySuggestion {
    /// Brief description of what to do
    pub action: String,
    /// Detailed steps
    pub steps: Vec<String>,
    /// Commands to run
    pub commands: Vec<String>,
}

impl RecoverySuggestion {
    /// Pick a suggestion for an error, if one applies
    pub fn for_error(error: &DeployflowError) -> Option<Self> {
        match error {
            DeployflowError::UnresolvedPlaceholder { name } => {
                Some(Self::add_parameter_override(name))
            }
            DeployflowError::ParameterMismatch { name } => Some(Self {
                action: format!("Remove the override for '{}'", name),
                steps: vec![
                    "The template does not declare this parameter".into(),
                    "Either drop the override or re-synthesize the template".into(),
                ],
                commands: vec![
                    "# Inspect the template's placeholders:".into(),
                    "deployflow synth <source-dir>".into(),
                ],
            }),
            DeployflowError::NeverExported { name, .. } => Some(Self {
                action: format!("Make sure '{}' is exported", name),
                steps: vec![
                    "The exporting build failed or did not set the variable".into(),
                    "Check the build's exported_variables and its commands".into(),
                ],
                commands: vec![],
            }),
            DeployflowError::CircularDependency { actions } => {
                Some(Self::fix_circular_dependency(actions))
            }
            DeployflowError::PipelineNotFound { .. } => Some(Self::create_pipeline()),
            DeployflowError::Rollback { environment, .. } => Some(Self {
                action: format!("Investigate the failed update of '{}'", environment),
                steps: vec![
                    "The environment is still at its previous version".into(),
                    "Fix the template and run the pipeline again".into(),
                ],
                commands: vec!["deployflow history".into()],
            }),
            _ => None,
        }
    }

    /// Suggest wiring a deferred parameter into the deploy action
    pub fn add_parameter_override(name: &str) -> Self {
        Self {
            action: format!("Provide a value for placeholder '{}'", name),
            steps: vec![
                "Every template placeholder needs a resolved value at deploy time".into(),
                "Map it to a deferred parameter in the deploy action:".into(),
            ],
            commands: vec![
                "parameter_overrides:".into(),
                format!("  {}:", name),
                "    from: <build-action>.<exported-variable>".into(),
            ],
        }
    }

    /// Suggest fixing a circular dependency
    pub fn fix_circular_dependency(actions: &[String]) -> Self {
        Self {
            action: "Remove circular dependency".into(),
            steps: vec![
                format!("Detected cycle: {}", actions.join(" → ")),
                "Review artifact inputs and parameter overrides".into(),
            ],
            commands: vec![
                "# Visualize your pipeline:".into(),
                "deployflow graph --format mermaid".into(),
            ],
        }
    }

    /// Suggest creating a pipeline file
    pub fn create_pipeline() -> Self {
        Self {
            action: "Create a pipeline configuration".into(),
            steps: vec![
                "No .deployflow.yaml found in current directory".into(),
                "Create one with source, build and deploy stages".into(),
            ],
            commands: vec!["deployflow validate .deployflow.yaml".into()],
        }
    }
}

impl std::fmt::Display for RecoverySuggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "→ {}", self.action)?;

        for step in &self.steps {
            writeln!(f, "  {}", step)?;
        }

        if !self.commands.is_empty() {
            writeln!(f)?;
            for cmd in &self.commands {
                writeln!(f, "  {}", cmd)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_suggestion() {
        let err = DeployflowError::UnresolvedPlaceholder {
            name: "ImageTag".into(),
        };
        let suggestion = RecoverySuggestion::for_error(&err).unwrap();
        let text = suggestion.to_string();

        assert!(text.contains("ImageTag"));
        assert!(text.contains("parameter_overrides"));
    }

    #[test]
    fn test_no_suggestion_for_io() {
        let err = DeployflowError::Io {
            message: "boom".into(),
        };
        assert!(RecoverySuggestion::for_error(&err).is_none());
    }
}
