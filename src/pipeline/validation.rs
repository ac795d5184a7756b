// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Pipeline validation
//!
//! Validates pipeline configuration before execution.

use regex::Regex;
use std::collections::HashSet;
use std::path::Path;

use crate::deploy::is_valid_environment_name;
use crate::errors::DeployflowError;
use crate::pipeline::{parameter_name, Action, ActionKind, DagBuilder, Pipeline};

const VARIABLE_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

/// Pipeline validator
pub struct PipelineValidator;

impl PipelineValidator {
    /// Validate a pipeline configuration
    pub fn validate(pipeline: &Pipeline) -> Result<ValidationResult, DeployflowError> {
        let mut result = ValidationResult::new();

        if pipeline.stages.is_empty() {
            result.add_error("Pipeline has no stages defined");
        }

        let mut stage_names = HashSet::new();
        for stage in &pipeline.stages {
            if !stage_names.insert(&stage.name) {
                result.add_error(&format!("Duplicate stage name: '{}'", stage.name));
            }
            if stage.actions.is_empty() {
                result.add_error(&format!("Stage '{}' has no actions", stage.name));
            }
        }

        let mut action_names = HashSet::new();
        for (_, action) in pipeline.actions() {
            if !action_names.insert(&action.name) {
                result.add_error(&format!("Duplicate action name: '{}'", action.name));
            }
        }

        // Validate DAG structure (cycles, unknown artifacts, stage ordering)
        match DagBuilder::build(pipeline) {
            Ok(_) => {}
            Err(DeployflowError::CircularDependency { actions }) => {
                result.add_error(&format!("Circular dependency: {}", actions.join(" → ")));
            }
            Err(DeployflowError::UnknownArtifact { action, artifact }) => {
                result.add_error(&format!(
                    "Action '{}' consumes unknown artifact '{}'",
                    action, artifact
                ));
            }
            Err(DeployflowError::UndeclaredParameter { name }) => {
                result.add_error(&format!(
                    "Parameter '{}' is not exported by any build action",
                    name
                ));
            }
            Err(e) => {
                result.add_error(&format!("DAG validation error: {}", e));
            }
        }

        let variable_re = Regex::new(VARIABLE_PATTERN).map_err(|e| {
            DeployflowError::InvalidPipeline {
                reason: format!("Invalid variable pattern: {}", e),
                help: None,
            }
        })?;

        for (_, action) in pipeline.actions() {
            Self::validate_action(action, pipeline, &variable_re, &mut result);
        }

        Ok(result)
    }

    /// Validate a single action
    fn validate_action(
        action: &Action,
        pipeline: &Pipeline,
        variable_re: &Regex,
        result: &mut ValidationResult,
    ) {
        match &action.kind {
            ActionKind::Source { repository, .. } => {
                if repository.is_empty() {
                    result.add_error(&format!("Action '{}': repository is empty", action.name));
                }
                if !action.inputs.is_empty() {
                    result.add_error(&format!(
                        "Action '{}': source actions take no inputs",
                        action.name
                    ));
                }
                if action.outputs.is_empty() {
                    result.add_warning(&format!(
                        "Action '{}': source has no output artifact",
                        action.name
                    ));
                }
            }
            ActionKind::Build {
                commands,
                exported_variables,
                image,
                ..
            } => {
                if action.inputs.len() != 1 {
                    result.add_error(&format!(
                        "Action '{}': builds take exactly one input artifact, found {}",
                        action.name,
                        action.inputs.len()
                    ));
                }
                if commands.is_empty() {
                    result.add_warning(&format!(
                        "Action '{}': build has no commands",
                        action.name
                    ));
                }

                for var in exported_variables {
                    if !variable_re.is_match(var) {
                        result.add_error(&format!(
                            "Action '{}': '{}' is not a valid variable name",
                            action.name, var
                        ));
                    }

                    let name = parameter_name(&action.name, var);
                    let imported = pipeline
                        .actions()
                        .any(|(_, a)| a.imported_parameters().contains(&name.as_str()));
                    if !imported {
                        result.add_warning(&format!(
                            "Action '{}': exported variable '{}' is never used",
                            action.name, var
                        ));
                    }
                }

                if let Some(image) = image {
                    if image.repository.is_empty() {
                        result.add_error(&format!(
                            "Action '{}': image repository is empty",
                            action.name
                        ));
                    }
                }
            }
            ActionKind::Synthesize { stack, .. } => {
                if stack.is_empty() {
                    result.add_error(&format!("Action '{}': stack is empty", action.name));
                } else if !is_valid_environment_name(stack) {
                    result.add_error(&format!(
                        "Action '{}': stack '{}' must start with a letter and contain only letters, digits and '-'",
                        action.name, stack
                    ));
                }
                if action.inputs.len() != 1 {
                    result.add_error(&format!(
                        "Action '{}': synthesis takes exactly one input artifact, found {}",
                        action.name,
                        action.inputs.len()
                    ));
                }
                if action.outputs.is_empty() {
                    result.add_error(&format!(
                        "Action '{}': synthesis needs an output artifact for the template",
                        action.name
                    ));
                }
            }
            ActionKind::Deploy {
                stack,
                template,
                parameter_overrides,
            } => {
                if stack.is_empty() {
                    result.add_error(&format!("Action '{}': stack is empty", action.name));
                } else if !is_valid_environment_name(stack) {
                    result.add_error(&format!(
                        "Action '{}': stack '{}' must start with a letter and contain only letters, digits and '-'",
                        action.name, stack
                    ));
                }
                if !action.inputs.contains(&template.artifact) {
                    result.add_error(&format!(
                        "Action '{}': template artifact '{}' must be listed in inputs",
                        action.name, template.artifact
                    ));
                }
                for (placeholder, value) in parameter_overrides {
                    if placeholder.is_empty() {
                        result.add_error(&format!(
                            "Action '{}': parameter override with empty name",
                            action.name
                        ));
                    }
                    if let Some(from) = value.deferred() {
                        if !from.contains('.') {
                            result.add_error(&format!(
                                "Action '{}': '{}' should name a parameter as <action>.<variable>",
                                action.name, from
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Check that local source checkouts exist (runtime validation)
    pub fn validate_files(pipeline: &Pipeline, base_path: &Path) -> Result<Vec<String>, DeployflowError> {
        let mut missing = Vec::new();

        for (_, action) in pipeline.actions() {
            if let ActionKind::Source { repository, .. } = &action.kind {
                let full_path = base_path.join(repository);
                if !full_path.is_dir() {
                    missing.push(format!(
                        "Action '{}': source checkout not found: {}",
                        action.name,
                        full_path.display()
                    ));
                }
            }
        }

        Ok(missing)
    }
}

/// Result of pipeline validation
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }

    pub fn add_warning(&mut self, message: &str) {
        self.warnings.push(message.to_string());
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Turn errors into a single `InvalidPipeline`
    pub fn into_result(self) -> Result<Vec<String>, DeployflowError> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(DeployflowError::InvalidPipeline {
                reason: self.errors.join("; "),
                help: Some("Run `deployflow validate` for details".into()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fixtures::USER_PIPELINE;
    use tempfile::TempDir;

    #[test]
    fn test_user_pipeline_is_valid() {
        let pipeline = Pipeline::from_yaml(USER_PIPELINE).unwrap();
        let result = PipelineValidator::validate(&pipeline).unwrap();

        assert!(result.is_valid(), "errors: {:?}", result.errors);
        assert!(!result.has_warnings(), "warnings: {:?}", result.warnings);
    }

    #[test]
    fn test_validate_empty_pipeline() {
        let pipeline = Pipeline::from_yaml("name: empty\nstages: []\n").unwrap();

        let result = PipelineValidator::validate(&pipeline).unwrap();
        assert!(!result.is_valid());
        assert!(result.into_result().is_err());
    }

    #[test]
    fn test_template_artifact_must_be_input() {
        let yaml = USER_PIPELINE.replace("        inputs: [cdk-build-output]\n", "");
        let pipeline = Pipeline::from_yaml(&yaml).unwrap();

        let result = PipelineValidator::validate(&pipeline).unwrap();
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("must be listed in inputs")));
    }

    #[test]
    fn test_stack_names_must_be_file_safe() {
        let yaml = USER_PIPELINE.replace(
            "stack: UserEcsStackDeployedInPipeline",
            "stack: ../../UserEcsStackDeployedInPipeline",
        );
        let pipeline = Pipeline::from_yaml(&yaml).unwrap();

        let result = PipelineValidator::validate(&pipeline).unwrap();
        let offending: Vec<_> = result
            .errors
            .iter()
            .filter(|e| e.contains("'../../UserEcsStackDeployedInPipeline' must start with a letter"))
            .collect();
        assert_eq!(offending.len(), 2, "errors: {:?}", result.errors);
    }

    #[test]
    fn test_bad_variable_name() {
        let yaml = USER_PIPELINE
            .replace("exported_variables: [imageTag]", "exported_variables: [image-tag]")
            .replace("from: app-build.imageTag", "from: app-build.image-tag");
        let pipeline = Pipeline::from_yaml(&yaml).unwrap();

        let result = PipelineValidator::validate(&pipeline).unwrap();
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("not a valid variable name")));
    }

    #[test]
    fn test_unused_export_warns() {
        let yaml = USER_PIPELINE.replace(
            "exported_variables: [imageTag]",
            "exported_variables: [imageTag, buildNumber]",
        );
        let pipeline = Pipeline::from_yaml(&yaml).unwrap();

        let result = PipelineValidator::validate(&pipeline).unwrap();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("buildNumber")));
    }

    #[test]
    fn test_missing_parameter_exporter() {
        let yaml = USER_PIPELINE.replace("from: app-build.imageTag", "from: synth.imageTag");
        let pipeline = Pipeline::from_yaml(&yaml).unwrap();

        let result = PipelineValidator::validate(&pipeline).unwrap();
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("synth.imageTag")));
    }

    #[test]
    fn test_validate_files() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("user")).unwrap();
        let pipeline = Pipeline::from_yaml(USER_PIPELINE).unwrap();

        let missing = PipelineValidator::validate_files(&pipeline, temp.path()).unwrap();
        assert_eq!(missing.len(), 1);
        assert!(missing[0].contains("user-cdk"));
    }
}
