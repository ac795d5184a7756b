// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Action execution
//!
//! An [`ActionExecutor`] runs one action against the run's artifact store and
//! parameter registry. [`StandardActions`] implements the four action kinds
//! on top of the collaborator traits.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::artifacts::{ArtifactPayload, ArtifactRef, ArtifactStore, ContentHasher};
use crate::audit::AuditStore;
use crate::collaborators::{
    BuildRequest, BuildRunner, ImageRef, ImageRepository, LocalImageRepository,
    LocalSourceProvider, LocalTemplateEngine, ShellBuildRunner, SourceProvider, TemplateEngine,
    SOURCE_VERSION,
};
use crate::deploy::{DeploymentExecutor, EnvironmentRef};
use crate::errors::{DeployflowError, DeployflowResult};
use crate::params::ParameterRegistry;
use crate::pipeline::{parameter_name, Action, ActionKind, ArtifactPath, ImageConfig, ParameterValue, Pipeline};
use crate::template::{synthesize, template_file_name, Template};

/// File written into a build's output artifact describing the pushed image
pub const IMAGE_DEFINITIONS: &str = "imagedefinitions.json";

/// File written into a deploy's output artifact with the stack outputs
pub const DEPLOY_OUTPUTS: &str = "outputs.json";

/// What an action sees of its run
#[derive(Clone)]
pub struct ActionContext {
    pub run_id: String,
    pub store: Arc<ArtifactStore>,
    pub registry: Arc<ParameterRegistry>,
    /// Pipeline-wide environment variables
    pub env: HashMap<String, String>,
}

/// What an action produced
#[derive(Debug, Clone, Default)]
pub struct ActionOutcome {
    /// Output artifacts written
    pub written: Vec<ArtifactRef>,
    /// Parameters exported, by registry name
    pub exports: BTreeMap<String, String>,
    /// Environment created or updated by a deploy
    pub environment: Option<EnvironmentRef>,
    /// Image pushed by a build
    pub image: Option<ImageRef>,
    pub message: Option<String>,
}

/// Runs a single action
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Execute `action`. Inputs are ready when this is called; on success
    /// every declared output has been written and every declared export has
    /// a registry value.
    async fn execute(&self, action: &Action, ctx: &ActionContext) -> DeployflowResult<ActionOutcome>;
}

/// Source, build, synthesize and deploy actions over the collaborator traits
pub struct StandardActions {
    sources: Arc<dyn SourceProvider>,
    builds: Arc<dyn BuildRunner>,
    images: Arc<dyn ImageRepository>,
    deployer: DeploymentExecutor,
    audit: Option<Arc<dyn AuditStore>>,
}

impl StandardActions {
    pub fn new(
        sources: Arc<dyn SourceProvider>,
        builds: Arc<dyn BuildRunner>,
        images: Arc<dyn ImageRepository>,
        engine: Arc<dyn TemplateEngine>,
    ) -> Self {
        Self {
            sources,
            builds,
            images,
            deployer: DeploymentExecutor::new(engine),
            audit: None,
        }
    }

    /// Record every deployed template in `audit`
    pub fn with_audit(mut self, audit: Arc<dyn AuditStore>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Local collaborators rooted at `base_dir`, with state under the
    /// pipeline's state directory.
    pub fn local(pipeline: &Pipeline, base_dir: &Path) -> DeployflowResult<Self> {
        let state_dir = base_dir.join(&pipeline.state.directory);

        let sources = LocalSourceProvider::new(base_dir.to_path_buf());
        let builds = ShellBuildRunner::in_state_dir(&state_dir);
        let images = LocalImageRepository::in_state_dir(pipeline.state.registry.clone(), &state_dir)?;
        let engine = LocalTemplateEngine::in_state_dir(&state_dir, pipeline.state.quota.max_resources)?;

        Ok(Self::new(
            Arc::new(sources),
            Arc::new(builds),
            Arc::new(images),
            Arc::new(engine),
        ))
    }

    async fn write_outputs(
        action: &Action,
        ctx: &ActionContext,
        payload: ArtifactPayload,
    ) -> DeployflowResult<Vec<ArtifactRef>> {
        let mut written = Vec::with_capacity(action.outputs.len());
        for slot in &action.outputs {
            written.push(ctx.store.put(slot, payload.clone()).await?);
        }
        Ok(written)
    }

    fn single_input(action: &Action) -> DeployflowResult<&str> {
        match action.inputs.as_slice() {
            [input] => Ok(input.as_str()),
            inputs => Err(DeployflowError::InvalidPipeline {
                reason: format!(
                    "Action '{}' needs exactly one input artifact, found {}",
                    action.name,
                    inputs.len()
                ),
                help: None,
            }),
        }
    }

    async fn source(
        &self,
        action: &Action,
        ctx: &ActionContext,
        repository: &str,
        branch: &str,
    ) -> DeployflowResult<ActionOutcome> {
        let payload = self.sources.fetch(repository, branch).await?;
        let version = payload.metadata(SOURCE_VERSION).unwrap_or("unknown").to_string();
        info!(action = %action.name, repository, branch, %version, "Source fetched");

        let written = Self::write_outputs(action, ctx, payload).await?;
        Ok(ActionOutcome {
            written,
            message: Some(format!("{}@{} ({})", repository, branch, version)),
            ..Default::default()
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn build(
        &self,
        action: &Action,
        ctx: &ActionContext,
        commands: &[String],
        shell: &str,
        runtime: Option<&str>,
        exported_variables: &[String],
        image: Option<&ImageConfig>,
        artifacts: &[String],
    ) -> DeployflowResult<ActionOutcome> {
        let input = Self::single_input(action)?;
        let source = ctx.store.get_slot(input).await?;

        let mut env = ctx.env.clone();
        env.extend(action.env.clone());

        let request = BuildRequest {
            run_id: ctx.run_id.clone(),
            action: action.name.clone(),
            source,
            commands: commands.to_vec(),
            shell: shell.to_string(),
            runtime: runtime.map(str::to_string),
            env,
            exported_variables: exported_variables.to_vec(),
            artifacts: artifacts.to_vec(),
            repository_uri: image.map(|i| self.images.repository_uri(&i.repository)),
        };

        let output = self.builds.build(&request).await?;
        let mut exports = output.exports;
        let mut files = output.files;
        let mut metadata = BTreeMap::from([(
            SOURCE_VERSION.to_string(),
            request.source_version().to_string(),
        )]);

        let mut pushed = None;
        if let Some(image) = image {
            let tag = exports
                .get(&image.tag_variable)
                .cloned()
                .unwrap_or_else(|| request.source_version().to_string());

            let mut hasher = ContentHasher::new();
            hasher.hash_files(&request.source.files);
            hasher.hash_files(&files);
            hasher.update(tag.as_bytes());
            let digest = hasher.finalize();

            let image_ref = self.images.push(&image.repository, &tag, &digest).await?;
            let definitions = json!([{ "name": image.container_name(), "imageUri": image_ref.uri }]);
            files.insert(
                IMAGE_DEFINITIONS.to_string(),
                serde_json::to_vec_pretty(&definitions)?,
            );
            metadata.insert("image_uri".to_string(), image_ref.uri.clone());

            exports.entry(image.tag_variable.clone()).or_insert(tag);
            pushed = Some(image_ref);
        }

        if let Some(missing) = exported_variables.iter().find(|v| !exports.contains_key(*v)) {
            return Err(DeployflowError::BuildFailed {
                action: action.name.clone(),
                reason: format!("exported variable '{}' was not set by the build", missing),
                help: Some(format!("Add `export {}=...` to the build commands", missing)),
            });
        }

        let written = Self::write_outputs(action, ctx, ArtifactPayload { files, metadata }).await?;

        let mut exported = BTreeMap::new();
        for variable in exported_variables {
            let name = parameter_name(&action.name, variable);
            let value = exports.get(variable).cloned().unwrap_or_default();
            ctx.registry.export(&action.name, &name, &value).await?;
            exported.insert(name, value);
        }

        info!(
            action = %action.name,
            exports = exported.len(),
            duration_ms = output.duration.as_millis() as u64,
            "Build succeeded"
        );

        Ok(ActionOutcome {
            written,
            exports: exported,
            message: pushed.as_ref().map(|i| i.uri.clone()),
            image: pushed,
            ..Default::default()
        })
    }

    async fn synthesize(
        &self,
        action: &Action,
        ctx: &ActionContext,
        environment: &Path,
        stack: &str,
    ) -> DeployflowResult<ActionOutcome> {
        let input = Self::single_input(action)?;
        let source = ctx.store.get_slot(input).await?;
        let environment_file = environment.to_string_lossy().replace('\\', "/");

        let template = synthesize(&source, input, &environment_file, stack, self.images.registry())?;
        let version = template.fingerprint();

        let mut payload = ArtifactPayload::new()
            .with_file(template_file_name(stack), template.to_json())
            .with_metadata("template_version", version.clone());
        if let Some(source_version) = source.metadata(SOURCE_VERSION) {
            payload = payload.with_metadata(SOURCE_VERSION, source_version);
        }

        let written = Self::write_outputs(action, ctx, payload).await?;
        info!(action = %action.name, stack, %version, "Template synthesized");

        Ok(ActionOutcome {
            written,
            message: Some(format!("{} ({})", template_file_name(stack), version)),
            ..Default::default()
        })
    }

    async fn deploy(
        &self,
        action: &Action,
        ctx: &ActionContext,
        stack: &str,
        template_path: &ArtifactPath,
        overrides: &BTreeMap<String, ParameterValue>,
    ) -> DeployflowResult<ActionOutcome> {
        let artifact = ctx.store.get_slot(&template_path.artifact).await?;
        let template = Template::from_json(
            &artifact.require_text(&template_path.artifact, &template_path.path)?,
        )?;

        let mut params = BTreeMap::new();
        for (placeholder, value) in overrides {
            let resolved = match value {
                ParameterValue::Deferred { from } => ctx.registry.resolve(from).await?,
                ParameterValue::Literal(literal) => literal.clone(),
            };
            debug!(action = %action.name, placeholder = %placeholder, "Parameter resolved");
            params.insert(placeholder.clone(), resolved);
        }

        let environment = self.deployer.deploy(stack, &template, &params).await?;

        if let Some(audit) = &self.audit {
            audit.record_template(stack, &template).await?;
        }

        let written = if action.outputs.is_empty() {
            Vec::new()
        } else {
            let payload = ArtifactPayload::new()
                .with_file(DEPLOY_OUTPUTS, serde_json::to_vec_pretty(&environment.outputs)?)
                .with_metadata("environment", environment.environment.clone())
                .with_metadata("fingerprint", environment.fingerprint.clone());
            Self::write_outputs(action, ctx, payload).await?
        };

        let message = if environment.changed {
            format!("{} updated to version {}", stack, environment.version)
        } else {
            format!("{} already at desired state", stack)
        };

        Ok(ActionOutcome {
            written,
            environment: Some(environment),
            message: Some(message),
            ..Default::default()
        })
    }
}

#[async_trait]
impl ActionExecutor for StandardActions {
    async fn execute(&self, action: &Action, ctx: &ActionContext) -> DeployflowResult<ActionOutcome> {
        match &action.kind {
            ActionKind::Source { repository, branch } => {
                self.source(action, ctx, repository, branch).await
            }
            ActionKind::Build {
                commands,
                shell,
                runtime,
                exported_variables,
                image,
                artifacts,
            } => {
                self.build(
                    action,
                    ctx,
                    commands,
                    shell,
                    runtime.as_deref(),
                    exported_variables,
                    image.as_ref(),
                    artifacts,
                )
                .await
            }
            ActionKind::Synthesize { environment, stack } => {
                self.synthesize(action, ctx, environment, stack).await
            }
            ActionKind::Deploy {
                stack,
                template,
                parameter_overrides,
            } => self.deploy(action, ctx, stack, template, parameter_overrides).await,
        }
    }
}
