// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! End-to-end runs of the application/template pipeline with stubbed
//! source and build collaborators.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use deployflow::artifacts::{ArtifactPayload, MemoryBackend};
use deployflow::collaborators::{
    BuildOutput, BuildRequest, BuildRunner, EnvironmentState, LocalImageRepository,
    LocalTemplateEngine, SourceProvider, TemplateEngine, SOURCE_VERSION,
};
use deployflow::deploy::DeploymentExecutor;
use deployflow::pipeline::{
    ActionStatus, PipelineStatus, RunEvent, RunOptions, StageStatus, StandardActions,
};
use deployflow::template::{synthesize, DeploymentRequest};
use deployflow::{DeployflowError, DeployflowResult, Pipeline, PipelineRunner};

const PIPELINE: &str = include_str!("fixtures/pipeline.yaml");
const ENVIRONMENT: &str = include_str!("fixtures/user-cdk/environment.yaml");
const STACK: &str = "UserEcsStackDeployedInPipeline";

/// Serves the fixture checkouts at version `v1`
struct FixtureSource;

#[async_trait]
impl SourceProvider for FixtureSource {
    async fn fetch(&self, repository: &str, branch: &str) -> DeployflowResult<ArtifactPayload> {
        let payload = match repository {
            "user" => ArtifactPayload::new().with_file("app.txt", "user service v1"),
            "user-cdk" => ArtifactPayload::new().with_file("environment.yaml", ENVIRONMENT),
            other => {
                return Err(DeployflowError::SourceUnavailable {
                    repository: other.to_string(),
                    branch: branch.to_string(),
                    reason: "no such fixture".into(),
                })
            }
        };
        Ok(payload.with_metadata(SOURCE_VERSION, "v1"))
    }
}

/// Exports a fixed image tag, or fails
struct StubBuild {
    tag: &'static str,
    fail: bool,
}

#[async_trait]
impl BuildRunner for StubBuild {
    async fn build(&self, request: &BuildRequest) -> DeployflowResult<BuildOutput> {
        if self.fail {
            return Err(DeployflowError::BuildFailed {
                action: request.action.clone(),
                reason: "compilation failed".into(),
                help: None,
            });
        }
        let mut output = BuildOutput::default();
        output.exports.insert("imageTag".into(), self.tag.into());
        Ok(output)
    }
}

/// Counts the applies that reach the wrapped engine
struct CountingEngine {
    inner: LocalTemplateEngine,
    applies: Arc<AtomicUsize>,
}

#[async_trait]
impl TemplateEngine for CountingEngine {
    async fn current(&self, environment: &str) -> DeployflowResult<Option<EnvironmentState>> {
        self.inner.current(environment).await
    }

    async fn apply(&self, request: &DeploymentRequest) -> DeployflowResult<EnvironmentState> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.inner.apply(request).await
    }
}

struct Harness {
    _temp: TempDir,
    engine: Arc<CountingEngine>,
    applies: Arc<AtomicUsize>,
}

impl Harness {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let applies = Arc::new(AtomicUsize::new(0));
        let engine = Arc::new(CountingEngine {
            inner: LocalTemplateEngine::new(temp.path().join("environments"), 50).unwrap(),
            applies: applies.clone(),
        });
        Self {
            _temp: temp,
            engine,
            applies,
        }
    }

    fn runner(&self, build: StubBuild) -> PipelineRunner {
        let actions = StandardActions::new(
            Arc::new(FixtureSource),
            Arc::new(build),
            Arc::new(LocalImageRepository::in_memory("registry.local")),
            self.engine.clone(),
        );
        PipelineRunner::new(Arc::new(actions), Arc::new(MemoryBackend::new()))
    }

    fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }
}

fn quiet() -> RunOptions {
    RunOptions {
        quiet: true,
        ..Default::default()
    }
}

fn pipeline() -> Pipeline {
    Pipeline::from_yaml(PIPELINE).unwrap()
}

#[tokio::test]
async fn test_exported_tag_reaches_environment() {
    let harness = Harness::new();
    let runner = harness.runner(StubBuild {
        tag: "abc123",
        fail: false,
    });

    let report = runner.run(&pipeline(), &quiet()).await.unwrap();

    assert!(report.is_success(), "{:?}", report.failure());
    assert_eq!(
        report.parameters.get("app-build.imageTag").map(String::as_str),
        Some("abc123")
    );

    let environment = report.environments.get(STACK).unwrap();
    assert!(environment.changed);
    assert_eq!(environment.version, 1);
    assert_eq!(
        environment.outputs.get("ServiceImage").map(String::as_str),
        Some("registry.local/user-repository:abc123")
    );

    let state = harness.engine.current(STACK).await.unwrap().unwrap();
    assert_eq!(
        state.parameters.get("ImageTag").map(String::as_str),
        Some("abc123")
    );
    assert_eq!(harness.applies(), 1);
}

#[tokio::test]
async fn test_failed_build_never_starts_deploy_stage() {
    let harness = Harness::new();
    let runner = harness.runner(StubBuild {
        tag: "abc123",
        fail: true,
    });

    let report = runner.run(&pipeline(), &quiet()).await.unwrap();

    match &report.status {
        PipelineStatus::Failed { stage, .. } => assert_eq!(stage, "Build"),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(matches!(
        report.failure(),
        Some(DeployflowError::BuildFailed { .. })
    ));

    let deploy_stage = report.stage("Deploy").unwrap();
    assert_eq!(deploy_stage.status, StageStatus::Pending);
    assert_eq!(
        report.action("deploy").map(|a| a.status),
        Some(ActionStatus::Pending)
    );
    let deploy_started =
        report.event_index(|e| matches!(e, RunEvent::StageStarted { stage } if stage == "Deploy"));
    assert!(deploy_started.is_none());

    assert_eq!(harness.applies(), 0);
    assert!(harness.engine.current(STACK).await.unwrap().is_none());
}

#[tokio::test]
async fn test_redeploy_with_same_tag_changes_nothing() {
    let harness = Harness::new();

    let first = harness
        .runner(StubBuild {
            tag: "abc123",
            fail: false,
        })
        .run(&pipeline(), &quiet())
        .await
        .unwrap();
    let second = harness
        .runner(StubBuild {
            tag: "abc123",
            fail: false,
        })
        .run(&pipeline(), &quiet())
        .await
        .unwrap();

    assert!(second.is_success());
    assert_ne!(first.run_id, second.run_id);

    let before = first.environments.get(STACK).unwrap();
    let after = second.environments.get(STACK).unwrap();
    assert!(!after.changed);
    assert_eq!(after.version, before.version);
    assert_eq!(after.fingerprint, before.fingerprint);
    assert_eq!(harness.applies(), 1);
}

#[tokio::test]
async fn test_new_tag_updates_environment() {
    let harness = Harness::new();

    for tag in ["abc123", "def456"] {
        harness
            .runner(StubBuild { tag, fail: false })
            .run(&pipeline(), &quiet())
            .await
            .unwrap();
    }

    let state = harness.engine.current(STACK).await.unwrap().unwrap();
    assert_eq!(state.version, 2);
    assert_eq!(
        state.outputs.get("ServiceImage").map(String::as_str),
        Some("registry.local/user-repository:def456")
    );
}

#[tokio::test]
async fn test_missing_override_fails_before_mutation() {
    let harness = Harness::new();
    let yaml = PIPELINE.replace(
        "          parameter_overrides:\n            ImageTag:\n              from: app-build.imageTag\n",
        "",
    );
    let pipeline = Pipeline::from_yaml(&yaml).unwrap();
    let runner = harness.runner(StubBuild {
        tag: "abc123",
        fail: false,
    });

    let report = runner.run(&pipeline, &quiet()).await.unwrap();

    match &report.status {
        PipelineStatus::Failed { stage, .. } => assert_eq!(stage, "Deploy"),
        other => panic!("expected failure, got {:?}", other),
    }
    match report.failure() {
        Some(DeployflowError::UnresolvedPlaceholder { name }) => assert_eq!(name, "ImageTag"),
        other => panic!("expected unresolved placeholder, got {:?}", other),
    }
    assert_eq!(harness.applies(), 0);
    assert!(harness.engine.current(STACK).await.unwrap().is_none());
}

#[tokio::test]
async fn test_direct_deploy_without_parameters_is_rejected() {
    let harness = Harness::new();
    let source = ArtifactPayload::new().with_file("environment.yaml", ENVIRONMENT);
    let template = synthesize(&source, "cdk-source-output", "environment.yaml", STACK, "registry.local")
        .unwrap();
    let executor = DeploymentExecutor::new(harness.engine.clone());

    let err = executor
        .deploy(STACK, &template, &BTreeMap::new())
        .await
        .unwrap_err();

    assert!(matches!(err, DeployflowError::UnresolvedPlaceholder { .. }));
    assert!(err.preserves_environment());
    assert_eq!(harness.applies(), 0);
}
