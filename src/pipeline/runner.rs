// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Pipeline runner
//!
//! Runs stages strictly in order. The actions of a stage run as parallel
//! tasks; the next stage starts only after every action of the current one
//! succeeded. The first failing stage fails the pipeline and later stages
//! stay pending.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use colored::Colorize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactBackend, ArtifactStore};
use crate::audit::{AuditStore, RunRecord};
use crate::deploy::EnvironmentRef;
use crate::errors::{DeployflowError, DeployflowResult};
use crate::params::ParameterRegistry;
use crate::pipeline::{
    parameter_name, Action, ActionContext, ActionExecutor, ActionOutcome, DagBuilder, Pipeline,
    PipelineValidator, Stage,
};

/// Pipeline run options
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Only show what would be done
    pub dry_run: bool,
    /// Print action output and failure details
    pub verbose: bool,
    /// Print nothing
    pub quiet: bool,
}

/// Status of an action in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

/// Status of a stage in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Status of a whole run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStatus {
    /// Dry run; nothing was executed
    Planned,
    Succeeded,
    Failed { stage: String, reason: String },
}

/// Outcome of one action
#[derive(Debug)]
pub struct ActionReport {
    pub name: String,
    pub status: ActionStatus,
    pub error: Option<DeployflowError>,
    pub duration: Duration,
    pub outcome: Option<ActionOutcome>,
}

impl ActionReport {
    fn pending(action: &Action) -> Self {
        Self {
            name: action.name.clone(),
            status: ActionStatus::Pending,
            error: None,
            duration: Duration::ZERO,
            outcome: None,
        }
    }
}

/// Outcome of one stage
#[derive(Debug)]
pub struct StageReport {
    pub name: String,
    pub status: StageStatus,
    pub actions: Vec<ActionReport>,
    pub duration: Duration,
}

impl StageReport {
    fn pending(stage: &Stage) -> Self {
        Self {
            name: stage.name.clone(),
            status: StageStatus::Pending,
            actions: stage.actions.iter().map(ActionReport::pending).collect(),
            duration: Duration::ZERO,
        }
    }

    /// First failed or cancelled action, in stage order
    pub fn failure(&self) -> Option<&ActionReport> {
        self.actions.iter().find(|a| a.error.is_some())
    }
}

/// Something that happened during a run, in the order it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    StageStarted {
        stage: String,
    },
    ActionStarted {
        stage: String,
        action: String,
        /// Every consumed artifact was ready when the action started
        inputs_ready: bool,
    },
    ActionFinished {
        stage: String,
        action: String,
        status: ActionStatus,
    },
    StageFinished {
        stage: String,
        status: StageStatus,
    },
    Cancelled {
        stage: String,
    },
}

/// Result of a pipeline run
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub pipeline: String,
    pub status: PipelineStatus,
    pub stages: Vec<StageReport>,
    pub events: Vec<RunEvent>,
    /// Deferred parameters exported during the run
    pub parameters: BTreeMap<String, String>,
    /// Environments deployed by the run, by name
    pub environments: BTreeMap<String, EnvironmentRef>,
    pub started_at: SystemTime,
    pub duration: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Succeeded
    }

    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn action(&self, name: &str) -> Option<&ActionReport> {
        self.stages
            .iter()
            .flat_map(|s| s.actions.iter())
            .find(|a| a.name == name)
    }

    /// Error of the first failed action
    pub fn failure(&self) -> Option<&DeployflowError> {
        self.stages
            .iter()
            .find_map(StageReport::failure)
            .and_then(|a| a.error.as_ref())
    }

    /// Position of the first event matching `predicate`
    pub fn event_index(&self, predicate: impl Fn(&RunEvent) -> bool) -> Option<usize> {
        self.events.iter().position(predicate)
    }
}

/// Cancels a running pipeline
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }

    /// Request cancellation. The current stage fails and nothing further starts.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Clear a request, once the run it stopped has ended
    fn reset(&self) {
        self.0.send_replace(false);
    }

    /// Completes once cancellation was requested
    pub async fn cancelled(&self) {
        let mut rx = self.0.subscribe();
        // The sender lives in `self`, so this only returns once cancelled
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

type EventLog = Arc<Mutex<Vec<RunEvent>>>;

enum Next {
    Joined(Option<Result<(usize, DeployflowResult<ActionOutcome>, Duration), tokio::task::JoinError>>),
    Cancelled,
}

/// Runs pipelines stage by stage
pub struct PipelineRunner {
    executor: Arc<dyn ActionExecutor>,
    backend: Arc<dyn ArtifactBackend>,
    audit: Option<Arc<dyn AuditStore>>,
    cancel: CancelHandle,
}

impl PipelineRunner {
    /// Create a runner executing actions with `executor` and storing
    /// artifacts in `backend`
    pub fn new(executor: Arc<dyn ActionExecutor>, backend: Arc<dyn ArtifactBackend>) -> Self {
        Self {
            executor,
            backend,
            audit: None,
            cancel: CancelHandle::new(),
        }
    }

    /// Persist a record of every run in `audit`
    pub fn with_audit(mut self, audit: Arc<dyn AuditStore>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Handle that cancels runs of this runner. A request made while no
    /// run is active stops the next run; each run clears it when it ends.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run a pipeline
    pub async fn run(&self, pipeline: &Pipeline, options: &RunOptions) -> DeployflowResult<RunReport> {
        let start = Instant::now();
        let started_at = SystemTime::now();

        for warning in PipelineValidator::validate(pipeline)?.into_result()? {
            warn!(pipeline = %pipeline.name, "{}", warning);
        }
        let dag = DagBuilder::build(pipeline)?;
        let run_id = uuid::Uuid::new_v4().to_string();

        if !options.quiet {
            Self::print_execution_plan(pipeline, &dag);
        }

        if options.dry_run {
            return Ok(RunReport {
                run_id,
                pipeline: pipeline.name.clone(),
                status: PipelineStatus::Planned,
                stages: pipeline.stages.iter().map(StageReport::pending).collect(),
                events: Vec::new(),
                parameters: BTreeMap::new(),
                environments: BTreeMap::new(),
                started_at,
                duration: start.elapsed(),
            });
        }

        let store = ArtifactStore::new(run_id.clone(), self.backend.clone())
            .with_retention(pipeline.state.artifacts.retain);
        for (slot, producer) in dag.slots() {
            store
                .declare(slot, producer, dag.consumers_of(slot).to_vec())
                .await;
        }

        let ctx = ActionContext {
            run_id: run_id.clone(),
            store: Arc::new(store),
            registry: Arc::new(ParameterRegistry::for_pipeline(pipeline)?),
            env: pipeline.env.clone(),
        };
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));

        info!(run_id = %run_id, pipeline = %pipeline.name, "Pipeline run started");

        let mut status = PipelineStatus::Succeeded;
        let mut stages = Vec::with_capacity(pipeline.stages.len());

        for stage in &pipeline.stages {
            if status != PipelineStatus::Succeeded {
                stages.push(StageReport::pending(stage));
                continue;
            }

            if self.cancel.is_cancelled() {
                warn!(stage = %stage.name, "Run cancelled before stage start");
                events.lock().await.push(RunEvent::Cancelled {
                    stage: stage.name.clone(),
                });
                let mut report = StageReport::pending(stage);
                report.status = StageStatus::Failed;
                for action in &mut report.actions {
                    action.status = ActionStatus::Cancelled;
                    action.error = Some(DeployflowError::Cancelled);
                }
                status = PipelineStatus::Failed {
                    stage: stage.name.clone(),
                    reason: DeployflowError::Cancelled.to_string(),
                };
                stages.push(report);
                continue;
            }

            let report = self.run_stage(stage, &ctx, &events, options).await;
            if report.status == StageStatus::Failed {
                let reason = report
                    .failure()
                    .and_then(|a| a.error.as_ref().map(|e| format!("{}: {}", a.name, e)))
                    .unwrap_or_else(|| "stage failed".to_string());
                status = PipelineStatus::Failed {
                    stage: stage.name.clone(),
                    reason,
                };
            }
            stages.push(report);
        }
        self.cancel.reset();

        let parameters = ctx.registry.snapshot().await;
        let end_reason = match &status {
            PipelineStatus::Failed { stage, .. } => format!("stage '{}' failed", stage),
            _ => "run finished".to_string(),
        };
        ctx.registry.close(&end_reason).await;
        if let Err(e) = ctx.store.teardown(&end_reason).await {
            warn!(run_id = %run_id, error = %e, "Artifact teardown failed");
        }

        let environments: BTreeMap<String, EnvironmentRef> = stages
            .iter()
            .flat_map(|s| s.actions.iter())
            .filter_map(|a| a.outcome.as_ref()?.environment.clone())
            .map(|env| (env.environment.clone(), env))
            .collect();

        let events = std::mem::take(&mut *events.lock().await);
        let report = RunReport {
            run_id,
            pipeline: pipeline.name.clone(),
            status,
            stages,
            events,
            parameters,
            environments,
            started_at,
            duration: start.elapsed(),
        };

        self.record(&report).await;
        if !options.quiet {
            Self::print_summary(&report);
        }

        match &report.status {
            PipelineStatus::Failed { stage, reason } => {
                warn!(run_id = %report.run_id, stage = %stage, reason = %reason, "Pipeline failed")
            }
            _ => info!(run_id = %report.run_id, "Pipeline succeeded"),
        }

        Ok(report)
    }

    /// Run every action of a stage concurrently
    async fn run_stage(
        &self,
        stage: &Stage,
        ctx: &ActionContext,
        events: &EventLog,
        options: &RunOptions,
    ) -> StageReport {
        let start = Instant::now();
        let mut report = StageReport::pending(stage);
        report.status = StageStatus::Running;

        events.lock().await.push(RunEvent::StageStarted {
            stage: stage.name.clone(),
        });
        info!(stage = %stage.name, actions = stage.actions.len(), "Stage started");
        if !options.quiet {
            println!("  {} {}", "→".blue(), stage.name.bold());
        }

        let mut set = JoinSet::new();
        for (position, action) in stage.actions.iter().enumerate() {
            let executor = self.executor.clone();
            let ctx = ctx.clone();
            let action = action.clone();
            let stage_name = stage.name.clone();
            let events = events.clone();

            set.spawn(async move {
                let started = Instant::now();
                let result = Self::run_action(executor, &stage_name, &action, &ctx, &events).await;
                (position, result, started.elapsed())
            });
        }

        let mut cancelled = false;
        loop {
            let next = tokio::select! {
                joined = set.join_next() => Next::Joined(joined),
                _ = self.cancel.cancelled() => Next::Cancelled,
            };

            match next {
                Next::Joined(None) => break,
                Next::Joined(Some(Ok((position, result, duration)))) => {
                    Self::record_action(&mut report.actions[position], result, duration);
                }
                Next::Joined(Some(Err(e))) => {
                    warn!(stage = %stage.name, error = %e, "Action task aborted");
                }
                Next::Cancelled => {
                    warn!(stage = %stage.name, "Cancelling running actions");
                    events.lock().await.push(RunEvent::Cancelled {
                        stage: stage.name.clone(),
                    });
                    ctx.registry.close("run cancelled").await;
                    ctx.store.abandon_all("run cancelled").await;
                    set.abort_all();
                    while let Some(joined) = set.join_next().await {
                        if let Ok((position, result, duration)) = joined {
                            Self::record_action(&mut report.actions[position], result, duration);
                        }
                    }
                    cancelled = true;
                    break;
                }
            }
        }

        // Actions that never reported back were aborted or panicked
        for action in &mut report.actions {
            if action.status == ActionStatus::Pending {
                action.status = ActionStatus::Cancelled;
                action.error = Some(if cancelled {
                    DeployflowError::Cancelled
                } else {
                    DeployflowError::StateError {
                        message: format!("action '{}' did not complete", action.name),
                    }
                });
            }
        }

        for (action, action_report) in stage.actions.iter().zip(&report.actions) {
            if action_report.status != ActionStatus::Succeeded {
                continue;
            }
            for slot in action.consumed_artifacts() {
                if let Err(e) = ctx.store.mark_consumed(slot, &action.name).await {
                    warn!(slot, action = %action.name, error = %e, "Could not release artifact");
                }
            }
        }

        let failed = report
            .actions
            .iter()
            .any(|a| a.status != ActionStatus::Succeeded);
        report.status = if failed {
            StageStatus::Failed
        } else {
            StageStatus::Succeeded
        };
        report.duration = start.elapsed();

        if failed {
            let names: Vec<String> = stage.actions.iter().map(|a| a.name.clone()).collect();
            let reason = format!("stage '{}' failed", stage.name);
            ctx.registry.abandon_exports_of(&names, &reason).await;
        }

        events.lock().await.push(RunEvent::StageFinished {
            stage: stage.name.clone(),
            status: report.status,
        });
        info!(
            stage = %stage.name,
            status = ?report.status,
            duration_ms = report.duration.as_millis() as u64,
            "Stage finished"
        );
        if !options.quiet {
            Self::print_stage(&report, options.verbose);
        }

        report
    }

    /// Run one action and check what it left behind
    async fn run_action(
        executor: Arc<dyn ActionExecutor>,
        stage: &str,
        action: &Action,
        ctx: &ActionContext,
        events: &EventLog,
    ) -> DeployflowResult<ActionOutcome> {
        let mut missing_input = None;
        for slot in action.consumed_artifacts() {
            if !ctx.store.is_ready(slot).await {
                missing_input = Some(slot);
                break;
            }
        }

        events.lock().await.push(RunEvent::ActionStarted {
            stage: stage.to_string(),
            action: action.name.clone(),
            inputs_ready: missing_input.is_none(),
        });
        info!(action = %action.name, kind = action.kind_name(), "Action started");

        let result = match missing_input {
            Some(slot) => Err(DeployflowError::NotProduced {
                slot: slot.to_string(),
                reason: format!("not ready when '{}' started", action.name),
            }),
            None => Self::execute_checked(executor.as_ref(), action, ctx).await,
        };

        if let Err(e) = &result {
            let reason = e.to_string();
            for slot in &action.outputs {
                if let Err(err) = ctx.store.invalidate(slot, &reason).await {
                    warn!(slot = %slot, error = %err, "Could not invalidate output");
                }
            }
            ctx.registry
                .abandon_exports_of(std::slice::from_ref(&action.name), &reason)
                .await;
            warn!(action = %action.name, error = %e, "Action failed");
        }

        events.lock().await.push(RunEvent::ActionFinished {
            stage: stage.to_string(),
            action: action.name.clone(),
            status: if result.is_ok() {
                ActionStatus::Succeeded
            } else {
                ActionStatus::Failed
            },
        });

        result
    }

    /// Execute and verify every declared output and export exists
    async fn execute_checked(
        executor: &dyn ActionExecutor,
        action: &Action,
        ctx: &ActionContext,
    ) -> DeployflowResult<ActionOutcome> {
        for slot in &action.outputs {
            ctx.store.open(slot).await?;
        }

        let outcome = executor.execute(action, ctx).await?;

        for slot in &action.outputs {
            if !ctx.store.is_ready(slot).await {
                return Err(DeployflowError::NotProduced {
                    slot: slot.clone(),
                    reason: format!("'{}' finished without writing it", action.name),
                });
            }
        }
        for variable in action.exported_variables() {
            let name = parameter_name(&action.name, variable);
            if ctx.registry.try_get(&name).await.is_none() {
                return Err(DeployflowError::NeverExported {
                    name,
                    reason: format!("'{}' finished without exporting it", action.name),
                });
            }
        }

        debug!(action = %action.name, written = outcome.written.len(), "Action postconditions hold");
        Ok(outcome)
    }

    fn record_action(
        report: &mut ActionReport,
        result: DeployflowResult<ActionOutcome>,
        duration: Duration,
    ) {
        report.duration = duration;
        match result {
            Ok(outcome) => {
                report.status = ActionStatus::Succeeded;
                report.outcome = Some(outcome);
            }
            Err(e) => {
                report.status = ActionStatus::Failed;
                report.error = Some(e);
            }
        }
    }

    async fn record(&self, report: &RunReport) {
        let Some(audit) = &self.audit else {
            return;
        };

        let (status, failed_stage, reason) = match &report.status {
            PipelineStatus::Failed { stage, reason } => {
                ("failed", Some(stage.clone()), Some(reason.clone()))
            }
            _ => ("succeeded", None, None),
        };

        let record = RunRecord {
            run_id: report.run_id.clone(),
            pipeline: report.pipeline.clone(),
            started_at: report.started_at,
            finished_at: SystemTime::now(),
            status: status.to_string(),
            failed_stage,
            reason,
            parameters: report.parameters.clone(),
            template_versions: report
                .environments
                .iter()
                .map(|(name, env)| (name.clone(), env.template_version.clone()))
                .collect(),
        };

        if let Err(e) = audit.record_run(&record).await {
            warn!(run_id = %report.run_id, error = %e, "Could not record run");
        }
    }

    /// Print the execution plan
    fn print_execution_plan(pipeline: &Pipeline, dag: &DagBuilder) {
        let stages = pipeline.stages.len();

        println!();
        println!("{}: {}", "Pipeline".bold(), pipeline.name);
        println!("{}", "═".repeat(50));
        println!(
            "Execution plan ({} stage{}):",
            stages,
            if stages == 1 { "" } else { "s" }
        );
        println!();
        for line in dag.to_text(pipeline).lines() {
            println!("  {}", line.dimmed());
        }
        println!();
    }

    fn print_stage(report: &StageReport, verbose: bool) {
        for action in &report.actions {
            let seconds = action.duration.as_secs_f64();
            match action.status {
                ActionStatus::Succeeded => {
                    let detail = action
                        .outcome
                        .as_ref()
                        .and_then(|o| o.message.clone())
                        .unwrap_or_default();
                    println!(
                        "    {} {} ({:.2}s) {}",
                        "✓".green(),
                        action.name,
                        seconds,
                        detail.dimmed()
                    );
                }
                ActionStatus::Failed => {
                    println!("    {} {} failed", "✗".red(), action.name.bold());
                    if let Some(error) = &action.error {
                        if verbose {
                            eprintln!("      {}", format!("{:?}", error).dimmed());
                        } else {
                            eprintln!("      {}", error.to_string().dimmed());
                        }
                    }
                }
                ActionStatus::Cancelled => {
                    println!("    {} {} cancelled", "⊘".yellow(), action.name);
                }
                ActionStatus::Pending => {}
            }
        }
    }

    fn print_summary(report: &RunReport) {
        let seconds = report.duration.as_secs_f64();

        println!();
        match &report.status {
            PipelineStatus::Failed { stage, reason } => {
                println!(
                    "{}",
                    format!("Pipeline failed at stage '{}' after {:.2}s", stage, seconds).red()
                );
                println!("  {}", reason.dimmed());
            }
            _ => {
                println!(
                    "{}",
                    format!("Pipeline completed successfully in {:.2}s", seconds).green()
                );
                for (name, env) in &report.environments {
                    let state = if env.changed { "updated" } else { "unchanged" };
                    println!("  {} {} ({}, version {})", "●".cyan(), name, state, env.version);
                }
            }
        }
        println!("  {} {}", "run".dimmed(), report.run_id.dimmed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{ArtifactPayload, MemoryBackend};
    use crate::pipeline::fixtures::USER_PIPELINE;
    use async_trait::async_trait;
    use std::collections::HashSet;

    /// Writes every output and exports every variable; fails named actions
    struct Scripted {
        failing: HashSet<&'static str>,
    }

    #[async_trait]
    impl ActionExecutor for Scripted {
        async fn execute(&self, action: &Action, ctx: &ActionContext) -> DeployflowResult<ActionOutcome> {
            if self.failing.contains(action.name.as_str()) {
                return Err(DeployflowError::BuildFailed {
                    action: action.name.clone(),
                    reason: "scripted failure".into(),
                    help: None,
                });
            }
            for parameter in action.imported_parameters() {
                ctx.registry.resolve(parameter).await?;
            }

            let mut outcome = ActionOutcome::default();
            for slot in &action.outputs {
                let payload = ArtifactPayload::new().with_file("out.txt", action.name.as_str());
                outcome.written.push(ctx.store.put(slot, payload).await?);
            }
            for variable in action.exported_variables() {
                let name = parameter_name(&action.name, variable);
                ctx.registry.export(&action.name, &name, "abc123").await?;
                outcome.exports.insert(name, "abc123".into());
            }
            Ok(outcome)
        }
    }

    /// Leaves its outputs unwritten
    struct Lazy;

    #[async_trait]
    impl ActionExecutor for Lazy {
        async fn execute(&self, _action: &Action, _ctx: &ActionContext) -> DeployflowResult<ActionOutcome> {
            Ok(ActionOutcome::default())
        }
    }

    fn runner(executor: impl ActionExecutor + 'static) -> PipelineRunner {
        PipelineRunner::new(Arc::new(executor), Arc::new(MemoryBackend::new()))
    }

    fn quiet() -> RunOptions {
        RunOptions {
            quiet: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_successful_run() {
        let pipeline = Pipeline::from_yaml(USER_PIPELINE).unwrap();
        let runner = runner(Scripted {
            failing: HashSet::new(),
        });

        let report = runner.run(&pipeline, &quiet()).await.unwrap();

        assert!(report.is_success());
        assert!(report.stages.iter().all(|s| s.status == StageStatus::Succeeded));
        assert_eq!(
            report.parameters.get("app-build.imageTag").map(String::as_str),
            Some("abc123")
        );
        assert!(report.events.iter().all(|e| match e {
            RunEvent::ActionStarted { inputs_ready, .. } => *inputs_ready,
            _ => true,
        }));
    }

    #[tokio::test]
    async fn test_failed_stage_stops_pipeline() {
        let pipeline = Pipeline::from_yaml(USER_PIPELINE).unwrap();
        let runner = runner(Scripted {
            failing: HashSet::from(["app-build"]),
        });

        let report = runner.run(&pipeline, &quiet()).await.unwrap();

        match &report.status {
            PipelineStatus::Failed { stage, reason } => {
                assert_eq!(stage, "Build");
                assert!(reason.contains("app-build"));
            }
            other => panic!("unexpected status: {other:?}"),
        }
        assert_eq!(report.stage("Deploy").unwrap().status, StageStatus::Pending);
        assert_eq!(report.action("deploy").unwrap().status, ActionStatus::Pending);
        assert!(matches!(
            report.failure(),
            Some(DeployflowError::BuildFailed { .. })
        ));
        assert!(report
            .event_index(|e| matches!(e, RunEvent::StageStarted { stage } if stage == "Deploy"))
            .is_none());
    }

    #[tokio::test]
    async fn test_unwritten_output_fails_action() {
        let pipeline = Pipeline::from_yaml(USER_PIPELINE).unwrap();
        let report = runner(Lazy).run(&pipeline, &quiet()).await.unwrap();

        assert_eq!(report.stage("Source").unwrap().status, StageStatus::Failed);
        assert!(matches!(
            report.failure(),
            Some(DeployflowError::NotProduced { .. })
        ));
    }

    #[tokio::test]
    async fn test_dry_run_executes_nothing() {
        let pipeline = Pipeline::from_yaml(USER_PIPELINE).unwrap();
        let runner = runner(Scripted {
            failing: HashSet::from(["app-source"]),
        });

        let report = runner
            .run(
                &pipeline,
                &RunOptions {
                    dry_run: true,
                    quiet: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(report.status, PipelineStatus::Planned);
        assert!(report.events.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_run() {
        let pipeline = Pipeline::from_yaml(USER_PIPELINE).unwrap();
        let runner = runner(Scripted {
            failing: HashSet::new(),
        });
        runner.cancel_handle().cancel();

        let report = runner.run(&pipeline, &quiet()).await.unwrap();

        assert_eq!(
            report.status,
            PipelineStatus::Failed {
                stage: "Source".into(),
                reason: DeployflowError::Cancelled.to_string(),
            }
        );
        assert_eq!(report.stage("Build").unwrap().status, StageStatus::Pending);
        assert!(matches!(report.failure(), Some(DeployflowError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_applies_to_one_run() {
        let pipeline = Pipeline::from_yaml(USER_PIPELINE).unwrap();
        let runner = runner(Scripted {
            failing: HashSet::new(),
        });
        runner.cancel_handle().cancel();

        let cancelled = runner.run(&pipeline, &quiet()).await.unwrap();
        assert!(matches!(cancelled.failure(), Some(DeployflowError::Cancelled)));
        assert!(!runner.cancel_handle().is_cancelled());

        let next = runner.run(&pipeline, &quiet()).await.unwrap();
        assert!(next.is_success(), "{:?}", next.failure());
    }

    /// Sources succeed; the build waits on a parameter nobody exports and
    /// never returns
    struct Stalled {
        started: Arc<tokio::sync::Notify>,
        waiter: std::sync::Mutex<Option<tokio::sync::oneshot::Sender<DeployflowResult<String>>>>,
    }

    #[async_trait]
    impl ActionExecutor for Stalled {
        async fn execute(&self, action: &Action, ctx: &ActionContext) -> DeployflowResult<ActionOutcome> {
            if action.name != "app-build" {
                return Scripted {
                    failing: HashSet::new(),
                }
                .execute(action, ctx)
                .await;
            }

            let waiter = self.waiter.lock().unwrap().take();
            if let Some(tx) = waiter {
                let registry = ctx.registry.clone();
                tokio::spawn(async move {
                    let _ = tx.send(registry.resolve("app-build.imageTag").await);
                });
            }
            self.started.notify_one();
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancel_during_stage() {
        let pipeline = Pipeline::from_yaml(USER_PIPELINE).unwrap();
        let started = Arc::new(tokio::sync::Notify::new());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let runner = runner(Stalled {
            started: started.clone(),
            waiter: std::sync::Mutex::new(Some(tx)),
        });

        let handle = runner.cancel_handle();
        tokio::spawn(async move {
            started.notified().await;
            handle.cancel();
        });

        let report = tokio::time::timeout(Duration::from_secs(10), runner.run(&pipeline, &quiet()))
            .await
            .expect("cancelled run did not finish")
            .unwrap();

        match &report.status {
            PipelineStatus::Failed { stage, .. } => assert_eq!(stage, "Build"),
            other => panic!("unexpected status: {other:?}"),
        }
        assert_eq!(report.stage("Source").unwrap().status, StageStatus::Succeeded);
        assert_eq!(report.stage("Build").unwrap().status, StageStatus::Failed);
        assert_eq!(report.action("app-build").unwrap().status, ActionStatus::Cancelled);
        assert!(matches!(
            report.action("app-build").unwrap().error,
            Some(DeployflowError::Cancelled)
        ));
        assert_eq!(report.stage("Deploy").unwrap().status, StageStatus::Pending);
        assert!(report
            .event_index(|e| matches!(e, RunEvent::Cancelled { stage } if stage == "Build"))
            .is_some());

        let waited = tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .expect("parameter wait was not released")
            .unwrap();
        assert!(matches!(waited, Err(DeployflowError::NeverExported { .. })));
    }

    #[tokio::test]
    async fn test_cancel_handle() {
        let handle = CancelHandle::new();
        assert!(!handle.is_cancelled());

        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        handle.cancel();

        task.await.unwrap();
        assert!(handle.is_cancelled());
    }
}
