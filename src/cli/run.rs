// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Run command - execute the pipeline

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use crate::artifacts::{ArtifactBackend, FilesystemBackend, MemoryBackend};
use crate::audit::{AuditStore, FilesystemAuditStore};
use crate::pipeline::{
    Pipeline, PipelineRunner, PipelineStatus, PipelineValidator, RunOptions, StandardActions,
};
use crate::utils::{print_error, print_recovery, print_section, print_warning};

/// Run the pipeline
pub async fn run(pipeline_path: PathBuf, dry_run: bool, verbose: bool) -> Result<()> {
    let pipeline = Pipeline::from_file(&pipeline_path)?;

    // Validate pipeline
    let validation = PipelineValidator::validate(&pipeline)?;

    if !validation.is_valid() {
        eprintln!("{}", "Pipeline validation failed:".red().bold());
        for error in &validation.errors {
            print_error(error);
        }
        return Err(miette::miette!("Pipeline configuration is invalid"));
    }

    if validation.has_warnings() && verbose {
        eprintln!("{}", "Pipeline warnings:".yellow().bold());
        for warning in &validation.warnings {
            print_warning(warning);
        }
        eprintln!();
    }

    let working_dir = std::env::current_dir()
        .map_err(|e| miette::miette!("Failed to get current directory: {}", e))?;

    if !dry_run {
        let missing = PipelineValidator::validate_files(&pipeline, &working_dir)?;
        if !missing.is_empty() {
            eprintln!("{}", "Missing sources:".red().bold());
            for entry in &missing {
                print_error(entry);
            }
            return Err(miette::miette!("Source checkouts are missing"));
        }
    }

    let state_dir = working_dir.join(&pipeline.state.directory);
    let audit: Arc<dyn AuditStore> = Arc::new(FilesystemAuditStore::in_state_dir(&state_dir)?);
    let backend: Arc<dyn ArtifactBackend> = if pipeline.state.artifacts.persist {
        Arc::new(FilesystemBackend::in_state_dir(&state_dir)?)
    } else {
        Arc::new(MemoryBackend::new())
    };

    let actions = StandardActions::local(&pipeline, &working_dir)?.with_audit(audit.clone());
    let runner = PipelineRunner::new(Arc::new(actions), backend).with_audit(audit);

    // Ctrl-C fails the current stage and starts nothing further
    let cancel = runner.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let options = RunOptions {
        dry_run,
        verbose,
        quiet: false,
    };
    let result = runner.run(&pipeline, &options).await;
    interrupt.abort();
    let report = result?;

    if let PipelineStatus::Failed { stage, .. } = &report.status {
        if let Some(error) = report.failure() {
            eprintln!();
            eprintln!("{}", format!("Stage '{}' failed:", stage).red().bold());
            eprintln!("  {}", error);
            print_recovery(error);
        }
        return Err(miette::miette!("Pipeline execution failed"));
    }

    if !report.parameters.is_empty() {
        print_section("Parameters");
        for (name, value) in &report.parameters {
            println!("  {} = {}", name, value.cyan());
        }
    }

    for (name, environment) in &report.environments {
        if environment.outputs.is_empty() {
            continue;
        }
        print_section(&format!("Outputs of {}", name));
        for (key, value) in &environment.outputs {
            println!("  {} = {}", key, value);
        }
    }

    Ok(())
}
