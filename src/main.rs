// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! deployflow - Continuous-Delivery Orchestrator
//!
//! Runs source → build → deploy pipelines with late-bound deployment parameters.

use clap::Parser;
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deployflow::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deployflow=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    // Change to specified directory if provided
    if let Some(ref dir) = cli.directory {
        std::env::set_current_dir(dir).map_err(|e| {
            miette::miette!("Failed to change to directory '{}': {}", dir.display(), e)
        })?;
    }

    // Dispatch to command handlers
    match cli.command {
        Commands::Run { pipeline, dry_run } => {
            deployflow::cli::run::run(pipeline, dry_run, cli.verbose).await
        }
        Commands::Validate { pipeline } => {
            deployflow::cli::validate::run(pipeline, cli.verbose).await
        }
        Commands::Graph { pipeline, format } => {
            deployflow::cli::graph::run(pipeline, format, cli.verbose).await
        }
        Commands::Synth {
            source,
            environment,
            stack,
            registry,
            output,
        } => {
            deployflow::cli::synth::run(source, environment, stack, registry, output, cli.verbose)
                .await
        }
        Commands::Deploy {
            template,
            stack,
            params,
            state_dir,
            max_resources,
        } => {
            deployflow::cli::deploy::run(
                template,
                stack,
                params,
                state_dir,
                max_resources,
                cli.verbose,
            )
            .await
        }
        Commands::History {
            run_id,
            state_dir,
            format,
        } => deployflow::cli::history::run(run_id, state_dir, format, cli.verbose).await,
    }
}
