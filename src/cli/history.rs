// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! History command - show recorded pipeline runs

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;

use super::OutputFormat;
use crate::artifacts::short_hash;
use crate::audit::{AuditStore, FilesystemAuditStore, RunRecord};
use crate::utils::{format_age, format_duration, print_field, print_header, print_section};

/// Run the history command
pub async fn run(
    run_id: Option<String>,
    state_dir: PathBuf,
    format: OutputFormat,
    _verbose: bool,
) -> Result<()> {
    let audit = FilesystemAuditStore::in_state_dir(&state_dir)?;

    if let Some(id) = run_id {
        let record = audit
            .load_run(&id)
            .await?
            .ok_or_else(|| miette::miette!("No run with id '{}'", id))?;

        match format {
            OutputFormat::Json => println!(
                "{}",
                serde_json::to_string_pretty(&record).map_err(|e| miette::miette!("{}", e))?
            ),
            OutputFormat::Text => print_run(&record),
        }
        return Ok(());
    }

    let runs = audit.list_runs().await?;
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&runs).map_err(|e| miette::miette!("{}", e))?
        ),
        OutputFormat::Text => {
            if runs.is_empty() {
                println!("No runs recorded in {}", state_dir.display());
                return Ok(());
            }

            print_header("Pipeline runs");
            for record in runs.iter().rev() {
                let status = if record.status == "succeeded" {
                    "✓".green()
                } else {
                    "✗".red()
                };
                println!(
                    "  {} {} {} {} {}",
                    status,
                    record.run_id,
                    record.pipeline.bold(),
                    format_age(record.started_at).dimmed(),
                    format_duration(record.duration()).dimmed()
                );
            }
        }
    }

    Ok(())
}

fn print_run(record: &RunRecord) {
    print_header(&format!("Run {}", record.run_id));
    print_field("Pipeline", &record.pipeline);
    print_field("Status", &record.status);
    print_field("Started", &format_age(record.started_at));
    print_field("Duration", &format_duration(record.duration()));
    if let Some(stage) = &record.failed_stage {
        print_field("Failed stage", stage);
    }
    if let Some(reason) = &record.reason {
        print_field("Reason", reason);
    }

    if !record.parameters.is_empty() {
        print_section("Parameters");
        for (name, value) in &record.parameters {
            println!("  {} = {}", name, value);
        }
    }

    if !record.template_versions.is_empty() {
        print_section("Deployed templates");
        for (environment, version) in &record.template_versions {
            println!("  {} {}", environment, short_hash(version).dimmed());
        }
    }
}
