// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Validate command - check pipeline configuration

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;

use crate::pipeline::{Pipeline, PipelineValidator};
use crate::utils::{print_section, print_success, print_warning};

/// Run the validate command
pub async fn run(pipeline_path: PathBuf, verbose: bool) -> Result<()> {
    println!("{}", "Validating pipeline...".bold());
    println!();

    // Load pipeline
    let pipeline = match Pipeline::from_file(&pipeline_path) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("  {} Failed to load pipeline", "✗".red());
            eprintln!();
            return Err(e.into());
        }
    };

    print_success("Pipeline file parses");

    let validation = PipelineValidator::validate(&pipeline)?;

    // Source checkouts are resolved relative to the pipeline file
    let base = pipeline_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let missing_sources = PipelineValidator::validate_files(&pipeline, &base)?;

    if !validation.errors.is_empty() {
        print_section(&"Errors".red().bold().to_string());
        for error in &validation.errors {
            println!("  {} {}", "✗".red(), error);
        }
    }

    if !missing_sources.is_empty() {
        print_section(&"Missing sources".yellow().bold().to_string());
        for missing in &missing_sources {
            print_warning(missing);
        }
    }

    if !validation.warnings.is_empty() {
        print_section(&"Warnings".yellow().bold().to_string());
        for warning in &validation.warnings {
            print_warning(warning);
        }
    }

    if verbose {
        print_section("Pipeline summary");
        println!("  Name: {}", pipeline.name);
        println!("  Stages: {}", pipeline.stages.len());
        for stage in &pipeline.stages {
            println!("    - {}", stage.name);
            for action in &stage.actions {
                let io = format!(
                    "[in: {}] [out: {}]",
                    action.consumed_artifacts().join(", "),
                    action.outputs.join(", ")
                );
                println!("      {} ({}) {}", action.name, action.kind_name(), io.dimmed());
            }
        }
        let parameters = pipeline.declared_parameters();
        if !parameters.is_empty() {
            println!("  Deferred parameters:");
            for (name, exporter) in parameters {
                println!("    - {} {}", name, format!("(exported by {})", exporter).dimmed());
            }
        }
    }

    println!();

    if !validation.is_valid() {
        Err(miette::miette!("Pipeline validation failed"))
    } else if validation.has_warnings() || !missing_sources.is_empty() {
        println!("{}", "Pipeline is valid but has warnings.".yellow().bold());
        Ok(())
    } else {
        println!("{}", "Pipeline is valid!".green().bold());
        Ok(())
    }
}
