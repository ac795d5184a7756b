// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! CLI command definitions and handlers
//!
//! Defines the command-line interface for deployflow.

pub mod deploy;
pub mod graph;
pub mod history;
pub mod run;
pub mod synth;
pub mod validate;

use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Continuous-delivery orchestrator
///
/// Runs source → build → deploy pipelines whose deployment parameters are
/// bound late, at deploy time.
#[derive(Parser, Debug)]
#[clap(
    name = "deployflow",
    version,
    about = "Continuous-delivery orchestrator with late-bound deployment parameters",
    long_about = None,
    after_help = "Examples:\n\
        deployflow validate                        Check .deployflow.yaml\n\
        deployflow run                             Execute the pipeline\n\
        deployflow graph --format mermaid          Show action dependencies\n\
        deployflow synth infra/ --stack Web        Print a synthesized template\n\
        deployflow history                         List previous runs\n\n\
        See 'deployflow <command> --help' for more information on a specific command."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Change to directory before executing
    #[clap(short = 'C', long, global = true, value_name = "DIR")]
    pub directory: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline
    Run {
        /// Pipeline file
        #[clap(short, long, default_value = ".deployflow.yaml")]
        pipeline: PathBuf,

        /// Dry run (show what would be done)
        #[clap(long)]
        dry_run: bool,
    },

    /// Validate pipeline configuration
    Validate {
        /// Pipeline file to validate
        #[clap(default_value = ".deployflow.yaml")]
        pipeline: PathBuf,
    },

    /// Show pipeline as a graph
    Graph {
        /// Pipeline file
        #[clap(default_value = ".deployflow.yaml")]
        pipeline: PathBuf,

        /// Output format
        #[clap(short, long, value_enum, default_value_t = GraphFormat::Text)]
        format: GraphFormat,
    },

    /// Synthesize a deployment template from a source directory
    Synth {
        /// Directory holding the environment description
        source: PathBuf,

        /// Environment description inside the source directory
        #[clap(short, long, default_value = "environment.yaml")]
        environment: String,

        /// Template (stack) name
        #[clap(short, long, default_value = "Stack")]
        stack: String,

        /// Image registry host
        #[clap(long, default_value = "registry.local")]
        registry: String,

        /// Directory to write `<stack>.template.json` to (default: stdout)
        #[clap(short, long)]
        output: Option<PathBuf>,
    },

    /// Deploy a template outside of a pipeline
    Deploy {
        /// Template file
        template: PathBuf,

        /// Environment (stack) name
        #[clap(short, long)]
        stack: String,

        /// Parameter values as KEY=VALUE
        #[clap(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// State directory
        #[clap(long, default_value = ".deployflow")]
        state_dir: PathBuf,

        /// Maximum resources per environment
        #[clap(long, default_value = "200")]
        max_resources: usize,
    },

    /// Show previous pipeline runs
    History {
        /// Show a single run
        run_id: Option<String>,

        /// State directory
        #[clap(long, default_value = ".deployflow")]
        state_dir: PathBuf,

        /// Output format
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

/// Output format for listing commands
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Graph output format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Text,
    Dot,
    Mermaid,
}

/// Split `KEY=VALUE` parameter arguments
pub fn parse_params(args: &[String]) -> Result<BTreeMap<String, String>, String> {
    let mut params = BTreeMap::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| format!("Expected KEY=VALUE, got '{}'", arg))?;
        if key.is_empty() {
            return Err(format!("Empty parameter name in '{}'", arg));
        }
        params.insert(key.to_string(), value.to_string());
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params() {
        let params = parse_params(&["ImageTag=abc=1".into(), "Env=prod".into()]).unwrap();
        assert_eq!(params.get("ImageTag").map(String::as_str), Some("abc=1"));
        assert_eq!(params.len(), 2);

        assert!(parse_params(&["novalue".into()]).is_err());
        assert!(parse_params(&["=x".into()]).is_err());
    }

    #[test]
    fn test_cli_parses_deploy() {
        let cli = Cli::try_parse_from([
            "deployflow",
            "deploy",
            "Web.template.json",
            "--stack",
            "Web",
            "--param",
            "ImageTag=abc123",
        ])
        .unwrap();

        match cli.command {
            Commands::Deploy { stack, params, .. } => {
                assert_eq!(stack, "Web");
                assert_eq!(params, vec!["ImageTag=abc123"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
