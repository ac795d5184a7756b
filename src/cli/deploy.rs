// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Deploy command - apply a template to an environment directly

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;
use std::sync::Arc;

use crate::artifacts::short_hash;
use crate::audit::{AuditStore, FilesystemAuditStore};
use crate::collaborators::LocalTemplateEngine;
use crate::deploy::DeploymentExecutor;
use crate::errors::DeployflowError;
use crate::template::Template;
use crate::utils::{print_field, print_recovery, print_section, print_success};

/// Run the deploy command
pub async fn run(
    template_path: PathBuf,
    stack: String,
    params: Vec<String>,
    state_dir: PathBuf,
    max_resources: usize,
    _verbose: bool,
) -> Result<()> {
    let content =
        std::fs::read_to_string(&template_path).map_err(|e| DeployflowError::FileReadError {
            path: template_path.clone(),
            error: e.to_string(),
        })?;
    let template = Template::from_json(&content)?;
    let params = super::parse_params(&params).map_err(|e| miette::miette!("{}", e))?;

    let engine = LocalTemplateEngine::in_state_dir(&state_dir, max_resources)?;
    let executor = DeploymentExecutor::new(Arc::new(engine));

    let environment = match executor.deploy(&stack, &template, &params).await {
        Ok(environment) => environment,
        Err(e) => {
            eprintln!("  {} Deploy of '{}' failed", "✗".red(), stack);
            if e.preserves_environment() {
                eprintln!("  {}", "The environment was not modified.".dimmed());
            }
            print_recovery(&e);
            return Err(e.into());
        }
    };

    let audit = FilesystemAuditStore::in_state_dir(&state_dir)?;
    audit.record_template(&stack, &template).await?;

    if environment.changed {
        print_success(&format!("{} updated to version {}", stack, environment.version));
    } else {
        print_success(&format!("{} already at desired state", stack));
    }
    print_field("Template", short_hash(&environment.template_version));
    print_field("Fingerprint", short_hash(&environment.fingerprint));

    if !environment.outputs.is_empty() {
        print_section("Outputs");
        for (key, value) in &environment.outputs {
            println!("  {} = {}", key, value);
        }
    }

    Ok(())
}
