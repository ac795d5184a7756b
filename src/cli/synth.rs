// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Synth command - synthesize a template without running a pipeline

use miette::Result;
use std::path::PathBuf;

use crate::artifacts::{short_hash, ArtifactPayload};
use crate::collaborators::LocalSourceProvider;
use crate::errors::DeployflowError;
use crate::template::{synthesize, template_file_name};
use crate::utils::{print_field, print_success};

/// Run the synth command
pub async fn run(
    source: PathBuf,
    environment: String,
    stack: String,
    registry: String,
    output: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    if !source.is_dir() {
        return Err(miette::miette!(
            "Source directory not found: {}",
            source.display()
        ));
    }

    let payload = ArtifactPayload {
        files: LocalSourceProvider::collect_files(&source)?,
        metadata: Default::default(),
    };
    let slot = source.display().to_string();
    let template = synthesize(&payload, &slot, &environment, &stack, &registry)?;

    let Some(dir) = output else {
        print!("{}", template.to_json());
        return Ok(());
    };

    std::fs::create_dir_all(&dir).map_err(|e| DeployflowError::FileWriteError {
        path: dir.clone(),
        error: e.to_string(),
    })?;
    let path = dir.join(template_file_name(&stack));
    std::fs::write(&path, template.to_json()).map_err(|e| DeployflowError::FileWriteError {
        path: path.clone(),
        error: e.to_string(),
    })?;

    print_success(&format!("Wrote {}", path.display()));
    if verbose {
        print_field("Version", short_hash(&template.fingerprint()));
        print_field("Placeholders", &template.placeholders().join(", "));
        print_field("Resources", &template.resource_ids().len().to_string());
    }

    Ok(())
}
