// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! # deployflow - Continuous-Delivery Orchestrator
//!
//! `deployflow` runs staged source → build → deploy pipelines. Actions hand
//! results to each other through write-once artifacts, and values only known
//! at build time (such as an image tag) reach the deployment through a
//! registry of deferred parameters that is resolved at deploy time.
//!
//! ## Features
//!
//! - **Stage barrier** - actions of a stage run in parallel, stages in order
//! - **Write-once artifacts** - blocking reads, content hashes, run-scoped storage
//! - **Deferred parameters** - declare, export once, resolve when deploying
//! - **Template synthesis** - reviewable, versioned deployment templates
//! - **Idempotent deploys** - unchanged requests leave environments untouched
//!
//! ## Quick Start
//!
//! ```bash
//! # Check the pipeline
//! deployflow validate
//!
//! # Run it
//! deployflow run
//!
//! # Inspect previous runs
//! deployflow history
//! ```

pub mod artifacts;
pub mod audit;
pub mod cli;
pub mod collaborators;
pub mod deploy;
pub mod errors;
pub mod params;
pub mod pipeline;
pub mod template;
pub mod utils;

// Re-export commonly used types
pub use errors::{DeployflowError, DeployflowResult};
pub use pipeline::{Pipeline, PipelineRunner, RunReport, Stage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
