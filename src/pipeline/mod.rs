// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Pipeline definitions and execution
//!
//! This module defines the stage/action data structures, the dependency
//! graph between actions, validation, and the stage runner.

mod action;
mod dag;
mod definition;
mod runner;
mod validation;

pub use action::{ActionContext, ActionExecutor, ActionOutcome, StandardActions};
pub use dag::{DagBuilder, Dependency};
pub use definition::*;
pub use runner::{
    ActionReport, ActionStatus, CancelHandle, PipelineRunner, PipelineStatus, RunEvent,
    RunOptions, RunReport, StageReport, StageStatus,
};
pub use validation::{PipelineValidator, ValidationResult};
