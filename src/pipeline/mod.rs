// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Build definitions, stage graph, planning and scheduling
//!
//! This module defines the build file model, resolves it into a stage
//! graph, plans a target against a platform and a store, and runs the plan.

mod dag;
mod definition;
mod executor;
mod plan;
mod retry;
mod validation;

pub use dag::{StageGraph, FINAL_TARGET};
pub use definition::*;
pub use executor::{
    assemble_inputs, default_jobs, BuildReport, FinalArtifactSet, Scheduler, SchedulerOptions,
    StageState,
};
pub use plan::{apply_policy, ExecutionPlan, MissReason, PlanEntry, PlanStatus, Planner, Target};
pub use retry::RetryPolicy;
pub use validation::{BuildValidator, ValidationResult};
