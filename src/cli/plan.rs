// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Plan command - show what a build would do

use colored::Colorize;
use std::path::PathBuf;

use super::{load_project, resolve_platform, store_dir, BuildOptions, OutputFormat};
use crate::cache::{ArtifactStore, FilesystemStore};
use crate::errors::StagehandResult;
use crate::pipeline::{ExecutionPlan, PlanStatus, Planner};
use crate::workspace::Workspace;

/// Run the plan command
///
/// Never creates the store; a missing store means nothing is cached.
pub async fn run(
    file: PathBuf,
    target: String,
    options: BuildOptions,
    format: OutputFormat,
    _verbose: bool,
) -> StagehandResult<()> {
    let project = load_project(&file)?;
    let settings = &project.file.settings;
    let platform = resolve_platform(options.platform.as_deref(), settings)?;
    let target = project.graph.target(&target)?;

    let store_root = store_dir(options.store.as_deref(), settings, &project.root)?;
    let workspace = Workspace::new(&project.root).excluding(&store_root);
    let store = if store_root.is_dir() {
        Some(FilesystemStore::new(&store_root)?)
    } else {
        None
    };

    let plan = Planner::new(&project.graph, &workspace, &platform)
        .preview(
            &target,
            store.as_ref().map(|s| s as &dyn ArtifactStore),
            true,
        )
        .await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
        OutputFormat::Text => print_text(&plan),
    }

    match plan.fatal() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

fn print_text(plan: &ExecutionPlan) {
    let platform = plan
        .platform
        .as_ref()
        .map(|p| p.to_string())
        .unwrap_or_default();
    println!(
        "{} {} for {}",
        "Plan".bold(),
        plan.target.to_string().cyan(),
        platform.cyan()
    );
    println!("{}", "═".repeat(40));

    for (i, entry) in plan.entries.iter().enumerate() {
        let fingerprint = entry
            .fingerprint
            .as_ref()
            .map(|f| f.full.short().to_string())
            .unwrap_or_default();

        let status = match &entry.status {
            PlanStatus::CacheHit => "cached".green(),
            PlanStatus::MustRun => match &entry.miss_reason {
                Some(reason) => format!("run ({})", reason).yellow(),
                None => "run".yellow(),
            },
            PlanStatus::PlatformSkip(reason) => format!("skip: {}", reason).dimmed(),
            PlanStatus::PlatformFatal(reason) => format!("fatal: {}", reason).red().bold(),
        };

        println!(
            "{:>3}. {:<24} {:<12} {}",
            i + 1,
            entry.stage,
            fingerprint.dimmed(),
            status
        );
    }

    println!();
    println!(
        "{} to run, {} cached, {} skipped",
        plan.count(|s| *s == PlanStatus::MustRun),
        plan.count(|s| *s == PlanStatus::CacheHit),
        plan.count(PlanStatus::is_skip)
    );
}
