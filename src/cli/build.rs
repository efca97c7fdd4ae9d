// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Build command - plan, execute and compose a target

use colored::Colorize;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{load_project, resolve_platform, store_dir, BuildOptions};
use crate::cache::{
    evict, policy_from_settings, ArtifactStore, FilesystemStore, Fingerprint, SharedStore,
};
use crate::compose::Compositor;
use crate::errors::{StagehandError, StagehandResult};
use crate::executors::ShellExecutor;
use crate::pipeline::{
    apply_policy, default_jobs, BuildReport, PlanStatus, Planner, RetryPolicy, Scheduler,
    SchedulerOptions, StageState,
};
use crate::tree::FileTree;
use crate::utils::{create_progress_bar, create_spinner};
use crate::workspace::Workspace;

/// Run the build command
pub async fn run(
    file: PathBuf,
    target: String,
    options: BuildOptions,
    no_cache: bool,
    output: Option<PathBuf>,
    verbose: bool,
) -> StagehandResult<()> {
    let project = load_project(&file)?;
    let settings = &project.file.settings;
    let platform = resolve_platform(options.platform.as_deref(), settings)?;
    let target = project.graph.target(&target)?;

    let store_root = store_dir(options.store.as_deref(), settings, &project.root)?;
    let mut workspace = Workspace::new(&project.root).excluding(&store_root);
    if let Some(out) = &output {
        workspace = workspace.excluding(out);
    }
    let workspace = Arc::new(workspace);

    // Policy failures must surface before the store is created
    let resolved = apply_policy(&project.graph, project.graph.resolve(&target)?, &platform)?;
    if let Some(fatal) = resolved.fatal() {
        return Err(fatal);
    }

    let store = Arc::new(
        FilesystemStore::new(&store_root)?
            .with_pin_ttl(Duration::from_secs(settings.store.pin_ttl_secs)),
    );
    let spinner = create_spinner("Planning...");
    let planned = Planner::new(&project.graph, &workspace, &platform)
        .plan(&target, Some(store.as_ref()), !no_cache)
        .await;
    spinner.finish_and_clear();
    let plan = planned?;

    println!(
        "{} {} for {}: {} stage(s), {} cached, {} skipped",
        "Building".bold(),
        target.to_string().cyan(),
        platform.as_str().cyan(),
        plan.len(),
        plan.count(|s| *s == PlanStatus::CacheHit),
        plan.count(PlanStatus::is_skip),
    );
    if verbose {
        for entry in &plan.entries {
            if let Some(reason) = &entry.miss_reason {
                println!("  {} {}: {}", "→".dimmed(), entry.stage, reason.to_string().dimmed());
            }
        }
    }

    let pinned: Vec<Fingerprint> = plan
        .entries
        .iter()
        .filter_map(|e| e.fingerprint.as_ref().map(|f| f.full.clone()))
        .collect();
    let lease = store.pin(&pinned).await?;

    let policy = policy_from_settings(&settings.store.eviction);
    match evict(store.as_ref(), policy.as_ref()).await {
        Ok(report) if !report.removed.is_empty() => debug!(
            removed = report.removed.len(),
            freed = report.freed_bytes,
            "evicted artifacts"
        ),
        Ok(_) => {}
        Err(e) => warn!("eviction failed: {}", e),
    }

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling build");
                cancel.cancel();
            }
        })
    };

    let scheduler_options = SchedulerOptions {
        jobs: options.jobs.or(settings.jobs).unwrap_or_else(default_jobs),
        retry: RetryPolicy::from(&settings.retry),
        no_cache,
    };
    let runnable = plan.len() - plan.count(PlanStatus::is_skip);
    let progress = create_progress_bar(
        runnable as u64,
        "building",
        std::io::stderr().is_terminal(),
    );

    let shared = Arc::new(SharedStore::new(store.clone() as Arc<dyn ArtifactStore>));
    let graph = Arc::new(project.graph);
    let scheduler = Scheduler::new(
        graph.clone(),
        Arc::new(ShellExecutor::new()),
        shared,
        workspace,
    )
    .with_options(scheduler_options)
    .with_cancellation(cancel)
    .with_progress(progress);

    let outcome = scheduler.run(&plan).await;
    interrupt.abort();
    if let Err(e) = store.release(&lease).await {
        warn!("failed to release pin lease {}: {}", lease.id, e);
    }

    let report = outcome?;
    print_summary(&report);

    let artifacts = report.into_result().inspect_err(print_failures)?;
    let tree = Compositor::assemble(
        &plan.target,
        graph.composition(),
        &artifacts,
        &plan.skipped(),
    )?;

    match output {
        Some(dir) => {
            write_tree(tree.clone(), &dir).await?;
            println!(
                "{} {} files ({}) written to {}",
                "✓".green(),
                tree.len(),
                crate::cache::format_bytes(tree.size_bytes()),
                dir.display()
            );
        }
        None => println!(
            "{} {} files ({}), digest {}",
            "✓".green(),
            tree.len(),
            crate::cache::format_bytes(tree.size_bytes()),
            &tree.digest()[..12]
        ),
    }

    Ok(())
}

async fn write_tree(tree: FileTree, dir: &Path) -> StagehandResult<()> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || tree.write_to(&dir))
        .await
        .map_err(|e| StagehandError::Io {
            message: format!("writing output failed: {}", e),
        })?
}

fn print_summary(report: &BuildReport) {
    let failed = report
        .states
        .values()
        .filter(|s| matches!(s, StageState::Failed { .. }))
        .count();

    let mut line = format!(
        "{} executed, {} cached",
        report.executed(),
        report.cache_hits()
    );
    let skipped = report.skipped();
    if !skipped.is_empty() {
        line.push_str(&format!(", {} skipped ({})", skipped.len(), skipped.join(", ")));
    }
    if failed > 0 {
        line.push_str(&format!(", {} failed", failed));
    }

    println!(
        "{} in {:.2}s",
        if failed > 0 { line.red() } else { line.normal() },
        report.duration.as_secs_f64()
    );
}

fn print_failures(error: &StagehandError) {
    let StagehandError::ExecutionFailure { failures, .. } = error else {
        return;
    };

    for failure in failures {
        eprintln!();
        eprintln!(
            "{}",
            format!(
                "Stage '{}' failed after {} attempt(s):",
                failure.stage, failure.attempts
            )
            .red()
            .bold()
        );
        if !failure.diagnostic.is_empty() {
            eprintln!("{}", failure.diagnostic.dimmed());
        }
        if !failure.aborted.is_empty() {
            eprintln!("  aborted: {}", failure.aborted.join(", "));
        }
    }
}
