// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Stage scheduler
//!
//! Executes an [`ExecutionPlan`] on a bounded worker pool. A stage becomes
//! ready once every stage it reads from has completed; ready stages are
//! dispatched in plan order. A failed stage aborts its transitive
//! dependents while independent branches run to completion.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use colored::Colorize;
use indicatif::ProgressBar;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::plan::{ExecutionPlan, PlanStatus, Target};
use super::retry::RetryPolicy;
use super::{InputRef, StageGraph, StageSpec};
use crate::cache::{Artifact, ArtifactOrigin, Fingerprint, Fingerprinter, ProduceError, SharedStore};
use crate::errors::{FailedStage, StagehandError, StagehandResult};
use crate::executors::{StepExecutor, StepFailure, StepRequest};
use crate::policy::Platform;
use crate::tree::{normalize_path, FileTree};
use crate::workspace::Workspace;

/// Artifacts of the completed stages, by stage name
pub type FinalArtifactSet = BTreeMap<String, Artifact>;

/// Scheduler options
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Maximum concurrently executing stages
    pub jobs: usize,
    /// Retry policy for transient failures
    pub retry: RetryPolicy,
    /// Skip cache lookups
    pub no_cache: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            retry: RetryPolicy::default(),
            no_cache: false,
        }
    }
}

/// Available parallelism, or 1 if it cannot be determined
pub fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Final state of a stage after a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageState {
    Pending,
    Completed {
        cache_hit: bool,
        attempts: u32,
        duration: Duration,
    },
    Skipped(String),
    Failed {
        diagnostic: String,
        exit_code: Option<i32>,
        attempts: u32,
    },
    Aborted {
        cause: String,
    },
    Cancelled,
}

impl StageState {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Outcome of a scheduler run
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub target: Target,
    /// Stage names in plan order
    pub order: Vec<String>,
    pub states: HashMap<String, StageState>,
    pub artifacts: FinalArtifactSet,
    pub duration: Duration,
}

impl BuildReport {
    pub fn state(&self, stage: &str) -> Option<&StageState> {
        self.states.get(stage)
    }

    pub fn is_success(&self) -> bool {
        self.states
            .values()
            .all(|s| matches!(s, StageState::Completed { .. } | StageState::Skipped(_)))
    }

    /// Stages served from the store without running
    pub fn cache_hits(&self) -> usize {
        self.states
            .values()
            .filter(|s| matches!(s, StageState::Completed { cache_hit: true, .. }))
            .count()
    }

    /// Stages whose steps actually ran to completion
    pub fn executed(&self) -> usize {
        self.states
            .values()
            .filter(|s| matches!(s, StageState::Completed { cache_hit: false, .. }))
            .count()
    }

    /// Stages dropped by platform policy
    pub fn skipped(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| matches!(self.states.get(*name), Some(StageState::Skipped(_))))
            .cloned()
            .collect()
    }

    /// Convert into the artifact set, or the build error
    ///
    /// Cancellation takes precedence over stage failures.
    pub fn into_result(self) -> StagehandResult<FinalArtifactSet> {
        let pending: Vec<String> = self
            .order
            .iter()
            .filter(|name| matches!(self.states.get(*name), Some(StageState::Cancelled)))
            .cloned()
            .collect();
        if !pending.is_empty() {
            return Err(StagehandError::Cancelled { pending });
        }

        let mut failures = Vec::new();
        for name in &self.order {
            if let Some(StageState::Failed {
                diagnostic,
                exit_code,
                attempts,
            }) = self.states.get(name)
            {
                let aborted = self
                    .order
                    .iter()
                    .filter(|other| {
                        matches!(
                            self.states.get(*other),
                            Some(StageState::Aborted { cause }) if cause == name
                        )
                    })
                    .cloned()
                    .collect();
                failures.push(FailedStage {
                    stage: name.clone(),
                    diagnostic: diagnostic.clone(),
                    exit_code: *exit_code,
                    attempts: *attempts,
                    aborted,
                });
            }
        }

        if failures.is_empty() {
            Ok(self.artifacts)
        } else {
            Err(StagehandError::execution_failure(failures))
        }
    }
}

/// Result of one dispatched stage
enum JobOutcome {
    Done {
        artifact: Artifact,
        cache_hit: bool,
        attempts: u32,
        duration: Duration,
    },
    Failed {
        diagnostic: String,
        exit_code: Option<i32>,
        attempts: u32,
    },
    Cancelled,
}

/// Everything a dispatched stage needs, owned so it can run on the pool
struct StageJob {
    spec: StageSpec,
    platform: Platform,
    upstream: HashMap<String, Artifact>,
    executor: Arc<dyn StepExecutor>,
    store: Arc<SharedStore>,
    workspace: Arc<Workspace>,
    retry: RetryPolicy,
    use_cache: bool,
    cancel: CancellationToken,
}

/// Stage scheduler
pub struct Scheduler {
    graph: Arc<StageGraph>,
    executor: Arc<dyn StepExecutor>,
    store: Arc<SharedStore>,
    workspace: Arc<Workspace>,
    options: SchedulerOptions,
    cancel: CancellationToken,
    progress: ProgressBar,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(
        graph: Arc<StageGraph>,
        executor: Arc<dyn StepExecutor>,
        store: Arc<SharedStore>,
        workspace: Arc<Workspace>,
    ) -> Self {
        Self {
            graph,
            executor,
            store,
            workspace,
            options: SchedulerOptions::default(),
            cancel: CancellationToken::new(),
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Report per-stage progress on a progress bar
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Token that cancels this scheduler's runs
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute a plan
    pub async fn run(&self, plan: &ExecutionPlan) -> StagehandResult<BuildReport> {
        if let Some(fatal) = plan.fatal() {
            return Err(fatal);
        }
        self.check_executor(plan).await?;

        let start = Instant::now();
        let platform = plan.platform.clone().unwrap_or_else(Platform::host);
        let jobs = self.options.jobs.max(1);

        let order: Vec<String> = plan.entries.iter().map(|e| e.stage.clone()).collect();
        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let mut states: HashMap<String, StageState> = HashMap::new();
        let mut remaining: HashMap<String, usize> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut ready: BTreeSet<usize> = BTreeSet::new();

        for (idx, entry) in plan.entries.iter().enumerate() {
            if let PlanStatus::PlatformSkip(reason) = &entry.status {
                states.insert(entry.stage.clone(), StageState::Skipped(reason.clone()));
                continue;
            }

            states.insert(entry.stage.clone(), StageState::Pending);
            let mut count = 0;
            for dep in &entry.dependencies {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(entry.stage.clone());
                count += 1;
            }
            remaining.insert(entry.stage.clone(), count);
            if count == 0 {
                ready.insert(idx);
            }
        }

        self.progress.set_length(remaining.len() as u64);

        let mut artifacts: HashMap<String, Artifact> = HashMap::new();
        let mut set: JoinSet<(String, JobOutcome)> = JoinSet::new();

        loop {
            while set.len() < jobs && !self.cancel.is_cancelled() {
                let Some(idx) = ready.pop_first() else {
                    break;
                };
                let name = order[idx].clone();
                let job = self.prepare(&name, &platform, &artifacts)?;
                debug!(stage = %name, "dispatching");
                self.progress.set_message(name.clone());
                Self::dispatch(&mut set, name, job);
            }

            let Some(joined) = set.join_next().await else {
                break;
            };
            let (name, outcome) = joined.map_err(|e| StagehandError::Io {
                message: format!("scheduler task failed: {}", e),
            })?;

            match outcome {
                JobOutcome::Done {
                    artifact,
                    cache_hit,
                    attempts,
                    duration,
                } => {
                    self.report_done(&name, cache_hit, duration);
                    artifacts.insert(name.clone(), artifact);
                    states.insert(
                        name.clone(),
                        StageState::Completed {
                            cache_hit,
                            attempts,
                            duration,
                        },
                    );

                    for next in dependents.get(&name).into_iter().flatten() {
                        if let Some(count) = remaining.get_mut(next) {
                            *count = count.saturating_sub(1);
                            let is_pending = matches!(states.get(next), Some(StageState::Pending));
                            if *count == 0 && is_pending {
                                if let Some(idx) = position.get(next.as_str()) {
                                    ready.insert(*idx);
                                }
                            }
                        }
                    }
                }
                JobOutcome::Failed {
                    diagnostic,
                    exit_code,
                    attempts,
                } => {
                    self.progress.println(format!(
                        "  {} {} failed",
                        "✗".red(),
                        name.bold()
                    ));
                    warn!(stage = %name, attempts, "stage failed: {}", diagnostic);
                    states.insert(
                        name.clone(),
                        StageState::Failed {
                            diagnostic,
                            exit_code,
                            attempts,
                        },
                    );
                    self.abort_dependents(&name, &dependents, &mut states);
                }
                JobOutcome::Cancelled => {
                    states.insert(name.clone(), StageState::Cancelled);
                }
            }
            self.progress.inc(1);
        }

        if self.cancel.is_cancelled() {
            for state in states.values_mut() {
                if *state == StageState::Pending {
                    *state = StageState::Cancelled;
                }
            }
        }
        self.progress.finish_and_clear();

        let artifacts: FinalArtifactSet = artifacts.into_iter().collect();
        Ok(BuildReport {
            target: plan.target.clone(),
            order,
            states,
            artifacts,
            duration: start.elapsed(),
        })
    }

    /// Fail before dispatch if a stage predicted to run cannot run here
    async fn check_executor(&self, plan: &ExecutionPlan) -> StagehandResult<()> {
        for entry in &plan.entries {
            if entry.status.is_skip() || entry.status == PlanStatus::CacheHit {
                continue;
            }
            let Some(spec) = self.graph.spec(&entry.stage) else {
                continue;
            };
            if !self.executor.check_available(spec).await? {
                return Err(StagehandError::ExecutorUnavailable {
                    stage: entry.stage.clone(),
                    reason: format!(
                        "the {} executor cannot run it (shell '{}')",
                        self.executor.name(),
                        spec.shell
                    ),
                });
            }
        }
        Ok(())
    }

    fn prepare(
        &self,
        name: &str,
        platform: &Platform,
        artifacts: &HashMap<String, Artifact>,
    ) -> StagehandResult<StageJob> {
        let spec = self
            .graph
            .spec(name)
            .ok_or_else(|| StagehandError::UnknownTarget {
                target: name.to_string(),
            })?
            .clone();

        let upstream = spec
            .referenced_stages()
            .into_iter()
            .filter_map(|producer| {
                artifacts
                    .get(producer)
                    .map(|a| (producer.to_string(), a.clone()))
            })
            .collect();

        Ok(StageJob {
            spec,
            platform: platform.clone(),
            upstream,
            executor: self.executor.clone(),
            store: self.store.clone(),
            workspace: self.workspace.clone(),
            retry: self.options.retry.clone(),
            use_cache: !self.options.no_cache,
            cancel: self.cancel.child_token(),
        })
    }

    /// Spawn a stage on the pool
    ///
    /// The stage runs in its own task so a panic surfaces as a failed
    /// stage instead of tearing down the driver.
    fn dispatch(set: &mut JoinSet<(String, JobOutcome)>, name: String, job: StageJob) {
        set.spawn(async move {
            let outcome = match tokio::spawn(run_stage(job)).await {
                Ok(outcome) => outcome,
                Err(e) => JobOutcome::Failed {
                    diagnostic: format!("stage task panicked: {}", e),
                    exit_code: None,
                    attempts: 1,
                },
            };
            (name, outcome)
        });
    }

    fn abort_dependents(
        &self,
        failed: &str,
        dependents: &HashMap<String, Vec<String>>,
        states: &mut HashMap<String, StageState>,
    ) {
        let mut stack: Vec<&String> = dependents.get(failed).into_iter().flatten().collect();
        while let Some(next) = stack.pop() {
            if states.get(next) != Some(&StageState::Pending) {
                continue;
            }
            debug!(stage = %next, cause = %failed, "aborted");
            self.progress.println(format!(
                "  {} {} {}",
                "○".dimmed(),
                next.dimmed(),
                format!("(aborted: {} failed)", failed).dimmed()
            ));
            states.insert(
                next.clone(),
                StageState::Aborted {
                    cause: failed.to_string(),
                },
            );
            self.progress.inc(1);
            stack.extend(dependents.get(next).into_iter().flatten());
        }
    }

    fn report_done(&self, name: &str, cache_hit: bool, duration: Duration) {
        if cache_hit {
            info!(stage = %name, "cache hit");
            self.progress.println(format!(
                "  {} {} {}",
                "✓".green(),
                name.bold(),
                "(cached)".dimmed()
            ));
        } else {
            info!(stage = %name, "completed in {:.2}s", duration.as_secs_f64());
            self.progress.println(format!(
                "  {} {} ({:.2}s)",
                "✓".green(),
                name.bold(),
                duration.as_secs_f64()
            ));
        }
    }
}

/// Assemble the input view a stage declares
pub fn assemble_inputs(
    spec: &StageSpec,
    workspace: &Workspace,
    upstream: &HashMap<String, Artifact>,
) -> StagehandResult<FileTree> {
    let mut view = FileTree::new();

    for input in &spec.inputs {
        let dest = normalize_path(input.dest())?;
        match input {
            InputRef::Workspace { path, .. } => {
                let snapshot = workspace.snapshot(path, &dest)?;
                view.overlay(&snapshot);
            }
            InputRef::Stage {
                stage: producer,
                path,
                ..
            } => {
                let artifact =
                    upstream
                        .get(producer)
                        .ok_or_else(|| StagehandError::UnknownReference {
                            stage: spec.name.clone(),
                            reference: producer.clone(),
                        })?;
                let tree = artifact.tree().subtree(path, &dest)?.ok_or_else(|| {
                    StagehandError::MissingSource {
                        stage: producer.clone(),
                        path: path.clone(),
                    }
                })?;
                view.overlay(&tree);
            }
        }
    }

    Ok(view)
}

async fn run_stage(job: StageJob) -> JobOutcome {
    let start = Instant::now();

    let upstream_fingerprints: HashMap<String, Fingerprint> = job
        .upstream
        .iter()
        .map(|(name, a)| (name.clone(), a.fingerprint().clone()))
        .collect();
    let fingerprint = match Fingerprinter::new(&job.workspace, &job.platform)
        .stage(&job.spec, &upstream_fingerprints)
    {
        Ok(fp) => fp,
        Err(e) => {
            return JobOutcome::Failed {
                diagnostic: e.to_string(),
                exit_code: None,
                attempts: 0,
            }
        }
    };

    let origin = ArtifactOrigin {
        stage: job.spec.name.clone(),
        stable: fingerprint.stable.clone(),
    };
    let attempts = AtomicU32::new(0);
    let job_ref = &job;
    let attempts_ref = &attempts;
    let short = fingerprint.full.short().to_string();

    let result = job
        .store
        .get_or_produce(&fingerprint.full, &origin, job.use_cache, move || async move {
            debug!(stage = %job_ref.spec.name, fingerprint = %short, "cache miss");
            let inputs = assemble_inputs(&job_ref.spec, &job_ref.workspace, &job_ref.upstream)
                .map_err(|e| StepFailure::new(e.to_string()))?;
            execute_with_retry(job_ref, &inputs, attempts_ref).await
        })
        .await;

    let attempts = attempts.load(Ordering::SeqCst);
    match result {
        Ok(resolution) => JobOutcome::Done {
            cache_hit: resolution.is_hit(),
            artifact: resolution.into_artifact(),
            attempts,
            duration: start.elapsed(),
        },
        Err(ProduceError::Producer(failure)) if failure.cancelled => JobOutcome::Cancelled,
        Err(ProduceError::Producer(failure)) => JobOutcome::Failed {
            diagnostic: failure.diagnostic,
            exit_code: failure.exit_code,
            attempts,
        },
        Err(ProduceError::Store(e)) => JobOutcome::Failed {
            diagnostic: e.to_string(),
            exit_code: None,
            attempts,
        },
    }
}

async fn execute_with_retry(
    job: &StageJob,
    inputs: &FileTree,
    attempts: &AtomicU32,
) -> Result<FileTree, StepFailure> {
    let mut attempt = 0;
    loop {
        if job.cancel.is_cancelled() {
            return Err(StepFailure::cancelled());
        }

        attempt += 1;
        attempts.store(attempt, Ordering::SeqCst);

        let request = StepRequest {
            stage: &job.spec,
            inputs,
            platform: &job.platform,
            attempt,
            cancel: job.cancel.clone(),
        };

        match job.executor.execute(request).await {
            Ok(tree) => return Ok(tree),
            Err(failure) if failure.cancelled => return Err(failure),
            Err(failure) if failure.transient && job.retry.should_retry(attempt) => {
                let delay = job.retry.delay_for_attempt(attempt);
                warn!(
                    stage = %job.spec.name,
                    attempt,
                    "transient failure, retrying in {}ms: {}",
                    delay.as_millis(),
                    failure.diagnostic
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = job.cancel.cancelled() => return Err(StepFailure::cancelled()),
                }
            }
            Err(failure) => return Err(failure),
        }
    }
}
