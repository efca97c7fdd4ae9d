// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Execution planning
//!
//! Turns a resolved target into an annotated plan: platform decisions,
//! fingerprints, and the predicted cache status of every stage. A plan with
//! a fatal platform decision is rejected before anything runs.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::dag::{StageGraph, FINAL_TARGET};
use crate::cache::{ArtifactMeta, ArtifactStore, Fingerprint, Fingerprinter, StageFingerprint};
use crate::errors::{StagehandError, StagehandResult};
use crate::policy::{Platform, PlatformPolicy, PolicyDecision};
use crate::workspace::Workspace;

/// What a build request asks for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Target {
    /// One stage's output tree
    Stage(String),
    /// The composed final tree
    Final,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stage(name) => write!(f, "{}", name),
            Self::Final => write!(f, "{}", FINAL_TARGET),
        }
    }
}

/// Planned status of a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum PlanStatus {
    MustRun,
    CacheHit,
    PlatformSkip(String),
    PlatformFatal(String),
}

impl PlanStatus {
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::PlatformSkip(_))
    }
}

/// Why a stage is predicted to miss the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissReason {
    /// No artifact of this stage has been stored
    NeverBuilt,
    /// Commands, declared settings, upstream outputs or stable inputs changed
    StableInputsChanged,
    /// Only volatile workspace inputs changed
    VolatileInputsChanged,
    /// Cache lookups were disabled for this build
    CacheDisabled,
}

impl std::fmt::Display for MissReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::NeverBuilt => "never built",
            Self::StableInputsChanged => "stable inputs changed",
            Self::VolatileInputsChanged => "volatile inputs changed",
            Self::CacheDisabled => "cache disabled",
        };
        write!(f, "{}", text)
    }
}

/// One stage in a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
    pub stage: String,
    /// Direct dependencies present in the plan
    pub dependencies: Vec<String>,
    pub status: PlanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<StageFingerprint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub miss_reason: Option<MissReason>,
}

impl PlanEntry {
    pub fn new(stage: &str, dependencies: Vec<String>) -> Self {
        Self {
            stage: stage.to_string(),
            dependencies,
            status: PlanStatus::MustRun,
            fingerprint: None,
            miss_reason: None,
        }
    }
}

/// Ordered, annotated set of stages needed for a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub target: Target,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Entries in topological order
    pub entries: Vec<PlanEntry>,
}

impl ExecutionPlan {
    pub fn new(target: Target, entries: Vec<PlanEntry>) -> Self {
        Self {
            target,
            platform: None,
            entries,
        }
    }

    pub fn get(&self, stage: &str) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| e.stage == stage)
    }

    /// Stage names in plan order
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.stage.as_str()).collect()
    }

    /// Stages dropped for this platform
    pub fn skipped(&self) -> HashSet<String> {
        self.entries
            .iter()
            .filter(|e| e.status.is_skip())
            .map(|e| e.stage.clone())
            .collect()
    }

    /// Count entries with a given status
    pub fn count(&self, predicate: impl Fn(&PlanStatus) -> bool) -> usize {
        self.entries.iter().filter(|e| predicate(&e.status)).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First fatal platform decision, as an error
    pub fn fatal(&self) -> Option<StagehandError> {
        self.entries.iter().find_map(|e| match &e.status {
            PlanStatus::PlatformFatal(reason) => Some(StagehandError::PolicyFatal {
                stage: e.stage.clone(),
                platform: self
                    .platform
                    .as_ref()
                    .map(|p| p.to_string())
                    .unwrap_or_default(),
                reason: reason.clone(),
            }),
            _ => None,
        })
    }
}

/// Apply platform policy to a resolved plan
///
/// Walks the plan in reverse topological order. A stage is kept when it is
/// a root of the target or a kept, non-skipped stage reads from it; stages
/// needed only by skipped stages are pruned. A skipped stage that something
/// kept still reads from, or that was requested directly, becomes fatal.
pub fn apply_policy(
    graph: &StageGraph,
    mut plan: ExecutionPlan,
    platform: &Platform,
) -> StagehandResult<ExecutionPlan> {
    let roots: HashSet<String> = graph.roots(&plan.target)?.into_iter().collect();
    let requested = match &plan.target {
        Target::Stage(name) => Some(name.clone()),
        Target::Final => None,
    };

    // stage -> first kept dependent that reads it
    let mut demanded_by: HashMap<String, String> = HashMap::new();
    let mut kept: Vec<PlanEntry> = Vec::with_capacity(plan.entries.len());

    for mut entry in plan.entries.into_iter().rev() {
        let demand = demanded_by.get(&entry.stage).cloned();
        if demand.is_none() && !roots.contains(&entry.stage) {
            debug!(stage = %entry.stage, "pruned: only needed by skipped stages");
            continue;
        }

        let spec = graph
            .spec(&entry.stage)
            .ok_or_else(|| StagehandError::UnknownTarget {
                target: entry.stage.clone(),
            })?;

        entry.status = match PlatformPolicy::evaluate(spec, platform) {
            PolicyDecision::Allowed => PlanStatus::MustRun,
            PolicyDecision::Fatal(reason) => PlanStatus::PlatformFatal(reason),
            PolicyDecision::Skipped(reason) => {
                if let Some(dependent) = &demand {
                    PlanStatus::PlatformFatal(format!(
                        "{} (required by '{}')",
                        reason, dependent
                    ))
                } else if requested.as_deref() == Some(entry.stage.as_str()) {
                    PlanStatus::PlatformFatal(reason)
                } else {
                    PlanStatus::PlatformSkip(reason)
                }
            }
        };

        if !entry.status.is_skip() {
            for dep in &entry.dependencies {
                demanded_by
                    .entry(dep.clone())
                    .or_insert_with(|| entry.stage.clone());
            }
        }

        kept.push(entry);
    }

    kept.reverse();
    let present: HashSet<String> = kept.iter().map(|e| e.stage.clone()).collect();
    for entry in &mut kept {
        entry.dependencies.retain(|d| present.contains(d));
    }

    plan.entries = kept;
    plan.platform = Some(platform.clone());
    Ok(plan)
}

/// Builds annotated execution plans
pub struct Planner<'a> {
    graph: &'a StageGraph,
    workspace: &'a Workspace,
    platform: &'a Platform,
}

impl<'a> Planner<'a> {
    pub fn new(graph: &'a StageGraph, workspace: &'a Workspace, platform: &'a Platform) -> Self {
        Self {
            graph,
            workspace,
            platform,
        }
    }

    /// Plan a target without failing on fatal platform decisions
    ///
    /// Fingerprints are only computed when no entry is fatal.
    pub async fn preview(
        &self,
        target: &Target,
        store: Option<&dyn ArtifactStore>,
        use_cache: bool,
    ) -> StagehandResult<ExecutionPlan> {
        let resolved = self.graph.resolve(target)?;
        let mut plan = apply_policy(self.graph, resolved, self.platform)?;
        if plan.fatal().is_some() {
            return Ok(plan);
        }

        self.fingerprint(&mut plan)?;
        self.annotate_cache(&mut plan, store, use_cache).await?;
        Ok(plan)
    }

    /// Plan a target, rejecting fatal platform decisions
    pub async fn plan(
        &self,
        target: &Target,
        store: Option<&dyn ArtifactStore>,
        use_cache: bool,
    ) -> StagehandResult<ExecutionPlan> {
        let plan = self.preview(target, store, use_cache).await?;
        match plan.fatal() {
            Some(error) => Err(error),
            None => Ok(plan),
        }
    }

    fn fingerprint(&self, plan: &mut ExecutionPlan) -> StagehandResult<()> {
        let fingerprinter = Fingerprinter::new(self.workspace, self.platform);
        let mut upstream: HashMap<String, Fingerprint> = HashMap::new();

        for entry in plan.entries.iter_mut() {
            if entry.status.is_skip() {
                continue;
            }
            let spec = self
                .graph
                .spec(&entry.stage)
                .ok_or_else(|| StagehandError::UnknownTarget {
                    target: entry.stage.clone(),
                })?;
            let fingerprint = fingerprinter.stage(spec, &upstream)?;
            upstream.insert(entry.stage.clone(), fingerprint.full.clone());
            entry.fingerprint = Some(fingerprint);
        }

        Ok(())
    }

    async fn annotate_cache(
        &self,
        plan: &mut ExecutionPlan,
        store: Option<&dyn ArtifactStore>,
        use_cache: bool,
    ) -> StagehandResult<()> {
        let stored: Vec<ArtifactMeta> = match store {
            Some(store) if use_cache => store.list().await?,
            _ => Vec::new(),
        };
        let by_fingerprint: HashSet<&Fingerprint> = stored.iter().map(|m| &m.fingerprint).collect();

        for entry in plan.entries.iter_mut() {
            let Some(fingerprint) = &entry.fingerprint else {
                continue;
            };

            if !use_cache {
                entry.miss_reason = Some(MissReason::CacheDisabled);
                continue;
            }

            if by_fingerprint.contains(&fingerprint.full) {
                entry.status = PlanStatus::CacheHit;
                continue;
            }

            // Stable digests carry no stage name, so any artifact with the
            // same one shares this stage's stable inputs
            entry.miss_reason = Some(if stored.iter().any(|m| m.stable == fingerprint.stable) {
                MissReason::VolatileInputsChanged
            } else if stored.iter().any(|m| m.built_for(&entry.stage)) {
                MissReason::StableInputsChanged
            } else {
                MissReason::NeverBuilt
            });
        }

        Ok(())
    }
}
