// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Step executors
//!
//! A step executor runs one stage's command list against its input view
//! and either returns the stage's output tree or fails. The scheduler owns
//! caching, retries and ordering; executors only run steps.

mod shell;

pub use shell::ShellExecutor;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::StagehandResult;
use crate::pipeline::StageSpec;
use crate::policy::Platform;
use crate::tree::FileTree;

/// Everything an executor needs to run one attempt of a stage
pub struct StepRequest<'a> {
    pub stage: &'a StageSpec,
    /// Assembled input view
    pub inputs: &'a FileTree,
    pub platform: &'a Platform,
    /// 1-based attempt number
    pub attempt: u32,
    /// Cancelled when the build is cancelled
    pub cancel: CancellationToken,
}

/// A failed step attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Exit indicator of the failing command, if it exited
    pub exit_code: Option<i32>,
    /// Captured diagnostic output
    pub diagnostic: String,
    /// Worth retrying
    pub transient: bool,
    /// The attempt was interrupted by cancellation
    pub cancelled: bool,
}

impl StepFailure {
    /// A permanent failure
    pub fn new(diagnostic: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            diagnostic: diagnostic.into(),
            transient: false,
            cancelled: false,
        }
    }

    /// A failure that may succeed on retry
    pub fn transient(diagnostic: impl Into<String>) -> Self {
        Self {
            transient: true,
            ..Self::new(diagnostic)
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::new("cancelled")
        }
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.diagnostic)
    }
}

/// Trait for step executors
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run one attempt of a stage
    async fn execute(&self, request: StepRequest<'_>) -> Result<FileTree, StepFailure>;

    /// Check whether a stage can run on this machine
    async fn check_available(&self, stage: &StageSpec) -> StagehandResult<bool>;

    /// Executor name for diagnostics
    fn name(&self) -> &str;
}
