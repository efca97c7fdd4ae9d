// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Error types for planning, execution and composition
//!
//! Every error carries its kind, the offending stage (where there is one)
//! and the underlying diagnostic, so the CLI never reports a bare exit code.

mod recovery;

pub use recovery::RecoverySuggestion;

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for stagehand operations
pub type StagehandResult<T> = Result<T, StagehandError>;

/// A stage that failed during execution, together with the stages it aborted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedStage {
    /// Stage whose step execution failed
    pub stage: String,
    /// Diagnostic output captured from the step executor
    pub diagnostic: String,
    /// Exit indicator reported by the executor, if any
    pub exit_code: Option<i32>,
    /// Number of attempts made (including retries)
    pub attempts: u32,
    /// Transitive dependents that were never dispatched
    pub aborted: Vec<String>,
}

impl FailedStage {
    /// The failure and its aborted dependents as individual errors
    pub fn to_errors(&self) -> Vec<StagehandError> {
        let mut errors = vec![StagehandError::StepExecutionFailure {
            stage: self.stage.clone(),
            diagnostic: self.diagnostic.clone(),
            exit_code: self.exit_code,
            attempts: self.attempts,
        }];
        errors.extend(self.aborted.iter().map(|dependent| StagehandError::Aborted {
            stage: dependent.clone(),
            cause: self.stage.clone(),
        }));
        errors
    }
}

/// Main error type for stagehand
#[derive(Error, Debug, Diagnostic)]
pub enum StagehandError {
    // ─────────────────────────────────────────────────────────────────────────
    // Planning Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Stage '{stage}' is declared more than once")]
    #[diagnostic(
        code(stagehand::duplicate_stage),
        help("Stage names must be unique within a build file")
    )]
    DuplicateStage { stage: String },

    #[error("Stage '{stage}' references undeclared stage '{reference}'")]
    #[diagnostic(
        code(stagehand::unknown_reference),
        help("Check that '{reference}' is declared in your build file")
    )]
    UnknownReference { stage: String, reference: String },

    #[error("Unknown build target '{target}'")]
    #[diagnostic(
        code(stagehand::unknown_target),
        help("Run 'stagehand graph' to list the declared stages")
    )]
    UnknownTarget { target: String },

    #[error("Dependency cycle detected between stages: {}", .stages.join(", "))]
    #[diagnostic(
        code(stagehand::cycle_detected),
        help("Review the stage inputs to remove the cycle")
    )]
    CycleDetected { stages: Vec<String> },

    #[error("Stage '{stage}' cannot be built for platform '{platform}': {reason}")]
    #[diagnostic(code(stagehand::policy_fatal))]
    PolicyFatal {
        stage: String,
        platform: String,
        reason: String,
    },

    #[error("Invalid build file: {reason}")]
    #[diagnostic(code(stagehand::invalid_build_file))]
    InvalidBuildFile {
        reason: String,
        #[help]
        help: Option<String>,
    },

    #[error("Build file not found: {path}")]
    #[diagnostic(
        code(stagehand::build_file_not_found),
        help("Create a stagehand.yaml or pass --file")
    )]
    BuildFileNotFound { path: PathBuf },

    #[error("Invalid platform identifier '{platform}'")]
    #[diagnostic(
        code(stagehand::invalid_platform),
        help("Use 'os/arch[/variant]' or a bare arch, e.g. linux/amd64 or arm64")
    )]
    InvalidPlatform { platform: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Execution Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Stage '{stage}' failed after {attempts} attempt(s)")]
    #[diagnostic(code(stagehand::step_execution_failure))]
    StepExecutionFailure {
        stage: String,
        /// Output captured from the step executor
        diagnostic: String,
        exit_code: Option<i32>,
        attempts: u32,
    },

    #[error("Stage '{stage}' cannot run here: {reason}")]
    #[diagnostic(
        code(stagehand::executor_unavailable),
        help("Install the missing tool or change the stage's 'shell'")
    )]
    ExecutorUnavailable { stage: String, reason: String },

    #[error("Stage '{stage}' was aborted because '{cause}' failed")]
    #[diagnostic(code(stagehand::aborted))]
    Aborted { stage: String, cause: String },

    #[error("{} stage(s) failed: {}", .failures.len(), .failures.iter().map(|f| f.stage.as_str()).collect::<Vec<_>>().join(", "))]
    #[diagnostic(
        code(stagehand::execution_failure),
        help("Successful stages stay cached; fix the failures and rebuild")
    )]
    ExecutionFailure {
        failures: Vec<FailedStage>,
        /// One `StepExecutionFailure` per failed stage, then its `Aborted` dependents
        #[related]
        errors: Vec<StagehandError>,
    },

    #[error("Build cancelled")]
    #[diagnostic(code(stagehand::cancelled))]
    Cancelled { pending: Vec<String> },

    // ─────────────────────────────────────────────────────────────────────────
    // Composition Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Stages '{first}' and '{second}' both write '{path}'")]
    #[diagnostic(
        code(stagehand::path_collision),
        help("Mark the later composition entry with 'override: true' if it should win")
    )]
    PathCollision {
        first: String,
        second: String,
        path: String,
    },

    #[error("Path '{path}' not found in the output of stage '{stage}'")]
    #[diagnostic(code(stagehand::missing_source))]
    MissingSource { stage: String, path: String },

    #[error("Invalid path '{path}': {reason}")]
    #[diagnostic(code(stagehand::invalid_path))]
    InvalidPath { path: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Store Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Artifact store error: {message}")]
    #[diagnostic(code(stagehand::store_error))]
    Store { message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // IO/System Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Failed to read '{path}': {error}")]
    #[diagnostic(code(stagehand::file_read_error))]
    FileRead { path: PathBuf, error: String },

    #[error("IO error: {message}")]
    #[diagnostic(code(stagehand::io_error))]
    Io { message: String },

    #[error("YAML parsing error: {message}")]
    #[diagnostic(code(stagehand::yaml_error))]
    Yaml { message: String },

    #[error("JSON parsing error: {message}")]
    #[diagnostic(code(stagehand::json_error))]
    Json { message: String },

    #[error("TOML parsing error: {message}")]
    #[diagnostic(code(stagehand::toml_error))]
    Toml { message: String },

    #[error("Glob pattern error: {message}")]
    #[diagnostic(code(stagehand::glob_error))]
    GlobPattern { message: String },
}

impl From<std::io::Error> for StagehandError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_yaml::Error> for StagehandError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml { message: e.to_string() }
    }
}

impl From<serde_json::Error> for StagehandError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json { message: e.to_string() }
    }
}

impl From<toml::de::Error> for StagehandError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml { message: e.to_string() }
    }
}

impl From<glob::PatternError> for StagehandError {
    fn from(e: glob::PatternError) -> Self {
        Self::GlobPattern { message: e.to_string() }
    }
}

/// Broad error classes, each mapped to a distinct process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Planning,
    PolicyFatal,
    Execution,
    Composition,
    Cancelled,
    Other,
}

impl ErrorClass {
    /// Process exit status for this class
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Planning => 2,
            Self::PolicyFatal => 3,
            Self::Execution => 4,
            Self::Composition => 5,
            Self::Cancelled => 130,
            Self::Other => 1,
        }
    }
}

impl StagehandError {
    /// Classify this error for exit-status reporting
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::DuplicateStage { .. }
            | Self::UnknownReference { .. }
            | Self::UnknownTarget { .. }
            | Self::CycleDetected { .. }
            | Self::InvalidBuildFile { .. }
            | Self::BuildFileNotFound { .. }
            | Self::InvalidPlatform { .. } => ErrorClass::Planning,
            Self::PolicyFatal { .. } => ErrorClass::PolicyFatal,
            Self::StepExecutionFailure { .. }
            | Self::ExecutorUnavailable { .. }
            | Self::Aborted { .. }
            | Self::ExecutionFailure { .. } => ErrorClass::Execution,
            Self::PathCollision { .. } | Self::MissingSource { .. } => ErrorClass::Composition,
            Self::Cancelled { .. } => ErrorClass::Cancelled,
            _ => ErrorClass::Other,
        }
    }

    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        self.class().exit_code()
    }

    /// Name of the stage this error is attributed to, if any
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::DuplicateStage { stage }
            | Self::UnknownReference { stage, .. }
            | Self::PolicyFatal { stage, .. }
            | Self::StepExecutionFailure { stage, .. }
            | Self::ExecutorUnavailable { stage, .. }
            | Self::Aborted { stage, .. }
            | Self::MissingSource { stage, .. } => Some(stage),
            Self::PathCollision { second, .. } => Some(second),
            _ => None,
        }
    }

    /// Batch of stage failures, each followed by the dependents it aborted
    pub fn execution_failure(failures: Vec<FailedStage>) -> Self {
        let errors = failures.iter().flat_map(FailedStage::to_errors).collect();
        Self::ExecutionFailure { failures, errors }
    }

    pub(crate) fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_path(path: &str, reason: &str) -> Self {
        Self::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_class() {
        let planning = StagehandError::CycleDetected {
            stages: vec!["a".into(), "b".into()],
        };
        let policy = StagehandError::PolicyFatal {
            stage: "flash-attn".into(),
            platform: "linux/arm64".into(),
            reason: "unsupported".into(),
        };
        let execution = StagehandError::ExecutionFailure {
            failures: vec![],
            errors: vec![],
        };

        assert_eq!(planning.exit_code(), 2);
        assert_eq!(policy.exit_code(), 3);
        assert_eq!(execution.exit_code(), 4);
    }

    #[test]
    fn test_execution_failure_lists_stages() {
        let err = StagehandError::execution_failure(vec![
            FailedStage {
                stage: "router".into(),
                diagnostic: "boom".into(),
                exit_code: Some(1),
                attempts: 1,
                aborted: vec!["final".into()],
            },
            FailedStage {
                stage: "kernels".into(),
                diagnostic: "boom".into(),
                exit_code: Some(2),
                attempts: 3,
                aborted: vec![],
            },
        ]);

        assert_eq!(err.to_string(), "2 stage(s) failed: router, kernels");

        let related: Vec<String> = err
            .related()
            .into_iter()
            .flatten()
            .map(|e| e.to_string())
            .collect();
        assert_eq!(
            related,
            vec![
                "Stage 'router' failed after 1 attempt(s)",
                "Stage 'final' was aborted because 'router' failed",
                "Stage 'kernels' failed after 3 attempt(s)",
            ]
        );

        let StagehandError::ExecutionFailure { errors, .. } = &err else {
            unreachable!()
        };
        assert!(matches!(
            &errors[0],
            StagehandError::StepExecutionFailure { exit_code: Some(1), diagnostic, .. } if diagnostic == "boom"
        ));
        assert_eq!(errors[1].stage(), Some("final"));
        assert_eq!(errors[1].class(), ErrorClass::Execution);
    }

    #[test]
    fn test_collision_attributed_to_later_stage() {
        let err = StagehandError::PathCollision {
            first: "x".into(),
            second: "y".into(),
            path: "lib/ext.so".into(),
        };
        assert_eq!(err.stage(), Some("y"));
        assert_eq!(err.class(), ErrorClass::Composition);
    }
}
