// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Shell executor
//!
//! Materializes the input view in a scratch directory, runs each command
//! with the stage shell, then collects the declared outputs.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::debug;

use super::{StepExecutor, StepFailure, StepRequest};
use crate::errors::StagehandResult;
use crate::pipeline::StageSpec;
use crate::tree::{normalize_path, FileTree};

/// `EX_TEMPFAIL` from sysexits.h
const EXIT_TEMPFAIL: i32 = 75;

/// Lines of stderr kept in a failure diagnostic
const DIAGNOSTIC_TAIL: usize = 20;

/// Host variables passed through to commands
const PASSTHROUGH_ENV: &[&str] = &["PATH", "HOME"];

/// Shell executor
pub struct ShellExecutor;

impl ShellExecutor {
    /// Create a new shell executor
    pub fn new() -> Self {
        Self
    }

    async fn run_command(
        &self,
        request: &StepRequest<'_>,
        command: &str,
        work_dir: &Path,
    ) -> Result<(), StepFailure> {
        let stage = request.stage;
        let mut cmd = Command::new(&stage.shell);
        cmd.arg("-c")
            .arg(command)
            .current_dir(work_dir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for key in PASSTHROUGH_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.envs(&stage.env);
        cmd.env("STAGEHAND_PLATFORM", request.platform.as_str());
        cmd.env("STAGEHAND_STAGE", &stage.name);

        let child = cmd.spawn().map_err(|e| {
            StepFailure::new(format!(
                "failed to start shell '{}': {} (is it installed?)",
                stage.shell, e
            ))
        })?;

        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|e| {
                StepFailure::new(format!("failed to wait for command: {}", e))
            })?,
            _ = request.cancel.cancelled() => return Err(StepFailure::cancelled()),
        };

        if output.status.success() {
            return Ok(());
        }

        let code = output.status.code();
        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(DIAGNOSTIC_TAIL)..].join("\n");

        let status = match code {
            Some(code) => format!("exited with status {}", code),
            None => "was terminated by a signal".to_string(),
        };
        let mut diagnostic = format!("command `{}` {}", command, status);
        if !tail.is_empty() {
            diagnostic.push('\n');
            diagnostic.push_str(&tail);
        }

        // Signals and EX_TEMPFAIL are worth another attempt
        let failure = if code.is_none() || code == Some(EXIT_TEMPFAIL) {
            StepFailure::transient(diagnostic)
        } else {
            StepFailure::new(diagnostic)
        };
        Err(failure.with_exit_code(code))
    }

    fn collect_outputs(stage: &StageSpec, work_dir: &Path) -> Result<FileTree, StepFailure> {
        let mut tree = FileTree::new();

        for output in &stage.outputs {
            let rel = normalize_path(output).map_err(|e| StepFailure::new(e.to_string()))?;
            let path = work_dir.join(&rel);
            if !path.exists() {
                return Err(StepFailure::new(format!(
                    "declared output '{}' was not produced",
                    output
                )));
            }

            let produced = FileTree::load_at(&path, &rel, &[])
                .map_err(|e| StepFailure::new(e.to_string()))?;
            tree.overlay(&produced);
        }

        Ok(tree)
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for ShellExecutor {
    async fn execute(&self, request: StepRequest<'_>) -> Result<FileTree, StepFailure> {
        let start = Instant::now();
        let scratch = tempfile::Builder::new()
            .prefix("stagehand-")
            .tempdir()
            .map_err(|e| StepFailure::transient(format!("failed to create scratch dir: {}", e)))?;
        let work_dir = scratch.path().to_path_buf();

        let inputs = request.inputs.clone();
        let target = work_dir.clone();
        tokio::task::spawn_blocking(move || inputs.write_to(&target))
            .await
            .map_err(|e| StepFailure::new(format!("input materialization failed: {}", e)))?
            .map_err(|e| StepFailure::new(format!("input materialization failed: {}", e)))?;

        for command in &request.stage.commands {
            debug!(stage = %request.stage.name, attempt = request.attempt, "running `{}`", command);
            self.run_command(&request, command, &work_dir).await?;
        }

        let stage = request.stage.clone();
        let tree = tokio::task::spawn_blocking(move || Self::collect_outputs(&stage, &work_dir))
            .await
            .map_err(|e| StepFailure::new(format!("output collection failed: {}", e)))??;

        debug!(
            stage = %request.stage.name,
            files = tree.len(),
            "step finished in {:.2}s",
            start.elapsed().as_secs_f64()
        );
        Ok(tree)
    }

    async fn check_available(&self, stage: &StageSpec) -> StagehandResult<bool> {
        Ok(which::which(&stage.shell).is_ok())
    }

    fn name(&self) -> &str {
        "shell"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::policy::Platform;
    use std::collections::BTreeMap;
    use tokio_util::sync::CancellationToken;

    fn request<'a>(stage: &'a StageSpec, inputs: &'a FileTree, platform: &'a Platform) -> StepRequest<'a> {
        StepRequest {
            stage,
            inputs,
            platform,
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_runs_commands_against_inputs() {
        let stage = StageSpec::new("copy")
            .with_command("mkdir -p out && cp src/a.txt out/a.txt")
            .with_command("echo \"$STAGEHAND_PLATFORM\" > out/platform")
            .with_output("out");
        let inputs = FileTree::new().with_file("src/a.txt", b"hello".to_vec()).unwrap();
        let platform = Platform::parse("linux/amd64").unwrap();

        let tree = ShellExecutor::new()
            .execute(request(&stage, &inputs, &platform))
            .await
            .unwrap();

        assert_eq!(tree.get("out/a.txt").unwrap().data(), b"hello");
        assert_eq!(tree.get("out/platform").unwrap().data(), b"linux/amd64\n");
        assert!(!tree.contains("src/a.txt"));
    }

    #[tokio::test]
    async fn test_environment_is_declared_only() {
        std::env::set_var("STAGEHAND_TEST_LEAK", "leaked");
        let mut env = BTreeMap::new();
        env.insert("MODE".to_string(), "release".to_string());
        let mut stage = StageSpec::new("env")
            .with_command("printf '%s|%s' \"$MODE\" \"$STAGEHAND_TEST_LEAK\" > out")
            .with_output("out");
        stage.env = env;
        let platform = Platform::parse("amd64").unwrap();

        let tree = ShellExecutor::new()
            .execute(request(&stage, &FileTree::new(), &platform))
            .await
            .unwrap();
        assert_eq!(tree.get("out").unwrap().data(), b"release|");
    }

    #[tokio::test]
    async fn test_failure_classification() {
        let platform = Platform::parse("amd64").unwrap();
        let inputs = FileTree::new();

        let failing = StageSpec::new("fail").with_command("echo boom >&2; exit 3");
        let err = ShellExecutor::new()
            .execute(request(&failing, &inputs, &platform))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code, Some(3));
        assert!(!err.transient);
        assert!(err.diagnostic.contains("boom"));

        let flaky = StageSpec::new("flaky").with_command("exit 75");
        let err = ShellExecutor::new()
            .execute(request(&flaky, &inputs, &platform))
            .await
            .unwrap_err();
        assert!(err.transient);
    }

    #[tokio::test]
    async fn test_missing_output_fails() {
        let stage = StageSpec::new("lazy").with_command("true").with_output("bin/app");
        let platform = Platform::parse("amd64").unwrap();

        let err = ShellExecutor::new()
            .execute(request(&stage, &FileTree::new(), &platform))
            .await
            .unwrap_err();
        assert!(err.diagnostic.contains("bin/app"));
        assert!(!err.transient);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_command() {
        let stage = StageSpec::new("slow").with_command("sleep 30");
        let platform = Platform::parse("amd64").unwrap();
        let inputs = FileTree::new();
        let mut req = request(&stage, &inputs, &platform);
        let token = CancellationToken::new();
        req.cancel = token.clone();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            token.cancel();
        });

        let started = Instant::now();
        let err = ShellExecutor::new().execute(req).await.unwrap_err();
        canceller.await.unwrap();

        assert!(err.cancelled);
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
