// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Command-line behaviour and exit statuses

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

const VALID: &str = r#"
name: demo
stages:
  - name: gen
    inputs:
      - path: msg.txt
    commands:
      - mkdir -p out && cat msg.txt > out/msg
    outputs: [out]
  - name: pack
    inputs:
      - stage: gen
        path: out/msg
        dest: msg
    commands:
      - mkdir -p dist && tr a-z A-Z < msg > dist/MSG
    outputs: [dist]
composition:
  - stage: pack
    source: dist
    dest: share
"#;

const CYCLIC: &str = r#"
name: cyclic
stages:
  - name: a
    inputs: [{ stage: b, path: out }]
    commands: ["true"]
  - name: b
    inputs: [{ stage: a, path: out }]
    commands: ["true"]
"#;

const AMD64_ONLY: &str = r#"
name: kernels
stages:
  - name: kernels
    platforms:
      allow: [amd64]
      reason: kernels are x86 only
    commands: ["true"]
  - name: server
    inputs: [{ stage: kernels }]
    commands: ["true"]
"#;

fn project(build_file: &str) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("stagehand.yaml"), build_file).unwrap();
    std::fs::write(dir.path().join("msg.txt"), "hello\n").unwrap();
    dir
}

fn stagehand(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("stagehand").unwrap();
    cmd.arg("-C")
        .arg(dir)
        .env("NO_COLOR", "1")
        .env_remove("STAGEHAND_PLATFORM")
        .env_remove("STAGEHAND_JOBS")
        .env_remove("STAGEHAND_STORE")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn validate_accepts_a_well_formed_build() {
    let dir = project(VALID);
    stagehand(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Build file is valid"));
}

#[test]
fn validate_rejects_a_cycle_with_planning_status() {
    let dir = project(CYCLIC);
    stagehand(dir.path())
        .arg("validate")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("cycle"));
}

#[test]
fn graph_reports_cycle_members() {
    let dir = project(CYCLIC);
    stagehand(dir.path())
        .arg("graph")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("a, b"));
}

#[test]
fn graph_renders_mermaid() {
    let dir = project(VALID);
    stagehand(dir.path())
        .args(["graph", "--format", "mermaid"])
        .assert()
        .success()
        .stdout(predicate::str::contains("graph TD"))
        .stdout(predicate::str::contains("gen"))
        .stdout(predicate::str::contains("pack"));
}

#[test]
fn missing_build_file_is_a_planning_error() {
    let dir = tempfile::tempdir().unwrap();
    stagehand(dir.path())
        .arg("graph")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("stagehand.yaml"));
}

#[test]
fn unknown_target_is_a_planning_error() {
    let dir = project(VALID);
    stagehand(dir.path())
        .args(["plan", "nope"])
        .assert()
        .code(2);
}

#[test]
fn unsupported_platform_fails_before_anything_runs() {
    let dir = project(AMD64_ONLY);
    stagehand(dir.path())
        .args(["build", "server", "--platform", "linux/arm64"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("kernels"));

    assert!(!dir.path().join(".stagehand").exists());
}

#[test]
fn plan_json_lists_stages_in_order() {
    let dir = project(VALID);
    let output = stagehand(dir.path())
        .args(["plan", "--format", "json", "--platform", "linux/amd64"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let stages: Vec<&str> = plan["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["stage"].as_str().unwrap())
        .collect();
    assert_eq!(stages, vec!["gen", "pack"]);
    assert_eq!(plan["target"]["kind"], "final");
}

#[cfg(unix)]
#[test]
fn build_writes_the_composed_tree_and_then_hits_the_cache() {
    let dir = project(VALID);

    stagehand(dir.path())
        .args(["build", "--output", "result"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 executed, 0 cached"));

    let built = std::fs::read_to_string(dir.path().join("result/share/MSG")).unwrap();
    assert_eq!(built, "HELLO\n");

    stagehand(dir.path())
        .arg("build")
        .assert()
        .success()
        .stdout(predicate::str::contains("0 executed, 2 cached"));

    stagehand(dir.path())
        .args(["store", "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Entries:  2"));
}

#[cfg(unix)]
#[test]
fn failed_stage_exits_with_execution_status() {
    let dir = project(
        r#"
name: broken
stages:
  - name: ok
    commands: ["mkdir -p out && echo ok > out/ok"]
    outputs: [out]
  - name: bad
    commands: ["echo nope >&2; exit 3"]
  - name: after
    inputs: [{ stage: bad }]
    commands: ["true"]
"#,
    );

    stagehand(dir.path())
        .args(["build", "after"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("bad"))
        .stderr(predicate::str::contains("after"));
}

#[test]
fn missing_shell_is_reported_before_any_stage_runs() {
    let dir = project(
        r#"
name: noshell
stages:
  - name: gen
    shell: stagehand-no-such-shell
    commands: ["true"]
"#,
    );

    stagehand(dir.path())
        .args(["build", "gen"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("stagehand-no-such-shell"));
}
