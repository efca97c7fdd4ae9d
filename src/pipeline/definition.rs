// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Build file definition structures
//!
//! Defines the schema for stagehand.yaml files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::{StagehandError, StagehandResult};

/// Build definition from stagehand.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildFile {
    /// Build file version (for future compatibility)
    #[serde(default = "default_version")]
    pub version: String,

    /// Build name
    pub name: String,

    /// Build description
    #[serde(default)]
    pub description: Option<String>,

    /// Stages in declaration order
    pub stages: Vec<StageSpec>,

    /// How the final tree is assembled from stage outputs
    #[serde(default)]
    pub composition: Option<CompositionSpec>,

    /// Execution and store settings
    #[serde(default)]
    pub settings: BuildSettings,
}

fn default_version() -> String {
    "1".to_string()
}

impl BuildFile {
    /// Load a build file, choosing the format from the file extension
    pub fn from_file(path: &Path) -> StagehandResult<Self> {
        if !path.exists() {
            return Err(StagehandError::BuildFileNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| StagehandError::FileRead {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("json") => serde_json::from_str(&content).map_err(Into::into),
            _ => Self::from_yaml(&content),
        }
    }

    /// Parse a build file from YAML
    pub fn from_yaml(yaml: &str) -> StagehandResult<Self> {
        serde_yaml::from_str(yaml).map_err(Into::into)
    }

    /// Parse a build file from TOML
    pub fn from_toml(source: &str) -> StagehandResult<Self> {
        toml::from_str(source).map_err(Into::into)
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> StagehandResult<String> {
        serde_yaml::to_string(self).map_err(Into::into)
    }

    /// Get a stage by name
    pub fn get_stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Get all stage names
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }
}

/// A single stage: declared inputs, commands and outputs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageSpec {
    /// Stage name (must be unique within the build)
    pub name: String,

    /// Stage description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Ordered input declarations
    #[serde(default)]
    pub inputs: Vec<InputRef>,

    /// Ordered command list
    #[serde(default)]
    pub commands: Vec<String>,

    /// Declared output paths, relative to the stage work directory
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Platforms this stage can be built for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platforms: Option<PlatformConstraint>,

    /// Stage may be skipped on unsupported platforms
    #[serde(default)]
    pub optional: bool,

    /// Shell used to run each command
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Declared environment, part of the fingerprint
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_shell() -> String {
    "sh".to_string()
}

impl StageSpec {
    /// Create an empty stage
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            inputs: Vec::new(),
            commands: Vec::new(),
            outputs: Vec::new(),
            platforms: None,
            optional: false,
            shell: default_shell(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, input: InputRef) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.outputs.push(output.into());
        self
    }

    pub fn with_platforms(mut self, constraint: PlatformConstraint) -> Self {
        self.platforms = Some(constraint);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Names of the stages this stage reads from, first occurrence order
    pub fn referenced_stages(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for input in &self.inputs {
            if let Some(stage) = input.references_stage() {
                if !names.contains(&stage) {
                    names.push(stage);
                }
            }
        }
        names
    }
}

/// Input declaration for a stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum InputRef {
    /// A path inside another stage's output
    Stage {
        /// Producing stage
        stage: String,
        /// Path inside that stage's output (empty for the whole tree)
        #[serde(default)]
        path: String,
        /// Where the content lands in this stage's input view
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dest: Option<String>,
    },

    /// A workspace-relative path or glob pattern
    Workspace {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dest: Option<String>,
        /// Frequently-changing source, hashed in the second fingerprint phase
        #[serde(default)]
        volatile: bool,
    },
}

impl InputRef {
    /// A stable workspace input
    pub fn workspace(path: impl Into<String>) -> Self {
        Self::Workspace {
            path: path.into(),
            dest: None,
            volatile: false,
        }
    }

    /// A volatile workspace input
    pub fn volatile(path: impl Into<String>) -> Self {
        Self::Workspace {
            path: path.into(),
            dest: None,
            volatile: true,
        }
    }

    /// A path from another stage's output
    pub fn stage(stage: impl Into<String>, path: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            path: path.into(),
            dest: None,
        }
    }

    /// Set the destination inside the input view
    pub fn to(self, dest: impl Into<String>) -> Self {
        match self {
            Self::Stage { stage, path, .. } => Self::Stage {
                stage,
                path,
                dest: Some(dest.into()),
            },
            Self::Workspace { path, volatile, .. } => Self::Workspace {
                path,
                dest: Some(dest.into()),
                volatile,
            },
        }
    }

    /// Check if this input references another stage
    pub fn references_stage(&self) -> Option<&str> {
        match self {
            Self::Stage { stage, .. } => Some(stage),
            Self::Workspace { .. } => None,
        }
    }

    /// Source path (workspace path, or path inside the producing stage)
    pub fn path(&self) -> &str {
        match self {
            Self::Stage { path, .. } | Self::Workspace { path, .. } => path,
        }
    }

    /// Destination path inside the input view
    pub fn dest(&self) -> &str {
        match self {
            Self::Stage { path, dest, .. } | Self::Workspace { path, dest, .. } => {
                dest.as_deref().unwrap_or(path)
            }
        }
    }

    pub fn is_volatile(&self) -> bool {
        matches!(self, Self::Workspace { volatile: true, .. })
    }
}

/// Platform predicate for a stage
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlatformConstraint {
    /// Glob patterns of permitted platforms (empty permits all)
    #[serde(default)]
    pub allow: Vec<String>,

    /// Glob patterns of rejected platforms
    #[serde(default)]
    pub deny: Vec<String>,

    /// Reported when the platform is rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PlatformConstraint {
    pub fn allow(patterns: &[&str]) -> Self {
        Self {
            allow: patterns.iter().map(|p| p.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn deny(patterns: &[&str]) -> Self {
        Self {
            deny: patterns.iter().map(|p| p.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Ordered description of how the final tree is built
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct CompositionSpec {
    pub entries: Vec<CompositionEntry>,
}

impl CompositionSpec {
    pub fn new(entries: Vec<CompositionEntry>) -> Self {
        Self { entries }
    }

    /// Stages referenced by the composition, first occurrence order
    pub fn stages(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for entry in &self.entries {
            if !names.contains(&entry.stage.as_str()) {
                names.push(&entry.stage);
            }
        }
        names
    }
}

/// One copy step of the composition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompositionEntry {
    /// Stage whose artifact is copied
    pub stage: String,

    /// Subpath inside the artifact (empty for the whole tree)
    #[serde(default)]
    pub source: String,

    /// Destination subpath in the final tree
    #[serde(default)]
    pub dest: String,

    /// Later writers to these destinations win instead of colliding
    #[serde(default, rename = "override")]
    pub overridable: bool,
}

impl CompositionEntry {
    pub fn new(stage: impl Into<String>, source: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            source: source.into(),
            dest: dest.into(),
            overridable: false,
        }
    }

    pub fn overriding(mut self) -> Self {
        self.overridable = true;
        self
    }
}

/// Execution and store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BuildSettings {
    /// Maximum concurrently executing stages (default: available parallelism)
    #[serde(default)]
    pub jobs: Option<usize>,

    /// Default target platform (default: host)
    #[serde(default)]
    pub platform: Option<String>,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub retry: RetrySettings,
}

/// Artifact store settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreSettings {
    /// Store directory
    #[serde(default = "default_store_dir")]
    pub directory: PathBuf,

    /// Eviction bounds applied before each build
    #[serde(default)]
    pub eviction: EvictionSettings,

    /// Age after which an unreleased pin lease is considered stale
    #[serde(default = "default_pin_ttl")]
    pub pin_ttl_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            directory: default_store_dir(),
            eviction: EvictionSettings::default(),
            pin_ttl_secs: default_pin_ttl(),
        }
    }
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".stagehand/store")
}

fn default_pin_ttl() -> u64 {
    24 * 60 * 60
}

/// Eviction bounds
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EvictionSettings {
    #[serde(default)]
    pub max_size_bytes: Option<u64>,

    #[serde(default)]
    pub max_age_secs: Option<u64>,
}

/// Retry settings for transient step failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    200
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_build() {
        let yaml = r#"
name: "server"
stages:
  - name: planner
    inputs:
      - path: Cargo.toml
      - path: src
        volatile: true
    commands:
      - cargo chef prepare --recipe-path recipe.json
    outputs:
      - recipe.json
  - name: builder
    inputs:
      - stage: planner
        path: recipe.json
    commands:
      - cargo chef cook --recipe-path recipe.json
    outputs:
      - target
"#;

        let build = BuildFile::from_yaml(yaml).unwrap();
        assert_eq!(build.name, "server");
        assert_eq!(build.stages.len(), 2);

        let planner = &build.stages[0];
        assert_eq!(planner.inputs[0], InputRef::workspace("Cargo.toml"));
        assert!(planner.inputs[1].is_volatile());
        assert_eq!(planner.shell, "sh");

        let builder = &build.stages[1];
        assert_eq!(builder.referenced_stages(), vec!["planner"]);
        assert_eq!(builder.inputs[0].dest(), "recipe.json");
    }

    #[test]
    fn test_parse_platforms_and_composition() {
        let yaml = r#"
name: "image"
stages:
  - name: flash-attn
    optional: true
    platforms:
      deny: ["arm64"]
      reason: "no arm64 kernels"
    commands: ["make"]
    outputs: ["lib"]
composition:
  - stage: flash-attn
    source: lib
    dest: opt/conda/lib
    override: true
settings:
  jobs: 4
  retry:
    max_attempts: 5
"#;

        let build = BuildFile::from_yaml(yaml).unwrap();
        let stage = &build.stages[0];
        assert!(stage.optional);
        assert_eq!(
            stage.platforms.as_ref().unwrap().deny,
            vec!["arm64".to_string()]
        );

        let composition = build.composition.unwrap();
        assert_eq!(composition.entries.len(), 1);
        assert!(composition.entries[0].overridable);

        assert_eq!(build.settings.jobs, Some(4));
        assert_eq!(build.settings.retry.max_attempts, 5);
        assert_eq!(build.settings.retry.initial_delay_ms, 200);
        assert_eq!(build.settings.store.directory, PathBuf::from(".stagehand/store"));
    }

    #[test]
    fn test_parse_toml_build() {
        let source = r#"
name = "toml-build"

[[stages]]
name = "a"
commands = ["echo a > a.txt"]
outputs = ["a.txt"]
"#;

        let build = BuildFile::from_toml(source).unwrap();
        assert_eq!(build.stage_names(), vec!["a"]);
    }

    #[test]
    fn test_referenced_stages_deduplicated() {
        let stage = StageSpec::new("final")
            .with_input(InputRef::stage("a", "bin"))
            .with_input(InputRef::stage("b", "lib"))
            .with_input(InputRef::stage("a", "share"));

        assert_eq!(stage.referenced_stages(), vec!["a", "b"]);
    }
}
