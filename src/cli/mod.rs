// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! CLI command definitions and handlers
//!
//! Defines the command-line interface for stagehand.

pub mod build;
pub mod graph;
pub mod plan;
pub mod store;
pub mod validate;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

use crate::errors::{StagehandError, StagehandResult};
use crate::pipeline::{BuildFile, BuildSettings, StageGraph, FINAL_TARGET};
use crate::policy::Platform;

/// Dependency-DAG build orchestrator
///
/// Runs stage commands in dependency order, caching each stage's output by
/// content fingerprint, and composes the results into a final tree.
#[derive(Parser, Debug)]
#[clap(
    name = "stagehand",
    version,
    about = "Dependency-DAG build orchestrator with content-addressed stage caching",
    long_about = None,
    after_help = "Examples:\n\
        stagehand build                          Build the final composition\n\
        stagehand build router --platform arm64  Build one stage for arm64\n\
        stagehand plan --format json             Show what a build would do\n\
        stagehand store gc --max-size 10737418240\n\n\
        See 'stagehand <command> --help' for more information on a specific command."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Change to directory before executing
    #[clap(short = 'C', long, global = true, value_name = "DIR")]
    pub directory: Option<PathBuf>,

    /// Build file
    #[clap(short, long, global = true, default_value = "stagehand.yaml")]
    pub file: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a target
    Build {
        /// Stage name, or 'final' for the composition
        #[clap(default_value = FINAL_TARGET)]
        target: String,

        #[clap(flatten)]
        options: BuildOptions,

        /// Skip cache lookups (results are still stored)
        #[clap(long)]
        no_cache: bool,

        /// Write the built tree to this directory
        #[clap(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
    },

    /// Show the execution plan for a target without running anything
    Plan {
        /// Stage name, or 'final' for the composition
        #[clap(default_value = FINAL_TARGET)]
        target: String,

        #[clap(flatten)]
        options: BuildOptions,

        /// Output format
        #[clap(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the stage graph
    Graph {
        /// Output format
        #[clap(long, value_enum, default_value = "text")]
        format: GraphFormat,
    },

    /// Validate the build file
    Validate,

    /// Artifact store management
    Store {
        /// Store directory ('user' for the per-user store)
        #[clap(long, env = "STAGEHAND_STORE", value_name = "DIR")]
        store: Option<String>,

        #[clap(subcommand)]
        action: StoreAction,
    },
}

/// Options shared by `build` and `plan`
#[derive(clap::Args, Debug, Clone, Default)]
pub struct BuildOptions {
    /// Target platform (os/arch[/variant] or arch)
    #[clap(long, env = "STAGEHAND_PLATFORM")]
    pub platform: Option<String>,

    /// Maximum concurrently executing stages
    #[clap(short, long, env = "STAGEHAND_JOBS")]
    pub jobs: Option<usize>,

    /// Store directory ('user' for the per-user store)
    #[clap(long, env = "STAGEHAND_STORE", value_name = "DIR")]
    pub store: Option<String>,
}

/// Artifact store actions
#[derive(Subcommand, Debug, Clone)]
pub enum StoreAction {
    /// Show store statistics
    Stats,

    /// List stored artifacts
    List,

    /// Remove every stored artifact
    Clear {
        /// Skip confirmation
        #[clap(short, long)]
        yes: bool,
    },

    /// Evict artifacts beyond the configured bounds
    Gc {
        /// Maximum total size in bytes
        #[clap(long)]
        max_size: Option<u64>,

        /// Maximum age in seconds since last use
        #[clap(long)]
        max_age: Option<u64>,
    },
}

/// Output format for `plan`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Graph output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GraphFormat {
    Text,
    Dot,
    Mermaid,
}

/// A loaded build file and its stage graph
pub(crate) struct Project {
    pub file: BuildFile,
    pub graph: StageGraph,
    /// Workspace root (the build file's directory)
    pub root: PathBuf,
}

/// Load a build file and resolve its graph
pub(crate) fn load_project(path: &Path) -> StagehandResult<Project> {
    let file = BuildFile::from_file(path)?;
    let graph = StageGraph::from_build_file(&file)?;
    Ok(Project {
        file,
        graph,
        root: workspace_root(path)?,
    })
}

/// Directory the build file lives in
pub(crate) fn workspace_root(build_file: &Path) -> StagehandResult<PathBuf> {
    let cwd = std::env::current_dir()?;
    Ok(match build_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => cwd.join(parent),
        _ => cwd,
    })
}

/// Target platform: flag, then build settings, then host
pub(crate) fn resolve_platform(
    flag: Option<&str>,
    settings: &BuildSettings,
) -> StagehandResult<Platform> {
    match flag.or(settings.platform.as_deref()) {
        Some(raw) => Platform::parse(raw),
        None => Ok(Platform::host()),
    }
}

/// Store directory: flag, then build settings, relative to the workspace
pub(crate) fn store_dir(
    flag: Option<&str>,
    settings: &BuildSettings,
    root: &Path,
) -> StagehandResult<PathBuf> {
    match flag {
        Some("user") => user_store_dir(),
        Some(dir) => Ok(root.join(dir)),
        None => Ok(root.join(&settings.store.directory)),
    }
}

fn user_store_dir() -> StagehandResult<PathBuf> {
    directories::ProjectDirs::from("dev", "stagehand", "stagehand")
        .map(|dirs| dirs.cache_dir().join("store"))
        .ok_or_else(|| StagehandError::Io {
            message: "could not determine a per-user cache directory".into(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_build() {
        let cli = Cli::parse_from([
            "stagehand",
            "build",
            "router",
            "--platform",
            "linux/arm64",
            "-j",
            "4",
            "--no-cache",
        ]);
        match cli.command {
            Commands::Build {
                target,
                options,
                no_cache,
                output,
            } => {
                assert_eq!(target, "router");
                assert_eq!(options.platform.as_deref(), Some("linux/arm64"));
                assert_eq!(options.jobs, Some(4));
                assert!(no_cache);
                assert!(output.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.file, PathBuf::from("stagehand.yaml"));
    }

    #[test]
    fn test_build_target_defaults_to_final() {
        let cli = Cli::parse_from(["stagehand", "-f", "other.yaml", "build"]);
        assert!(matches!(cli.command, Commands::Build { ref target, .. } if target == "final"));
        assert_eq!(cli.file, PathBuf::from("other.yaml"));
    }

    #[test]
    fn test_platform_precedence() {
        let settings = BuildSettings {
            platform: Some("linux/arm64".into()),
            ..Default::default()
        };
        assert_eq!(
            resolve_platform(Some("amd64"), &settings).unwrap().as_str(),
            "amd64"
        );
        assert_eq!(
            resolve_platform(None, &settings).unwrap().as_str(),
            "linux/arm64"
        );
        assert_eq!(
            resolve_platform(None, &BuildSettings::default()).unwrap(),
            Platform::host()
        );
    }

    #[test]
    fn test_store_dir_is_relative_to_root() {
        let root = Path::new("/work");
        let settings = BuildSettings::default();
        assert_eq!(
            store_dir(None, &settings, root).unwrap(),
            PathBuf::from("/work/.stagehand/store")
        );
        assert_eq!(
            store_dir(Some("/tmp/s"), &settings, root).unwrap(),
            PathBuf::from("/tmp/s")
        );
    }
}
