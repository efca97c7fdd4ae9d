// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Validate command - check the build file

use colored::Colorize;
use std::path::PathBuf;

use super::workspace_root;
use crate::errors::{StagehandError, StagehandResult};
use crate::pipeline::{BuildFile, BuildValidator, StageGraph};

/// Run the validate command
pub async fn run(file: PathBuf, verbose: bool) -> StagehandResult<()> {
    println!("{}", "Validating build file...".bold());
    println!();

    let build = match BuildFile::from_file(&file) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("  {} Failed to parse {}", "✗".red(), file.display());
            eprintln!();
            return Err(e);
        }
    };

    println!("  {} {} parses", "✓".green(), file.display());

    let validation = BuildValidator::validate(&build);

    let root = workspace_root(&file)?;
    let missing_files = BuildValidator::validate_files(&build, &root);

    let mut has_issues = false;

    if !validation.errors.is_empty() {
        has_issues = true;
        println!();
        println!("{}:", "Errors".red().bold());
        for error in &validation.errors {
            println!("  {} {}", "✗".red(), error);
        }
    }

    if !missing_files.is_empty() {
        has_issues = true;
        println!();
        println!("{}:", "Missing inputs".yellow().bold());
        for missing in &missing_files {
            println!("  {} {}", "⚠".yellow(), missing);
        }
    }

    if !validation.warnings.is_empty() {
        println!();
        println!("{}:", "Warnings".yellow().bold());
        for warning in &validation.warnings {
            println!("  {} {}", "⚠".yellow(), warning);
        }
    }

    if verbose && validation.is_valid() {
        if let Ok(graph) = StageGraph::from_build_file(&build) {
            println!();
            println!("{}:", "Build summary".bold());
            println!("  Name: {}", build.name);
            println!("  Stages: {}", build.stages.len());
            for stage in &build.stages {
                let deps = graph.dependencies(&stage.name).unwrap_or_default();
                let deps = if deps.is_empty() {
                    String::new()
                } else {
                    format!(" [depends: {}]", deps.join(", "))
                };
                println!(
                    "    - {} ({} command(s)){}",
                    stage.name,
                    stage.commands.len(),
                    deps.dimmed()
                );
            }
        }
    }

    println!();

    if !validation.is_valid() {
        return Err(StagehandError::InvalidBuildFile {
            reason: format!("{} error(s) found", validation.errors.len()),
            help: validation.errors.first().cloned(),
        });
    }

    if has_issues {
        println!("{}", "Build file is valid but has warnings.".yellow().bold());
    } else {
        println!("{}", "Build file is valid!".green().bold());
    }
    Ok(())
}
