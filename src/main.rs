// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! stagehand - dependency-DAG build orchestrator
//!
//! Builds stage DAGs with content-addressed caching and platform policies.

use clap::Parser;
use colored::Colorize;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stagehand::cli::{Cli, Commands};
use stagehand::errors::{RecoverySuggestion, StagehandError, StagehandResult};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "stagehand=debug"
    } else {
        "stagehand=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let code = error.exit_code();
            let suggestion = RecoverySuggestion::for_error(&error);

            eprintln!("{:?}", miette::Report::new(error));
            if let Some(suggestion) = suggestion {
                eprintln!("{}", suggestion.to_string().cyan());
            }

            ExitCode::from(code.clamp(1, 255) as u8)
        }
    }
}

async fn dispatch(cli: Cli) -> StagehandResult<()> {
    // Change to specified directory if provided
    if let Some(ref dir) = cli.directory {
        std::env::set_current_dir(dir).map_err(|e| StagehandError::Io {
            message: format!("failed to change to directory '{}': {}", dir.display(), e),
        })?;
    }

    let file = cli.file;
    let verbose = cli.verbose;

    match cli.command {
        Commands::Build {
            target,
            options,
            no_cache,
            output,
        } => stagehand::cli::build::run(file, target, options, no_cache, output, verbose).await,
        Commands::Plan {
            target,
            options,
            format,
        } => stagehand::cli::plan::run(file, target, options, format, verbose).await,
        Commands::Graph { format } => stagehand::cli::graph::run(file, format, verbose).await,
        Commands::Validate => stagehand::cli::validate::run(file, verbose).await,
        Commands::Store { store, action } => {
            stagehand::cli::store::run(file, store, action, verbose).await
        }
    }
}
