// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Store command - inspect and maintain the artifact store

use colored::Colorize;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::SystemTime;

use super::{store_dir, workspace_root, StoreAction};
use crate::cache::{evict, format_bytes, policy_from_settings, ArtifactStore, FilesystemStore};
use crate::errors::StagehandResult;
use crate::pipeline::{BuildFile, BuildSettings, EvictionSettings};
use crate::utils::format_duration;

/// Run the store command
///
/// Settings come from the build file when there is one.
pub async fn run(
    file: PathBuf,
    store: Option<String>,
    action: StoreAction,
    _verbose: bool,
) -> StagehandResult<()> {
    let settings = if file.exists() {
        BuildFile::from_file(&file)?.settings
    } else {
        BuildSettings::default()
    };
    let root = workspace_root(&file)?;
    let location = store_dir(store.as_deref(), &settings, &root)?;
    let store = FilesystemStore::new(&location)?;

    match action {
        StoreAction::Stats => {
            let stats = store.stats().await?;

            println!("{}", "Store Statistics".bold());
            println!("{}", "═".repeat(40));
            println!("  Location: {}", location.display());
            println!("  Entries:  {}", stats.entries);
            println!("  Size:     {}", stats.formatted_size());
            println!("  Pinned:   {}", store.pinned().await?.len());

            if let Some(oldest) = stats.oldest_entry {
                if let Ok(duration) = oldest.elapsed() {
                    println!("  Oldest:   {} ago", format_duration(duration));
                }
            }

            if let Some(newest) = stats.newest_entry {
                if let Ok(duration) = newest.elapsed() {
                    println!("  Newest:   {} ago", format_duration(duration));
                }
            }

            Ok(())
        }

        StoreAction::List => {
            let entries = store.list().await?;
            let pinned = store.pinned().await?;

            println!("{}", "Stored Artifacts".bold());
            println!("{}", "═".repeat(40));

            if entries.is_empty() {
                println!("{}", "  No stored artifacts.".dimmed());
                return Ok(());
            }

            let now = SystemTime::now();
            for meta in &entries {
                let age = now
                    .duration_since(meta.last_used)
                    .map(format_duration)
                    .unwrap_or_else(|_| "0s".into());
                println!(
                    "  {} {:<24} {:>10}  {:>4} files  used {} ago{}",
                    meta.fingerprint.short().dimmed(),
                    meta.stage,
                    format_bytes(meta.size_bytes),
                    meta.file_count,
                    age,
                    if pinned.contains(&meta.fingerprint) {
                        " (pinned)".cyan().to_string()
                    } else {
                        String::new()
                    }
                );
            }

            Ok(())
        }

        StoreAction::Clear { yes } => {
            let stats = store.stats().await?;

            if stats.entries == 0 {
                println!("{}", "Store is already empty.".dimmed());
                return Ok(());
            }

            if !yes {
                print!(
                    "Remove {} artifacts ({})? [y/N] ",
                    stats.entries,
                    stats.formatted_size()
                );
                io::stdout().flush().ok();

                let mut input = String::new();
                io::stdin().read_line(&mut input).ok();

                if !input.trim().eq_ignore_ascii_case("y") {
                    println!("{}", "Cancelled.".dimmed());
                    return Ok(());
                }
            }

            store.clear().await?;
            println!("{}", "Store cleared.".green());

            Ok(())
        }

        StoreAction::Gc { max_size, max_age } => {
            let bounds = if max_size.is_some() || max_age.is_some() {
                EvictionSettings {
                    max_size_bytes: max_size,
                    max_age_secs: max_age,
                }
            } else {
                settings.store.eviction.clone()
            };

            let policy = policy_from_settings(&bounds);
            let report = evict(&store, policy.as_ref()).await?;

            println!(
                "{} Removed {} artifact(s), freed {}",
                "✓".green(),
                report.removed.len(),
                format_bytes(report.freed_bytes)
            );
            if report.skipped_pinned > 0 {
                println!(
                    "{}",
                    format!("  {} pinned artifact(s) kept", report.skipped_pinned).dimmed()
                );
            }

            Ok(())
        }
    }
}
