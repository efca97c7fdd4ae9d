// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Progress indicators for long-running operations

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// Create a spinner for indeterminate progress
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.blue} {msg}")
    {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Create a progress bar over a number of stages
///
/// Draws to stderr; hidden when `visible` is false so that log lines and
/// piped output are not interleaved with bar redraws.
pub fn create_progress_bar(total: u64, message: &str, visible: bool) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if !visible {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }
    if let Ok(style) =
        ProgressStyle::default_bar().template("{msg:20} [{bar:40.cyan/blue}] {pos}/{len} ({elapsed})")
    {
        pb.set_style(style.progress_chars("█▓░"));
    }
    pb.set_message(message.to_string());
    pb
}
