// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! # stagehand - Dependency-DAG Build Orchestrator
//!
//! `stagehand` executes a DAG of build stages, caches every stage output in
//! a content-addressed store, and composes selected outputs into a final
//! tree.
//!
//! ## Features
//!
//! - **Stage graph** - Deterministic topological order, cycle detection
//! - **Content-addressed caching** - Two-phase fingerprints, one write per key
//! - **Platform policies** - Stages are allowed, skipped, or fatal per platform
//! - **Failure isolation** - Independent branches keep running after a failure
//! - **Composition** - Final tree assembly with explicit overrides
//!
//! ## Quick Start
//!
//! ```bash
//! # Show the stage graph
//! stagehand graph --format mermaid
//!
//! # See what would run for arm64
//! stagehand plan --platform linux/arm64
//!
//! # Build the final composition
//! stagehand build --output dist
//! ```

pub mod cache;
pub mod cli;
pub mod compose;
pub mod errors;
pub mod executors;
pub mod pipeline;
pub mod policy;
pub mod tree;
pub mod utils;
pub mod workspace;

// Re-export commonly used types
pub use errors::{StagehandError, StagehandResult};
pub use pipeline::{BuildFile, StageGraph, StageSpec};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
