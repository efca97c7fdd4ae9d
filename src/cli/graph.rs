// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Graph command - visualize the stage graph

use std::path::PathBuf;

use super::{load_project, GraphFormat};
use crate::errors::StagehandResult;

/// Run the graph command
pub async fn run(file: PathBuf, format: GraphFormat, _verbose: bool) -> StagehandResult<()> {
    let project = load_project(&file)?;
    let graph = &project.graph;

    let output = match format {
        GraphFormat::Text => graph.to_text()?,
        GraphFormat::Dot => graph.to_dot(),
        GraphFormat::Mermaid => graph.to_mermaid(),
    };

    println!("{}", output);

    Ok(())
}
