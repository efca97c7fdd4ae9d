// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Error recovery suggestions
//!
//! Provides actionable suggestions for recovering from build errors.

use super::StagehandError;

/// A recovery suggestion with concrete steps
#[derive(Debug, Clone)]
pub struct RecoverySuggestion {
    /// Brief description of what to do
    pub action: String,
    /// Detailed steps
    pub steps: Vec<String>,
    /// Commands to run
    pub commands: Vec<String>,
}

impl RecoverySuggestion {
    /// Pick a suggestion for an error, if one applies
    pub fn for_error(error: &StagehandError) -> Option<Self> {
        match error {
            StagehandError::CycleDetected { stages } => Some(Self::fix_cycle(stages)),
            StagehandError::PolicyFatal {
                stage, platform, ..
            } => Some(Self::fix_policy_fatal(stage, platform)),
            StagehandError::PathCollision {
                first,
                second,
                path,
            } => Some(Self::fix_collision(first, second, path)),
            StagehandError::BuildFileNotFound { .. } => Some(Self::create_build_file()),
            _ => None,
        }
    }

    /// Suggest fixing a dependency cycle
    pub fn fix_cycle(stages: &[String]) -> Self {
        Self {
            action: "Remove the dependency cycle".into(),
            steps: vec![
                format!("Stages on the cycle: {}", stages.join(" → ")),
                "A stage may only read outputs of stages that do not read its own output".into(),
            ],
            commands: vec![
                "# Visualize the stage graph:".into(),
                "stagehand graph --format mermaid".into(),
            ],
        }
    }

    /// Suggest ways around a platform-fatal stage
    pub fn fix_policy_fatal(stage: &str, platform: &str) -> Self {
        Self {
            action: format!("Stage '{}' does not support '{}'", stage, platform),
            steps: vec![
                "Build for a platform the stage allows, or".into(),
                format!(
                    "declare '{}' as optional and stop depending on it for this platform",
                    stage
                ),
            ],
            commands: vec![
                "# Inspect which stages are required:".into(),
                format!("stagehand plan --platform {}", platform),
            ],
        }
    }

    /// Suggest resolving a composition collision
    pub fn fix_collision(first: &str, second: &str, path: &str) -> Self {
        Self {
            action: format!("Resolve the collision on '{}'", path),
            steps: vec![
                format!("Both '{}' and '{}' write this path", first, second),
                format!(
                    "Add 'override: true' to the '{}' composition entry to let it win, or",
                    second
                ),
                "narrow the source subpath of one of the entries".into(),
            ],
            commands: vec![],
        }
    }

    /// Suggest creating a build file
    pub fn create_build_file() -> Self {
        Self {
            action: "Create a build file".into(),
            steps: vec![
                "No stagehand.yaml found in the current directory".into(),
                "Declare stages, their inputs and commands, and an optional composition".into(),
            ],
            commands: vec![
                "# Start from the bundled demo:".into(),
                "cp demos/inference-server/stagehand.yaml .".into(),
            ],
        }
    }
}

impl std::fmt::Display for RecoverySuggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "→ {}", self.action)?;

        for step in &self.steps {
            writeln!(f, "  {}", step)?;
        }

        if !self.commands.is_empty() {
            writeln!(f)?;
            for cmd in &self.commands {
                writeln!(f, "  {}", cmd)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggestion_for_policy_fatal() {
        let err = StagehandError::PolicyFatal {
            stage: "flash-attn".into(),
            platform: "linux/arm64".into(),
            reason: "no arm64 kernels".into(),
        };

        let suggestion = RecoverySuggestion::for_error(&err).unwrap();
        let rendered = suggestion.to_string();
        assert!(rendered.contains("flash-attn"));
        assert!(rendered.contains("stagehand plan --platform linux/arm64"));
    }

    #[test]
    fn test_no_suggestion_for_io() {
        let err = StagehandError::Io {
            message: "denied".into(),
        };
        assert!(RecoverySuggestion::for_error(&err).is_none());
    }
}
