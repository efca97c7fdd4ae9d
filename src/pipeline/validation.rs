// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Build file validation
//!
//! Checks a build file before anything is planned or executed.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::errors::StagehandError;
use crate::pipeline::{BuildFile, InputRef, StageGraph, StageSpec};
use crate::policy::Platform;
use crate::tree::normalize_path;

/// Build file validator
pub struct BuildValidator;

impl BuildValidator {
    /// Validate a build file
    pub fn validate(file: &BuildFile) -> ValidationResult {
        let mut result = ValidationResult::new();

        if file.stages.is_empty() {
            result.add_error("Build file has no stages defined");
        }

        let mut seen_names = HashSet::new();
        for stage in &file.stages {
            if !seen_names.insert(&stage.name) {
                result.add_error(&format!("Duplicate stage name: '{}'", stage.name));
            }
        }

        // Structure: unknown references and cycles
        match StageGraph::from_build_file(file) {
            Ok(_) => {}
            // Already reported above
            Err(StagehandError::DuplicateStage { .. }) => {}
            Err(StagehandError::CycleDetected { stages }) => {
                result.add_error(&format!("Dependency cycle between: {}", stages.join(", ")));
            }
            Err(StagehandError::UnknownReference { stage, reference }) => {
                result.add_error(&format!(
                    "Stage '{}' references unknown stage '{}'",
                    stage, reference
                ));
            }
            Err(e) => {
                result.add_error(&format!("Graph validation error: {}", e));
            }
        }

        let by_name: HashMap<&str, &StageSpec> =
            file.stages.iter().map(|s| (s.name.as_str(), s)).collect();

        for stage in &file.stages {
            Self::validate_stage(stage, &by_name, &mut result);
        }

        Self::validate_composition(file, &mut result);
        Self::validate_settings(file, &mut result);

        result
    }

    fn validate_stage(
        stage: &StageSpec,
        by_name: &HashMap<&str, &StageSpec>,
        result: &mut ValidationResult,
    ) {
        if stage.commands.is_empty() {
            result.add_error(&format!("Stage '{}': no commands", stage.name));
        }
        for command in &stage.commands {
            if command.trim().is_empty() {
                result.add_error(&format!("Stage '{}': command is empty", stage.name));
            }
        }

        for output in &stage.outputs {
            if let Err(e) = normalize_path(output) {
                result.add_error(&format!("Stage '{}': output {}", stage.name, e));
            }
        }

        for input in &stage.inputs {
            if let InputRef::Workspace { path, .. } = input {
                if glob::Pattern::new(path).is_err() {
                    result.add_error(&format!(
                        "Stage '{}': invalid input pattern '{}'",
                        stage.name, path
                    ));
                }
            } else if let Err(e) = normalize_path(input.path()) {
                result.add_error(&format!("Stage '{}': input {}", stage.name, e));
            }
            if let Err(e) = normalize_path(input.dest()) {
                result.add_error(&format!("Stage '{}': input destination {}", stage.name, e));
            }

            let Some(producer) = input.references_stage().and_then(|n| by_name.get(n)) else {
                continue;
            };

            if !stage.optional && producer.optional {
                result.add_warning(&format!(
                    "Stage '{}' depends on optional stage '{}'; the build fails on platforms that skip it",
                    stage.name, producer.name
                ));
            }

            if !covered_by_outputs(input.path(), &producer.outputs) {
                result.add_warning(&format!(
                    "Stage '{}': input '{}' is not under any declared output of '{}'",
                    stage.name,
                    input.path(),
                    producer.name
                ));
            }
        }

        if let Some(constraint) = &stage.platforms {
            for pattern in constraint.allow.iter().chain(&constraint.deny) {
                if glob::Pattern::new(pattern).is_err() {
                    result.add_error(&format!(
                        "Stage '{}': invalid platform pattern '{}'",
                        stage.name, pattern
                    ));
                }
            }
            if stage.optional && constraint.allow.is_empty() && constraint.deny.is_empty() {
                result.add_warning(&format!(
                    "Stage '{}': optional with an empty platform constraint",
                    stage.name
                ));
            }
        }
    }

    fn validate_composition(file: &BuildFile, result: &mut ValidationResult) {
        let Some(composition) = &file.composition else {
            return;
        };

        if composition.entries.is_empty() {
            result.add_warning("Composition has no entries; the final tree will be empty");
        }

        let mut destinations: HashMap<String, &str> = HashMap::new();
        for entry in &composition.entries {
            let dest = match normalize_path(&entry.dest) {
                Ok(dest) => dest,
                Err(e) => {
                    result.add_error(&format!("Composition entry '{}': {}", entry.stage, e));
                    continue;
                }
            };
            if let Err(e) = normalize_path(&entry.source) {
                result.add_error(&format!("Composition entry '{}': {}", entry.stage, e));
            }

            if let Some(first) = destinations.get(&dest) {
                if !entry.overridable {
                    result.add_error(&format!(
                        "Composition entries '{}' and '{}' both write '{}' (mark the later one override)",
                        first, entry.stage, dest
                    ));
                }
            }
            destinations.insert(dest, entry.stage.as_str());
        }
    }

    fn validate_settings(file: &BuildFile, result: &mut ValidationResult) {
        if file.settings.jobs == Some(0) {
            result.add_error("settings.jobs must be at least 1");
        }
        if let Some(platform) = &file.settings.platform {
            if Platform::parse(platform).is_err() {
                result.add_error(&format!("settings.platform '{}' is not valid", platform));
            }
        }
        if file.settings.retry.backoff_factor < 1.0 {
            result.add_warning("settings.retry.backoff_factor below 1.0 shrinks delays");
        }
    }

    /// Report workspace inputs that match nothing on disk
    pub fn validate_files(file: &BuildFile, root: &Path) -> Vec<String> {
        let mut missing = Vec::new();

        for stage in &file.stages {
            for input in &stage.inputs {
                let InputRef::Workspace { path, .. } = input else {
                    continue;
                };
                let full = root.join(path);
                let found = match glob::glob(&full.to_string_lossy()) {
                    Ok(mut paths) => paths.next().is_some(),
                    Err(_) => full.exists(),
                };
                if !found {
                    missing.push(format!(
                        "Stage '{}': workspace input not found: {}",
                        stage.name, path
                    ));
                }
            }
        }

        missing
    }
}

/// Whether `path` lies inside (or is) one of the declared outputs
fn covered_by_outputs(path: &str, outputs: &[String]) -> bool {
    let Ok(path) = normalize_path(path) else {
        return false;
    };
    if path.is_empty() {
        return true;
    }
    outputs.iter().filter_map(|o| normalize_path(o).ok()).any(|out| {
        out.is_empty() || path == out || path.starts_with(&format!("{}/", out))
    })
}

/// Result of build file validation
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }

    pub fn add_warning(&mut self, message: &str) {
        self.warnings.push(message.to_string());
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{CompositionEntry, CompositionSpec, PlatformConstraint};

    fn build(stages: Vec<StageSpec>) -> BuildFile {
        BuildFile {
            version: "1".into(),
            name: "test".into(),
            description: None,
            stages,
            composition: None,
            settings: Default::default(),
        }
    }

    #[test]
    fn test_validate_empty_build() {
        let result = BuildValidator::validate(&build(vec![]));
        assert!(!result.is_valid());
        assert!(result.errors[0].contains("no stages"));
    }

    #[test]
    fn test_validate_duplicate_names() {
        let result = BuildValidator::validate(&build(vec![
            StageSpec::new("dup").with_command("true"),
            StageSpec::new("dup").with_command("true"),
        ]));
        assert!(!result.is_valid());
        assert_eq!(
            result.errors.iter().filter(|e| e.contains("Duplicate")).count(),
            1
        );
    }

    #[test]
    fn test_validate_cycle_and_unknown() {
        let cyclic = BuildValidator::validate(&build(vec![
            StageSpec::new("a")
                .with_command("true")
                .with_input(InputRef::stage("b", "out")),
            StageSpec::new("b")
                .with_command("true")
                .with_input(InputRef::stage("a", "out")),
        ]));
        assert!(cyclic.errors.iter().any(|e| e.contains("cycle")));

        let unknown = BuildValidator::validate(&build(vec![StageSpec::new("a")
            .with_command("true")
            .with_input(InputRef::stage("ghost", "out"))]));
        assert!(unknown.errors.iter().any(|e| e.contains("ghost")));
    }

    #[test]
    fn test_warns_on_undeclared_output_and_optional_dependency() {
        let result = BuildValidator::validate(&build(vec![
            StageSpec::new("kernels")
                .with_command("make")
                .with_output("dist")
                .with_platforms(PlatformConstraint::allow(&["amd64"]))
                .optional(),
            StageSpec::new("server")
                .with_command("make")
                .with_input(InputRef::stage("kernels", "build/lib.so")),
        ]));

        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("optional stage 'kernels'")));
        assert!(result.warnings.iter().any(|w| w.contains("build/lib.so")));
    }

    #[test]
    fn test_composition_destination_clash() {
        let mut file = build(vec![
            StageSpec::new("a").with_command("true").with_output("out"),
            StageSpec::new("b").with_command("true").with_output("out"),
        ]);
        file.composition = Some(CompositionSpec::new(vec![
            CompositionEntry::new("a", "out", "bin/app"),
            CompositionEntry::new("b", "out", "bin/app"),
        ]));
        assert!(!BuildValidator::validate(&file).is_valid());

        file.composition = Some(CompositionSpec::new(vec![
            CompositionEntry::new("a", "out", "bin/app"),
            CompositionEntry::new("b", "out", "bin/app").overriding(),
        ]));
        assert!(BuildValidator::validate(&file).is_valid());
    }

    #[test]
    fn test_settings_checked() {
        let mut file = build(vec![StageSpec::new("a").with_command("true")]);
        file.settings.jobs = Some(0);
        file.settings.platform = Some("not a platform".into());
        let result = BuildValidator::validate(&file);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_validate_files_reports_missing_inputs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present.txt"), "x").unwrap();
        let file = build(vec![StageSpec::new("a")
            .with_command("true")
            .with_input(InputRef::workspace("present.txt"))
            .with_input(InputRef::workspace("absent/**"))]);

        let missing = BuildValidator::validate_files(&file, dir.path());
        assert_eq!(missing.len(), 1);
        assert!(missing[0].contains("absent"));
    }
}
