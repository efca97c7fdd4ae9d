// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Platform policy evaluation
//!
//! Decides per stage whether a target platform is allowed, skipped or
//! fatally rejected. Decisions are made while planning so an unsupported
//! platform is reported before any step runs.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{StagehandError, StagehandResult};
use crate::pipeline::{PlatformConstraint, StageSpec};

const PLATFORM_SYNTAX: &str = r"^[a-z0-9_.-]+(/[a-z0-9_.-]+){0,2}$";

/// A normalized target platform identifier (`os/arch[/variant]` or `arch`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform(String);

impl Platform {
    /// Parse and normalize a platform identifier
    pub fn parse(raw: &str) -> StagehandResult<Self> {
        let lowered = raw.trim().to_lowercase();
        let syntax = Regex::new(PLATFORM_SYNTAX).map_err(|_| StagehandError::InvalidPlatform {
            platform: raw.to_string(),
        })?;

        if !syntax.is_match(&lowered) {
            return Err(StagehandError::InvalidPlatform {
                platform: raw.to_string(),
            });
        }

        Ok(Self(normalize_components(&lowered)))
    }

    /// The platform this process is running on
    pub fn host() -> Self {
        Self(normalize_components(&format!(
            "{}/{}",
            std::env::consts::OS,
            std::env::consts::ARCH
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Operating system component, if present
    pub fn os(&self) -> Option<&str> {
        let mut parts = self.0.split('/');
        let first = parts.next()?;
        parts.next().map(|_| first)
    }

    /// Architecture component
    pub fn arch(&self) -> &str {
        let parts: Vec<&str> = self.0.split('/').collect();
        if parts.len() == 1 {
            parts[0]
        } else {
            parts[1]
        }
    }

    /// Check the platform against a glob pattern
    ///
    /// A bare pattern (`arm64`, `arm*`) is matched against the architecture
    /// only; a pattern with an OS component is matched against the full
    /// identifier, or against the architecture when this platform has none.
    pub fn matches(&self, pattern: &str) -> bool {
        let pattern = normalize_components(&pattern.trim().to_lowercase());

        if !pattern.contains('/') {
            return glob_match(&pattern, self.arch());
        }

        if self.os().is_none() {
            let arch_pattern = pattern.split('/').nth(1).unwrap_or_default();
            return glob_match(arch_pattern, self.arch());
        }

        glob_match(&pattern, &self.0)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Platform {
    type Err = StagehandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn normalize_arch(arch: &str) -> &str {
    match arch {
        "x86_64" | "x86-64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

fn normalize_components(raw: &str) -> String {
    let parts: Vec<&str> = raw.split('/').collect();
    let arch_index = if parts.len() == 1 { 0 } else { 1 };
    parts
        .iter()
        .enumerate()
        .map(|(i, p)| if i == arch_index { normalize_arch(p) } else { p })
        .collect::<Vec<_>>()
        .join("/")
}

fn glob_match(pattern: &str, value: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches(value),
        Err(_) => pattern == value,
    }
}

/// Result of evaluating a stage against a platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allowed,
    Skipped(String),
    Fatal(String),
}

/// Platform policy evaluator
pub struct PlatformPolicy;

impl PlatformPolicy {
    /// Evaluate one stage in isolation
    ///
    /// Unmatched optional stages are skipped and unmatched required stages
    /// are fatal. The planner upgrades a skip to fatal when a remaining stage
    /// still depends on the skipped one.
    pub fn evaluate(stage: &StageSpec, platform: &Platform) -> PolicyDecision {
        let Some(constraint) = &stage.platforms else {
            return PolicyDecision::Allowed;
        };

        if Self::permits(constraint, platform) {
            return PolicyDecision::Allowed;
        }

        let reason = constraint
            .reason
            .clone()
            .unwrap_or_else(|| format!("platform '{}' is not supported", platform));

        if stage.optional {
            PolicyDecision::Skipped(reason)
        } else {
            PolicyDecision::Fatal(reason)
        }
    }

    /// Whether a constraint admits the platform
    pub fn permits(constraint: &PlatformConstraint, platform: &Platform) -> bool {
        let allowed = constraint.allow.is_empty()
            || constraint.allow.iter().any(|p| platform.matches(p));
        let denied = constraint.deny.iter().any(|p| platform.matches(p));
        allowed && !denied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(s: &str) -> Platform {
        Platform::parse(s).unwrap()
    }

    #[test]
    fn test_parse_normalizes_aliases() {
        assert_eq!(platform("linux/x86_64").as_str(), "linux/amd64");
        assert_eq!(platform("AARCH64").as_str(), "arm64");
        assert_eq!(platform("linux/arm64/v8").arch(), "arm64");
        assert_eq!(platform("linux/arm64").os(), Some("linux"));
        assert_eq!(platform("arm64").os(), None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Platform::parse("linux amd64").is_err());
        assert!(Platform::parse("").is_err());
        assert!(Platform::parse("a/b/c/d").is_err());
    }

    #[test]
    fn test_matches() {
        let p = platform("linux/arm64");
        assert!(p.matches("arm64"));
        assert!(p.matches("aarch64"));
        assert!(p.matches("linux/*"));
        assert!(!p.matches("amd64"));
        assert!(platform("arm64").matches("linux/arm64"));
    }

    #[test]
    fn test_unconstrained_stage_allowed() {
        let stage = StageSpec::new("router");
        assert_eq!(
            PlatformPolicy::evaluate(&stage, &platform("linux/arm64")),
            PolicyDecision::Allowed
        );
    }

    #[test]
    fn test_required_stage_fatal() {
        let stage = StageSpec::new("flash-attn")
            .with_platforms(PlatformConstraint::deny(&["arm64"]).because("no arm64 kernels"));

        assert_eq!(
            PlatformPolicy::evaluate(&stage, &platform("linux/arm64")),
            PolicyDecision::Fatal("no arm64 kernels".into())
        );
        assert_eq!(
            PlatformPolicy::evaluate(&stage, &platform("linux/amd64")),
            PolicyDecision::Allowed
        );
    }

    #[test]
    fn test_optional_stage_skipped() {
        let stage = StageSpec::new("exllama")
            .with_platforms(PlatformConstraint::allow(&["amd64"]))
            .optional();

        assert!(matches!(
            PlatformPolicy::evaluate(&stage, &platform("arm64")),
            PolicyDecision::Skipped(_)
        ));
    }
}
