// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Content hashing for cache keys
//!
//! Uses BLAKE3 for fast, secure content hashing. Stage fingerprints are
//! computed in two phases: a stable digest over commands, declared settings,
//! upstream fingerprints and stable workspace inputs, then the full
//! fingerprint folding in the volatile workspace inputs.

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::{StagehandError, StagehandResult};
use crate::pipeline::{InputRef, StageSpec};
use crate::policy::Platform;
use crate::tree::normalize_path;
use crate::workspace::Workspace;

/// Bumped whenever the fingerprint layout changes
const FINGERPRINT_FORMAT: &str = "stagehand-fingerprint-v1";

/// Cache key of a stage output
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Parse a hex fingerprint
    pub fn parse(hex: &str) -> StagehandResult<Self> {
        if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Self(hex.to_ascii_lowercase()))
        } else {
            Err(StagehandError::store(format!("invalid fingerprint '{}'", hex)))
        }
    }

    /// Fingerprint of arbitrary bytes
    pub fn of(data: &[u8]) -> Self {
        Self(blake3::hash(data).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for display
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Both phases of a stage fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFingerprint {
    /// Digest over everything except volatile workspace inputs
    pub stable: String,
    /// Cache key
    pub full: Fingerprint,
}

/// Content hasher for generating cache keys
pub struct ContentHasher {
    hasher: Hasher,
}

impl ContentHasher {
    /// Create a new content hasher
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    /// Hash arbitrary bytes
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Hash a length-prefixed field so adjacent fields cannot run together
    pub fn field(&mut self, data: &[u8]) {
        self.hasher.update(&(data.len() as u64).to_le_bytes());
        self.hasher.update(data);
    }

    /// Finalize and get the hash
    pub fn finalize(self) -> String {
        self.hasher.finalize().to_hex().to_string()
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute a quick hash of a string
pub fn hash_string(s: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(s.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Computes stage fingerprints against a workspace snapshot
pub struct Fingerprinter<'a> {
    workspace: &'a Workspace,
    platform: &'a Platform,
}

impl<'a> Fingerprinter<'a> {
    pub fn new(workspace: &'a Workspace, platform: &'a Platform) -> Self {
        Self {
            workspace,
            platform,
        }
    }

    /// Fingerprint a stage given the fingerprints of the stages it reads
    ///
    /// The stage name is deliberately not part of the key: identical specs
    /// over identical inputs share one artifact.
    pub fn stage(
        &self,
        stage: &StageSpec,
        upstream: &HashMap<String, Fingerprint>,
    ) -> StagehandResult<StageFingerprint> {
        let stable = self.stable_digest(stage, upstream)?;

        let mut hasher = ContentHasher::new();
        hasher.field(stable.as_bytes());
        for input in stage.inputs.iter().filter(|i| i.is_volatile()) {
            let dest = normalize_path(input.dest())?;
            hasher.field(input.path().as_bytes());
            hasher.field(dest.as_bytes());
            let tree = self.workspace.snapshot(input.path(), &dest)?;
            hasher.field(tree.digest().as_bytes());
        }

        Ok(StageFingerprint {
            stable,
            full: Fingerprint(hasher.finalize()),
        })
    }

    fn stable_digest(
        &self,
        stage: &StageSpec,
        upstream: &HashMap<String, Fingerprint>,
    ) -> StagehandResult<String> {
        let mut hasher = ContentHasher::new();
        hasher.field(FINGERPRINT_FORMAT.as_bytes());
        hasher.field(self.platform.as_str().as_bytes());
        hasher.field(stage.shell.as_bytes());

        hasher.field(&(stage.commands.len() as u64).to_le_bytes());
        for command in &stage.commands {
            hasher.field(command.as_bytes());
        }

        // BTreeMap iteration is already sorted
        hasher.field(&(stage.env.len() as u64).to_le_bytes());
        for (key, value) in &stage.env {
            hasher.field(key.as_bytes());
            hasher.field(value.as_bytes());
        }

        let mut outputs: Vec<String> = stage
            .outputs
            .iter()
            .map(|o| normalize_path(o))
            .collect::<StagehandResult<_>>()?;
        outputs.sort();
        outputs.dedup();
        hasher.field(&(outputs.len() as u64).to_le_bytes());
        for output in &outputs {
            hasher.field(output.as_bytes());
        }

        hasher.field(&(stage.inputs.len() as u64).to_le_bytes());
        for input in &stage.inputs {
            let dest = normalize_path(input.dest())?;
            match input {
                InputRef::Workspace { path, volatile, .. } => {
                    let kind: &[u8] = if *volatile { b"volatile" } else { b"workspace" };
                    hasher.field(kind);
                    hasher.field(path.as_bytes());
                    hasher.field(dest.as_bytes());
                    if !volatile {
                        let tree = self.workspace.snapshot(path, &dest)?;
                        hasher.field(tree.digest().as_bytes());
                    }
                }
                InputRef::Stage {
                    stage: producer,
                    path,
                    ..
                } => {
                    let fingerprint = upstream.get(producer).ok_or_else(|| {
                        StagehandError::UnknownReference {
                            stage: stage.name.clone(),
                            reference: producer.clone(),
                        }
                    })?;
                    hasher.field(b"stage");
                    hasher.field(fingerprint.as_str().as_bytes());
                    hasher.field(normalize_path(path)?.as_bytes());
                    hasher.field(dest.as_bytes());
                }
            }
        }

        Ok(hasher.finalize())
    }
}
