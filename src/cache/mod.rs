// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Content-addressed artifact store
//!
//! Stage output trees are stored under their fingerprint and never mutated.
//! Stores guarantee at most one physical write per fingerprint; the
//! [`SharedStore`] wrapper extends that to at most one *producer* per
//! fingerprint among concurrent callers.

mod eviction;
mod filesystem;
mod hash;
mod locks;
mod memory;
mod shared;

pub use eviction::{
    evict, policy_from_settings, AnyOf, EvictionPolicy, EvictionReport, MaxAge, MaxSize, Unbounded,
};
pub use filesystem::FilesystemStore;
pub use hash::{hash_string, ContentHasher, Fingerprint, Fingerprinter, StageFingerprint};
pub use memory::MemoryStore;
pub use shared::{ProduceError, Resolution, SharedStore};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::SystemTime;

use crate::errors::StagehandResult;
use crate::tree::FileTree;

/// Trait for artifact store implementations
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Fetch an artifact, refreshing its last-used time
    async fn lookup(&self, fingerprint: &Fingerprint) -> StagehandResult<Option<Artifact>>;

    /// Store a tree under a fingerprint
    ///
    /// If the fingerprint is already present the existing artifact is
    /// returned and `tree` is discarded.
    async fn put(
        &self,
        fingerprint: &Fingerprint,
        origin: &ArtifactOrigin,
        tree: FileTree,
    ) -> StagehandResult<Artifact>;

    /// Metadata only, without loading the tree
    async fn meta(&self, fingerprint: &Fingerprint) -> StagehandResult<Option<ArtifactMeta>>;

    /// Metadata of every stored artifact
    async fn list(&self) -> StagehandResult<Vec<ArtifactMeta>>;

    /// Remove one artifact
    async fn remove(&self, fingerprint: &Fingerprint) -> StagehandResult<bool>;

    /// Remove every artifact
    async fn clear(&self) -> StagehandResult<()>;

    /// Protect fingerprints from eviction until the lease is released
    async fn pin(&self, fingerprints: &[Fingerprint]) -> StagehandResult<PinLease>;

    /// Release a lease taken with [`ArtifactStore::pin`]
    async fn release(&self, lease: &PinLease) -> StagehandResult<()>;

    /// Fingerprints currently protected by live leases
    async fn pinned(&self) -> StagehandResult<HashSet<Fingerprint>>;

    /// Note that `stage` resolved to an already stored artifact
    ///
    /// Fingerprints do not include the stage name, so one artifact can serve
    /// several stages.
    async fn record_stage(&self, fingerprint: &Fingerprint, stage: &str) -> StagehandResult<()>;

    /// Get store statistics
    async fn stats(&self) -> StagehandResult<StoreStats> {
        let entries = self.list().await?;
        Ok(StoreStats::from_entries(&entries))
    }
}

/// Provenance recorded alongside an artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactOrigin {
    /// Stage that produced the tree
    pub stage: String,
    /// Stable-phase digest of the producing stage
    pub stable: String,
}

/// Persisted artifact metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub fingerprint: Fingerprint,
    /// Stage that first produced the artifact
    pub stage: String,
    /// Every stage that has resolved to this artifact
    #[serde(default)]
    pub stages: BTreeSet<String>,
    pub stable: String,
    pub created_at: SystemTime,
    pub last_used: SystemTime,
    pub size_bytes: u64,
    pub file_count: usize,
}

impl ArtifactMeta {
    pub(crate) fn new(fingerprint: &Fingerprint, origin: &ArtifactOrigin, tree: &FileTree) -> Self {
        let now = SystemTime::now();
        Self {
            fingerprint: fingerprint.clone(),
            stage: origin.stage.clone(),
            stages: BTreeSet::from([origin.stage.clone()]),
            stable: origin.stable.clone(),
            created_at: now,
            last_used: now,
            size_bytes: tree.size_bytes(),
            file_count: tree.len(),
        }
    }

    /// Whether `stage` has produced or reused this artifact
    pub fn built_for(&self, stage: &str) -> bool {
        self.stage == stage || self.stages.contains(stage)
    }
}

/// An immutable stage output held by the store
#[derive(Debug, Clone)]
pub struct Artifact {
    meta: ArtifactMeta,
    tree: Arc<FileTree>,
}

impl Artifact {
    pub fn new(meta: ArtifactMeta, tree: Arc<FileTree>) -> Self {
        Self { meta, tree }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.meta.fingerprint
    }

    /// Stage that originally produced this artifact
    pub fn stage(&self) -> &str {
        &self.meta.stage
    }

    pub fn tree(&self) -> &FileTree {
        &self.tree
    }

    pub fn meta(&self) -> &ArtifactMeta {
        &self.meta
    }
}

/// A set of fingerprints protected from eviction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinLease {
    pub id: String,
    pub fingerprints: Vec<Fingerprint>,
}

/// Store statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of stored artifacts
    pub entries: usize,
    /// Total size in bytes
    pub size_bytes: u64,
    /// Oldest entry timestamp
    pub oldest_entry: Option<SystemTime>,
    /// Newest entry timestamp
    pub newest_entry: Option<SystemTime>,
}

impl StoreStats {
    pub fn from_entries(entries: &[ArtifactMeta]) -> Self {
        Self {
            entries: entries.len(),
            size_bytes: entries.iter().map(|e| e.size_bytes).sum(),
            oldest_entry: entries.iter().map(|e| e.created_at).min(),
            newest_entry: entries.iter().map(|e| e.created_at).max(),
        }
    }

    /// Format size for display
    pub fn formatted_size(&self) -> String {
        format_bytes(self.size_bytes)
    }
}

/// Human-readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
