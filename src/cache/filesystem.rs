// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Filesystem-based artifact store
//!
//! Layout under the store root:
//!
//! ```text
//! objects/<fp[0..2]>/<fp>/tree/      artifact files
//! objects/<fp[0..2]>/<fp>/meta.json  artifact metadata
//! tmp/                               staging area for atomic writes
//! pins/<lease>.json                  pin leases
//! ```
//!
//! Writes are staged under `tmp/` and renamed into place, so a concurrent
//! writer in another process either wins the rename or finds the object
//! already present.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use super::locks::KeyLocks;
use super::{Artifact, ArtifactMeta, ArtifactOrigin, ArtifactStore, Fingerprint, PinLease};
use crate::errors::{StagehandError, StagehandResult};
use crate::tree::FileTree;

const META_FILE: &str = "meta.json";
const TREE_DIR: &str = "tree";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// On-disk pin lease
#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    fingerprints: Vec<Fingerprint>,
    created_at: SystemTime,
}

/// Filesystem-based artifact store
pub struct FilesystemStore {
    /// Store root directory
    root: PathBuf,
    /// Leases older than this are ignored
    pin_ttl: Duration,
    /// In-process write locks, one per fingerprint
    locks: KeyLocks,
}

impl FilesystemStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> StagehandResult<Self> {
        let root = root.into();
        for dir in ["objects", "tmp", "pins"] {
            std::fs::create_dir_all(root.join(dir)).map_err(|e| {
                StagehandError::store(format!(
                    "Failed to create store directory {}: {}",
                    root.join(dir).display(),
                    e
                ))
            })?;
        }

        Ok(Self {
            root,
            pin_ttl: Duration::from_secs(24 * 60 * 60),
            locks: KeyLocks::new(),
        })
    }

    /// Set the age after which unreleased leases are considered stale
    pub fn with_pin_ttl(mut self, ttl: Duration) -> Self {
        self.pin_ttl = ttl;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one object
    fn object_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let key = fingerprint.as_str();
        let (prefix, _) = key.split_at(2.min(key.len()));
        self.root.join("objects").join(prefix).join(key)
    }

    fn unique_name(prefix: &str) -> String {
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        format!("{}-{}-{}-{}", prefix, std::process::id(), nanos, seq)
    }

    async fn read_meta(path: &Path) -> StagehandResult<Option<ArtifactMeta>> {
        let content = match tokio::fs::read_to_string(path.join(META_FILE)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StagehandError::store(format!(
                    "Failed to read artifact metadata: {}",
                    e
                )))
            }
        };

        let meta = serde_json::from_str(&content).map_err(|e| {
            StagehandError::store(format!("Failed to parse artifact metadata: {}", e))
        })?;
        Ok(Some(meta))
    }

    /// Replace `meta.json` atomically
    async fn write_meta(&self, object: &Path, meta: &ArtifactMeta) -> StagehandResult<()> {
        let json = serde_json::to_string_pretty(meta)?;
        let staging = self.root.join("tmp").join(Self::unique_name("meta"));
        tokio::fs::write(&staging, json).await?;
        tokio::fs::rename(&staging, object.join(META_FILE))
            .await
            .map_err(|e| StagehandError::store(format!("Failed to update metadata: {}", e)))
    }

    async fn load(&self, object: PathBuf, meta: ArtifactMeta) -> StagehandResult<Artifact> {
        let tree_dir = object.join(TREE_DIR);
        let tree = tokio::task::spawn_blocking(move || FileTree::load_at(&tree_dir, "", &[]))
            .await
            .map_err(|e| StagehandError::store(format!("Artifact load task failed: {}", e)))??;
        Ok(Artifact::new(meta, Arc::new(tree)))
    }

    async fn put_locked(
        &self,
        fingerprint: &Fingerprint,
        origin: &ArtifactOrigin,
        tree: FileTree,
    ) -> StagehandResult<Artifact> {
        let object = self.object_path(fingerprint);
        if let Some(meta) = Self::read_meta(&object).await? {
            debug!(fingerprint = %fingerprint.short(), "artifact already stored");
            let meta = self.add_stage(&object, meta, &origin.stage).await?;
            return self.load(object, meta).await;
        }

        let meta = ArtifactMeta::new(fingerprint, origin, &tree);
        let staging = self.root.join("tmp").join(Self::unique_name(fingerprint.short()));
        let tree = Arc::new(tree);

        let write_tree = tree.clone();
        let write_meta = meta.clone();
        let write_dir = staging.clone();
        tokio::task::spawn_blocking(move || -> StagehandResult<()> {
            write_tree.write_to(&write_dir.join(TREE_DIR))?;
            let json = serde_json::to_string_pretty(&write_meta)?;
            std::fs::write(write_dir.join(META_FILE), json)?;
            Ok(())
        })
        .await
        .map_err(|e| StagehandError::store(format!("Artifact write task failed: {}", e)))??;

        if let Some(parent) = object.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match tokio::fs::rename(&staging, &object).await {
            Ok(()) => {
                debug!(fingerprint = %fingerprint.short(), stage = %origin.stage, "artifact stored");
                Ok(Artifact::new(meta, tree))
            }
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                // Another process won the rename
                match Self::read_meta(&object).await? {
                    Some(existing) => {
                        let existing = self.add_stage(&object, existing, &origin.stage).await?;
                        self.load(object, existing).await
                    }
                    None => Err(StagehandError::store(format!(
                        "Failed to store artifact {}: {}",
                        fingerprint.short(),
                        e
                    ))),
                }
            }
        }
    }

    /// Record `stage` in the object's metadata if it is not there yet
    async fn add_stage(
        &self,
        object: &Path,
        mut meta: ArtifactMeta,
        stage: &str,
    ) -> StagehandResult<ArtifactMeta> {
        if meta.stages.insert(stage.to_string()) {
            self.write_meta(object, &meta).await?;
        }
        Ok(meta)
    }

    async fn remove_locked(&self, fingerprint: &Fingerprint) -> StagehandResult<bool> {
        let object = self.object_path(fingerprint);
        if !object.exists() {
            return Ok(false);
        }

        // Move aside first so readers never observe a half-deleted object
        let doomed = self.root.join("tmp").join(Self::unique_name("evict"));
        tokio::fs::rename(&object, &doomed)
            .await
            .map_err(|e| StagehandError::store(format!("Failed to remove artifact: {}", e)))?;
        tokio::fs::remove_dir_all(&doomed)
            .await
            .map_err(|e| StagehandError::store(format!("Failed to remove artifact: {}", e)))?;

        Ok(true)
    }

    fn list_blocking(objects: &Path) -> StagehandResult<Vec<ArtifactMeta>> {
        let mut entries = Vec::new();
        if !objects.exists() {
            return Ok(entries);
        }

        for prefix_dir in std::fs::read_dir(objects)? {
            let prefix_dir = prefix_dir?.path();
            if !prefix_dir.is_dir() {
                continue;
            }

            for object in std::fs::read_dir(&prefix_dir)? {
                let meta_path = object?.path().join(META_FILE);
                // Skip unreadable entries rather than failing the listing
                if let Ok(content) = std::fs::read_to_string(&meta_path) {
                    match serde_json::from_str::<ArtifactMeta>(&content) {
                        Ok(meta) => entries.push(meta),
                        Err(e) => warn!(path = %meta_path.display(), "corrupt metadata: {}", e),
                    }
                }
            }
        }

        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }
}

#[async_trait]
impl ArtifactStore for FilesystemStore {
    async fn lookup(&self, fingerprint: &Fingerprint) -> StagehandResult<Option<Artifact>> {
        let object = self.object_path(fingerprint);
        let refreshed = self
            .locks
            .run(fingerprint, async {
                let Some(mut meta) = Self::read_meta(&object).await? else {
                    return Ok(None);
                };
                meta.last_used = SystemTime::now();
                if let Err(e) = self.write_meta(&object, &meta).await {
                    debug!(fingerprint = %fingerprint.short(), "could not refresh last_used: {}", e);
                }
                Ok::<_, StagehandError>(Some(meta))
            })
            .await?;

        match refreshed {
            Some(meta) => self.load(object, meta).await.map(Some),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        fingerprint: &Fingerprint,
        origin: &ArtifactOrigin,
        tree: FileTree,
    ) -> StagehandResult<Artifact> {
        self.locks
            .run(fingerprint, self.put_locked(fingerprint, origin, tree))
            .await
    }

    async fn meta(&self, fingerprint: &Fingerprint) -> StagehandResult<Option<ArtifactMeta>> {
        Self::read_meta(&self.object_path(fingerprint)).await
    }

    async fn list(&self) -> StagehandResult<Vec<ArtifactMeta>> {
        let objects = self.root.join("objects");
        tokio::task::spawn_blocking(move || Self::list_blocking(&objects))
            .await
            .map_err(|e| StagehandError::store(format!("Store listing task failed: {}", e)))?
    }

    async fn remove(&self, fingerprint: &Fingerprint) -> StagehandResult<bool> {
        self.locks
            .run(fingerprint, self.remove_locked(fingerprint))
            .await
    }

    async fn clear(&self) -> StagehandResult<()> {
        let objects = self.root.join("objects");
        if objects.exists() {
            tokio::fs::remove_dir_all(&objects).await.map_err(|e| {
                StagehandError::store(format!("Failed to clear store: {}", e))
            })?;
        }

        tokio::fs::create_dir_all(&objects).await.map_err(|e| {
            StagehandError::store(format!("Failed to recreate store directory: {}", e))
        })?;

        Ok(())
    }

    async fn pin(&self, fingerprints: &[Fingerprint]) -> StagehandResult<PinLease> {
        let lease = PinLease {
            id: Self::unique_name("lease"),
            fingerprints: fingerprints.to_vec(),
        };
        let record = LeaseRecord {
            fingerprints: lease.fingerprints.clone(),
            created_at: SystemTime::now(),
        };

        let path = self.root.join("pins").join(format!("{}.json", lease.id));
        tokio::fs::write(&path, serde_json::to_string(&record)?)
            .await
            .map_err(|e| StagehandError::store(format!("Failed to write pin lease: {}", e)))?;

        Ok(lease)
    }

    async fn release(&self, lease: &PinLease) -> StagehandResult<()> {
        let path = self.root.join("pins").join(format!("{}.json", lease.id));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StagehandError::store(format!(
                "Failed to release pin lease: {}",
                e
            ))),
        }
    }

    async fn pinned(&self) -> StagehandResult<HashSet<Fingerprint>> {
        let mut pinned = HashSet::new();
        let mut dir = tokio::fs::read_dir(self.root.join("pins")).await?;
        let now = SystemTime::now();

        while let Some(entry) = dir.next_entry().await? {
            let Ok(content) = tokio::fs::read_to_string(entry.path()).await else {
                continue;
            };
            let Ok(record) = serde_json::from_str::<LeaseRecord>(&content) else {
                continue;
            };

            let age = now.duration_since(record.created_at).unwrap_or_default();
            if age > self.pin_ttl {
                debug!(lease = %entry.path().display(), "ignoring stale pin lease");
                continue;
            }
            pinned.extend(record.fingerprints);
        }

        Ok(pinned)
    }

    async fn record_stage(&self, fingerprint: &Fingerprint, stage: &str) -> StagehandResult<()> {
        self.locks
            .run(fingerprint, async {
                let object = self.object_path(fingerprint);
                if let Some(meta) = Self::read_meta(&object).await? {
                    self.add_stage(&object, meta, stage).await?;
                }
                Ok(())
            })
            .await
    }
}
