// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! In-memory artifact store, used for tests and throwaway builds

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;

use super::{Artifact, ArtifactMeta, ArtifactOrigin, ArtifactStore, Fingerprint, PinLease};
use crate::errors::StagehandResult;
use crate::tree::FileTree;

#[derive(Default)]
pub struct MemoryStore {
    artifacts: RwLock<HashMap<Fingerprint, Artifact>>,
    leases: RwLock<HashMap<String, Vec<Fingerprint>>>,
    writes: AtomicUsize,
    next_lease: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physical writes performed
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn lookup(&self, fingerprint: &Fingerprint) -> StagehandResult<Option<Artifact>> {
        let mut artifacts = self.artifacts.write().await;
        Ok(artifacts.get_mut(fingerprint).map(|artifact| {
            artifact.meta.last_used = SystemTime::now();
            artifact.clone()
        }))
    }

    async fn put(
        &self,
        fingerprint: &Fingerprint,
        origin: &ArtifactOrigin,
        tree: FileTree,
    ) -> StagehandResult<Artifact> {
        let mut artifacts = self.artifacts.write().await;
        if let Some(existing) = artifacts.get_mut(fingerprint) {
            existing.meta.stages.insert(origin.stage.clone());
            return Ok(existing.clone());
        }

        let meta = ArtifactMeta::new(fingerprint, origin, &tree);
        let artifact = Artifact::new(meta, Arc::new(tree));
        artifacts.insert(fingerprint.clone(), artifact.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(artifact)
    }

    async fn meta(&self, fingerprint: &Fingerprint) -> StagehandResult<Option<ArtifactMeta>> {
        let artifacts = self.artifacts.read().await;
        Ok(artifacts.get(fingerprint).map(|a| a.meta.clone()))
    }

    async fn list(&self) -> StagehandResult<Vec<ArtifactMeta>> {
        let artifacts = self.artifacts.read().await;
        let mut entries: Vec<ArtifactMeta> = artifacts.values().map(|a| a.meta.clone()).collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    async fn remove(&self, fingerprint: &Fingerprint) -> StagehandResult<bool> {
        Ok(self.artifacts.write().await.remove(fingerprint).is_some())
    }

    async fn clear(&self) -> StagehandResult<()> {
        self.artifacts.write().await.clear();
        Ok(())
    }

    async fn pin(&self, fingerprints: &[Fingerprint]) -> StagehandResult<PinLease> {
        let id = format!("lease-{}", self.next_lease.fetch_add(1, Ordering::SeqCst));
        self.leases
            .write()
            .await
            .insert(id.clone(), fingerprints.to_vec());
        Ok(PinLease {
            id,
            fingerprints: fingerprints.to_vec(),
        })
    }

    async fn release(&self, lease: &PinLease) -> StagehandResult<()> {
        self.leases.write().await.remove(&lease.id);
        Ok(())
    }

    async fn pinned(&self) -> StagehandResult<HashSet<Fingerprint>> {
        let leases = self.leases.read().await;
        Ok(leases.values().flatten().cloned().collect())
    }

    async fn record_stage(&self, fingerprint: &Fingerprint, stage: &str) -> StagehandResult<()> {
        if let Some(artifact) = self.artifacts.write().await.get_mut(fingerprint) {
            artifact.meta.stages.insert(stage.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> ArtifactOrigin {
        ArtifactOrigin {
            stage: "s".into(),
            stable: "x".into(),
        }
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = MemoryStore::new();
        let fp = Fingerprint::of(b"a");

        store.put(&fp, &origin(), FileTree::new()).await.unwrap();
        store.put(&fp, &origin(), FileTree::new()).await.unwrap();

        assert_eq!(store.write_count(), 1);
        assert!(store.lookup(&fp).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pins_overlap() {
        let store = MemoryStore::new();
        let fp = Fingerprint::of(b"a");

        let one = store.pin(std::slice::from_ref(&fp)).await.unwrap();
        let two = store.pin(std::slice::from_ref(&fp)).await.unwrap();
        store.release(&one).await.unwrap();
        assert!(store.pinned().await.unwrap().contains(&fp));

        store.release(&two).await.unwrap();
        assert!(store.pinned().await.unwrap().is_empty());
    }
}
