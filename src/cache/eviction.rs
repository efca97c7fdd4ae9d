// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Eviction policies for the artifact store
//!
//! A policy only selects candidates. [`evict`] filters out pinned
//! fingerprints before asking the policy and checks the pins again right
//! before each removal.

use std::collections::HashSet;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use super::{ArtifactMeta, ArtifactStore, Fingerprint};
use crate::errors::StagehandResult;
use crate::pipeline::EvictionSettings;

/// Selects artifacts to remove
pub trait EvictionPolicy: Send + Sync {
    /// Pick fingerprints to evict from unpinned `candidates`
    ///
    /// `total_bytes` is the size of the whole store, pinned entries included.
    fn select(&self, candidates: &[ArtifactMeta], total_bytes: u64, now: SystemTime)
        -> Vec<Fingerprint>;
}

/// Never evicts
pub struct Unbounded;

impl EvictionPolicy for Unbounded {
    fn select(&self, _: &[ArtifactMeta], _: u64, _: SystemTime) -> Vec<Fingerprint> {
        Vec::new()
    }
}

/// Evicts artifacts unused for longer than a duration
pub struct MaxAge(pub Duration);

impl EvictionPolicy for MaxAge {
    fn select(&self, candidates: &[ArtifactMeta], _: u64, now: SystemTime) -> Vec<Fingerprint> {
        candidates
            .iter()
            .filter(|m| now.duration_since(m.last_used).unwrap_or_default() > self.0)
            .map(|m| m.fingerprint.clone())
            .collect()
    }
}

/// Evicts least-recently-used artifacts until the store fits in a byte budget
pub struct MaxSize(pub u64);

impl EvictionPolicy for MaxSize {
    fn select(&self, candidates: &[ArtifactMeta], total_bytes: u64, _: SystemTime) -> Vec<Fingerprint> {
        let mut ordered: Vec<&ArtifactMeta> = candidates.iter().collect();
        ordered.sort_by(|a, b| {
            a.last_used
                .cmp(&b.last_used)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });

        let mut remaining = total_bytes;
        let mut selected = Vec::new();
        for meta in ordered {
            if remaining <= self.0 {
                break;
            }
            remaining = remaining.saturating_sub(meta.size_bytes);
            selected.push(meta.fingerprint.clone());
        }
        selected
    }
}

/// Applies each policy in turn to what the previous ones left behind
pub struct AnyOf(pub Vec<Box<dyn EvictionPolicy>>);

impl EvictionPolicy for AnyOf {
    fn select(&self, candidates: &[ArtifactMeta], total_bytes: u64, now: SystemTime) -> Vec<Fingerprint> {
        let mut remaining: Vec<ArtifactMeta> = candidates.to_vec();
        let mut total = total_bytes;
        let mut selected = Vec::new();

        for policy in &self.0 {
            let chosen: HashSet<Fingerprint> =
                policy.select(&remaining, total, now).into_iter().collect();
            remaining.retain(|m| {
                if chosen.contains(&m.fingerprint) {
                    total = total.saturating_sub(m.size_bytes);
                    false
                } else {
                    true
                }
            });
            selected.extend(chosen);
        }

        selected.sort();
        selected
    }
}

/// Build the policy described by store settings
pub fn policy_from_settings(settings: &EvictionSettings) -> Box<dyn EvictionPolicy> {
    let mut policies: Vec<Box<dyn EvictionPolicy>> = Vec::new();
    if let Some(secs) = settings.max_age_secs {
        policies.push(Box::new(MaxAge(Duration::from_secs(secs))));
    }
    if let Some(bytes) = settings.max_size_bytes {
        policies.push(Box::new(MaxSize(bytes)));
    }

    match policies.len() {
        0 => Box::new(Unbounded),
        1 => policies.remove(0),
        _ => Box::new(AnyOf(policies)),
    }
}

/// Outcome of an eviction pass
#[derive(Debug, Clone, Default)]
pub struct EvictionReport {
    pub removed: Vec<Fingerprint>,
    pub freed_bytes: u64,
    /// Selected but pinned by the time removal was attempted
    pub skipped_pinned: usize,
}

/// Run one eviction pass over a store
pub async fn evict(
    store: &dyn ArtifactStore,
    policy: &dyn EvictionPolicy,
) -> StagehandResult<EvictionReport> {
    let entries = store.list().await?;
    let total_bytes: u64 = entries.iter().map(|m| m.size_bytes).sum();
    let pinned = store.pinned().await?;

    let candidates: Vec<ArtifactMeta> = entries
        .into_iter()
        .filter(|m| !pinned.contains(&m.fingerprint))
        .collect();

    let selected = policy.select(&candidates, total_bytes, SystemTime::now());
    let mut report = EvictionReport::default();

    for fingerprint in selected {
        if store.pinned().await?.contains(&fingerprint) {
            report.skipped_pinned += 1;
            continue;
        }

        let size = candidates
            .iter()
            .find(|m| m.fingerprint == fingerprint)
            .map(|m| m.size_bytes)
            .unwrap_or_default();

        match store.remove(&fingerprint).await {
            Ok(true) => {
                debug!(fingerprint = %fingerprint.short(), "evicted");
                report.freed_bytes += size;
                report.removed.push(fingerprint);
            }
            Ok(false) => {}
            Err(e) => warn!(fingerprint = %fingerprint.short(), "eviction failed: {}", e),
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ArtifactOrigin, MemoryStore};
    use crate::tree::FileTree;

    fn meta(name: &[u8], size: u64, age_secs: u64, now: SystemTime) -> ArtifactMeta {
        let at = now - Duration::from_secs(age_secs);
        ArtifactMeta {
            fingerprint: Fingerprint::of(name),
            stage: "s".into(),
            stages: Default::default(),
            stable: "x".into(),
            created_at: at,
            last_used: at,
            size_bytes: size,
            file_count: 1,
        }
    }

    #[test]
    fn test_max_size_evicts_least_recently_used() {
        let now = SystemTime::now();
        let entries = vec![
            meta(b"new", 10, 1, now),
            meta(b"old", 10, 100, now),
            meta(b"mid", 10, 50, now),
        ];

        let selected = MaxSize(15).select(&entries, 30, now);
        assert_eq!(selected, vec![Fingerprint::of(b"old"), Fingerprint::of(b"mid")]);
    }

    #[test]
    fn test_max_age() {
        let now = SystemTime::now();
        let entries = vec![meta(b"new", 1, 1, now), meta(b"old", 1, 100, now)];

        let selected = MaxAge(Duration::from_secs(10)).select(&entries, 2, now);
        assert_eq!(selected, vec![Fingerprint::of(b"old")]);
    }

    #[test]
    fn test_from_settings() {
        let now = SystemTime::now();
        let entries = vec![meta(b"a", 1, 1, now)];

        let unbounded = policy_from_settings(&EvictionSettings::default());
        assert!(unbounded.select(&entries, 1, now).is_empty());

        let bounded = policy_from_settings(&EvictionSettings {
            max_size_bytes: Some(0),
            max_age_secs: Some(3600),
        });
        assert_eq!(bounded.select(&entries, 1, now).len(), 1);
    }

    #[tokio::test]
    async fn test_evict_never_removes_pinned() {
        let store = MemoryStore::new();
        let origin = ArtifactOrigin {
            stage: "s".into(),
            stable: "x".into(),
        };
        let keep = Fingerprint::of(b"keep");
        let drop = Fingerprint::of(b"drop");
        let tree = FileTree::new().with_file("f", vec![0u8; 64]).unwrap();

        store.put(&keep, &origin, tree.clone()).await.unwrap();
        store.put(&drop, &origin, tree).await.unwrap();
        let lease = store.pin(std::slice::from_ref(&keep)).await.unwrap();

        let report = evict(&store, &MaxSize(0)).await.unwrap();
        assert_eq!(report.removed, vec![drop.clone()]);
        assert!(store.lookup(&keep).await.unwrap().is_some());

        store.release(&lease).await.unwrap();
        let report = evict(&store, &MaxSize(0)).await.unwrap();
        assert_eq!(report.removed, vec![keep]);
    }
}
