// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Single-flight access to an artifact store
//!
//! Concurrent requests for the same fingerprint are serialized on a per-key
//! lock: the first caller runs the producer, everyone queued behind it
//! observes the stored artifact.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::locks::KeyLocks;
use super::{Artifact, ArtifactOrigin, ArtifactStore, Fingerprint};
use crate::errors::StagehandError;
use crate::tree::FileTree;

/// How an artifact was obtained
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Already stored, or produced earlier in this session
    Hit(Artifact),
    /// Produced by this call
    Built(Artifact),
}

impl Resolution {
    pub fn artifact(&self) -> &Artifact {
        match self {
            Self::Hit(a) | Self::Built(a) => a,
        }
    }

    pub fn into_artifact(self) -> Artifact {
        match self {
            Self::Hit(a) | Self::Built(a) => a,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

/// Failure of [`SharedStore::get_or_produce`]
#[derive(Debug)]
pub enum ProduceError<E> {
    /// The producer failed; nothing was stored
    Producer(E),
    /// The store itself failed
    Store(StagehandError),
}

/// Artifact store wrapper that runs at most one producer per fingerprint
pub struct SharedStore {
    store: Arc<dyn ArtifactStore>,
    inflight: KeyLocks,
    /// Artifacts produced during this session
    fresh: DashMap<Fingerprint, Artifact>,
}

impl SharedStore {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            inflight: KeyLocks::new(),
            fresh: DashMap::new(),
        }
    }

    /// The wrapped store
    pub fn inner(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Return the artifact for `fingerprint`, running `producer` if needed
    ///
    /// With `use_cache` unset, previously stored artifacts are ignored but an
    /// artifact produced earlier in this session is still reused, so the
    /// producer runs at most once per fingerprint either way.
    pub async fn get_or_produce<F, Fut, E>(
        &self,
        fingerprint: &Fingerprint,
        origin: &ArtifactOrigin,
        use_cache: bool,
        producer: F,
    ) -> Result<Resolution, ProduceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FileTree, E>>,
    {
        self.inflight
            .run(fingerprint, async {
                let fresh = self.fresh.get(fingerprint).map(|a| a.clone());
                if let Some(artifact) = fresh {
                    debug!(fingerprint = %fingerprint.short(), "reusing artifact produced this session");
                    return Ok(Resolution::Hit(self.attribute(artifact, origin).await));
                }

                if use_cache {
                    if let Some(artifact) = self
                        .store
                        .lookup(fingerprint)
                        .await
                        .map_err(ProduceError::Store)?
                    {
                        return Ok(Resolution::Hit(self.attribute(artifact, origin).await));
                    }
                }

                let tree = producer().await.map_err(ProduceError::Producer)?;
                let artifact = self
                    .store
                    .put(fingerprint, origin, tree)
                    .await
                    .map_err(ProduceError::Store)?;

                self.fresh.insert(fingerprint.clone(), artifact.clone());
                Ok(Resolution::Built(artifact))
            })
            .await
    }

    /// Record the requesting stage against a reused artifact
    async fn attribute(&self, artifact: Artifact, origin: &ArtifactOrigin) -> Artifact {
        if !artifact.meta().built_for(&origin.stage) {
            if let Err(e) = self
                .store
                .record_stage(artifact.fingerprint(), &origin.stage)
                .await
            {
                warn!(stage = %origin.stage, "could not record artifact reuse: {}", e);
            }
        }
        artifact
    }

    /// Fingerprints with a producer running or queued
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}
