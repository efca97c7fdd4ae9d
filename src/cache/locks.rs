// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Per-fingerprint async locks
//!
//! An entry lives only while some caller holds or waits on it, so the map
//! stays as small as the number of fingerprints currently in flight.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::Fingerprint;

#[derive(Default)]
pub(crate) struct KeyLocks {
    locks: DashMap<Fingerprint, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Run `critical` while holding the lock for `key`
    pub(crate) async fn run<F, T>(&self, key: &Fingerprint, critical: F) -> T
    where
        F: Future<Output = T>,
    {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            critical.await
        };

        // The map and this call hold the only references
        self.locks
            .remove_if(key, |_, held| Arc::strong_count(held) == 2);
        result
    }

    /// Number of fingerprints currently locked or waited on
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_serializes_and_drains() {
        let locks = Arc::new(KeyLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let key = Fingerprint::of(b"k");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let (locks, inside, peak, key) =
                (locks.clone(), inside.clone(), peak.clone(), key.clone());
            handles.push(tokio::spawn(async move {
                locks
                    .run(&key, async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 0);
    }
}
