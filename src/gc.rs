//! Chunk garbage collection
//!
//! Chunks whose reference count has sat at zero for at least the grace period
//! are removed: first the index entry (only if still at zero), then the blob.
//! Both steps run under the chunk's key lock, the same lock a registration
//! holds while it decides whether to write the blob, so a registration either
//! revives the entry before the collector claims it or finds the blob gone
//! and writes it again.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::error::Result;
use crate::upload::{ChunkStore, DeduplicationService};

/// Outcome of one collection pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcReport {
    /// Zero-reference candidates considered
    pub examined: usize,
    /// Blobs removed from the chunk store
    pub deleted: usize,
}

#[derive(Clone)]
pub struct GarbageCollector {
    dedup: DeduplicationService,
    store: ChunkStore,
    min_age: Duration,
}

impl GarbageCollector {
    pub fn new(dedup: DeduplicationService, store: ChunkStore, min_age: Duration) -> Self {
        Self { dedup, store, min_age }
    }

    /// Collect up to `limit` unreferenced chunks
    pub async fn sweep(&self, limit: usize) -> Result<GcReport> {
        let age = chrono::Duration::from_std(self.min_age).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - age;
        let candidates = self.dedup.zero_ref_keys(cutoff, limit).await?;

        let mut report = GcReport {
            examined: candidates.len(),
            ..Default::default()
        };

        for key in candidates {
            let _claim = self.dedup.lock_key(&key).await;

            if !self.dedup.remove_if_zero(&key).await? {
                tracing::debug!(key = %key, "Chunk referenced again, skipping");
                continue;
            }

            if self.store.delete(&key).await? {
                report.deleted += 1;
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                deleted = report.deleted,
                "Garbage collection pass finished"
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::compute_hash;

    #[tokio::test]
    async fn test_sweeps_only_unreferenced_chunks() {
        let dedup = DeduplicationService::in_memory();
        let store = ChunkStore::in_memory();
        let live = compute_hash(b"live");
        let dead = compute_hash(b"dead");

        for key in [&live, &dead] {
            store.put(key, b"blob").await.unwrap();
            dedup.register_or_increment(key, 4).await.unwrap();
        }
        dedup.decrement(&dead).await.unwrap();

        let gc = GarbageCollector::new(dedup.clone(), store.clone(), Duration::ZERO);
        let report = gc.sweep(100).await.unwrap();

        assert_eq!(report, GcReport { examined: 1, deleted: 1 });
        assert!(store.exists(&live).await.unwrap());
        assert!(!store.exists(&dead).await.unwrap());
        assert!(dedup.entry(&dead).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_registration_while_waiting_for_claim_keeps_blob() {
        let dedup = DeduplicationService::in_memory();
        let store = ChunkStore::in_memory();
        let key = compute_hash(b"revived");

        store.put(&key, b"blob").await.unwrap();
        dedup.register_or_increment(&key, 4).await.unwrap();
        dedup.decrement(&key).await.unwrap();

        // A registration holds the key while the collector runs
        let held = dedup.lock_key(&key).await;
        let gc = GarbageCollector::new(dedup.clone(), store.clone(), Duration::ZERO);
        let sweep = tokio::spawn(async move { gc.sweep(100).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        dedup.register_or_increment(&key, 4).await.unwrap();
        drop(held);

        let report = sweep.await.unwrap().unwrap();
        assert_eq!(report.deleted, 0);
        assert!(store.exists(&key).await.unwrap());
        assert_eq!(dedup.ref_count(&key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_grace_period_protects_recent_releases() {
        let dedup = DeduplicationService::in_memory();
        let store = ChunkStore::in_memory();
        let key = compute_hash(b"recent");

        store.put(&key, b"blob").await.unwrap();
        dedup.register_or_increment(&key, 6).await.unwrap();
        dedup.decrement(&key).await.unwrap();

        let gc = GarbageCollector::new(dedup, store.clone(), Duration::from_secs(3600));
        assert_eq!(gc.sweep(100).await.unwrap(), GcReport::default());
        assert!(store.exists(&key).await.unwrap());
    }
}
