//! Deduplication Service
//!
//! Reference counts for stored chunks, keyed by object key. A chunk whose
//! count is above zero is live; a count of zero marks it as a garbage
//! collection candidate. The blob itself is only ever removed by the
//! collector, never by a decrement.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::types::ChunkRef;
use crate::error::Result;

// ============================================================================
// Index Trait
// ============================================================================

/// Backend for chunk reference counts.
///
/// `register_or_increment` and `decrement` must be atomic per key: two
/// concurrent registrations of the same key always yield a count of 2.
#[async_trait::async_trait]
pub trait DedupIndex: Send + Sync {
    /// Whether the key is known with a positive reference count
    async fn lookup(&self, key: &str) -> Result<bool>;

    /// Insert with count 1, or increment. Returns the new count.
    async fn register_or_increment(&self, key: &str, size: u64) -> Result<u64>;

    /// Decrement, flooring at zero. Unknown keys report zero.
    async fn decrement(&self, key: &str) -> Result<u64>;

    /// Current count, zero if unknown
    async fn ref_count(&self, key: &str) -> Result<u64>;

    /// Full entry for a key
    async fn entry(&self, key: &str) -> Result<Option<ChunkRef>>;

    /// Keys at zero references whose last change is at or before `older_than`
    async fn zero_ref_keys(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<String>>;

    /// Drop the entry only if it is still at zero. Returns whether it was removed.
    async fn remove_if_zero(&self, key: &str) -> Result<bool>;

    /// Aggregate counters
    async fn stats(&self) -> Result<DedupStats>;
}

/// Deduplication statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupStats {
    /// Chunks with at least one reference
    pub unique_chunks: u64,

    /// Sum of all reference counts
    pub total_refs: u64,

    /// Plaintext bytes held by live chunks
    pub unique_bytes: u64,

    /// Bytes that would have been stored again without deduplication
    pub saved_bytes: u64,
}

// ============================================================================
// Deduplication Service
// ============================================================================

/// Service for tracking chunk references across sessions and manifests
#[derive(Clone)]
pub struct DeduplicationService {
    inner: Arc<DeduplicationServiceInner>,
}

/// Striped locks serializing blob writes, pins and collection per key
const KEY_LOCK_STRIPES: usize = 256;

struct DeduplicationServiceInner {
    index: Arc<dyn DedupIndex>,
    key_locks: Vec<Arc<AsyncMutex<()>>>,
}

impl DeduplicationService {
    /// Create with a custom index backend
    pub fn new(index: Arc<dyn DedupIndex>) -> Self {
        let key_locks = (0..KEY_LOCK_STRIPES)
            .map(|_| Arc::new(AsyncMutex::new(())))
            .collect();

        Self {
            inner: Arc::new(DeduplicationServiceInner { index, key_locks }),
        }
    }

    /// Create with an in-process index
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryDedupIndex::new()))
    }

    /// Create backed by SQLite
    pub fn with_sqlite(db: SqlitePool) -> Self {
        Self::new(Arc::new(SqliteDedupIndex::new(db)))
    }

    /// Enter the critical section for `key`.
    ///
    /// Held while deciding whether a blob must be written, while pinning an
    /// existing chunk and while collecting one. Never hold two at once.
    /// Exclusion is per process; across instances the collector's grace
    /// period is the only guard.
    pub async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let stripe = (hasher.finish() % KEY_LOCK_STRIPES as u64) as usize;
        self.inner.key_locks[stripe].clone().lock_owned().await
    }

    /// Check whether a chunk is already stored and referenced
    pub async fn lookup(&self, key: &str) -> Result<bool> {
        self.inner.index.lookup(key).await
    }

    /// Add a reference to a chunk, creating the entry on first sight
    pub async fn register_or_increment(&self, key: &str, size: u64) -> Result<u64> {
        let count = self.inner.index.register_or_increment(key, size).await?;

        tracing::debug!(key = %key, ref_count = count, "Chunk reference added");
        Ok(count)
    }

    /// Release a reference to a chunk
    pub async fn decrement(&self, key: &str) -> Result<u64> {
        let count = self.inner.index.decrement(key).await?;

        if count == 0 {
            tracing::debug!(key = %key, "Chunk has no remaining references");
        }
        Ok(count)
    }

    pub async fn ref_count(&self, key: &str) -> Result<u64> {
        self.inner.index.ref_count(key).await
    }

    pub async fn entry(&self, key: &str) -> Result<Option<ChunkRef>> {
        self.inner.index.entry(key).await
    }

    /// Collection candidates, oldest first
    pub async fn zero_ref_keys(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        self.inner.index.zero_ref_keys(older_than, limit).await
    }

    pub async fn remove_if_zero(&self, key: &str) -> Result<bool> {
        self.inner.index.remove_if_zero(key).await
    }

    pub async fn stats(&self) -> Result<DedupStats> {
        self.inner.index.stats().await
    }
}

// ============================================================================
// In-Memory Index
// ============================================================================

/// Reference counts held in process memory
#[derive(Default)]
pub struct MemoryDedupIndex {
    entries: Mutex<HashMap<String, ChunkRef>>,
}

impl MemoryDedupIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DedupIndex for MemoryDedupIndex {
    async fn lookup(&self, key: &str) -> Result<bool> {
        Ok(self
            .entries
            .lock()
            .get(key)
            .map(|e| e.ref_count > 0)
            .unwrap_or(false))
    }

    async fn register_or_increment(&self, key: &str, size: u64) -> Result<u64> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(|| ChunkRef {
            hash: key.to_string(),
            size,
            ref_count: 0,
            created_at: now,
            updated_at: now,
        });
        entry.ref_count += 1;
        entry.updated_at = now;
        Ok(entry.ref_count)
    }

    async fn decrement(&self, key: &str) -> Result<u64> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                entry.updated_at = Utc::now();
                Ok(entry.ref_count)
            }
            None => Ok(0),
        }
    }

    async fn ref_count(&self, key: &str) -> Result<u64> {
        Ok(self.entries.lock().get(key).map(|e| e.ref_count).unwrap_or(0))
    }

    async fn entry(&self, key: &str) -> Result<Option<ChunkRef>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn zero_ref_keys(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let entries = self.entries.lock();
        let mut candidates: Vec<&ChunkRef> = entries
            .values()
            .filter(|e| e.ref_count == 0 && e.updated_at <= older_than)
            .collect();
        candidates.sort_by_key(|e| e.updated_at);

        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|e| e.hash.clone())
            .collect())
    }

    async fn remove_if_zero(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.ref_count == 0 => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn stats(&self) -> Result<DedupStats> {
        let entries = self.entries.lock();
        let mut stats = DedupStats::default();

        for entry in entries.values().filter(|e| e.ref_count > 0) {
            stats.unique_chunks += 1;
            stats.total_refs += entry.ref_count;
            stats.unique_bytes += entry.size;
            stats.saved_bytes += entry.size * (entry.ref_count - 1);
        }
        Ok(stats)
    }
}

// ============================================================================
// SQLite Index
// ============================================================================

/// Reference counts in the `chunk_refs` table
pub struct SqliteDedupIndex {
    db: SqlitePool,
}

impl SqliteDedupIndex {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

#[async_trait::async_trait]
impl DedupIndex for SqliteDedupIndex {
    async fn lookup(&self, key: &str) -> Result<bool> {
        let found: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM chunk_refs WHERE hash = ? AND ref_count > 0")
                .bind(key)
                .fetch_optional(&self.db)
                .await?;
        Ok(found.is_some())
    }

    async fn register_or_increment(&self, key: &str, size: u64) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let (count,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO chunk_refs (hash, size, ref_count, created_at, updated_at)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT(hash) DO UPDATE SET
                ref_count = ref_count + 1,
                updated_at = excluded.updated_at
            RETURNING ref_count
            "#,
        )
        .bind(key)
        .bind(size as i64)
        .bind(now)
        .bind(now)
        .fetch_one(&self.db)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn decrement(&self, key: &str) -> Result<u64> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE chunk_refs
            SET ref_count = MAX(ref_count - 1, 0), updated_at = ?
            WHERE hash = ?
            RETURNING ref_count
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .bind(key)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|(c,)| c.max(0) as u64).unwrap_or(0))
    }

    async fn ref_count(&self, key: &str) -> Result<u64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT ref_count FROM chunk_refs WHERE hash = ?")
            .bind(key)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.map(|(c,)| c.max(0) as u64).unwrap_or(0))
    }

    async fn entry(&self, key: &str) -> Result<Option<ChunkRef>> {
        let row: Option<(String, i64, i64, i64, i64)> = sqlx::query_as(
            "SELECT hash, size, ref_count, created_at, updated_at FROM chunk_refs WHERE hash = ?",
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|(hash, size, ref_count, created_at, updated_at)| ChunkRef {
            hash,
            size: size.max(0) as u64,
            ref_count: ref_count.max(0) as u64,
            created_at: from_millis(created_at),
            updated_at: from_millis(updated_at),
        }))
    }

    async fn zero_ref_keys(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT hash FROM chunk_refs
            WHERE ref_count = 0 AND updated_at <= ?
            ORDER BY updated_at
            LIMIT ?
            "#,
        )
        .bind(older_than.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(|(hash,)| hash).collect())
    }

    async fn remove_if_zero(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM chunk_refs WHERE hash = ? AND ref_count = 0")
            .bind(key)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn stats(&self) -> Result<DedupStats> {
        let (unique_chunks, total_refs, unique_bytes, saved_bytes): (i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*),
                    COALESCE(SUM(ref_count), 0),
                    COALESCE(SUM(size), 0),
                    COALESCE(SUM(size * (ref_count - 1)), 0)
                FROM chunk_refs
                WHERE ref_count > 0
                "#,
            )
            .fetch_one(&self.db)
            .await?;

        Ok(DedupStats {
            unique_chunks: unique_chunks.max(0) as u64,
            total_refs: total_refs.max(0) as u64,
            unique_bytes: unique_bytes.max(0) as u64,
            saved_bytes: saved_bytes.max(0) as u64,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn sqlite_service() -> DeduplicationService {
        let pool = crate::db::create_pool("sqlite::memory:").await.unwrap();
        DeduplicationService::with_sqlite(pool)
    }

    async fn exercise_counts(dedup: DeduplicationService) {
        assert!(!dedup.lookup("aa").await.unwrap());
        assert_eq!(dedup.register_or_increment("aa", 10).await.unwrap(), 1);
        assert_eq!(dedup.register_or_increment("aa", 10).await.unwrap(), 2);
        assert!(dedup.lookup("aa").await.unwrap());

        assert_eq!(dedup.decrement("aa").await.unwrap(), 1);
        assert_eq!(dedup.decrement("aa").await.unwrap(), 0);
        assert_eq!(dedup.decrement("aa").await.unwrap(), 0);
        assert!(!dedup.lookup("aa").await.unwrap());

        // Unknown keys never go negative
        assert_eq!(dedup.decrement("bb").await.unwrap(), 0);
        assert_eq!(dedup.ref_count("bb").await.unwrap(), 0);
        assert!(dedup.entry("bb").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_ref_counts() {
        exercise_counts(DeduplicationService::in_memory()).await;
    }

    #[tokio::test]
    async fn test_sqlite_ref_counts() {
        exercise_counts(sqlite_service().await).await;
    }

    async fn exercise_gc_candidates(dedup: DeduplicationService) {
        dedup.register_or_increment("aa", 4).await.unwrap();
        dedup.register_or_increment("bb", 4).await.unwrap();
        dedup.decrement("aa").await.unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(dedup.zero_ref_keys(cutoff, 10).await.unwrap(), vec!["aa"]);

        let too_early = Utc::now() - chrono::Duration::hours(1);
        assert!(dedup.zero_ref_keys(too_early, 10).await.unwrap().is_empty());

        assert!(!dedup.remove_if_zero("bb").await.unwrap());
        assert!(dedup.remove_if_zero("aa").await.unwrap());
        assert!(dedup.entry("aa").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_gc_candidates() {
        exercise_gc_candidates(DeduplicationService::in_memory()).await;
    }

    #[tokio::test]
    async fn test_sqlite_gc_candidates() {
        exercise_gc_candidates(sqlite_service().await).await;
    }

    async fn exercise_stats(dedup: DeduplicationService) {
        dedup.register_or_increment("aa", 100).await.unwrap();
        dedup.register_or_increment("aa", 100).await.unwrap();
        dedup.register_or_increment("aa", 100).await.unwrap();
        dedup.register_or_increment("bb", 50).await.unwrap();
        dedup.register_or_increment("cc", 7).await.unwrap();
        dedup.decrement("cc").await.unwrap();

        let stats = dedup.stats().await.unwrap();
        assert_eq!(
            stats,
            DedupStats {
                unique_chunks: 2,
                total_refs: 4,
                unique_bytes: 150,
                saved_bytes: 200,
            }
        );
    }

    #[tokio::test]
    async fn test_memory_stats() {
        exercise_stats(DeduplicationService::in_memory()).await;
    }

    #[tokio::test]
    async fn test_sqlite_stats() {
        exercise_stats(sqlite_service().await).await;
    }

    #[tokio::test]
    async fn test_concurrent_registration_is_atomic() {
        for dedup in [DeduplicationService::in_memory(), sqlite_service().await] {
            let mut handles = Vec::new();
            for _ in 0..32 {
                let dedup = dedup.clone();
                handles.push(tokio::spawn(async move {
                    dedup.register_or_increment("shared", 1).await.unwrap()
                }));
            }

            let mut seen = Vec::new();
            for handle in handles {
                seen.push(handle.await.unwrap());
            }
            seen.sort_unstable();

            assert_eq!(seen, (1..=32).collect::<Vec<u64>>());
            assert_eq!(dedup.ref_count("shared").await.unwrap(), 32);
        }
    }
}
