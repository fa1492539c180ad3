//! Upload Session Manager
//!
//! Manages resumable upload sessions with:
//! - Persistence through an injected [`SessionStore`]
//! - Per-session mutual exclusion for slot mutation
//! - TTL expiry with a memory of recently reclaimed sessions

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use super::session_store::{MemorySessionStore, SessionStore};
use super::types::{InitiateUpload, SessionState, UploadSession, SESSION_EXPIRY_HOURS};
use crate::error::{Result, VaultError};

/// How many reclaimed session ids to remember
const RECLAIMED_CAPACITY: usize = 4096;

// ============================================================================
// Session Manager
// ============================================================================

/// Manages upload sessions
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

struct SessionManagerInner {
    /// Shared session persistence
    store: Arc<dyn SessionStore>,

    /// Per-session critical sections
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,

    /// Sessions removed by expiry, so late callers see `SessionExpired`
    reclaimed: Mutex<LruCache<Uuid, ()>>,

    /// Lifetime of a new session
    ttl: chrono::Duration,
}

impl SessionManager {
    /// Create a session manager over the given store
    pub fn new(store: Arc<dyn SessionStore>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(SESSION_EXPIRY_HOURS));
        let capacity = NonZeroUsize::new(RECLAIMED_CAPACITY).unwrap_or(NonZeroUsize::MIN);

        Self {
            inner: Arc::new(SessionManagerInner {
                store,
                locks: Mutex::new(HashMap::new()),
                reclaimed: Mutex::new(LruCache::new(capacity)),
                ttl,
            }),
        }
    }

    /// Create a session manager with in-process storage and the default TTL
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemorySessionStore::new()),
            Duration::from_secs(SESSION_EXPIRY_HOURS as u64 * 3600),
        )
    }

    /// Open a new upload session
    pub async fn create(&self, request: &InitiateUpload) -> Result<UploadSession> {
        let session = UploadSession::new(
            request.filename.clone(),
            request.total_size,
            request.folder_id.clone(),
            request.owner.clone(),
            self.inner.ttl,
        );
        self.inner.store.put(&session).await?;

        tracing::info!(
            session_id = %session.id,
            filename = %session.filename,
            total_size = session.total_size,
            owner = %session.owner,
            "Created upload session"
        );

        Ok(session)
    }

    /// Get a snapshot of a session
    pub async fn get(&self, id: Uuid) -> Result<UploadSession> {
        self.load(id).await
    }

    /// Enter the session's critical section.
    ///
    /// The returned guard holds the per-session lock until dropped. Only open
    /// sessions can be locked.
    pub async fn lock(&self, id: Uuid) -> Result<SessionGuard> {
        let mutex = self.session_lock(id);
        let lock = mutex.lock_owned().await;

        let session = match self.load(id).await {
            Ok(session) => session,
            Err(e) => {
                // Unknown ids must not leave an entry behind
                drop(lock);
                if matches!(e, VaultError::SessionNotFound(_)) {
                    self.forget_lock(id);
                }
                return Err(e);
            }
        };
        if session.state != SessionState::Open {
            return Err(VaultError::SessionClosed {
                id: id.to_string(),
                state: session.state.to_string(),
            });
        }

        Ok(SessionGuard {
            session,
            store: self.inner.store.clone(),
            _lock: lock,
        })
    }

    /// Record `hash` at `index`, returning the hash it replaced
    pub async fn register_chunk(
        &self,
        id: Uuid,
        index: usize,
        hash: impl Into<String>,
    ) -> Result<Option<String>> {
        let mut session = self.lock(id).await?;
        session.check_index(index)?;
        let previous = session.set_slot(index, hash);
        session.save().await?;

        tracing::debug!(
            session_id = %id,
            chunk_index = index,
            chunks_received = session.filled_count(),
            "Chunk registered"
        );

        Ok(previous)
    }

    /// Validate the session and close it, returning the ordered manifest hashes
    pub async fn complete(&self, id: Uuid) -> Result<(UploadSession, Vec<String>)> {
        let mut session = self.lock(id).await?;
        let hashes = session.ordered_hashes()?;

        session.state = SessionState::Completed;
        self.inner.store.delete(id).await?;
        let session = session.into_inner();
        self.forget_lock(id);

        tracing::info!(
            session_id = %id,
            chunks = hashes.len(),
            "Upload session completed"
        );

        Ok((session, hashes))
    }

    /// Cancel an open session. Chunks and references are left untouched.
    pub async fn abort(&self, id: Uuid) -> Result<UploadSession> {
        let mut session = self.lock(id).await?;

        session.state = SessionState::Aborted;
        self.inner.store.delete(id).await?;
        let session = session.into_inner();
        self.forget_lock(id);

        tracing::info!(session_id = %id, "Upload session aborted");
        Ok(session)
    }

    /// Push a session's expiry to `ttl` from now
    pub async fn extend(&self, id: Uuid, ttl: Duration) -> Result<DateTime<Utc>> {
        let mut session = self.lock(id).await?;
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(self.inner.ttl);
        let at = Utc::now() + ttl;

        if !self.inner.store.expire(id, at).await? {
            return Err(VaultError::SessionNotFound(id.to_string()));
        }
        session.expires_at = at;

        tracing::debug!(session_id = %id, expires_at = %at, "Session extended");
        Ok(at)
    }

    /// Remove every expired session from the store
    pub async fn sweep_expired(&self) -> Result<Vec<Uuid>> {
        let purged = self.inner.store.purge_expired(Utc::now()).await?;

        for id in &purged {
            self.mark_reclaimed(*id);
        }

        if !purged.is_empty() {
            tracing::info!(count = purged.len(), "Cleaned up expired sessions");
        }

        Ok(purged)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn load(&self, id: Uuid) -> Result<UploadSession> {
        match self.inner.store.get(id).await? {
            Some(session) if session.is_expired() => {
                self.inner.store.delete(id).await?;
                self.mark_reclaimed(id);

                tracing::info!(session_id = %id, "Reclaimed expired session");
                Err(VaultError::SessionExpired(id.to_string()))
            }
            Some(session) => Ok(session),
            None if self.inner.reclaimed.lock().contains(&id) => {
                Err(VaultError::SessionExpired(id.to_string()))
            }
            None => Err(VaultError::SessionNotFound(id.to_string())),
        }
    }

    fn session_lock(&self, id: Uuid) -> Arc<AsyncMutex<()>> {
        self.inner
            .locks
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn forget_lock(&self, id: Uuid) {
        self.inner.locks.lock().remove(&id);
    }

    fn mark_reclaimed(&self, id: Uuid) {
        self.inner.reclaimed.lock().put(id, ());
        self.forget_lock(id);
    }
}

// ============================================================================
// Session Guard
// ============================================================================

/// A session loaded under its per-session lock
pub struct SessionGuard {
    session: UploadSession,
    store: Arc<dyn SessionStore>,
    _lock: OwnedMutexGuard<()>,
}

impl SessionGuard {
    /// Persist the current state of the session
    pub async fn save(&self) -> Result<()> {
        self.store.put(&self.session).await
    }

    /// Release the lock and keep the session
    pub fn into_inner(self) -> UploadSession {
        self.session
    }
}

impl Deref for SessionGuard {
    type Target = UploadSession;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.session
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::session_store::SqliteSessionStore;

    fn request() -> InitiateUpload {
        InitiateUpload {
            filename: "test.epub".to_string(),
            total_size: 1024,
            folder_id: None,
            owner: "alice".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_session() {
        let manager = SessionManager::in_memory();
        let session = manager.create(&request()).await.unwrap();

        let loaded = manager.get(session.id).await.unwrap();
        assert_eq!(loaded.filename, "test.epub");
        assert_eq!(loaded.state, SessionState::Open);
        assert!(loaded.slots.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let manager = SessionManager::in_memory();
        let result = manager.get(Uuid::new_v4()).await;
        assert!(matches!(result, Err(VaultError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_register_chunk_out_of_order() {
        let manager = SessionManager::in_memory();
        let id = manager.create(&request()).await.unwrap().id;

        assert_eq!(manager.register_chunk(id, 2, "c").await.unwrap(), None);
        assert_eq!(manager.register_chunk(id, 0, "a").await.unwrap(), None);
        assert_eq!(manager.register_chunk(id, 0, "a2").await.unwrap(), Some("a".into()));

        let session = manager.get(id).await.unwrap();
        assert_eq!(session.missing_chunks(), vec![1]);
    }

    #[tokio::test]
    async fn test_complete_requires_every_slot() {
        let manager = SessionManager::in_memory();
        let id = manager.create(&request()).await.unwrap().id;

        manager.register_chunk(id, 0, "a").await.unwrap();
        manager.register_chunk(id, 2, "c").await.unwrap();
        assert!(matches!(
            manager.complete(id).await,
            Err(VaultError::IncompleteUpload { missing_index: 1 })
        ));

        manager.register_chunk(id, 1, "b").await.unwrap();
        let (session, hashes) = manager.complete(id).await.unwrap();
        assert_eq!(session.state, SessionState::Completed);
        assert_eq!(hashes, vec!["a", "b", "c"]);

        // Completed sessions leave the store
        assert!(matches!(manager.get(id).await, Err(VaultError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_expired_session_reports_expired() {
        let store = Arc::new(MemorySessionStore::new());
        let manager = SessionManager::new(store.clone(), Duration::from_secs(60));
        let id = manager.create(&request()).await.unwrap().id;

        let past = Utc::now() - chrono::Duration::seconds(1);
        store.expire(id, past).await.unwrap();

        assert!(matches!(
            manager.register_chunk(id, 0, "a").await,
            Err(VaultError::SessionExpired(_))
        ));
        // Still expired after the record is gone
        assert!(matches!(manager.get(id).await, Err(VaultError::SessionExpired(_))));
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let store = Arc::new(MemorySessionStore::new());
        let manager = SessionManager::new(store.clone(), Duration::from_secs(60));
        let stale = manager.create(&request()).await.unwrap().id;
        let live = manager.create(&request()).await.unwrap().id;

        store
            .expire(stale, Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(manager.sweep_expired().await.unwrap(), vec![stale]);
        assert!(matches!(manager.get(stale).await, Err(VaultError::SessionExpired(_))));
        assert!(manager.get(live).await.is_ok());
    }

    #[tokio::test]
    async fn test_abort_and_extend() {
        let manager = SessionManager::in_memory();
        let id = manager.create(&request()).await.unwrap().id;

        let before = manager.get(id).await.unwrap().expires_at;
        let at = manager.extend(id, Duration::from_secs(48 * 3600)).await.unwrap();
        assert!(at > before);
        assert_eq!(manager.get(id).await.unwrap().expires_at, at);

        let aborted = manager.abort(id).await.unwrap();
        assert_eq!(aborted.state, SessionState::Aborted);
        assert!(matches!(manager.abort(id).await, Err(VaultError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_registration_keeps_every_slot() {
        let manager = SessionManager::in_memory();
        let id = manager.create(&request()).await.unwrap().id;

        let mut handles = Vec::new();
        for index in 0..64usize {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.register_chunk(id, index, format!("h{}", index)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let session = manager.get(id).await.unwrap();
        assert_eq!(session.filled_count(), 64);
        assert!(session.is_complete());
    }

    #[tokio::test]
    async fn test_unknown_ids_leave_no_lock_entries() {
        let manager = SessionManager::in_memory();
        for _ in 0..200 {
            let result = manager.register_chunk(Uuid::new_v4(), 0, "a").await;
            assert!(matches!(result, Err(VaultError::SessionNotFound(_))));
        }
        assert!(manager.inner.locks.lock().is_empty());

        // Expired sessions are dropped from the map as well
        let store = Arc::new(MemorySessionStore::new());
        let manager = SessionManager::new(store.clone(), Duration::from_secs(60));
        let id = manager.create(&request()).await.unwrap().id;
        store
            .expire(id, Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert!(manager.lock(id).await.is_err());
        assert!(manager.inner.locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_register_chunk_rejects_out_of_range_index() {
        let manager = SessionManager::in_memory();
        let id = manager.create(&request()).await.unwrap().id;

        for index in [1024usize, 1 << 40, usize::MAX] {
            assert!(matches!(
                manager.register_chunk(id, index, "a").await,
                Err(VaultError::InvalidChunkIndex { .. })
            ));
        }
        assert_eq!(manager.get(id).await.unwrap().filled_count(), 0);
    }

    #[tokio::test]
    async fn test_sessions_shared_through_store() {
        let pool = crate::db::create_pool("sqlite::memory:").await.unwrap();
        let store: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(pool));
        let first = SessionManager::new(store.clone(), Duration::from_secs(60));
        let second = SessionManager::new(store, Duration::from_secs(60));

        let id = first.create(&request()).await.unwrap().id;
        second.register_chunk(id, 0, "a").await.unwrap();

        let session = first.get(id).await.unwrap();
        assert_eq!(session.slot(0), Some("a"));
    }
}
