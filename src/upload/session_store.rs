//! Session persistence
//!
//! Sessions are stored as whole JSON documents keyed by id, so any instance
//! that can reach the store can resume an upload.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::types::UploadSession;
use crate::error::Result;

/// Shared key-value store for upload sessions
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<UploadSession>>;

    /// Insert or replace a session
    async fn put(&self, session: &UploadSession) -> Result<()>;

    /// Remove a session. Returns whether it existed.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Move a session's expiry. Returns whether it existed.
    async fn expire(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;

    /// Remove every session that expired before `now`, returning their ids
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>>;
}

// ============================================================================
// In-Memory Store
// ============================================================================

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, UploadSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: Uuid) -> Result<Option<UploadSession>> {
        Ok(self.sessions.read().get(&id).cloned())
    }

    async fn put(&self, session: &UploadSession) -> Result<()> {
        self.sessions.write().insert(session.id, session.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.sessions.write().remove(&id).is_some())
    }

    async fn expire(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        match self.sessions.write().get_mut(&id) {
            Some(session) => {
                session.expires_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut sessions = self.sessions.write();
        let expired: Vec<Uuid> = sessions
            .values()
            .filter(|s| s.expires_at < now)
            .map(|s| s.id)
            .collect();

        for id in &expired {
            sessions.remove(id);
        }
        Ok(expired)
    }
}

// ============================================================================
// SQLite Store
// ============================================================================

/// Sessions in the `upload_sessions` table
pub struct SqliteSessionStore {
    db: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, id: Uuid) -> Result<Option<UploadSession>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM upload_sessions WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.db)
                .await?;

        match row {
            Some((payload,)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, session: &UploadSession) -> Result<()> {
        let payload = serde_json::to_string(session)?;

        sqlx::query(
            r#"
            INSERT INTO upload_sessions (id, payload, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(session.id.to_string())
        .bind(payload)
        .bind(session.expires_at.timestamp_millis())
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn expire(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        // The payload carries its own expiry, so rewrite both together
        let Some(mut session) = self.get(id).await? else {
            return Ok(false);
        };
        session.expires_at = at;
        self.put(&session).await?;
        Ok(true)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("DELETE FROM upload_sessions WHERE expires_at < ? RETURNING id")
                .bind(now.timestamp_millis())
                .fetch_all(&self.db)
                .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id,)| Uuid::parse_str(&id).ok())
            .collect())
    }
}
