//! Database schema

use sqlx::SqlitePool;

use crate::error::Result;

/// Create tables and indexes if they do not exist
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_refs (
            hash TEXT PRIMARY KEY,
            size INTEGER NOT NULL DEFAULT 0,
            ref_count INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_chunk_refs_zero ON chunk_refs(ref_count, updated_at);

        CREATE TABLE IF NOT EXISTS upload_sessions (
            id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_upload_sessions_expiry ON upload_sessions(expires_at);
        "#,
    )
    .execute(pool)
    .await?;

    tracing::debug!("Database schema initialized");
    Ok(())
}
