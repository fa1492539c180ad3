//! Chunk Store
//!
//! Content-addressed blob storage for encrypted chunks. The store never sees
//! plaintext and never interprets what it holds: callers hand it ciphertext
//! under a key derived from the plaintext's SHA-256.
//!
//! Supports local filesystem, S3 and in-memory backends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::error::{Result, VaultError};
use crate::storage::S3Client;

// ============================================================================
// Chunk Storage Trait
// ============================================================================

/// Trait for chunk storage backends
#[async_trait::async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Check if a chunk exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Store a chunk. Overwriting an existing key is allowed and harmless.
    async fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Get a chunk, failing with `NotFound` if absent
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Delete a chunk. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;
}

// ============================================================================
// Chunk Store (Main Implementation)
// ============================================================================

/// Main chunk store with pluggable backends
#[derive(Clone)]
pub struct ChunkStore {
    backend: Arc<dyn ChunkStorage>,
}

impl ChunkStore {
    /// Create with a custom backend
    pub fn new(backend: Arc<dyn ChunkStorage>) -> Self {
        Self { backend }
    }

    /// Create with local filesystem storage
    pub fn with_local_storage(base_path: PathBuf) -> Self {
        Self::new(Arc::new(LocalChunkStorage::new(base_path)))
    }

    /// Create with S3 storage
    pub fn with_s3_storage(s3_client: S3Client, prefix: String) -> Self {
        Self::new(Arc::new(S3ChunkStorage::new(s3_client, prefix)))
    }

    /// Create with in-memory storage
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryChunkStorage::new()))
    }

    /// Check if a chunk exists
    pub async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.backend.exists(key).await
    }

    /// Store a chunk
    pub async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.backend.put(key, data).await?;

        tracing::debug!(key = %key, size = data.len(), "Stored chunk");
        Ok(())
    }

    /// Get a chunk
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        self.backend.get(key).await
    }

    /// Delete a chunk. Only the garbage collector calls this.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let existed = self.backend.delete(key).await?;

        if existed {
            tracing::debug!(key = %key, "Deleted chunk");
        }
        Ok(existed)
    }
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem chunk storage
pub struct LocalChunkStorage {
    base_path: PathBuf,
}

impl LocalChunkStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn hash_path(&self, key: &str) -> PathBuf {
        // Content-addressable layout: first 2 chars of the hash as directory
        let (namespace, hash) = match key.rsplit_once('/') {
            Some((ns, hash)) => (Some(ns), hash),
            None => (None, key),
        };
        let (prefix, rest) = hash.split_at(2.min(hash.len()));

        let mut path = self.base_path.join("by-hash");
        if let Some(ns) = namespace {
            path = path.join(ns);
        }
        path.join(prefix).join(rest)
    }
}

#[async_trait::async_trait]
impl ChunkStorage for LocalChunkStorage {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.hash_path(key)).await?)
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.hash_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never observe a partial chunk
        let tmp = temp_path(&path);
        tokio::fs::write(&tmp, data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        match tokio::fs::read(self.hash_path(key)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VaultError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.hash_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}

// ============================================================================
// S3 Storage
// ============================================================================

/// S3-based chunk storage
pub struct S3ChunkStorage {
    client: S3Client,
    prefix: String,
}

impl S3ChunkStorage {
    pub fn new(client: S3Client, prefix: String) -> Self {
        Self { client, prefix }
    }

    fn object_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), key)
        }
    }
}

#[async_trait::async_trait]
impl ChunkStorage for S3ChunkStorage {
    async fn exists(&self, key: &str) -> Result<bool> {
        self.client.object_exists(&self.object_key(key)).await
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.client
            .put_object(&self.object_key(key), data.to_vec(), "application/octet-stream")
            .await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let object_key = self.object_key(key);
        match self.client.get_object(&object_key).await {
            Ok(obj) => Ok(obj.data),
            Err(VaultError::NotFound(_)) => Err(VaultError::NotFound(key.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let object_key = self.object_key(key);
        let existed = self.client.object_exists(&object_key).await?;
        if existed {
            self.client.delete_object(&object_key).await?;
        }
        Ok(existed)
    }
}

// ============================================================================
// In-Memory Storage
// ============================================================================

/// In-process chunk storage for tests and single-instance deployments
#[derive(Default)]
pub struct MemoryChunkStorage {
    chunks: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryChunkStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.read().is_empty()
    }
}

#[async_trait::async_trait]
impl ChunkStorage for MemoryChunkStorage {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.chunks.read().contains_key(key))
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.chunks.write().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.chunks
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.chunks.write().remove(key).is_some())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Compute SHA-256 hash of data as lowercase hex
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify hash matches data
pub fn verify_hash(data: &[u8], expected_hash: &str) -> bool {
    compute_hash(data) == expected_hash
}

/// Check that a string is a lowercase hex SHA-256 digest
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Split data into fixed-size chunks with their content hashes
pub fn split_into_chunks(data: &[u8], chunk_size: usize) -> Vec<(String, &[u8])> {
    data.chunks(chunk_size.max(1))
        .map(|chunk| (compute_hash(chunk), chunk))
        .collect()
}

/// Object keys are hex digests, optionally behind one hex namespace segment
fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.split('/').count() <= 2
        && key
            .split('/')
            .all(|seg| !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_hexdigit()));

    if valid {
        Ok(())
    } else {
        Err(VaultError::InvalidHash(key.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_compute_hash() {
        let hash = compute_hash(b"Hello, World!");
        assert_eq!(hash.len(), 64); // SHA-256 = 32 bytes = 64 hex chars
        assert_eq!(hash, compute_hash(b"Hello, World!"));
        assert_ne!(hash, compute_hash(b"Hello, World?"));
        assert!(is_valid_hash(&hash));
        assert!(verify_hash(b"Hello, World!", &hash));
    }

    #[test]
    fn test_is_valid_hash() {
        assert!(!is_valid_hash("abc123"));
        assert!(!is_valid_hash(&"A".repeat(64)));
        assert!(is_valid_hash(&"0f".repeat(32)));
    }

    #[test]
    fn test_validate_key_blocks_traversal() {
        assert!(validate_key(&compute_hash(b"x")).is_ok());
        assert!(validate_key(&format!("0123abcd/{}", compute_hash(b"x"))).is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("aa//bb").is_err());
        assert!(validate_key("").is_err());
    }

    #[test]
    fn test_split_into_chunks() {
        let data = b"abcdefghij";
        let chunks = split_into_chunks(data, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].1, b"ij");
        assert_eq!(chunks[0].0, compute_hash(b"abcd"));
        assert!(split_into_chunks(b"", 4).is_empty());
    }

    #[tokio::test]
    async fn test_local_chunk_storage() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());

        let data = b"test chunk ciphertext";
        let hash = compute_hash(data);

        assert!(!store.exists(&hash).await.unwrap());
        store.put(&hash, data).await.unwrap();
        assert!(store.exists(&hash).await.unwrap());
        assert_eq!(store.get(&hash).await.unwrap(), data);

        // Idempotent overwrite
        store.put(&hash, data).await.unwrap();
        assert_eq!(store.get(&hash).await.unwrap(), data);

        assert!(store.delete(&hash).await.unwrap());
        assert!(!store.delete(&hash).await.unwrap());
        assert!(matches!(store.get(&hash).await, Err(VaultError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_local_layout_uses_hash_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalChunkStorage::new(temp_dir.path().to_path_buf());
        let hash = compute_hash(b"layout");

        storage.put(&hash, b"blob").await.unwrap();
        let expected = temp_dir
            .path()
            .join("by-hash")
            .join(&hash[..2])
            .join(&hash[2..]);
        assert!(expected.exists());

        let scoped = format!("00ff00ff/{}", hash);
        storage.put(&scoped, b"scoped").await.unwrap();
        assert!(temp_dir
            .path()
            .join("by-hash")
            .join("00ff00ff")
            .join(&hash[..2])
            .join(&hash[2..])
            .exists());
    }

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = Arc::new(MemoryChunkStorage::new());
        let store = ChunkStore::new(storage.clone());
        let hash = compute_hash(b"mem");

        assert!(matches!(store.get(&hash).await, Err(VaultError::NotFound(_))));
        store.put(&hash, b"one").await.unwrap();
        store.put(&hash, b"one").await.unwrap();
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let store = ChunkStore::in_memory();
        let result = store.put("not-a-hash", b"data").await;
        assert!(matches!(result, Err(VaultError::InvalidHash(_))));
    }
}
