//! File manifests and chunk retrieval
//!
//! A manifest is the ordered list of chunk hashes that make up a file, plus
//! the encoding its chunks were stored with.

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};

use crate::crypto::{DataKey, EncryptionMode};
use crate::error::{Result, VaultError};
use crate::upload::{compute_hash, ChunkStore};

/// Chunks fetched concurrently while reading a file
pub const READ_AHEAD: usize = 4;

/// Ordered chunk list for a stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub file_id: String,
    pub owner: String,
    /// How every chunk of this file is encrypted at rest
    pub encoding: EncryptionMode,
    pub total_size: u64,
    pub chunks: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub index: usize,
    pub hash: String,
}

impl Manifest {
    /// Build a manifest from hashes in file order
    pub fn new(
        file_id: impl Into<String>,
        owner: impl Into<String>,
        encoding: EncryptionMode,
        total_size: u64,
        hashes: Vec<String>,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            owner: owner.into(),
            encoding,
            total_size,
            chunks: hashes
                .into_iter()
                .enumerate()
                .map(|(index, hash)| ManifestEntry { index, hash })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Hashes in file order
    pub fn hashes(&self) -> impl Iterator<Item = &str> {
        self.chunks.iter().map(|c| c.hash.as_str())
    }

    /// Storage keys in file order
    pub fn object_keys(&self) -> impl Iterator<Item = String> + '_ {
        self.chunks
            .iter()
            .map(|c| self.encoding.object_key(&self.owner, &c.hash))
    }
}

// ============================================================================
// Chunk Reader
// ============================================================================

/// Fetches, decrypts and verifies the chunks of a manifest
#[derive(Clone)]
pub struct ChunkReader {
    store: ChunkStore,
}

impl ChunkReader {
    pub fn new(store: ChunkStore) -> Self {
        Self { store }
    }

    /// Read one chunk as plaintext.
    ///
    /// The plaintext must hash back to `hash`; anything else is reported as
    /// `ChunkHashMismatch`, never returned.
    pub async fn read_chunk(
        &self,
        encoding: EncryptionMode,
        owner: &str,
        hash: &str,
        key: &DataKey,
    ) -> Result<Vec<u8>> {
        let blob = self.store.get(&encoding.object_key(owner, hash)).await?;
        let plaintext = encoding.open(blob, hash, key)?;

        let actual = compute_hash(&plaintext);
        if actual != hash {
            return Err(VaultError::ChunkHashMismatch {
                expected: hash.to_string(),
                actual,
            });
        }
        Ok(plaintext)
    }

    /// Read every chunk of the manifest in order
    pub async fn read_chunks(&self, manifest: &Manifest, key: &DataKey) -> Result<Vec<Vec<u8>>> {
        stream::iter(manifest.chunks.iter())
            .map(|entry| self.read_chunk(manifest.encoding, &manifest.owner, &entry.hash, key))
            .buffered(READ_AHEAD)
            .try_collect()
            .await
    }

    /// Reassemble the whole file
    pub async fn read_all(&self, manifest: &Manifest, key: &DataKey) -> Result<Vec<u8>> {
        let chunks = self.read_chunks(manifest, key).await?;
        let mut data = Vec::with_capacity(manifest.total_size as usize);
        for chunk in chunks {
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_plain(store: &ChunkStore, data: &[u8]) -> String {
        let hash = compute_hash(data);
        store.put(&hash, data).await.unwrap();
        hash
    }

    #[tokio::test]
    async fn test_read_all_in_order() {
        let store = ChunkStore::in_memory();
        let a = store_plain(&store, b"first-").await;
        let b = store_plain(&store, b"second").await;

        let manifest = Manifest::new("f1", "alice", EncryptionMode::None, 12, vec![a, b]);
        let reader = ChunkReader::new(store);
        let data = reader.read_all(&manifest, &DataKey::generate()).await.unwrap();
        assert_eq!(data, b"first-second");
    }

    #[tokio::test]
    async fn test_tampered_chunk_is_rejected() {
        let store = ChunkStore::in_memory();
        let hash = compute_hash(b"genuine");
        store.put(&hash, b"forged").await.unwrap();

        let reader = ChunkReader::new(store);
        let result = reader
            .read_chunk(EncryptionMode::None, "alice", &hash, &DataKey::generate())
            .await;
        assert!(matches!(result, Err(VaultError::ChunkHashMismatch { .. })));
    }

    #[tokio::test]
    async fn test_missing_chunk_is_not_found() {
        let reader = ChunkReader::new(ChunkStore::in_memory());
        let manifest = Manifest::new(
            "f1",
            "alice",
            EncryptionMode::Convergent,
            4,
            vec![compute_hash(b"gone")],
        );
        let result = reader.read_all(&manifest, &DataKey::generate()).await;
        assert!(matches!(result, Err(VaultError::NotFound(_))));
    }

    #[test]
    fn test_manifest_serde_shape() {
        let manifest = Manifest::new("f1", "bob", EncryptionMode::Envelope, 3, vec!["ab".into()]);
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["encoding"], "envelope");
        assert_eq!(json["totalSize"], 3);
        assert_eq!(json["chunks"][0]["hash"], "ab");
    }
}
