//! Upload types for the chunked upload protocol

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::manifest::Manifest;

// ============================================================================
// Constants
// ============================================================================

/// Default chunk size: 2MB
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Maximum file size: 5GB
pub const MAX_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Session expiry time: 24 hours
pub const SESSION_EXPIRY_HOURS: i64 = 24;

// ============================================================================
// Session Types
// ============================================================================

/// Upload session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// Unique session ID
    pub id: Uuid,

    /// Original file name
    pub filename: String,

    /// Total file size in bytes
    pub total_size: u64,

    /// Owning user
    pub owner: String,

    /// Destination folder, if any
    pub folder_id: Option<String>,

    /// Registered chunk hashes by index
    pub slots: BTreeMap<usize, String>,

    /// Manifest shape announced by the existence check
    pub expected: Option<Vec<String>>,

    /// Current state
    pub state: SessionState,

    /// Session creation time
    pub created_at: DateTime<Utc>,

    /// Session expiry time
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    /// Create a new open session
    pub fn new(
        filename: impl Into<String>,
        total_size: u64,
        folder_id: Option<String>,
        owner: impl Into<String>,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            filename: filename.into(),
            total_size,
            owner: owner.into(),
            folder_id,
            slots: BTreeMap::new(),
            expected: None,
            state: SessionState::Open,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// Check if session has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Number of chunks the finished file must have
    pub fn total_chunks(&self) -> usize {
        match &self.expected {
            Some(expected) => expected.len(),
            None => self.slots.last_key_value().map_or(0, |(index, _)| index.saturating_add(1)),
        }
    }

    /// Upper bound on the chunk count: every chunk carries at least one byte
    pub fn max_chunks(&self) -> u64 {
        self.total_size
    }

    /// Reject a chunk index the declared file size cannot hold
    pub fn check_index(&self, index: usize) -> crate::error::Result<()> {
        if index as u64 >= self.max_chunks() {
            return Err(crate::error::VaultError::InvalidChunkIndex {
                index,
                limit: self.max_chunks(),
            });
        }
        Ok(())
    }

    /// Hash registered at `index`, if any
    pub fn slot(&self, index: usize) -> Option<&str> {
        self.slots.get(&index).map(String::as_str)
    }

    /// Set `slots[index]`, returning the previous occupant
    pub fn set_slot(&mut self, index: usize, hash: impl Into<String>) -> Option<String> {
        self.slots.insert(index, hash.into())
    }

    /// Clear `slots[index]`, returning what it held
    pub fn clear_slot(&mut self, index: usize) -> Option<String> {
        self.slots.remove(&index)
    }

    /// Number of slots that hold a hash
    pub fn filled_count(&self) -> usize {
        self.slots.len()
    }

    /// Get indices of chunks that still need to be registered
    pub fn missing_chunks(&self) -> Vec<usize> {
        (0..self.total_chunks())
            .filter(|&i| self.slot(i).is_none())
            .collect()
    }

    /// Check if every chunk has been registered
    pub fn is_complete(&self) -> bool {
        self.slots.range(..self.total_chunks()).count() == self.total_chunks()
    }

    /// Calculate progress percentage
    pub fn progress(&self) -> f64 {
        let total = self.total_chunks();
        if total == 0 {
            return 100.0;
        }
        let filled = self.slots.range(..total).count();
        (filled as f64 / total as f64) * 100.0
    }

    /// Validate the slots and produce the ordered manifest hashes.
    pub fn ordered_hashes(&self) -> crate::error::Result<Vec<String>> {
        use crate::error::VaultError;

        let total = self.total_chunks();
        let mut hashes = Vec::with_capacity(self.slots.len().min(total));

        for index in 0..total {
            let actual = self
                .slot(index)
                .ok_or(VaultError::IncompleteUpload { missing_index: index })?;

            if let Some(expected) = self.expected.as_ref().map(|e| e[index].as_str()) {
                if expected != actual {
                    return Err(VaultError::ManifestMismatch {
                        index,
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    });
                }
            }
            hashes.push(actual.to_string());
        }

        // Chunks registered past the announced shape would be silently dropped
        if let Some((&index, actual)) = self.slots.range(total..).next() {
            return Err(VaultError::ManifestMismatch {
                index,
                expected: "<none>".to_string(),
                actual: actual.clone(),
            });
        }

        Ok(hashes)
    }
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Accepting chunks
    Open,
    /// Manifest emitted
    Completed,
    /// Cancelled or expired
    Aborted,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => f.write_str("open"),
            Self::Completed => f.write_str("completed"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

// ============================================================================
// Operation Results
// ============================================================================

/// Request to initiate a chunked upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUpload {
    pub filename: String,
    pub total_size: u64,
    #[serde(default)]
    pub folder_id: Option<String>,
    pub owner: String,
}

/// Acknowledgement after registering a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    /// Chunk index that was registered
    pub chunk_index: usize,

    /// Whether new ciphertext was written to the chunk store
    pub stored: bool,

    /// Reference count of the chunk after registration
    pub ref_count: u64,

    /// Number of chunks registered so far
    pub chunks_received: usize,

    /// Total chunks expected
    pub total_chunks: usize,

    /// Whether all chunks have been registered
    pub complete: bool,
}

/// Result of completing an upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedUpload {
    pub file_id: String,
    pub manifest: Manifest,
}

// ============================================================================
// Chunk Metadata
// ============================================================================

/// Reference-count entry for a stored chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Object key (content hash, possibly owner-scoped)
    pub hash: String,

    /// Plaintext size in bytes
    pub size: u64,

    /// Number of manifests and open sessions holding the chunk
    pub ref_count: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
