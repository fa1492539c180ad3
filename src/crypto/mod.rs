//! Encryption Service
//!
//! AES-256-GCM authenticated encryption for every stored chunk, with two key
//! regimes:
//! - Envelope: a random per-owner DEK wrapped under the master key
//! - Convergent: a key derived from the chunk's content hash, so dedup keeps
//!   working across owners on encrypted content

mod cipher;
mod convergent;
mod envelope;

pub use cipher::{decrypt, encrypt, DataKey, IV_LEN, KEY_LEN, TAG_LEN};
pub use convergent::{convergent_key, decrypt_convergent, encrypt_convergent};
pub use envelope::{KeyWrapper, MasterKey, WrappedKey};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// How chunks are encrypted at rest.
///
/// Chosen per deployment and recorded on every manifest, so readers never
/// have to guess whether a blob is ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    /// Per-owner DEK; dedup is scoped to the owner
    Envelope,
    /// Content-derived key; dedup is global
    Convergent,
    /// Stored as-is (legacy data or encryption disabled)
    None,
}

impl EncryptionMode {
    /// Storage and dedup key for a chunk.
    ///
    /// Envelope-encrypted blobs can only be read with their owner's DEK, so
    /// they live under an owner namespace. Everything else is addressed by
    /// the bare content hash.
    pub fn object_key(&self, owner: &str, content_hash: &str) -> String {
        match self {
            Self::Envelope => format!("{}/{}", owner_namespace(owner), content_hash),
            Self::Convergent | Self::None => content_hash.to_string(),
        }
    }

    /// Encrypt a chunk for storage
    pub fn seal(&self, plaintext: &[u8], content_hash: &str, owner_key: &DataKey) -> Result<Vec<u8>> {
        match self {
            Self::Envelope => encrypt(plaintext, owner_key),
            Self::Convergent => encrypt_convergent(plaintext, content_hash),
            Self::None => Ok(plaintext.to_vec()),
        }
    }

    /// Decrypt a stored chunk
    pub fn open(&self, blob: Vec<u8>, content_hash: &str, owner_key: &DataKey) -> Result<Vec<u8>> {
        match self {
            Self::Envelope => decrypt(&blob, owner_key),
            Self::Convergent => decrypt_convergent(&blob, content_hash),
            Self::None => Ok(blob),
        }
    }
}

impl std::fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Envelope => f.write_str("envelope"),
            Self::Convergent => f.write_str("convergent"),
            Self::None => f.write_str("none"),
        }
    }
}

/// Stable, path-safe namespace for an owner
fn owner_namespace(owner: &str) -> String {
    let digest = Sha256::digest(owner.as_bytes());
    hex::encode(&digest[..8])
}
