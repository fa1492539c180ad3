//! Convergent encryption
//!
//! The key is a pure function of the plaintext's content hash, so two owners
//! storing identical bytes produce identical ciphertext. This leaks which
//! chunks are shared across owners and is only enabled per deployment.

use sha2::{Digest, Sha256};

use super::cipher::{self, DataKey, IV_LEN};
use crate::error::{Result, VaultError};

const KEY_CONTEXT: &[u8] = b"convergent-key-v1";
const IV_CONTEXT: &[u8] = b"convergent-iv-v1";

/// Derive the convergent key `SHA256(content_hash ‖ "convergent-key-v1")`.
///
/// `content_hash` is the hex SHA-256 of the plaintext; its decoded bytes are
/// hashed.
pub fn convergent_key(content_hash: &str) -> Result<DataKey> {
    let hash_bytes =
        hex::decode(content_hash).map_err(|_| VaultError::InvalidHash(content_hash.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(&hash_bytes);
    hasher.update(KEY_CONTEXT);
    Ok(DataKey::from_bytes(hasher.finalize().into()))
}

/// Deterministic IV for a convergent key.
///
/// Reusing an IV is only sound because a convergent key never encrypts two
/// different plaintexts.
fn convergent_iv(key: &DataKey) -> [u8; IV_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(IV_CONTEXT);
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&digest[..IV_LEN]);
    iv
}

/// Encrypt a chunk under its convergent key
pub fn encrypt_convergent(plaintext: &[u8], content_hash: &str) -> Result<Vec<u8>> {
    let key = convergent_key(content_hash)?;
    cipher::encrypt_with_iv(plaintext, &key, convergent_iv(&key))
}

/// Decrypt a chunk stored under its convergent key
pub fn decrypt_convergent(blob: &[u8], content_hash: &str) -> Result<Vec<u8>> {
    let key = convergent_key(content_hash)?;
    cipher::decrypt(blob, &key)
}
