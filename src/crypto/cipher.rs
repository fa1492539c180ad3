//! AES-256-GCM chunk cipher
//!
//! Wire format: `[12-byte IV][ciphertext][16-byte tag]`. The IV is prepended
//! so no separate length field is needed.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, VaultError};

/// IV length in bytes (96 bits)
pub const IV_LEN: usize = 12;

/// Authentication tag length in bytes (128 bits)
pub const TAG_LEN: usize = 16;

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;

// ============================================================================
// Data Key
// ============================================================================

/// A 256-bit data encryption key.
///
/// Either an unwrapped owner DEK or a derived convergent key. Zeroized on
/// drop and never persisted in plaintext.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey([u8; KEY_LEN]);

impl DataKey {
    /// Generate a new random key from OS entropy
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            VaultError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, bytes.len()))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.0)
            .map_err(|_| VaultError::InvalidKey("AES-256 requires a 32-byte key".to_string()))
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataKey(..)")
    }
}

// ============================================================================
// Encrypt / Decrypt
// ============================================================================

/// Encrypt with a fresh random IV
pub fn encrypt(plaintext: &[u8], key: &DataKey) -> Result<Vec<u8>> {
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    encrypt_with_iv(plaintext, key, iv)
}

/// Encrypt with a caller-chosen IV.
///
/// The IV must never repeat for the same key unless the plaintext repeats
/// too, which only holds for convergent keys.
pub(crate) fn encrypt_with_iv(plaintext: &[u8], key: &DataKey, iv: [u8; IV_LEN]) -> Result<Vec<u8>> {
    let cipher = key.cipher()?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| VaultError::InvalidKey("AES-GCM encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a blob produced by [`encrypt`].
///
/// Any authentication failure (wrong key, truncation, tampering) is an
/// [`VaultError::IntegrityError`].
pub fn decrypt(blob: &[u8], key: &DataKey) -> Result<Vec<u8>> {
    if blob.len() < IV_LEN + TAG_LEN {
        return Err(VaultError::IntegrityError);
    }
    let (iv, ciphertext) = blob.split_at(IV_LEN);
    let cipher = key.cipher()?;
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| VaultError::IntegrityError)
}

// ============================================================================
// Tests
// ============================================================================
