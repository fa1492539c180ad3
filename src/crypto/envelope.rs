//! Envelope encryption for per-owner keys
//!
//! Each owner gets a random DEK at registration. The DEK is wrapped under the
//! process-wide master key (KEK) with the same AES-256-GCM scheme used for
//! chunks, and only the wrapped form is persisted.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::cipher::{self, DataKey, KEY_LEN};
use crate::error::{Result, VaultError};

/// The process-wide key-encryption key.
///
/// Loaded once at startup and never written anywhere.
#[derive(Clone)]
pub struct MasterKey(DataKey);

impl MasterKey {
    /// Decode a base64 master key (must decode to exactly 32 bytes)
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| VaultError::InvalidKey(format!("master key is not base64: {}", e)))?,
        );
        if bytes.len() != KEY_LEN {
            return Err(VaultError::InvalidKey(format!(
                "master key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        Ok(Self(DataKey::from_slice(&bytes)?))
    }

    pub fn from_key(key: DataKey) -> Self {
        Self(key)
    }

    /// Generate a random master key, e.g. for provisioning or tests
    pub fn generate() -> Self {
        Self(DataKey::generate())
    }

    /// Base64 form suitable for a `MASTER_KEY` environment variable
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0.as_bytes())
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// A DEK wrapped under the master key, base64 encoded.
///
/// This is the opaque per-owner blob the relational layer persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WrappedKey(String);

impl WrappedKey {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Wraps and unwraps owner keys
#[derive(Debug, Clone)]
pub struct KeyWrapper {
    master: MasterKey,
}

impl KeyWrapper {
    pub fn new(master: MasterKey) -> Self {
        Self { master }
    }

    /// Generate a fresh owner DEK and return only its wrapped form
    pub fn generate_owner_key(&self) -> Result<WrappedKey> {
        let dek = DataKey::generate();
        self.wrap(&dek)
    }

    /// Wrap an existing DEK under the master key
    pub fn wrap(&self, dek: &DataKey) -> Result<WrappedKey> {
        let blob = cipher::encrypt(dek.as_bytes(), &self.master.0)?;
        Ok(WrappedKey(STANDARD.encode(blob)))
    }

    /// Recover the DEK from its wrapped form
    pub fn unwrap(&self, wrapped: &WrappedKey) -> Result<DataKey> {
        let blob = STANDARD
            .decode(wrapped.as_str())
            .map_err(|e| VaultError::InvalidKey(format!("wrapped key is not base64: {}", e)))?;
        let dek = Zeroizing::new(cipher::decrypt(&blob, &self.master.0)?);
        DataKey::from_slice(&dek)
    }

    /// Re-wrap an owner key under a new master key (KEK rotation).
    ///
    /// The DEK itself is unchanged, so no chunk needs re-encryption.
    pub fn rewrap(&self, wrapped: &WrappedKey, new_master: &MasterKey) -> Result<WrappedKey> {
        let dek = self.unwrap(wrapped)?;
        KeyWrapper::new(new_master.clone()).wrap(&dek)
    }
}
