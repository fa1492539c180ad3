//! Error types for the Sanchay Vault storage engine

use thiserror::Error;

/// Engine-wide result type
pub type Result<T> = std::result::Result<T, VaultError>;

/// Engine error type
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Session {id} is {state} and no longer accepts changes")]
    SessionClosed { id: String, state: String },

    #[error("Upload incomplete: chunk {missing_index} has not been registered")]
    IncompleteUpload { missing_index: usize },

    #[error("Manifest mismatch at chunk {index}: expected {expected}, got {actual}")]
    ManifestMismatch {
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("Chunk hash mismatch: expected {expected}, got {actual}")]
    ChunkHashMismatch { expected: String, actual: String },

    #[error("Chunk index {index} out of range for a file of {limit} chunks at most")]
    InvalidChunkIndex { index: usize, limit: u64 },

    #[error("Invalid content hash: {0}")]
    InvalidHash(String),

    #[error("File too large: {size} bytes (max: {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Manifest has no chunks")]
    EmptyManifest,

    #[error("Integrity check failed: ciphertext could not be authenticated")]
    IntegrityError,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage backend errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("S3 connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("S3 SDK error: {0}")]
    SdkError(String),
}

impl VaultError {
    /// Whether the caller may retry the failed operation unchanged.
    ///
    /// Only I/O-class failures qualify. Integrity failures and protocol
    /// violations never succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Database(_) | Self::Io(_)
        )
    }

    /// Stable identifier for the transport layer
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::SessionExpired(_) => "SESSION_EXPIRED",
            Self::SessionClosed { .. } => "SESSION_CLOSED",
            Self::IncompleteUpload { .. } => "INCOMPLETE_UPLOAD",
            Self::ManifestMismatch { .. } => "MANIFEST_MISMATCH",
            Self::ChunkHashMismatch { .. } => "CHUNK_HASH_MISMATCH",
            Self::InvalidChunkIndex { .. } => "INVALID_CHUNK_INDEX",
            Self::InvalidHash(_) => "INVALID_HASH",
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::EmptyManifest => "EMPTY_MANIFEST",
            Self::IntegrityError => "INTEGRITY_ERROR",
            Self::InvalidKey(_) => "INVALID_KEY",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}
