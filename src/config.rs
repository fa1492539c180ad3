//! Configuration management for Sanchay Vault

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::crypto::EncryptionMode;
use crate::delta::DEFAULT_BLOCK_SIZE;
use crate::upload::{DEFAULT_CHUNK_SIZE, MAX_FILE_SIZE, SESSION_EXPIRY_HOURS};

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub upload: UploadConfig,
    pub encryption: EncryptionConfig,
    pub delta: DeltaConfig,
    pub gc: GcConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the local backend
    pub local_path: PathBuf,
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: Option<String>,
    /// Key prefix for chunk objects in the bucket
    pub prefix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Local,
    S3,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    pub chunk_size: usize,
    pub max_file_size: u64,
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub session_store: SessionBackend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncryptionConfig {
    pub mode: EncryptionMode,
    /// Base64-encoded 32-byte key-encryption key
    pub master_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeltaConfig {
    pub block_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GcConfig {
    pub interval_secs: u64,
    /// Zero-ref chunks younger than this are left alone
    pub min_age_secs: u64,
    pub batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage: StorageConfig {
                backend: StorageBackend::Local,
                local_path: PathBuf::from("./data/chunks"),
                endpoint: "http://localhost:9000".to_string(),
                bucket: "drive-chunks".to_string(),
                access_key: "admin".to_string(),
                secret_key: "password123".to_string(),
                region: Some("us-east-1".to_string()),
                prefix: "chunks".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite:./vault.db".to_string(),
            },
            upload: UploadConfig {
                chunk_size: DEFAULT_CHUNK_SIZE,
                max_file_size: MAX_FILE_SIZE,
                session_ttl_secs: (SESSION_EXPIRY_HOURS * 3600) as u64,
                sweep_interval_secs: 300,
                session_store: SessionBackend::Sqlite,
            },
            encryption: EncryptionConfig {
                mode: EncryptionMode::Envelope,
                master_key: None,
            },
            delta: DeltaConfig {
                block_size: DEFAULT_BLOCK_SIZE,
            },
            gc: GcConfig {
                interval_secs: 3600,
                min_age_secs: 3600,
                batch_size: 500,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let backend = match env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "local".to_string())
            .as_str()
        {
            "s3" | "minio" => StorageBackend::S3,
            "memory" => StorageBackend::Memory,
            "local" => StorageBackend::Local,
            other => {
                return Err(ConfigError::Invalid {
                    var: "STORAGE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let storage = if backend == StorageBackend::S3 {
            StorageConfig {
                backend,
                local_path: defaults.storage.local_path,
                endpoint: required("S3_ENDPOINT")?,
                bucket: required("S3_BUCKET")?,
                access_key: required("S3_ACCESS_KEY")?,
                secret_key: required("S3_SECRET_KEY")?,
                region: env::var("S3_REGION").ok(),
                prefix: env::var("S3_PREFIX").unwrap_or(defaults.storage.prefix),
            }
        } else {
            let mut storage = defaults.storage.clone();
            storage.backend = backend;
            if let Ok(dir) = env::var("CHUNK_DIR") {
                storage.local_path = PathBuf::from(dir);
            }
            storage
        };

        let session_store = match env::var("SESSION_STORE")
            .unwrap_or_else(|_| "sqlite".to_string())
            .as_str()
        {
            "memory" => SessionBackend::Memory,
            "sqlite" => SessionBackend::Sqlite,
            other => {
                return Err(ConfigError::Invalid {
                    var: "SESSION_STORE",
                    value: other.to_string(),
                })
            }
        };

        let mode = match env::var("ENCRYPTION_MODE")
            .unwrap_or_else(|_| "envelope".to_string())
            .as_str()
        {
            "envelope" => EncryptionMode::Envelope,
            "convergent" => EncryptionMode::Convergent,
            "none" => EncryptionMode::None,
            other => {
                return Err(ConfigError::Invalid {
                    var: "ENCRYPTION_MODE",
                    value: other.to_string(),
                })
            }
        };

        Ok(Config {
            storage,
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            upload: UploadConfig {
                chunk_size: parsed("CHUNK_SIZE", defaults.upload.chunk_size)?,
                max_file_size: parsed("MAX_FILE_SIZE", defaults.upload.max_file_size)?,
                session_ttl_secs: parsed("UPLOAD_SESSION_TTL_SECS", defaults.upload.session_ttl_secs)?,
                sweep_interval_secs: parsed(
                    "SESSION_SWEEP_INTERVAL_SECS",
                    defaults.upload.sweep_interval_secs,
                )?,
                session_store,
            },
            encryption: EncryptionConfig {
                mode,
                master_key: env::var("MASTER_KEY").ok(),
            },
            delta: DeltaConfig {
                block_size: parsed("DELTA_BLOCK_SIZE", defaults.delta.block_size)?,
            },
            gc: GcConfig {
                interval_secs: parsed("GC_INTERVAL_SECS", defaults.gc.interval_secs)?,
                min_age_secs: parsed("GC_MIN_AGE_SECS", defaults.gc.min_age_secs)?,
                batch_size: parsed("GC_BATCH_SIZE", defaults.gc.batch_size)?,
            },
        })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::Missing(var))
}

fn parsed<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}
