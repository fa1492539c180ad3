//! Sanchay Vault
//!
//! Chunked, encrypted, deduplicating storage engine with resumable uploads
//! and rsync-style delta sync.
//!
//! # Modules
//!
//! - `upload`: chunk store, dedup index and resumable upload sessions
//! - `crypto`: AES-256-GCM with envelope and convergent keys
//! - `delta`: block signatures, delta computation and reconstruction
//! - `manifest`: ordered chunk lists and verified chunk reads
//! - `gc`: collection of unreferenced chunks
//! - `engine`: the operations exposed to a transport layer

pub mod config;
pub mod crypto;
pub mod db;
pub mod delta;
pub mod engine;
pub mod error;
pub mod gc;
pub mod manifest;
pub mod storage;
pub mod upload;

pub use config::Config;
pub use engine::{ChunkEngine, EngineOptions};
pub use error::{Result, VaultError};
