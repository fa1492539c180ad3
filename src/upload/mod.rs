//! Chunked Upload Module
//!
//! Implements resumable large file uploads with:
//! - SHA-256 content addressing for deduplication
//! - Chunked upload with resume support across instances
//! - Reference-counted chunk storage
//!
//! Protocol Flow:
//! 1. Client initiates a session for a file
//! 2. Client sends the ordered chunk hashes; server answers which are missing
//! 3. Client uploads only the missing chunks, in any order
//! 4. Server validates the slots and emits a manifest

pub mod chunk_store;
pub mod deduplication;
pub mod session;
pub mod session_store;
pub mod types;

pub use chunk_store::{
    compute_hash, is_valid_hash, split_into_chunks, verify_hash, ChunkStorage, ChunkStore,
    LocalChunkStorage, MemoryChunkStorage, S3ChunkStorage,
};
pub use deduplication::{
    DedupIndex, DedupStats, DeduplicationService, MemoryDedupIndex, SqliteDedupIndex,
};
pub use session::{SessionGuard, SessionManager};
pub use session_store::{MemorySessionStore, SessionStore, SqliteSessionStore};
pub use types::*;
