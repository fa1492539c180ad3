//! Storage engine
//!
//! Ties the chunk store, dedup index, session manager, encryption and delta
//! sync together behind the operations a transport layer calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::FutureExt;
use futures::stream::{self, StreamExt, TryStreamExt};
use uuid::Uuid;

use crate::config::{Config, SessionBackend, StorageBackend};
use crate::crypto::{DataKey, EncryptionMode, KeyWrapper, MasterKey, WrappedKey};
use crate::db;
use crate::delta::{DeltaEngine, DeltaInstruction, FileSignature, DEFAULT_BLOCK_SIZE};
use crate::error::{Result, VaultError};
use crate::gc::{GarbageCollector, GcReport};
use crate::manifest::{ChunkReader, Manifest};
use crate::storage::S3Client;
use crate::upload::{
    compute_hash, is_valid_hash, split_into_chunks, ChunkAck, ChunkStore, CompletedUpload,
    DedupStats, DeduplicationService, InitiateUpload, MemorySessionStore, SessionManager,
    SessionStore, SqliteSessionStore, DEFAULT_CHUNK_SIZE, MAX_FILE_SIZE,
};

/// Dedup lookups in flight during an existence check
const LOOKUP_CONCURRENCY: usize = 16;

/// Tunables for a [`ChunkEngine`]
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub mode: EncryptionMode,
    pub master_key: Option<MasterKey>,
    pub chunk_size: usize,
    pub max_file_size: u64,
    pub block_size: usize,
    pub gc_min_age: Duration,
    pub gc_batch_size: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            mode: EncryptionMode::Envelope,
            master_key: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: MAX_FILE_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            gc_min_age: Duration::from_secs(3600),
            gc_batch_size: 500,
        }
    }
}

// ============================================================================
// Chunk Engine
// ============================================================================

/// Chunked, encrypted, deduplicating storage engine
#[derive(Clone)]
pub struct ChunkEngine {
    inner: Arc<ChunkEngineInner>,
}

struct ChunkEngineInner {
    store: ChunkStore,
    dedup: DeduplicationService,
    sessions: SessionManager,
    reader: ChunkReader,
    delta: DeltaEngine,
    gc: GarbageCollector,
    keys: Option<KeyWrapper>,
    mode: EncryptionMode,
    chunk_size: usize,
    max_file_size: u64,
    gc_batch_size: usize,
}

impl ChunkEngine {
    /// Assemble an engine from its parts
    pub fn new(
        store: ChunkStore,
        dedup: DeduplicationService,
        sessions: SessionManager,
        options: EngineOptions,
    ) -> Self {
        let reader = ChunkReader::new(store.clone());
        let delta = DeltaEngine::new(reader.clone(), options.block_size);
        let gc = GarbageCollector::new(dedup.clone(), store.clone(), options.gc_min_age);

        Self {
            inner: Arc::new(ChunkEngineInner {
                store,
                dedup,
                sessions,
                reader,
                delta,
                gc,
                keys: options.master_key.map(KeyWrapper::new),
                mode: options.mode,
                chunk_size: options.chunk_size.max(1),
                max_file_size: options.max_file_size,
                gc_batch_size: options.gc_batch_size,
            }),
        }
    }

    /// Engine with every backend held in memory
    pub fn in_memory(options: EngineOptions) -> Self {
        Self::new(
            ChunkStore::in_memory(),
            DeduplicationService::in_memory(),
            SessionManager::in_memory(),
            options,
        )
    }

    /// Build the engine and its backends from configuration
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = match config.storage.backend {
            StorageBackend::Local => ChunkStore::with_local_storage(config.storage.local_path.clone()),
            StorageBackend::S3 => {
                let client = S3Client::new(&config.storage).await?;
                ChunkStore::with_s3_storage(client, config.storage.prefix.clone())
            }
            StorageBackend::Memory => ChunkStore::in_memory(),
        };

        let pool = db::create_pool(&config.database.url).await?;
        let dedup = DeduplicationService::with_sqlite(pool.clone());

        let session_store: Arc<dyn SessionStore> = match config.upload.session_store {
            SessionBackend::Memory => Arc::new(MemorySessionStore::new()),
            SessionBackend::Sqlite => Arc::new(SqliteSessionStore::new(pool)),
        };
        let sessions = SessionManager::new(
            session_store,
            Duration::from_secs(config.upload.session_ttl_secs),
        );

        let master_key = config
            .encryption
            .master_key
            .as_deref()
            .map(MasterKey::from_base64)
            .transpose()?;
        if config.encryption.mode == EncryptionMode::Envelope && master_key.is_none() {
            tracing::warn!("No master key configured, owner keys cannot be issued or unwrapped");
        }

        tracing::info!(
            storage = ?config.storage.backend,
            session_store = ?config.upload.session_store,
            encryption = %config.encryption.mode,
            "Storage engine initialized"
        );

        Ok(Self::new(
            store,
            dedup,
            sessions,
            EngineOptions {
                mode: config.encryption.mode,
                master_key,
                chunk_size: config.upload.chunk_size,
                max_file_size: config.upload.max_file_size,
                block_size: config.delta.block_size,
                gc_min_age: Duration::from_secs(config.gc.min_age_secs),
                gc_batch_size: config.gc.batch_size,
            },
        ))
    }

    pub fn mode(&self) -> EncryptionMode {
        self.inner.mode
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn dedup(&self) -> &DeduplicationService {
        &self.inner.dedup
    }

    pub fn store(&self) -> &ChunkStore {
        &self.inner.store
    }

    // ========================================================================
    // Upload Protocol
    // ========================================================================

    /// Open an upload session
    pub async fn initiate_upload(&self, request: InitiateUpload) -> Result<Uuid> {
        if request.total_size > self.inner.max_file_size {
            return Err(VaultError::FileTooLarge {
                size: request.total_size,
                max: self.inner.max_file_size,
            });
        }

        let session = self.inner.sessions.create(&request).await?;
        Ok(session.id)
    }

    /// Record the file's chunk list and report which chunks must be uploaded.
    ///
    /// Chunks already stored are claimed for the session on the spot, so the
    /// client never sends them.
    pub async fn check_chunk_existence(&self, session_id: Uuid, hashes: &[String]) -> Result<Vec<usize>> {
        if let Some(bad) = hashes.iter().find(|h| !is_valid_hash(h)) {
            return Err(VaultError::InvalidHash(bad.clone()));
        }

        let mut session = self.inner.sessions.lock(session_id).await?;
        if hashes.len() as u64 > session.max_chunks() {
            return Err(VaultError::InvalidChunkIndex {
                index: hashes.len() - 1,
                limit: session.max_chunks(),
            });
        }
        let mode = self.inner.mode;
        let owner = session.owner.clone();

        // Slots the new chunk list disagrees with give up their references
        let stale: Vec<usize> = session
            .slots
            .iter()
            .filter(|(index, hash)| hashes.get(**index) != Some(*hash))
            .map(|(index, _)| *index)
            .collect();
        for index in stale {
            if let Some(previous) = session.clear_slot(index) {
                self.release_key(&mode.object_key(&owner, &previous)).await?;
            }
        }

        let pending: Vec<(usize, &String)> = hashes
            .iter()
            .enumerate()
            .filter(|(index, hash)| session.slot(*index) != Some(hash.as_str()))
            .collect();

        let dedup = &self.inner.dedup;
        let owner_ref = &owner;
        let lookups: Vec<_> = pending
            .into_iter()
            .map(|(index, hash)| {
                async move {
                    let key = mode.object_key(owner_ref, hash);
                    dedup.lookup(&key).await.map(|found| (index, hash, found))
                }
                .boxed()
            })
            .collect();
        let known: Vec<(usize, &String, bool)> = stream::iter(lookups)
            .buffered(LOOKUP_CONCURRENCY)
            .try_collect()
            .await?;

        let mut missing = Vec::new();
        for (index, hash, found) in known {
            if found && self.pin_existing(&owner, hash).await? {
                session.set_slot(index, hash.as_str());
            } else {
                missing.push(index);
            }
        }

        session.expected = Some(hashes.to_vec());
        session.save().await?;

        tracing::info!(
            session_id = %session_id,
            total_chunks = hashes.len(),
            missing = missing.len(),
            "Checked chunk existence"
        );

        Ok(missing)
    }

    /// Verify, encrypt and store one chunk, then register it in the session.
    ///
    /// Retrying a chunk that is already registered at `index` is acknowledged
    /// without taking another reference.
    pub async fn register_and_store_chunk(
        &self,
        session_id: Uuid,
        index: usize,
        hash: &str,
        data: &[u8],
        key: &DataKey,
    ) -> Result<ChunkAck> {
        if !is_valid_hash(hash) {
            return Err(VaultError::InvalidHash(hash.to_string()));
        }
        let actual = compute_hash(data);
        if actual != hash {
            return Err(VaultError::ChunkHashMismatch {
                expected: hash.to_string(),
                actual,
            });
        }

        let mut session = self.inner.sessions.lock(session_id).await?;
        session.check_index(index)?;
        if let Some(expected) = &session.expected {
            let announced = expected.get(index).map(String::as_str);
            if announced != Some(hash) {
                return Err(VaultError::ManifestMismatch {
                    index,
                    expected: announced.unwrap_or("<none>").to_string(),
                    actual: hash.to_string(),
                });
            }
        }

        let mode = self.inner.mode;
        let object_key = mode.object_key(&session.owner, hash);

        let (stored, ref_count) = if session.slot(index) == Some(hash) {
            (false, self.inner.dedup.ref_count(&object_key).await?)
        } else {
            let (stored, count) = self.store_and_register(&object_key, hash, data, key).await?;

            if let Some(previous) = session.set_slot(index, hash) {
                let previous_key = mode.object_key(&session.owner, &previous);
                self.release_key(&previous_key).await?;
            }
            session.save().await?;
            (stored, count)
        };

        let ack = ChunkAck {
            chunk_index: index,
            stored,
            ref_count,
            chunks_received: session.filled_count(),
            total_chunks: session.total_chunks(),
            complete: session.is_complete(),
        };

        tracing::debug!(
            session_id = %session_id,
            chunk_index = index,
            stored = ack.stored,
            ref_count = ack.ref_count,
            chunks_received = ack.chunks_received,
            "Chunk registered"
        );

        Ok(ack)
    }

    /// Close the session and emit the file's manifest
    pub async fn complete_upload(&self, session_id: Uuid) -> Result<CompletedUpload> {
        let (session, hashes) = self.inner.sessions.complete(session_id).await?;

        let file_id = Uuid::new_v4().to_string();
        let manifest = Manifest::new(
            file_id.clone(),
            session.owner,
            self.inner.mode,
            session.total_size,
            hashes,
        );

        tracing::info!(
            session_id = %session_id,
            file_id = %file_id,
            chunks = manifest.chunks.len(),
            "Upload completed"
        );

        Ok(CompletedUpload { file_id, manifest })
    }

    /// Cancel an upload. References it holds stay until collected by policy.
    pub async fn abort_upload(&self, session_id: Uuid) -> Result<()> {
        self.inner.sessions.abort(session_id).await?;
        Ok(())
    }

    /// Keep an upload alive for another `ttl`
    pub async fn extend_upload(&self, session_id: Uuid, ttl: Duration) -> Result<()> {
        self.inner.sessions.extend(session_id, ttl).await?;
        Ok(())
    }

    /// Store a whole in-memory file through the upload protocol
    pub async fn upload_bytes(
        &self,
        filename: &str,
        owner: &str,
        folder_id: Option<String>,
        data: &[u8],
        key: &DataKey,
    ) -> Result<CompletedUpload> {
        let session_id = self
            .initiate_upload(InitiateUpload {
                filename: filename.to_string(),
                total_size: data.len() as u64,
                folder_id,
                owner: owner.to_string(),
            })
            .await?;

        match self.upload_session_bytes(session_id, data, key).await {
            Ok(completed) => Ok(completed),
            Err(e) => {
                if let Err(abort) = self.inner.sessions.abort(session_id).await {
                    tracing::debug!(session_id = %session_id, error = %abort, "Abort after failure");
                }
                Err(e)
            }
        }
    }

    async fn upload_session_bytes(
        &self,
        session_id: Uuid,
        data: &[u8],
        key: &DataKey,
    ) -> Result<CompletedUpload> {
        let chunks = split_into_chunks(data, self.inner.chunk_size);
        let hashes: Vec<String> = chunks.iter().map(|(hash, _)| hash.clone()).collect();

        let missing = self.check_chunk_existence(session_id, &hashes).await?;
        for index in missing {
            let (hash, chunk) = &chunks[index];
            self.register_and_store_chunk(session_id, index, hash, chunk, key)
                .await?;
        }

        self.complete_upload(session_id).await
    }

    // ========================================================================
    // Files
    // ========================================================================

    /// Read a stored file back as plaintext
    pub async fn read_file(&self, manifest: &Manifest, key: &DataKey) -> Result<Vec<u8>> {
        self.inner.reader.read_all(manifest, key).await
    }

    /// Drop the references a manifest holds, e.g. when its file is deleted
    pub async fn release_manifest(&self, manifest: &Manifest) -> Result<()> {
        for object_key in manifest.object_keys() {
            self.release_key(&object_key).await?;
        }

        tracing::info!(
            file_id = %manifest.file_id,
            chunks = manifest.chunks.len(),
            "Released manifest"
        );
        Ok(())
    }

    // ========================================================================
    // Delta Sync
    // ========================================================================

    pub async fn compute_signature(&self, manifest: &Manifest, key: &DataKey) -> Result<FileSignature> {
        self.inner.delta.compute_signature(manifest, key).await
    }

    pub async fn apply_delta(
        &self,
        manifest: &Manifest,
        key: &DataKey,
        instructions: &[DeltaInstruction],
        new_blocks: &HashMap<usize, Vec<u8>>,
    ) -> Result<Vec<u8>> {
        self.inner
            .delta
            .apply_delta(manifest, key, instructions, new_blocks)
            .await
    }

    // ========================================================================
    // Keys
    // ========================================================================

    /// Issue a new owner DEK, returned in wrapped form for persistence
    pub async fn register_owner(&self) -> Result<WrappedKey> {
        self.keys()?.generate_owner_key()
    }

    /// Unwrap an owner's DEK for use with chunk operations
    pub fn owner_key(&self, wrapped: &WrappedKey) -> Result<DataKey> {
        self.keys()?.unwrap(wrapped)
    }

    fn keys(&self) -> Result<&KeyWrapper> {
        self.inner
            .keys
            .as_ref()
            .ok_or_else(|| VaultError::InvalidKey("no master key configured".to_string()))
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Reclaim expired upload sessions
    pub async fn sweep_sessions(&self) -> Result<usize> {
        Ok(self.inner.sessions.sweep_expired().await?.len())
    }

    /// Run one garbage collection pass
    pub async fn collect_garbage(&self) -> Result<GcReport> {
        self.inner.gc.sweep(self.inner.gc_batch_size).await
    }

    pub async fn dedup_stats(&self) -> Result<DedupStats> {
        self.inner.dedup.stats().await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Take a reference on a chunk believed to be stored.
    ///
    /// Returns false, holding nothing, if the chunk was collected after the
    /// lookup.
    async fn pin_existing(&self, owner: &str, hash: &str) -> Result<bool> {
        let object_key = self.inner.mode.object_key(owner, hash);
        let _key = self.inner.dedup.lock_key(&object_key).await;

        let entry = match self.inner.dedup.entry(&object_key).await? {
            Some(entry) => entry,
            None => return Ok(false),
        };
        if entry.ref_count == 0 && !self.inner.store.exists(&object_key).await? {
            return Ok(false);
        }

        self.inner
            .dedup
            .register_or_increment(&object_key, entry.size)
            .await?;
        Ok(true)
    }

    /// Make sure the blob is in the chunk store, then take a reference on it.
    ///
    /// The write decision follows the store, not the count: a failed write
    /// leaves no reference behind and the next registration writes again.
    /// Returns whether this call wrote the blob, and the new count.
    async fn store_and_register(
        &self,
        object_key: &str,
        hash: &str,
        data: &[u8],
        key: &DataKey,
    ) -> Result<(bool, u64)> {
        let _key = self.inner.dedup.lock_key(object_key).await;

        let stored = !self.inner.store.exists(object_key).await?;
        if stored {
            self.write_chunk(object_key, hash, data, key).await?;
        }

        let count = self
            .inner
            .dedup
            .register_or_increment(object_key, data.len() as u64)
            .await?;
        Ok((stored, count))
    }

    async fn write_chunk(&self, object_key: &str, hash: &str, data: &[u8], key: &DataKey) -> Result<()> {
        let blob = self.inner.mode.seal(data, hash, key)?;
        self.inner.store.put(object_key, &blob).await
    }

    async fn release_key(&self, object_key: &str) -> Result<()> {
        self.inner.dedup.decrement(object_key).await?;
        Ok(())
    }
}
