//! The per-file encryption stream.
//!
//! An `EncryptorStream` buffers a file's plaintext and turns flushes into
//! encrypted, content-addressed chunk writes. Chunking is convergent: the
//! key for each chunk is the SHA-256 of its plaintext and the chunk's name
//! is the SHA-256 of its ciphertext, so identical content deduplicates in
//! the backend and re-flushing unchanged data rewrites nothing new.
//!
//! The stream outlives the logical close of its file: release only schedules
//! teardown, and a re-open within the inactivity window keeps using the same
//! loaded buffer (observable as zero extra chunk gets).

use crate::cadapter::client::StorageBackend;
use crate::chunk::datamap::{CHUNK_SIZE, ChunkDesc, ChunkKey, DataMap, INLINE_CONTENT_MAX};
use crate::meta::id::ChunkName;
use crate::vfs::error::DriveError;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

pub struct EncryptorStream<S: StorageBackend> {
    storage: Arc<S>,
    state: Mutex<StreamState>,
}

struct StreamState {
    map: DataMap,
    /// Plaintext buffer; populated lazily on the first data access.
    content: Option<Vec<u8>>,
    dirty: bool,
}

impl<S: StorageBackend> EncryptorStream<S> {
    pub fn new(map: DataMap, storage: Arc<S>) -> Self {
        Self {
            storage,
            state: Mutex::new(StreamState {
                map,
                content: None,
                dirty: false,
            }),
        }
    }

    pub async fn size(&self) -> u64 {
        let state = self.state.lock().await;
        state
            .content
            .as_ref()
            .map(|c| c.len() as u64)
            .unwrap_or(state.map.file_size)
    }

    /// Reads up to `len` bytes at `offset`, clamped to the end of file.
    /// Reads at or past the end return an empty buffer.
    pub async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, DriveError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let content = state.content.as_ref().expect("loaded above");
        let size = content.len() as u64;
        if offset >= size {
            return Ok(Vec::new());
        }
        let start = offset as usize;
        let end = start.saturating_add(len).min(content.len());
        Ok(content[start..end].to_vec())
    }

    /// Writes `data` at `offset`, zero-filling any gap past the current end.
    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<usize, DriveError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let content = state.content.as_mut().expect("loaded above");
        let start = offset as usize;
        let end = start + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[start..end].copy_from_slice(data);
        state.dirty = true;
        Ok(data.len())
    }

    /// Persists buffered writes. Returns the new data map when anything was
    /// written since the last flush, `None` otherwise.
    pub async fn flush(&self) -> Result<Option<DataMap>, DriveError> {
        let mut state = self.state.lock().await;
        if !state.dirty {
            return Ok(None);
        }
        let content = state.content.clone().expect("dirty implies loaded");

        let new_map = if content.len() <= INLINE_CONTENT_MAX {
            DataMap {
                file_size: content.len() as u64,
                content: Some(content),
                chunks: Vec::new(),
            }
        } else {
            self.store_chunks(&content).await?
        };

        // Best-effort cleanup of chunks the new map no longer references.
        let kept: HashSet<ChunkName> = new_map.chunk_names().copied().collect();
        for stale in state.map.chunk_names().filter(|&n| !kept.contains(n)) {
            if let Err(err) = self.storage.delete_chunk(stale).await {
                warn!("failed to delete stale chunk {stale}: {err:#}");
            }
        }

        state.map = new_map.clone();
        state.dirty = false;
        Ok(Some(new_map))
    }

    async fn ensure_loaded(&self, state: &mut StreamState) -> Result<(), DriveError> {
        if state.content.is_some() {
            return Ok(());
        }
        let content = if let Some(inline) = &state.map.content {
            inline.clone()
        } else {
            let mut buf = Vec::with_capacity(state.map.file_size as usize);
            for desc in &state.map.chunks {
                let sealed = self
                    .storage
                    .get_chunk(&desc.name)
                    .await
                    .map_err(DriveError::Backend)?;
                buf.extend_from_slice(&decrypt_chunk(desc, &sealed)?);
            }
            buf
        };
        state.content = Some(content);
        Ok(())
    }

    async fn store_chunks(&self, content: &[u8]) -> Result<DataMap, DriveError> {
        let mut chunks = Vec::with_capacity(content.len().div_ceil(CHUNK_SIZE));
        for plain in content.chunks(CHUNK_SIZE) {
            let (desc, sealed) = encrypt_chunk(plain)?;
            self.storage
                .put_chunk(&desc.name, sealed)
                .await
                .map_err(DriveError::Backend)?;
            chunks.push(desc);
        }
        Ok(DataMap {
            file_size: content.len() as u64,
            content: None,
            chunks,
        })
    }
}

fn encrypt_chunk(plain: &[u8]) -> Result<(ChunkDesc, Bytes), DriveError> {
    let key = ChunkKey(Sha256::digest(plain).into());
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let nonce = chunk_nonce(&key);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plain)
        .map_err(|_| DriveError::Unknown {
            path: Default::default(),
        })?;
    let name = ChunkName::of_content(&sealed);
    Ok((
        ChunkDesc {
            name,
            size: plain.len() as u32,
            key,
        },
        Bytes::from(sealed),
    ))
}

fn decrypt_chunk(desc: &ChunkDesc, sealed: &[u8]) -> Result<Vec<u8>, DriveError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&desc.key.0));
    let nonce = chunk_nonce(&desc.key);
    let plain = cipher
        .decrypt(Nonce::from_slice(&nonce), sealed)
        .map_err(|_| DriveError::Unknown {
            path: Default::default(),
        })?;
    if plain.len() != desc.size as usize {
        return Err(DriveError::Unknown {
            path: Default::default(),
        });
    }
    Ok(plain)
}

/// Deterministic nonce: the key is content-derived and unique per plaintext,
/// so a key-derived nonce is never reused with two different payloads.
fn chunk_nonce(key: &ChunkKey) -> [u8; 12] {
    let mut hasher = Sha256::new();
    hasher.update(key.0);
    hasher.update(b"chunk-nonce");
    let digest = hasher.finalize();
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&digest[..12]);
    nonce
}
