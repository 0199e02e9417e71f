//! In-memory backend for local development and tests.
//!
//! Keeps chunk and version-chain state in concurrent maps and counts every
//! operation, so tests can assert on store traffic (e.g. "at most one
//! directory put per burst", "reopen performed no chunk gets").

use crate::cadapter::client::StorageBackend;
use crate::meta::id::{ChunkName, DirectoryId, VersionName};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct MemoryBackend {
    chunks: DashMap<ChunkName, Bytes>,
    versions: DashMap<DirectoryId, Chain>,
    chunk_gets: AtomicUsize,
    chunk_puts: AtomicUsize,
    chunk_deletes: AtomicUsize,
    version_puts: AtomicUsize,
}

struct Chain {
    entries: VecDeque<VersionName>,
    max_versions: u32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_get_count(&self) -> usize {
        self.chunk_gets.load(Ordering::Relaxed)
    }

    pub fn chunk_put_count(&self) -> usize {
        self.chunk_puts.load(Ordering::Relaxed)
    }

    pub fn chunk_delete_count(&self) -> usize {
        self.chunk_deletes.load(Ordering::Relaxed)
    }

    pub fn version_put_count(&self) -> usize {
        self.version_puts.load(Ordering::Relaxed)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn has_version_chain(&self, id: &DirectoryId) -> bool {
        self.versions.contains_key(id)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get_chunk(&self, name: &ChunkName) -> anyhow::Result<Bytes> {
        self.chunk_gets.fetch_add(1, Ordering::Relaxed);
        self.chunks
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("chunk not found: {name}"))
    }

    async fn put_chunk(&self, name: &ChunkName, data: Bytes) -> anyhow::Result<()> {
        self.chunk_puts.fetch_add(1, Ordering::Relaxed);
        self.chunks.insert(*name, data);
        Ok(())
    }

    async fn delete_chunk(&self, name: &ChunkName) -> anyhow::Result<()> {
        self.chunk_deletes.fetch_add(1, Ordering::Relaxed);
        self.chunks.remove(name);
        Ok(())
    }

    async fn get_versions(&self, id: &DirectoryId) -> anyhow::Result<Vec<VersionName>> {
        Ok(self
            .versions
            .get(id)
            .map(|chain| chain.entries.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn create_version_chain(
        &self,
        id: &DirectoryId,
        first: VersionName,
        max_versions: u32,
    ) -> anyhow::Result<()> {
        self.version_puts.fetch_add(1, Ordering::Relaxed);
        anyhow::ensure!(max_versions > 0, "max_versions must be positive");
        let mut entries = VecDeque::new();
        entries.push_front(first);
        let prior = self.versions.insert(
            *id,
            Chain {
                entries,
                max_versions,
            },
        );
        anyhow::ensure!(prior.is_none(), "version chain already exists: {id}");
        Ok(())
    }

    async fn put_version(
        &self,
        id: &DirectoryId,
        old: &VersionName,
        new: VersionName,
    ) -> anyhow::Result<()> {
        self.version_puts.fetch_add(1, Ordering::Relaxed);
        let mut chain = self
            .versions
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("no version chain for {id}"))?;
        let head = chain.entries.front().copied();
        anyhow::ensure!(
            head == Some(*old),
            "version head mismatch for {id}: expected {:?}, observed {:?}",
            head,
            old
        );
        chain.entries.push_front(new);
        let cap = chain.max_versions as usize;
        chain.entries.truncate(cap);
        Ok(())
    }

    async fn delete_version_chain(&self, id: &DirectoryId) -> anyhow::Result<()> {
        self.versions.remove(id);
        Ok(())
    }
}
