//! Storage backend interface: content-addressed chunks plus per-directory
//! version chains.

use crate::meta::id::{ChunkName, DirectoryId, VersionName};
use async_trait::async_trait;
use bytes::Bytes;

/// The opaque remote store the drive writes through.
///
/// Chunk operations are content-addressed: `put_chunk` is idempotent for a
/// given name, and callers derive the name from the payload. Version chains
/// are kept per `DirectoryId`, newest first, capped by the `max_versions`
/// passed at chain creation.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    async fn get_chunk(&self, name: &ChunkName) -> anyhow::Result<Bytes>;

    async fn put_chunk(&self, name: &ChunkName, data: Bytes) -> anyhow::Result<()>;

    async fn delete_chunk(&self, name: &ChunkName) -> anyhow::Result<()>;

    /// Version chain for a directory, newest first. Unknown ids resolve to
    /// an empty chain.
    async fn get_versions(&self, id: &DirectoryId) -> anyhow::Result<Vec<VersionName>>;

    /// Create the chain for a brand-new directory with its first version.
    async fn create_version_chain(
        &self,
        id: &DirectoryId,
        first: VersionName,
        max_versions: u32,
    ) -> anyhow::Result<()>;

    /// Extend an existing chain: `new` becomes the head, `old` is the head
    /// the caller observed.
    async fn put_version(
        &self,
        id: &DirectoryId,
        old: &VersionName,
        new: VersionName,
    ) -> anyhow::Result<()>;

    async fn delete_version_chain(&self, id: &DirectoryId) -> anyhow::Result<()>;
}
