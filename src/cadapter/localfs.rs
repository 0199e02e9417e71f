//! Local filesystem backend used to mock the remote store.
//!
//! Chunks land under `chunks/` and version chains under `versions/`, one
//! hex-named file each. Chains are small JSON documents; concurrent chain
//! updates are serialised by a per-backend lock rather than file locking,
//! which is plenty for a mock.

use crate::cadapter::client::StorageBackend;
use crate::meta::id::{ChunkName, DirectoryId, VersionName};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;

pub struct LocalFsBackend {
    root: PathBuf,
    created_dirs: Arc<DashSet<PathBuf>>,
    chain_lock: Mutex<()>,
}

#[derive(Serialize, Deserialize)]
struct ChainFile {
    max_versions: u32,
    entries: VecDeque<VersionName>,
}

impl LocalFsBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            created_dirs: Arc::new(DashSet::new()),
            chain_lock: Mutex::new(()),
        }
    }

    fn chunk_path(&self, name: &ChunkName) -> PathBuf {
        self.root.join("chunks").join(name.to_hex())
    }

    fn chain_path(&self, id: &DirectoryId) -> PathBuf {
        self.root.join("versions").join(id.to_hex())
    }

    async fn ensure_dir(&self, dir: &Path) -> anyhow::Result<()> {
        if self.created_dirs.contains(dir) {
            return Ok(());
        }
        fs::create_dir_all(dir).await?;
        self.created_dirs.insert(dir.to_path_buf());
        Ok(())
    }

    async fn read_chain(&self, id: &DirectoryId) -> anyhow::Result<Option<ChainFile>> {
        match fs::read(self.chain_path(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_chain(&self, id: &DirectoryId, chain: &ChainFile) -> anyhow::Result<()> {
        let path = self.chain_path(id);
        if let Some(parent) = path.parent() {
            self.ensure_dir(parent).await?;
        }
        fs::write(path, serde_json::to_vec(chain)?).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    async fn get_chunk(&self, name: &ChunkName) -> anyhow::Result<Bytes> {
        let bytes = fs::read(self.chunk_path(name)).await?;
        Ok(Bytes::from(bytes))
    }

    async fn put_chunk(&self, name: &ChunkName, data: Bytes) -> anyhow::Result<()> {
        let path = self.chunk_path(name);
        if let Some(parent) = path.parent() {
            self.ensure_dir(parent).await?;
        }
        fs::write(path, &data).await?;
        Ok(())
    }

    async fn delete_chunk(&self, name: &ChunkName) -> anyhow::Result<()> {
        match fs::remove_file(self.chunk_path(name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_versions(&self, id: &DirectoryId) -> anyhow::Result<Vec<VersionName>> {
        let _guard = self.chain_lock.lock().await;
        Ok(self
            .read_chain(id)
            .await?
            .map(|chain| chain.entries.into_iter().collect())
            .unwrap_or_default())
    }

    async fn create_version_chain(
        &self,
        id: &DirectoryId,
        first: VersionName,
        max_versions: u32,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(max_versions > 0, "max_versions must be positive");
        let _guard = self.chain_lock.lock().await;
        anyhow::ensure!(
            self.read_chain(id).await?.is_none(),
            "version chain already exists: {id}"
        );
        let mut entries = VecDeque::new();
        entries.push_front(first);
        self.write_chain(
            id,
            &ChainFile {
                max_versions,
                entries,
            },
        )
        .await
    }

    async fn put_version(
        &self,
        id: &DirectoryId,
        old: &VersionName,
        new: VersionName,
    ) -> anyhow::Result<()> {
        let _guard = self.chain_lock.lock().await;
        let mut chain = self
            .read_chain(id)
            .await?
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
        self.write_chain(id, &chain).await
    }

    async fn delete_version_chain(&self, id: &DirectoryId) -> anyhow::Result<()> {
        match fs::remove_file(self.chain_path(id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::id::VersionId;

    #[tokio::test]
    async fn chunk_round_trip_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tmp.path());

        let data = Bytes::from_static(b"sealed bytes");
        let name = ChunkName::of_content(&data);
        backend.put_chunk(&name, data.clone()).await.unwrap();
        assert_eq!(backend.get_chunk(&name).await.unwrap(), data);

        backend.delete_chunk(&name).await.unwrap();
        assert!(backend.get_chunk(&name).await.is_err());
        // Deleting again is not an error.
        backend.delete_chunk(&name).await.unwrap();
    }

    #[tokio::test]
    async fn version_chain_extends_and_caps() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tmp.path());
        let id = DirectoryId::random();

        assert!(backend.get_versions(&id).await.unwrap().is_empty());

        let v0 = VersionName::new(0, VersionId::random());
        backend.create_version_chain(&id, v0, 2).await.unwrap();

        let v1 = VersionName::new(1, VersionId::random());
        backend.put_version(&id, &v0, v1).await.unwrap();
        let v2 = VersionName::new(2, VersionId::random());
        backend.put_version(&id, &v1, v2).await.unwrap();

        let chain = backend.get_versions(&id).await.unwrap();
        assert_eq!(chain, vec![v2, v1]);

        backend.delete_version_chain(&id).await.unwrap();
        assert!(backend.get_versions(&id).await.unwrap().is_empty());
    }
}
