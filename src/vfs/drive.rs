//! Path-addressed façade over the directory cache.
//!
//! Translates filesystem-style operations (create/open/read/write/flush/
//! release/delete/rename) into calls on the handler, directories and file
//! contexts. The mount bridge sits above this type and maps `DriveError`
//! onto OS error codes.

use crate::cadapter::client::StorageBackend;
use crate::meta::id::{DirectoryId, ParentId};
use crate::meta::metadata::MetaData;
use crate::vfs::config::DriveConfig;
use crate::vfs::error::DriveError;
use crate::vfs::file_context::FileContext;
use crate::vfs::handler::{DirectoryHandler, split_path};
use std::sync::Arc;
use tracing::info;

pub struct Drive<S: StorageBackend> {
    storage: Arc<S>,
    handler: DirectoryHandler<S>,
}

impl<S: StorageBackend> Drive<S> {
    /// Opens (or, with `create`, initialises) a drive over `storage`.
    pub async fn new(
        storage: Arc<S>,
        root_parent_id: ParentId,
        root_id: DirectoryId,
        create: bool,
        config: DriveConfig,
    ) -> Result<Self, DriveError> {
        let handler = DirectoryHandler::new(
            storage.clone(),
            root_parent_id,
            root_id,
            create,
            Arc::new(config),
        )
        .await?;
        info!("drive ready over root {root_id}");
        Ok(Self { storage, handler })
    }

    pub fn root_parent_id(&self) -> ParentId {
        self.handler.root_parent_id()
    }

    pub fn handler(&self) -> &DirectoryHandler<S> {
        &self.handler
    }

    /// Creates a new entry. Files come back open (`open_count == 1`) with a
    /// live encryption stream, matching the create-then-write call pattern
    /// of mount bridges.
    #[tracing::instrument(level = "debug", skip(self, file_context))]
    pub async fn create(
        &self,
        relative_path: &str,
        mut file_context: FileContext<S>,
    ) -> Result<(), DriveError> {
        if !file_context.meta.is_directory() {
            file_context.attach_encryptor(&self.storage);
            file_context
                .open_count
                .store(1, std::sync::atomic::Ordering::Release);
        }
        self.handler.add(relative_path, file_context).await
    }

    /// Opens an existing entry; the 0 -> 1 transition installs the
    /// encryption stream under the parent's lock.
    pub async fn open(&self, relative_path: &str) -> Result<(), DriveError> {
        let (dir_path, name) = split_path(relative_path);
        let parent = self.handler.get(dir_path).await?;
        parent.open_child(name, &self.storage).await
    }

    /// Synchronously flushes a file's buffered writes.
    pub async fn flush(&self, relative_path: &str) -> Result<(), DriveError> {
        let (dir_path, name) = split_path(relative_path);
        let parent = self.handler.get(dir_path).await?;
        parent.flush_child(name).await
    }

    /// Drops one open reference; the 1 -> 0 transition arms the encryptor
    /// teardown timer.
    pub async fn release(&self, relative_path: &str) -> Result<(), DriveError> {
        let (dir_path, name) = split_path(relative_path);
        let parent = self.handler.get(dir_path).await?;
        parent.release_child(name).await
    }

    /// Resets the readdir cursor of a directory.
    pub async fn release_dir(&self, relative_path: &str) -> Result<(), DriveError> {
        let dir = self.handler.get(relative_path).await?;
        dir.reset_children_counter().await;
        Ok(())
    }

    pub async fn delete(&self, relative_path: &str) -> Result<(), DriveError> {
        self.handler.delete(relative_path).await
    }

    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), DriveError> {
        self.handler.rename(old_path, new_path).await
    }

    /// Metadata of the entry at `relative_path`.
    pub async fn metadata(&self, relative_path: &str) -> Result<MetaData, DriveError> {
        let (dir_path, name) = split_path(relative_path);
        if name.is_empty() {
            return Err(DriveError::no_such_file(relative_path));
        }
        let parent = self.handler.get(dir_path).await?;
        parent.child_meta(name).await
    }

    /// Advances the readdir cursor of a directory; `None` past the end.
    pub async fn read_dir_next(
        &self,
        relative_path: &str,
    ) -> Result<Option<MetaData>, DriveError> {
        let dir = self.handler.get(relative_path).await?;
        Ok(dir.get_child_and_increment_counter().await)
    }

    /// Reads up to `size` bytes at `offset`. Short reads happen only at end
    /// of file; reads at or past the end return an empty buffer.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn read(
        &self,
        relative_path: &str,
        size: usize,
        offset: u64,
    ) -> Result<Vec<u8>, DriveError> {
        let (dir_path, name) = split_path(relative_path);
        let parent = self.handler.get(dir_path).await?;
        let stream = parent.child_stream(name).await?;
        stream.read(offset, size).await
    }

    /// Writes `data` at `offset`; on success the whole buffer is accepted.
    /// Updates the entry's size/block attributes and schedules the parent
    /// directory for storing.
    #[tracing::instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    pub async fn write(
        &self,
        relative_path: &str,
        data: &[u8],
        offset: u64,
    ) -> Result<usize, DriveError> {
        let (dir_path, name) = split_path(relative_path);
        let parent = self.handler.get(dir_path).await?;
        let stream = parent.child_stream(name).await?;
        let written = stream.write(offset, data).await?;
        parent.record_write(name, offset + written as u64).await?;
        Ok(written)
    }

    /// Two-phase shutdown: drain pending stores, then drop the cache. After
    /// this the drive performs no further backend traffic.
    pub async fn shutdown(&self) {
        self.handler.shutdown().await;
    }
}
