//! Path to directory resolution, fetch-on-demand, and the store dispatch
//! behind every deferred-store timer.

use crate::cadapter::client::StorageBackend;
use crate::meta::id::{DirectoryId, ParentId, VersionId};
use crate::vfs::config::DriveConfig;
use crate::vfs::directory::{Directory, StoreFunctor};
use crate::vfs::error::DriveError;
use crate::vfs::file_context::FileContext;
use dashmap::DashMap;
use futures::FutureExt;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Owns the mapping from `DirectoryId` to cached `Directory` and performs
/// every structural operation that spans directories.
pub struct DirectoryHandler<S: StorageBackend> {
    shared: Arc<HandlerShared<S>>,
}

struct HandlerShared<S: StorageBackend> {
    storage: Arc<S>,
    config: Arc<DriveConfig>,
    /// Exactly one `Directory` instance per id.
    cache: DashMap<DirectoryId, Arc<Directory<S>>>,
    root_parent_id: ParentId,
    root_id: DirectoryId,
    /// Serialises structural operations that touch more than one directory.
    op_lock: Mutex<()>,
}

impl<S: StorageBackend> DirectoryHandler<S> {
    /// Opens (or, with `create`, initialises) the tree rooted at `root_id`.
    pub async fn new(
        storage: Arc<S>,
        root_parent_id: ParentId,
        root_id: DirectoryId,
        create: bool,
        config: Arc<DriveConfig>,
    ) -> Result<Self, DriveError> {
        let shared = Arc::new(HandlerShared {
            storage,
            config,
            cache: DashMap::new(),
            root_parent_id,
            root_id,
            op_lock: Mutex::new(()),
        });
        let handler = Self { shared };
        if create {
            let root = Directory::create(
                handler.shared.root_parent_id,
                handler.shared.root_id,
                handler.shared.store_functor(),
                handler.shared.config.clone(),
            )
            .await;
            handler.shared.cache.insert(handler.shared.root_id, root);
        } else {
            handler.shared.fetch_directory(root_id, root_parent_id).await?;
        }
        Ok(handler)
    }

    pub fn root_parent_id(&self) -> ParentId {
        self.shared.root_parent_id
    }

    pub fn root_id(&self) -> DirectoryId {
        self.shared.root_id
    }

    /// Resolves `relative_path` to its directory, loading uncached ancestors
    /// from the backend as needed.
    pub async fn get(&self, relative_path: &str) -> Result<Arc<Directory<S>>, DriveError> {
        let mut current = self
            .shared
            .fetch_directory(self.shared.root_id, self.shared.root_parent_id)
            .await?;
        for part in components(relative_path) {
            let meta = current.child_meta(part).await.map_err(|_| {
                DriveError::no_such_file(relative_path)
            })?;
            let child_id = meta
                .directory_id
                .ok_or_else(|| DriveError::no_such_file(relative_path))?;
            let parent_id = ParentId::from(current.directory_id());
            current = self.shared.fetch_directory(child_id, parent_id).await?;
        }
        Ok(current)
    }

    /// Inserts a new entry at `relative_path`. Directory entries get a fresh
    /// cached `Directory` which schedules its own first store.
    pub async fn add(
        &self,
        relative_path: &str,
        child: FileContext<S>,
    ) -> Result<(), DriveError> {
        let (dir_path, _name) = split_path(relative_path);
        let parent = self.get(dir_path).await?;
        let child_dir_id = child.meta.directory_id;
        parent.add_child(child).await?;
        if let Some(id) = child_dir_id {
            let dir = Directory::create(
                ParentId::from(parent.directory_id()),
                id,
                self.shared.store_functor(),
                self.shared.config.clone(),
            )
            .await;
            self.shared.cache.insert(id, dir);
        }
        Ok(())
    }

    /// Removes the entry at `relative_path`. Removed directories are torn
    /// down recursively: their blobs and version chains are deleted from the
    /// backend and their cache entries dropped; removed files lose their
    /// mapped chunks. Backend deletions are best-effort.
    pub async fn delete(&self, relative_path: &str) -> Result<(), DriveError> {
        let _guard = self.shared.op_lock.lock().await;
        let (dir_path, name) = split_path(relative_path);
        if name.is_empty() {
            return Err(DriveError::no_such_file(relative_path));
        }
        let parent = self.get(dir_path).await?;
        let mut removed = parent.remove_child(name).await?;
        removed.discard();
        if let Some(dir_id) = removed.meta.directory_id {
            self.shared.delete_directory_tree(dir_id).await;
        } else if let Some(map) = &removed.meta.data_map {
            self.shared.delete_file_chunks(map).await;
        }
        Ok(())
    }

    /// Moves/renames an entry. Fails with `FileExists` if the destination
    /// name is already taken.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), DriveError> {
        let _guard = self.shared.op_lock.lock().await;
        let (old_dir_path, old_name) = split_path(old_path);
        let (new_dir_path, new_name) = split_path(new_path);
        if old_name.is_empty() || new_name.is_empty() {
            return Err(DriveError::no_such_file(old_path));
        }

        let source = self.get(old_dir_path).await?;
        let target = self.get(new_dir_path).await?;

        if target.has_child(new_name).await {
            return Err(DriveError::file_exists(new_path));
        }

        if source.directory_id() == target.directory_id() {
            return source.rename_child(old_name, new_name).await;
        }

        let mut moved = source.remove_child(old_name).await?;
        moved.meta.name = new_name.to_owned();
        if let Some(dir_id) = moved.meta.directory_id {
            // Reparent the moved directory before its next store.
            let new_parent_id = ParentId::from(target.directory_id());
            match self.shared.fetch_directory(dir_id, new_parent_id).await {
                Ok(child_dir) => child_dir.set_new_parent(new_parent_id).await,
                Err(err) => {
                    moved.meta.name = old_name.to_owned();
                    let _ = source.add_child(moved).await;
                    return Err(err);
                }
            }
        }
        target.add_child(moved).await?;
        debug!("moved {old_path} to {new_path}");
        Ok(())
    }

    /// Two-phase shutdown: force-fire every pending store, wait (bounded)
    /// for completion, then drop the cache.
    pub async fn shutdown(&self) {
        let directories: Vec<Arc<Directory<S>>> =
            self.shared.cache.iter().map(|e| e.value().clone()).collect();
        for dir in &directories {
            if !dir.drain_pending_store().await {
                warn!("store for {} did not complete before shutdown", dir.directory_id());
            }
        }
        self.shared.cache.clear();
        info!("directory handler shut down");
    }

    #[cfg(test)]
    pub(crate) fn cached(&self, id: &DirectoryId) -> Option<Arc<Directory<S>>> {
        self.shared.cache.get(id).map(|e| e.value().clone())
    }
}

impl<S: StorageBackend> HandlerShared<S> {
    /// The functor every directory's store timer fires: resolve the id back
    /// to the cached directory and run one serialise/put/advance cycle.
    fn store_functor(self: &Arc<Self>) -> StoreFunctor {
        let weak = Arc::downgrade(self);
        Arc::new(move |id: DirectoryId| {
            let weak: Weak<HandlerShared<S>> = weak.clone();
            async move {
                if let Some(shared) = weak.upgrade() {
                    shared.store_directory(id).await;
                }
            }
            .boxed()
        })
    }

    async fn store_directory(self: Arc<Self>, id: DirectoryId) {
        let Some(dir) = self.cache.get(&id).map(|e| e.value().clone()) else {
            debug!("skipping store for evicted directory {id}");
            return;
        };
        let blob = match dir.serialise().await {
            Ok(blob) => blob,
            Err(err) => {
                error!("failed to serialise {id}: {err}");
                return;
            }
        };
        let version_id = VersionId::of_content(&blob);
        if let Err(err) = self.storage.put_chunk(&version_id.chunk_name(), blob).await {
            // Store state stays Ongoing; the next mutation re-arms a retry.
            error!("failed to store blob for {id}: {err:#}");
            return;
        }
        let (dir_id, previous, new) = if dir.versions_count().await == 0 {
            match dir.initialise_versions(version_id).await {
                Ok((dir_id, first)) => (dir_id, None, first),
                // Lost a race with another store; extend the chain instead.
                Err(_) => dir.add_new_version(version_id).await,
            }
        } else {
            dir.add_new_version(version_id).await
        };
        let result = match previous {
            None => {
                self.storage
                    .create_version_chain(&dir_id, new, self.config.max_versions)
                    .await
            }
            Some(previous) => self.storage.put_version(&dir_id, &previous, new).await,
        };
        match result {
            Ok(()) => info!("stored {dir_id} as version {}", new.index),
            Err(err) => error!("failed to advance version chain for {dir_id}: {err:#}"),
        }
    }

    /// Returns the cached directory for `id`, fetching blob and version
    /// chain from the backend on a miss. Exactly one instance per id
    /// survives concurrent fetches.
    async fn fetch_directory(
        self: &Arc<Self>,
        id: DirectoryId,
        parent_id: ParentId,
    ) -> Result<Arc<Directory<S>>, DriveError> {
        if let Some(dir) = self.cache.get(&id) {
            return Ok(dir.value().clone());
        }
        let versions = self
            .storage
            .get_versions(&id)
            .await
            .map_err(DriveError::Backend)?;
        let head = versions
            .first()
            .copied()
            .ok_or_else(|| DriveError::no_such_file(format!("directory {id}")))?;
        let blob = self
            .storage
            .get_chunk(&head.id.chunk_name())
            .await
            .map_err(DriveError::Backend)?;
        let dir = Directory::from_blob(
            parent_id,
            &blob,
            versions,
            self.store_functor(),
            self.config.clone(),
        )?;
        // A concurrent fetch may have won; the cache keeps whichever entry
        // landed first so the instance stays unique.
        let entry = self.cache.entry(id).or_insert(dir);
        Ok(entry.value().clone())
    }

    async fn delete_file_chunks(&self, map: &crate::chunk::datamap::DataMap) {
        for name in map.chunk_names() {
            if let Err(err) = self.storage.delete_chunk(name).await {
                warn!("failed to delete chunk {name}: {err:#}");
            }
        }
    }

    /// Recursively removes a directory's blobs, version chain and cache
    /// entry, then those of its subdirectories.
    fn delete_directory_tree(
        self: &Arc<Self>,
        id: DirectoryId,
    ) -> futures::future::BoxFuture<'static, ()> {
        let shared = self.clone();
        async move {
            let children = match shared.load_children(id).await {
                Ok(children) => children,
                Err(err) => {
                    warn!("skipping cascade under {id}: {err}");
                    Vec::new()
                }
            };
            for meta in children {
                if let Some(sub_id) = meta.directory_id {
                    shared.delete_directory_tree(sub_id).await;
                } else if let Some(map) = &meta.data_map {
                    shared.delete_file_chunks(map).await;
                }
            }
            if let Ok(versions) = shared.storage.get_versions(&id).await {
                for version in versions {
                    if let Err(err) =
                        shared.storage.delete_chunk(&version.id.chunk_name()).await
                    {
                        warn!("failed to delete blob version for {id}: {err:#}");
                    }
                }
            }
            if let Err(err) = shared.storage.delete_version_chain(&id).await {
                warn!("failed to delete version chain for {id}: {err:#}");
            }
            shared.cache.remove(&id);
        }
        .boxed()
    }

    async fn load_children(
        self: &Arc<Self>,
        id: DirectoryId,
    ) -> Result<Vec<crate::meta::metadata::MetaData>, DriveError> {
        if let Some(dir) = self.cache.get(&id).map(|e| e.value().clone()) {
            dir.reset_children_counter().await;
            let mut metas = Vec::new();
            while let Some(meta) = dir.get_child_and_increment_counter().await {
                metas.push(meta);
            }
            dir.reset_children_counter().await;
            return Ok(metas);
        }
        let versions = self
            .storage
            .get_versions(&id)
            .await
            .map_err(DriveError::Backend)?;
        let Some(head) = versions.first() else {
            return Ok(Vec::new());
        };
        let blob = self
            .storage
            .get_chunk(&head.id.chunk_name())
            .await
            .map_err(DriveError::Backend)?;
        Ok(crate::meta::serialization::deserialise_directory(&blob)?.children)
    }
}

/// Non-empty components of a normalised relative path.
fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|part| !part.is_empty())
}

/// Splits a relative path into its parent directory and final component.
pub(crate) fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
        None => ("", trimmed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::MemoryBackend;
    use std::time::Duration;

    async fn test_handler(
        storage: Arc<MemoryBackend>,
        root_parent: ParentId,
        root_id: DirectoryId,
        create: bool,
    ) -> DirectoryHandler<MemoryBackend> {
        let config = Arc::new(
            DriveConfig::default()
                .directory_inactivity_delay(Duration::from_millis(40))
                .file_inactivity_delay(Duration::from_millis(60)),
        );
        DirectoryHandler::new(storage, root_parent, root_id, create, config)
            .await
            .expect("handler")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn construct_exposes_the_root() {
        let storage = Arc::new(MemoryBackend::new());
        let root_parent = ParentId::random();
        let root_id = DirectoryId::random();
        let handler = test_handler(storage, root_parent, root_id, true).await;

        let root = handler.get("").await.unwrap();
        assert_eq!(root.directory_id(), root_id);
        assert_eq!(root.parent_id().await, root_parent);
        assert!(root.is_empty().await);
        assert_eq!(handler.root_parent_id(), root_parent);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn add_directory_and_look_it_up() {
        let storage = Arc::new(MemoryBackend::new());
        let handler =
            test_handler(storage, ParentId::random(), DirectoryId::random(), true).await;

        let child = FileContext::new_directory("Directory");
        let child_id = child.meta.directory_id.unwrap();
        handler.add("Directory", child).await.unwrap();

        let dir = handler.get("Directory").await.unwrap();
        assert_eq!(dir.directory_id(), child_id);
        assert_eq!(
            dir.parent_id().await,
            ParentId::from(handler.root_id())
        );

        let root = handler.get("").await.unwrap();
        assert!(root.has_child("Directory").await);

        // A second entry with the same name is rejected.
        let err = handler
            .add("Directory", FileContext::new_directory("Directory"))
            .await
            .unwrap_err();
        assert!(matches!(err, DriveError::FileExists { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn files_resolve_as_children_not_directories() {
        let storage = Arc::new(MemoryBackend::new());
        let handler =
            test_handler(storage, ParentId::random(), DirectoryId::random(), true).await;

        handler.add("File", FileContext::new_file("File")).await.unwrap();
        assert!(handler.get("File").await.is_err());

        let root = handler.get("").await.unwrap();
        assert!(root.has_child("File").await);
        assert_eq!(root.child_meta("File").await.unwrap().name, "File");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delete_removes_entries_and_cached_directories() {
        let storage = Arc::new(MemoryBackend::new());
        let handler = test_handler(
            storage.clone(),
            ParentId::random(),
            DirectoryId::random(),
            true,
        )
        .await;

        let child = FileContext::new_directory("Directory");
        let child_id = child.meta.directory_id.unwrap();
        handler.add("Directory", child).await.unwrap();
        assert!(handler.cached(&child_id).is_some());

        handler.delete("Directory").await.unwrap();
        assert!(handler.get("Directory").await.is_err());
        assert!(handler.cached(&child_id).is_none());
        assert!(!storage.has_version_chain(&child_id));

        let root = handler.get("").await.unwrap();
        assert!(!root.has_child("Directory").await);

        // Deleting again reports the miss.
        let err = handler.delete("Directory").await.unwrap_err();
        assert!(matches!(err, DriveError::NoSuchFile { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rename_within_one_directory() {
        let storage = Arc::new(MemoryBackend::new());
        let handler =
            test_handler(storage, ParentId::random(), DirectoryId::random(), true).await;

        handler.add("old.txt", FileContext::new_file("old.txt")).await.unwrap();
        handler.rename("old.txt", "new.txt").await.unwrap();

        let root = handler.get("").await.unwrap();
        assert!(!root.has_child("old.txt").await);
        assert!(root.has_child("new.txt").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rename_moves_files_across_directories() {
        let storage = Arc::new(MemoryBackend::new());
        let handler =
            test_handler(storage, ParentId::random(), DirectoryId::random(), true).await;

        handler.add("d", FileContext::new_directory("d")).await.unwrap();
        handler.add("f", FileContext::new_file("f")).await.unwrap();

        handler.rename("f", "d/f").await.unwrap();

        let root = handler.get("").await.unwrap();
        assert!(!root.has_child("f").await);
        let d = handler.get("d").await.unwrap();
        assert!(d.has_child("f").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rename_moves_directories_and_reparents_them() {
        let storage = Arc::new(MemoryBackend::new());
        let handler =
            test_handler(storage, ParentId::random(), DirectoryId::random(), true).await;

        handler.add("src", FileContext::new_directory("src")).await.unwrap();
        handler.add("dst", FileContext::new_directory("dst")).await.unwrap();
        let moved = FileContext::new_directory("inner");
        let moved_id = moved.meta.directory_id.unwrap();
        handler.add("src/inner", moved).await.unwrap();

        handler.rename("src/inner", "dst/inner").await.unwrap();

        let src = handler.get("src").await.unwrap();
        assert!(!src.has_child("inner").await);
        let dst = handler.get("dst").await.unwrap();
        assert!(dst.has_child("inner").await);

        let inner = handler.get("dst/inner").await.unwrap();
        assert_eq!(inner.directory_id(), moved_id);
        assert_eq!(
            inner.parent_id().await,
            ParentId::from(dst.directory_id())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rename_onto_an_existing_name_fails() {
        let storage = Arc::new(MemoryBackend::new());
        let handler =
            test_handler(storage, ParentId::random(), DirectoryId::random(), true).await;

        handler.add("a", FileContext::new_file("a")).await.unwrap();
        handler.add("b", FileContext::new_file("b")).await.unwrap();

        let err = handler.rename("a", "b").await.unwrap_err();
        assert!(matches!(err, DriveError::FileExists { .. }));
        let root = handler.get("").await.unwrap();
        assert!(root.has_child("a").await && root.has_child("b").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn a_drained_tree_reloads_from_the_backend() {
        let storage = Arc::new(MemoryBackend::new());
        let root_parent = ParentId::random();
        let root_id = DirectoryId::random();

        {
            let handler =
                test_handler(storage.clone(), root_parent, root_id, true).await;
            handler.add("docs", FileContext::new_directory("docs")).await.unwrap();
            handler
                .add("docs/readme", FileContext::new_file("readme"))
                .await
                .unwrap();
            handler.shutdown().await;
        }

        let reopened = test_handler(storage, root_parent, root_id, false).await;
        let root = reopened.get("").await.unwrap();
        assert!(root.has_child("docs").await);
        let docs = reopened.get("docs").await.unwrap();
        assert!(docs.has_child("readme").await);
        assert_eq!(docs.parent_id().await, ParentId::from(root_id));
    }
}
