//! In-memory representation of one cached directory and its write-back state
//! machine.
//!
//! Every mutation re-arms a deferred store; the store timer fires a functor
//! that the handler resolves back to this directory by id, so nothing here
//! captures itself. At most one serialise/store cycle is in flight per
//! directory; mutations that land during an ongoing store become visible to
//! the next one.

use crate::cadapter::client::StorageBackend;
use crate::daemon::timer::DelayTimer;
use crate::meta::id::{DirectoryId, ParentId, VersionId, VersionName};
use crate::meta::metadata::MetaData;
use crate::meta::serialization;
use crate::vfs::config::DriveConfig;
use crate::vfs::error::DriveError;
use crate::vfs::file_context::FileContext;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{error, trace, warn};

/// Store callback installed by the handler: given a directory id, produce the
/// future that serialises and persists that directory.
pub(crate) type StoreFunctor =
    Arc<dyn Fn(DirectoryId) -> BoxFuture<'static, ()> + Send + Sync>;

/// How long serialise and set_new_parent wait for an in-flight store before
/// proceeding anyway (a failed store leaves the state Ongoing forever).
const ONGOING_WAIT: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StoreState {
    Pending,
    Ongoing,
    Complete,
}

pub struct Directory<S: StorageBackend> {
    directory_id: DirectoryId,
    config: Arc<DriveConfig>,
    store_functor: StoreFunctor,
    store_timer: DelayTimer,
    /// Signalled on every store_state transition out of Ongoing.
    store_gate: Notify,
    state: Mutex<DirState<S>>,
}

pub(crate) struct DirState<S: StorageBackend> {
    parent_id: ParentId,
    children: Vec<FileContext<S>>,
    /// Cursor for the readdir-style iterator.
    children_count_position: usize,
    /// Version chain, newest first.
    versions: VecDeque<VersionName>,
    max_versions: u32,
    store_state: StoreState,
}

impl<S: StorageBackend> DirState<S> {
    fn find(&self, name: &str) -> Option<usize> {
        self.children.iter().position(|c| c.meta.name == name)
    }

    fn sort_and_reset_counter(&mut self) {
        self.children.sort_by(|a, b| a.meta.name.cmp(&b.meta.name));
        self.children_count_position = 0;
    }
}

impl<S: StorageBackend> Directory<S> {
    /// Creates a brand-new empty directory and schedules its first store.
    pub(crate) async fn create(
        parent_id: ParentId,
        directory_id: DirectoryId,
        store_functor: StoreFunctor,
        config: Arc<DriveConfig>,
    ) -> Arc<Self> {
        let max_versions = config.max_versions;
        let dir = Arc::new(Self {
            directory_id,
            config,
            store_functor,
            store_timer: DelayTimer::new(),
            store_gate: Notify::new(),
            state: Mutex::new(DirState {
                parent_id,
                children: Vec::new(),
                children_count_position: 0,
                versions: VecDeque::new(),
                max_versions,
                store_state: StoreState::Complete,
            }),
        });
        dir.schedule_for_storing().await;
        dir
    }

    /// Reconstructs a directory from its persisted blob and version chain.
    /// Does not schedule a store: the cache starts consistent with the
    /// backend.
    pub(crate) fn from_blob(
        parent_id: ParentId,
        blob: &[u8],
        versions: Vec<VersionName>,
        store_functor: StoreFunctor,
        config: Arc<DriveConfig>,
    ) -> Result<Arc<Self>, DriveError> {
        let parsed = serialization::deserialise_directory(blob)?;
        let dir = Arc::new_cyclic(|weak| {
            let children: Vec<FileContext<S>> = parsed
                .children
                .into_iter()
                .map(|meta| {
                    let child = FileContext::from_meta(meta);
                    child.parent.set_weak(weak.clone());
                    child
                })
                .collect();
            let mut state = DirState {
                parent_id,
                children,
                children_count_position: 0,
                versions: versions.into_iter().collect(),
                max_versions: parsed.max_versions,
                store_state: StoreState::Complete,
            };
            state.sort_and_reset_counter();
            Self {
                directory_id: parsed.directory_id,
                config,
                store_functor,
                store_timer: DelayTimer::new(),
                store_gate: Notify::new(),
                state: Mutex::new(state),
            }
        });
        Ok(dir)
    }

    pub fn directory_id(&self) -> DirectoryId {
        self.directory_id
    }

    pub async fn parent_id(&self) -> ParentId {
        self.state.lock().await.parent_id
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.children.is_empty()
    }

    pub async fn versions_count(&self) -> usize {
        self.state.lock().await.versions.len()
    }

    pub async fn store_state(&self) -> StoreState {
        self.state.lock().await.store_state
    }

    pub async fn has_child(&self, name: &str) -> bool {
        self.state.lock().await.find(name).is_some()
    }

    /// Metadata of the named child.
    pub async fn child_meta(&self, name: &str) -> Result<MetaData, DriveError> {
        let state = self.state.lock().await;
        let idx = state
            .find(name)
            .ok_or_else(|| DriveError::no_such_file(name))?;
        let child = &state.children[idx];
        // An open file must carry its stream and teardown timer.
        debug_assert!(
            child.open_count() == 0
                || child.meta.is_directory()
                || (child.stream.is_some() && child.timer.is_some())
        );
        Ok(child.meta.clone())
    }

    /// Readdir cursor: next child's metadata, or `None` past the end.
    pub async fn get_child_and_increment_counter(&self) -> Option<MetaData> {
        let mut state = self.state.lock().await;
        if state.children_count_position < state.children.len() {
            let meta = state.children[state.children_count_position].meta.clone();
            state.children_count_position += 1;
            Some(meta)
        } else {
            None
        }
    }

    pub async fn reset_children_counter(&self) {
        self.state.lock().await.children_count_position = 0;
    }

    /// Inserts a child, keeping names unique and ordered, and schedules a
    /// deferred store.
    pub async fn add_child(self: &Arc<Self>, child: FileContext<S>) -> Result<(), DriveError> {
        let mut state = self.state.lock().await;
        if state.find(&child.meta.name).is_some() {
            return Err(DriveError::file_exists(child.meta.name.as_str()));
        }
        child.parent.set(self);
        state.children.push(child);
        state.sort_and_reset_counter();
        self.do_schedule_for_storing(&mut state, true);
        Ok(())
    }

    /// Removes a child and transfers its ownership to the caller.
    pub async fn remove_child(&self, name: &str) -> Result<FileContext<S>, DriveError> {
        let mut state = self.state.lock().await;
        let idx = state
            .find(name)
            .ok_or_else(|| DriveError::no_such_file(name))?;
        let child = state.children.remove(idx);
        state.sort_and_reset_counter();
        self.do_schedule_for_storing(&mut state, true);
        Ok(child)
    }

    /// Renames a child in place. The caller has already checked that
    /// `new_name` is absent from this directory.
    pub async fn rename_child(&self, old_name: &str, new_name: &str) -> Result<(), DriveError> {
        let mut state = self.state.lock().await;
        debug_assert!(state.find(new_name).is_none());
        let idx = state
            .find(old_name)
            .ok_or_else(|| DriveError::no_such_file(old_name))?;
        state.children[idx].meta.name = new_name.to_owned();
        state.sort_and_reset_counter();
        self.do_schedule_for_storing(&mut state, true);
        Ok(())
    }

    /// Arms (or re-arms) the deferred store.
    pub async fn schedule_for_storing(&self) {
        let mut state = self.state.lock().await;
        self.do_schedule_for_storing(&mut state, true);
    }

    /// Brings a pending store's deadline forward to now; no-op otherwise.
    pub async fn store_immediately_if_pending(&self) {
        let mut state = self.state.lock().await;
        self.do_schedule_for_storing(&mut state, false);
    }

    fn do_schedule_for_storing(&self, state: &mut DirState<S>, use_delay: bool) {
        if use_delay {
            let fire = (self.store_functor)(self.directory_id);
            let cancelled = self
                .store_timer
                .rearm(self.config.directory_inactivity_delay, fire);
            if cancelled > 0 && state.store_state != StoreState::Complete {
                trace!("re-armed pending store for {}", self.directory_id);
            }
            state.store_state = StoreState::Pending;
        } else if state.store_state == StoreState::Pending {
            if self.store_timer.cancel() > 0 {
                trace!("bringing forward store for {}", self.directory_id);
                tokio::spawn((self.store_functor)(self.directory_id));
            } else {
                warn!("store for {} already firing", self.directory_id);
            }
        } else {
            trace!("no store pending for {}", self.directory_id);
        }
    }

    /// Snapshots this directory for storing: flushes every child with a live
    /// encryptor, marks the store Ongoing, and returns the serialised blob.
    /// The owning parent's id is never part of the blob.
    pub async fn serialise(&self) -> Result<Bytes, DriveError> {
        self.wait_while_ongoing(ONGOING_WAIT).await;
        let mut state = self.state.lock().await;
        for idx in 0..state.children.len() {
            let child = &mut state.children[idx];
            if child.stream.is_some() {
                if let Some(timer) = &child.timer {
                    timer.cancel();
                }
                flush_encryptor(child).await;
            }
        }
        let metas: Vec<MetaData> = state.children.iter().map(|c| c.meta.clone()).collect();
        let blob =
            serialization::serialise_directory(self.directory_id, state.max_versions, metas)?;
        state.store_state = StoreState::Ongoing;
        Ok(blob)
    }

    /// First version of a brand-new tree.
    pub async fn initialise_versions(
        &self,
        version_id: VersionId,
    ) -> Result<(DirectoryId, VersionName), DriveError> {
        let mut state = self.state.lock().await;
        if !state.versions.is_empty() {
            return Err(DriveError::unknown("version chain already initialised"));
        }
        state.store_state = StoreState::Complete;
        let first = VersionName::new(0, version_id);
        state.versions.push_front(first);
        drop(state);
        self.store_gate.notify_waiters();
        Ok((self.directory_id, first))
    }

    /// Marks the end of a successful store attempt: extends the version
    /// chain at the front and wakes anyone gated on the store state.
    /// Returns `(directory_id, previous_head, new_head)`; the previous head
    /// is `None` for the first version of the chain.
    pub async fn add_new_version(
        &self,
        version_id: VersionId,
    ) -> (DirectoryId, Option<VersionName>, VersionName) {
        let mut state = self.state.lock().await;
        state.store_state = StoreState::Complete;
        // Snapshot the head before inserting: with a cap of one, the trim
        // below would discard it.
        let previous = state.versions.front().copied();
        let new = match previous {
            None => VersionName::new(0, version_id),
            Some(head) => VersionName::new(head.index + 1, version_id),
        };
        state.versions.push_front(new);
        let cap = state.max_versions as usize;
        state.versions.truncate(cap);
        drop(state);
        self.store_gate.notify_waiters();
        (self.directory_id, previous, new)
    }

    /// Reparents this directory after a cross-directory move. Blocks while a
    /// store attempt is ongoing so the mover never races the serialiser.
    pub async fn set_new_parent(&self, parent_id: ParentId) {
        self.wait_while_ongoing(ONGOING_WAIT).await;
        self.state.lock().await.parent_id = parent_id;
    }

    /// Flush path used by teardown timers and final flushes: flushes the
    /// identified child's encryptor, dropping it when the file is no longer
    /// open. A child already flushed via `serialise` or an explicit flush
    /// (and untouched since) skips the redundant flush and only lets go of
    /// the stream.
    pub(crate) async fn flush_child_and_drop_encryptor(&self, file_id: u64) {
        let mut state = self.state.lock().await;
        if let Some(child) = state.children.iter_mut().find(|c| c.file_id == file_id) {
            if child.stream.is_none() {
                return;
            }
            if child.flushed {
                if child.open_count.load(Ordering::Acquire) == 0 {
                    child.stream = None;
                }
            } else {
                flush_encryptor(child).await;
            }
        }
    }

    /// Synchronous flush of one child on behalf of the façade; keeps the
    /// stream attached regardless of open count.
    pub(crate) async fn flush_child(&self, name: &str) -> Result<(), DriveError> {
        let mut state = self.state.lock().await;
        let idx = state
            .find(name)
            .ok_or_else(|| DriveError::no_such_file(name))?;
        let child = &mut state.children[idx];
        if let Some(stream) = child.stream.clone() {
            match stream.flush().await {
                Ok(Some(map)) => child.meta.apply_data_map(map),
                Ok(None) => {}
                Err(err) => {
                    error!("flush failed for {name}: {err}");
                    return Err(DriveError::unknown(name));
                }
            }
            child.flushed = true;
        }
        Ok(())
    }

    /// Open transition for a file child; installs the encryptor on 0 -> 1.
    pub(crate) async fn open_child(&self, name: &str, storage: &Arc<S>) -> Result<(), DriveError> {
        let mut state = self.state.lock().await;
        let idx = state
            .find(name)
            .ok_or_else(|| DriveError::no_such_file(name))?;
        let child = &mut state.children[idx];
        if child.meta.is_directory() {
            return Ok(());
        }
        let count = child.open_count.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("opening {name}, open count {count}");
        if count == 1 {
            child.attach_encryptor(storage);
        }
        Ok(())
    }

    /// Release transition for a file child; arms the encryptor teardown
    /// timer on 1 -> 0.
    pub(crate) async fn release_child(self: &Arc<Self>, name: &str) -> Result<(), DriveError> {
        let mut state = self.state.lock().await;
        let idx = state
            .find(name)
            .ok_or_else(|| DriveError::no_such_file(name))?;
        let child = &mut state.children[idx];
        if child.meta.is_directory() {
            return Ok(());
        }
        let count = child
            .open_count
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        trace!("releasing {name}, open count {count}");
        if count == 0 {
            self.schedule_child_teardown(child);
        }
        Ok(())
    }

    fn schedule_child_teardown(&self, child: &FileContext<S>) {
        let timer = child
            .timer
            .as_ref()
            .expect("released file must carry a teardown timer");
        let parent = child.parent.clone();
        let open_count = child.open_count.clone();
        let file_id = child.file_id;
        let name = child.meta.name.clone();
        let cancelled = timer.rearm(self.config.file_inactivity_delay, async move {
            if open_count.load(Ordering::Acquire) == 0 {
                if let Some(dir) = parent.get() {
                    dir.flush_child_and_drop_encryptor(file_id).await;
                }
            } else {
                warn!("skipping encryptor teardown for {name}: reopened");
            }
        });
        if cancelled > 0 {
            trace!("re-armed encryptor teardown for {}", child.meta.name);
        }
    }

    /// Stream of an open file child.
    pub(crate) async fn child_stream(
        &self,
        name: &str,
    ) -> Result<Arc<crate::chunk::encryptor::EncryptorStream<S>>, DriveError> {
        let state = self.state.lock().await;
        let idx = state
            .find(name)
            .ok_or_else(|| DriveError::no_such_file(name))?;
        state.children[idx]
            .stream
            .clone()
            .ok_or_else(|| DriveError::unknown(name))
    }

    /// Records that a write reached `end_offset` and schedules the parent
    /// store that will persist the new attributes.
    pub(crate) async fn record_write(
        &self,
        name: &str,
        end_offset: u64,
    ) -> Result<(), DriveError> {
        let mut state = self.state.lock().await;
        let idx = state
            .find(name)
            .ok_or_else(|| DriveError::no_such_file(name))?;
        let child = &mut state.children[idx];
        child.meta.grow_to(end_offset);
        child.flushed = false;
        self.do_schedule_for_storing(&mut state, true);
        Ok(())
    }

    /// Waits until the store state is Complete, up to `timeout`. Returns
    /// whether the state was reached.
    pub async fn wait_until_stored(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.store_gate.notified();
                tokio::pin!(notified);
                // Register before checking state, otherwise a transition
                // between the check and the await is a lost wake-up.
                notified.as_mut().enable();
                {
                    let state = self.state.lock().await;
                    if state.store_state == StoreState::Complete {
                        return;
                    }
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    async fn wait_while_ongoing(&self, timeout: Duration) {
        let reached = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.store_gate.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let state = self.state.lock().await;
                    if state.store_state != StoreState::Ongoing {
                        return;
                    }
                }
                notified.await;
            }
        })
        .await
        .is_ok();
        if !reached {
            warn!(
                "store for {} still ongoing after {:?}; proceeding",
                self.directory_id, timeout
            );
        }
    }

    /// Shutdown drain: force any pending store to fire now and wait for it
    /// to complete, bounded by the inactivity delay plus a grace period.
    pub(crate) async fn drain_pending_store(&self) -> bool {
        self.store_immediately_if_pending().await;
        let timeout =
            self.config.directory_inactivity_delay + crate::vfs::config::SHUTDOWN_GRACE;
        self.wait_until_stored(timeout).await
    }

    #[cfg(test)]
    pub(crate) async fn lock_state_for_test(
        &self,
    ) -> tokio::sync::MutexGuard<'_, DirState<S>> {
        self.state.lock().await
    }
}

/// Flushes a child's stream, folding the resulting data map back into its
/// metadata, and drops the stream once the file is no longer open.
async fn flush_encryptor<S: StorageBackend>(child: &mut FileContext<S>) {
    let Some(stream) = child.stream.clone() else {
        return;
    };
    match stream.flush().await {
        Ok(Some(map)) => child.meta.apply_data_map(map),
        Ok(None) => {}
        Err(err) => error!("encryptor flush failed for {}: {err}", child.meta.name),
    }
    if child.open_count.load(Ordering::Acquire) == 0 {
        child.stream = None;
    }
    child.flushed = true;
}

#[cfg(test)]
impl<S: StorageBackend> DirState<S> {
    pub(crate) fn child_names(&self) -> Vec<String> {
        self.children.iter().map(|c| c.meta.name.clone()).collect()
    }

    pub(crate) fn versions(&self) -> &VecDeque<VersionName> {
        &self.versions
    }

    pub(crate) fn child_flushed(&self, name: &str) -> bool {
        self.children
            .iter()
            .find(|c| c.meta.name == name)
            .map(|c| c.flushed)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::MemoryBackend;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> Arc<DriveConfig> {
        Arc::new(
            DriveConfig::default()
                .directory_inactivity_delay(Duration::from_millis(50))
                .file_inactivity_delay(Duration::from_millis(80))
                .max_versions(4),
        )
    }

    fn noop_functor() -> StoreFunctor {
        Arc::new(|_| async {}.boxed())
    }

    fn counting_functor(count: Arc<AtomicUsize>) -> StoreFunctor {
        Arc::new(move |_| {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    async fn fresh_dir() -> Arc<Directory<MemoryBackend>> {
        Directory::create(
            ParentId::random(),
            DirectoryId::random(),
            noop_functor(),
            test_config(),
        )
        .await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn children_stay_sorted_and_unique() {
        let dir = fresh_dir().await;
        for name in ["charlie", "alpha", "bravo"] {
            dir.add_child(FileContext::new_file(name)).await.unwrap();
        }
        {
            let state = dir.lock_state_for_test().await;
            assert_eq!(state.child_names(), ["alpha", "bravo", "charlie"]);
        }
        let err = dir.add_child(FileContext::new_file("bravo")).await.unwrap_err();
        assert!(matches!(err, DriveError::FileExists { .. }));
        assert!(dir.has_child("alpha").await);
        assert!(!dir.has_child("delta").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remove_transfers_ownership_and_missing_names_fail() {
        let dir = fresh_dir().await;
        dir.add_child(FileContext::new_file("keep")).await.unwrap();
        dir.add_child(FileContext::new_file("gone")).await.unwrap();

        let removed = dir.remove_child("gone").await.unwrap();
        assert_eq!(removed.meta.name, "gone");
        assert!(!dir.has_child("gone").await);

        let err = dir.remove_child("gone").await.unwrap_err();
        assert!(matches!(err, DriveError::NoSuchFile { .. }));
        let err = dir.child_meta("gone").await.unwrap_err();
        assert!(matches!(err, DriveError::NoSuchFile { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rename_keeps_order() {
        let dir = fresh_dir().await;
        dir.add_child(FileContext::new_file("aa")).await.unwrap();
        dir.add_child(FileContext::new_file("zz")).await.unwrap();
        dir.rename_child("aa", "mm").await.unwrap();
        {
            let state = dir.lock_state_for_test().await;
            assert_eq!(state.child_names(), ["mm", "zz"]);
        }
        let err = dir.rename_child("aa", "bb").await.unwrap_err();
        assert!(matches!(err, DriveError::NoSuchFile { .. }));
    }

    // Successful mutations rewind the readdir cursor, failed ones leave it
    // alone.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cursor_rules() {
        let dir = fresh_dir().await;
        for c in ['a', 'b', 'c', 'd'] {
            dir.add_child(FileContext::new_file(c.to_string())).await.unwrap();
        }
        assert_eq!(dir.get_child_and_increment_counter().await.unwrap().name, "a");
        assert_eq!(dir.get_child_and_increment_counter().await.unwrap().name, "b");

        // A successful add rewinds the cursor.
        dir.add_child(FileContext::new_file("e")).await.unwrap();
        assert_eq!(dir.get_child_and_increment_counter().await.unwrap().name, "a");
        assert_eq!(dir.get_child_and_increment_counter().await.unwrap().name, "b");

        // A successful remove rewinds it too.
        dir.remove_child("e").await.unwrap();
        assert_eq!(dir.get_child_and_increment_counter().await.unwrap().name, "a");
        assert_eq!(dir.get_child_and_increment_counter().await.unwrap().name, "b");

        // A failed remove does not.
        assert!(dir.remove_child("e").await.is_err());
        assert_eq!(dir.get_child_and_increment_counter().await.unwrap().name, "c");
        assert_eq!(dir.get_child_and_increment_counter().await.unwrap().name, "d");
        assert!(dir.get_child_and_increment_counter().await.is_none());

        dir.reset_children_counter().await;
        assert_eq!(dir.get_child_and_increment_counter().await.unwrap().name, "a");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serialised_blob_round_trips_and_omits_parent_id() {
        let parent_id = ParentId::random();
        let dir: Arc<Directory<MemoryBackend>> = Directory::create(
            parent_id,
            DirectoryId::random(),
            noop_functor(),
            test_config(),
        )
        .await;
        dir.add_child(FileContext::new_directory("sub")).await.unwrap();
        dir.add_child(FileContext::new_file("file.txt")).await.unwrap();

        let blob = dir.serialise().await.unwrap();
        let text = String::from_utf8(blob.to_vec()).unwrap();
        assert!(!text.contains(&parent_id.to_hex()));
        assert!(!text.contains("parent_id"));

        let recovered: Arc<Directory<MemoryBackend>> = Directory::from_blob(
            ParentId::random(),
            &blob,
            Vec::new(),
            noop_functor(),
            test_config(),
        )
        .unwrap();
        assert_eq!(recovered.directory_id(), dir.directory_id());
        let a = dir.lock_state_for_test().await.child_names();
        let b = recovered.lock_state_for_test().await.child_names();
        assert_eq!(a, b);
        assert_eq!(
            recovered.child_meta("file.txt").await.unwrap(),
            dir.child_meta("file.txt").await.unwrap()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rename_there_and_back_restores_the_exact_blob() {
        let dir = fresh_dir().await;
        dir.add_child(FileContext::new_file("x")).await.unwrap();
        dir.add_child(FileContext::new_file("y")).await.unwrap();

        let before = dir.serialise().await.unwrap();
        dir.add_new_version(VersionId::random()).await;

        dir.rename_child("x", "z").await.unwrap();
        dir.rename_child("z", "x").await.unwrap();

        let after = dir.serialise().await.unwrap();
        dir.add_new_version(VersionId::random()).await;
        assert_eq!(before, after);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn version_chain_grows_strictly_and_stays_capped() {
        let dir = fresh_dir().await;
        let (_, first) = dir.initialise_versions(VersionId::random()).await.unwrap();
        assert_eq!(first.index, 0);
        assert!(dir.initialise_versions(VersionId::random()).await.is_err());

        let mut last = first;
        let mut seen = vec![first];
        for _ in 0..6 {
            let (_, previous, new) = dir.add_new_version(VersionId::random()).await;
            assert_eq!(previous.unwrap(), last);
            assert_eq!(new.index, last.index + 1);
            assert!(!seen.contains(&new));
            seen.push(new);
            last = new;
        }
        // Capped at max_versions with strictly decreasing indices.
        let state = dir.lock_state_for_test().await;
        assert_eq!(state.versions().len(), 4);
        let indices: Vec<u64> = state.versions().iter().map(|v| v.index).collect();
        assert_eq!(indices, [6, 5, 4, 3]);
    }

    // A cap of one must not eat the previous head before it is reported:
    // the store pipeline relies on `previous` to tell a brand-new chain
    // from an extension.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_version_cap_still_reports_the_previous_head() {
        let dir: Arc<Directory<MemoryBackend>> = Directory::create(
            ParentId::random(),
            DirectoryId::random(),
            noop_functor(),
            Arc::new(
                DriveConfig::default()
                    .directory_inactivity_delay(Duration::from_millis(50))
                    .max_versions(1),
            ),
        )
        .await;

        let (_, previous, v0) = dir.add_new_version(VersionId::random()).await;
        assert!(previous.is_none());

        let (_, previous, v1) = dir.add_new_version(VersionId::random()).await;
        assert_eq!(previous, Some(v0));
        assert_eq!(v1.index, 1);

        let (_, previous, v2) = dir.add_new_version(VersionId::random()).await;
        assert_eq!(previous, Some(v1));
        assert_eq!(v2.index, 2);

        let state = dir.lock_state_for_test().await;
        assert_eq!(state.versions().len(), 1);
        assert_eq!(state.versions().front().copied(), Some(v2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn first_version_without_initialise_is_index_zero() {
        let dir = fresh_dir().await;
        let (_, previous, new) = dir.add_new_version(VersionId::random()).await;
        assert!(previous.is_none());
        assert_eq!(new.index, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_state_walks_pending_ongoing_complete() {
        let dir = fresh_dir().await;
        // Construction schedules the first store.
        assert_eq!(dir.store_state().await, StoreState::Pending);

        let _blob = dir.serialise().await.unwrap();
        assert_eq!(dir.store_state().await, StoreState::Ongoing);
        assert!(!dir.wait_until_stored(Duration::from_millis(30)).await);

        dir.add_new_version(VersionId::random()).await;
        assert_eq!(dir.store_state().await, StoreState::Complete);
        assert!(dir.wait_until_stored(Duration::from_millis(30)).await);

        dir.schedule_for_storing().await;
        assert_eq!(dir.store_state().await, StoreState::Pending);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_immediately_brings_the_deadline_forward() {
        let fired = Arc::new(AtomicUsize::new(0));
        let dir: Arc<Directory<MemoryBackend>> = Directory::create(
            ParentId::random(),
            DirectoryId::random(),
            counting_functor(fired.clone()),
            Arc::new(
                DriveConfig::default()
                    .directory_inactivity_delay(Duration::from_secs(60)),
            ),
        )
        .await;
        // Nothing fires on its own within the long delay.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        dir.store_immediately_if_pending().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // With nothing pending any more, it is a no-op.
        dir.add_new_version(VersionId::random()).await;
        dir.store_immediately_if_pending().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    // An explicit flush marks the child clean; the teardown that follows a
    // release then drops the stream without flushing again, while a write
    // in between forces the full flush path.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn teardown_skips_the_flush_after_an_explicit_flush() {
        let storage = Arc::new(MemoryBackend::new());
        let dir = fresh_dir().await;
        let mut child = FileContext::new_file("f");
        child.attach_encryptor(&storage);
        child.open_count.store(1, Ordering::SeqCst);
        dir.add_child(child).await.unwrap();

        let stream = dir.child_stream("f").await.unwrap();
        stream.write(0, b"warm data").await.unwrap();
        dir.record_write("f", 9).await.unwrap();
        assert!(!dir.lock_state_for_test().await.child_flushed("f"));

        dir.flush_child("f").await.unwrap();
        assert!(dir.lock_state_for_test().await.child_flushed("f"));

        dir.release_child("f").await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        // The stream is gone and the metadata kept the flushed map.
        assert!(dir.child_stream("f").await.is_err());
        let meta = dir.child_meta("f").await.unwrap();
        assert_eq!(meta.data_map.expect("flushed map").file_size, 9);

        // A later write clears the flag again.
        dir.open_child("f", &storage).await.unwrap();
        let stream = dir.child_stream("f").await.unwrap();
        stream.write(9, b"!").await.unwrap();
        dir.record_write("f", 10).await.unwrap();
        assert!(!dir.lock_state_for_test().await.child_flushed("f"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn set_new_parent_waits_for_the_ongoing_store() {
        let dir = fresh_dir().await;
        let _blob = dir.serialise().await.unwrap();
        assert_eq!(dir.store_state().await, StoreState::Ongoing);

        let new_parent = ParentId::random();
        let waiter = {
            let dir = dir.clone();
            tokio::spawn(async move {
                dir.set_new_parent(new_parent).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        dir.add_new_version(VersionId::random()).await;
        waiter.await.unwrap();
        assert_eq!(dir.parent_id().await, new_parent);
    }
}
