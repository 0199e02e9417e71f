//! Per-entry cache record: the metadata, open state and encryption stream of
//! one child of a cached directory.

use crate::cadapter::client::StorageBackend;
use crate::chunk::encryptor::EncryptorStream;
use crate::daemon::timer::DelayTimer;
use crate::meta::metadata::MetaData;
use crate::vfs::directory::Directory;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

/// Non-owning handle to the directory that owns an entry, resolved on use.
/// Shared with teardown callbacks so a cross-directory move retargets them
/// without re-arming.
pub(crate) struct ParentHandle<S: StorageBackend> {
    cell: Arc<Mutex<Weak<Directory<S>>>>,
}

impl<S: StorageBackend> Clone for ParentHandle<S> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<S: StorageBackend> ParentHandle<S> {
    pub(crate) fn unset() -> Self {
        Self {
            cell: Arc::new(Mutex::new(Weak::new())),
        }
    }

    pub(crate) fn set(&self, dir: &Arc<Directory<S>>) {
        *self.cell.lock() = Arc::downgrade(dir);
    }

    pub(crate) fn set_weak(&self, dir: Weak<Directory<S>>) {
        *self.cell.lock() = dir;
    }

    pub(crate) fn get(&self) -> Option<Arc<Directory<S>>> {
        self.cell.lock().upgrade()
    }
}

/// Cache node for one directory entry.
///
/// Ownership lives with the containing `Directory`; removal transfers the
/// whole record to the caller. The open count is shared with teardown
/// callbacks, which read it without the parent lock.
pub struct FileContext<S: StorageBackend> {
    pub meta: MetaData,
    pub(crate) stream: Option<Arc<EncryptorStream<S>>>,
    pub(crate) timer: Option<DelayTimer>,
    pub(crate) open_count: Arc<AtomicU32>,
    pub(crate) parent: ParentHandle<S>,
    pub(crate) file_id: u64,
    /// Set once the stream has been flushed (its data map folded into
    /// `meta`) with no write since; the inactivity callback then drops the
    /// stream without flushing it again. Cleared by every recorded write.
    pub(crate) flushed: bool,
}

impl<S: StorageBackend> FileContext<S> {
    pub fn new_file(name: impl Into<String>) -> Self {
        Self::from_meta(MetaData::new_file(name))
    }

    pub fn new_directory(name: impl Into<String>) -> Self {
        Self::from_meta(MetaData::new_directory(name))
    }

    pub(crate) fn from_meta(meta: MetaData) -> Self {
        Self {
            meta,
            stream: None,
            timer: None,
            open_count: Arc::new(AtomicU32::new(0)),
            parent: ParentHandle::unset(),
            file_id: NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed),
            flushed: false,
        }
    }

    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Acquire)
    }

    /// Installs the encryption stream for a file about to be opened.
    ///
    /// Must run under the parent directory's lock. If cancelling the
    /// inactivity timer revoked a pending teardown, the existing stream is
    /// still attached and is reused; this is what lets rapid close/reopen
    /// sequences keep one encryption stream.
    pub(crate) fn attach_encryptor(&mut self, storage: &Arc<S>) {
        debug_assert!(!self.meta.is_directory());
        debug_assert!(self.open_count() <= 1);
        match &self.timer {
            None => self.timer = Some(DelayTimer::new()),
            Some(timer) => {
                if timer.cancel() > 0 {
                    debug_assert!(self.stream.is_some());
                    return;
                }
            }
        }
        let map = self.meta.data_map.clone().unwrap_or_default();
        self.stream = Some(Arc::new(EncryptorStream::new(map, storage.clone())));
    }

    /// Drops timer and stream without flushing; used when the entry's data is
    /// going away anyway.
    pub(crate) fn discard(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        self.stream = None;
    }
}

impl<S: StorageBackend> std::fmt::Debug for FileContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileContext")
            .field("name", &self.meta.name)
            .field("is_directory", &self.meta.is_directory())
            .field("open_count", &self.open_count())
            .field("has_stream", &self.stream.is_some())
            .finish()
    }
}
