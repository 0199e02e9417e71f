//! Per-entry metadata: the record serialised for every child of a directory.

use crate::chunk::datamap::DataMap;
use crate::meta::id::DirectoryId;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

/// POSIX-like attribute block.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Attributes {
    pub size: u64,
    pub blocks: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl Attributes {
    fn new(mode: u32) -> Self {
        let now = now_secs();
        Self {
            size: 0,
            blocks: 0,
            mode,
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }
}

/// Metadata of one directory entry. `directory_id` doubles as the
/// is-a-directory flag; `data_map` is present only for files that have been
/// flushed at least once.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct MetaData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory_id: Option<DirectoryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_map: Option<DataMap>,
    pub attr: Attributes,
}

impl MetaData {
    pub fn new_file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directory_id: None,
            data_map: None,
            attr: Attributes::new(DEFAULT_FILE_MODE),
        }
    }

    pub fn new_directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directory_id: Some(DirectoryId::random()),
            data_map: None,
            attr: Attributes::new(DEFAULT_DIR_MODE),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.directory_id.is_some()
    }

    /// Record a write reaching `end_offset`; size only ever grows here,
    /// truncation is a separate metadata operation.
    pub fn grow_to(&mut self, end_offset: u64) {
        self.attr.size = self.attr.size.max(end_offset);
        self.attr.blocks = self.attr.size / 512;
        self.attr.mtime = now_secs();
    }

    /// Adopt the sizes recorded by a freshly flushed data map.
    pub fn apply_data_map(&mut self, map: DataMap) {
        self.attr.size = map.file_size;
        self.attr.blocks = map.file_size / 512;
        self.data_map = Some(map);
    }
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
