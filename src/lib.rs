// Library crate for vaultfs: expose the drive surface while keeping
// internals private.

pub mod cadapter;
pub mod chunk;
pub mod daemon;
pub mod meta;
pub mod vfs;

// Public surface for embedders (mount bridges, launchers).
pub use crate::cadapter::client::StorageBackend;
pub use crate::cadapter::localfs::LocalFsBackend;
pub use crate::cadapter::memory::MemoryBackend;
pub use crate::chunk::datamap::DataMap;
pub use crate::chunk::encryptor::EncryptorStream;
pub use crate::meta::id::{ChunkName, DirectoryId, ParentId, VersionId, VersionName};
pub use crate::meta::metadata::{Attributes, MetaData};
pub use crate::vfs::config::DriveConfig;
pub use crate::vfs::directory::{Directory, StoreState};
pub use crate::vfs::drive::Drive;
pub use crate::vfs::error::{DriveError, PathHint};
pub use crate::vfs::file_context::FileContext;
pub use crate::vfs::handler::DirectoryHandler;
