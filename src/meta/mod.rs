//! Metadata model: identities, per-entry metadata, and the persisted
//! directory blob codec.

pub mod id;
pub mod metadata;
pub mod serialization;

pub use id::{ChunkName, DirectoryId, ParentId, VersionId, VersionName};
pub use metadata::{Attributes, MetaData};
