//! Codec for the persisted directory blob.
//!
//! The blob is a JSON record of the directory's identity, version cap and
//! children. The owning parent's identity is deliberately absent: parent
//! linkage lives only in the in-memory handler, so moving a directory never
//! rewrites the directory itself.

use crate::meta::id::DirectoryId;
use crate::meta::metadata::MetaData;
use crate::vfs::error::DriveError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct DirectoryBlob {
    directory_id: DirectoryId,
    max_versions: u32,
    children: Vec<MetaData>,
}

/// A deserialised directory blob.
#[derive(Debug)]
pub struct ParsedDirectory {
    pub directory_id: DirectoryId,
    pub max_versions: u32,
    pub children: Vec<MetaData>,
}

pub fn serialise_directory(
    directory_id: DirectoryId,
    max_versions: u32,
    children: Vec<MetaData>,
) -> Result<Bytes, DriveError> {
    let blob = DirectoryBlob {
        directory_id,
        max_versions,
        children,
    };
    let bytes = serde_json::to_vec(&blob).map_err(|_| DriveError::ParsingError)?;
    Ok(Bytes::from(bytes))
}

pub fn deserialise_directory(bytes: &[u8]) -> Result<ParsedDirectory, DriveError> {
    let blob: DirectoryBlob =
        serde_json::from_slice(bytes).map_err(|_| DriveError::ParsingError)?;
    if blob.max_versions == 0 {
        return Err(DriveError::ParsingError);
    }
    Ok(ParsedDirectory {
        directory_id: blob.directory_id,
        max_versions: blob.max_versions,
        children: blob.children,
    })
}
