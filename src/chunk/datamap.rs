//! Chunk manifests ("data maps") describing how a file's bytes are
//! reconstituted from encrypted chunks.
//!
//! Small files skip chunking entirely and keep their bytes inline in the map;
//! everything else records one `ChunkDesc` per fixed-size chunk. The
//! per-chunk key is convergent (derived from the plaintext), so identical
//! content always produces identical chunks and names.

use crate::meta::id::ChunkName;
use serde::{Deserialize, Serialize};

/// Chunk size for file content.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Files at or below this size are stored inline in the data map instead of
/// as chunks.
pub const INLINE_CONTENT_MAX: usize = 4 * 1024;

/// Convergent encryption key for one chunk.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkKey(#[serde(with = "hex")] pub [u8; 32]);

impl std::fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChunkKey(..)")
    }
}

/// One stored chunk of a file: its content address, plaintext length and key.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ChunkDesc {
    pub name: ChunkName,
    pub size: u32,
    pub key: ChunkKey,
}

/// Manifest of the encrypted chunks (or inline bytes) making up one file.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct DataMap {
    pub file_size: u64,
    /// Set iff the file is small enough to live inline; mutually exclusive
    /// with `chunks`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<ChunkDesc>,
}

impl DataMap {
    pub fn is_empty(&self) -> bool {
        self.file_size == 0
    }

    /// Chunk names referenced by this map.
    pub fn chunk_names(&self) -> impl Iterator<Item = &ChunkName> {
        self.chunks.iter().map(|c| &c.name)
    }
}
