//! File content layer: chunk manifests and the encryption stream that
//! reads/writes them through the storage backend.

pub mod datamap;
pub mod encryptor;

pub use datamap::{ChunkDesc, ChunkKey, DataMap};
pub use encryptor::EncryptorStream;
