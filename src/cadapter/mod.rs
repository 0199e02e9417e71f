//! Storage adapters: the backend trait plus in-memory and local-filesystem
//! implementations.

pub mod client;
pub mod localfs;
pub mod memory;

pub use client::StorageBackend;
pub use localfs::LocalFsBackend;
pub use memory::MemoryBackend;
