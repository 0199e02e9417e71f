//! Opaque fixed-width identifiers for directories, versions and chunks.
//!
//! All identities are 32 bytes and travel as hex on the wire. Content-derived
//! names (chunk names, version ids) are SHA-256 of the payload, so puts are
//! idempotent by construction.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub const ID_SIZE: usize = 32;

macro_rules! identity_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(#[serde(with = "hex")] [u8; ID_SIZE]);

        impl $name {
            pub fn random() -> Self {
                let mut bytes = [0u8; ID_SIZE];
                rand::rng().fill_bytes(&mut bytes);
                Self(bytes)
            }

            pub fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
                Self(bytes)
            }

            /// Name derived from content: SHA-256 of the payload.
            pub fn of_content(data: &[u8]) -> Self {
                let digest = Sha256::digest(data);
                Self(digest.into())
            }

            pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Short form for logs.
                write!(f, "{}..", &hex::encode(&self.0[..6]))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }
    };
}

identity_type! {
    /// Identity of a directory; key of its version chain in the backend.
    DirectoryId
}

identity_type! {
    /// Identity of the directory (or user) that owns an entry. Never
    /// serialised into a directory blob.
    ParentId
}

identity_type! {
    /// Identity of one stored directory blob (its chunk name).
    VersionId
}

identity_type! {
    /// Content address of an encrypted chunk.
    ChunkName
}

impl VersionId {
    /// A version's blob is stored as a chunk named after the version itself.
    pub fn chunk_name(&self) -> ChunkName {
        ChunkName::from_bytes(*self.as_bytes())
    }
}

impl From<DirectoryId> for ParentId {
    fn from(id: DirectoryId) -> Self {
        ParentId(*id.as_bytes())
    }
}

/// One link of a directory's version chain: a monotonically increasing index
/// paired with the blob's chunk name.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct VersionName {
    pub index: u64,
    pub id: VersionId,
}

impl VersionName {
    pub fn new(index: u64, id: VersionId) -> Self {
        Self { index, id }
    }
}
