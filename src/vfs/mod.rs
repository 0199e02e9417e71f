//! The drive core: cached directories, their write-back state machine, the
//! path handler and the filesystem façade.
//!
//! Responsibilities:
//! - Keep the cached tree consistent with the content-addressed backend.
//! - Coalesce mutation bursts into deferred, versioned directory stores.
//! - Manage per-file encryption streams across open/release cycles.
//!
//! Submodules:
//! - `directory`: one cached directory and its store state machine
//! - `file_context`: per-entry cache record
//! - `handler`: path resolution, fetch-on-demand and store dispatch
//! - `drive`: the path-addressed façade

pub mod config;
pub mod directory;
pub mod drive;
pub mod error;
pub mod file_context;
pub mod handler;

pub use config::DriveConfig;
pub use directory::{Directory, StoreState};
pub use drive::Drive;
pub use error::DriveError;
pub use file_context::FileContext;
pub use handler::DirectoryHandler;
