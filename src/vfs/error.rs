//! Error surface of the drive core.
//!
//! Lookup and mutation failures carry an optional path hint for log/display
//! purposes; embedders that need OS error codes convert through
//! `std::io::Error`.

use std::fmt;
use std::io::ErrorKind;
use thiserror::Error;

#[derive(Debug, Clone, Default)]
pub struct PathHint(Option<String>);

impl PathHint {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn some(path: impl Into<String>) -> Self {
        Self(Some(path.into()))
    }
}

impl fmt::Display for PathHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(path) if !path.is_empty() => write!(f, ": {path}"),
            _ => Ok(()),
        }
    }
}

impl From<String> for PathHint {
    fn from(value: String) -> Self {
        Self::some(value)
    }
}

impl From<&str> for PathHint {
    fn from(value: &str) -> Self {
        Self::some(value)
    }
}

#[derive(Error, Debug)]
pub enum DriveError {
    #[error("no such file{path}")]
    NoSuchFile { path: PathHint },

    #[error("file exists{path}")]
    FileExists { path: PathHint },

    #[error("failed to parse directory listing")]
    ParsingError,

    #[error("storage backend failure: {0}")]
    Backend(#[source] anyhow::Error),

    #[error("unknown failure{path}")]
    Unknown { path: PathHint },
}

impl DriveError {
    pub fn no_such_file(path: impl Into<PathHint>) -> Self {
        DriveError::NoSuchFile { path: path.into() }
    }

    pub fn file_exists(path: impl Into<PathHint>) -> Self {
        DriveError::FileExists { path: path.into() }
    }

    pub fn unknown(path: impl Into<PathHint>) -> Self {
        DriveError::Unknown { path: path.into() }
    }
}

impl From<DriveError> for std::io::Error {
    fn from(value: DriveError) -> Self {
        let kind = match &value {
            DriveError::NoSuchFile { .. } => ErrorKind::NotFound,
            DriveError::FileExists { .. } => ErrorKind::AlreadyExists,
            DriveError::ParsingError => ErrorKind::InvalidData,
            DriveError::Backend(_) | DriveError::Unknown { .. } => ErrorKind::Other,
        };
        std::io::Error::new(kind, value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_hints_render_inline() {
        let err = DriveError::no_such_file("/a/b.txt");
        assert_eq!(err.to_string(), "no such file: /a/b.txt");
        let bare = DriveError::NoSuchFile {
            path: PathHint::none(),
        };
        assert_eq!(bare.to_string(), "no such file");
    }

    #[test]
    fn io_error_kinds_follow_the_taxonomy() {
        let io: std::io::Error = DriveError::no_such_file("x").into();
        assert_eq!(io.kind(), ErrorKind::NotFound);
        let io: std::io::Error = DriveError::file_exists("x").into();
        assert_eq!(io.kind(), ErrorKind::AlreadyExists);
        let io: std::io::Error = DriveError::ParsingError.into();
        assert_eq!(io.kind(), ErrorKind::InvalidData);
    }
}
