//! Tunables for the write-back engine.

use std::time::Duration;

/// Quiet period after the last mutation before a directory store fires.
pub const DEFAULT_DIRECTORY_INACTIVITY_DELAY: Duration = Duration::from_secs(5);
/// Quiet period after the last release before a file's encryptor is torn down.
pub const DEFAULT_FILE_INACTIVITY_DELAY: Duration = Duration::from_secs(60);
/// Retained directory versions per chain.
pub const DEFAULT_MAX_VERSIONS: u32 = 100;

/// Extra slack granted to shutdown drains on top of the store delay.
pub(crate) const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct DriveConfig {
    pub directory_inactivity_delay: Duration,
    pub file_inactivity_delay: Duration,
    pub max_versions: u32,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            directory_inactivity_delay: DEFAULT_DIRECTORY_INACTIVITY_DELAY,
            file_inactivity_delay: DEFAULT_FILE_INACTIVITY_DELAY,
            max_versions: DEFAULT_MAX_VERSIONS,
        }
    }
}

impl DriveConfig {
    pub fn directory_inactivity_delay(self, delay: Duration) -> Self {
        Self {
            directory_inactivity_delay: delay,
            ..self
        }
    }

    pub fn file_inactivity_delay(self, delay: Duration) -> Self {
        Self {
            file_inactivity_delay: delay,
            ..self
        }
    }

    pub fn max_versions(self, max_versions: u32) -> Self {
        assert!(max_versions > 0, "max_versions must be positive");
        Self {
            max_versions,
            ..self
        }
    }
}
