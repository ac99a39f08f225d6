use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Where message bodies are buffered while a transaction is in flight.
///
/// The directory should sit on the same filesystem as the message store so
/// the delivery agent can rename the buffered file into place instead of
/// copying it.
#[derive(Debug, Clone, Deserialize)]
pub struct SpoolConfig {
    #[serde(default = "default_path")]
    pub path: PathBuf,
}

fn default_path() -> PathBuf {
    PathBuf::from("/var/spool/postern")
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
        }
    }
}

impl SpoolConfig {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
