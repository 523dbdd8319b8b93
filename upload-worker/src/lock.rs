//! The lock marker protocol shared with the producer writing into the watched directory.
//!
//! For a file `X`, a sibling named `X` + suffix (`X.lock` by default) means "do not touch `X` yet".
//! Markers belong to the producer: they are only ever read here, never created or removed.
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::warn;

#[derive(Debug, Clone)]
pub struct LockOracle {
    suffix: String,
}

impl LockOracle {
    pub fn new(suffix: &str) -> Self {
        Self {
            suffix: suffix.to_owned(),
        }
    }

    /// The marker path for `path`: the full file name with the suffix appended.
    pub fn marker_path(&self, path: &Path) -> PathBuf {
        let mut marker = path.as_os_str().to_owned();
        marker.push(&self.suffix);
        PathBuf::from(marker)
    }

    /// Whether a file name is itself a lock marker, so it never becomes an upload candidate.
    pub fn is_marker(&self, file_name: &OsStr) -> bool {
        file_name.to_string_lossy().ends_with(&self.suffix)
    }

    /// Check for the marker of `path`.
    ///
    /// This is check-then-act against another process: a marker may appear right after this
    /// returns false. A half-written upload is then caught by the upload outcome, not here.
    /// When the check itself fails (e.g. permission denied on the directory) the file is
    /// treated as locked.
    pub fn is_locked(&self, path: &Path) -> bool {
        let marker = self.marker_path(path);
        match marker.try_exists() {
            Ok(exists) => exists,
            Err(error) => {
                warn!(
                    file = %path.display(),
                    marker = %marker.display(),
                    %error,
                    "failed to check lock marker, treating file as locked"
                );
                true
            }
        }
    }
}

impl Default for LockOracle {
    fn default() -> Self {
        Self::new(".lock")
    }
}
