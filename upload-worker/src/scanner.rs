use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use tracing::{debug, warn};

use crate::error::ScanError;
use crate::lock::LockOracle;

/// A file matching the watched pattern, discovered during one poll cycle.
/// Candidates are rebuilt from the directory listing every cycle and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFile {
    pub path: PathBuf,
    /// Size when the file was discovered. None if it could not be read.
    pub size: Option<u64>,
    pub discovered_at: DateTime<Utc>,
}

impl CandidateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            size: None,
            discovered_at: Utc::now(),
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// The bare file name, used as the multipart file name.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl fmt::Display for CandidateFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

pub fn compile_pattern(pattern: &str) -> Result<GlobMatcher, globset::Error> {
    Ok(Glob::new(pattern)?.compile_matcher())
}

/// Flat scan of a single directory for file names matching a glob.
pub struct DirectoryScanner {
    directory: PathBuf,
    matcher: GlobMatcher,
    lock: LockOracle,
}

impl DirectoryScanner {
    pub fn new(directory: impl Into<PathBuf>, matcher: GlobMatcher, lock: LockOracle) -> Self {
        Self {
            directory: directory.into(),
            matcher,
            lock,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// List the matching files present right now, in lexical order.
    ///
    /// Names are collected up front so the order is stable, while each file is only stat'ed
    /// once the iterator reaches it. Files gone by then are dropped from the sequence.
    /// Sub-directories (symlinked or not) are never entered.
    pub fn scan(&self) -> Result<impl Iterator<Item = CandidateFile>, ScanError> {
        let entries =
            fs::read_dir(&self.directory).map_err(|source| ScanError::DirectoryUnavailable {
                path: self.directory.clone(),
                source,
            })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    warn!(directory = %self.directory.display(), %error, "failed to read directory entry");
                    continue;
                }
            };

            if self.is_candidate_name(&entry.file_name()) {
                paths.push(entry.path());
            }
        }
        paths.sort();

        Ok(paths.into_iter().filter_map(discover))
    }

    fn is_candidate_name(&self, file_name: &OsStr) -> bool {
        !self.lock.is_marker(file_name) && self.matcher.is_match(Path::new(file_name))
    }
}

fn discover(path: PathBuf) -> Option<CandidateFile> {
    match fs::metadata(&path) {
        Ok(metadata) if metadata.is_file() => Some(CandidateFile::new(path).with_size(metadata.len())),
        Ok(_) => {
            debug!(path = %path.display(), "skipping non-file entry");
            None
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "file vanished before it was inspected");
            None
        }
        Err(error) => {
            // Let the upload attempt decide; it reports a precise outcome.
            warn!(path = %path.display(), %error, "failed to inspect file");
            Some(CandidateFile::new(path))
        }
    }
}
