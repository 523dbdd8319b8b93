use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Enumeration of errors that abort a whole poll cycle. The cycle is skipped, the loop continues.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("watched directory {} is unavailable: {source}", .path.display())]
    DirectoryUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The cause behind a `TransferOutcome::TransportFailure`.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("failed to read local file: {0}")]
    Read(#[from] io::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::Request(error) => error.is_timeout(),
            TransportError::Read(_) => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Request(error) if error.is_timeout() => "timeout",
            TransportError::Request(error) if error.is_connect() => "connect",
            TransportError::Request(_) => "request",
            TransportError::Read(_) => "read",
        }
    }
}

/// Enumeration of errors removing a file the remote already accepted.
#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("failed to delete uploaded file {}: {source}", .path.display())]
    DeleteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Enumeration of errors moving an exhausted file aside. The file stays in the watched directory.
#[derive(Error, Debug)]
pub enum QuarantineError {
    #[error("{} has no file name", .0.display())]
    NoFileName(PathBuf),
    #[error("failed to create quarantine directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to reserve a name in quarantine for {}: {source}", .path.display())]
    Reserve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to copy {} to {}: {source}", .path.display(), .destination.display())]
    Copy {
        path: PathBuf,
        destination: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove {} after copying it to {}: {source}", .path.display(), .destination.display())]
    RemoveOriginal {
        path: PathBuf,
        destination: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to roll back quarantine copy {}, the file now exists twice: {source}", .destination.display())]
    Rollback {
        destination: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Enumeration of configuration problems detected at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid upload url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("upload url must use http or https, got {0}")]
    UnsupportedScheme(String),
    #[error("invalid file pattern {pattern}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
    #[error("lock suffix must not be empty")]
    EmptyLockSuffix,
    #[error("request timeout must be greater than zero")]
    ZeroRequestTimeout,
    #[error("RETRY_MAX_ATTEMPTS must be at least 1")]
    ZeroMaxAttempts,
    #[error("RETRY_MAX_ATTEMPTS requires RETRY_QUARANTINE_DIR to be set")]
    MissingQuarantineDir,
    #[error("quarantine directory {} must differ from the watched directory", .0.display())]
    QuarantineIsWatchDir(PathBuf),
}

/// Enumeration of errors that prevent the uploader from starting.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to load configuration from env: {0}")]
    EnvError(#[from] envconfig::Error),
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("failed to construct http client: {0}")]
    HttpClientError(#[source] reqwest::Error),
    #[error("failed to install metrics recorder: {0}")]
    MetricsError(#[from] metrics_exporter_prometheus::BuildError),
    #[error("failed to install signal handler: {0}")]
    SignalError(#[source] io::Error),
}
