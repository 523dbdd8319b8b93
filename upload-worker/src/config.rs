use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use globset::GlobMatcher;
use upload_common::retry::RetryPolicy;
use url::Url;

use crate::error::ConfigError;
use crate::lock::LockOracle;
use crate::reconcile::RetryCap;
use crate::scanner::compile_pattern;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(from = "UPLOAD_URL")]
    pub upload_url: NonEmptyString,

    #[envconfig(from = "API_KEY")]
    pub api_key: NonEmptyString,

    #[envconfig(from = "WATCH_DIR", default = "/mnt")]
    pub watch_dir: PathBuf,

    #[envconfig(from = "FILE_PATTERN", default = "*.jpg")]
    pub file_pattern: NonEmptyString,

    #[envconfig(from = "LOCK_SUFFIX", default = ".lock")]
    pub lock_suffix: String,

    #[envconfig(from = "POLL_INTERVAL", default = "3000")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(from = "REQUEST_TIMEOUT", default = "30000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(from = "STABILITY_CHECK", default = "false")]
    pub stability_check: bool,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn upload_url(&self) -> Result<Url, ConfigError> {
        let raw = self.upload_url.as_str();
        let url = Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
            url: raw.to_owned(),
            source,
        })?;

        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConfigError::UnsupportedScheme(other.to_owned())),
        }
    }

    pub fn file_matcher(&self) -> Result<GlobMatcher, ConfigError> {
        let pattern = self.file_pattern.as_str();
        compile_pattern(pattern).map_err(|source| ConfigError::InvalidPattern {
            pattern: pattern.to_owned(),
            source,
        })
    }

    pub fn lock_oracle(&self) -> Result<LockOracle, ConfigError> {
        if self.lock_suffix.is_empty() {
            return Err(ConfigError::EmptyLockSuffix);
        }
        Ok(LockOracle::new(&self.lock_suffix))
    }

    pub fn request_timeout(&self) -> Result<time::Duration, ConfigError> {
        if self.request_timeout.0.is_zero() {
            return Err(ConfigError::ZeroRequestTimeout);
        }
        Ok(self.request_timeout.0)
    }

    pub fn retry_cap(&self) -> Result<Option<RetryCap>, ConfigError> {
        self.retry_policy.retry_cap(&self.watch_dir)
    }

    /// How long the scheduler may go without reporting before liveness fails.
    /// A cycle reports between files, so the worst gap is one idle period plus one upload.
    pub fn liveness_deadline(&self) -> ::time::Duration {
        let deadline = self
            .poll_interval
            .0
            .saturating_add(self.request_timeout.0.saturating_mul(2));
        ::time::Duration::try_from(deadline).unwrap_or(::time::Duration::MAX)
    }

    /// Check every setting that can be checked without touching the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.upload_url()?;
        self.file_matcher()?;
        self.lock_oracle()?;
        self.request_timeout()?;
        self.retry_cap()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "RETRY_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    /// Zero keeps the plain behavior: a failed file is attempted again on the next cycle.
    #[envconfig(from = "RETRY_INITIAL_INTERVAL", default = "0")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_MAXIMUM_INTERVAL", default = "300000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,

    #[envconfig(from = "RETRY_QUARANTINE_DIR")]
    pub quarantine_dir: Option<PathBuf>,
}

impl RetryPolicyConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.backoff_coefficient,
            self.initial_interval.0,
            Some(self.maximum_interval.0),
        )
    }

    pub fn retry_cap(&self, watch_dir: &Path) -> Result<Option<RetryCap>, ConfigError> {
        let Some(max_attempts) = self.max_attempts else {
            return Ok(None);
        };
        if max_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        let quarantine_dir = self
            .quarantine_dir
            .clone()
            .ok_or(ConfigError::MissingQuarantineDir)?;
        if same_directory(&quarantine_dir, watch_dir) {
            return Err(ConfigError::QuarantineIsWatchDir(quarantine_dir));
        }

        Ok(Some(RetryCap {
            max_attempts,
            quarantine_dir,
        }))
    }
}

/// Compare directories that may not exist yet: resolved paths when both exist, otherwise
/// absolute paths with `.` and `..` folded away.
fn same_directory(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => lexically_absolute(a) == lexically_absolute(b),
    }
}

fn lexically_absolute(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
