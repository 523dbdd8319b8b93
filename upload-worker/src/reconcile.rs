use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::time;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use upload_common::retry::RetryPolicy;

use crate::error::{CleanupError, QuarantineError};
use crate::scanner::CandidateFile;
use crate::upload::TransferOutcome;

/// Bounded retries: after `max_attempts` failed uploads a file is moved into `quarantine_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryCap {
    pub max_attempts: u32,
    pub quarantine_dir: PathBuf,
}

/// The local action taken after an upload attempt.
#[derive(Debug)]
pub enum Reconciliation {
    /// Upload confirmed and the local copy is gone.
    Deleted,
    /// Upload confirmed but the local copy could not be removed. It will be uploaded again.
    CleanupFailed(CleanupError),
    /// Kept for another attempt, not before `retry_in` has passed.
    Retained { attempt: u32, retry_in: time::Duration },
    /// Out of attempts, moved aside.
    Quarantined { destination: PathBuf },
    /// Nothing to do, the file is already gone.
    Vanished,
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    attempts: u32,
    not_before: Instant,
}

/// Decides what happens to a local file once its upload attempt has an outcome.
///
/// A file is deleted only after a `Success` outcome. Failed files are kept and tracked in an
/// in-memory ledger that drives backoff and, when a cap is configured, quarantine.
pub struct Reconciler {
    policy: RetryPolicy,
    cap: Option<RetryCap>,
    ledger: HashMap<PathBuf, RetryState>,
}

impl Reconciler {
    pub fn new(policy: RetryPolicy, cap: Option<RetryCap>) -> Self {
        Self {
            policy,
            cap,
            ledger: HashMap::new(),
        }
    }

    /// Failed attempts recorded for `path` since its last success or disappearance.
    pub fn attempts(&self, path: &Path) -> u32 {
        self.ledger.get(path).map_or(0, |state| state.attempts)
    }

    /// Whether backoff allows uploading `path` at `now`. Unknown files are always due.
    pub fn is_due(&self, path: &Path, now: Instant) -> bool {
        self.ledger
            .get(path)
            .map_or(true, |state| now >= state.not_before)
    }

    /// Drop ledger entries for files that were not in the latest complete scan.
    pub fn forget_unseen(&mut self, seen: &HashSet<PathBuf>) {
        self.ledger.retain(|path, _| seen.contains(path));
    }

    pub async fn reconcile(
        &mut self,
        file: &CandidateFile,
        outcome: &TransferOutcome,
    ) -> Reconciliation {
        match outcome {
            TransferOutcome::Success => {
                self.ledger.remove(&file.path);
                self.delete_uploaded(file).await
            }
            TransferOutcome::RemoteRejected {
                status,
                retry_after,
                message,
            } => {
                let attempt = self.record_failure(&file.path, *retry_after);
                warn!(
                    file = %file,
                    outcome = outcome.kind(),
                    status = status.as_u16(),
                    attempt,
                    message = message.as_deref().unwrap_or(""),
                    "Unexpected status: {} for {}, keeping it for the next attempt",
                    status.as_u16(),
                    file
                );
                self.after_failure(file, attempt).await
            }
            TransferOutcome::TransportFailure(cause) => {
                let attempt = self.record_failure(&file.path, None);
                warn!(
                    file = %file,
                    outcome = outcome.kind(),
                    error_kind = cause.kind(),
                    error = %cause,
                    attempt,
                    "failed to upload {}, keeping it for the next attempt",
                    file
                );
                self.after_failure(file, attempt).await
            }
            TransferOutcome::FileVanished => {
                self.ledger.remove(&file.path);
                info!(
                    file = %file,
                    outcome = outcome.kind(),
                    "{} vanished before it could be uploaded",
                    file
                );
                Reconciliation::Vanished
            }
        }
    }

    async fn delete_uploaded(&self, file: &CandidateFile) -> Reconciliation {
        match tokio::fs::remove_file(&file.path).await {
            Ok(()) => {
                info!(file = %file, outcome = "success", "Successfully uploaded: {}", file);
                Reconciliation::Deleted
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                info!(
                    file = %file,
                    outcome = "success",
                    "Successfully uploaded: {} (already removed locally)",
                    file
                );
                Reconciliation::Deleted
            }
            Err(error) => {
                warn!(
                    file = %file,
                    outcome = "cleanup_failed",
                    %error,
                    "uploaded {} but could not delete it, it will be uploaded again",
                    file
                );
                Reconciliation::CleanupFailed(CleanupError::DeleteFailed {
                    path: file.path.clone(),
                    source: error,
                })
            }
        }
    }

    fn record_failure(&mut self, path: &Path, preferred: Option<time::Duration>) -> u32 {
        let state = self.ledger.entry(path.to_path_buf()).or_insert(RetryState {
            attempts: 0,
            not_before: Instant::now(),
        });
        state.attempts = state.attempts.saturating_add(1);
        state.not_before =
            Instant::now() + self.policy.time_until_next_retry(state.attempts, preferred);
        state.attempts
    }

    async fn after_failure(&mut self, file: &CandidateFile, attempt: u32) -> Reconciliation {
        let retry_in = self
            .ledger
            .get(&file.path)
            .map_or(time::Duration::ZERO, |state| {
                state.not_before.saturating_duration_since(Instant::now())
            });

        let Some(cap) = self.cap.as_ref().filter(|cap| attempt >= cap.max_attempts) else {
            return Reconciliation::Retained { attempt, retry_in };
        };

        match quarantine(&file.path, &cap.quarantine_dir).await {
            Ok(destination) => {
                error!(
                    file = %file,
                    outcome = "quarantined",
                    attempt,
                    destination = %destination.display(),
                    "giving up on {} after {} attempts",
                    file,
                    attempt
                );
                self.ledger.remove(&file.path);
                Reconciliation::Quarantined { destination }
            }
            Err(error) => {
                error!(
                    file = %file,
                    outcome = "quarantine_failed",
                    attempt,
                    %error,
                    "failed to move {} into quarantine, keeping it in place",
                    file
                );
                Reconciliation::Retained { attempt, retry_in }
            }
        }
    }
}

/// Attempts at finding a free name in the quarantine directory.
const MAX_QUARANTINE_NAMES: u32 = 100;

/// Move `path` into `quarantine_dir` without ever losing its bytes. Falls back to copy + remove
/// when a rename is not possible (e.g. across filesystems). Never overwrites an earlier file.
async fn quarantine(path: &Path, quarantine_dir: &Path) -> Result<PathBuf, QuarantineError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| QuarantineError::NoFileName(path.to_path_buf()))?;

    tokio::fs::create_dir_all(quarantine_dir)
        .await
        .map_err(|source| QuarantineError::CreateDir {
            path: quarantine_dir.to_path_buf(),
            source,
        })?;

    let destination = reserve_destination(quarantine_dir, file_name)
        .await
        .map_err(|source| QuarantineError::Reserve {
            path: path.to_path_buf(),
            source,
        })?;

    // Only our own empty placeholder is replaced here.
    let Err(rename_error) = tokio::fs::rename(path, &destination).await else {
        return Ok(destination);
    };
    debug!(%rename_error, "rename into quarantine failed, copying instead");

    if let Err(source) = tokio::fs::copy(path, &destination).await {
        discard_placeholder(&destination).await;
        return Err(QuarantineError::Copy {
            path: path.to_path_buf(),
            destination,
            source,
        });
    }

    if let Err(source) = tokio::fs::remove_file(path).await {
        // Keep a single copy: the original stays where it is.
        if let Err(rollback) = tokio::fs::remove_file(&destination).await {
            warn!(
                file = %path.display(),
                error = %source,
                "failed to remove file after copying it into quarantine"
            );
            return Err(QuarantineError::Rollback {
                destination,
                source: rollback,
            });
        }
        return Err(QuarantineError::RemoveOriginal {
            path: path.to_path_buf(),
            destination,
            source,
        });
    }

    Ok(destination)
}

/// Claim a free name in `quarantine_dir` by creating it empty with `create_new`, so a file
/// appearing there concurrently is never replaced. Taken names get a timestamp and counter suffix.
async fn reserve_destination(quarantine_dir: &Path, file_name: &OsStr) -> io::Result<PathBuf> {
    let stamp = chrono::Utc::now().timestamp_millis();

    for n in 0..MAX_QUARANTINE_NAMES {
        let mut name = file_name.to_owned();
        if n > 0 {
            name.push(format!(".{}-{}", stamp, n));
        }
        let candidate = quarantine_dir.join(name);

        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => return Ok(candidate),
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(error) => return Err(error),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "no free name left in quarantine directory",
    ))
}

async fn discard_placeholder(destination: &Path) {
    if let Err(error) = tokio::fs::remove_file(destination).await {
        warn!(destination = %destination.display(), %error, "failed to remove quarantine placeholder");
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use http::StatusCode;
    use tempfile::TempDir;

    use super::*;
    use crate::error::TransportError;

    fn candidate(dir: &TempDir, name: &str) -> CandidateFile {
        let path = dir.path().join(name);
        fs::write(&path, name.as_bytes()).unwrap();
        CandidateFile::new(path)
    }

    fn rejected(code: u16) -> TransferOutcome {
        TransferOutcome::RemoteRejected {
            status: StatusCode::from_u16(code).unwrap(),
            retry_after: None,
            message: None,
        }
    }

    fn transport_failure() -> TransferOutcome {
        TransferOutcome::TransportFailure(TransportError::Read(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "denied",
        )))
    }

    #[tokio::test]
    async fn test_success_deletes_file() {
        let dir = TempDir::new().unwrap();
        let file = candidate(&dir, "a.jpg");
        let mut reconciler = Reconciler::new(RetryPolicy::default(), None);

        let result = reconciler.reconcile(&file, &TransferOutcome::Success).await;

        assert!(matches!(result, Reconciliation::Deleted));
        assert!(!file.path.exists());
    }

    #[tokio::test]
    async fn test_failures_never_delete() {
        let dir = TempDir::new().unwrap();
        let file = candidate(&dir, "c.jpg");
        let mut reconciler = Reconciler::new(RetryPolicy::default(), None);

        for outcome in [rejected(503), rejected(400), transport_failure()] {
            let result = reconciler.reconcile(&file, &outcome).await;
            assert!(matches!(result, Reconciliation::Retained { .. }));
            assert!(file.path.exists());
        }

        assert_eq!(reconciler.attempts(&file.path), 3);
        // No backoff by default: the file is due again right away.
        assert!(reconciler.is_due(&file.path, Instant::now()));
    }

    #[tokio::test]
    async fn test_vanished_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let file = CandidateFile::new(dir.path().join("gone.jpg"));
        let mut reconciler = Reconciler::new(RetryPolicy::default(), None);
        reconciler.reconcile(&file, &rejected(503)).await;

        let result = reconciler
            .reconcile(&file, &TransferOutcome::FileVanished)
            .await;

        assert!(matches!(result, Reconciliation::Vanished));
        assert_eq!(reconciler.attempts(&file.path), 0);
    }

    #[tokio::test]
    async fn test_cleanup_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be removed with remove_file.
        let path = dir.path().join("stuck.jpg");
        fs::create_dir(&path).unwrap();
        let file = CandidateFile::new(&path);
        let mut reconciler = Reconciler::new(RetryPolicy::default(), None);

        let result = reconciler.reconcile(&file, &TransferOutcome::Success).await;

        match result {
            Reconciliation::CleanupFailed(CleanupError::DeleteFailed { path: failed, .. }) => {
                assert_eq!(failed, path)
            }
            other => panic!("expected a cleanup failure, got {:?}", other),
        }
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_success_resets_attempts() {
        let dir = TempDir::new().unwrap();
        let file = candidate(&dir, "a.jpg");
        let mut reconciler = Reconciler::new(RetryPolicy::default(), None);
        reconciler.reconcile(&file, &rejected(500)).await;
        assert_eq!(reconciler.attempts(&file.path), 1);

        reconciler.reconcile(&file, &TransferOutcome::Success).await;

        assert_eq!(reconciler.attempts(&file.path), 0);
    }

    #[tokio::test]
    async fn test_backoff_delays_next_attempt() {
        let dir = TempDir::new().unwrap();
        let file = candidate(&dir, "a.jpg");
        let policy = RetryPolicy::new(2, time::Duration::from_secs(60), None);
        let mut reconciler = Reconciler::new(policy, None);

        let result = reconciler.reconcile(&file, &rejected(503)).await;

        match result {
            Reconciliation::Retained { attempt, retry_in } => {
                assert_eq!(attempt, 1);
                assert!(retry_in > time::Duration::from_secs(50));
            }
            other => panic!("expected the file to be retained, got {:?}", other),
        }
        assert!(!reconciler.is_due(&file.path, Instant::now()));
        assert!(reconciler.is_due(
            &file.path,
            Instant::now() + time::Duration::from_secs(61)
        ));
    }

    #[tokio::test]
    async fn test_retry_after_is_honored_with_backoff() {
        let dir = TempDir::new().unwrap();
        let file = candidate(&dir, "a.jpg");
        let policy = RetryPolicy::new(2, time::Duration::from_secs(1), None);
        let mut reconciler = Reconciler::new(policy, None);
        let outcome = TransferOutcome::RemoteRejected {
            status: StatusCode::TOO_MANY_REQUESTS,
            retry_after: Some(time::Duration::from_secs(120)),
            message: None,
        };

        reconciler.reconcile(&file, &outcome).await;

        assert!(!reconciler.is_due(
            &file.path,
            Instant::now() + time::Duration::from_secs(60)
        ));
    }

    #[tokio::test]
    async fn test_exhausted_file_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let quarantine_dir = TempDir::new().unwrap();
        let file = candidate(&dir, "c.jpg");
        let cap = RetryCap {
            max_attempts: 2,
            quarantine_dir: quarantine_dir.path().join("failed"),
        };
        let mut reconciler = Reconciler::new(RetryPolicy::default(), Some(cap));

        let first = reconciler.reconcile(&file, &rejected(503)).await;
        assert!(matches!(first, Reconciliation::Retained { attempt: 1, .. }));
        assert!(file.path.exists());

        let second = reconciler.reconcile(&file, &transport_failure()).await;
        let destination = match second {
            Reconciliation::Quarantined { destination } => destination,
            other => panic!("expected quarantine, got {:?}", other),
        };

        assert!(!file.path.exists());
        assert_eq!(destination, quarantine_dir.path().join("failed").join("c.jpg"));
        assert_eq!(fs::read(&destination).unwrap(), b"c.jpg");
        assert_eq!(reconciler.attempts(&file.path), 0);
    }

    #[tokio::test]
    async fn test_quarantine_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let quarantine_dir = TempDir::new().unwrap();
        fs::write(quarantine_dir.path().join("c.jpg"), b"older").unwrap();
        let file = candidate(&dir, "c.jpg");
        let cap = RetryCap {
            max_attempts: 1,
            quarantine_dir: quarantine_dir.path().to_path_buf(),
        };
        let mut reconciler = Reconciler::new(RetryPolicy::default(), Some(cap));

        let result = reconciler.reconcile(&file, &rejected(500)).await;

        let Reconciliation::Quarantined { destination } = result else {
            panic!("expected quarantine");
        };
        assert_ne!(destination, quarantine_dir.path().join("c.jpg"));
        assert_eq!(fs::read(quarantine_dir.path().join("c.jpg")).unwrap(), b"older");
        assert_eq!(fs::read(destination).unwrap(), b"c.jpg");
    }

    #[tokio::test]
    async fn test_reserved_names_are_never_reused() {
        let quarantine_dir = TempDir::new().unwrap();
        fs::write(quarantine_dir.path().join("c.jpg"), b"older").unwrap();

        let first = reserve_destination(quarantine_dir.path(), OsStr::new("c.jpg"))
            .await
            .unwrap();
        let second = reserve_destination(quarantine_dir.path(), OsStr::new("c.jpg"))
            .await
            .unwrap();

        assert_ne!(first, second);
        assert_ne!(first, quarantine_dir.path().join("c.jpg"));
        assert_ne!(second, quarantine_dir.path().join("c.jpg"));
        assert!(first.exists());
        assert!(second.exists());
        assert_eq!(fs::read(quarantine_dir.path().join("c.jpg")).unwrap(), b"older");
    }

    #[tokio::test]
    async fn test_quarantine_failure_keeps_file_and_names_the_step() {
        let dir = TempDir::new().unwrap();
        let file = candidate(&dir, "c.jpg");
        // A regular file where the quarantine directory should be.
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();

        let error = quarantine(&file.path, &blocker).await.unwrap_err();
        assert!(
            matches!(&error, QuarantineError::CreateDir { path, .. } if *path == blocker),
            "unexpected error: {:?}",
            error
        );

        let cap = RetryCap {
            max_attempts: 1,
            quarantine_dir: blocker.clone(),
        };
        let mut reconciler = Reconciler::new(RetryPolicy::default(), Some(cap));
        let result = reconciler.reconcile(&file, &rejected(500)).await;

        assert!(matches!(result, Reconciliation::Retained { attempt: 1, .. }));
        assert!(file.path.exists());
    }

    #[tokio::test]
    async fn test_forget_unseen_drops_stale_entries() {
        let dir = TempDir::new().unwrap();
        let kept = candidate(&dir, "kept.jpg");
        let gone = candidate(&dir, "gone.jpg");
        let mut reconciler = Reconciler::new(RetryPolicy::default(), None);
        reconciler.reconcile(&kept, &rejected(503)).await;
        reconciler.reconcile(&gone, &rejected(503)).await;

        reconciler.forget_unseen(&HashSet::from([kept.path.clone()]));

        assert_eq!(reconciler.attempts(&kept.path), 1);
        assert_eq!(reconciler.attempts(&gone.path), 0);
    }
}
