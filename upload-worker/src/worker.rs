use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use upload_common::health::HealthHandle;

use crate::error::ScanError;
use crate::lock::LockOracle;
use crate::reconcile::{Reconciler, Reconciliation};
use crate::scanner::{CandidateFile, DirectoryScanner};
use crate::upload::{TransferOutcome, Uploader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Sleeping until the next cycle.
    Idle,
    /// Processing the files of one directory scan.
    Scanning,
}

/// Counts for one poll cycle, for logs and tests. Not persisted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollCycleResult {
    pub candidates: usize,
    pub uploaded: usize,
    pub skipped_locked: usize,
    pub skipped_unstable: usize,
    pub skipped_backoff: usize,
    pub failed: usize,
    pub vanished: usize,
    pub cleanup_failed: usize,
    pub quarantined: usize,
}

impl PollCycleResult {
    fn record(&mut self, outcome: &TransferOutcome, reconciliation: &Reconciliation) {
        match outcome {
            TransferOutcome::Success => self.uploaded += 1,
            TransferOutcome::RemoteRejected { .. } | TransferOutcome::TransportFailure(_) => {
                self.failed += 1
            }
            TransferOutcome::FileVanished => self.vanished += 1,
        }

        match reconciliation {
            Reconciliation::CleanupFailed(_) => self.cleanup_failed += 1,
            Reconciliation::Quarantined { .. } => self.quarantined += 1,
            Reconciliation::Deleted
            | Reconciliation::Retained { .. }
            | Reconciliation::Vanished => {}
        }
    }

    /// Number of upload attempts made in the cycle.
    pub fn attempted(&self) -> usize {
        self.uploaded + self.failed + self.vanished
    }
}

/// Drives the pipeline: scan, skip locked files, upload the rest one at a time, reconcile, sleep.
pub struct PollScheduler<U> {
    scanner: DirectoryScanner,
    lock: LockOracle,
    uploader: U,
    reconciler: Reconciler,
    /// Idle time between the end of one cycle and the start of the next.
    poll_interval: time::Duration,
    /// Only upload files whose size did not change since the previous cycle.
    stability_check: bool,
    previous_sizes: HashMap<PathBuf, u64>,
    state: SchedulerState,
    /// The liveness check handle, reported at every cycle and after every file.
    liveness: HealthHandle,
}

impl<U: Uploader> PollScheduler<U> {
    pub fn new(
        scanner: DirectoryScanner,
        lock: LockOracle,
        uploader: U,
        reconciler: Reconciler,
        poll_interval: time::Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            scanner,
            lock,
            uploader,
            reconciler,
            poll_interval,
            stability_check: false,
            previous_sizes: HashMap::new(),
            state: SchedulerState::Idle,
            liveness,
        }
    }

    pub fn with_stability_check(mut self, enabled: bool) -> Self {
        self.stability_check = enabled;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Run cycles until `cancel` fires. Cancellation is observed before every cycle, between
    /// files, and while idle; an in-flight upload is bounded by the client's request timeout.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!(
            directory = %self.scanner.directory().display(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "starting poll scheduler"
        );

        while !cancel.is_cancelled() {
            match self.poll_once(&cancel).await {
                Ok(result) if result.candidates > 0 => info!(?result, "poll cycle finished"),
                Ok(result) => debug!(?result, "poll cycle finished"),
                Err(error) => {
                    metrics::counter!("uploader_scan_failures_total").increment(1);
                    error!(%error, "skipping poll cycle");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("poll scheduler stopped");
    }

    /// Run a single cycle: Idle -> Scanning -> Idle.
    pub async fn poll_once(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<PollCycleResult, ScanError> {
        self.state = SchedulerState::Scanning;
        let result = self.process_cycle(cancel).await;
        self.state = SchedulerState::Idle;
        result
    }

    async fn process_cycle(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<PollCycleResult, ScanError> {
        self.liveness.report_healthy().await;
        metrics::counter!("uploader_cycles_total").increment(1);

        let candidates = self.scanner.scan()?;

        let mut result = PollCycleResult::default();
        let mut seen = HashSet::new();
        let mut sizes = HashMap::new();
        let mut completed = true;

        for file in candidates {
            if cancel.is_cancelled() {
                info!("shutdown requested, leaving remaining files for the next run");
                completed = false;
                break;
            }

            result.candidates += 1;
            seen.insert(file.path.clone());
            if let Some(size) = file.size {
                sizes.insert(file.path.clone(), size);
            }

            if self.lock.is_locked(&file.path) {
                info!(file = %file, outcome = "locked", "{} is locked, trying next time", file);
                metrics::counter!("uploader_files_skipped_total", "reason" => "locked").increment(1);
                result.skipped_locked += 1;
                continue;
            }

            if self.stability_check && !self.is_stable(&file) {
                info!(file = %file, outcome = "unstable", size = file.size, "{} is still changing, trying next time", file);
                metrics::counter!("uploader_files_skipped_total", "reason" => "unstable")
                    .increment(1);
                result.skipped_unstable += 1;
                continue;
            }

            if !self.reconciler.is_due(&file.path, Instant::now()) {
                debug!(
                    file = %file,
                    outcome = "backoff",
                    attempts = self.reconciler.attempts(&file.path),
                    "{} is backing off, trying later",
                    file
                );
                metrics::counter!("uploader_files_skipped_total", "reason" => "backoff")
                    .increment(1);
                result.skipped_backoff += 1;
                continue;
            }

            self.process_file(&file, &mut result).await;
            self.liveness.report_healthy().await;
        }

        // An interrupted scan says nothing about the files it never reached.
        if completed {
            self.reconciler.forget_unseen(&seen);
            self.previous_sizes = sizes;
        } else {
            self.previous_sizes.extend(sizes);
        }

        Ok(result)
    }

    async fn process_file(&mut self, file: &CandidateFile, result: &mut PollCycleResult) {
        let started = Instant::now();
        let outcome = self.uploader.upload(file).await;
        let elapsed = started.elapsed().as_secs_f64();

        let labels = [("outcome", outcome.kind())];
        metrics::histogram!("uploader_upload_duration_seconds", &labels).record(elapsed);
        if outcome.is_success() {
            metrics::counter!("uploader_files_uploaded_total").increment(1);
        }
        if let Some(kind) = outcome.failure_kind() {
            metrics::counter!("uploader_upload_failures_total", "kind" => kind).increment(1);
        }

        let reconciliation = self.reconciler.reconcile(file, &outcome).await;
        match &reconciliation {
            Reconciliation::CleanupFailed(_) => {
                metrics::counter!("uploader_cleanup_failures_total").increment(1)
            }
            Reconciliation::Quarantined { .. } => {
                metrics::counter!("uploader_files_quarantined_total").increment(1)
            }
            _ => {}
        }

        result.record(&outcome, &reconciliation);
    }

    fn is_stable(&self, file: &CandidateFile) -> bool {
        match (file.size, self.previous_sizes.get(&file.path)) {
            (Some(size), Some(previous)) => size == *previous,
            _ => false,
        }
    }
}
