//! Scan orchestrator
//!
//! Runs one walker per content location of a library, bounded system-wide by a
//! walker semaphore, and folds the walker outcomes into the scan's terminal
//! state. Cancellation wins over failure, failure wins over completion.
//!
//! The scan aggregate is owned by the task running [`ScanOrchestrator::start_scan`]
//! for the whole run; persisted transitions are compare-and-set on the prior
//! status, so a concurrent writer surfaces as a typed conflict.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::aggregate::{FailOutcome, Scan, ScanCompositeId, ScanStatus};
use super::cancellation::{CancellationHandle, ScanCancellationTracker};
use super::events::{ScanEvent, ScanEventDispatcher, ScanSummary};
use super::progress::ScanProgressTracker;
use super::walker::{ScanFilter, ScanJob, ScanJobWalker, WalkOutcome, WalkStats, WalkerSettings};
use crate::config::ScanConfig;
use crate::db::{Database, LibraryRecord};
use crate::error::{Result, ScanError, StoreError};
use crate::services::filesystem::FileSystem;

/// Terminal result of a scan run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Finished(ScanSummary),
    Failed { reason: String },
    Cancelled,
}

impl ScanOutcome {
    pub fn status(&self) -> ScanStatus {
        match self {
            ScanOutcome::Finished(_) => ScanStatus::Finished,
            ScanOutcome::Failed { .. } => ScanStatus::Failed,
            ScanOutcome::Cancelled => ScanStatus::Cancelled,
        }
    }
}

/// Result of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The running walkers were signalled
    Signalled,
    /// The scan had not been picked up and is now Cancelled
    CancelledWhileQueued,
    /// Nothing to do, the scan already ended
    AlreadyTerminal(ScanStatus),
    /// The scan is Started but not running in this process
    NotRunning,
}

pub struct ScanOrchestrator {
    db: Database,
    progress: Arc<ScanProgressTracker>,
    cancellations: Arc<ScanCancellationTracker>,
    events: Arc<ScanEventDispatcher>,
    walker: Arc<ScanJobWalker>,
    walker_permits: Arc<Semaphore>,
}

impl ScanOrchestrator {
    pub fn new(
        db: Database,
        fs: Arc<dyn FileSystem>,
        progress: Arc<ScanProgressTracker>,
        cancellations: Arc<ScanCancellationTracker>,
        events: Arc<ScanEventDispatcher>,
        config: &ScanConfig,
    ) -> Self {
        let walker = ScanJobWalker::new(
            fs,
            db.scan_results(),
            progress.clone(),
            events.clone(),
            WalkerSettings {
                batch_size: config.result_batch_size,
                progress_interval: config.progress_interval,
                read_buffer_bytes: config.read_buffer_bytes,
            },
        );
        Self {
            db,
            progress,
            cancellations,
            events,
            walker: Arc::new(walker),
            walker_permits: Arc::new(Semaphore::new(config.max_concurrent_walkers.max(1))),
        }
    }

    /// Run a Queued scan to a terminal state
    pub async fn start_scan(
        &self,
        mut scan: Scan,
        library: &LibraryRecord,
        download_metadata: bool,
    ) -> Result<ScanOutcome> {
        if scan.library_id != library.id {
            return Err(ScanError::Validation(format!(
                "scan {} belongs to library {}, not {}",
                scan.id, scan.library_id, library.id
            )));
        }

        let composite_id = scan.composite_id();
        let expected = scan.status;
        scan.start()?;

        // Register before persisting Started so a cancel request never falls between
        let cancel = self.cancellations.register(composite_id);

        if let Err(e) = self.db.scans().update_status(&scan, expected).await {
            // Another run of the same scan may hold this entry too
            self.cancellations.release(&composite_id);
            return match e {
                StoreError::StatusConflict {
                    actual: ScanStatus::Cancelled,
                    ..
                } => {
                    info!(scan_id = %scan.id, "Scan cancelled before it started");
                    Ok(ScanOutcome::Cancelled)
                }
                StoreError::ScanNotFound { scan_id } => Err(ScanError::eventual_consistency(
                    scan_id,
                    "scan row missing when starting",
                )),
                other => Err(other.into()),
            };
        }

        let locations: Vec<PathBuf> = library.paths.iter().map(PathBuf::from).collect();
        self.progress.start_tracking(composite_id, locations.len());

        info!(
            scan_id = %scan.id,
            user_id = %scan.user_id,
            library_id = %library.id,
            jobs = locations.len(),
            "Scan started"
        );
        self.events
            .dispatch(&ScanEvent::Started {
                composite_id,
                library_id: library.id,
                total_jobs: locations.len(),
            })
            .await;

        let filter = ScanFilter::for_library(library);
        let outcomes = self
            .run_walkers(&scan, locations, filter, cancel)
            .await;

        let outcome = self.settle(&scan, &outcomes).await;
        self.finalize(scan, outcome, download_metadata).await
    }

    async fn run_walkers(
        &self,
        scan: &Scan,
        locations: Vec<PathBuf>,
        filter: ScanFilter,
        cancel: CancellationHandle,
    ) -> Vec<WalkOutcome> {
        let mut set = JoinSet::new();
        for (job_index, location) in locations.into_iter().enumerate() {
            let job = ScanJob {
                job_index,
                location,
                composite_id: scan.composite_id(),
                library_id: scan.library_id,
                filter: filter.clone(),
            };
            let walker = self.walker.clone();
            let permits = self.walker_permits.clone();
            let cancel = cancel.clone();

            set.spawn(async move {
                let permit = tokio::select! {
                    permit = permits.acquire_owned() => permit,
                    _ = cancel.cancelled() => {
                        return (job.job_index, WalkOutcome::Cancelled(WalkStats::default()));
                    }
                };
                let outcome = match permit {
                    Ok(_permit) => walker.run(&job, &cancel).await,
                    Err(_) => WalkOutcome::Failed {
                        stats: WalkStats::default(),
                        error: ScanError::Io {
                            path: job.location.clone(),
                            source: std::io::Error::other("walker pool closed"),
                        },
                    },
                };
                (job.job_index, outcome)
            });
        }

        let mut outcomes: Vec<(usize, WalkOutcome)> = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(scan_id = %scan.id, error = %e, "Walker task panicked");
                    outcomes.push((
                        usize::MAX,
                        WalkOutcome::Failed {
                            stats: WalkStats::default(),
                            error: ScanError::Io {
                                path: PathBuf::new(),
                                source: std::io::Error::other(format!("walker task failed: {}", e)),
                            },
                        },
                    ));
                }
            }
        }
        outcomes.sort_by_key(|(index, _)| *index);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }

    /// Fold walker outcomes into the scan outcome
    async fn settle(&self, scan: &Scan, outcomes: &[WalkOutcome]) -> ScanOutcome {
        if outcomes
            .iter()
            .any(|o| matches!(o, WalkOutcome::Cancelled(_)))
        {
            return ScanOutcome::Cancelled;
        }

        let failures: Vec<String> = outcomes
            .iter()
            .filter_map(|o| match o {
                WalkOutcome::Failed { error, .. } => Some(error.to_string()),
                _ => None,
            })
            .collect();
        if !failures.is_empty() {
            return ScanOutcome::Failed {
                reason: failures.join("; "),
            };
        }

        let skipped_files = outcomes.iter().map(|o| o.stats().skipped.len()).sum();
        match self.summarize(scan, skipped_files).await {
            Ok(summary) => ScanOutcome::Finished(summary),
            Err(e) => ScanOutcome::Failed {
                reason: format!("failed to summarize results: {}", e),
            },
        }
    }

    async fn summarize(&self, scan: &Scan, skipped_files: usize) -> Result<ScanSummary> {
        let results = self.db.scan_results();
        let totals = results.totals(scan.id).await?;
        let duplicates = results.find_duplicates(scan.id).await?;
        Ok(ScanSummary {
            files: totals.files,
            bytes: totals.bytes,
            duplicate_groups: duplicates.len(),
            skipped_files,
        })
    }

    /// Apply the terminal transition, persist it and emit the terminal event
    async fn finalize(
        &self,
        mut scan: Scan,
        outcome: ScanOutcome,
        download_metadata: bool,
    ) -> Result<ScanOutcome> {
        let composite_id = scan.composite_id();
        let expected = scan.status;

        let applied = match &outcome {
            ScanOutcome::Finished(_) => scan.finish().map(|_| ()),
            ScanOutcome::Cancelled => scan.cancel().map(|_| ()),
            ScanOutcome::Failed { reason } => match scan.fail(reason.clone()) {
                Ok(FailOutcome::Failed(_)) => Ok(()),
                Ok(FailOutcome::AlreadyTerminal(status)) => {
                    warn!(scan_id = %scan.id, status = %status, "Scan already terminal");
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };
        if let Err(e) = applied {
            self.release(&composite_id);
            return Err(e.into());
        }

        self.progress.mark_scan_complete(&composite_id);

        if let Err(e) = self.db.scans().update_status(&scan, expected).await {
            self.release(&composite_id);
            return Err(match e {
                StoreError::ScanNotFound { scan_id } => {
                    ScanError::eventual_consistency(scan_id, "scan row missing when finalizing")
                }
                other => other.into(),
            });
        }

        let event = match &outcome {
            ScanOutcome::Finished(summary) => {
                info!(
                    scan_id = %scan.id,
                    files = summary.files,
                    bytes = summary.bytes,
                    duplicate_groups = summary.duplicate_groups,
                    skipped = summary.skipped_files,
                    "Scan finished"
                );
                ScanEvent::Finished {
                    composite_id,
                    library_id: scan.library_id,
                    summary: *summary,
                    download_metadata,
                }
            }
            ScanOutcome::Failed { reason } => {
                warn!(scan_id = %scan.id, reason = %reason, "Scan failed");
                ScanEvent::Failed {
                    composite_id,
                    library_id: scan.library_id,
                    reason: reason.clone(),
                }
            }
            ScanOutcome::Cancelled => {
                info!(scan_id = %scan.id, "Scan cancelled");
                ScanEvent::Cancelled {
                    composite_id,
                    library_id: scan.library_id,
                }
            }
        };
        self.events.dispatch(&event).await;

        Ok(outcome)
    }

    fn release(&self, composite_id: &ScanCompositeId) {
        self.progress.remove(composite_id);
        self.cancellations.remove(composite_id);
    }

    /// Request cancellation. Running scans are signalled and end on their own;
    /// a Queued scan is moved to Cancelled directly.
    pub async fn cancel_scan(&self, scan: &Scan) -> Result<CancelOutcome> {
        let composite_id = scan.composite_id();
        if self.cancellations.request_cancellation(&composite_id) {
            info!(scan_id = %scan.id, "Cancellation requested");
            return Ok(CancelOutcome::Signalled);
        }

        match scan.status {
            ScanStatus::Queued => {}
            ScanStatus::Started => return Ok(CancelOutcome::NotRunning),
            status => return Ok(CancelOutcome::AlreadyTerminal(status)),
        }

        let mut cancelled = scan.clone();
        cancelled.cancel()?;
        match self
            .db
            .scans()
            .update_status(&cancelled, ScanStatus::Queued)
            .await
        {
            Ok(()) => {}
            Err(StoreError::StatusConflict { actual, .. }) => {
                // Picked up in the meantime
                if actual == ScanStatus::Started
                    && self.cancellations.request_cancellation(&composite_id)
                {
                    return Ok(CancelOutcome::Signalled);
                }
                return Ok(if actual.is_terminal() {
                    CancelOutcome::AlreadyTerminal(actual)
                } else {
                    CancelOutcome::NotRunning
                });
            }
            Err(StoreError::ScanNotFound { scan_id }) => {
                return Err(ScanError::eventual_consistency(
                    scan_id,
                    "scan row missing when cancelling",
                ));
            }
            Err(e) => return Err(e.into()),
        }

        info!(scan_id = %scan.id, "Queued scan cancelled");
        self.events
            .dispatch(&ScanEvent::Cancelled {
                composite_id,
                library_id: scan.library_id,
            })
            .await;
        Ok(CancelOutcome::CancelledWhileQueued)
    }
}
