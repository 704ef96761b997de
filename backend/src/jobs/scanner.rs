//! Library scanner jobs
//!
//! Enqueueing creates the Queued scan row and hands a request to the scan
//! queue; the queue worker loads the aggregate and its library and runs the
//! orchestrator. Startup recovery settles scans a previous process left behind.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::error::ScanError;
use crate::services::job_queue::WorkQueue;
use crate::services::scan::{
    FailOutcome, Scan, ScanEvent, ScanEventDispatcher, ScanOrchestrator, ScanOutcome, ScanStatus,
};

/// Reason stored on scans found Started at startup
pub const INTERRUPTED_REASON: &str = "interrupted by restart";

/// Payload handed to the scan queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRequest {
    pub scan_id: Uuid,
    pub download_metadata: bool,
}

pub type ScanQueue = WorkQueue<ScanRequest>;

/// What startup recovery did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub failed: usize,
    pub requeued: usize,
}

/// Create a Queued scan for a library and submit it
pub async fn enqueue_library_scan(
    db: &Database,
    events: &ScanEventDispatcher,
    queue: &ScanQueue,
    library_id: Uuid,
    user_id: Uuid,
    download_metadata: bool,
) -> Result<Scan> {
    let library = db
        .libraries()
        .get_by_id(library_id)
        .await?
        .with_context(|| format!("Library {} not found", library_id))?;

    let scan = Scan::new(library.id, user_id).with_download_metadata(download_metadata);
    db.scans().upsert(&scan).await?;

    info!(
        scan_id = %scan.id,
        user_id = %user_id,
        library_id = %library.id,
        library = %library.name,
        "Scan queued"
    );
    events
        .dispatch(&ScanEvent::Queued {
            composite_id: scan.composite_id(),
            library_id: library.id,
        })
        .await;

    queue
        .submit(ScanRequest {
            scan_id: scan.id,
            download_metadata,
        })
        .await?;
    Ok(scan)
}

/// Load the scan and its library, then run it to a terminal state
pub async fn run_scan_job(
    db: &Database,
    orchestrator: &ScanOrchestrator,
    request: ScanRequest,
) -> crate::error::Result<ScanOutcome> {
    let scan = db
        .scans()
        .get(request.scan_id)
        .await?
        .ok_or_else(|| ScanError::eventual_consistency(request.scan_id, "queued scan not found"))?;

    if scan.status != ScanStatus::Queued {
        info!(scan_id = %scan.id, status = %scan.status, "Scan no longer queued, skipping");
        return Ok(match scan.status {
            ScanStatus::Cancelled => ScanOutcome::Cancelled,
            ScanStatus::Failed => ScanOutcome::Failed {
                reason: scan.error.unwrap_or_default(),
            },
            _ => return Err(ScanError::Validation(format!("scan {} is {}", scan.id, scan.status))),
        });
    }

    let library = db
        .libraries()
        .get_by_id(scan.library_id)
        .await
        .map_err(|e| ScanError::eventual_consistency(scan.id, format!("library lookup failed: {}", e)))?
        .ok_or_else(|| ScanError::eventual_consistency(scan.id, "library of queued scan not found"))?;

    orchestrator
        .start_scan(scan, &library, request.download_metadata)
        .await
}

/// Queue worker entry point. Errors end here: fatal ones are logged at error
/// level for alerting and never retried.
pub async fn process_scan_request(
    db: Database,
    orchestrator: Arc<ScanOrchestrator>,
    request: ScanRequest,
) {
    match run_scan_job(&db, &orchestrator, request).await {
        Ok(outcome) => {
            info!(scan_id = %request.scan_id, status = %outcome.status(), "Scan job done");
        }
        Err(e) if e.is_fatal() => {
            error!(scan_id = %request.scan_id, error = %e, "Scan job hit an inconsistent state");
        }
        Err(e) => {
            warn!(scan_id = %request.scan_id, error = %e, "Scan job failed");
        }
    }
}

/// Fail scans left Started by a previous process and resubmit Queued ones
pub async fn recover_interrupted_scans(
    db: &Database,
    events: &ScanEventDispatcher,
    queue: &ScanQueue,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for mut scan in db.scans().list_by_status(ScanStatus::Started).await? {
        match scan.fail(INTERRUPTED_REASON)? {
            FailOutcome::Failed(_) => {}
            FailOutcome::AlreadyTerminal(_) => continue,
        }
        if let Err(e) = db.scans().update_status(&scan, ScanStatus::Started).await {
            warn!(scan_id = %scan.id, error = %e, "Could not fail interrupted scan");
            continue;
        }
        warn!(scan_id = %scan.id, library_id = %scan.library_id, "Interrupted scan marked failed");
        events
            .dispatch(&ScanEvent::Failed {
                composite_id: scan.composite_id(),
                library_id: scan.library_id,
                reason: INTERRUPTED_REASON.to_string(),
            })
            .await;
        report.failed += 1;
    }

    for scan in db.scans().list_by_status(ScanStatus::Queued).await? {
        queue
            .submit(ScanRequest {
                scan_id: scan.id,
                download_metadata: scan.download_metadata,
            })
            .await?;
        report.requeued += 1;
    }

    if report.failed > 0 || report.requeued > 0 {
        info!(
            failed = report.failed,
            requeued = report.requeued,
            "Recovered scans from previous run"
        );
    }
    Ok(report)
}

/// Queue a scan for every auto-scan library that has no active scan.
/// Returns the number of scans queued.
pub async fn enqueue_auto_scans(
    db: &Database,
    events: &ScanEventDispatcher,
    queue: &ScanQueue,
) -> Result<usize> {
    let mut queued = 0;
    for library in db.libraries().list_auto_scan().await? {
        if db.scans().find_active_for_library(library.id).await?.is_some() {
            info!(library_id = %library.id, "Scan already active, skipping");
            continue;
        }
        enqueue_library_scan(db, events, queue, library.id, library.user_id, false).await?;
        queued += 1;
    }
    Ok(queued)
}
