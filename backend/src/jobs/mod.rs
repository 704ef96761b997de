//! Background job scheduling and workers

pub mod scanner;

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::app::ScanRuntime;

/// Initialize and start the job scheduler
pub async fn start_scheduler(
    runtime: Arc<ScanRuntime>,
    auto_scan_cron: &str,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Auto-scan libraries that have no scan in flight
    let scan_runtime = runtime.clone();
    let scanner_job = Job::new_async(auto_scan_cron, move |_uuid, _l| {
        let runtime = scan_runtime.clone();
        Box::pin(async move {
            info!("Running library auto-scan");
            match runtime.enqueue_auto_scans().await {
                Ok(queued) => info!(queued, "Auto-scan enqueued libraries"),
                Err(e) => tracing::error!("Auto-scan error: {}", e),
            }
        })
    })?;
    scheduler.add(scanner_job).await?;

    scheduler.start().await?;

    info!(cron = %auto_scan_cron, "Job scheduler started");
    Ok(scheduler)
}
