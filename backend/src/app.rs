//! Scanner runtime wiring
//!
//! Builds the process-wide trackers, the handler registry, the orchestrator
//! and the scan queue, and exposes the operations callers use.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::ScanConfig;
use crate::db::Database;
use crate::jobs::scanner::{self, RecoveryReport, ScanQueue, ScanRequest};
use crate::services::filesystem::FileSystem;
use crate::services::job_queue::{JobQueueConfig, WorkQueue};
use crate::services::scan::{
    CancelOutcome, ClientNotifier, LibraryScanStampHandler, Scan, ScanCancellationTracker,
    ScanCompositeId, ScanEvent, ScanEventDispatcher, ScanEventHandler, ScanOrchestrator,
    ScanProgressSnapshot, ScanProgressTracker, TrackerCleanupHandler,
};

/// Everything needed to queue, run and observe scans
pub struct ScanRuntime {
    db: Database,
    progress: Arc<ScanProgressTracker>,
    cancellations: Arc<ScanCancellationTracker>,
    events: Arc<ScanEventDispatcher>,
    notifier: ClientNotifier,
    orchestrator: Arc<ScanOrchestrator>,
    queue: ScanQueue,
}

impl ScanRuntime {
    /// Build the runtime with the built-in handlers. Must be called inside a
    /// Tokio runtime since the scan queue spawns its dispatcher.
    pub fn new(db: Database, fs: Arc<dyn FileSystem>, config: &ScanConfig) -> Self {
        Self::with_handlers(db, fs, config, Vec::new())
    }

    /// Like [`ScanRuntime::new`], with extra handlers run before tracker cleanup
    pub fn with_handlers(
        db: Database,
        fs: Arc<dyn FileSystem>,
        config: &ScanConfig,
        extra_handlers: Vec<Arc<dyn ScanEventHandler>>,
    ) -> Self {
        let progress = Arc::new(ScanProgressTracker::new());
        let cancellations = Arc::new(ScanCancellationTracker::new());
        let notifier = ClientNotifier::new(config.event_channel_capacity);

        let mut dispatcher = ScanEventDispatcher::new()
            .with_handler(Arc::new(LibraryScanStampHandler::new(db.clone())));
        for handler in extra_handlers {
            dispatcher.register(handler);
        }
        dispatcher.register(Arc::new(TrackerCleanupHandler::new(
            progress.clone(),
            cancellations.clone(),
        )));
        // Clients hear about an event only after every side effect is applied
        dispatcher.register(Arc::new(notifier.clone()));
        let events = Arc::new(dispatcher);

        let orchestrator = Arc::new(ScanOrchestrator::new(
            db.clone(),
            fs,
            progress.clone(),
            cancellations.clone(),
            events.clone(),
            config,
        ));

        let queue = {
            let db = db.clone();
            let orchestrator = orchestrator.clone();
            WorkQueue::new(
                "scans",
                JobQueueConfig {
                    max_concurrent: config.max_concurrent_scans,
                    queue_capacity: config.queue_capacity,
                },
                move |request: ScanRequest| {
                    scanner::process_scan_request(db.clone(), orchestrator.clone(), request)
                },
            )
        };

        Self {
            db,
            progress,
            cancellations,
            events,
            notifier,
            orchestrator,
            queue,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Create a Queued scan for the library and submit it to the scan queue
    pub async fn enqueue_library_scan(
        &self,
        library_id: Uuid,
        user_id: Uuid,
        download_metadata: bool,
    ) -> Result<Scan> {
        scanner::enqueue_library_scan(
            &self.db,
            &self.events,
            &self.queue,
            library_id,
            user_id,
            download_metadata,
        )
        .await
    }

    pub async fn enqueue_auto_scans(&self) -> Result<usize> {
        scanner::enqueue_auto_scans(&self.db, &self.events, &self.queue).await
    }

    pub async fn recover_interrupted_scans(&self) -> Result<RecoveryReport> {
        scanner::recover_interrupted_scans(&self.db, &self.events, &self.queue).await
    }

    /// Cancel a scan by id, whatever its current state
    pub async fn cancel_scan(&self, scan_id: Uuid) -> Result<CancelOutcome> {
        let scan = self
            .db
            .scans()
            .get(scan_id)
            .await?
            .with_context(|| format!("Scan {} not found", scan_id))?;
        Ok(self.orchestrator.cancel_scan(&scan).await?)
    }

    pub fn progress(&self, id: &ScanCompositeId) -> Option<ScanProgressSnapshot> {
        self.progress.snapshot(id)
    }

    pub fn is_cancellation_requested(&self, id: &ScanCompositeId) -> bool {
        self.cancellations.is_cancellation_requested(id)
    }

    /// Live scan events for connected clients
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.notifier.subscribe()
    }
}
