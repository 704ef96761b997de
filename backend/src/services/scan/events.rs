//! Scan lifecycle events and the handler registry
//!
//! Handlers are awaited one after another in registration order. A failing
//! handler is logged and does not stop the ones after it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::aggregate::ScanCompositeId;
use super::progress::ScanProgressSnapshot;

/// Totals reported with a finished scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub files: u64,
    pub bytes: u64,
    /// Groups of two or more paths with identical content
    pub duplicate_groups: usize,
    /// Files skipped with a warning
    pub skipped_files: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ScanEvent {
    Queued {
        composite_id: ScanCompositeId,
        library_id: Uuid,
    },
    Started {
        composite_id: ScanCompositeId,
        library_id: Uuid,
        total_jobs: usize,
    },
    Finished {
        composite_id: ScanCompositeId,
        library_id: Uuid,
        summary: ScanSummary,
        /// Whether metadata enrichment was requested for this scan
        download_metadata: bool,
    },
    Failed {
        composite_id: ScanCompositeId,
        library_id: Uuid,
        reason: String,
    },
    Cancelled {
        composite_id: ScanCompositeId,
        library_id: Uuid,
    },
    ProgressChanged {
        snapshot: ScanProgressSnapshot,
    },
    JobProgressChanged {
        composite_id: ScanCompositeId,
        job_index: usize,
        location: String,
        items_processed: u64,
    },
}

impl ScanEvent {
    pub fn composite_id(&self) -> ScanCompositeId {
        match self {
            ScanEvent::Queued { composite_id, .. }
            | ScanEvent::Started { composite_id, .. }
            | ScanEvent::Finished { composite_id, .. }
            | ScanEvent::Failed { composite_id, .. }
            | ScanEvent::Cancelled { composite_id, .. }
            | ScanEvent::JobProgressChanged { composite_id, .. } => *composite_id,
            ScanEvent::ProgressChanged { snapshot } => snapshot.composite_id,
        }
    }

    /// Stable event name for logs and clients
    pub fn kind(&self) -> &'static str {
        match self {
            ScanEvent::Queued { .. } => "ScanQueued",
            ScanEvent::Started { .. } => "ScanStarted",
            ScanEvent::Finished { .. } => "ScanFinished",
            ScanEvent::Failed { .. } => "ScanFailed",
            ScanEvent::Cancelled { .. } => "ScanCancelled",
            ScanEvent::ProgressChanged { .. } => "ScanProgressChanged",
            ScanEvent::JobProgressChanged { .. } => "ScanJobProgressChanged",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanEvent::Finished { .. } | ScanEvent::Failed { .. } | ScanEvent::Cancelled { .. }
        )
    }
}

/// Reacts to scan events
#[async_trait]
pub trait ScanEventHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &ScanEvent) -> anyhow::Result<()>;
}

/// Ordered handler registry
#[derive(Default)]
pub struct ScanEventDispatcher {
    handlers: Vec<Arc<dyn ScanEventHandler>>,
}

impl std::fmt::Debug for ScanEventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanEventDispatcher")
            .field(
                "handlers",
                &self.handlers.iter().map(|h| h.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ScanEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ScanEventHandler>) {
        self.handlers.push(handler);
    }

    pub fn with_handler(mut self, handler: Arc<dyn ScanEventHandler>) -> Self {
        self.register(handler);
        self
    }

    pub async fn dispatch(&self, event: &ScanEvent) {
        let composite_id = event.composite_id();
        debug!(
            event = event.kind(),
            scan_id = %composite_id.scan_id,
            user_id = %composite_id.user_id,
            "Dispatching scan event"
        );

        for handler in &self.handlers {
            if let Err(e) = handler.handle(event).await {
                warn!(
                    handler = handler.name(),
                    event = event.kind(),
                    scan_id = %composite_id.scan_id,
                    error = %e,
                    "Scan event handler failed"
                );
            }
        }
    }
}
