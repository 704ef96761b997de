//! Built-in scan event handlers

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::cancellation::ScanCancellationTracker;
use super::events::{ScanEvent, ScanEventHandler};
use super::progress::ScanProgressTracker;
use crate::db::Database;

/// Fans scan events out to connected clients
#[derive(Debug, Clone)]
pub struct ClientNotifier {
    tx: broadcast::Sender<ScanEvent>,
}

impl ClientNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl ScanEventHandler for ClientNotifier {
    fn name(&self) -> &'static str {
        "client_notifier"
    }

    async fn handle(&self, event: &ScanEvent) -> anyhow::Result<()> {
        // No subscribers is not an error
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// Drops in-memory tracker entries once a scan is terminal
#[derive(Debug, Clone)]
pub struct TrackerCleanupHandler {
    progress: Arc<ScanProgressTracker>,
    cancellations: Arc<ScanCancellationTracker>,
}

impl TrackerCleanupHandler {
    pub fn new(
        progress: Arc<ScanProgressTracker>,
        cancellations: Arc<ScanCancellationTracker>,
    ) -> Self {
        Self {
            progress,
            cancellations,
        }
    }
}

#[async_trait]
impl ScanEventHandler for TrackerCleanupHandler {
    fn name(&self) -> &'static str {
        "tracker_cleanup"
    }

    async fn handle(&self, event: &ScanEvent) -> anyhow::Result<()> {
        if !event.is_terminal() {
            return Ok(());
        }
        let id = event.composite_id();
        let progress_removed = self.progress.remove(&id);
        let token_removed = self.cancellations.remove(&id);
        debug!(
            scan_id = %id.scan_id,
            progress_removed,
            token_removed,
            "Released scan trackers"
        );
        Ok(())
    }
}

/// Stamps the library's last-scanned time when a scan finishes
#[derive(Debug, Clone)]
pub struct LibraryScanStampHandler {
    db: Database,
}

impl LibraryScanStampHandler {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ScanEventHandler for LibraryScanStampHandler {
    fn name(&self) -> &'static str {
        "library_scan_stamp"
    }

    async fn handle(&self, event: &ScanEvent) -> anyhow::Result<()> {
        let ScanEvent::Finished {
            library_id,
            summary,
            ..
        } = event
        else {
            return Ok(());
        };

        self.db
            .libraries()
            .update_last_scanned(*library_id)
            .await
            .with_context(|| format!("Failed to stamp library {}", library_id))?;

        info!(
            library_id = %library_id,
            files = summary.files,
            bytes = summary.bytes,
            "Library scan recorded"
        );
        Ok(())
    }
}
