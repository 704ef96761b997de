//! Scan aggregate and its lifecycle state machine
//!
//! ```text
//! Queued ──start──▶ Started ──finish──▶ Finished
//!   │                  ├─────fail────▶ Failed
//!   └──────cancel──────┴────cancel───▶ Cancelled
//! ```
//!
//! The only mutators are [`Scan::start`], [`Scan::finish`], [`Scan::fail`] and
//! [`Scan::cancel`]. Expected races come back as values, never panics.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle status of a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Queued,
    Started,
    Finished,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Queued => "queued",
            ScanStatus::Started => "started",
            ScanStatus::Finished => "finished",
            ScanStatus::Failed => "failed",
            ScanStatus::Cancelled => "cancelled",
        }
    }

    /// Finished, Failed and Cancelled have no outgoing transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Finished | ScanStatus::Failed | ScanStatus::Cancelled
        )
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ScanStatus::Queued),
            "started" => Ok(ScanStatus::Started),
            "finished" => Ok(ScanStatus::Finished),
            "failed" => Ok(ScanStatus::Failed),
            "cancelled" => Ok(ScanStatus::Cancelled),
            other => Err(format!("unknown scan status '{}'", other)),
        }
    }
}

/// Key for the in-memory trackers: (scan id, initiating user id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanCompositeId {
    pub scan_id: Uuid,
    pub user_id: Uuid,
}

impl ScanCompositeId {
    pub fn new(scan_id: Uuid, user_id: Uuid) -> Self {
        Self { scan_id, user_id }
    }
}

impl fmt::Display for ScanCompositeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scan_id, self.user_id)
    }
}

/// Rejected lifecycle transition
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid scan transition from {from} to {to}")]
pub struct TransitionError {
    pub from: ScanStatus,
    pub to: ScanStatus,
}

/// A transition that was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ScanStatus,
    pub to: ScanStatus,
}

/// Result of [`Scan::fail`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Started → Failed was applied
    Failed(Transition),
    /// The scan had already reached this terminal state; nothing changed
    AlreadyTerminal(ScanStatus),
}

/// The scan aggregate, the unit of durable persistence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub id: Uuid,
    pub library_id: Uuid,
    pub user_id: Uuid,
    pub status: ScanStatus,
    pub error: Option<String>,
    /// Metadata enrichment was requested when the scan was queued
    pub download_metadata: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Scan {
    /// A new scan in the Queued state
    pub fn new(library_id: Uuid, user_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            library_id,
            user_id,
            status: ScanStatus::Queued,
            error: None,
            download_metadata: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_download_metadata(mut self, download_metadata: bool) -> Self {
        self.download_metadata = download_metadata;
        self
    }

    pub fn composite_id(&self) -> ScanCompositeId {
        ScanCompositeId::new(self.id, self.user_id)
    }

    pub fn start(&mut self) -> Result<Transition, TransitionError> {
        let transition = self.transition(ScanStatus::Started, &[ScanStatus::Queued])?;
        self.started_at = Some(self.updated_at);
        Ok(transition)
    }

    pub fn finish(&mut self) -> Result<Transition, TransitionError> {
        let transition = self.transition(ScanStatus::Finished, &[ScanStatus::Started])?;
        self.finished_at = Some(self.updated_at);
        Ok(transition)
    }

    /// Started → Failed. Concurrent jobs may race to report failure, so a
    /// terminal scan reports [`FailOutcome::AlreadyTerminal`] instead of an error.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<FailOutcome, TransitionError> {
        if self.status.is_terminal() {
            return Ok(FailOutcome::AlreadyTerminal(self.status));
        }
        let transition = self.transition(ScanStatus::Failed, &[ScanStatus::Started])?;
        self.error = Some(reason.into());
        self.finished_at = Some(self.updated_at);
        Ok(FailOutcome::Failed(transition))
    }

    pub fn cancel(&mut self) -> Result<Transition, TransitionError> {
        let transition = self.transition(
            ScanStatus::Cancelled,
            &[ScanStatus::Queued, ScanStatus::Started],
        )?;
        self.finished_at = Some(self.updated_at);
        Ok(transition)
    }

    fn transition(
        &mut self,
        to: ScanStatus,
        allowed_from: &[ScanStatus],
    ) -> Result<Transition, TransitionError> {
        let from = self.status;
        if !allowed_from.contains(&from) {
            return Err(TransitionError { from, to });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(Transition { from, to })
    }
}
