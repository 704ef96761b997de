//! Typed errors for the scanning subsystem
//!
//! Application edges (config, jobs, main) use `anyhow`; everything the scanner
//! needs to branch on is a variant here.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::services::scan::aggregate::{ScanStatus, TransitionError};

/// Errors raised by the persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// A result row for this path already exists in the scan
    #[error("scan result already recorded for {path} in scan {scan_id}")]
    Conflict { scan_id: Uuid, path: String },

    /// Input rejected before reaching the database
    #[error("invalid scan result: {0}")]
    Validation(String),

    /// The scan row does not exist
    #[error("scan {scan_id} not found")]
    ScanNotFound { scan_id: Uuid },

    /// The persisted status differs from the expected prior status
    #[error("scan {scan_id} is {actual}, expected {expected}")]
    StatusConflict {
        scan_id: Uuid,
        expected: ScanStatus,
        actual: ScanStatus,
    },

    /// A stored value could not be decoded
    #[error("corrupt row: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Maps a raw insert error, turning unique violations into [`StoreError::Conflict`]
    pub(crate) fn from_insert(err: sqlx::Error, scan_id: Uuid, path: &str) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict {
                scan_id,
                path: path.to_string(),
            },
            _ => StoreError::Database(err),
        }
    }
}

/// Errors surfaced by the scan orchestrator and scan jobs
#[derive(Error, Debug)]
pub enum ScanError {
    /// Malformed request (wrong library, bad input)
    #[error("validation failed: {0}")]
    Validation(String),

    /// Illegal lifecycle transition
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A scan aggregate that must exist could not be loaded or updated.
    /// Fatal: callers alert instead of retrying.
    #[error("scan {scan_id} is missing or unwritable: {reason}")]
    EventualConsistency { scan_id: Uuid, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ScanError {
    pub fn eventual_consistency(scan_id: Uuid, reason: impl Into<String>) -> Self {
        ScanError::EventualConsistency {
            scan_id,
            reason: reason.into(),
        }
    }

    /// True for errors that must be escalated rather than dropped
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScanError::EventualConsistency { .. })
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
