//! Library scanning
//!
//! A scan walks every content location of a library, fingerprints each file
//! and records one result row per path. See [`orchestrator`] for how walkers
//! are combined into the scan's terminal state.

pub mod aggregate;
pub mod cancellation;
pub mod events;
pub mod fingerprint;
pub mod handlers;
pub mod orchestrator;
pub mod progress;
pub mod walker;

pub use aggregate::{
    FailOutcome, Scan, ScanCompositeId, ScanStatus, Transition, TransitionError,
};
pub use cancellation::{CancellationHandle, ScanCancellationTracker};
pub use events::{ScanEvent, ScanEventDispatcher, ScanEventHandler, ScanSummary};
pub use fingerprint::{ContentFingerprint, FingerprintHasher, fingerprint_reader};
pub use handlers::{ClientNotifier, LibraryScanStampHandler, TrackerCleanupHandler};
pub use orchestrator::{CancelOutcome, ScanOrchestrator, ScanOutcome};
pub use progress::{JobProgress, ScanProgressSnapshot, ScanProgressTracker};
pub use walker::{
    ScanFilter, ScanJob, ScanJobWalker, SkippedFile, WalkOutcome, WalkStats, WalkerSettings,
};
