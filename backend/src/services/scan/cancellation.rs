//! Cooperative cancellation for running scans
//!
//! Every walker of a scan shares one [`CancellationHandle`]. Requests are
//! idempotent and walkers poll the handle at least once per file, so a request
//! is observed within one polling interval. Entries are added at scan start and
//! removed when the scan reaches a terminal state.

use dashmap::DashMap;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::aggregate::ScanCompositeId;

/// Shared cancellation signal for the walkers of one scan
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    token: CancellationToken,
}

impl CancellationHandle {
    fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// A handle that is never cancelled unless [`CancellationHandle::cancel`] is called
    pub fn detached() -> Self {
        Self::new(CancellationToken::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Resolves once cancellation is requested
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

/// One registered scan and the number of callers holding it
#[derive(Debug)]
struct Registration {
    token: CancellationToken,
    holders: usize,
}

/// Process-wide map from scan composite id to its cancellation token
#[derive(Debug, Default)]
pub struct ScanCancellationTracker {
    tokens: DashMap<ScanCompositeId, Registration>,
}

impl ScanCancellationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scan. Registering twice returns a handle to the same token
    /// and counts one more holder.
    pub fn register(&self, id: ScanCompositeId) -> CancellationHandle {
        let mut entry = self.tokens.entry(id).or_insert_with(|| Registration {
            token: CancellationToken::new(),
            holders: 0,
        });
        entry.holders += 1;
        CancellationHandle::new(entry.token.clone())
    }

    /// Undo one [`register`](Self::register). The entry is dropped with its
    /// last holder, so a run sharing the token keeps it. Returns true if the
    /// entry was dropped.
    pub fn release(&self, id: &ScanCompositeId) -> bool {
        self.tokens
            .remove_if_mut(id, |_, registration| {
                registration.holders = registration.holders.saturating_sub(1);
                registration.holders == 0
            })
            .is_some()
    }

    /// Signal every walker of the scan. Returns false if the scan is not registered.
    pub fn request_cancellation(&self, id: &ScanCompositeId) -> bool {
        match self.tokens.get(id) {
            Some(registration) => {
                registration.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_cancellation_requested(&self, id: &ScanCompositeId) -> bool {
        self.tokens
            .get(id)
            .map(|registration| registration.token.is_cancelled())
            .unwrap_or(false)
    }

    pub fn is_registered(&self, id: &ScanCompositeId) -> bool {
        self.tokens.contains_key(id)
    }

    /// Drop the entry whatever its holder count, once the scan is terminal
    pub fn remove(&self, id: &ScanCompositeId) -> bool {
        self.tokens.remove(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn id() -> ScanCompositeId {
        ScanCompositeId::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn test_handles_share_one_signal() {
        let tracker = ScanCancellationTracker::new();
        let scan = id();
        let first = tracker.register(scan);
        let second = tracker.register(scan);

        assert!(!tracker.is_cancellation_requested(&scan));
        assert!(tracker.request_cancellation(&scan));
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
        assert!(tracker.is_cancellation_requested(&scan));
    }

    #[test]
    fn test_requests_are_idempotent() {
        let tracker = ScanCancellationTracker::new();
        let scan = id();
        let handle = tracker.register(scan);
        assert!(tracker.request_cancellation(&scan));
        assert!(tracker.request_cancellation(&scan));
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_scans_are_isolated() {
        let tracker = ScanCancellationTracker::new();
        let a = id();
        let b = id();
        let handle_a = tracker.register(a);
        let handle_b = tracker.register(b);
        tracker.request_cancellation(&a);
        assert!(handle_a.is_cancelled());
        assert!(!handle_b.is_cancelled());
    }

    #[test]
    fn test_unknown_and_removed_scans() {
        let tracker = ScanCancellationTracker::new();
        let scan = id();
        assert!(!tracker.request_cancellation(&scan));
        assert!(!tracker.is_cancellation_requested(&scan));

        tracker.register(scan);
        assert!(tracker.is_registered(&scan));
        assert!(tracker.remove(&scan));
        assert!(!tracker.is_registered(&scan));
        assert!(!tracker.request_cancellation(&scan));
    }

    #[test]
    fn test_release_keeps_entry_for_other_holders() {
        let tracker = ScanCancellationTracker::new();
        let scan = id();
        let running = tracker.register(scan);
        tracker.register(scan);

        // A second registrant backing out leaves the running scan cancellable
        assert!(!tracker.release(&scan));
        assert!(tracker.is_registered(&scan));
        assert!(tracker.request_cancellation(&scan));
        assert!(running.is_cancelled());

        assert!(tracker.release(&scan));
        assert!(!tracker.is_registered(&scan));
        assert!(!tracker.release(&scan));
    }

    #[tokio::test]
    async fn test_cancelled_future_wakes_waiter() {
        let tracker = std::sync::Arc::new(ScanCancellationTracker::new());
        let scan = id();
        let handle = tracker.register(scan);

        let waiter = tokio::spawn(async move {
            handle.cancelled().await;
        });
        tracker.request_cancellation(&scan);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
