//! In-memory scan progress tracking
//!
//! Process-local and not durable: durable status lives on the scan aggregate.
//! Lifecycle: the tracker is created once at startup, an entry is added when a
//! scan starts and removed when the scan reaches a terminal state. A restart
//! drops every entry.
//!
//! Each scan gets its own mutex so updates for one scan are linearizable while
//! different scans never contend beyond the map shard lookup.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use super::aggregate::ScanCompositeId;

/// Progress of a single walker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub items_processed: u64,
    pub complete: bool,
}

/// Point-in-time copy of a scan's progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanProgressSnapshot {
    pub composite_id: ScanCompositeId,
    pub total_jobs: usize,
    pub jobs_completed: usize,
    pub jobs: Vec<JobProgress>,
    pub scan_complete: bool,
    pub started_at: DateTime<Utc>,
}

impl ScanProgressSnapshot {
    /// Files processed across every job
    pub fn items_processed(&self) -> u64 {
        self.jobs.iter().map(|j| j.items_processed).sum()
    }
}

#[derive(Debug)]
struct ScanProgressEntry {
    jobs: Vec<JobProgress>,
    jobs_completed: usize,
    scan_complete: bool,
    started_at: DateTime<Utc>,
}

impl ScanProgressEntry {
    fn snapshot(&self, composite_id: ScanCompositeId) -> ScanProgressSnapshot {
        ScanProgressSnapshot {
            composite_id,
            total_jobs: self.jobs.len(),
            jobs_completed: self.jobs_completed,
            jobs: self.jobs.clone(),
            scan_complete: self.scan_complete,
            started_at: self.started_at,
        }
    }
}

/// Process-wide map from scan composite id to live progress counters
#[derive(Debug, Default)]
pub struct ScanProgressTracker {
    scans: DashMap<ScanCompositeId, Arc<Mutex<ScanProgressEntry>>>,
}

impl ScanProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking a scan with `total_jobs` walkers. Replaces any stale entry.
    pub fn start_tracking(&self, id: ScanCompositeId, total_jobs: usize) {
        let entry = ScanProgressEntry {
            jobs: vec![JobProgress::default(); total_jobs],
            jobs_completed: 0,
            scan_complete: false,
            started_at: Utc::now(),
        };
        self.scans.insert(id, Arc::new(Mutex::new(entry)));
    }

    fn entry(&self, id: &ScanCompositeId) -> Option<Arc<Mutex<ScanProgressEntry>>> {
        // Clone the Arc out so the shard lock is released before the entry lock is taken
        self.scans.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Set the processed-item count of one job. Counts never move backwards.
    /// Returns `None` when the scan is not tracked or the job index is out of range.
    pub fn update_job_progress(
        &self,
        id: &ScanCompositeId,
        job_index: usize,
        items_processed: u64,
    ) -> Option<ScanProgressSnapshot> {
        let entry = self.entry(id)?;
        let mut guard = entry.lock();
        let job = guard.jobs.get_mut(job_index)?;
        job.items_processed = job.items_processed.max(items_processed);
        Some(guard.snapshot(*id))
    }

    /// Mark one job as done. Completing the same job twice counts once.
    pub fn mark_job_complete(
        &self,
        id: &ScanCompositeId,
        job_index: usize,
    ) -> Option<ScanProgressSnapshot> {
        let entry = self.entry(id)?;
        let mut guard = entry.lock();
        let job = guard.jobs.get_mut(job_index)?;
        if !job.complete {
            job.complete = true;
            guard.jobs_completed += 1;
        }
        Some(guard.snapshot(*id))
    }

    pub fn mark_scan_complete(&self, id: &ScanCompositeId) -> Option<ScanProgressSnapshot> {
        let entry = self.entry(id)?;
        let mut guard = entry.lock();
        guard.scan_complete = true;
        Some(guard.snapshot(*id))
    }

    pub fn snapshot(&self, id: &ScanCompositeId) -> Option<ScanProgressSnapshot> {
        let entry = self.entry(id)?;
        let guard = entry.lock();
        Some(guard.snapshot(*id))
    }

    pub fn remove(&self, id: &ScanCompositeId) -> bool {
        self.scans.remove(id).is_some()
    }

    /// Number of scans currently tracked
    pub fn len(&self) -> usize {
        self.scans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn id() -> ScanCompositeId {
        ScanCompositeId::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn test_tracks_jobs_independently() {
        let tracker = ScanProgressTracker::new();
        let scan = id();
        tracker.start_tracking(scan, 2);

        tracker.update_job_progress(&scan, 0, 5);
        let snap = tracker.update_job_progress(&scan, 1, 3).unwrap();

        assert_eq!(snap.total_jobs, 2);
        assert_eq!(snap.jobs[0].items_processed, 5);
        assert_eq!(snap.jobs[1].items_processed, 3);
        assert_eq!(snap.items_processed(), 8);
        assert_eq!(snap.jobs_completed, 0);
    }

    #[test]
    fn test_counts_do_not_regress() {
        let tracker = ScanProgressTracker::new();
        let scan = id();
        tracker.start_tracking(scan, 1);
        tracker.update_job_progress(&scan, 0, 10);
        let snap = tracker.update_job_progress(&scan, 0, 4).unwrap();
        assert_eq!(snap.jobs[0].items_processed, 10);
    }

    #[test]
    fn test_job_completion_is_idempotent() {
        let tracker = ScanProgressTracker::new();
        let scan = id();
        tracker.start_tracking(scan, 2);
        tracker.mark_job_complete(&scan, 0);
        let snap = tracker.mark_job_complete(&scan, 0).unwrap();
        assert_eq!(snap.jobs_completed, 1);

        let snap = tracker.mark_scan_complete(&scan).unwrap();
        assert!(snap.scan_complete);
    }

    #[test]
    fn test_unknown_scan_and_job_index() {
        let tracker = ScanProgressTracker::new();
        let scan = id();
        assert!(tracker.update_job_progress(&scan, 0, 1).is_none());
        assert!(tracker.snapshot(&scan).is_none());

        tracker.start_tracking(scan, 1);
        assert!(tracker.update_job_progress(&scan, 3, 1).is_none());
    }

    #[test]
    fn test_remove_discards_entry() {
        let tracker = ScanProgressTracker::new();
        let scan = id();
        tracker.start_tracking(scan, 1);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.remove(&scan));
        assert!(!tracker.remove(&scan));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_concurrent_updates_across_scans() {
        let tracker = Arc::new(ScanProgressTracker::new());
        let scans: Vec<_> = (0..4).map(|_| id()).collect();
        for scan in &scans {
            tracker.start_tracking(*scan, 4);
        }

        let handles: Vec<_> = scans
            .iter()
            .flat_map(|scan| (0..4).map(move |job| (*scan, job)))
            .map(|(scan, job)| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for i in 1..=500 {
                        tracker.update_job_progress(&scan, job, i);
                    }
                    tracker.mark_job_complete(&scan, job);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for scan in &scans {
            let snap = tracker.snapshot(scan).unwrap();
            assert_eq!(snap.jobs_completed, 4);
            assert_eq!(snap.items_processed(), 2000);
        }
    }
}
