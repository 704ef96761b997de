//! Scan job walker
//!
//! Walks one content location depth-first in file-name order, fingerprints
//! every accepted file and stages result rows that are flushed in small
//! transactions. Paths already recorded for the scan are skipped, so a rerun
//! over the same tree writes nothing new.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::aggregate::ScanCompositeId;
use super::cancellation::CancellationHandle;
use super::events::{ScanEvent, ScanEventDispatcher};
use super::fingerprint::fingerprint_reader;
use super::progress::ScanProgressTracker;
use crate::db::scan_results::MAX_PATH_LEN;
use crate::db::{LibraryRecord, NewScanResult, ScanResultRepository};
use crate::error::ScanError;
use crate::services::filesystem::{EntryKind, FileEntry, FileSystem};

/// Which entries a walker records
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub include_hidden: bool,
    /// Lowercase extensions without the dot. `None` accepts every file.
    pub extensions: Option<Vec<String>>,
}

impl ScanFilter {
    pub fn for_library(library: &LibraryRecord) -> Self {
        Self {
            include_hidden: library.include_hidden,
            extensions: library
                .library_type
                .extensions()
                .map(|exts| exts.iter().map(|e| e.to_string()).collect()),
        }
    }

    fn accepts_directory(&self, entry: &FileEntry) -> bool {
        self.include_hidden || !entry.is_hidden()
    }

    fn accepts_file(&self, entry: &FileEntry) -> bool {
        if !self.include_hidden && entry.is_hidden() {
            return false;
        }
        match &self.extensions {
            None => true,
            Some(allowed) => entry
                .path
                .extension()
                .and_then(|e| e.to_str())
                .map(|ext| {
                    let ext = ext.to_lowercase();
                    allowed.iter().any(|a| *a == ext)
                })
                .unwrap_or(false),
        }
    }
}

/// One walker's unit of work
#[derive(Debug, Clone)]
pub struct ScanJob {
    pub job_index: usize,
    pub location: PathBuf,
    pub composite_id: ScanCompositeId,
    pub library_id: Uuid,
    pub filter: ScanFilter,
}

/// A file left out of the scan
#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Counters for one walk
#[derive(Debug, Clone, Default)]
pub struct WalkStats {
    pub files_processed: u64,
    pub files_recorded: u64,
    /// Paths found already recorded, before or during the flush
    pub files_already_recorded: u64,
    pub bytes_hashed: u64,
    pub directories: u64,
    pub skipped: Vec<SkippedFile>,
}

#[derive(Debug)]
pub enum WalkOutcome {
    Completed(WalkStats),
    Cancelled(WalkStats),
    Failed { stats: WalkStats, error: ScanError },
}

impl WalkOutcome {
    pub fn stats(&self) -> &WalkStats {
        match self {
            WalkOutcome::Completed(stats) | WalkOutcome::Cancelled(stats) => stats,
            WalkOutcome::Failed { stats, .. } => stats,
        }
    }
}

/// Walker tuning
#[derive(Debug, Clone, Copy)]
pub struct WalkerSettings {
    pub batch_size: usize,
    pub progress_interval: u64,
    pub read_buffer_bytes: usize,
}

impl Default for WalkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            progress_interval: 10,
            read_buffer_bytes: 64 * 1024,
        }
    }
}

/// Per-file result inside a walk
enum FileStep {
    Staged(NewScanResult, u64),
    AlreadyRecorded,
    Skipped(String),
}

/// Mutable state of a single walk
struct WalkState<'a> {
    job: &'a ScanJob,
    stats: WalkStats,
    staged: Vec<NewScanResult>,
}

pub struct ScanJobWalker {
    fs: Arc<dyn FileSystem>,
    results: ScanResultRepository,
    progress: Arc<ScanProgressTracker>,
    events: Arc<ScanEventDispatcher>,
    settings: WalkerSettings,
}

impl ScanJobWalker {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        results: ScanResultRepository,
        progress: Arc<ScanProgressTracker>,
        events: Arc<ScanEventDispatcher>,
        settings: WalkerSettings,
    ) -> Self {
        Self {
            fs,
            results,
            progress,
            events,
            settings,
        }
    }

    /// Walk the job's location to the end, until cancelled, or until a
    /// directory cannot be enumerated.
    pub async fn run(&self, job: &ScanJob, cancel: &CancellationHandle) -> WalkOutcome {
        let scan_id = job.composite_id.scan_id;
        info!(
            scan_id = %scan_id,
            job_index = job.job_index,
            location = %job.location.display(),
            "Walker started"
        );

        let mut state = WalkState {
            job,
            stats: WalkStats::default(),
            staged: Vec::with_capacity(self.settings.batch_size),
        };

        let outcome = match self.walk(&mut state, cancel).await {
            Ok(true) => match self.flush(&mut state).await {
                Ok(()) => WalkOutcome::Completed(state.stats),
                Err(error) => WalkOutcome::Failed {
                    stats: state.stats,
                    error,
                },
            },
            Ok(false) => match self.flush(&mut state).await {
                Ok(()) => WalkOutcome::Cancelled(state.stats),
                Err(e) => {
                    warn!(
                        scan_id = %scan_id,
                        error = %e,
                        skipped = state.stats.skipped.len(),
                        "Flush after cancellation failed"
                    );
                    WalkOutcome::Cancelled(state.stats)
                }
            },
            Err(error) => {
                if let Err(e) = self.flush(&mut state).await {
                    warn!(scan_id = %scan_id, error = %e, "Flush after walker failure failed");
                }
                WalkOutcome::Failed {
                    stats: state.stats,
                    error,
                }
            }
        };

        if let Some(snapshot) = self
            .progress
            .mark_job_complete(&job.composite_id, job.job_index)
        {
            self.events
                .dispatch(&ScanEvent::ProgressChanged { snapshot })
                .await;
        }

        let stats = outcome.stats();
        info!(
            scan_id = %scan_id,
            job_index = job.job_index,
            processed = stats.files_processed,
            recorded = stats.files_recorded,
            already_recorded = stats.files_already_recorded,
            skipped = stats.skipped.len(),
            outcome = match &outcome {
                WalkOutcome::Completed(_) => "completed",
                WalkOutcome::Cancelled(_) => "cancelled",
                WalkOutcome::Failed { .. } => "failed",
            },
            "Walker finished"
        );
        outcome
    }

    /// Depth-first traversal. Returns `Ok(false)` when cancelled.
    async fn walk(
        &self,
        state: &mut WalkState<'_>,
        cancel: &CancellationHandle,
    ) -> Result<bool, ScanError> {
        let root = state.job.location.clone();
        if !self.fs.exists(&root).await {
            return Err(ScanError::Io {
                path: root,
                source: io::Error::new(io::ErrorKind::NotFound, "content location does not exist"),
            });
        }

        let mut stack = vec![self.list_directory(&root, state).await?.into_iter()];

        while let Some(entries) = stack.last_mut() {
            let Some(entry) = entries.next() else {
                stack.pop();
                continue;
            };

            if cancel.is_cancelled() {
                return Ok(false);
            }

            match entry.kind {
                EntryKind::Directory if state.job.filter.accepts_directory(&entry) => {
                    let children = self.list_directory(&entry.path, state).await?;
                    stack.push(children.into_iter());
                }
                EntryKind::File if state.job.filter.accepts_file(&entry) => {
                    self.process_file(&entry.path, state).await?;
                }
                _ => {}
            }
        }

        Ok(true)
    }

    async fn list_directory(
        &self,
        dir: &Path,
        state: &mut WalkState<'_>,
    ) -> Result<Vec<FileEntry>, ScanError> {
        let entries = self.fs.read_dir(dir).await.map_err(|source| ScanError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        state.stats.directories += 1;
        Ok(entries)
    }

    async fn process_file(&self, path: &Path, state: &mut WalkState<'_>) -> Result<(), ScanError> {
        let job = state.job;
        let scan_id = job.composite_id.scan_id;

        match self.inspect_file(scan_id, path).await? {
            FileStep::Staged(row, bytes) => {
                debug!(scan_id = %scan_id, path = %row.path, size = row.size, "File fingerprinted");
                state.stats.bytes_hashed += bytes;
                state.staged.push(row);
                if state.staged.len() >= self.settings.batch_size {
                    self.flush(state).await?;
                }
            }
            FileStep::AlreadyRecorded => {
                debug!(scan_id = %scan_id, path = %path.display(), "Already recorded, skipping");
                state.stats.files_already_recorded += 1;
            }
            FileStep::Skipped(reason) => {
                warn!(
                    scan_id = %scan_id,
                    job_index = job.job_index,
                    path = %path.display(),
                    reason = %reason,
                    "Skipping file"
                );
                state.stats.skipped.push(SkippedFile {
                    path: path.to_path_buf(),
                    reason,
                });
            }
        }

        state.stats.files_processed += 1;
        let processed = state.stats.files_processed;
        self.progress
            .update_job_progress(&job.composite_id, job.job_index, processed);

        if processed % self.settings.progress_interval.max(1) == 0 {
            self.events
                .dispatch(&ScanEvent::JobProgressChanged {
                    composite_id: job.composite_id,
                    job_index: job.job_index,
                    location: job.location.to_string_lossy().into_owned(),
                    items_processed: processed,
                })
                .await;
        }
        Ok(())
    }

    /// Per-file problems become [`FileStep::Skipped`]; only store failures are errors.
    async fn inspect_file(&self, scan_id: Uuid, path: &Path) -> Result<FileStep, ScanError> {
        let Some(path_str) = path.to_str() else {
            return Ok(FileStep::Skipped("path is not valid UTF-8".to_string()));
        };
        if path_str.chars().count() > MAX_PATH_LEN {
            return Ok(FileStep::Skipped(format!(
                "path longer than {} characters",
                MAX_PATH_LEN
            )));
        }

        if self.results.exists(scan_id, path_str).await? {
            return Ok(FileStep::AlreadyRecorded);
        }

        let stat = match self.fs.stat(path).await {
            Ok(stat) => stat,
            Err(e) => return Ok(FileStep::Skipped(format!("stat failed: {}", e))),
        };
        if !stat.is_file {
            return Ok(FileStep::Skipped("not a regular file".to_string()));
        }

        let mut reader = match self.fs.open(path).await {
            Ok(reader) => reader,
            Err(e) => return Ok(FileStep::Skipped(format!("open failed: {}", e))),
        };
        let (fingerprint, bytes) =
            match fingerprint_reader(&mut reader, self.settings.read_buffer_bytes).await {
                Ok(hashed) => hashed,
                Err(e) => return Ok(FileStep::Skipped(format!("read failed: {}", e))),
            };

        let row = NewScanResult {
            path: path_str.to_string(),
            fingerprint,
            // The bytes actually hashed, in case the file changed after stat
            size: bytes,
            modified_at: stat.modified_at,
        };
        if let Err(e) = row.validate() {
            return Ok(FileStep::Skipped(e.to_string()));
        }
        Ok(FileStep::Staged(row, bytes))
    }

    async fn flush(&self, state: &mut WalkState<'_>) -> Result<(), ScanError> {
        if state.staged.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut state.staged);
        let outcome = match self
            .results
            .record_batch(state.job.composite_id.scan_id, &rows)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // The batch rolled back; none of its rows were recorded
                let reason = format!("flush failed: {}", e);
                state
                    .stats
                    .skipped
                    .extend(rows.into_iter().map(|row| SkippedFile {
                        path: PathBuf::from(row.path),
                        reason: reason.clone(),
                    }));
                return Err(e.into());
            }
        };
        state.stats.files_recorded += outcome.inserted as u64;
        state.stats.files_already_recorded += outcome.already_recorded as u64;
        debug!(
            scan_id = %state.job.composite_id.scan_id,
            inserted = outcome.inserted,
            already_recorded = outcome.already_recorded,
            "Flushed scan results"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CreateLibrary, Database, LibraryType};
    use crate::services::filesystem::LocalFileSystem;
    use crate::services::scan::aggregate::Scan;
    use assert_matches::assert_matches;
    use futures::TryStreamExt;
    use pretty_assertions::assert_eq;

    struct Fixture {
        db: Database,
        scan: Scan,
        walker: ScanJobWalker,
        progress: Arc<ScanProgressTracker>,
    }

    async fn fixture(batch_size: usize) -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let user_id = Uuid::new_v4();
        let library = db
            .libraries()
            .create(CreateLibrary {
                user_id,
                name: "Movies".to_string(),
                library_type: LibraryType::Movies,
                paths: vec![],
                include_hidden: false,
                auto_scan: false,
            })
            .await
            .unwrap();
        let scan = Scan::new(library.id, user_id);
        db.scans().upsert(&scan).await.unwrap();

        let progress = Arc::new(ScanProgressTracker::new());
        progress.start_tracking(scan.composite_id(), 1);
        let walker = ScanJobWalker::new(
            Arc::new(LocalFileSystem::new()),
            db.scan_results(),
            progress.clone(),
            Arc::new(ScanEventDispatcher::new()),
            WalkerSettings {
                batch_size,
                ..WalkerSettings::default()
            },
        );
        Fixture {
            db,
            scan,
            walker,
            progress,
        }
    }

    fn job(fixture: &Fixture, location: &Path, filter: ScanFilter) -> ScanJob {
        ScanJob {
            job_index: 0,
            location: location.to_path_buf(),
            composite_id: fixture.scan.composite_id(),
            library_id: fixture.scan.library_id,
            filter,
        }
    }

    fn video_filter() -> ScanFilter {
        ScanFilter {
            include_hidden: false,
            extensions: Some(vec!["mkv".to_string(), "mp4".to_string()]),
        }
    }

    #[tokio::test]
    async fn test_filters_hidden_and_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Show/Season 1")).unwrap();
        std::fs::create_dir_all(dir.path().join(".trash")).unwrap();
        std::fs::write(dir.path().join("Show/Season 1/e01.mkv"), b"e01").unwrap();
        std::fs::write(dir.path().join("Show/Season 1/e02.MP4"), b"e02").unwrap();
        std::fs::write(dir.path().join("Show/poster.jpg"), b"jpg").unwrap();
        std::fs::write(dir.path().join(".hidden.mkv"), b"h").unwrap();
        std::fs::write(dir.path().join(".trash/old.mkv"), b"old").unwrap();

        let f = fixture(2).await;
        let outcome = f
            .walker
            .run(&job(&f, dir.path(), video_filter()), &CancellationHandle::detached())
            .await;

        let stats = assert_matches!(outcome, WalkOutcome::Completed(stats) => stats);
        assert_eq!(stats.files_recorded, 2);
        assert_eq!(stats.bytes_hashed, 6);

        let rows: Vec<_> = f
            .db
            .scan_results()
            .get_by_scan(f.scan.id)
            .try_collect()
            .await
            .unwrap();
        let names: Vec<_> = rows
            .iter()
            .map(|r| Path::new(&r.path).file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["e01.mkv", "e02.MP4"]);

        let snapshot = f.progress.snapshot(&f.scan.composite_id()).unwrap();
        assert_eq!(snapshot.jobs_completed, 1);
        assert_eq!(snapshot.items_processed(), 2);
    }

    #[tokio::test]
    async fn test_rerun_records_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("{i}.mkv")), format!("movie {i}")).unwrap();
        }
        let f = fixture(3).await;
        let job = job(&f, dir.path(), ScanFilter::default());

        let first = f.walker.run(&job, &CancellationHandle::detached()).await;
        assert_eq!(first.stats().files_recorded, 5);

        let second = f.walker.run(&job, &CancellationHandle::detached()).await;
        let stats = assert_matches!(second, WalkOutcome::Completed(stats) => stats);
        assert_eq!(stats.files_recorded, 0);
        assert_eq!(stats.files_already_recorded, 5);
        assert_eq!(f.db.scan_results().count_by_scan(f.scan.id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_missing_root_fails() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(4).await;
        let outcome = f
            .walker
            .run(
                &job(&f, &dir.path().join("gone"), ScanFilter::default()),
                &CancellationHandle::detached(),
            )
            .await;
        assert_matches!(outcome, WalkOutcome::Failed { error: ScanError::Io { .. }, .. });
    }

    #[tokio::test]
    async fn test_cancelled_before_first_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.mkv"), b"a").unwrap();
        let f = fixture(4).await;
        let cancel = CancellationHandle::detached();
        cancel.cancel();

        let outcome = f.walker.run(&job(&f, dir.path(), ScanFilter::default()), &cancel).await;
        assert_matches!(outcome, WalkOutcome::Cancelled(stats) if stats.files_processed == 0);
    }

    /// Local disk that cancels the walk and closes the database while a
    /// given file is being opened
    struct CancelOnOpen {
        inner: LocalFileSystem,
        trigger: PathBuf,
        cancel: CancellationHandle,
        db: Database,
    }

    #[async_trait::async_trait]
    impl FileSystem for CancelOnOpen {
        async fn read_dir(&self, dir: &Path) -> io::Result<Vec<FileEntry>> {
            self.inner.read_dir(dir).await
        }

        async fn open(&self, path: &Path) -> io::Result<crate::services::filesystem::FileReader> {
            if path == self.trigger {
                self.cancel.cancel();
                self.db.pool().close().await;
            }
            self.inner.open(path).await
        }

        async fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path).await
        }

        async fn stat(&self, path: &Path) -> io::Result<crate::services::filesystem::FileStat> {
            self.inner.stat(path).await
        }
    }

    #[tokio::test]
    async fn test_failed_flush_after_cancel_counts_staged_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.mkv", "b.mkv", "c.mkv"] {
            std::fs::write(dir.path().join(name), name).unwrap();
        }
        let f = fixture(10).await;
        let cancel = CancellationHandle::detached();
        let walker = ScanJobWalker::new(
            Arc::new(CancelOnOpen {
                inner: LocalFileSystem::new(),
                trigger: dir.path().join("b.mkv"),
                cancel: cancel.clone(),
                db: f.db.clone(),
            }),
            f.db.scan_results(),
            f.progress.clone(),
            Arc::new(ScanEventDispatcher::new()),
            WalkerSettings {
                batch_size: 10,
                ..WalkerSettings::default()
            },
        );

        let outcome = walker.run(&job(&f, dir.path(), ScanFilter::default()), &cancel).await;

        let stats = assert_matches!(outcome, WalkOutcome::Cancelled(stats) => stats);
        assert_eq!(stats.files_processed, 2);
        assert_eq!(stats.files_recorded, 0);
        let skipped: Vec<_> = stats
            .skipped
            .iter()
            .map(|s| s.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(skipped, vec!["a.mkv", "b.mkv"]);
        assert!(stats.skipped.iter().all(|s| s.reason.starts_with("flush failed")));
    }

    #[test]
    fn test_filter_extensions_case_insensitive() {
        let filter = video_filter();
        let entry = |name: &str| FileEntry {
            name: name.to_string(),
            path: PathBuf::from("/m").join(name),
            kind: EntryKind::File,
        };
        assert!(filter.accepts_file(&entry("a.MKV")));
        assert!(!filter.accepts_file(&entry("a.srt")));
        assert!(!filter.accepts_file(&entry("noext")));
        assert!(!filter.accepts_file(&entry(".a.mkv")));
        assert!(ScanFilter::default().accepts_file(&entry("noext")));
    }
}
