//! Database connection and repositories

pub mod libraries;
pub mod scan_results;
pub mod scans;
pub mod schema;
pub mod sqlite_helpers;

use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

pub use libraries::{CreateLibrary, LibraryRecord, LibraryRepository, LibraryType};
pub use scan_results::{
    BatchOutcome, DuplicateGroup, NewScanResult, ScanResultRecord, ScanResultRepository,
    ScanTotals,
};
pub use scans::ScanRepository;

/// Database wrapper providing connection pool access
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database wrapper from an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn connect_options(url: &str) -> Result<SqliteConnectOptions> {
        let url = if url.starts_with("sqlite:") {
            url.to_string()
        } else {
            format!("sqlite://{}", url)
        };
        Ok(SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10)))
    }

    /// Open (creating if needed) the database at `url`, a path or `sqlite:` URL
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(url.trim_start_matches("sqlite://")).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(Self::connect_options(url)?)
            .await?;

        Ok(Self { pool })
    }

    /// Connect, retrying every `retry_interval` until successful
    pub async fn connect_with_retry(
        url: &str,
        max_connections: u32,
        retry_interval: Duration,
    ) -> Self {
        loop {
            match Self::connect(url, max_connections).await {
                Ok(db) => return db,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_secs = retry_interval.as_secs(),
                        "Database connection failed, retrying"
                    );
                    tokio::time::sleep(retry_interval).await;
                }
            }
        }
    }

    /// Private in-memory database with the schema applied.
    /// A single connection keeps every query on the same memory database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get a library repository
    pub fn libraries(&self) -> LibraryRepository {
        LibraryRepository::new(self.pool.clone())
    }

    /// Get a scan repository
    pub fn scans(&self) -> ScanRepository {
        ScanRepository::new(self.pool.clone())
    }

    /// Get a scan results repository
    pub fn scan_results(&self) -> ScanResultRepository {
        ScanResultRepository::new(self.pool.clone())
    }

    /// Create tables and indexes that do not exist yet
    pub async fn migrate(&self) -> Result<()> {
        schema::sync_schema(&self.pool).await?;
        Ok(())
    }
}
