//! Scan result store
//!
//! One row per file path per scan, append-only. The primary key (scan_id, path)
//! and the unique (scan_id, fingerprint, size, path) index are what make
//! resumed or overlapping walkers idempotent; no application lock is involved.

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::sqlite_helpers::{
    datetime_to_str, decode_err, str_to_datetime_opt, str_to_uuid, uuid_to_str,
};
use crate::error::StoreError;
use crate::services::scan::fingerprint::ContentFingerprint;

/// Longest path a result row can hold
pub const MAX_PATH_LEN: usize = 1024;

/// Stored scan result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResultRecord {
    pub scan_id: Uuid,
    pub path: String,
    pub fingerprint: ContentFingerprint,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for ScanResultRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        let scan_id_str: String = row.try_get("scan_id")?;
        let fingerprint_str: String = row.try_get("fingerprint")?;
        let size: i64 = row.try_get("size")?;
        let modified_str: Option<String> = row.try_get("modified_at")?;

        Ok(Self {
            scan_id: str_to_uuid(&scan_id_str).map_err(decode_err)?,
            path: row.try_get("path")?,
            fingerprint: ContentFingerprint::decode(&fingerprint_str).map_err(decode_err)?,
            size: u64::try_from(size).map_err(|e| decode_err(e.to_string()))?,
            modified_at: str_to_datetime_opt(modified_str.as_deref()).map_err(decode_err)?,
        })
    }
}

/// Input for recording one file
#[derive(Debug, Clone)]
pub struct NewScanResult {
    pub path: String,
    pub fingerprint: ContentFingerprint,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

impl NewScanResult {
    /// Reject rows the schema would refuse
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.path.is_empty() {
            return Err(StoreError::Validation("path is empty".to_string()));
        }
        if self.path.chars().count() > MAX_PATH_LEN {
            return Err(StoreError::Validation(format!(
                "path exceeds {} characters: {}...",
                MAX_PATH_LEN,
                self.path.chars().take(64).collect::<String>()
            )));
        }
        if i64::try_from(self.size).is_err() {
            return Err(StoreError::Validation(format!(
                "file size {} out of range",
                self.size
            )));
        }
        Ok(())
    }
}

/// Outcome of a batch insert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    /// Rows that already existed, treated as already done
    pub already_recorded: usize,
}

/// Paths in one scan sharing fingerprint and size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub fingerprint: ContentFingerprint,
    pub size: u64,
    pub paths: Vec<String>,
}

/// Aggregate counters over a scan's results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanTotals {
    pub files: u64,
    pub bytes: u64,
}

const INSERT_SQL: &str = r#"
    INSERT INTO scan_results (scan_id, path, fingerprint, size, modified_at)
    VALUES (?1, ?2, ?3, ?4, ?5)
"#;

async fn insert_one<'e, E>(executor: E, scan_id: Uuid, row: &NewScanResult) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    row.validate()?;
    sqlx::query(INSERT_SQL)
        .bind(uuid_to_str(scan_id))
        .bind(&row.path)
        .bind(row.fingerprint.encode())
        .bind(row.size as i64)
        .bind(row.modified_at.map(datetime_to_str))
        .execute(executor)
        .await
        .map_err(|e| StoreError::from_insert(e, scan_id, &row.path))?;
    Ok(())
}

#[derive(Clone)]
pub struct ScanResultRepository {
    pool: SqlitePool,
}

impl ScanResultRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert one result. Fails with [`StoreError::Conflict`] if the path is
    /// already recorded for this scan.
    pub async fn record_result(
        &self,
        scan_id: Uuid,
        path: &str,
        fingerprint: ContentFingerprint,
        size: u64,
        modified_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let row = NewScanResult {
            path: path.to_string(),
            fingerprint,
            size,
            modified_at,
        };
        insert_one(&self.pool, scan_id, &row).await
    }

    /// Insert a batch in one transaction. Conflicting rows are counted as
    /// already recorded; any other error rolls the whole batch back.
    pub async fn record_batch(
        &self,
        scan_id: Uuid,
        rows: &[NewScanResult],
    ) -> Result<BatchOutcome, StoreError> {
        let mut outcome = BatchOutcome::default();
        if rows.is_empty() {
            return Ok(outcome);
        }

        let mut tx = self.pool.begin().await?;
        for row in rows {
            match insert_one(&mut *tx, scan_id, row).await {
                Ok(()) => outcome.inserted += 1,
                Err(StoreError::Conflict { .. }) => outcome.already_recorded += 1,
                Err(e) => return Err(e),
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn exists(&self, scan_id: Uuid, path: &str) -> Result<bool, StoreError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM scan_results WHERE scan_id = ?1 AND path = ?2")
                .bind(uuid_to_str(scan_id))
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    /// Stream every result of a scan in path order
    pub fn get_by_scan(
        &self,
        scan_id: Uuid,
    ) -> BoxStream<'_, Result<ScanResultRecord, StoreError>> {
        sqlx::query_as::<_, ScanResultRecord>(
            r#"
            SELECT scan_id, path, fingerprint, size, modified_at
            FROM scan_results
            WHERE scan_id = ?1
            ORDER BY path
            "#,
        )
        .bind(uuid_to_str(scan_id))
        .fetch(&self.pool)
        .map(|row| row.map_err(StoreError::from))
        .boxed()
    }

    /// Results of a scan whose content matches `fingerprint` and `size`
    pub async fn find_by_content(
        &self,
        scan_id: Uuid,
        fingerprint: ContentFingerprint,
        size: u64,
    ) -> Result<Vec<ScanResultRecord>, StoreError> {
        let records = sqlx::query_as::<_, ScanResultRecord>(
            r#"
            SELECT scan_id, path, fingerprint, size, modified_at
            FROM scan_results
            WHERE scan_id = ?1 AND fingerprint = ?2 AND size = ?3
            ORDER BY path
            "#,
        )
        .bind(uuid_to_str(scan_id))
        .bind(fingerprint.encode())
        .bind(size as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Groups of two or more paths with identical content
    pub async fn find_duplicates(&self, scan_id: Uuid) -> Result<Vec<DuplicateGroup>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT r.fingerprint, r.size, r.path
            FROM scan_results r
            JOIN (
                SELECT fingerprint, size
                FROM scan_results
                WHERE scan_id = ?1
                GROUP BY fingerprint, size
                HAVING COUNT(*) > 1
            ) d ON d.fingerprint = r.fingerprint AND d.size = r.size
            WHERE r.scan_id = ?1
            ORDER BY r.fingerprint, r.size, r.path
            "#,
        )
        .bind(uuid_to_str(scan_id))
        .fetch_all(&self.pool)
        .await?;

        let mut groups: Vec<DuplicateGroup> = Vec::new();
        for row in rows {
            let fingerprint_str: String = row.try_get("fingerprint")?;
            let fingerprint =
                ContentFingerprint::decode(&fingerprint_str).map_err(StoreError::Decode)?;
            let size: i64 = row.try_get("size")?;
            let size = size as u64;
            let path: String = row.try_get("path")?;

            match groups.last_mut() {
                Some(group) if group.fingerprint == fingerprint && group.size == size => {
                    group.paths.push(path)
                }
                _ => groups.push(DuplicateGroup {
                    fingerprint,
                    size,
                    paths: vec![path],
                }),
            }
        }
        Ok(groups)
    }

    pub async fn count_by_scan(&self, scan_id: Uuid) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scan_results WHERE scan_id = ?1")
            .bind(uuid_to_str(scan_id))
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// File count and byte total of a scan
    pub async fn totals(&self, scan_id: Uuid) -> Result<ScanTotals, StoreError> {
        let (files, bytes): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM scan_results WHERE scan_id = ?1",
        )
        .bind(uuid_to_str(scan_id))
        .fetch_one(&self.pool)
        .await?;
        Ok(ScanTotals {
            files: files as u64,
            bytes: bytes as u64,
        })
    }
}
