//! Scan aggregate persistence
//!
//! Status changes go through [`ScanRepository::update_status`], a
//! compare-and-set on the prior status, so two processes can never both apply
//! a transition from the same state.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::sqlite_helpers::{
    bool_to_int, datetime_to_str, decode_err, int_to_bool, str_to_datetime, str_to_datetime_opt,
    str_to_uuid, uuid_to_str,
};
use crate::error::StoreError;
use crate::services::scan::aggregate::{Scan, ScanStatus};

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for Scan {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        let id_str: String = row.try_get("id")?;
        let library_id_str: String = row.try_get("library_id")?;
        let user_id_str: String = row.try_get("user_id")?;
        let status_str: String = row.try_get("status")?;
        let download_metadata: i32 = row.try_get("download_metadata")?;
        let created_str: String = row.try_get("created_at")?;
        let updated_str: String = row.try_get("updated_at")?;
        let started_str: Option<String> = row.try_get("started_at")?;
        let finished_str: Option<String> = row.try_get("finished_at")?;

        Ok(Self {
            id: str_to_uuid(&id_str).map_err(decode_err)?,
            library_id: str_to_uuid(&library_id_str).map_err(decode_err)?,
            user_id: str_to_uuid(&user_id_str).map_err(decode_err)?,
            status: status_str.parse().map_err(decode_err)?,
            error: row.try_get("error")?,
            download_metadata: int_to_bool(download_metadata),
            created_at: str_to_datetime(&created_str).map_err(decode_err)?,
            updated_at: str_to_datetime(&updated_str).map_err(decode_err)?,
            started_at: str_to_datetime_opt(started_str.as_deref()).map_err(decode_err)?,
            finished_at: str_to_datetime_opt(finished_str.as_deref()).map_err(decode_err)?,
        })
    }
}

const SCAN_COLUMNS: &str = "id, library_id, user_id, status, error, download_metadata, \
    created_at, updated_at, started_at, finished_at";

pub struct ScanRepository {
    pool: SqlitePool,
}

impl ScanRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert the scan, or overwrite the stored copy if the id already exists
    pub async fn upsert(&self, scan: &Scan) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO scans (
                id, library_id, user_id, status, error, download_metadata,
                created_at, updated_at, started_at, finished_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT (id) DO UPDATE SET
                status = excluded.status,
                error = excluded.error,
                updated_at = excluded.updated_at,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at
            "#,
        )
        .bind(uuid_to_str(scan.id))
        .bind(uuid_to_str(scan.library_id))
        .bind(uuid_to_str(scan.user_id))
        .bind(scan.status.as_str())
        .bind(&scan.error)
        .bind(bool_to_int(scan.download_metadata))
        .bind(datetime_to_str(scan.created_at))
        .bind(datetime_to_str(scan.updated_at))
        .bind(scan.started_at.map(datetime_to_str))
        .bind(scan.finished_at.map(datetime_to_str))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Scan>, StoreError> {
        let sql = format!("SELECT {} FROM scans WHERE id = ?1", SCAN_COLUMNS);
        let scan = sqlx::query_as::<_, Scan>(&sql)
            .bind(uuid_to_str(id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(scan)
    }

    /// Persist a transition that was applied in memory, provided the stored
    /// status still equals `expected`.
    pub async fn update_status(&self, scan: &Scan, expected: ScanStatus) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE scans SET
                status = ?1,
                error = ?2,
                updated_at = ?3,
                started_at = ?4,
                finished_at = ?5
            WHERE id = ?6 AND status = ?7
            "#,
        )
        .bind(scan.status.as_str())
        .bind(&scan.error)
        .bind(datetime_to_str(scan.updated_at))
        .bind(scan.started_at.map(datetime_to_str))
        .bind(scan.finished_at.map(datetime_to_str))
        .bind(uuid_to_str(scan.id))
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let actual: Option<String> = sqlx::query_scalar("SELECT status FROM scans WHERE id = ?1")
                .bind(uuid_to_str(scan.id))
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;
            return match actual {
                None => Err(StoreError::ScanNotFound { scan_id: scan.id }),
                Some(actual) => Err(StoreError::StatusConflict {
                    scan_id: scan.id,
                    expected,
                    actual: actual.parse().map_err(StoreError::Decode)?,
                }),
            };
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_by_status(&self, status: ScanStatus) -> Result<Vec<Scan>, StoreError> {
        let sql = format!(
            "SELECT {} FROM scans WHERE status = ?1 ORDER BY created_at",
            SCAN_COLUMNS
        );
        let scans = sqlx::query_as::<_, Scan>(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(scans)
    }

    /// The newest Queued or Started scan of a library, if any
    pub async fn find_active_for_library(&self, library_id: Uuid) -> Result<Option<Scan>, StoreError> {
        let sql = format!(
            r#"
            SELECT {} FROM scans
            WHERE library_id = ?1 AND status IN ('queued', 'started')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            SCAN_COLUMNS
        );
        let scan = sqlx::query_as::<_, Scan>(&sql)
            .bind(uuid_to_str(library_id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(scan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CreateLibrary, Database, LibraryType};
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    async fn setup() -> (Database, Uuid, Uuid) {
        let db = Database::in_memory().await.unwrap();
        let user_id = Uuid::new_v4();
        let library = db
            .libraries()
            .create(CreateLibrary {
                user_id,
                name: "TV".to_string(),
                library_type: LibraryType::Tv,
                paths: vec!["/media/tv".to_string()],
                include_hidden: false,
                auto_scan: true,
            })
            .await
            .unwrap();
        (db, library.id, user_id)
    }

    #[tokio::test]
    async fn test_upsert_and_get_round_trip() {
        let (db, library_id, user_id) = setup().await;
        let scan = Scan::new(library_id, user_id).with_download_metadata(true);
        db.scans().upsert(&scan).await.unwrap();
        db.scans().upsert(&scan).await.unwrap();

        let loaded = db.scans().get(scan.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, scan.id);
        assert_eq!(loaded.status, ScanStatus::Queued);
        assert_eq!(loaded.created_at, scan.created_at);
        assert!(loaded.download_metadata);
    }

    #[tokio::test]
    async fn test_update_status_compare_and_set() {
        let (db, library_id, user_id) = setup().await;
        let mut scan = Scan::new(library_id, user_id);
        db.scans().upsert(&scan).await.unwrap();

        scan.start().unwrap();
        db.scans().update_status(&scan, ScanStatus::Queued).await.unwrap();

        // A second writer still believing the scan is Queued loses
        let mut stale = scan.clone();
        stale.status = ScanStatus::Cancelled;
        assert_matches!(
            db.scans().update_status(&stale, ScanStatus::Queued).await,
            Err(StoreError::StatusConflict { actual: ScanStatus::Started, .. })
        );

        let loaded = db.scans().get(scan.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ScanStatus::Started);
        assert!(loaded.started_at.is_some());
    }

    #[tokio::test]
    async fn test_update_missing_scan_is_not_found() {
        let (db, library_id, user_id) = setup().await;
        let mut scan = Scan::new(library_id, user_id);
        scan.start().unwrap();
        assert_matches!(
            db.scans().update_status(&scan, ScanStatus::Queued).await,
            Err(StoreError::ScanNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_active_scan_lookup_and_cascade() {
        let (db, library_id, user_id) = setup().await;
        assert!(db.scans().find_active_for_library(library_id).await.unwrap().is_none());

        let scan = Scan::new(library_id, user_id);
        db.scans().upsert(&scan).await.unwrap();
        let active = db.scans().find_active_for_library(library_id).await.unwrap();
        assert_eq!(active.map(|s| s.id), Some(scan.id));
        assert_eq!(db.scans().list_by_status(ScanStatus::Queued).await.unwrap().len(), 1);

        db.libraries().delete(library_id).await.unwrap();
        assert!(db.scans().get(scan.id).await.unwrap().is_none());
    }
}
