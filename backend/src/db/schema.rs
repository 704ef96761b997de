//! Static schema for the scanner tables
//!
//! Statements are idempotent (`IF NOT EXISTS`) and run in order on every
//! startup. Column renames or type changes require a database wipe.

use sqlx::SqlitePool;
use tracing::{debug, info};

const STATEMENTS: &[(&str, &str)] = &[
    (
        "libraries",
        r#"
        CREATE TABLE IF NOT EXISTS libraries (
            id TEXT PRIMARY KEY NOT NULL,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            library_type TEXT NOT NULL,
            paths TEXT NOT NULL DEFAULT '[]',
            include_hidden INTEGER NOT NULL DEFAULT 0,
            auto_scan INTEGER NOT NULL DEFAULT 1,
            last_scanned_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "scans",
        r#"
        CREATE TABLE IF NOT EXISTS scans (
            id TEXT PRIMARY KEY NOT NULL,
            library_id TEXT NOT NULL REFERENCES libraries(id) ON DELETE CASCADE,
            user_id TEXT NOT NULL,
            status TEXT NOT NULL
                CHECK (status IN ('queued', 'started', 'finished', 'failed', 'cancelled')),
            error TEXT,
            download_metadata INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT
        )
        "#,
    ),
    (
        "idx_scans_library_status",
        "CREATE INDEX IF NOT EXISTS idx_scans_library_status ON scans (library_id, status)",
    ),
    (
        "scan_results",
        r#"
        CREATE TABLE IF NOT EXISTS scan_results (
            scan_id TEXT NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
            path TEXT NOT NULL CHECK (length(path) <= 1024),
            fingerprint TEXT NOT NULL CHECK (length(fingerprint) <= 24),
            size INTEGER NOT NULL CHECK (size >= 0),
            modified_at TEXT,
            PRIMARY KEY (scan_id, path)
        )
        "#,
    ),
    (
        "idx_scan_results_content",
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_scan_results_content
            ON scan_results (scan_id, fingerprint, size, path)
        "#,
    ),
    (
        "idx_scan_results_path",
        "CREATE INDEX IF NOT EXISTS idx_scan_results_path ON scan_results (path)",
    ),
];

/// Apply every schema statement
pub async fn sync_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for (name, sql) in STATEMENTS {
        debug!(object = %name, "Ensuring schema object");
        sqlx::query(sql).execute(pool).await?;
    }
    info!(objects = STATEMENTS.len(), "Schema synchronized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::db::Database;

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        let names: Vec<_> = tables.into_iter().map(|(n,)| n).collect();
        assert_eq!(names, vec!["libraries", "scan_results", "scans"]);
    }
}
