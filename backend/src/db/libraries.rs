//! Library database repository
//!
//! A library owns one or more content locations. Deleting a library cascades
//! to its scans and their results.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::sqlite_helpers::{
    bool_to_int, decode_err, int_to_bool, json_to_vec, now_iso8601, str_to_datetime,
    str_to_datetime_opt, str_to_uuid, uuid_to_str, vec_to_json,
};

/// Video file extensions we recognize
const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "m4v", "mov", "wmv", "flv", "webm", "mpeg", "mpg", "ts", "m2ts",
];

/// Audio file extensions we recognize
const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "m4a", "aac", "ogg", "wav", "wma", "opus", "ape", "alac",
];

/// Audiobook containers plus plain audio
const AUDIOBOOK_EXTENSIONS: &[&str] = &[
    "m4b", "mp3", "m4a", "aac", "flac", "ogg", "opus", "wav",
];

/// Kind of content a library holds; decides which files a scan records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LibraryType {
    Movies,
    Tv,
    Music,
    Audiobooks,
    Other,
}

impl LibraryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LibraryType::Movies => "movies",
            LibraryType::Tv => "tv",
            LibraryType::Music => "music",
            LibraryType::Audiobooks => "audiobooks",
            LibraryType::Other => "other",
        }
    }

    /// Extension allowlist (lowercase, no dot). `None` accepts every file.
    pub fn extensions(&self) -> Option<&'static [&'static str]> {
        match self {
            LibraryType::Movies | LibraryType::Tv => Some(VIDEO_EXTENSIONS),
            LibraryType::Music => Some(AUDIO_EXTENSIONS),
            LibraryType::Audiobooks => Some(AUDIOBOOK_EXTENSIONS),
            LibraryType::Other => None,
        }
    }
}

impl fmt::Display for LibraryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LibraryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "movies" | "movie" => Ok(LibraryType::Movies),
            "tv" | "shows" => Ok(LibraryType::Tv),
            "music" => Ok(LibraryType::Music),
            "audiobooks" | "audiobook" => Ok(LibraryType::Audiobooks),
            "other" => Ok(LibraryType::Other),
            other => Err(format!("unknown library type '{}'", other)),
        }
    }
}

/// Library record from database
#[derive(Debug, Clone)]
pub struct LibraryRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub library_type: LibraryType,
    /// Content locations, one walker each
    pub paths: Vec<String>,
    pub include_hidden: bool,
    pub auto_scan: bool,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for LibraryRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use sqlx::Row;

        let id_str: String = row.try_get("id")?;
        let user_id_str: String = row.try_get("user_id")?;
        let type_str: String = row.try_get("library_type")?;
        let paths_json: String = row.try_get("paths")?;
        let include_hidden: i32 = row.try_get("include_hidden")?;
        let auto_scan: i32 = row.try_get("auto_scan")?;
        let last_scanned_str: Option<String> = row.try_get("last_scanned_at")?;
        let created_str: String = row.try_get("created_at")?;
        let updated_str: String = row.try_get("updated_at")?;

        Ok(Self {
            id: str_to_uuid(&id_str).map_err(decode_err)?,
            user_id: str_to_uuid(&user_id_str).map_err(decode_err)?,
            name: row.try_get("name")?,
            library_type: type_str.parse().map_err(decode_err)?,
            paths: json_to_vec(&paths_json).map_err(decode_err)?,
            include_hidden: int_to_bool(include_hidden),
            auto_scan: int_to_bool(auto_scan),
            last_scanned_at: str_to_datetime_opt(last_scanned_str.as_deref())
                .map_err(decode_err)?,
            created_at: str_to_datetime(&created_str).map_err(decode_err)?,
            updated_at: str_to_datetime(&updated_str).map_err(decode_err)?,
        })
    }
}

/// Input for creating a library
#[derive(Debug, Clone)]
pub struct CreateLibrary {
    pub user_id: Uuid,
    pub name: String,
    pub library_type: LibraryType,
    pub paths: Vec<String>,
    pub include_hidden: bool,
    pub auto_scan: bool,
}

const LIBRARY_COLUMNS: &str = r#"
    id, user_id, name, library_type, paths, include_hidden, auto_scan,
    last_scanned_at, created_at, updated_at
"#;

pub struct LibraryRepository {
    pool: SqlitePool,
}

impl LibraryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new library
    pub async fn create(&self, input: CreateLibrary) -> Result<LibraryRecord> {
        let id = Uuid::new_v4();
        let now = now_iso8601();

        sqlx::query(
            r#"
            INSERT INTO libraries (
                id, user_id, name, library_type, paths, include_hidden, auto_scan,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(uuid_to_str(input.user_id))
        .bind(&input.name)
        .bind(input.library_type.as_str())
        .bind(vec_to_json(&input.paths))
        .bind(bool_to_int(input.include_hidden))
        .bind(bool_to_int(input.auto_scan))
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("library {} vanished after insert", id))
    }

    /// Get a library by ID
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<LibraryRecord>> {
        let sql = format!("SELECT {} FROM libraries WHERE id = ?1", LIBRARY_COLUMNS);
        let record = sqlx::query_as::<_, LibraryRecord>(&sql)
            .bind(uuid_to_str(id))
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// Libraries that should be scanned by the scheduler
    pub async fn list_auto_scan(&self) -> Result<Vec<LibraryRecord>> {
        let sql = format!(
            "SELECT {} FROM libraries WHERE auto_scan = 1 ORDER BY name",
            LIBRARY_COLUMNS
        );
        let records = sqlx::query_as::<_, LibraryRecord>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// Delete a library, cascading to its scans and scan results
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM libraries WHERE id = ?1")
            .bind(uuid_to_str(id))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Update last scanned timestamp
    pub async fn update_last_scanned(&self, id: Uuid) -> Result<()> {
        let now = now_iso8601();
        sqlx::query("UPDATE libraries SET last_scanned_at = ?1, updated_at = ?1 WHERE id = ?2")
            .bind(&now)
            .bind(uuid_to_str(id))
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    fn input(user_id: Uuid) -> CreateLibrary {
        CreateLibrary {
            user_id,
            name: "Movies".to_string(),
            library_type: LibraryType::Movies,
            paths: vec!["/media/movies".to_string(), "/mnt/archive".to_string()],
            include_hidden: false,
            auto_scan: true,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let db = Database::in_memory().await.unwrap();
        let user_id = Uuid::new_v4();
        let created = db.libraries().create(input(user_id)).await.unwrap();

        let fetched = db.libraries().get_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.user_id, user_id);
        assert_eq!(fetched.library_type, LibraryType::Movies);
        assert_eq!(fetched.paths, vec!["/media/movies", "/mnt/archive"]);
        assert!(fetched.last_scanned_at.is_none());

        db.libraries().update_last_scanned(created.id).await.unwrap();
        let fetched = db.libraries().get_by_id(created.id).await.unwrap().unwrap();
        assert!(fetched.last_scanned_at.is_some());
    }

    #[tokio::test]
    async fn test_list_auto_scan_filters() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.libraries();
        repo.create(input(Uuid::new_v4())).await.unwrap();
        repo.create(CreateLibrary {
            auto_scan: false,
            name: "Manual".to_string(),
            ..input(Uuid::new_v4())
        })
        .await
        .unwrap();

        let libraries = repo.list_auto_scan().await.unwrap();
        assert_eq!(libraries.len(), 1);
        assert_eq!(libraries[0].name, "Movies");
    }

    #[test]
    fn test_library_type_extensions() {
        assert!(LibraryType::Movies.extensions().unwrap().contains(&"mkv"));
        assert!(LibraryType::Music.extensions().unwrap().contains(&"flac"));
        assert!(LibraryType::Other.extensions().is_none());
        assert_eq!("TV".parse::<LibraryType>(), Ok(LibraryType::Tv));
        assert!("games".parse::<LibraryType>().is_err());
    }
}
