//! SQLite helper utilities for type conversion
//!
//! SQLite has no native UUID, array or timestamp types. UUIDs and timestamps are
//! stored as TEXT, lists as JSON TEXT and booleans as 0/1 integers.

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

// ============================================================================
// UUID Helpers
// ============================================================================

/// Convert a UUID to a SQLite-compatible string
#[inline]
pub fn uuid_to_str(id: Uuid) -> String {
    id.to_string()
}

/// Parse a SQLite string back to a UUID
#[inline]
pub fn str_to_uuid(s: &str) -> Result<Uuid, String> {
    Uuid::parse_str(s).map_err(|e| format!("Invalid UUID '{}': {}", s, e))
}

// ============================================================================
// Array Helpers (stored as JSON strings)
// ============================================================================

/// Serialize a slice to a JSON string for SQLite storage
#[inline]
pub fn vec_to_json<T: Serialize>(v: &[T]) -> String {
    serde_json::to_string(v).unwrap_or_else(|_| "[]".to_string())
}

/// Deserialize a JSON string from SQLite to a Vec
#[inline]
pub fn json_to_vec<T: DeserializeOwned>(s: &str) -> Result<Vec<T>, String> {
    serde_json::from_str(s).map_err(|e| format!("Invalid JSON array '{}': {}", s, e))
}

// ============================================================================
// Timestamp Helpers (stored as RFC 3339 TEXT)
// ============================================================================

/// Current UTC timestamp as RFC 3339 string
#[inline]
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339()
}

/// Convert a chrono DateTime to RFC 3339 string
#[inline]
pub fn datetime_to_str(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parse an RFC 3339 (or SQLite `datetime()`) string
#[inline]
pub fn str_to_datetime(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| ndt.and_utc())
                .map_err(|e| format!("Invalid datetime '{}': {}", s, e))
        })
}

/// Parse an optional datetime string
#[inline]
pub fn str_to_datetime_opt(s: Option<&str>) -> Result<Option<DateTime<Utc>>, String> {
    match s {
        Some(s) if !s.is_empty() => Ok(Some(str_to_datetime(s)?)),
        _ => Ok(None),
    }
}

// ============================================================================
// Boolean Helpers (SQLite uses 0/1 integers)
// ============================================================================

/// Convert bool to SQLite integer (0 or 1)
#[inline]
pub fn bool_to_int(b: bool) -> i32 {
    if b { 1 } else { 0 }
}

/// Convert SQLite integer to bool
#[inline]
pub fn int_to_bool(i: i32) -> bool {
    i != 0
}

/// Wrap a conversion failure as a row decode error
#[inline]
pub fn decode_err(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datetime_formats() {
        let now = Utc::now();
        let parsed = str_to_datetime(&datetime_to_str(now)).unwrap();
        assert_eq!(parsed, now);
        assert!(str_to_datetime("2024-01-02 03:04:05").is_ok());
        assert!(str_to_datetime("yesterday").is_err());
        assert_eq!(str_to_datetime_opt(Some("")).unwrap(), None);
    }

    #[test]
    fn test_json_vec() {
        let paths = vec!["/media/a".to_string(), "/media/b".to_string()];
        let json = vec_to_json(&paths);
        assert_eq!(json_to_vec::<String>(&json).unwrap(), paths);
        assert!(json_to_vec::<String>("not json").is_err());
    }

    #[test]
    fn test_bool_and_uuid() {
        assert!(int_to_bool(bool_to_int(true)));
        assert!(!int_to_bool(bool_to_int(false)));
        let id = Uuid::new_v4();
        assert_eq!(str_to_uuid(&uuid_to_str(id)).unwrap(), id);
        assert!(str_to_uuid("nope").is_err());
    }
}
