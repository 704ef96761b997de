//! Application configuration management

use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" | "" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => anyhow::bail!("unknown log format '{}'", other),
        }
    }
}

/// Scanner tuning
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Walkers allowed to run at once across every scan
    pub max_concurrent_walkers: usize,

    /// Scan jobs the queue runs at once
    pub max_concurrent_scans: usize,

    /// Pending scan jobs before enqueue waits
    pub queue_capacity: usize,

    /// Result rows written per transaction
    pub result_batch_size: usize,

    /// Files between job progress events
    pub progress_interval: u64,

    pub read_buffer_bytes: usize,

    /// Six-field cron expression for the auto-scan job
    pub auto_scan_cron: String,

    /// Capacity of the client notification channel
    pub event_channel_capacity: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_concurrent_walkers: 4,
            max_concurrent_scans: 2,
            queue_capacity: 100,
            result_batch_size: 32,
            progress_interval: 10,
            read_buffer_bytes: 64 * 1024,
            auto_scan_cron: "0 0 * * * *".to_string(),
            event_channel_capacity: 256,
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite path or `sqlite:` URL
    pub database_url: String,

    pub database_max_connections: u32,

    pub log_format: LogFormat,

    /// Default tracing filter, used when RUST_LOG is unset
    pub log_filter: String,

    pub scan: ScanConfig,
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: '{}'", key, value)),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = ScanConfig::default();

        let database_url = lookup("DATABASE_PATH")
            .or_else(|| lookup("DATABASE_URL"))
            .unwrap_or_else(|| "./data/librarian.db".to_string());

        let log_format = match lookup("LOG_FORMAT") {
            Some(value) => value.parse().context("Invalid LOG_FORMAT")?,
            None => LogFormat::default(),
        };

        let scan = ScanConfig {
            max_concurrent_walkers: parse_or(
                &lookup,
                "SCAN_MAX_CONCURRENT_WALKERS",
                defaults.max_concurrent_walkers,
            )?,
            max_concurrent_scans: parse_or(
                &lookup,
                "SCAN_MAX_CONCURRENT_SCANS",
                defaults.max_concurrent_scans,
            )?,
            queue_capacity: parse_or(&lookup, "SCAN_QUEUE_CAPACITY", defaults.queue_capacity)?,
            result_batch_size: parse_or(
                &lookup,
                "SCAN_RESULT_BATCH_SIZE",
                defaults.result_batch_size,
            )?,
            progress_interval: parse_or(
                &lookup,
                "SCAN_PROGRESS_INTERVAL",
                defaults.progress_interval,
            )?,
            read_buffer_bytes: parse_or(
                &lookup,
                "SCAN_READ_BUFFER_BYTES",
                defaults.read_buffer_bytes,
            )?,
            auto_scan_cron: lookup("SCAN_AUTO_CRON").unwrap_or(defaults.auto_scan_cron),
            event_channel_capacity: parse_or(
                &lookup,
                "SCAN_EVENT_CHANNEL_CAPACITY",
                defaults.event_channel_capacity,
            )?,
        };

        if scan.max_concurrent_walkers == 0 || scan.max_concurrent_scans == 0 {
            anyhow::bail!("SCAN_MAX_CONCURRENT_WALKERS and SCAN_MAX_CONCURRENT_SCANS must be at least 1");
        }
        if scan.result_batch_size == 0 || scan.progress_interval == 0 {
            anyhow::bail!("SCAN_RESULT_BATCH_SIZE and SCAN_PROGRESS_INTERVAL must be at least 1");
        }
        if scan.queue_capacity == 0 || scan.event_channel_capacity == 0 {
            anyhow::bail!("SCAN_QUEUE_CAPACITY and SCAN_EVENT_CHANNEL_CAPACITY must be at least 1");
        }

        Ok(Self {
            database_url,
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 5)?,
            log_format,
            log_filter: lookup("RUST_LOG")
                .unwrap_or_else(|| "librarian_scanner=info".to_string()),
            scan,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.database_url, "./data/librarian.db");
        assert_eq!(config.database_max_connections, 5);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.scan.max_concurrent_walkers, 4);
        assert_eq!(config.scan.read_buffer_bytes, 65_536);
        assert_eq!(config.scan.auto_scan_cron, "0 0 * * * *");
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_PATH", "/var/lib/librarian.db"),
            ("LOG_FORMAT", "JSON"),
            ("SCAN_MAX_CONCURRENT_WALKERS", "8"),
            ("SCAN_RESULT_BATCH_SIZE", " 64 "),
        ]))
        .unwrap();
        assert_eq!(config.database_url, "/var/lib/librarian.db");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.scan.max_concurrent_walkers, 8);
        assert_eq!(config.scan.result_batch_size, 64);
    }

    #[test]
    fn test_invalid_numbers_are_errors() {
        assert!(Config::from_lookup(lookup(&[("SCAN_PROGRESS_INTERVAL", "often")])).is_err());
        assert!(Config::from_lookup(lookup(&[("SCAN_MAX_CONCURRENT_WALKERS", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("LOG_FORMAT", "xml")])).is_err());
    }
}
