//! Minimal CLI parsing for startup scans.

use std::env;

use anyhow::{Context, Result};
use uuid::Uuid;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CliOptions {
    /// Libraries to scan right after startup
    pub scan_libraries: Vec<Uuid>,
    /// Skip the auto-scan scheduler
    pub no_scheduler: bool,
}

impl CliOptions {
    pub fn from_args() -> Result<Self> {
        Self::parse(env::args().skip(1))
    }

    pub fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut options = CliOptions::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--scan-library" => {
                    let value = args.next().context("--scan-library needs a library id")?;
                    options.scan_libraries.push(parse_library_id(&value)?);
                }
                _ if arg.starts_with("--scan-library=") => {
                    if let Some(value) = arg.split_once('=').map(|(_, v)| v) {
                        options.scan_libraries.push(parse_library_id(value)?);
                    }
                }
                "--no-scheduler" => options.no_scheduler = true,
                _ => {}
            }
        }
        Ok(options)
    }
}

fn parse_library_id(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).with_context(|| format!("Invalid library id '{}'", value))
}
