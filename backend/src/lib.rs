//! Librarian scanner
//!
//! Background library scanning: walks content locations, fingerprints files,
//! records idempotent scan results and drives each scan through its lifecycle.

pub mod app;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod services;

pub use app::ScanRuntime;
pub use config::Config;
pub use db::Database;
pub use error::{ScanError, StoreError};
