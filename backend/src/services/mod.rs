//! Scanner services

pub mod filesystem;
pub mod job_queue;
pub mod scan;

pub use filesystem::{FileSystem, LocalFileSystem};
pub use job_queue::{JobQueueConfig, WorkQueue};
