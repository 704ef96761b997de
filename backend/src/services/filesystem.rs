//! Filesystem access for the scanner
//!
//! The scanner only ever talks to [`FileSystem`], so tests can inject faults
//! (unreadable files, broken directories) without touching real permissions.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;
use walkdir::WalkDir;

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Symlinks, sockets, devices: never followed or hashed
    Other,
}

/// A file or directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    pub path: PathBuf,
    pub kind: EntryKind,
}

impl FileEntry {
    /// Dot-prefixed names are hidden
    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('.')
    }
}

/// Metadata needed to record a scan result
#[derive(Debug, Clone)]
pub struct FileStat {
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub is_file: bool,
}

pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

/// Enumerate / read / exists / stat over abstract paths
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Immediate children of `dir`, sorted by file name. Fails if `dir` cannot be read.
    async fn read_dir(&self, dir: &Path) -> io::Result<Vec<FileEntry>>;

    async fn open(&self, path: &Path) -> io::Result<FileReader>;

    async fn exists(&self, path: &Path) -> bool;

    async fn stat(&self, path: &Path) -> io::Result<FileStat>;
}

/// [`FileSystem`] backed by the local disk
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

fn list_dir_blocking(dir: &Path) -> io::Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            // Depth 0 means the directory itself could not be opened
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        let file_type = entry.file_type();
        let kind = if file_type.is_file() {
            EntryKind::File
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::Other
        };

        entries.push(FileEntry {
            name: entry.file_name().to_string_lossy().to_string(),
            path: entry.into_path(),
            kind,
        });
    }

    Ok(entries)
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn read_dir(&self, dir: &Path) -> io::Result<Vec<FileEntry>> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || list_dir_blocking(&dir))
            .await
            .map_err(io::Error::other)?
    }

    async fn open(&self, path: &Path) -> io::Result<FileReader> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Box::new(file))
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(FileStat {
            size: metadata.len(),
            modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
            is_file: metadata.is_file(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_read_dir_sorted_with_kinds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.mkv"), b"b").unwrap();
        std::fs::write(dir.path().join("a.mkv"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("season 1")).unwrap();
        std::fs::write(dir.path().join(".hidden"), b"h").unwrap();

        let fs = LocalFileSystem::new();
        let entries = fs.read_dir(dir.path()).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".hidden", "a.mkv", "b.mkv", "season 1"]);
        assert!(entries[0].is_hidden());
        assert_eq!(entries[3].kind, EntryKind::Directory);
        assert_eq!(entries[1].kind, EntryKind::File);
    }

    #[tokio::test]
    async fn test_read_dir_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFileSystem::new();
        assert!(fs.read_dir(&dir.path().join("gone")).await.is_err());
        assert!(!fs.exists(&dir.path().join("gone")).await);
    }

    #[tokio::test]
    async fn test_open_and_stat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.mkv");
        std::fs::write(&path, b"12345").unwrap();

        let fs = LocalFileSystem::new();
        let stat = fs.stat(&path).await.unwrap();
        assert_eq!(stat.size, 5);
        assert!(stat.is_file);
        assert!(stat.modified_at.is_some());

        let mut reader = fs.open(&path).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"12345");
    }
}
