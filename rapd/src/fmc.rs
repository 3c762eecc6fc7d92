//! File metadata cache.
//!
//! Staging and deps validation go through a digest/mtime cache rather than
//! hashing files repeatedly. The cache is shared across actions and must be
//! thread-safe.

use rap_common::Digest;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;
use thiserror::Error;

/// Metadata for one path. `err` records a stat/digest failure so that
/// callers can skip the entry without re-statting.
#[derive(Debug, Clone, Default)]
pub struct FileMetadata {
    pub digest: Option<Digest>,
    pub mtime: Option<SystemTime>,
    pub is_directory: bool,
    pub err: Option<String>,
}

impl FileMetadata {
    /// Compute metadata directly from disk.
    pub fn from_disk(path: &Path) -> Self {
        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                return Self {
                    err: Some(e.to_string()),
                    ..Self::default()
                }
            }
        };
        if meta.is_dir() {
            return Self {
                is_directory: true,
                mtime: meta.modified().ok(),
                ..Self::default()
            };
        }
        match Digest::of_file(path) {
            Ok(digest) => Self {
                digest: Some(digest),
                mtime: meta.modified().ok(),
                is_directory: false,
                err: None,
            },
            Err(e) => Self {
                mtime: meta.modified().ok(),
                err: Some(e.to_string()),
                ..Self::default()
            },
        }
    }
}

#[derive(Debug, Error)]
#[error("file metadata cache: {0}")]
pub struct FmcError(pub String);

/// Thread-safe digest/mtime cache keyed by absolute path.
pub trait FileMetadataCache: Send + Sync {
    /// Metadata for `path`, computed and cached on miss.
    fn get(&self, path: &Path) -> FileMetadata;
    fn update(&self, path: &Path, md: FileMetadata) -> Result<(), FmcError>;
    fn delete(&self, path: &Path) -> Result<(), FmcError>;
}

/// In-memory implementation backed by the local filesystem.
#[derive(Debug, Default)]
pub struct MemoryFileMetadataCache {
    entries: RwLock<HashMap<PathBuf, FileMetadata>>,
}

impl MemoryFileMetadataCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileMetadataCache for MemoryFileMetadataCache {
    fn get(&self, path: &Path) -> FileMetadata {
        if let Some(md) = self.entries.read().unwrap().get(path) {
            return md.clone();
        }
        let md = FileMetadata::from_disk(path);
        self.entries
            .write()
            .unwrap()
            .insert(path.to_path_buf(), md.clone());
        md
    }

    fn update(&self, path: &Path, md: FileMetadata) -> Result<(), FmcError> {
        self.entries
            .write()
            .unwrap()
            .insert(path.to_path_buf(), md);
        Ok(())
    }

    fn delete(&self, path: &Path) -> Result<(), FmcError> {
        self.entries.write().unwrap().remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_get_computes_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.o");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"object")
            .unwrap();

        let fmc = MemoryFileMetadataCache::new();
        let md = fmc.get(&path);
        assert_eq!(md.digest, Some(Digest::of_bytes(b"object")));
        assert!(md.err.is_none());

        // Cached: a content change is not observed until the entry is
        // deleted.
        std::fs::write(&path, b"changed").unwrap();
        assert_eq!(fmc.get(&path).digest, Some(Digest::of_bytes(b"object")));
        fmc.delete(&path).unwrap();
        assert_eq!(fmc.get(&path).digest, Some(Digest::of_bytes(b"changed")));
    }

    #[test]
    fn test_get_missing_file_records_error() {
        let fmc = MemoryFileMetadataCache::new();
        let md = fmc.get(Path::new("/nonexistent/main.o"));
        assert!(md.err.is_some());
        assert!(md.digest.is_none());
    }

    #[test]
    fn test_get_directory() {
        let dir = tempfile::tempdir().unwrap();
        let fmc = MemoryFileMetadataCache::new();
        let md = fmc.get(dir.path());
        assert!(md.is_directory);
        assert!(md.err.is_none());
    }

    #[test]
    fn test_update_overrides_disk_state() {
        let fmc = MemoryFileMetadataCache::new();
        let path = Path::new("/virtual/out.o");
        fmc.update(
            path,
            FileMetadata {
                digest: Some(Digest::of_bytes(b"known")),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(fmc.get(path).digest, Some(Digest::of_bytes(b"known")));
    }
}
