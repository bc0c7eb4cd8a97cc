//! Storage seam for the backup store.
//!
//! Paths handed to a [`BlobStore`] are relative to its root. The filesystem
//! implementation writes through [`crate::persist`]; tests substitute stores
//! that corrupt or drop data.

use std::io;
use std::path::{Path, PathBuf};

use crate::persist;

pub trait BlobStore: Send + Sync {
    /// Replace the blob at `rel` in one step; never leaves a partial file.
    fn write_atomic(&self, rel: &Path, data: &[u8]) -> io::Result<()>;

    /// Write key material. Defaults to a plain atomic write.
    fn write_private(&self, rel: &Path, data: &[u8]) -> io::Result<()> {
        self.write_atomic(rel, data)
    }

    fn read(&self, rel: &Path) -> io::Result<Vec<u8>>;

    fn exists(&self, rel: &Path) -> bool;

    /// Remove a blob. Removing something that is already gone succeeds.
    fn remove(&self, rel: &Path) -> io::Result<()>;

    /// Location used in error messages and logs.
    fn locate(&self, rel: &Path) -> PathBuf;
}

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BlobStore for FsBlobStore {
    fn write_atomic(&self, rel: &Path, data: &[u8]) -> io::Result<()> {
        persist::write_atomic(&self.root.join(rel), data)
    }

    fn write_private(&self, rel: &Path, data: &[u8]) -> io::Result<()> {
        persist::write_private(&self.root.join(rel), data)
    }

    fn read(&self, rel: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(self.root.join(rel))
    }

    fn exists(&self, rel: &Path) -> bool {
        self.root.join(rel).is_file()
    }

    fn remove(&self, rel: &Path) -> io::Result<()> {
        match std::fs::remove_file(self.root.join(rel)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn locate(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_blob_store_basic_ops() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let rel = Path::new("data/db/2026-01-01/x.bak");

        assert!(!store.exists(rel));
        store.write_atomic(rel, b"abc").unwrap();
        assert!(store.exists(rel));
        assert_eq!(store.read(rel).unwrap(), b"abc");
        assert_eq!(store.locate(rel), dir.path().join(rel));

        store.remove(rel).unwrap();
        store.remove(rel).unwrap();
        assert!(!store.exists(rel));
        assert_eq!(
            store.read(rel).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }
}
