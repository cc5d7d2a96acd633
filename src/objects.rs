//! Content-addressed raw-event object store.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::{anyhow, Result};
use tracing::warn;

/// File-backed blob store rooted at `root`.
///
/// Blobs are write-once per id; writes of an already stored id are no-ops,
/// so repeated delivery of the same event never contends.
#[derive(Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    /// Create a store rooted at `root`.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Compute the blob path for an id: `objects/<id[0:3]>/<id[3:]>`.
    fn object_path(&self, id: &str) -> Result<PathBuf> {
        if id.len() < 4 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(anyhow!("invalid object id: {}", id));
        }
        Ok(self.root.join("objects").join(&id[..3]).join(&id[3..]))
    }

    /// Write a blob if it is not already present.
    pub fn write(&self, id: &str, raw: &[u8]) -> Result<()> {
        let path = self.object_path(id)?;
        if path.exists() {
            return Ok(());
        }
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)?;
        // Write atomically so readers never observe a partial blob.
        let tmp = tempfile::NamedTempFile::new_in(&parent)?;
        fs::write(tmp.path(), raw)?;
        tmp.persist(&path)?;
        Ok(())
    }

    /// Read a blob by id.
    pub fn read(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.object_path(id)?;
        Ok(fs::read(path)?)
    }

    /// Remove blobs whose modification time is older than `max_age`.
    pub fn gc(&self, max_age: Duration) -> Result<usize> {
        let objects = self.root.join("objects");
        if !objects.exists() {
            return Ok(0);
        }
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in walkdir::WalkDir::new(&objects) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %entry.path().display(), err = %e, "skipping unreadable blob");
                    continue;
                }
            };
            let mtime = match meta.modified() {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %entry.path().display(), err = %e, "skipping unreadable blob");
                    continue;
                }
            };
            if now.duration_since(mtime).unwrap_or_default() > max_age {
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!(path = %entry.path().display(), err = %e, "failed to remove blob");
                } else {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_then_read_is_identical() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::new(dir.path().to_path_buf());
        let id = "abc123";
        store.write(id, b"{\"id\":\"abc123\"}").unwrap();
        assert_eq!(store.read(id).unwrap(), b"{\"id\":\"abc123\"}");
        assert!(dir.path().join("objects/abc/123").exists());
    }

    #[test]
    fn write_is_once_per_id() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::new(dir.path().to_path_buf());
        store.write("abcd", b"first").unwrap();
        store.write("abcd", b"second").unwrap();
        assert_eq!(store.read("abcd").unwrap(), b"first");
    }

    #[test]
    fn rejects_invalid_ids() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::new(dir.path().to_path_buf());
        assert!(store.write("ab", b"short").is_err());
        assert!(store.write("zzzz", b"not hex").is_err());
        assert!(store.read("..").is_err());
    }

    #[test]
    fn read_missing_blob_errors() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::new(dir.path().to_path_buf());
        assert!(store.read("dead").is_err());
    }

    #[test]
    fn gc_removes_only_old_files() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::new(dir.path().to_path_buf());
        store.write("aaaa", b"old").unwrap();
        store.write("bbbb", b"new").unwrap();
        // Nothing is older than an hour yet.
        assert_eq!(store.gc(Duration::from_secs(3600)).unwrap(), 0);
        // Everything is older than zero seconds.
        assert_eq!(store.gc(Duration::from_secs(0)).unwrap(), 2);
        assert!(store.read("aaaa").is_err());
    }

    #[test]
    fn gc_on_empty_store_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::new(dir.path().to_path_buf());
        assert_eq!(store.gc(Duration::from_secs(0)).unwrap(), 0);
    }
}
