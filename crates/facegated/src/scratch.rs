//! Per-request scratch space for uploaded images.
//!
//! Each request owns one temporary directory. Every path handed out lives
//! inside it, so releasing the directory releases everything the request
//! allocated. Release happens exactly once: explicitly through
//! [`RequestScratch::release_all`], or on drop for error and panic paths.

use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use uuid::Uuid;

const DIR_PREFIX: &str = "facegate-";

pub struct RequestScratch {
    request_id: Uuid,
    dir: Option<TempDir>,
    allocated: usize,
}

impl RequestScratch {
    /// Create the scratch directory for a new request under `root`.
    pub fn new(root: &Path) -> io::Result<Self> {
        let request_id = Uuid::new_v4();
        let dir = tempfile::Builder::new()
            .prefix(&format!("{DIR_PREFIX}{request_id}-"))
            .tempdir_in(root)?;
        tracing::debug!(%request_id, dir = %dir.path().display(), "scratch allocated");
        Ok(Self {
            request_id,
            dir: Some(dir),
            allocated: 0,
        })
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// A fresh path inside the scratch directory. Never returned twice.
    pub fn allocate(&mut self, label: &str) -> io::Result<PathBuf> {
        let dir = self
            .dir
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "scratch already released"))?;
        let path = dir.path().join(format!("{:02}-{label}", self.allocated));
        self.allocated += 1;
        Ok(path)
    }

    /// Allocate a path and write `bytes` to it.
    pub async fn materialize(&mut self, label: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.allocate(label)?;
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(request_id = %self.request_id, path = %path.display(), len = bytes.len(), "upload written");
        Ok(path)
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Delete the directory and every file allocated in it.
    pub fn release_all(mut self) -> io::Result<()> {
        self.release()
    }

    fn release(&mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => {
                let path = dir.path().to_path_buf();
                dir.close()?;
                tracing::debug!(request_id = %self.request_id, dir = %path.display(), "scratch released");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for RequestScratch {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(request_id = %self.request_id, error = %err, "scratch release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(root: &Path) -> usize {
        std::fs::read_dir(root).unwrap().count()
    }

    #[test]
    fn test_allocations_are_unique() {
        let root = tempfile::tempdir().unwrap();
        let mut scratch = RequestScratch::new(root.path()).unwrap();
        let a = scratch.allocate("image1").unwrap();
        let b = scratch.allocate("image1").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.parent(), b.parent());
        assert_eq!(scratch.allocated(), 2);
    }

    #[tokio::test]
    async fn test_release_all_removes_files() {
        let root = tempfile::tempdir().unwrap();
        let mut scratch = RequestScratch::new(root.path()).unwrap();
        let path = scratch.materialize("image", b"bytes").await.unwrap();
        assert!(path.exists());
        assert_eq!(entries(root.path()), 1);

        scratch.release_all().unwrap();
        assert!(!path.exists());
        assert_eq!(entries(root.path()), 0);
    }

    #[test]
    fn test_drop_releases_on_panic() {
        let root = tempfile::tempdir().unwrap();
        let root_path = root.path().to_path_buf();
        let result = std::panic::catch_unwind(move || {
            let mut scratch = RequestScratch::new(&root_path).unwrap();
            let path = scratch.allocate("image").unwrap();
            std::fs::write(&path, b"x").unwrap();
            panic!("handler blew up");
        });
        assert!(result.is_err());
        assert_eq!(entries(root.path()), 0);
    }

    #[test]
    fn test_distinct_requests_get_distinct_dirs() {
        let root = tempfile::tempdir().unwrap();
        let a = RequestScratch::new(root.path()).unwrap();
        let b = RequestScratch::new(root.path()).unwrap();
        assert_ne!(a.request_id(), b.request_id());
        assert_eq!(entries(root.path()), 2);
        drop(a);
        drop(b);
        assert_eq!(entries(root.path()), 0);
    }
}
