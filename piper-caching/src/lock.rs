//! Cross-process lock around the check-then-lock sequence

use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::errors::{CacheError, CacheResult};

/// Exclusive `flock` on a shared lock file
#[derive(Debug, Clone)]
pub struct CacheLock {
    path: PathBuf,
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct CacheLockGuard {
    _flock: Flock<File>,
}

impl CacheLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block on a worker thread until the lock is ours
    pub async fn acquire(&self) -> CacheResult<CacheLockGuard> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> CacheResult<CacheLockGuard> {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            let flock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
                CacheError::LockError(format!("flock {}: {}", path.display(), errno))
            })?;
            Ok(CacheLockGuard { _flock: flock })
        })
        .await
        .map_err(|e| CacheError::LockError(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let lock = CacheLock::new(dir.path().join("cache.lock"));
        let inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let inside = inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = lock.acquire().await.unwrap();
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
