// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Advisory file lock around the snapshot-compute-commit critical section.
//!
//! `flock` exclusion is per open file description, so one lock file
//! serializes competing processes and competing threads alike. The lock is
//! released when the [`LockFile`] drops.

use std::fs;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use nix::errno::Errno;
use nix::fcntl::Flock;
use nix::fcntl::FlockArg;

pub struct LockFile {
    path: PathBuf,
    _lock: Flock<File>,
}

impl LockFile {
    /// Take the exclusive lock, blocking until the current holder releases
    /// it. The lock file is created if missing.
    pub fn acquire(path: &Path) -> Result<LockFile> {
        match Flock::lock(open_lock_file(path)?, FlockArg::LockExclusive) {
            Ok(lock) => {
                debug!("Acquired exclusive lock on {}", path.display());
                Ok(LockFile {
                    path: path.to_path_buf(),
                    _lock: lock,
                })
            }
            Err((_, errno)) => bail!("Failed to lock {}: {}", path.display(), errno),
        }
    }

    /// Take the exclusive lock without blocking. Returns `None` when another
    /// holder has it.
    pub fn try_acquire(path: &Path) -> Result<Option<LockFile>> {
        match Flock::lock(open_lock_file(path)?, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(LockFile {
                path: path.to_path_buf(),
                _lock: lock,
            })),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => bail!("Failed to lock {}: {}", path.display(), errno),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        debug!("Releasing lock on {}", self.path.display());
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("waypool.lock");
        let lock = LockFile::acquire(&path).unwrap();
        assert!(path.exists());
        drop(lock);
        // Free again after drop.
        let again = LockFile::try_acquire(&path).unwrap();
        assert!(again.is_some());
    }

    #[test]
    fn test_try_acquire_contended() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("waypool.lock");
        let held = LockFile::acquire(&path).unwrap();
        // A second open file description cannot get the lock.
        assert!(LockFile::try_acquire(&path).unwrap().is_none());
        drop(held);
        assert!(LockFile::try_acquire(&path).unwrap().is_some());
    }
}
