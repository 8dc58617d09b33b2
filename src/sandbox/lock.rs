//! Blocking advisory locks on sentinel files.
//!
//! Each lock is an exclusive `flock(2)` on a file opened for append. The open
//! descriptor is the only proof of ownership: dropping a [`FileLock`] closes it,
//! which releases the lock, and then the sentinel is unlinked best-effort.
//!
//! Acquisition blocks without a timeout. Two invocations against the same root
//! therefore simply queue behind each other.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, instrument, trace, warn};

use crate::error::LockError;

/// The locks a build root uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKind {
    /// Serializes every mutating operation on one root.
    Buildroot,
    /// Guards the shared installer cache.
    YumCache,
    /// Guards the root cache tarball.
    RootCache,
}

impl std::fmt::Display for LockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buildroot => write!(f, "buildroot"),
            Self::YumCache => write!(f, "yumcache"),
            Self::RootCache => write!(f, "rootcache"),
        }
    }
}

/// An acquired lock.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    lock: Option<Flock<File>>,
}

impl FileLock {
    /// Opens `path` (creating it and its parent) and blocks until the lock is granted.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Open` if the file cannot be opened and
    /// `LockError::Acquire` if `flock` fails.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| LockError::Open {
                path: path.to_path_buf(),
                source: e,
            })?;
        }

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| LockError::Open {
                path: path.to_path_buf(),
                source: e,
            })?;

        trace!("Waiting for lock");
        let lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, e)| {
            LockError::Acquire {
                path: path.to_path_buf(),
                source: e,
            }
        })?;
        debug!("Lock acquired");

        Ok(Self {
            path: path.to_path_buf(),
            lock: Some(lock),
        })
    }

    /// Tries to take the lock without blocking.
    ///
    /// Returns `Ok(None)` if another holder has it.
    ///
    /// # Errors
    ///
    /// Same as [`FileLock::acquire`], except contention is not an error.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, LockError> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| LockError::Open {
                path: path.to_path_buf(),
                source: e,
            })?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(Self {
                path: path.to_path_buf(),
                lock: Some(lock),
            })),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, e)) => Err(LockError::Acquire {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Sentinel path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the lock and removes the sentinel.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(lock) = self.lock.take() {
            drop(lock);
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove lock file");
                }
            }
            debug!(path = %self.path.display(), "Lock released");
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// The locks held by one build root, at most one per kind.
#[derive(Debug, Default)]
pub struct LockTable {
    held: BTreeMap<LockKind, FileLock>,
}

impl LockTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `kind` at `path`; a no-op if already held.
    ///
    /// # Errors
    ///
    /// Returns `LockError` if the lock cannot be taken.
    pub fn acquire(&mut self, kind: LockKind, path: &Path) -> Result<(), LockError> {
        if self.held.contains_key(&kind) {
            trace!(%kind, "Lock already held");
            return Ok(());
        }
        debug!(%kind, path = %path.display(), "Acquiring lock");
        let lock = FileLock::acquire(path)?;
        self.held.insert(kind, lock);
        Ok(())
    }

    /// Releases `kind` if held.
    pub fn release(&mut self, kind: LockKind) {
        if let Some(lock) = self.held.remove(&kind) {
            lock.release();
        }
    }

    /// Returns true if `kind` is held.
    #[must_use]
    pub fn is_held(&self, kind: LockKind) -> bool {
        self.held.contains_key(&kind)
    }

    /// Kinds currently held.
    #[must_use]
    pub fn held(&self) -> Vec<LockKind> {
        self.held.keys().copied().collect()
    }

    /// Releases every lock, most specific first.
    pub fn release_all(&mut self) {
        while let Some((_, lock)) = self.held.pop_last() {
            lock.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    /// A sentinel path whose parent does not exist yet.
    fn lock_path(tmp: &TempDir) -> PathBuf {
        tmp.path().join("run").join("buildroot.lock")
    }

    #[test]
    fn test_acquire_creates_and_release_removes_sentinel() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = lock_path(&tmp);
        let lock = FileLock::acquire(&path).expect("acquire");
        assert!(path.exists());
        lock.release();
        assert!(!path.exists());

        let again = FileLock::acquire(&path).expect("re-acquire");
        again.release();
    }

    #[test]
    fn test_try_acquire_sees_contention() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = lock_path(&tmp);
        let held = FileLock::acquire(&path).expect("acquire");
        let second = FileLock::try_acquire(&path).expect("try");
        assert!(second.is_none());
        drop(held);
    }

    #[test]
    fn test_second_acquire_blocks_until_release() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = lock_path(&tmp);
        let first = FileLock::acquire(&path).expect("acquire");

        let (tx, rx) = mpsc::channel();
        let waiter_path = path.clone();
        let waiter = thread::spawn(move || {
            let lock = FileLock::acquire(&waiter_path).expect("acquire in thread");
            tx.send(()).expect("send");
            lock.release();
        });

        assert!(
            rx.recv_timeout(Duration::from_millis(200)).is_err(),
            "second acquire must block while the first lock is held"
        );
        drop(first);
        rx.recv_timeout(Duration::from_secs(5))
            .expect("second acquire proceeds after release");
        waiter.join().expect("join");
    }

    #[test]
    fn test_table_reacquire_is_noop() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = lock_path(&tmp);
        let mut table = LockTable::new();
        table.acquire(LockKind::Buildroot, &path).expect("acquire");
        table.acquire(LockKind::Buildroot, &path).expect("no deadlock");
        assert!(table.is_held(LockKind::Buildroot));
        table.release(LockKind::Buildroot);
        assert!(!table.is_held(LockKind::Buildroot));
        assert!(!path.exists());
    }

    #[test]
    fn test_release_all() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let dir = tmp.path();
        let mut table = LockTable::new();
        table
            .acquire(LockKind::Buildroot, &dir.join("buildroot.lock"))
            .expect("acquire");
        table
            .acquire(LockKind::YumCache, &dir.join("yumcache.lock"))
            .expect("acquire");
        assert_eq!(table.held(), vec![LockKind::Buildroot, LockKind::YumCache]);
        table.release_all();
        assert!(table.held().is_empty());
    }
}
