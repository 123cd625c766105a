//! Per-target advisory locking, usable across cooperating processes that
//! share a repository.
//!
//! Keyed by the target's stable id rather than its path, so two different
//! [`crate::LocalPath`]s that happen to canonicalize to the same file still
//! contend on the same lock.

use crate::redux_dir;
use rustix::fd::AsFd;
use rustix::fs::{flock, FlockOperation};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::trace;

static LOCKS_DIR: LazyLock<PathBuf> = LazyLock::new(|| {
    let path = redux_dir().join("locks");
    std::fs::create_dir_all(&path).unwrap();
    path
});

fn lock_path(id: u64) -> PathBuf {
    LOCKS_DIR.join(format!("{id:016x}.lock"))
}

/// An advisory exclusive lock on a single target id.
///
/// `owned` tracks whether *this* handle currently holds the lock; dropping
/// a held lock releases it, so every exit path of a `BuildJob` releases its
/// lock even on panic, in addition to the explicit `unlock()` call the core
/// spec requires.
pub struct Lock {
    id: u64,
    file: File,
    pub owned: bool,
}

impl Lock {
    pub fn new(id: u64) -> std::io::Result<Lock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(lock_path(id))?;
        Ok(Lock {
            id,
            file,
            owned: false,
        })
    }

    /// Non-blocking. Returns whether the lock is now held.
    pub fn trylock(&mut self) -> std::io::Result<bool> {
        if self.owned {
            return Ok(true);
        }
        match flock(self.file.as_fd(), FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => {
                self.owned = true;
                trace!(id = self.id, "lock acquired");
                Ok(true)
            }
            Err(rustix::io::Errno::WOULDBLOCK) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Blocks until the lock is held.
    pub fn waitlock(&mut self) -> std::io::Result<()> {
        if self.owned {
            return Ok(());
        }
        flock(self.file.as_fd(), FlockOperation::LockExclusive)?;
        self.owned = true;
        trace!(id = self.id, "lock acquired (after waiting)");
        Ok(())
    }

    pub fn unlock(&mut self) {
        if !self.owned {
            return;
        }
        let _ = flock(self.file.as_fd(), FlockOperation::Unlock);
        self.owned = false;
        trace!(id = self.id, "lock released");
    }

    /// Assume ownership of the lock without taking it: used by the
    /// `redo-unlocked` re-entrant path, which runs while its parent still
    /// holds the real lock.
    pub fn assume_owned(&mut self) {
        self.owned = true;
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // redux_dir() resolves via a process-wide LazyLock tied to a discovered
    // git repo, so these tests share one temp repo and serialize on it.
    static REPO_GUARD: Mutex<()> = Mutex::new(());

    fn with_repo<T>(f: impl FnOnce() -> T) -> T {
        let _g = REPO_GUARD.lock().unwrap();
        f()
    }

    #[test]
    fn trylock_then_contend() {
        with_repo(|| {
            let id = 42;
            let mut a = Lock::new(id).unwrap();
            let mut b = Lock::new(id).unwrap();
            assert!(a.trylock().unwrap());
            assert!(!b.trylock().unwrap(), "b should not acquire a's lock");
            a.unlock();
            assert!(b.trylock().unwrap());
        });
    }

    #[test]
    fn drop_releases() {
        with_repo(|| {
            let id = 43;
            {
                let mut a = Lock::new(id).unwrap();
                assert!(a.trylock().unwrap());
            }
            let mut b = Lock::new(id).unwrap();
            assert!(b.trylock().unwrap());
        });
    }
}
