//! Per-path advisory lock files for writers sharing one on-disk store.
//!
//! A lock is a file created with `create_new`; it is removed on drop. Readers
//! never lock. Writers that cannot take a lock within the configured wait
//! proceed unlocked after a warning. A lock file older than the stale age is
//! left over from a writer that died and is broken.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use hc_core::Result;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Held advisory lock; released on drop.
#[derive(Debug)]
pub struct PathLock {
    path: PathBuf,
}

impl PathLock {
    /// Try to take the lock at `path`, polling for up to `wait`. An existing
    /// lock last modified more than `stale_after` ago is removed first.
    ///
    /// Returns `Ok(None)` when the lock stayed held by someone else.
    pub fn acquire(path: &Path, wait: Duration, stale_after: Duration) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let deadline = Instant::now() + wait;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut f) => {
                    // Owner pid, for humans inspecting stale locks.
                    if let Err(e) = writeln!(f, "{}", std::process::id()) {
                        tracing::debug!(lock = %path.display(), "failed to record owner pid: {e}");
                    }
                    return Ok(Some(Self { path: path.to_path_buf() }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if break_if_stale(path, stale_after)? {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(POLL_INTERVAL.min(wait));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Remove the lock at `path` if it is older than `stale_after`. Returns
/// whether the caller should retry immediately.
fn break_if_stale(path: &Path, stale_after: Duration) -> Result<bool> {
    let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(t) => t,
        // Released between our open and the stat.
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    // A clock step backwards reads as a fresh lock.
    let age = modified.elapsed().unwrap_or_default();
    if age <= stale_after {
        return Ok(false);
    }
    let owner = std::fs::read_to_string(path).unwrap_or_default();
    tracing::warn!(
        lock = %path.display(),
        owner = owner.trim(),
        age_s = age.as_secs(),
        "breaking stale lock"
    );
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(lock = %self.path.display(), "failed to release lock: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    const STALE: Duration = Duration::from_secs(60);

    #[test]
    fn exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("lock/sel/ee.lock");

        let first = PathLock::acquire(&p, Duration::ZERO, STALE).unwrap();
        assert!(first.is_some());
        assert!(p.exists());
        assert_eq!(std::fs::read_to_string(&p).unwrap().trim(), std::process::id().to_string());

        let second = PathLock::acquire(&p, Duration::from_millis(30), STALE).unwrap();
        assert!(second.is_none());

        drop(first);
        assert!(!p.exists());
        assert!(PathLock::acquire(&p, Duration::ZERO, STALE).unwrap().is_some());
    }

    #[test]
    fn old_lock_left_by_dead_writer_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("lock/sr/mass.lock");
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(&p, b"4194303\n").unwrap();
        let old = SystemTime::now() - Duration::from_secs(2 * 3600);
        std::fs::File::options().write(true).open(&p).unwrap().set_modified(old).unwrap();

        let lock = PathLock::acquire(&p, Duration::ZERO, STALE).unwrap();
        assert!(lock.is_some());
        assert_eq!(std::fs::read_to_string(&p).unwrap().trim(), std::process::id().to_string());
    }

    #[test]
    fn fresh_foreign_lock_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("lock/sr/mass.lock");
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(&p, b"4194303\n").unwrap();

        assert!(PathLock::acquire(&p, Duration::ZERO, STALE).unwrap().is_none());
        assert!(p.exists());
    }
}
