//! Cross-process advisory lock built on atomic directory creation.
//!
//! `mkdir` either creates the directory or fails, on every filesystem the
//! workers share, so the directory's existence is the lock.

use crate::error::{FuzzError, FuzzResult};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Interval between acquisition attempts.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Held lock; the directory is removed on drop.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    /// Busy-wait until the lock directory can be created or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`FuzzError::LockTimeout`] when the deadline passes and
    /// [`FuzzError::Io`] for failures other than "already exists".
    pub fn acquire(path: &Path, timeout: Duration) -> FuzzResult<Self> {
        Self::acquire_with_interval(path, timeout, LOCK_POLL_INTERVAL)
    }

    /// Like [`DirLock::acquire`] with a custom poll interval.
    ///
    /// # Errors
    ///
    /// See [`DirLock::acquire`].
    pub fn acquire_with_interval(
        path: &Path,
        timeout: Duration,
        interval: Duration,
    ) -> FuzzResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| FuzzError::io(parent, &e))?;
        }

        let start = Instant::now();
        loop {
            match std::fs::create_dir(path) {
                Ok(()) => {
                    tracing::debug!(lock = %path.display(), "lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if start.elapsed() >= timeout {
                        return Err(FuzzError::LockTimeout {
                            path: path.to_path_buf(),
                            timeout,
                        });
                    }
                    std::thread::sleep(interval);
                }
                Err(e) => return Err(FuzzError::io(path, &e)),
            }
        }
    }

    /// Lock directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        match std::fs::remove_dir(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(lock = %self.path.display(), error = %e, "failed to release lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("global.lock");

        {
            let lock = DirLock::acquire(&path, Duration::from_secs(1)).unwrap();
            assert!(lock.path().is_dir());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_contended_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("global.lock");
        let _held = DirLock::acquire(&path, Duration::from_secs(1)).unwrap();

        let err = DirLock::acquire_with_interval(
            &path,
            Duration::from_millis(30),
            Duration::from_millis(10),
        )
        .unwrap_err();
        assert!(matches!(err, FuzzError::LockTimeout { .. }));
    }

    #[test]
    fn test_lock_released_for_next_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("global.lock");

        drop(DirLock::acquire(&path, Duration::from_secs(1)).unwrap());
        let again = DirLock::acquire_with_interval(
            &path,
            Duration::from_millis(50),
            Duration::from_millis(10),
        );
        assert!(again.is_ok());
    }
}
