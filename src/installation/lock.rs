//! Exclusive lock on an installation target.
//!
//! Advisory `flock` on `<target>/.lock`, polled until a timeout. Released
//! when the guard is dropped.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {timeout:?} waiting for lock on {path}")]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type LockResult<T> = Result<T, LockError>;

/// Held for the duration of an install against one target.
#[derive(Debug)]
pub struct TargetLock {
    lock_path: PathBuf,
    lock_file: File,
}

impl TargetLock {
    const LOCK_FILENAME: &'static str = ".lock";
    const POLL_INTERVAL: Duration = Duration::from_millis(50);
    const WARN_AFTER: Duration = Duration::from_millis(500);

    /// Lock `target_dir`, creating it if needed. Waits up to `timeout`.
    pub fn acquire(target_dir: &Path, timeout: Duration) -> LockResult<Self> {
        fs::create_dir_all(target_dir)?;

        let lock_path = target_dir.join(Self::LOCK_FILENAME);
        let start = Instant::now();
        let mut warned = false;

        loop {
            match try_lock(&lock_path) {
                Ok(lock_file) => {
                    if warned {
                        info!(
                            path = %lock_path.display(),
                            waited = ?start.elapsed(),
                            "target lock acquired after contention"
                        );
                    }
                    return Ok(Self {
                        lock_path,
                        lock_file,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !warned && start.elapsed() > Self::WARN_AFTER {
                        warn!(path = %lock_path.display(), "target is locked by another install, waiting");
                        warned = true;
                    }
                }
                Err(e) => return Err(e.into()),
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    path: lock_path,
                    timeout,
                });
            }
            std::thread::sleep(Self::POLL_INTERVAL);
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

#[cfg(unix)]
fn try_lock(lock_path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o644)
        .open(lock_path)?;

    // SAFETY: the descriptor is owned by `file` and open for the whole call.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(file);
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn try_lock(lock_path: &Path) -> io::Result<File> {
    match OpenOptions::new().write(true).create_new(true).open(lock_path) {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
        }
        Err(e) => Err(e),
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: the descriptor is still owned by `lock_file`.
            unsafe {
                libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_creates_target() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("target");

        let lock = TargetLock::acquire(&target, Duration::from_secs(1)).unwrap();
        assert!(lock.path().exists());
        assert_eq!(lock.path(), target.join(".lock"));
    }

    #[test]
    fn test_second_lock_times_out() {
        let temp = TempDir::new().unwrap();
        let _held = TargetLock::acquire(temp.path(), Duration::from_secs(1)).unwrap();

        let start = Instant::now();
        let result = TargetLock::acquire(temp.path(), Duration::from_millis(200));

        assert!(matches!(result, Err(LockError::Timeout { .. })));
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_released_on_drop() {
        let temp = TempDir::new().unwrap();
        {
            let _lock = TargetLock::acquire(temp.path(), Duration::from_secs(1)).unwrap();
        }
        TargetLock::acquire(temp.path(), Duration::from_millis(100)).unwrap();
    }
}
