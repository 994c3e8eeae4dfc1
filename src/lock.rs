//! Session lock
//!
//! At most one update session per device. The lock is an advisory `flock`
//! on a well-known file, taken non-blocking: a second session fails
//! immediately with `SessionBusy` instead of queueing behind the first.
//!
//! The lock is released when [`SessionLock`] is dropped, and by the kernel
//! if the process dies.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("another update session holds {0}")]
    Busy(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Exclusive lock held for the duration of one session
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    #[allow(dead_code)]
    file: File,
}

impl SessionLock {
    /// Take the lock without waiting.
    ///
    /// Creates the parent directory and lock file if they don't exist, and
    /// records the holder's pid in the file.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = match try_lock_exclusive(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(LockError::Busy(path.to_path_buf()));
            }
            Err(e) => return Err(LockError::Io(e)),
        };

        // Only the holder truncates, so a contender never clobbers the pid.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!(path = %path.display(), "session lock acquired");

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        // flock is released when the descriptor closes
        debug!(path = %self.path.display(), "session lock released");
    }
}

#[cfg(unix)]
fn try_lock_exclusive(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o644)
        .open(path)?;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };

    if result == 0 {
        Ok(file)
    } else {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
        } else {
            Err(err)
        }
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(path: &Path) -> io::Result<File> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_creates_parent_and_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run").join("updater.lock");

        let lock = SessionLock::acquire(&path).unwrap();
        assert!(path.exists());
        assert_eq!(lock.path(), path);

        let pid: u32 = fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(pid, std::process::id());
    }

    #[test]
    #[cfg(unix)]
    fn test_second_acquire_is_busy() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("updater.lock");

        let _held = SessionLock::acquire(&path).unwrap();
        let err = SessionLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::Busy(p) if p == path));
    }

    #[test]
    #[cfg(unix)]
    fn test_released_on_drop() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("updater.lock");

        drop(SessionLock::acquire(&path).unwrap());
        SessionLock::acquire(&path).unwrap();
    }
}
