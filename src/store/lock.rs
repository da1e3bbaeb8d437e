//! Exclusive lock on a cache directory.
//!
//! Exactly one chancacher may own a cache directory at a time. Ownership is
//! an advisory `flock` on `<dir>/lock`, taken without waiting: a second
//! owner fails immediately instead of queueing behind the first.
//!
//! The lock is released when the [`DirLock`] is dropped.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::CACHE_FILE_PERM;

/// Lock result type
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock already held: {0}")]
    Held(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Advisory lock over a cache directory.
#[derive(Debug)]
pub struct DirLock {
    /// Path to the lock file
    lock_path: PathBuf,
    /// The opened lock file (held for the lock duration)
    #[cfg_attr(not(unix), allow(dead_code))]
    lock_file: File,
}

impl DirLock {
    /// Lock file name
    pub const LOCK_FILENAME: &'static str = "lock";

    /// Take the lock on `dir`, failing at once if someone else holds it.
    ///
    /// The directory must already exist.
    pub fn try_acquire(dir: &Path) -> LockResult<Self> {
        let lock_path = dir.join(Self::LOCK_FILENAME);
        match Self::try_acquire_exclusive(&lock_path) {
            Ok(lock_file) => Ok(Self {
                lock_path,
                lock_file,
            }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(LockError::Held(lock_path)),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Report whether another owner currently holds the lock on `dir`.
    ///
    /// Briefly takes the lock when it is free.
    pub fn is_held(dir: &Path) -> io::Result<bool> {
        if !dir.join(Self::LOCK_FILENAME).exists() {
            return Ok(false);
        }
        match Self::try_acquire(dir) {
            Ok(_lock) => Ok(false),
            Err(LockError::Held(_)) => Ok(true),
            Err(LockError::Io(e)) => Err(e),
        }
    }

    #[cfg(unix)]
    fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
        use std::os::unix::fs::OpenOptionsExt;
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(CACHE_FILE_PERM)
            .open(lock_path)?;

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

    /// Without flock, the lock is the existence of the lock file.
    #[cfg(not(unix))]
    fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
        let _ = CACHE_FILE_PERM;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            }
            Err(e) => Err(e),
        }
    }

    /// Get the lock file path.
    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_acquire_basic() {
        let temp_dir = TempDir::new().unwrap();

        let lock = DirLock::try_acquire(temp_dir.path()).unwrap();

        assert!(lock.path().exists());
        assert_eq!(lock.path().file_name().unwrap(), "lock");
    }

    #[test]
    fn test_lock_released_on_drop() {
        let temp_dir = TempDir::new().unwrap();

        {
            let _lock = DirLock::try_acquire(temp_dir.path()).unwrap();
        }

        let _lock2 = DirLock::try_acquire(temp_dir.path()).unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn test_second_acquire_fails_without_waiting() {
        let temp_dir = TempDir::new().unwrap();

        let lock1 = DirLock::try_acquire(temp_dir.path()).unwrap();
        let second = DirLock::try_acquire(temp_dir.path());
        assert!(matches!(second, Err(LockError::Held(_))));

        drop(lock1);
        assert!(DirLock::try_acquire(temp_dir.path()).is_ok());
    }

    #[test]
    #[cfg(unix)]
    fn test_is_held() {
        let temp_dir = TempDir::new().unwrap();
        assert!(!DirLock::is_held(temp_dir.path()).unwrap());

        let lock = DirLock::try_acquire(temp_dir.path()).unwrap();
        assert!(DirLock::is_held(temp_dir.path()).unwrap());

        drop(lock);
        assert!(!DirLock::is_held(temp_dir.path()).unwrap());
    }
}
