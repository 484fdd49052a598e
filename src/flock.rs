use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Advisory lock held on the environment's lock file
#[derive(Debug)]
pub(crate) struct FileLock {
    _file: File,
}

impl FileLock {
    /// Creates the lock file if needed and locks it without blocking.
    pub(crate) fn try_lock<P: AsRef<Path>>(path: P, exclusive: bool, mode: u32) -> io::Result<Self> {
        Self::acquire(path.as_ref(), exclusive, mode, false)
    }

    /// Like `try_lock`, but waits for other holders to go away.
    pub(crate) fn lock<P: AsRef<Path>>(path: P, exclusive: bool, mode: u32) -> io::Result<Self> {
        Self::acquire(path.as_ref(), exclusive, mode, true)
    }

    fn acquire(path: &Path, exclusive: bool, mode: u32, wait: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .mode(mode)
            .open(path)?;

        let mut op = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
        if !wait {
            op |= libc::LOCK_NB;
        }
        let result = unsafe { libc::flock(file.as_raw_fd(), op) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { _file: file })
    }
}

/// Whether an error from `try_lock` means another holder exists
pub(crate) fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_exclusive_lock_conflicts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock.mdb");

        let lock = FileLock::try_lock(&path, true, 0o644).unwrap();
        assert!(path.exists());

        let err = FileLock::try_lock(&path, false, 0o644).unwrap_err();
        assert!(is_contended(&err));

        drop(lock);
        assert!(FileLock::try_lock(&path, true, 0o644).is_ok());
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock.mdb");

        let _a = FileLock::try_lock(&path, false, 0o644).unwrap();
        let _b = FileLock::try_lock(&path, false, 0o644).unwrap();
        let err = FileLock::try_lock(&path, true, 0o644).unwrap_err();
        assert!(is_contended(&err));
    }
}
