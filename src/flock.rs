//! Advisory locking granting one process exclusive use of a data directory.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

const LOCK_FILE: &str = "LOCK";

/// Holds the exclusive lock on a data directory. The lock is released when
/// the value is dropped; the lock file itself is left behind.
pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Takes an exclusive advisory lock on `<dir>/LOCK`, recording the
    /// owning process id in the file for debugging.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        try_lock(&file).map_err(|e| {
            Error::Io(format!(
                "data directory {} is locked: {e}",
                dir.display()
            ))
        })?;

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<()> {
    use libc::{flock, LOCK_EX, LOCK_NB};

    let result = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn try_lock(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::LockFileEx;
    use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

    let result = unsafe {
        LockFileEx(
            file.as_raw_handle() as *mut _,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            !0,
            !0,
            std::ptr::null_mut(),
        )
    };
    if result == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn try_lock(_file: &File) -> io::Result<()> {
    // No advisory locking on this platform; allow the open.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_writes_pid() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let lock = DirLock::acquire(temp_dir.path()).expect("Failed to acquire lock");

        let content = std::fs::read_to_string(lock.path()).expect("Failed to read lock file");
        assert!(content.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_second_acquire_fails() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let _lock = DirLock::acquire(temp_dir.path()).expect("Failed to acquire lock");

        assert!(DirLock::acquire(temp_dir.path()).is_err());
    }

    #[test]
    fn test_released_on_drop() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        {
            let _lock = DirLock::acquire(temp_dir.path()).expect("Failed to acquire lock");
        }
        // The previous holder is gone; a new acquire succeeds.
        let _lock = DirLock::acquire(temp_dir.path()).expect("Failed to reacquire lock");
    }
}
