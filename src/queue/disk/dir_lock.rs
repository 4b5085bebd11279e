//! Exclusive ownership of a queue directory.
//!
//! Two processes appending to the same log would interleave frames, so the
//! disk queue refuses to open a directory another process already holds. The
//! holder writes its pid into the lock file so a refused opener can name it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use crate::error::QueueError;

/// Name of the lock file inside the queue directory.
pub const LOCK_FILE: &str = ".lock";

/// Advisory lock on a queue directory, released on drop.
#[derive(Debug)]
pub struct DirLock {
    _file: File,
}

impl DirLock {
    /// Take the lock on `dir` without blocking.
    ///
    /// # Errors
    /// - `Locked` if another process holds the directory
    /// - `Io` if the lock file cannot be opened or written
    /// - `Backend` on platforms without advisory locking
    pub fn acquire(dir: &Path) -> Result<Self, QueueError> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| QueueError::Io(format!("cannot open {}: {e}", path.display())))?;

        if !try_lock(&file)? {
            let holder = fs::read_to_string(&path).unwrap_or_default();
            let holder = holder.trim();
            return Err(QueueError::Locked(if holder.is_empty() {
                format!("{} is held by another process", dir.display())
            } else {
                format!("{} is held by process {holder}", dir.display())
            }));
        }

        // Stale content from a previous holder is replaced, not appended to.
        file.set_len(0)
            .and_then(|()| write!(file, "{}", std::process::id()))
            .and_then(|()| file.flush())
            .map_err(|e| QueueError::Io(format!("cannot record lock holder: {e}")))?;

        Ok(Self { _file: file })
    }
}

/// `Ok(false)` when another process holds the lock.
#[cfg(unix)]
fn try_lock(file: &File) -> Result<bool, QueueError> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(QueueError::Io(format!("flock failed: {err}")))
}

#[cfg(windows)]
fn try_lock(file: &File) -> Result<bool, QueueError> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    let handle = file.as_raw_handle() as HANDLE;
    // SAFETY: `handle` is valid for the call and `overlapped` is a zeroed,
    // exclusively borrowed OVERLAPPED.
    let result = unsafe {
        let mut overlapped = std::mem::zeroed::<OVERLAPPED>();
        LockFileEx(
            handle,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            1,
            0,
            &mut overlapped,
        )
    };
    if result != 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == i32::try_from(ERROR_LOCK_VIOLATION).ok() {
        return Ok(false);
    }
    Err(QueueError::Io(format!("LockFileEx failed: {err}")))
}

#[cfg(not(any(unix, windows)))]
fn try_lock(_file: &File) -> Result<bool, QueueError> {
    Err(QueueError::Backend(
        "queue directory locking is not supported on this platform".to_string(),
    ))
}
