//! Process-level ownership of an environment directory.
//!
//! A vesper environment may be opened by at most one process at a time; the
//! single-writer/multi-reader coordination inside that process is handled by
//! the storage layer. Ownership is enforced with an advisory lock on a
//! dedicated lock file, taken exclusively and held for the life of the
//! environment handle.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use crate::types::{Result, VesperError};

/// Exclusive advisory lock over an environment directory.
///
/// Dropping the guard releases the lock.
pub struct EnvLock {
    file: File,
}

impl EnvLock {
    /// Acquires the environment lock, failing immediately if another process
    /// holds it.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(VesperError::from)?;
        if !try_lock_exclusive(&file)? {
            return Err(VesperError::Invalid(
                "environment is locked by another process",
            ));
        }
        Ok(Self { file })
    }
}

impl Drop for EnvLock {
    fn drop(&mut self) {
        if let Err(_err) = unlock(&self.file) {
            #[cfg(debug_assertions)]
            eprintln!("failed to release environment lock: {_err:?}");
        }
    }
}

fn try_lock_exclusive(file: &File) -> Result<bool> {
    lock_impl(file).map_err(VesperError::from)
}

#[cfg(unix)]
fn lock_impl(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    let res = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if res == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EWOULDBLOCK) => Ok(false),
        _ => Err(err),
    }
}

#[cfg(unix)]
fn unlock(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if res == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(windows)]
fn lock_impl(file: &File) -> io::Result<bool> {
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    unsafe {
        let handle = file.as_raw_handle();
        let mut overlapped: OVERLAPPED = zeroed();
        let flags = LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY;
        let res = LockFileEx(handle as isize, flags, 0, 1, 0, &mut overlapped);
        if res != 0 {
            Ok(true)
        } else {
            let err = io::Error::last_os_error();
            if matches!(err.raw_os_error(), Some(code) if code == ERROR_LOCK_VIOLATION as i32) {
                Ok(false)
            } else {
                Err(err)
            }
        }
    }
}

#[cfg(windows)]
fn unlock(file: &File) -> io::Result<()> {
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Storage::FileSystem::UnlockFileEx;
    use windows_sys::Win32::System::IO::OVERLAPPED;

    unsafe {
        let handle = file.as_raw_handle();
        let mut overlapped: OVERLAPPED = zeroed();
        let res = UnlockFileEx(handle as isize, 0, 1, 0, &mut overlapped);
        if res != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(any(unix, windows)))]
fn lock_impl(_file: &File) -> io::Result<bool> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "file locking unsupported on this platform",
    ))
}

#[cfg(not(any(unix, windows)))]
fn unlock(_file: &File) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "file locking unsupported on this platform",
    ))
}
