#![allow(unsafe_code)]
//! Exclusive ownership of a pool directory.
//!
//! A pool assumes nobody else touches its backing files. Ownership is
//! claimed with an OS advisory lock on a marker file inside the directory,
//! plus a process-wide registry because POSIX record locks do not conflict
//! between handles of the same process.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::types::{Result, VfsError};

/// Marker file claimed by the owning pool; never handed out as a slot.
pub const LOCK_FILE_NAME: &str = "pool.lock";

static HELD_DIRS: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

/// Exclusive claim on one pool directory, released on drop.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    dir: PathBuf,
    lock_path: PathBuf,
}

impl DirLock {
    /// Claims `dir`, creating it if missing. Fails busy when another pool
    /// in this or any other process already owns it.
    pub fn acquire(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let dir = std::fs::canonicalize(dir)?;
        {
            let mut held = HELD_DIRS.lock();
            if held.contains(&dir) {
                return Err(VfsError::Busy("pool directory already claimed"));
            }
            held.push(dir.clone());
        }
        let lock_path = dir.join(LOCK_FILE_NAME);
        let claim = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)
            .and_then(|file| Ok((sys::try_lock_exclusive(&file)?, file)));
        match claim {
            Ok((true, file)) => Ok(Self {
                file,
                dir,
                lock_path,
            }),
            Ok((false, _)) => {
                HELD_DIRS.lock().retain(|p| p != &dir);
                Err(VfsError::Busy("pool directory locked by another process"))
            }
            Err(err) => {
                HELD_DIRS.lock().retain(|p| p != &dir);
                Err(err.into())
            }
        }
    }

    /// Canonical directory this lock owns.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the marker file.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = sys::unlock(&self.file);
        HELD_DIRS.lock().retain(|p| p != &self.dir);
    }
}

#[cfg(unix)]
mod sys {
    use super::*;
    use std::os::unix::io::AsRawFd;

    pub fn try_lock_exclusive(file: &File) -> io::Result<bool> {
        let fd = file.as_raw_fd();
        let mut flock = libc::flock {
            l_type: libc::F_WRLCK as _,
            l_whence: libc::SEEK_SET as _,
            l_start: 0,
            l_len: 0,
            l_pid: 0,
        };
        loop {
            let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut flock) };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::EACCES) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let mut flock = libc::flock {
            l_type: libc::F_UNLCK as _,
            l_whence: libc::SEEK_SET as _,
            l_start: 0,
            l_len: 0,
            l_pid: 0,
        };
        let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut flock) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod sys {
    use super::*;
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    pub fn try_lock_exclusive(file: &File) -> io::Result<bool> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            let flags = LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY;
            let res = LockFileEx(handle as isize, flags, 0, u32::MAX, u32::MAX, &mut overlapped);
            if res != 0 {
                Ok(true)
            } else {
                let err = io::Error::last_os_error();
                if matches!(err.raw_os_error(), Some(code) if code == ERROR_LOCK_VIOLATION as i32)
                {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            let res = UnlockFileEx(handle as isize, 0, u32::MAX, u32::MAX, &mut overlapped);
            if res != 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    use super::*;

    pub fn try_lock_exclusive(_file: &File) -> io::Result<bool> {
        Err(io::Error::new(
            io::ErrorKind::Other,
            "file locking unsupported on this platform",
        ))
    }

    pub fn unlock(_file: &File) -> io::Result<()> {
        Ok(())
    }
}
