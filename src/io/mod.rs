#![forbid(unsafe_code)]
//! Positioned file I/O seam shared by the pool slots and the log-backed store.

use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind, IoSlice},
    path::Path,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::types::{Result, VfsError};

/// Trait for synchronous positioned I/O against one backing resource.
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes at `off`; errors with `UnexpectedEof`
    /// when the resource is shorter.
    fn read_at(&self, dst: &mut [u8], off: u64) -> Result<()>;
    /// Writes all of `src` at `off`, extending the resource as needed.
    fn write_at(&self, src: &[u8], off: u64) -> Result<()>;
    /// Writes multiple buffers contiguously starting at `off`.
    fn writev_at(&self, bufs: &[IoSlice<'_>], mut off: u64) -> Result<()> {
        for slice in bufs {
            if slice.is_empty() {
                continue;
            }
            self.write_at(slice, off)?;
            off = off
                .checked_add(slice.len() as u64)
                .ok_or(VfsError::Invalid("writev offset overflow"))?;
        }
        Ok(())
    }
    /// Flushes data and metadata to durable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current length in bytes.
    fn len(&self) -> Result<u64>;
    /// True when the resource holds no bytes.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the resource to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
}

/// File-backed implementation over a shared descriptor.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already-open descriptor.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens `path` read-write, creating it when missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(VfsError::from)?;
        Ok(Self::new(file))
    }

    /// Opens `path` read-write; fails when the file does not exist.
    pub fn open_existing(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(VfsError::from)?;
        Ok(Self::new(file))
    }

    fn file(&self) -> &File {
        &self.inner
    }

    #[cfg(unix)]
    fn read_exact_at(&self, mut dst: &mut [u8], mut off: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        while !dst.is_empty() {
            let read = self.file().read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn write_all_at(&self, mut src: &[u8], mut off: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        while !src.is_empty() {
            let written = self.file().write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    #[cfg(windows)]
    fn read_exact_at(&self, mut dst: &mut [u8], mut off: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !dst.is_empty() {
            let read = self.file().seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    #[cfg(windows)]
    fn write_all_at(&self, mut src: &[u8], mut off: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !src.is_empty() {
            let written = self.file().seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn read_exact_at(&self, _dst: &mut [u8], _off: u64) -> io::Result<()> {
        Err(io::Error::new(
            ErrorKind::Unsupported,
            "positioned reads unsupported on this platform",
        ))
    }

    #[cfg(not(any(unix, windows)))]
    fn write_all_at(&self, _src: &[u8], _off: u64) -> io::Result<()> {
        Err(io::Error::new(
            ErrorKind::Unsupported,
            "positioned writes unsupported on this platform",
        ))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, dst: &mut [u8], off: u64) -> Result<()> {
        self.read_exact_at(dst, off).map_err(VfsError::from)
    }

    fn write_at(&self, src: &[u8], off: u64) -> Result<()> {
        self.write_all_at(src, off).map_err(VfsError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.file().sync_all().map_err(VfsError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata().map_err(VfsError::from)?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file().set_len(len).map_err(VfsError::from)
    }
}

/// In-memory implementation; clones share the same buffer.
///
/// Used by tests and by callers that want the store semantics without a real
/// file. `snapshot()`/`from_bytes()` make crash simulation a byte copy.
#[derive(Clone, Default)]
pub struct MemFileIo {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemFileIo {
    /// Creates an empty in-memory resource.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a resource pre-populated with `bytes`.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copies out the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl FileIo for MemFileIo {
    fn read_at(&self, dst: &mut [u8], off: u64) -> Result<()> {
        let data = self.data.lock();
        let off = off as usize;
        let end = off
            .checked_add(dst.len())
            .ok_or(VfsError::Invalid("read offset overflow"))?;
        if end > data.len() {
            return Err(VfsError::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "read_at reached EOF",
            )));
        }
        dst.copy_from_slice(&data[off..end]);
        Ok(())
    }

    fn write_at(&self, src: &[u8], off: u64) -> Result<()> {
        let mut data = self.data.lock();
        let off = off as usize;
        let end = off
            .checked_add(src.len())
            .ok_or(VfsError::Invalid("write offset overflow"))?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[off..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.data.lock().resize(len as usize, 0);
        Ok(())
    }
}
