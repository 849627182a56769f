#![forbid(unsafe_code)]
//! Core identifiers, the error taxonomy, and the crate-wide `Result` alias.

use std::fmt;

use thiserror::Error;

/// Unified error type for every VFS and store operation.
///
/// Substrate failures never propagate raw: they are caught at the VFS boundary
/// and folded into this taxonomy before the engine sees them.
#[derive(Debug, Error)]
pub enum VfsError {
    /// The named file could not be opened: missing without a create flag, the
    /// slot pool is exhausted, or the name itself is unusable.
    #[error("cannot open file: {0}")]
    CantOpen(String),
    /// An underlying substrate operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Stored bytes failed validation.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    /// An argument or state transition was rejected.
    #[error("invalid operation: {0}")]
    Invalid(&'static str),
    /// A lock or transaction could not be acquired in time; retry belongs to
    /// the calling engine, never to the VFS.
    #[error("busy: {0}")]
    Busy(&'static str),
    /// The requested record or file does not exist.
    #[error("not found")]
    NotFound,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, VfsError>;

/// Engine-visible identifier for an open file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

/// Index of a slot in the handle pool's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Write-epoch number of a stored block.
///
/// Versions start at zero and *decrement* on each new write epoch, so a
/// numerically smaller version is newer. Key ordering therefore places the
/// newest version of an offset first within its (path, offset) range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(pub i64);

impl Version {
    /// Version of a freshly created file.
    pub const ZERO: Version = Version(0);

    /// The next, newer write epoch.
    pub fn next_epoch(self) -> Version {
        Version(self.0 - 1)
    }

    /// The epoch immediately preceding this one.
    pub fn prev_epoch(self) -> Version {
        Version(self.0 + 1)
    }

    /// True when a block at this version may be served under the given
    /// visibility floor (i.e. it is not newer than the floor).
    pub fn visible_at(self, floor: Version) -> bool {
        self.0 >= floor.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}
