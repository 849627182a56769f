#![forbid(unsafe_code)]
//! The abstract contract both storage adapters satisfy.
//!
//! This module is shared vocabulary, not shared code: the engine-facing
//! operation set, the flag and capability bits with the engine's canonical
//! numeric values, and the small-integer return codes of the ABI boundary.

use crate::types::{FileId, Result, VfsError};

/// Small-integer return codes of the engine ABI.
pub mod codes {
    /// Operation succeeded.
    pub const OK: u32 = 0;
    /// Lock or transaction contention; the engine retries on its own schedule.
    pub const BUSY: u32 = 5;
    /// Generic substrate failure.
    pub const IOERR: u32 = 10;
    /// Unhandled file-control opcode.
    pub const NOTFOUND: u32 = 12;
    /// File could not be opened.
    pub const CANTOPEN: u32 = 14;
    /// Fewer bytes existed than requested; the tail was zero-filled.
    pub const IOERR_SHORT_READ: u32 = 522;
}

/// Maps an error onto the ABI return code the engine expects.
pub fn engine_code(err: &VfsError) -> u32 {
    match err {
        VfsError::CantOpen(_) => codes::CANTOPEN,
        VfsError::Busy(_) => codes::BUSY,
        VfsError::NotFound => codes::NOTFOUND,
        VfsError::Io(_) | VfsError::Corruption(_) | VfsError::Invalid(_) => codes::IOERR,
    }
}

/// Open-mode and file-type bits, using the engine's canonical values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    /// Open for reading only.
    pub const READONLY: OpenFlags = OpenFlags(0x0000_0001);
    /// Open for reading and writing.
    pub const READWRITE: OpenFlags = OpenFlags(0x0000_0002);
    /// Create the file when it does not exist.
    pub const CREATE: OpenFlags = OpenFlags(0x0000_0004);
    /// Remove the file when its descriptor closes.
    pub const DELETE_ON_CLOSE: OpenFlags = OpenFlags(0x0000_0008);
    /// Main database file.
    pub const MAIN_DB: OpenFlags = OpenFlags(0x0000_0100);
    /// Temporary database file.
    pub const TEMP_DB: OpenFlags = OpenFlags(0x0000_0200);
    /// Rollback journal of a main database.
    pub const MAIN_JOURNAL: OpenFlags = OpenFlags(0x0000_0800);
    /// Journal of a temporary database.
    pub const TEMP_JOURNAL: OpenFlags = OpenFlags(0x0000_1000);
    /// Sub-journal used by savepoints.
    pub const SUBJOURNAL: OpenFlags = OpenFlags(0x0000_2000);
    /// Super-journal coordinating multi-file commits.
    pub const SUPER_JOURNAL: OpenFlags = OpenFlags(0x0000_4000);
    /// Write-ahead log file.
    pub const WAL: OpenFlags = OpenFlags(0x0008_0000);

    /// File types that are allowed to outlive the session that created them.
    /// Anything else found in a pool slot header on reset is discarded.
    pub const PERSISTENT_TYPES: OpenFlags = OpenFlags(
        Self::MAIN_DB.0 | Self::MAIN_JOURNAL.0 | Self::SUPER_JOURNAL.0 | Self::WAL.0,
    );

    /// True when every bit of `other` is set in `self`.
    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when at least one bit of `other` is set in `self`.
    pub fn intersects(self, other: OpenFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

/// The engine's 5-level advisory lock ladder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    /// No lock held.
    None,
    /// Reader admitted; many may hold this.
    Shared,
    /// Write intent signaled; admitted readers continue.
    Reserved,
    /// Waiting for readers to drain before exclusive.
    Pending,
    /// Sole access.
    Exclusive,
}

/// Engine hints delivered through the file-control escape hatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileControl {
    /// The engine is about to rewrite the whole file (page-size rebuilds).
    Overwrite,
    /// Fired just before a sync; reblocks after an overwrite, otherwise
    /// flushes dirty metadata.
    Sync,
    /// Second commit phase; clears the overwrite hint.
    CommitPhaseTwo,
    /// Start an atomic batch of page writes.
    BeginAtomicWrite,
    /// Make the whole batch visible in one durable step.
    CommitAtomicWrite,
    /// Abandon the batch; pre-batch state stays current.
    RollbackAtomicWrite,
}

impl FileControl {
    /// Decodes an ABI opcode; `None` means the opcode is not handled here and
    /// the caller reports NOTFOUND.
    pub fn from_opcode(op: u32) -> Option<FileControl> {
        match op {
            11 => Some(FileControl::Overwrite),
            21 => Some(FileControl::Sync),
            22 => Some(FileControl::CommitPhaseTwo),
            31 => Some(FileControl::BeginAtomicWrite),
            32 => Some(FileControl::CommitAtomicWrite),
            33 => Some(FileControl::RollbackAtomicWrite),
            _ => None,
        }
    }

    /// The ABI opcode for this hint.
    pub fn opcode(self) -> u32 {
        match self {
            FileControl::Overwrite => 11,
            FileControl::Sync => 21,
            FileControl::CommitPhaseTwo => 22,
            FileControl::BeginAtomicWrite => 31,
            FileControl::CommitAtomicWrite => 32,
            FileControl::RollbackAtomicWrite => 33,
        }
    }
}

/// Result of a read: complete, or short with the tail zero-filled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum ReadOutcome {
    /// Every requested byte existed.
    Complete,
    /// Only `valid` bytes existed; the rest of the buffer was zero-filled.
    Short {
        /// Count of bytes actually present.
        valid: usize,
    },
}

impl ReadOutcome {
    /// True for a short read.
    pub fn is_short(self) -> bool {
        matches!(self, ReadOutcome::Short { .. })
    }
}

/// Result of a file-control call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlOutcome {
    /// The adapter acted on the hint.
    Handled,
    /// The hint is not meaningful for this adapter (engine sees NOTFOUND).
    NotHandled,
}

/// What an `access` probe asks about. Both answers are existence here; the
/// distinction is kept because the ABI transports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessCheck {
    /// Does the file exist at all?
    Exists,
    /// Could the file be opened read-write?
    ReadWrite,
}

/// Device-capability bits advertised through `device_characteristics`.
pub mod iocap {
    /// Safe to append without zero-fill torn-tail hazards.
    pub const SAFE_APPEND: u32 = 0x0000_0200;
    /// Writes land in issue order.
    pub const SEQUENTIAL: u32 = 0x0000_0400;
    /// Open files cannot be deleted out from under the adapter.
    pub const UNDELETABLE_WHEN_OPEN: u32 = 0x0000_0800;
    /// Multi-page batches commit atomically via file-control.
    pub const BATCH_ATOMIC: u32 = 0x0000_4000;
}

/// The operation set the engine calls on every adapter.
///
/// Adapters take `&self` and guard their own state; the engine issues one
/// operation at a time per open file, but distinct connections may share the
/// same substrate through separate adapter instances.
pub trait Vfs {
    /// Opens `name` (or an anonymous temporary when `None`) and returns the
    /// engine-visible id for the descriptor.
    fn open(&self, name: Option<&str>, flags: OpenFlags) -> Result<FileId>;
    /// Closes a descriptor, honoring delete-on-close.
    fn close(&self, file: FileId) -> Result<()>;
    /// Reads `buf.len()` bytes at `offset`, zero-filling past end of file.
    fn read(&self, file: FileId, buf: &mut [u8], offset: u64) -> Result<ReadOutcome>;
    /// Writes all of `buf` at `offset`.
    fn write(&self, file: FileId, buf: &[u8], offset: u64) -> Result<()>;
    /// Discards bytes beyond `size`.
    fn truncate(&self, file: FileId, size: u64) -> Result<()>;
    /// Durability checkpoint: synced bytes survive a crash.
    fn sync(&self, file: FileId) -> Result<()>;
    /// Current logical size of the file.
    fn file_size(&self, file: FileId) -> Result<u64>;
    /// Upgrades the advisory lock to `level`.
    fn lock(&self, file: FileId, level: LockLevel) -> Result<()>;
    /// Downgrades the advisory lock to `level`.
    fn unlock(&self, file: FileId, level: LockLevel) -> Result<()>;
    /// True when any connection holds reserved or higher on this path.
    fn check_reserved_lock(&self, file: FileId) -> Result<bool>;
    /// Delivers an engine hint; unhandled hints return `NotHandled`.
    fn file_control(&self, file: FileId, op: FileControl) -> Result<ControlOutcome>;
    /// Smallest write unit the adapter guarantees tear-free.
    fn sector_size(&self) -> u32;
    /// Static `iocap` capability bits.
    fn device_characteristics(&self) -> u32;
    /// Existence probe by name.
    fn access(&self, name: &str, check: AccessCheck) -> Result<bool>;
    /// Removes `name`; `sync_dir` asks for a durability barrier afterwards.
    fn delete(&self, name: &str, sync_dir: bool) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_contain_and_intersect() {
        let flags = OpenFlags::CREATE | OpenFlags::READWRITE | OpenFlags::MAIN_DB;
        assert!(flags.contains(OpenFlags::CREATE));
        assert!(!flags.contains(OpenFlags::DELETE_ON_CLOSE));
        assert!(flags.intersects(OpenFlags::PERSISTENT_TYPES));

        let temp = OpenFlags::CREATE | OpenFlags::DELETE_ON_CLOSE | OpenFlags::TEMP_DB;
        assert!(!temp.intersects(OpenFlags::PERSISTENT_TYPES));
    }

    #[test]
    fn lock_levels_order() {
        assert!(LockLevel::None < LockLevel::Shared);
        assert!(LockLevel::Shared < LockLevel::Reserved);
        assert!(LockLevel::Reserved < LockLevel::Pending);
        assert!(LockLevel::Pending < LockLevel::Exclusive);
    }

    #[test]
    fn file_control_opcodes_roundtrip() {
        for op in [
            FileControl::Overwrite,
            FileControl::Sync,
            FileControl::CommitPhaseTwo,
            FileControl::BeginAtomicWrite,
            FileControl::CommitAtomicWrite,
            FileControl::RollbackAtomicWrite,
        ] {
            assert_eq!(FileControl::from_opcode(op.opcode()), Some(op));
        }
        assert_eq!(FileControl::from_opcode(19), None);
    }

    #[test]
    fn error_codes_match_taxonomy() {
        assert_eq!(
            engine_code(&VfsError::CantOpen("x".into())),
            codes::CANTOPEN
        );
        assert_eq!(engine_code(&VfsError::Busy("reserved")), codes::BUSY);
        assert_eq!(engine_code(&VfsError::NotFound), codes::NOTFOUND);
        assert_eq!(engine_code(&VfsError::Corruption("hdr")), codes::IOERR);
    }
}
