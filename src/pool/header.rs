//! On-disk slot header for the handle pool.
//!
//! Every pooled file starts with a fixed header that records which database
//! path the slot serves, the open flags it was created with, and a digest
//! guarding both. Slot contents begin at [`DATA_OFFSET`], leaving room for
//! the header to grow without moving data.
//!
//! Layout:
//!
//! ```text
//! offset  size  field
//! 0       512   associated path, UTF-8, NUL-terminated (all zero when free)
//! 512     4     open flags, big-endian
//! 516     8     xxh64 digest of bytes 0..516, big-endian
//! ```

use xxhash_rust::xxh64::xxh64;

use crate::types::{Result, VfsError};
use crate::vfs::OpenFlags;

/// Bytes reserved for the associated path, including its terminator.
pub const PATH_AREA: usize = 512;
/// Longest encodable path; one byte is kept for the NUL terminator.
pub const MAX_PATH: usize = PATH_AREA - 1;
/// Total encoded header size.
pub const HEADER_LEN: usize = 524;
/// File offset where slot data begins.
pub const DATA_OFFSET: u64 = 4096;

const FLAGS_OFFSET: usize = PATH_AREA;
const DIGEST_OFFSET: usize = PATH_AREA + 4;
const DIGEST_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Decoded slot header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotHeader {
    /// Path this slot serves, or `None` for a free slot.
    pub path: Option<String>,
    /// Flags the file was opened with; empty for free slots.
    pub flags: OpenFlags,
}

impl SlotHeader {
    /// Header for a slot bound to `path`.
    pub fn associated(path: &str, flags: OpenFlags) -> Result<Self> {
        if path.len() > MAX_PATH {
            return Err(VfsError::Invalid("path exceeds slot header capacity"));
        }
        if path.as_bytes().contains(&0) {
            return Err(VfsError::Invalid("path contains a NUL byte"));
        }
        Ok(Self {
            path: Some(path.to_string()),
            flags,
        })
    }

    /// Header for an unassociated slot.
    pub fn free() -> Self {
        Self {
            path: None,
            flags: OpenFlags(0),
        }
    }

    /// True when no path is bound.
    pub fn is_free(&self) -> bool {
        self.path.is_none()
    }

    /// Encodes the header, digest included.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        if let Some(path) = &self.path {
            buf[..path.len()].copy_from_slice(path.as_bytes());
        }
        buf[FLAGS_OFFSET..FLAGS_OFFSET + 4].copy_from_slice(&self.flags.0.to_be_bytes());
        let digest = xxh64(&buf[..DIGEST_OFFSET], DIGEST_SEED);
        buf[DIGEST_OFFSET..DIGEST_OFFSET + 8].copy_from_slice(&digest.to_be_bytes());
        buf
    }

    /// Decodes and verifies a header read from disk.
    ///
    /// A digest mismatch or malformed path reports corruption; the pool
    /// responds by disassociating the slot rather than failing open.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        let stored = u64::from_be_bytes(
            buf[DIGEST_OFFSET..DIGEST_OFFSET + 8]
                .try_into()
                .map_err(|_| VfsError::Corruption("slot header digest slice"))?,
        );
        let computed = xxh64(&buf[..DIGEST_OFFSET], DIGEST_SEED);
        if stored != computed {
            return Err(VfsError::Corruption("slot header digest mismatch"));
        }
        let flags = OpenFlags(u32::from_be_bytes(
            buf[FLAGS_OFFSET..FLAGS_OFFSET + 4]
                .try_into()
                .map_err(|_| VfsError::Corruption("slot header flags slice"))?,
        ));
        let path_area = &buf[..PATH_AREA];
        let end = path_area.iter().position(|&b| b == 0).unwrap_or(PATH_AREA);
        if end == 0 {
            if path_area.iter().any(|&b| b != 0) {
                return Err(VfsError::Corruption("free slot header has stray bytes"));
            }
            return Ok(Self::free());
        }
        let path = std::str::from_utf8(&path_area[..end])
            .map_err(|_| VfsError::Corruption("slot header path is not UTF-8"))?;
        if path_area[end..].iter().any(|&b| b != 0) {
            return Err(VfsError::Corruption("slot header path has trailing bytes"));
        }
        Ok(Self {
            path: Some(path.to_string()),
            flags,
        })
    }
}
