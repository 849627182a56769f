#![forbid(unsafe_code)]
//! Append-only, CRC-framed log backing the versioned block store.
//!
//! The log is the durable half of the store; the queryable half is an
//! in-memory ordered index rebuilt on open. Every mutation is staged as a
//! frame and reaches the file only when its transaction commits, closed by a
//! commit frame. Replay applies frames batch-by-batch: a batch becomes
//! visible only at its commit frame, and a torn tail (short frame, bad CRC,
//! missing commit) is discarded and truncated away.
//!
//! Only one write transaction may be open at a time; later `begin` calls
//! wait for the slot with a bounded timeout.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::io::{FileIo, MemFileIo, StdFileIo};
use crate::kv::{BlockData, BlockKey, PurgeRecord, StoreOptions, Synchronous};
use crate::types::{Result, Version, VfsError};

const LOG_MAGIC: [u8; 4] = *b"BDGL";
const LOG_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 32;
const FRAME_HEADER_LEN: usize = 16;

const FRAME_PUT_BLOCK: u8 = 1;
const FRAME_DELETE_BLOCK: u8 = 2;
const FRAME_PUT_PURGE: u8 = 3;
const FRAME_DELETE_PURGE: u8 = 4;
const FRAME_COMMIT: u8 = 5;

/// Logs smaller than this are never worth compacting.
const COMPACT_MIN_BYTES: u64 = 1 << 20;

const VERSION_SIGN_BIT: u64 = 1 << 63;

type DynIo = Arc<dyn FileIo + Send + Sync>;

fn compute_crc32(parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

fn encode_version(version: Version) -> [u8; 8] {
    ((version.0 as u64) ^ VERSION_SIGN_BIT).to_be_bytes()
}

fn decode_version(bytes: [u8; 8]) -> Version {
    Version((u64::from_be_bytes(bytes) ^ VERSION_SIGN_BIT) as i64)
}

/// Cumulative store counters, cloned out under the state lock.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StoreStats {
    /// Frames appended to the log, commit frames included.
    pub frames_appended: u64,
    /// Total bytes appended to the log.
    pub bytes_appended: u64,
    /// Committed transactions.
    pub commits: u64,
    /// Rolled-back transactions, including failed commits.
    pub rollbacks: u64,
    /// Explicit sync operations performed.
    pub syncs: u64,
    /// Compaction passes completed.
    pub compactions: u64,
}

/// Outcome of one compaction pass.
#[derive(Clone, Debug, Serialize)]
pub struct CompactReport {
    /// Log size before the pass.
    pub log_bytes_before: u64,
    /// Log size after the pass.
    pub log_bytes_after: u64,
    /// Block records carried over.
    pub live_blocks: u64,
    /// Purge records carried over.
    pub live_purge_records: u64,
}

/// Handle to the open write transaction; stale tokens are rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TxnToken(u64);

#[derive(Clone, Debug)]
struct FileHeader {
    salt: u64,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&LOG_MAGIC);
        buf[4..6].copy_from_slice(&LOG_FORMAT_VERSION.to_be_bytes());
        buf[6..8].fill(0);
        buf[8..16].copy_from_slice(&self.salt.to_be_bytes());
        let mut crc_buf = buf;
        crc_buf[28..32].fill(0);
        let crc = compute_crc32(&[&crc_buf]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FILE_HEADER_LEN {
            return Err(VfsError::Corruption("log header truncated"));
        }
        let mut header = [0u8; FILE_HEADER_LEN];
        header.copy_from_slice(&src[..FILE_HEADER_LEN]);
        if header[0..4] != LOG_MAGIC {
            return Err(VfsError::Corruption("log magic mismatch"));
        }
        let version = u16::from_be_bytes(
            header[4..6]
                .try_into()
                .map_err(|_| VfsError::Corruption("log header slice"))?,
        );
        if version != LOG_FORMAT_VERSION {
            return Err(VfsError::Corruption("log format version mismatch"));
        }
        if header[6..8] != [0, 0] {
            return Err(VfsError::Corruption("log reserved header bytes non-zero"));
        }
        let stored_crc = u32::from_be_bytes(
            header[28..32]
                .try_into()
                .map_err(|_| VfsError::Corruption("log header slice"))?,
        );
        header[28..32].fill(0);
        if compute_crc32(&[&header]) != stored_crc {
            return Err(VfsError::Corruption("log header crc mismatch"));
        }
        let salt = u64::from_be_bytes(
            src[8..16]
                .try_into()
                .map_err(|_| VfsError::Corruption("log header slice"))?,
        );
        Ok(Self { salt })
    }
}

#[derive(Clone, Debug)]
struct FrameHeader {
    kind: u8,
    payload_len: u32,
    payload_crc32: u32,
}

impl FrameHeader {
    fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0] = self.kind;
        buf[1..4].fill(0);
        buf[4..8].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[8..12].copy_from_slice(&self.payload_crc32.to_be_bytes());
        let mut crc_buf = buf;
        crc_buf[12..16].fill(0);
        let crc = compute_crc32(&[&crc_buf]);
        buf[12..16].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FRAME_HEADER_LEN {
            return Err(VfsError::Corruption("log frame header truncated"));
        }
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&src[..FRAME_HEADER_LEN]);
        if header[1..4] != [0, 0, 0] {
            return Err(VfsError::Corruption("log frame reserved bytes non-zero"));
        }
        let stored_crc = u32::from_be_bytes(
            header[12..16]
                .try_into()
                .map_err(|_| VfsError::Corruption("log frame slice"))?,
        );
        header[12..16].fill(0);
        if compute_crc32(&[&header]) != stored_crc {
            return Err(VfsError::Corruption("log frame header crc mismatch"));
        }
        let payload_len = u32::from_be_bytes(
            src[4..8]
                .try_into()
                .map_err(|_| VfsError::Corruption("log frame slice"))?,
        );
        let payload_crc32 = u32::from_be_bytes(
            src[8..12]
                .try_into()
                .map_err(|_| VfsError::Corruption("log frame slice"))?,
        );
        Ok(Self {
            kind: src[0],
            payload_len,
            payload_crc32,
        })
    }
}

#[derive(Clone, Debug)]
enum Frame {
    PutBlock { key: BlockKey, data: BlockData },
    DeleteBlock { key: BlockKey },
    PutPurge { path: String, record: PurgeRecord },
    DeletePurge { path: String },
    Commit,
}

struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(VfsError::Corruption("log frame length overflow"))?;
        if end > self.buf.len() {
            return Err(VfsError::Corruption("log frame truncated"));
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes(
            bytes
                .try_into()
                .map_err(|_| VfsError::Corruption("log frame slice"))?,
        ))
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(
            bytes
                .try_into()
                .map_err(|_| VfsError::Corruption("log frame slice"))?,
        ))
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(
            bytes
                .try_into()
                .map_err(|_| VfsError::Corruption("log frame slice"))?,
        ))
    }

    fn version(&mut self) -> Result<Version> {
        let bytes = self.take(8)?;
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| VfsError::Corruption("log frame slice"))?;
        Ok(decode_version(raw))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| VfsError::Corruption("log frame path is not utf-8"))
    }

    fn finish(self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(VfsError::Corruption("log frame trailing bytes"));
        }
        Ok(())
    }
}

fn push_string(out: &mut Vec<u8>, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| VfsError::Invalid("path too long for the block log"))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn put_block_payload(key: &BlockKey, data: &BlockData) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(32 + key.path.len() + data.bytes.len());
    push_string(&mut out, &key.path)?;
    out.extend_from_slice(&key.offset.to_be_bytes());
    out.extend_from_slice(&encode_version(key.version));
    match data.file_size {
        Some(size) => {
            out.push(1);
            out.extend_from_slice(&size.to_be_bytes());
        }
        None => {
            out.push(0);
            out.extend_from_slice(&0u64.to_be_bytes());
        }
    }
    let len = u32::try_from(data.bytes.len())
        .map_err(|_| VfsError::Invalid("block larger than the log frame limit"))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&data.bytes);
    Ok(out)
}

fn delete_block_payload(key: &BlockKey) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(24 + key.path.len());
    push_string(&mut out, &key.path)?;
    out.extend_from_slice(&key.offset.to_be_bytes());
    out.extend_from_slice(&encode_version(key.version));
    Ok(out)
}

fn put_purge_payload(path: &str, record: &PurgeRecord) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(16 + path.len() + record.superseded.len() * 16);
    push_string(&mut out, path)?;
    out.extend_from_slice(&record.count.to_be_bytes());
    let entries = u32::try_from(record.superseded.len())
        .map_err(|_| VfsError::Invalid("purge record too large for the log"))?;
    out.extend_from_slice(&entries.to_be_bytes());
    for (&offset, &version) in &record.superseded {
        out.extend_from_slice(&offset.to_be_bytes());
        out.extend_from_slice(&encode_version(version));
    }
    Ok(out)
}

fn delete_purge_payload(path: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(2 + path.len());
    push_string(&mut out, path)?;
    Ok(out)
}

fn append_frame(out: &mut Vec<u8>, kind: u8, payload: &[u8]) -> Result<()> {
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| VfsError::Invalid("log frame payload too large"))?;
    let header = FrameHeader {
        kind,
        payload_len,
        payload_crc32: compute_crc32(&[payload]),
    };
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
    Ok(())
}

impl Frame {
    fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Frame::PutBlock { key, data } => {
                append_frame(out, FRAME_PUT_BLOCK, &put_block_payload(key, data)?)
            }
            Frame::DeleteBlock { key } => {
                append_frame(out, FRAME_DELETE_BLOCK, &delete_block_payload(key)?)
            }
            Frame::PutPurge { path, record } => {
                append_frame(out, FRAME_PUT_PURGE, &put_purge_payload(path, record)?)
            }
            Frame::DeletePurge { path } => {
                append_frame(out, FRAME_DELETE_PURGE, &delete_purge_payload(path)?)
            }
            Frame::Commit => append_frame(out, FRAME_COMMIT, &[]),
        }
    }

    fn decode(kind: u8, payload: &[u8]) -> Result<Frame> {
        let mut reader = PayloadReader::new(payload);
        let frame = match kind {
            FRAME_PUT_BLOCK => {
                let path = reader.string()?;
                let offset = reader.u64()?;
                let version = reader.version()?;
                let has_size = reader.u8()?;
                let size = reader.u64()?;
                let file_size = match has_size {
                    0 => None,
                    1 => Some(size),
                    _ => return Err(VfsError::Corruption("log frame size marker invalid")),
                };
                let len = reader.u32()? as usize;
                let bytes = reader.take(len)?.to_vec();
                Frame::PutBlock {
                    key: BlockKey::new(path, offset, version),
                    data: BlockData { bytes, file_size },
                }
            }
            FRAME_DELETE_BLOCK => {
                let path = reader.string()?;
                let offset = reader.u64()?;
                let version = reader.version()?;
                Frame::DeleteBlock {
                    key: BlockKey::new(path, offset, version),
                }
            }
            FRAME_PUT_PURGE => {
                let path = reader.string()?;
                let count = reader.u64()?;
                let entries = reader.u32()?;
                let mut superseded = BTreeMap::new();
                for _ in 0..entries {
                    let offset = reader.u64()?;
                    let version = reader.version()?;
                    superseded.insert(offset, version);
                }
                Frame::PutPurge {
                    path,
                    record: PurgeRecord { superseded, count },
                }
            }
            FRAME_DELETE_PURGE => Frame::DeletePurge {
                path: reader.string()?,
            },
            FRAME_COMMIT => Frame::Commit,
            _ => return Err(VfsError::Corruption("unknown log frame kind")),
        };
        reader.finish()?;
        Ok(frame)
    }
}

#[derive(Default)]
struct StoreMaps {
    blocks: BTreeMap<BlockKey, BlockData>,
    by_version: BTreeSet<(String, Version, u64)>,
    purges: BTreeMap<String, PurgeRecord>,
}

enum UndoOp {
    RestoreBlock(BlockKey, Option<BlockData>),
    RestorePurge(String, Option<PurgeRecord>),
    Nothing,
}

impl StoreMaps {
    fn capture_undo(&self, frame: &Frame) -> UndoOp {
        match frame {
            Frame::PutBlock { key, .. } | Frame::DeleteBlock { key } => {
                UndoOp::RestoreBlock(key.clone(), self.blocks.get(key).cloned())
            }
            Frame::PutPurge { path, .. } | Frame::DeletePurge { path } => {
                UndoOp::RestorePurge(path.clone(), self.purges.get(path).cloned())
            }
            Frame::Commit => UndoOp::Nothing,
        }
    }

    fn apply(&mut self, frame: &Frame) {
        match frame {
            Frame::PutBlock { key, data } => {
                self.by_version
                    .insert((key.path.clone(), key.version, key.offset));
                self.blocks.insert(key.clone(), data.clone());
            }
            Frame::DeleteBlock { key } => {
                self.by_version
                    .remove(&(key.path.clone(), key.version, key.offset));
                self.blocks.remove(key);
            }
            Frame::PutPurge { path, record } => {
                self.purges.insert(path.clone(), record.clone());
            }
            Frame::DeletePurge { path } => {
                self.purges.remove(path);
            }
            Frame::Commit => {}
        }
    }

    fn undo(&mut self, op: UndoOp) {
        match op {
            UndoOp::RestoreBlock(key, Some(data)) => {
                self.by_version
                    .insert((key.path.clone(), key.version, key.offset));
                self.blocks.insert(key, data);
            }
            UndoOp::RestoreBlock(key, None) => {
                self.by_version
                    .remove(&(key.path.clone(), key.version, key.offset));
                self.blocks.remove(&key);
            }
            UndoOp::RestorePurge(path, Some(record)) => {
                self.purges.insert(path, record);
            }
            UndoOp::RestorePurge(path, None) => {
                self.purges.remove(&path);
            }
            UndoOp::Nothing => {}
        }
    }

    fn live_estimate(&self) -> u64 {
        let mut total = FILE_HEADER_LEN as u64;
        for (key, data) in &self.blocks {
            total += (FRAME_HEADER_LEN + 31 + key.path.len() + data.bytes.len()) as u64;
        }
        for (path, record) in &self.purges {
            total += (FRAME_HEADER_LEN + 14 + path.len() + record.superseded.len() * 16) as u64;
        }
        total
    }
}

struct TxnState {
    token: TxnToken,
    staged: Vec<Frame>,
    undo: Vec<UndoOp>,
}

struct StoreState {
    io: DynIo,
    maps: StoreMaps,
    log_len: u64,
    txn: Option<TxnState>,
    next_token: u64,
    salt: u64,
    stats: StoreStats,
    // Live handle lost mid-compaction; durable operations must refuse.
    poisoned: bool,
}

/// The versioned block store: durable log plus in-memory ordered index.
pub struct LogStore {
    state: Mutex<StoreState>,
    txn_done: Condvar,
    path: Option<PathBuf>,
    options: StoreOptions,
}

impl std::fmt::Debug for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl LogStore {
    /// Opens (or creates) the store backed by the log file at `path`.
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self> {
        let io: DynIo = Arc::new(StdFileIo::open(path)?);
        Self::bootstrap(io, Some(path.to_path_buf()), options)
    }

    /// Store backed by volatile memory; compaction rewrites in place.
    pub fn in_memory(options: StoreOptions) -> Result<Self> {
        Self::bootstrap(Arc::new(MemFileIo::new()), None, options)
    }

    /// Store over an arbitrary `FileIo`; used by crash-simulation tests.
    pub fn from_io(io: Arc<dyn FileIo + Send + Sync>, options: StoreOptions) -> Result<Self> {
        Self::bootstrap(io, None, options)
    }

    fn bootstrap(io: DynIo, path: Option<PathBuf>, options: StoreOptions) -> Result<Self> {
        let mut maps = StoreMaps::default();
        let file_len = io.len()?;
        let salt;
        let log_len;
        if file_len == 0 {
            salt = rand::random::<u64>();
            let header = FileHeader { salt };
            io.write_at(&header.encode(), 0)?;
            io.sync_all()?;
            log_len = FILE_HEADER_LEN as u64;
        } else {
            if file_len < FILE_HEADER_LEN as u64 {
                return Err(VfsError::Corruption("log header truncated"));
            }
            let mut head = [0u8; FILE_HEADER_LEN];
            io.read_at(&mut head, 0)?;
            salt = FileHeader::decode(&head)?.salt;
            let valid = Self::replay(io.as_ref(), &mut maps)?;
            if valid < file_len {
                warn!(
                    dropped = file_len - valid,
                    "torn log tail truncated on open"
                );
                io.truncate(valid)?;
                io.sync_all()?;
            }
            log_len = valid;
        }
        Ok(Self {
            state: Mutex::new(StoreState {
                io,
                maps,
                log_len,
                txn: None,
                next_token: 1,
                salt,
                stats: StoreStats::default(),
                poisoned: false,
            }),
            txn_done: Condvar::new(),
            path,
            options,
        })
    }

    /// Applies committed batches and returns the offset just past the last
    /// commit frame. Anything beyond it did not finish committing.
    fn replay(io: &(dyn FileIo + Send + Sync), maps: &mut StoreMaps) -> Result<u64> {
        let len = io.len()?;
        let mut pos = FILE_HEADER_LEN as u64;
        let mut valid = pos;
        let mut pending: Vec<Frame> = Vec::new();
        while pos + FRAME_HEADER_LEN as u64 <= len {
            let mut head = [0u8; FRAME_HEADER_LEN];
            io.read_at(&mut head, pos)?;
            let Ok(header) = FrameHeader::decode(&head) else {
                break;
            };
            let body_start = pos + FRAME_HEADER_LEN as u64;
            let body_end = body_start + header.payload_len as u64;
            if body_end > len {
                break;
            }
            let mut payload = vec![0u8; header.payload_len as usize];
            if header.payload_len > 0 {
                io.read_at(&mut payload, body_start)?;
            }
            if compute_crc32(&[&payload]) != header.payload_crc32 {
                break;
            }
            let Ok(frame) = Frame::decode(header.kind, &payload) else {
                break;
            };
            pos = body_end;
            match frame {
                Frame::Commit => {
                    for staged in pending.drain(..) {
                        maps.apply(&staged);
                    }
                    valid = pos;
                }
                other => pending.push(other),
            }
        }
        Ok(valid)
    }

    /// Current log size in bytes.
    pub fn log_bytes(&self) -> u64 {
        self.state.lock().log_len
    }

    /// Identity of the current log generation; rotates on compaction.
    pub fn log_salt(&self) -> u64 {
        self.state.lock().salt
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StoreStats {
        self.state.lock().stats.clone()
    }

    /// Refuses durable work once the live handle is gone. Anything written
    /// past this point would land on the volatile placeholder and vanish.
    fn ensure_live(state: &StoreState) -> Result<()> {
        if state.poisoned {
            return Err(VfsError::Io(io::Error::new(
                io::ErrorKind::Other,
                "log handle lost during compaction",
            )));
        }
        Ok(())
    }

    /// Opens the single write transaction, waiting up to the configured
    /// timeout for the slot. Expiry surfaces as busy.
    pub fn begin(&self) -> Result<TxnToken> {
        let deadline = Instant::now() + self.options.begin_timeout;
        let mut guard = self.state.lock();
        while guard.txn.is_some() {
            if self.txn_done.wait_until(&mut guard, deadline).timed_out()
                && guard.txn.is_some()
            {
                return Err(VfsError::Busy("store write transaction slot timed out"));
            }
        }
        // Checked after the wait: the slot holder may have poisoned the
        // store before waking us.
        Self::ensure_live(&guard)?;
        let token = TxnToken(guard.next_token);
        guard.next_token += 1;
        guard.txn = Some(TxnState {
            token,
            staged: Vec::new(),
            undo: Vec::new(),
        });
        Ok(token)
    }

    fn stage(state: &mut StoreState, token: TxnToken, frame: Frame) -> Result<()> {
        {
            let txn = state
                .txn
                .as_ref()
                .ok_or(VfsError::Invalid("no open store transaction"))?;
            if txn.token != token {
                return Err(VfsError::Invalid("stale store transaction token"));
            }
        }
        let undo = state.maps.capture_undo(&frame);
        state.maps.apply(&frame);
        let txn = state
            .txn
            .as_mut()
            .ok_or(VfsError::Invalid("no open store transaction"))?;
        txn.undo.push(undo);
        txn.staged.push(frame);
        Ok(())
    }

    /// Stores `data` under `key`, visible to reads immediately.
    pub fn put_block(&self, token: TxnToken, key: BlockKey, data: BlockData) -> Result<()> {
        let mut guard = self.state.lock();
        Self::stage(&mut guard, token, Frame::PutBlock { key, data })
    }

    /// Removes the exact `key`.
    pub fn delete_block(&self, token: TxnToken, key: &BlockKey) -> Result<()> {
        let mut guard = self.state.lock();
        Self::stage(&mut guard, token, Frame::DeleteBlock { key: key.clone() })
    }

    /// Deletes every block of `path` whose version is strictly newer than
    /// `floor` (orphans of abandoned batches). Returns the number removed.
    pub fn delete_versions_newer_than(
        &self,
        token: TxnToken,
        path: &str,
        floor: Version,
    ) -> Result<u64> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let start = (path.to_string(), Version(i64::MIN), 0u64);
        let end = (path.to_string(), floor, 0u64);
        let doomed: Vec<BlockKey> = state
            .maps
            .by_version
            .range(start..end)
            .map(|(p, v, o)| BlockKey::new(p.clone(), *o, *v))
            .collect();
        let removed = doomed.len() as u64;
        for key in doomed {
            Self::stage(state, token, Frame::DeleteBlock { key })?;
        }
        Ok(removed)
    }

    /// Deletes every version of `path` at `offset` strictly older than
    /// `than`. Returns the number removed.
    pub fn delete_versions_older_than(
        &self,
        token: TxnToken,
        path: &str,
        offset: u64,
        than: Version,
    ) -> Result<u64> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let start = Bound::Excluded(BlockKey::new(path, offset, than));
        let end = Bound::Included(BlockKey::new(path, offset, Version(i64::MAX)));
        let doomed: Vec<BlockKey> = state
            .maps
            .blocks
            .range((start, end))
            .map(|(key, _)| key.clone())
            .collect();
        let removed = doomed.len() as u64;
        for key in doomed {
            Self::stage(state, token, Frame::DeleteBlock { key })?;
        }
        Ok(removed)
    }

    /// Deletes every block version of `path` at offsets at or past `from`.
    pub fn delete_offsets_from(&self, token: TxnToken, path: &str, from: u64) -> Result<u64> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let start = BlockKey::new(path, from, Version(i64::MIN));
        let end = BlockKey::new(path, u64::MAX, Version(i64::MAX));
        let doomed: Vec<BlockKey> = state
            .maps
            .blocks
            .range(start..=end)
            .map(|(key, _)| key.clone())
            .collect();
        let removed = doomed.len() as u64;
        for key in doomed {
            Self::stage(state, token, Frame::DeleteBlock { key })?;
        }
        Ok(removed)
    }

    /// Deletes every record of `path`: all block versions plus its purge
    /// record.
    pub fn delete_path(&self, token: TxnToken, path: &str) -> Result<u64> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let start = BlockKey::new(path, 0, Version(i64::MIN));
        let end = BlockKey::new(path, u64::MAX, Version(i64::MAX));
        let doomed: Vec<BlockKey> = state
            .maps
            .blocks
            .range(start..=end)
            .map(|(key, _)| key.clone())
            .collect();
        let removed = doomed.len() as u64;
        for key in doomed {
            Self::stage(state, token, Frame::DeleteBlock { key })?;
        }
        if state.maps.purges.contains_key(path) {
            Self::stage(
                state,
                token,
                Frame::DeletePurge {
                    path: path.to_string(),
                },
            )?;
        }
        Ok(removed)
    }

    /// Stores the purge record for `path`.
    pub fn put_purge(&self, token: TxnToken, path: &str, record: PurgeRecord) -> Result<()> {
        let mut guard = self.state.lock();
        Self::stage(
            &mut guard,
            token,
            Frame::PutPurge {
                path: path.to_string(),
                record,
            },
        )
    }

    /// Drops the purge record for `path`.
    pub fn delete_purge(&self, token: TxnToken, path: &str) -> Result<()> {
        let mut guard = self.state.lock();
        Self::stage(
            &mut guard,
            token,
            Frame::DeletePurge {
                path: path.to_string(),
            },
        )
    }

    /// Makes the transaction durable: appends its frames plus a commit
    /// frame, fsyncing per the synchronous mode. A failed append rolls the
    /// whole transaction back before reporting the error; a failure in the
    /// compaction that may follow is logged, never returned.
    pub fn commit(&self, token: TxnToken) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        Self::ensure_live(state)?;
        let txn = state
            .txn
            .take()
            .ok_or(VfsError::Invalid("no open store transaction"))?;
        if txn.token != token {
            state.txn = Some(txn);
            return Err(VfsError::Invalid("stale store transaction token"));
        }
        if txn.staged.is_empty() {
            self.txn_done.notify_all();
            return Ok(());
        }

        let appended = (|| -> Result<u64> {
            let mut buf = Vec::new();
            for frame in &txn.staged {
                frame.encode_into(&mut buf)?;
            }
            Frame::Commit.encode_into(&mut buf)?;
            state.io.write_at(&buf, state.log_len)?;
            if self.options.synchronous == Synchronous::Full {
                state.io.sync_all()?;
                state.stats.syncs += 1;
            }
            Ok(buf.len() as u64)
        })();

        match appended {
            Ok(bytes) => {
                state.log_len += bytes;
                state.stats.frames_appended += txn.staged.len() as u64 + 1;
                state.stats.bytes_appended += bytes;
                state.stats.commits += 1;
                // The commit is durable at this point; compaction trouble
                // must not be reported as a commit failure. A lost handle
                // poisons the store instead.
                if let Err(err) = self.maybe_compact(state) {
                    warn!(%err, "post-commit compaction failed");
                }
                self.txn_done.notify_all();
                Ok(())
            }
            Err(err) => {
                for op in txn.undo.into_iter().rev() {
                    state.maps.undo(op);
                }
                state.stats.rollbacks += 1;
                self.txn_done.notify_all();
                Err(err)
            }
        }
    }

    /// Reverts every staged operation of the transaction. Nothing reaches
    /// the log.
    pub fn rollback(&self, token: TxnToken) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let txn = state
            .txn
            .take()
            .ok_or(VfsError::Invalid("no open store transaction"))?;
        if txn.token != token {
            state.txn = Some(txn);
            return Err(VfsError::Invalid("stale store transaction token"));
        }
        for op in txn.undo.into_iter().rev() {
            state.maps.undo(op);
        }
        state.stats.rollbacks += 1;
        self.txn_done.notify_all();
        Ok(())
    }

    /// Fsyncs the log (unless synchronous is off).
    pub fn sync_log(&self) -> Result<()> {
        let mut guard = self.state.lock();
        Self::ensure_live(&guard)?;
        if self.options.synchronous == Synchronous::Off {
            return Ok(());
        }
        guard.io.sync_all()?;
        guard.stats.syncs += 1;
        Ok(())
    }

    /// Exact-key lookup.
    pub fn get(&self, key: &BlockKey) -> Option<BlockData> {
        self.state.lock().maps.blocks.get(key).cloned()
    }

    /// Versions stored for (`path`, `offset`), newest first.
    pub fn block_versions(&self, path: &str, offset: u64) -> Vec<Version> {
        let guard = self.state.lock();
        let start = BlockKey::new(path, offset, Version(i64::MIN));
        let end = BlockKey::new(path, offset, Version(i64::MAX));
        guard
            .maps
            .blocks
            .range(start..=end)
            .map(|(key, _)| key.version)
            .collect()
    }

    /// The newest version of (`path`, `offset`) visible at `floor`.
    pub fn newest_visible(
        &self,
        path: &str,
        offset: u64,
        floor: Version,
    ) -> Option<(Version, BlockData)> {
        let guard = self.state.lock();
        let start = BlockKey::new(path, offset, floor);
        let end = BlockKey::new(path, offset, Version(i64::MAX));
        guard
            .maps
            .blocks
            .range(start..=end)
            .next()
            .map(|(key, data)| (key.version, data.clone()))
    }

    /// Every offset of `path` with a version visible at `floor`, ascending,
    /// paired with that visible version.
    pub fn visible_blocks(&self, path: &str, floor: Version) -> Vec<(u64, Version)> {
        let guard = self.state.lock();
        let start = BlockKey::new(path, 0, Version(i64::MIN));
        let end = BlockKey::new(path, u64::MAX, Version(i64::MAX));
        let mut out = Vec::new();
        let mut resolved: Option<u64> = None;
        for (key, _) in guard.maps.blocks.range(start..=end) {
            if resolved == Some(key.offset) {
                continue;
            }
            if key.version >= floor {
                out.push((key.offset, key.version));
                resolved = Some(key.offset);
            }
        }
        out
    }

    /// Clone of `path`'s purge record, if any.
    pub fn purge_record(&self, path: &str) -> Option<PurgeRecord> {
        self.state.lock().maps.purges.get(path).cloned()
    }

    /// Rewrites the log to exactly the live state. Requires no transaction
    /// to be open.
    pub fn compact(&self) -> Result<CompactReport> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        Self::ensure_live(state)?;
        if state.txn.is_some() {
            return Err(VfsError::Invalid("compaction inside a transaction"));
        }
        self.compact_locked(state)
    }

    fn maybe_compact(&self, state: &mut StoreState) -> Result<()> {
        if state.log_len < COMPACT_MIN_BYTES {
            return Ok(());
        }
        let live = state.maps.live_estimate().max(1);
        if state.log_len > u64::from(self.options.compact_ratio) * live {
            let report = self.compact_locked(state)?;
            debug!(
                log_bytes_before = report.log_bytes_before,
                log_bytes_after = report.log_bytes_after,
                "log compacted after commit"
            );
        }
        Ok(())
    }

    fn compact_locked(&self, state: &mut StoreState) -> Result<CompactReport> {
        let before = state.log_len;
        let salt = rand::random::<u64>();
        let mut buf = Vec::with_capacity(state.maps.live_estimate() as usize + FRAME_HEADER_LEN);
        buf.extend_from_slice(&FileHeader { salt }.encode());
        for (path, record) in &state.maps.purges {
            append_frame(&mut buf, FRAME_PUT_PURGE, &put_purge_payload(path, record)?)?;
        }
        for (key, data) in &state.maps.blocks {
            append_frame(&mut buf, FRAME_PUT_BLOCK, &put_block_payload(key, data)?)?;
        }
        append_frame(&mut buf, FRAME_COMMIT, &[])?;

        if let Some(path) = &self.path {
            let sibling = path.with_extension("compact");
            {
                let sib = StdFileIo::open(&sibling)?;
                sib.truncate(0)?;
                sib.write_at(&buf, 0)?;
                sib.sync_all()?;
            }
            // Close the live handle so the rename can land on every platform.
            let released = std::mem::replace(&mut state.io, Arc::new(MemFileIo::new()) as DynIo);
            drop(released);
            let renamed = std::fs::rename(&sibling, path);
            match StdFileIo::open_existing(path) {
                Ok(reopened) => state.io = Arc::new(reopened),
                Err(err) => {
                    // Nothing durable can land on the placeholder handle.
                    state.poisoned = true;
                    warn!(%err, "log reopen failed after compaction, store disabled");
                    return Err(err);
                }
            }
            renamed?;
        } else {
            state.io.truncate(0)?;
            state.io.write_at(&buf, 0)?;
            state.io.sync_all()?;
        }

        state.log_len = buf.len() as u64;
        state.salt = salt;
        state.stats.compactions += 1;
        let report = CompactReport {
            log_bytes_before: before,
            log_bytes_after: state.log_len,
            live_blocks: state.maps.blocks.len() as u64,
            live_purge_records: state.maps.purges.len() as u64,
        };
        info!(
            log_bytes_before = report.log_bytes_before,
            log_bytes_after = report.log_bytes_after,
            live_blocks = report.live_blocks,
            "block log compacted"
        );
        Ok(report)
    }
}
