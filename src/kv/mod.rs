#![forbid(unsafe_code)]
//! Versioned block store: key vocabulary, durability options and the
//! per-connection transaction chain.
//!
//! Blocks are keyed by (path, offset, version). Versions decrement with
//! every write epoch, so numerically smaller means newer; a reader resolves
//! an offset to the smallest version at or above its visibility floor. The
//! store itself lives in [`log`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::types::{Result, Version};

pub mod log;

pub use log::{CompactReport, LogStore, StoreStats, TxnToken};

/// Key of one stored block.
///
/// Ordering is (path, offset, version) with versions ascending numerically,
/// which puts the newest version of an offset first in a range scan that
/// starts at the visibility floor.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockKey {
    /// Logical file the block belongs to.
    pub path: String,
    /// Byte position of the block's first byte.
    pub offset: u64,
    /// Write epoch that produced the block.
    pub version: Version,
}

impl BlockKey {
    /// Key for `path`'s block at `offset` written in `version`.
    pub fn new(path: impl Into<String>, offset: u64, version: Version) -> Self {
        Self {
            path: path.into(),
            offset,
            version,
        }
    }
}

/// Payload of one stored block. Block 0 additionally carries the file size.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockData {
    /// Raw block bytes.
    pub bytes: Vec<u8>,
    /// Total logical file size; set only on block 0.
    pub file_size: Option<u64>,
}

impl BlockData {
    /// Plain data block.
    pub fn bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            file_size: None,
        }
    }

    /// Metadata block carrying the file size.
    pub fn metadata(bytes: Vec<u8>, file_size: u64) -> Self {
        Self {
            bytes,
            file_size: Some(file_size),
        }
    }
}

/// Per-path ledger of block versions superseded by committed batches.
///
/// Each entry maps an offset to the version that replaced it; the purge
/// sweep deletes everything older at that offset and then drops the record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PurgeRecord {
    /// offset → superseding version.
    pub superseded: BTreeMap<u64, Version>,
    /// Superseded versions accumulated since the last sweep.
    pub count: u64,
}

impl PurgeRecord {
    /// Folds one committed batch into the record.
    pub fn absorb(&mut self, version: Version, offsets: impl IntoIterator<Item = u64>) {
        for offset in offsets {
            self.superseded.insert(offset, version);
            self.count += 1;
        }
    }
}

/// Durability mode for log synchronization.
///
/// Controls when the log is synchronized to disk, trading performance for
/// durability.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum Synchronous {
    /// Sync to disk after each commit (most durable).
    #[default]
    Full,
    /// Sync only at explicit flush points (balanced).
    Normal,
    /// No explicit syncs (fastest but least durable).
    Off,
}

/// Store construction tunables.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// When the log is fsynced.
    pub synchronous: Synchronous,
    /// Compact once the log grows past this multiple of the live payload.
    pub compact_ratio: u32,
    /// How long `begin` waits for the single write transaction slot.
    pub begin_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            synchronous: Synchronous::default(),
            compact_ratio: 4,
            begin_timeout: Duration::from_secs(5),
        }
    }
}

struct OpenChain {
    token: TxnToken,
    started: Instant,
}

/// One connection's serialized access to the store.
///
/// Consecutive operations reuse a single open store transaction (the chain)
/// until it ages past `txn_lifetime`, at which point it is committed and a
/// fresh one begins. `flush` commits the chain and syncs the log; it is the
/// durability barrier behind the VFS sync operation.
pub struct KvContext {
    store: Arc<LogStore>,
    chain: Mutex<Option<OpenChain>>,
    txn_lifetime: Duration,
}

impl KvContext {
    /// Default bound on how long one chained transaction stays open.
    pub const DEFAULT_TXN_LIFETIME: Duration = Duration::from_secs(3);

    /// Creates a context over `store`.
    pub fn new(store: Arc<LogStore>, txn_lifetime: Duration) -> Self {
        Self {
            store,
            chain: Mutex::new(None),
            txn_lifetime,
        }
    }

    /// The shared store, for read-only lookups that need no transaction.
    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    /// Runs `f` inside the chained transaction, starting or rotating it as
    /// needed. An error from `f` rolls the chain back before propagating.
    pub fn with_txn<T>(&self, f: impl FnOnce(&LogStore, TxnToken) -> Result<T>) -> Result<T> {
        let mut chain = self.chain.lock();
        if let Some(open) = chain.as_ref() {
            if open.started.elapsed() >= self.txn_lifetime {
                let token = open.token;
                *chain = None;
                self.store.commit(token)?;
            }
        }
        let token = match chain.as_ref() {
            Some(open) => open.token,
            None => {
                let token = self.store.begin()?;
                *chain = Some(OpenChain {
                    token,
                    started: Instant::now(),
                });
                token
            }
        };
        match f(&self.store, token) {
            Ok(value) => Ok(value),
            Err(err) => {
                *chain = None;
                let _ = self.store.rollback(token);
                Err(err)
            }
        }
    }

    /// Commits the chain (if open) and syncs the log.
    pub fn flush(&self) -> Result<()> {
        let mut chain = self.chain.lock();
        if let Some(open) = chain.take() {
            self.store.commit(open.token)?;
        }
        drop(chain);
        self.store.sync_log()
    }

    /// Commits the chain without the sync barrier. Used at teardown.
    pub fn settle(&self) -> Result<()> {
        let mut chain = self.chain.lock();
        if let Some(open) = chain.take() {
            self.store.commit(open.token)?;
        }
        Ok(())
    }
}

impl Drop for KvContext {
    fn drop(&mut self) {
        let _ = self.settle();
    }
}
