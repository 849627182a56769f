#![forbid(unsafe_code)]
//! Versioned batch-atomic VFS over the log-backed block store.
//!
//! A logical file's bytes live as blocks keyed by (path, offset, version).
//! Versions decrement per write epoch, so numerically smaller is newer.
//! Block 0 doubles as the file's metadata record: it carries the total size,
//! and its version is the connection's visibility floor. A read resolves each
//! offset to the newest stored version that is not newer than the floor,
//! which gives block-granular snapshot isolation without read locks.
//!
//! The engine's atomic-batch file controls map onto the version scheme
//! directly. Begin opens a new epoch; batch page writes persist immediately
//! under it, invisible to every floor until commit writes block 0 under the
//! same epoch. That single store transaction is the whole commit. Rollback
//! just forgets the epoch; the stranded versions are deleted later by the
//! purge sweep or by the next begin on the same path.

use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::kv::{
    BlockData, BlockKey, KvContext, LogStore, StoreOptions, Synchronous, TxnToken,
};
use crate::locks::{LeaseManager, LockOptions, PathLock};
use crate::types::{FileId, Result, Version, VfsError};
use crate::vfs::{
    iocap, AccessCheck, ControlOutcome, FileControl, LockLevel, OpenFlags, ReadOutcome, Vfs,
};

mod reblock;

/// Length of the random part of generated temporary names.
const TEMP_NAME_LEN: usize = 12;

/// When superseded block versions are garbage-collected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PurgePolicy {
    /// Sweep on a background thread once a path's superseded count reaches
    /// the threshold.
    #[default]
    Deferred,
    /// Never sweep automatically; the embedder calls `purge_path`.
    Manual,
}

/// Tunables for the batch-atomic adapter.
#[derive(Clone, Debug)]
pub struct BatchOptions {
    /// Durability mode handed to the store when this adapter creates it.
    /// Ignored by `with_store`, where the store is already configured.
    pub synchronous: Synchronous,
    /// Purge scheduling policy.
    pub purge: PurgePolicy,
    /// Superseded-version count that triggers a deferred sweep.
    pub purge_at_least: u64,
    /// Bound on how long one chained store transaction stays open.
    pub txn_lifetime: Duration,
    /// Lease wait and reserved-poll tunables for the path locks.
    pub lock: LockOptions,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            synchronous: Synchronous::default(),
            purge: PurgePolicy::default(),
            purge_at_least: 16,
            txn_lifetime: KvContext::DEFAULT_TXN_LIFETIME,
            lock: LockOptions::default(),
        }
    }
}

/// Cumulative adapter counters.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchStats {
    /// Read calls served.
    pub reads: u64,
    /// Write calls served.
    pub writes: u64,
    /// Atomic batches opened.
    pub batches_started: u64,
    /// Atomic batches committed.
    pub batches_committed: u64,
    /// Atomic batches rolled back.
    pub batches_rolled_back: u64,
    /// Page-size conversion passes completed.
    pub reblocks: u64,
    /// Deferred purge sweeps scheduled.
    pub purges_scheduled: u64,
    /// Purge sweeps completed (deferred or manual).
    pub purges_completed: u64,
}

#[derive(Default)]
struct BatchCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    batches_started: AtomicU64,
    batches_committed: AtomicU64,
    batches_rolled_back: AtomicU64,
    reblocks: AtomicU64,
    purges_scheduled: AtomicU64,
    purges_completed: AtomicU64,
}

/// Outcome of one purge sweep over a path.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PurgeReport {
    /// Distinct offsets the sweep visited.
    pub offsets_swept: u64,
    /// Stale block versions deleted.
    pub versions_deleted: u64,
    /// Superseded-version count the record had accumulated.
    pub batches_absorbed: u64,
}

/// An open atomic batch: one new write epoch plus its bookkeeping.
struct ActiveBatch {
    /// The epoch this batch writes under; becomes the floor on commit.
    version: Version,
    /// Offsets inside the pre-batch extent that the batch overwrote.
    changed: BTreeSet<u64>,
    /// Block 0 held in memory only until commit.
    block0: BlockData,
    /// File size when the batch began; writes past it are appends.
    prior_size: u64,
    /// False until the batch writes anything.
    touched: bool,
}

struct BatchFile {
    path: String,
    flags: OpenFlags,
    /// Committed block 0 this descriptor last observed.
    block0: BlockData,
    /// Version of the cached block 0; the visibility floor.
    version: Version,
    /// Block 0 metadata (file size) changed but was not written durably yet.
    dirty: bool,
    /// The engine announced a whole-file rewrite; cleared by commit phase
    /// two.
    overwrite_hint: bool,
    batch: Option<ActiveBatch>,
    lock: PathLock,
}

impl BatchFile {
    fn size(&self) -> u64 {
        let block0 = match &self.batch {
            Some(batch) => &batch.block0,
            None => &self.block0,
        };
        block0.file_size.unwrap_or(block0.bytes.len() as u64)
    }

    /// The floor reads resolve against: the batch epoch while one is open,
    /// so the batch observes its own writes.
    fn read_floor(&self) -> Version {
        match &self.batch {
            Some(batch) => batch.version,
            None => self.version,
        }
    }

    fn effective_block0(&self) -> &BlockData {
        match &self.batch {
            Some(batch) => &batch.block0,
            None => &self.block0,
        }
    }
}

struct BatchState {
    files: FxHashMap<FileId, BatchFile>,
    next_file_id: u64,
}

/// One connection of the versioned batch-atomic adapter.
///
/// Connections sharing a substrate are built over the same store and lease
/// manager with [`BatchAtomicVfs::with_store`]; each keeps its own open-file
/// table, caches, and transaction chain.
pub struct BatchAtomicVfs {
    ctx: KvContext,
    leases: LeaseManager,
    options: BatchOptions,
    state: Mutex<BatchState>,
    counters: Arc<BatchCounters>,
    /// Paths with a purge sweep scheduled but not finished.
    pending_purges: Arc<Mutex<FxHashSet<String>>>,
}

impl BatchAtomicVfs {
    /// Opens (or creates) the adapter over the log file at `path`.
    pub fn open(path: &Path, options: BatchOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(VfsError::from)?;
            }
        }
        let store_options = StoreOptions {
            synchronous: options.synchronous,
            ..StoreOptions::default()
        };
        let store = Arc::new(LogStore::open(path, store_options)?);
        Ok(Self::with_store(store, LeaseManager::new(), options))
    }

    /// Adapter over a volatile in-memory store.
    pub fn in_memory(options: BatchOptions) -> Result<Self> {
        let store_options = StoreOptions {
            synchronous: options.synchronous,
            ..StoreOptions::default()
        };
        let store = Arc::new(LogStore::in_memory(store_options)?);
        Ok(Self::with_store(store, LeaseManager::new(), options))
    }

    /// Builds a connection over an existing store and lease manager. This is
    /// how multiple connections share one substrate.
    pub fn with_store(
        store: Arc<LogStore>,
        leases: LeaseManager,
        options: BatchOptions,
    ) -> Self {
        Self {
            ctx: KvContext::new(store, options.txn_lifetime),
            leases,
            options,
            state: Mutex::new(BatchState {
                files: FxHashMap::default(),
                next_file_id: 1,
            }),
            counters: Arc::new(BatchCounters::default()),
            pending_purges: Arc::new(Mutex::new(FxHashSet::default())),
        }
    }

    /// The shared store handle.
    pub fn store(&self) -> &Arc<LogStore> {
        self.ctx.store()
    }

    /// The lease manager; clone it into sibling connections.
    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// Counter snapshot.
    pub fn stats(&self) -> BatchStats {
        BatchStats {
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            batches_started: self.counters.batches_started.load(Ordering::Relaxed),
            batches_committed: self.counters.batches_committed.load(Ordering::Relaxed),
            batches_rolled_back: self.counters.batches_rolled_back.load(Ordering::Relaxed),
            reblocks: self.counters.reblocks.load(Ordering::Relaxed),
            purges_scheduled: self.counters.purges_scheduled.load(Ordering::Relaxed),
            purges_completed: self.counters.purges_completed.load(Ordering::Relaxed),
        }
    }

    /// Flushes the chained transaction and releases the connection. Open
    /// files should be closed first; this only finishes the store side.
    pub fn shutdown(self) -> Result<()> {
        let open_files = self.state.lock().files.len();
        if open_files > 0 {
            warn!(open_files, "adapter shut down with files still open");
        }
        self.ctx.flush()
    }

    /// Sweeps `name`'s purge record now, regardless of policy or threshold.
    pub fn purge_path(&self, name: &str) -> Result<PurgeReport> {
        let report = self
            .ctx
            .with_txn(|store, token| Self::sweep_path(store, token, name))?;
        if report.offsets_swept > 0 {
            self.counters.purges_completed.fetch_add(1, Ordering::Relaxed);
            info!(
                path = name,
                offsets = report.offsets_swept,
                versions = report.versions_deleted,
                "purge sweep completed"
            );
        }
        Ok(report)
    }

    /// Deletes, for every offset in the purge record, all versions strictly
    /// older than the recorded superseding one, then drops the record. The
    /// caller owns the transaction, so the record cannot change mid-sweep.
    fn sweep_path(store: &LogStore, token: TxnToken, path: &str) -> Result<PurgeReport> {
        let Some(record) = store.purge_record(path) else {
            return Ok(PurgeReport::default());
        };
        let mut versions_deleted = 0;
        for (&offset, &superseding) in &record.superseded {
            versions_deleted +=
                store.delete_versions_older_than(token, path, offset, superseding)?;
        }
        store.delete_purge(token, path)?;
        Ok(PurgeReport {
            offsets_swept: record.superseded.len() as u64,
            versions_deleted,
            batches_absorbed: record.count,
        })
    }

    /// Schedules a deferred sweep for `path` when the policy allows, the
    /// threshold is reached, and no sweep is already pending.
    fn maybe_schedule_purge(&self, path: &str) {
        if self.options.purge != PurgePolicy::Deferred {
            return;
        }
        let count = match self.ctx.store().purge_record(path) {
            Some(record) => record.count,
            None => return,
        };
        if count < self.options.purge_at_least {
            return;
        }
        if !self.pending_purges.lock().insert(path.to_string()) {
            return;
        }

        let store = Arc::clone(self.ctx.store());
        let counters = Arc::clone(&self.counters);
        let pending = Arc::clone(&self.pending_purges);
        let owned = path.to_string();
        let spawned = std::thread::Builder::new()
            .name("bodega-purge".into())
            .spawn(move || {
                match Self::sweep_in_own_txn(&store, &owned) {
                    Ok(report) if report.offsets_swept > 0 => {
                        counters.purges_completed.fetch_add(1, Ordering::Relaxed);
                        info!(
                            path = %owned,
                            offsets = report.offsets_swept,
                            versions = report.versions_deleted,
                            "purge sweep completed"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => {
                        debug!(path = %owned, %err, "purge sweep skipped");
                    }
                }
                pending.lock().remove(&owned);
            });
        match spawned {
            Ok(_) => {
                self.counters.purges_scheduled.fetch_add(1, Ordering::Relaxed);
                debug!(path, count, "purge sweep scheduled");
            }
            Err(err) => {
                self.pending_purges.lock().remove(path);
                warn!(%err, "purge worker failed to spawn");
            }
        }
    }

    fn sweep_in_own_txn(store: &LogStore, path: &str) -> Result<PurgeReport> {
        let token = store.begin()?;
        match Self::sweep_path(store, token, path) {
            Ok(report) => {
                store.commit(token)?;
                Ok(report)
            }
            Err(err) => {
                let _ = store.rollback(token);
                Err(err)
            }
        }
    }

    fn random_temp_name() -> String {
        let noise: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TEMP_NAME_LEN)
            .map(char::from)
            .collect();
        format!("temp-{noise}")
    }

    fn begin_batch(&self, file: &mut BatchFile) -> Result<()> {
        if file.batch.is_some() {
            return Err(VfsError::Invalid("atomic batch already open"));
        }
        let floor = file.version;
        let path = file.path.clone();
        let swept = self
            .ctx
            .with_txn(|store, token| store.delete_versions_newer_than(token, &path, floor))?;
        if swept > 0 {
            debug!(path = %file.path, swept, "stranded batch versions swept");
        }
        file.batch = Some(ActiveBatch {
            version: floor.next_epoch(),
            changed: BTreeSet::new(),
            block0: file.block0.clone(),
            prior_size: file.size(),
            touched: false,
        });
        self.counters.batches_started.fetch_add(1, Ordering::Relaxed);
        debug!(path = %file.path, version = floor.next_epoch().0, "atomic batch opened");
        Ok(())
    }

    fn commit_batch(&self, file: &mut BatchFile) -> Result<()> {
        let batch = file
            .batch
            .take()
            .ok_or(VfsError::Invalid("no open atomic batch"))?;
        if !batch.touched {
            return Ok(());
        }
        let path = file.path.clone();
        let changed = batch.changed.len();
        self.ctx.with_txn(|store, token| {
            store.put_block(
                token,
                BlockKey::new(path.as_str(), 0, batch.version),
                batch.block0.clone(),
            )?;
            if !batch.changed.is_empty() {
                let mut record = store.purge_record(&path).unwrap_or_default();
                record.absorb(batch.version, batch.changed.iter().copied());
                store.put_purge(token, &path, record)?;
            }
            Ok(())
        })?;
        file.version = batch.version;
        file.block0 = batch.block0;
        file.dirty = false;
        self.counters.batches_committed.fetch_add(1, Ordering::Relaxed);
        debug!(path = %file.path, version = file.version.0, changed, "atomic batch committed");
        self.maybe_schedule_purge(&file.path);
        Ok(())
    }

    fn rollback_batch(&self, file: &mut BatchFile) -> Result<()> {
        let Some(batch) = file.batch.take() else {
            return Ok(());
        };
        if batch.touched {
            // The stranded epoch stays in the store for purge or the next
            // begin; only the cache needs restoring.
            match self
                .ctx
                .store()
                .get(&BlockKey::new(file.path.as_str(), 0, file.version))
            {
                Some(prior) => file.block0 = prior,
                None if file.version == Version::ZERO => {
                    file.block0 = BlockData::metadata(Vec::new(), 0);
                }
                None => {
                    return Err(VfsError::Io(io::Error::new(
                        io::ErrorKind::NotFound,
                        "previous block 0 missing on rollback",
                    )));
                }
            }
        }
        self.counters.batches_rolled_back.fetch_add(1, Ordering::Relaxed);
        debug!(path = %file.path, "atomic batch rolled back");
        Ok(())
    }

    /// Writes the cached block 0 durably at the current floor.
    fn flush_block0(&self, file: &mut BatchFile) -> Result<()> {
        let path = file.path.clone();
        let key = BlockKey::new(path.as_str(), 0, file.version);
        let data = file.block0.clone();
        self.ctx
            .with_txn(move |store, token| store.put_block(token, key, data))?;
        file.dirty = false;
        Ok(())
    }
}

impl Vfs for BatchAtomicVfs {
    fn open(&self, name: Option<&str>, flags: OpenFlags) -> Result<FileId> {
        let generated;
        let (path, flags) = match name {
            Some(given) => (given, flags),
            None => {
                generated = Self::random_temp_name();
                (generated.as_str(), flags | OpenFlags::DELETE_ON_CLOSE)
            }
        };

        let (version, block0) = match self
            .ctx
            .store()
            .newest_visible(path, 0, Version(i64::MIN))
        {
            Some((version, data)) => (version, data),
            None => {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(VfsError::CantOpen(path.to_string()));
                }
                (Version::ZERO, BlockData::metadata(Vec::new(), 0))
            }
        };

        let mut state = self.state.lock();
        let id = FileId(state.next_file_id);
        state.next_file_id += 1;
        state.files.insert(
            id,
            BatchFile {
                path: path.to_string(),
                flags,
                block0,
                version,
                dirty: false,
                overwrite_hint: false,
                batch: None,
                lock: PathLock::new(self.leases.clone(), path, self.options.lock.clone()),
            },
        );
        Ok(id)
    }

    fn close(&self, file: FileId) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .files
            .remove(&file)
            .ok_or(VfsError::Invalid("unknown file id"))?;
        let last = state.files.is_empty();
        drop(state);

        if entry.flags.contains(OpenFlags::DELETE_ON_CLOSE) {
            let path = entry.path.clone();
            self.ctx
                .with_txn(|store, token| store.delete_path(token, &path))?;
        }
        drop(entry);
        if last {
            self.ctx.flush()?;
        }
        Ok(())
    }

    fn read(&self, file: FileId, buf: &mut [u8], offset: u64) -> Result<ReadOutcome> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock();
        let entry = state
            .files
            .get(&file)
            .ok_or(VfsError::Invalid("unknown file id"))?;
        if buf.is_empty() {
            return Ok(ReadOutcome::Complete);
        }
        let size = entry.size();
        let block0 = entry.effective_block0();

        // Requests starting inside block 0 are served from the cache; the
        // adapter never stitches adjacent blocks into one read.
        if offset < block0.bytes.len() as u64 {
            let start = offset as usize;
            let have = block0.bytes.len() - start;
            let valid = have.min(buf.len());
            buf[..valid].copy_from_slice(&block0.bytes[start..start + valid]);
            if valid < buf.len() {
                buf[valid..].fill(0);
                return Ok(ReadOutcome::Short { valid });
            }
            return Ok(ReadOutcome::Complete);
        }

        // Past the extent nothing is served, stale stored blocks included.
        if offset >= size {
            buf.fill(0);
            return Ok(ReadOutcome::Short { valid: 0 });
        }

        // The cached copy above is authoritative for block 0, so the store
        // is only consulted for later offsets.
        if offset > 0 {
            if let Some((_, data)) = self
                .ctx
                .store()
                .newest_visible(&entry.path, offset, entry.read_floor())
            {
                let cap = (size - offset).min(buf.len() as u64) as usize;
                let valid = data.bytes.len().min(cap);
                buf[..valid].copy_from_slice(&data.bytes[..valid]);
                if valid < buf.len() {
                    buf[valid..].fill(0);
                    return Ok(ReadOutcome::Short { valid });
                }
                return Ok(ReadOutcome::Complete);
            }
        }

        // No block at this offset: a hole inside the extent reads as zeros.
        buf.fill(0);
        let available = size - offset;
        if available < buf.len() as u64 {
            return Ok(ReadOutcome::Short {
                valid: available as usize,
            });
        }
        Ok(ReadOutcome::Complete)
    }

    fn write(&self, file: FileId, buf: &[u8], offset: u64) -> Result<()> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        let entry = state
            .files
            .get_mut(&file)
            .ok_or(VfsError::Invalid("unknown file id"))?;
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(VfsError::Invalid("write offset overflow"))?;

        if let Some(batch) = entry.batch.as_mut() {
            if offset == 0 {
                // Block 0 stays in memory until commit makes the batch
                // visible.
                batch.block0.bytes = buf.to_vec();
            } else {
                let key = BlockKey::new(entry.path.as_str(), offset, batch.version);
                let data = BlockData::bytes(buf.to_vec());
                self.ctx
                    .with_txn(move |store, token| store.put_block(token, key, data))?;
                if offset < batch.prior_size {
                    batch.changed.insert(offset);
                }
            }
            let size = batch.block0.file_size.unwrap_or(0).max(end);
            batch.block0.file_size = Some(size);
            batch.touched = true;
            return Ok(());
        }

        if offset == 0 {
            let size = entry.size().max(end);
            let data = BlockData::metadata(buf.to_vec(), size);
            let key = BlockKey::new(entry.path.as_str(), 0, entry.version);
            let stored = data.clone();
            self.ctx
                .with_txn(move |store, token| store.put_block(token, key, stored))?;
            entry.block0 = data;
            entry.dirty = false;
        } else {
            let key = BlockKey::new(entry.path.as_str(), offset, entry.version);
            let data = BlockData::bytes(buf.to_vec());
            self.ctx
                .with_txn(move |store, token| store.put_block(token, key, data))?;
            if end > entry.size() {
                entry.block0.file_size = Some(end);
                entry.dirty = true;
            }
        }
        Ok(())
    }

    fn truncate(&self, file: FileId, size: u64) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .files
            .get_mut(&file)
            .ok_or(VfsError::Invalid("unknown file id"))?;
        if size >= entry.size() {
            return Ok(());
        }
        // Block 0's record is kept and rewritten; everything at or past the
        // new size goes, in every version.
        let path = entry.path.clone();
        let from = size.max(1);
        self.ctx
            .with_txn(|store, token| store.delete_offsets_from(token, &path, from))?;

        if let Some(batch) = entry.batch.as_mut() {
            if size < batch.block0.bytes.len() as u64 {
                batch.block0.bytes.truncate(size as usize);
            }
            batch.block0.file_size = Some(size);
            batch.touched = true;
        } else {
            if size < entry.block0.bytes.len() as u64 {
                entry.block0.bytes.truncate(size as usize);
            }
            entry.block0.file_size = Some(size);
            entry.dirty = true;
        }
        Ok(())
    }

    fn sync(&self, file: FileId) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .files
            .get_mut(&file)
            .ok_or(VfsError::Invalid("unknown file id"))?;
        if entry.dirty && entry.batch.is_none() {
            self.flush_block0(entry)?;
        }
        drop(state);
        self.ctx.flush()
    }

    fn file_size(&self, file: FileId) -> Result<u64> {
        let state = self.state.lock();
        let entry = state
            .files
            .get(&file)
            .ok_or(VfsError::Invalid("unknown file id"))?;
        Ok(entry.size())
    }

    fn lock(&self, file: FileId, level: LockLevel) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .files
            .get_mut(&file)
            .ok_or(VfsError::Invalid("unknown file id"))?;
        let was = entry.lock.level();
        entry.lock.lock(level)?;
        // Crossing into shared re-reads block 0: another connection may have
        // committed since this descriptor last looked.
        if was == LockLevel::None
            && entry.lock.level() >= LockLevel::Shared
            && entry.batch.is_none()
            && !entry.dirty
        {
            if let Some((version, data)) = self
                .ctx
                .store()
                .newest_visible(&entry.path, 0, Version(i64::MIN))
            {
                entry.version = version;
                entry.block0 = data;
            }
        }
        Ok(())
    }

    fn unlock(&self, file: FileId, level: LockLevel) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .files
            .get_mut(&file)
            .ok_or(VfsError::Invalid("unknown file id"))?;
        entry.lock.unlock(level)
    }

    fn check_reserved_lock(&self, file: FileId) -> Result<bool> {
        let state = self.state.lock();
        let entry = state
            .files
            .get(&file)
            .ok_or(VfsError::Invalid("unknown file id"))?;
        Ok(entry.lock.is_somewhere_reserved())
    }

    fn file_control(&self, file: FileId, op: FileControl) -> Result<ControlOutcome> {
        let mut state = self.state.lock();
        let entry = state
            .files
            .get_mut(&file)
            .ok_or(VfsError::Invalid("unknown file id"))?;
        match op {
            FileControl::Overwrite => {
                entry.overwrite_hint = true;
            }
            FileControl::CommitPhaseTwo => {
                entry.overwrite_hint = false;
            }
            FileControl::Sync => {
                if entry.overwrite_hint {
                    if entry.batch.is_none() {
                        if let Some(fresh) = reblock::convert(
                            &self.ctx,
                            &entry.path,
                            entry.version,
                            &entry.block0,
                        )? {
                            entry.block0 = fresh;
                            entry.dirty = false;
                            self.counters.reblocks.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                } else if entry.dirty && entry.batch.is_none() {
                    self.flush_block0(entry)?;
                }
            }
            FileControl::BeginAtomicWrite => self.begin_batch(entry)?,
            FileControl::CommitAtomicWrite => self.commit_batch(entry)?,
            FileControl::RollbackAtomicWrite => self.rollback_batch(entry)?,
        }
        Ok(ControlOutcome::Handled)
    }

    fn sector_size(&self) -> u32 {
        512
    }

    fn device_characteristics(&self) -> u32 {
        iocap::BATCH_ATOMIC
            | iocap::SAFE_APPEND
            | iocap::SEQUENTIAL
            | iocap::UNDELETABLE_WHEN_OPEN
    }

    fn access(&self, name: &str, _check: AccessCheck) -> Result<bool> {
        // Journal and WAL companions live only as engine state on this
        // adapter, never as stored blocks.
        if name.ends_with("-journal") || name.ends_with("-wal") {
            return Ok(false);
        }
        Ok(self
            .ctx
            .store()
            .newest_visible(name, 0, Version(i64::MIN))
            .is_some())
    }

    fn delete(&self, name: &str, sync_dir: bool) -> Result<()> {
        let removed = self
            .ctx
            .with_txn(|store, token| store.delete_path(token, name))?;
        if removed > 0 {
            debug!(path = name, removed, "stored blocks deleted");
        }
        if sync_dir {
            self.ctx.flush()?;
        }
        Ok(())
    }
}
