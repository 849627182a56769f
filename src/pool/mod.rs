//! Handle-pool adapter: logical paths served by a fixed set of real files.
//!
//! The pool owns every file in its directory. Each backing file opens with a
//! self-describing header (see [`header`]) binding it to at most one logical
//! path; unbound files form the free set new paths draw from. Association is
//! the only thing that ever changes: deleting a logical file wipes a header
//! and returns the slot, it never unlinks the backing file.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::io::{FileIo, StdFileIo};
use crate::types::{FileId, Result, SlotId, VfsError};
use crate::vfs::{
    iocap, AccessCheck, ControlOutcome, FileControl, LockLevel, OpenFlags, ReadOutcome, Vfs,
};

mod dirlock;
pub mod header;

pub use dirlock::LOCK_FILE_NAME;

use dirlock::DirLock;
use header::{SlotHeader, DATA_OFFSET, HEADER_LEN};

/// Slots provisioned when a pool starts empty.
pub const DEFAULT_CAPACITY: u32 = 6;

const SECTOR_SIZE: u32 = 4096;
const BACKING_NAME_LEN: usize = 12;

/// Pool construction tunables.
#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Capacity provisioned when the directory holds no usable slots.
    pub initial_capacity: u32,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Counters describing the pool at one instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// All live slots, associated or free.
    pub capacity: u32,
    /// Slots currently bound to a path.
    pub size: u32,
    /// Slots available for new paths.
    pub free: u32,
}

struct Slot {
    io: StdFileIo,
    backing: PathBuf,
    header: SlotHeader,
}

struct OpenFile {
    path: String,
    flags: OpenFlags,
    slot: SlotId,
}

struct PoolState {
    slots: Vec<Option<Slot>>,
    free: BTreeSet<SlotId>,
    paths: FxHashMap<String, SlotId>,
    files: FxHashMap<FileId, OpenFile>,
    next_file_id: u64,
}

/// The handle-pool file system.
pub struct PoolVfs {
    state: Mutex<PoolState>,
    dir_lock: DirLock,
    root: PathBuf,
}

impl PoolVfs {
    /// Opens the pool rooted at `dir`, claiming the directory, scanning its
    /// backing files and provisioning `options.initial_capacity` slots when
    /// none survive the scan.
    pub fn open_dir(dir: &Path, options: PoolOptions) -> Result<Self> {
        let dir_lock = DirLock::acquire(dir)?;
        let root = dir_lock.dir().to_path_buf();

        let mut backings = Vec::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if entry.file_name() == LOCK_FILE_NAME {
                continue;
            }
            backings.push(entry.path());
        }
        backings.sort();

        let mut slots = Vec::with_capacity(backings.len());
        for backing in backings {
            let io = StdFileIo::open_existing(&backing)?;
            slots.push(Some(Slot {
                io,
                backing,
                header: SlotHeader::free(),
            }));
        }

        let vfs = Self {
            state: Mutex::new(PoolState {
                slots,
                free: BTreeSet::new(),
                paths: FxHashMap::default(),
                files: FxHashMap::default(),
                next_file_id: 1,
            }),
            dir_lock,
            root,
        };
        vfs.reset()?;
        if vfs.stats().capacity == 0 {
            vfs.add_capacity(options.initial_capacity)?;
        }
        Ok(vfs)
    }

    /// Directory this pool owns.
    pub fn root(&self) -> &Path {
        self.dir_lock.dir()
    }

    /// Snapshot of capacity counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let capacity = state.slots.iter().flatten().count() as u32;
        PoolStats {
            capacity,
            size: state.paths.len() as u32,
            free: state.free.len() as u32,
        }
    }

    /// All live slots, associated or free.
    pub fn capacity(&self) -> u32 {
        self.state.lock().slots.iter().flatten().count() as u32
    }

    /// Slots currently bound to a path.
    pub fn len(&self) -> u32 {
        self.state.lock().paths.len() as u32
    }

    /// True when no path is bound.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reopens every slot's handle and rebuilds the path map from the
    /// headers on disk. Slots whose header fails verification, or whose
    /// flags mark a file that should not have outlived its session, are
    /// wiped back to the free set.
    pub fn reset(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.paths.clear();
        state.free.clear();
        for index in 0..state.slots.len() {
            let id = SlotId(index as u32);
            let backing = match &state.slots[index] {
                Some(slot) => slot.backing.clone(),
                None => continue,
            };
            let io = match StdFileIo::open_existing(&backing) {
                Ok(io) => io,
                Err(err) => {
                    warn!(backing = %backing.display(), %err, "slot vanished, dropping");
                    state.slots[index] = None;
                    continue;
                }
            };
            let Some(slot) = state.slots[index].as_mut() else {
                continue;
            };
            slot.io = io;

            let header = Self::read_header(slot);
            match header {
                Ok(header) if header.is_free() => {
                    if slot.io.len()? != DATA_OFFSET {
                        Self::wipe_slot(slot)?;
                    } else {
                        slot.header = header;
                    }
                    state.free.insert(id);
                }
                Ok(header) => {
                    let path = header.path.clone().unwrap_or_default();
                    let persistent = header.flags.intersects(OpenFlags::PERSISTENT_TYPES)
                        && !header.flags.contains(OpenFlags::DELETE_ON_CLOSE);
                    if !persistent {
                        warn!(%path, "slot held a transient file, wiping");
                        Self::wipe_slot(slot)?;
                        state.free.insert(id);
                    } else if state.paths.contains_key(&path) {
                        warn!(%path, "duplicate slot for path, wiping the newer one");
                        Self::wipe_slot(slot)?;
                        state.free.insert(id);
                    } else {
                        slot.header = header;
                        state.paths.insert(path, id);
                    }
                }
                Err(err) => {
                    warn!(backing = %slot.backing.display(), %err, "unreadable slot header, wiping");
                    Self::wipe_slot(slot)?;
                    state.free.insert(id);
                }
            }
        }
        debug!(
            capacity = state.slots.iter().flatten().count(),
            associated = state.paths.len(),
            "pool reset complete"
        );
        Ok(())
    }

    /// Provisions `n` fresh free slots; returns how many were added.
    pub fn add_capacity(&self, n: u32) -> Result<u32> {
        let mut state = self.state.lock();
        for _ in 0..n {
            let backing = self.root.join(Self::random_backing_name());
            let io = StdFileIo::open(&backing)?;
            let slot = Slot {
                io,
                backing,
                header: SlotHeader::free(),
            };
            Self::wipe_slot(&slot)?;
            let id = SlotId(state.slots.len() as u32);
            state.slots.push(Some(slot));
            state.free.insert(id);
        }
        debug!(added = n, "pool capacity grown");
        Ok(n)
    }

    /// Removes up to `n` free slots, unlinking their backing files. Returns
    /// the count actually removed; associated slots are never touched.
    pub fn remove_capacity(&self, n: u32) -> Result<u32> {
        let mut state = self.state.lock();
        let mut removed = 0;
        while removed < n {
            let Some(&id) = state.free.iter().next_back() else {
                break;
            };
            state.free.remove(&id);
            if let Some(slot) = state.slots[id.0 as usize].take() {
                let backing = slot.backing.clone();
                drop(slot);
                fs::remove_file(&backing)?;
            }
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, "pool capacity shrunk");
        }
        Ok(removed)
    }

    /// Tears the pool down, unlinking every backing file and the directory
    /// claim.
    pub fn destroy(self) -> Result<()> {
        let Self {
            state, dir_lock, ..
        } = self;
        let state = state.into_inner();
        for slot in state.slots.into_iter().flatten() {
            let backing = slot.backing.clone();
            drop(slot);
            fs::remove_file(&backing)?;
        }
        let marker = dir_lock.lock_path().to_path_buf();
        let dir = dir_lock.dir().to_path_buf();
        drop(dir_lock);
        let _ = fs::remove_file(marker);
        let _ = fs::remove_dir(dir);
        Ok(())
    }

    fn random_backing_name() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(BACKING_NAME_LEN)
            .map(char::from)
            .collect()
    }

    fn read_header(slot: &Slot) -> Result<SlotHeader> {
        if slot.io.len()? < HEADER_LEN as u64 {
            return Err(VfsError::Corruption("slot shorter than its header"));
        }
        let mut buf = [0u8; HEADER_LEN];
        slot.io.read_at(&mut buf, 0)?;
        SlotHeader::decode(&buf)
    }

    fn write_header(slot: &Slot, header: &SlotHeader) -> Result<()> {
        slot.io.write_at(&header.encode(), 0)?;
        slot.io.sync_all()?;
        Ok(())
    }

    fn wipe_slot(slot: &Slot) -> Result<()> {
        // Header first; a crash before the truncate leaves stray data behind
        // a free header, which reset() heals. The reverse order would leave
        // a truncated file still claiming its old path.
        Self::write_header(slot, &SlotHeader::free())?;
        slot.io.truncate(DATA_OFFSET)?;
        Ok(())
    }

    fn disassociate_locked(state: &mut PoolState, path: &str) -> Result<()> {
        if let Some(id) = state.paths.remove(path) {
            if let Some(slot) = state.slots[id.0 as usize].as_mut() {
                Self::wipe_slot(slot)?;
                slot.header = SlotHeader::free();
            }
            state.free.insert(id);
        }
        Ok(())
    }

    fn slot_of<'a>(state: &'a PoolState, file: FileId) -> Result<&'a Slot> {
        let entry = state
            .files
            .get(&file)
            .ok_or(VfsError::Invalid("unknown file id"))?;
        state.slots[entry.slot.0 as usize]
            .as_ref()
            .ok_or(VfsError::Invalid("descriptor points at a removed slot"))
    }
}

impl Vfs for PoolVfs {
    fn open(&self, name: Option<&str>, flags: OpenFlags) -> Result<FileId> {
        let (path, flags) = match name {
            Some(name) => (name.to_string(), flags),
            None => (
                format!("tmp-{}", Self::random_backing_name()),
                flags | OpenFlags::DELETE_ON_CLOSE,
            ),
        };

        let mut state = self.state.lock();
        let slot_id = match state.paths.get(&path) {
            Some(&id) => id,
            None => {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(VfsError::CantOpen(path));
                }
                let Some(&id) = state.free.iter().next() else {
                    return Err(VfsError::CantOpen(format!(
                        "{path}: pool exhausted, grow capacity first"
                    )));
                };
                let header = SlotHeader::associated(&path, flags)?;
                {
                    let slot = state.slots[id.0 as usize]
                        .as_mut()
                        .ok_or(VfsError::Invalid("free set referenced a removed slot"))?;
                    Self::write_header(slot, &header)?;
                    slot.header = header;
                }
                state.free.remove(&id);
                state.paths.insert(path.clone(), id);
                id
            }
        };

        let id = FileId(state.next_file_id);
        state.next_file_id += 1;
        state.files.insert(
            id,
            OpenFile {
                path,
                flags,
                slot: slot_id,
            },
        );
        Ok(id)
    }

    fn close(&self, file: FileId) -> Result<()> {
        let mut state = self.state.lock();
        let Some(entry) = state.files.remove(&file) else {
            return Ok(());
        };
        if entry.flags.contains(OpenFlags::DELETE_ON_CLOSE) {
            Self::disassociate_locked(&mut state, &entry.path)?;
        }
        Ok(())
    }

    fn read(&self, file: FileId, buf: &mut [u8], offset: u64) -> Result<ReadOutcome> {
        let state = self.state.lock();
        let slot = Self::slot_of(&state, file)?;
        let data_len = slot.io.len()?.saturating_sub(DATA_OFFSET);
        let have = data_len.saturating_sub(offset);
        if have >= buf.len() as u64 {
            slot.io.read_at(buf, DATA_OFFSET + offset)?;
            return Ok(ReadOutcome::Complete);
        }
        let valid = have as usize;
        if valid > 0 {
            slot.io.read_at(&mut buf[..valid], DATA_OFFSET + offset)?;
        }
        buf[valid..].fill(0);
        Ok(ReadOutcome::Short { valid })
    }

    fn write(&self, file: FileId, buf: &[u8], offset: u64) -> Result<()> {
        let state = self.state.lock();
        let slot = Self::slot_of(&state, file)?;
        slot.io.write_at(buf, DATA_OFFSET + offset)
    }

    fn truncate(&self, file: FileId, size: u64) -> Result<()> {
        let state = self.state.lock();
        let slot = Self::slot_of(&state, file)?;
        slot.io.truncate(DATA_OFFSET + size)
    }

    fn sync(&self, file: FileId) -> Result<()> {
        let state = self.state.lock();
        let slot = Self::slot_of(&state, file)?;
        slot.io.sync_all()
    }

    fn file_size(&self, file: FileId) -> Result<u64> {
        let state = self.state.lock();
        let slot = Self::slot_of(&state, file)?;
        Ok(slot.io.len()?.saturating_sub(DATA_OFFSET))
    }

    // The pool is single-owner by construction, so the advisory ladder has
    // nothing to exclude.
    fn lock(&self, _file: FileId, _level: LockLevel) -> Result<()> {
        Ok(())
    }

    fn unlock(&self, _file: FileId, _level: LockLevel) -> Result<()> {
        Ok(())
    }

    fn check_reserved_lock(&self, _file: FileId) -> Result<bool> {
        Ok(false)
    }

    fn file_control(&self, _file: FileId, _op: FileControl) -> Result<ControlOutcome> {
        Ok(ControlOutcome::NotHandled)
    }

    fn sector_size(&self) -> u32 {
        SECTOR_SIZE
    }

    fn device_characteristics(&self) -> u32 {
        iocap::UNDELETABLE_WHEN_OPEN
    }

    fn access(&self, name: &str, _check: AccessCheck) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.paths.contains_key(name))
    }

    fn delete(&self, name: &str, _sync_dir: bool) -> Result<()> {
        let mut state = self.state.lock();
        Self::disassociate_locked(&mut state, name)
    }
}
