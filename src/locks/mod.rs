#![forbid(unsafe_code)]
//! Named shared/exclusive leases and the per-path advisory lock built on them.
//!
//! Each logical path uses two lease names. Readers end up holding only the
//! inner lease; a reserved writer holds the outer lease exclusively, which
//! admits no new readers while the ones already admitted drain, and the final
//! upgrade takes the inner lease exclusively.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::types::{Result, VfsError};
use crate::vfs::LockLevel;

/// Sharing mode of one lease acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseMode {
    /// Compatible with other shared holders.
    Shared,
    /// Excludes every other holder.
    Exclusive,
}

/// In-process table of named leases; clones share one table.
#[derive(Clone, Default)]
pub struct LeaseManager {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<LeaseTable>,
    changed: Condvar,
}

#[derive(Default)]
struct LeaseTable {
    leases: FxHashMap<String, LeaseState>,
}

#[derive(Default, Debug)]
struct LeaseState {
    shared: u32,
    exclusive: bool,
}

impl LeaseState {
    fn admits(&self, mode: LeaseMode) -> bool {
        match mode {
            LeaseMode::Shared => !self.exclusive,
            LeaseMode::Exclusive => !self.exclusive && self.shared == 0,
        }
    }

    fn grant(&mut self, mode: LeaseMode) {
        match mode {
            LeaseMode::Shared => self.shared += 1,
            LeaseMode::Exclusive => self.exclusive = true,
        }
    }

    fn is_idle(&self) -> bool {
        self.shared == 0 && !self.exclusive
    }
}

/// Observability snapshot of one lease name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LeaseSnapshot {
    /// Number of shared holders.
    pub shared: u32,
    /// Whether an exclusive holder exists.
    pub exclusive: bool,
}

impl LeaseManager {
    /// Creates an empty lease table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `name` in `mode`, blocking until granted or until `timeout`
    /// expires (reported as busy).
    pub fn acquire(
        &self,
        name: &str,
        mode: LeaseMode,
        timeout: Option<Duration>,
    ) -> Result<LeaseGuard> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut table = self.inner.state.lock();
        loop {
            let state = table.leases.entry(name.to_string()).or_default();
            if state.admits(mode) {
                state.grant(mode);
                return Ok(LeaseGuard {
                    inner: Arc::clone(&self.inner),
                    name: name.to_string(),
                    mode,
                });
            }
            match deadline {
                Some(deadline) => {
                    if self.inner.changed.wait_until(&mut table, deadline).timed_out() {
                        let state = table.leases.entry(name.to_string()).or_default();
                        if state.admits(mode) {
                            state.grant(mode);
                            return Ok(LeaseGuard {
                                inner: Arc::clone(&self.inner),
                                name: name.to_string(),
                                mode,
                            });
                        }
                        return Err(VfsError::Busy("lease wait timed out"));
                    }
                }
                None => self.inner.changed.wait(&mut table),
            }
        }
    }

    /// Acquires `name` in `mode` only when immediately available.
    pub fn try_acquire(&self, name: &str, mode: LeaseMode) -> Option<LeaseGuard> {
        let mut table = self.inner.state.lock();
        let state = table.leases.entry(name.to_string()).or_default();
        if state.admits(mode) {
            state.grant(mode);
            Some(LeaseGuard {
                inner: Arc::clone(&self.inner),
                name: name.to_string(),
                mode,
            })
        } else {
            None
        }
    }

    /// True when `name` is currently held exclusively by anyone.
    pub fn is_exclusively_held(&self, name: &str) -> bool {
        let table = self.inner.state.lock();
        table.leases.get(name).is_some_and(|s| s.exclusive)
    }

    /// Snapshot of one lease name's holders.
    pub fn probe(&self, name: &str) -> LeaseSnapshot {
        let table = self.inner.state.lock();
        table
            .leases
            .get(name)
            .map(|s| LeaseSnapshot {
                shared: s.shared,
                exclusive: s.exclusive,
            })
            .unwrap_or_default()
    }
}

/// A held lease; released on drop.
pub struct LeaseGuard {
    inner: Arc<Inner>,
    name: String,
    mode: LeaseMode,
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let mut table = self.inner.state.lock();
        if let Some(state) = table.leases.get_mut(&self.name) {
            match self.mode {
                LeaseMode::Shared => state.shared = state.shared.saturating_sub(1),
                LeaseMode::Exclusive => state.exclusive = false,
            }
            if state.is_idle() {
                table.leases.remove(&self.name);
            }
        }
        drop(table);
        self.inner.changed.notify_all();
    }
}

/// Tunables for the path lock.
#[derive(Clone, Debug)]
pub struct LockOptions {
    /// Bound on any blocking lease wait; expiry surfaces as busy. `None`
    /// waits indefinitely.
    pub timeout: Option<Duration>,
    /// First delay of the reserved poll loop.
    pub retry_start: Duration,
    /// Cap on the reserved poll delay.
    pub retry_cap: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            retry_start: Duration::from_millis(1),
            retry_cap: Duration::from_secs(1),
        }
    }
}

/// The engine's 5-level advisory lock for one path, driven over two leases.
pub struct PathLock {
    manager: LeaseManager,
    outer: String,
    inner: String,
    options: LockOptions,
    level: LockLevel,
    outer_guard: Option<LeaseGuard>,
    inner_guard: Option<LeaseGuard>,
}

impl PathLock {
    /// Creates an unlocked path lock for `path`.
    pub fn new(manager: LeaseManager, path: &str, options: LockOptions) -> Self {
        Self {
            manager,
            outer: format!("{path}-outer"),
            inner: format!("{path}-inner"),
            options,
            level: LockLevel::None,
            outer_guard: None,
            inner_guard: None,
        }
    }

    /// Current lock level.
    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// Upgrades to `level`; requests at or below the current level are no-ops.
    pub fn lock(&mut self, level: LockLevel) -> Result<()> {
        if level <= self.level {
            return Ok(());
        }
        match (self.level, level) {
            (LockLevel::None, LockLevel::Shared) => self.none_to_shared(),
            (LockLevel::None, LockLevel::Reserved) => {
                self.none_to_shared()?;
                self.shared_to_reserved()
            }
            (LockLevel::None, LockLevel::Exclusive) => {
                self.none_to_shared()?;
                self.shared_to_reserved()?;
                self.reserved_to_exclusive()
            }
            (LockLevel::Shared, LockLevel::Reserved) => self.shared_to_reserved(),
            (LockLevel::Shared, LockLevel::Exclusive) => {
                self.shared_to_reserved()?;
                self.reserved_to_exclusive()
            }
            (LockLevel::Reserved, LockLevel::Exclusive) => self.reserved_to_exclusive(),
            _ => Err(VfsError::Invalid("unsupported lock upgrade")),
        }
    }

    /// Downgrades to `level`; requests at or above the current level are
    /// no-ops.
    pub fn unlock(&mut self, level: LockLevel) -> Result<()> {
        if level >= self.level {
            return Ok(());
        }
        match level {
            LockLevel::None => {
                self.inner_guard = None;
                self.outer_guard = None;
                self.level = LockLevel::None;
                Ok(())
            }
            LockLevel::Shared => self.downgrade_to_shared(),
            _ => Err(VfsError::Invalid("unsupported unlock target")),
        }
    }

    /// True when any connection (including this one) holds reserved or
    /// higher on this path.
    pub fn is_somewhere_reserved(&self) -> bool {
        self.manager.is_exclusively_held(&self.outer)
    }

    fn none_to_shared(&mut self) -> Result<()> {
        let outer = self
            .manager
            .acquire(&self.outer, LeaseMode::Shared, self.options.timeout)?;
        let inner = self
            .manager
            .acquire(&self.inner, LeaseMode::Shared, self.options.timeout)?;
        drop(outer);
        self.inner_guard = Some(inner);
        self.level = LockLevel::Shared;
        Ok(())
    }

    fn shared_to_reserved(&mut self) -> Result<()> {
        let deadline = self.options.timeout.map(|t| Instant::now() + t);
        let mut delay = self.options.retry_start;
        loop {
            if let Some(guard) = self.manager.try_acquire(&self.outer, LeaseMode::Exclusive) {
                self.outer_guard = Some(guard);
                break;
            }
            if self.manager.is_exclusively_held(&self.outer) {
                return Err(VfsError::Busy("another connection is reserved"));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(VfsError::Busy("reserved poll timed out"));
            }
            thread::sleep(delay);
            delay = (delay * 2).min(self.options.retry_cap);
        }
        // Readers already admitted keep the inner lease; ours is no longer
        // needed to prove membership.
        self.inner_guard = None;
        self.level = LockLevel::Reserved;
        Ok(())
    }

    fn reserved_to_exclusive(&mut self) -> Result<()> {
        let inner = self
            .manager
            .acquire(&self.inner, LeaseMode::Exclusive, self.options.timeout)?;
        self.inner_guard = Some(inner);
        self.level = LockLevel::Exclusive;
        Ok(())
    }

    fn downgrade_to_shared(&mut self) -> Result<()> {
        if self.level == LockLevel::Exclusive {
            self.inner_guard = None;
        }
        let inner = self
            .manager
            .acquire(&self.inner, LeaseMode::Shared, self.options.timeout)?;
        self.inner_guard = Some(inner);
        self.outer_guard = None;
        self.level = LockLevel::Shared;
        Ok(())
    }
}
