//! Bodega: virtual file system adapters for an embedded, page-oriented SQL
//! storage engine, persisting its file format over substrates that are not
//! file systems.
//!
//! Two independent adapters satisfy the same [`vfs::Vfs`] contract:
//!
//! - [`pool::PoolVfs`] maps logical paths onto a fixed pool of pre-allocated
//!   backing files, each carrying a self-describing header with a digest.
//!   Capacity is explicit; association survives restarts via `reset`.
//! - [`batch::BatchAtomicVfs`] maps a path's bytes onto fixed-offset blocks
//!   in a log-backed key-value store keyed by (path, offset, version), with
//!   advisory path locks and an atomic-batch-write protocol on top.
//!
//! The engine side stays out of scope: callers translate the engine's ABI
//! (numeric opcodes, error codes) to and from the typed surface in [`vfs`]
//! and [`types`].

#![warn(missing_docs)]

pub mod batch;
pub mod io;
pub mod kv;
pub mod locks;
pub mod pool;
pub mod types;
pub mod vfs;

pub use batch::{BatchAtomicVfs, BatchOptions, PurgePolicy};
pub use kv::Synchronous;
pub use pool::{PoolOptions, PoolVfs};
pub use types::{FileId, Result, VfsError};
pub use vfs::{OpenFlags, Vfs};
