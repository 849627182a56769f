#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use bodega::batch::{BatchAtomicVfs, BatchOptions};
use bodega::locks::LockOptions;
use bodega::types::{FileId, VfsError};
use bodega::vfs::{FileControl, LockLevel, OpenFlags, Vfs};

fn quick_lock_options() -> LockOptions {
    LockOptions {
        timeout: Some(Duration::from_millis(200)),
        retry_start: Duration::from_millis(1),
        retry_cap: Duration::from_millis(8),
    }
}

fn quick_options() -> BatchOptions {
    BatchOptions {
        lock: quick_lock_options(),
        ..BatchOptions::default()
    }
}

/// Two connections over one store and one lease table.
fn shared_pair() -> (BatchAtomicVfs, BatchAtomicVfs) {
    let first = BatchAtomicVfs::in_memory(quick_options()).unwrap();
    let second = BatchAtomicVfs::with_store(
        Arc::clone(first.store()),
        first.leases().clone(),
        quick_options(),
    );
    (first, second)
}

fn open_rw(vfs: &BatchAtomicVfs, name: &str) -> FileId {
    vfs.open(
        Some(name),
        OpenFlags::MAIN_DB | OpenFlags::READWRITE | OpenFlags::CREATE,
    )
    .unwrap()
}

fn page(vfs: &BatchAtomicVfs, file: FileId, offset: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    let _ = vfs.read(file, &mut buf, offset).unwrap();
    buf
}

#[test]
fn reader_snapshot_survives_concurrent_commit() {
    let (writer, reader) = shared_pair();
    let wf = open_rw(&writer, "/db/main");
    writer.write(wf, &[1u8; 4096], 0).unwrap();
    writer.write(wf, &[1u8; 4096], 4096).unwrap();
    writer.sync(wf).unwrap();

    let rf = open_rw(&reader, "/db/main");
    reader.lock(rf, LockLevel::Shared).unwrap();

    writer
        .file_control(wf, FileControl::BeginAtomicWrite)
        .unwrap();
    writer.write(wf, &[2u8; 4096], 0).unwrap();
    writer.write(wf, &[2u8; 4096], 4096).unwrap();
    writer
        .file_control(wf, FileControl::CommitAtomicWrite)
        .unwrap();
    writer.sync(wf).unwrap();

    // The admitted reader keeps its pre-commit snapshot.
    assert_eq!(page(&reader, rf, 4096), vec![1u8; 4096]);

    // Re-entering shared observes the new commit.
    reader.unlock(rf, LockLevel::None).unwrap();
    reader.lock(rf, LockLevel::Shared).unwrap();
    assert_eq!(page(&reader, rf, 4096), vec![2u8; 4096]);
    reader.unlock(rf, LockLevel::None).unwrap();
}

#[test]
fn reserved_state_is_visible_to_other_connections() {
    let (first, second) = shared_pair();
    let fa = open_rw(&first, "/db/main");
    let fb = open_rw(&second, "/db/main");

    assert!(!second.check_reserved_lock(fb).unwrap());
    first.lock(fa, LockLevel::Reserved).unwrap();
    assert!(second.check_reserved_lock(fb).unwrap());
    assert!(first.check_reserved_lock(fa).unwrap());

    first.unlock(fa, LockLevel::Shared).unwrap();
    assert!(!second.check_reserved_lock(fb).unwrap());
    first.unlock(fa, LockLevel::None).unwrap();
}

#[test]
fn reserved_writer_keeps_new_readers_out() {
    let (writer, late) = shared_pair();
    let wf = open_rw(&writer, "/db/main");
    writer.lock(wf, LockLevel::Reserved).unwrap();

    let lf = open_rw(&late, "/db/main");
    let err = late.lock(lf, LockLevel::Shared).unwrap_err();
    assert!(matches!(err, VfsError::Busy(_)));

    writer.unlock(wf, LockLevel::None).unwrap();
    late.lock(lf, LockLevel::Shared).unwrap();
    late.unlock(lf, LockLevel::None).unwrap();
}

#[test]
fn admitted_reader_blocks_the_exclusive_upgrade() {
    let (writer, reader) = shared_pair();
    let wf = open_rw(&writer, "/db/main");
    let rf = open_rw(&reader, "/db/main");

    reader.lock(rf, LockLevel::Shared).unwrap();
    writer.lock(wf, LockLevel::Reserved).unwrap();

    let err = writer.lock(wf, LockLevel::Exclusive).unwrap_err();
    assert!(matches!(err, VfsError::Busy(_)));

    reader.unlock(rf, LockLevel::None).unwrap();
    writer.lock(wf, LockLevel::Exclusive).unwrap();
    writer.unlock(wf, LockLevel::None).unwrap();
}
