#![allow(missing_docs)]

use bodega::batch::{BatchAtomicVfs, BatchOptions};
use bodega::kv::Synchronous;
use bodega::types::FileId;
use bodega::vfs::{FileControl, OpenFlags, ReadOutcome, Vfs};
use tempfile::tempdir;

fn db_flags() -> OpenFlags {
    OpenFlags::MAIN_DB | OpenFlags::READWRITE | OpenFlags::CREATE
}

fn read_page(vfs: &BatchAtomicVfs, file: FileId, offset: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    let outcome = vfs.read(file, &mut buf, offset).unwrap();
    assert_eq!(outcome, ReadOutcome::Complete);
    buf
}

#[test]
fn engine_page_scenario() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("blocks.log");
    {
        let vfs = BatchAtomicVfs::open(&log, BatchOptions::default()).unwrap();
        let file = vfs.open(Some("/db/main"), db_flags()).unwrap();
        vfs.write(file, &[0u8; 4096], 0).unwrap();
        vfs.write(file, &[0xAB; 4096], 4096).unwrap();
        vfs.sync(file).unwrap();
        vfs.close(file).unwrap();
        vfs.shutdown().unwrap();
    }

    let vfs = BatchAtomicVfs::open(&log, BatchOptions::default()).unwrap();
    let file = vfs
        .open(Some("/db/main"), OpenFlags::MAIN_DB | OpenFlags::READWRITE)
        .unwrap();
    assert_eq!(vfs.file_size(file).unwrap(), 8192);
    assert_eq!(read_page(&vfs, file, 4096), vec![0xAB; 4096]);
    assert_eq!(read_page(&vfs, file, 0), vec![0u8; 4096]);
}

#[test]
fn committed_batch_survives_reopen() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("blocks.log");
    {
        let vfs = BatchAtomicVfs::open(&log, BatchOptions::default()).unwrap();
        let file = vfs.open(Some("/db/main"), db_flags()).unwrap();
        vfs.write(file, &[1u8; 4096], 0).unwrap();
        vfs.write(file, &[1u8; 4096], 4096).unwrap();
        vfs.sync(file).unwrap();

        vfs.file_control(file, FileControl::BeginAtomicWrite).unwrap();
        vfs.write(file, &[2u8; 4096], 0).unwrap();
        vfs.write(file, &[2u8; 4096], 4096).unwrap();
        vfs.file_control(file, FileControl::CommitAtomicWrite).unwrap();
        vfs.sync(file).unwrap();
    } // simulate shutdown without an orderly close

    let vfs = BatchAtomicVfs::open(&log, BatchOptions::default()).unwrap();
    let file = vfs
        .open(Some("/db/main"), OpenFlags::MAIN_DB | OpenFlags::READWRITE)
        .unwrap();
    assert_eq!(read_page(&vfs, file, 0), vec![2u8; 4096]);
    assert_eq!(read_page(&vfs, file, 4096), vec![2u8; 4096]);
}

#[test]
fn mid_batch_interruption_leaves_pre_batch_state() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("blocks.log");
    {
        let vfs = BatchAtomicVfs::open(&log, BatchOptions::default()).unwrap();
        let file = vfs.open(Some("/db/main"), db_flags()).unwrap();
        vfs.write(file, &[1u8; 4096], 0).unwrap();
        vfs.write(file, &[1u8; 4096], 4096).unwrap();
        vfs.sync(file).unwrap();

        vfs.file_control(file, FileControl::BeginAtomicWrite).unwrap();
        vfs.write(file, &[9u8; 4096], 4096).unwrap();
        vfs.write(file, &[9u8; 4096], 8192).unwrap();
    } // simulate crash before commit

    let vfs = BatchAtomicVfs::open(&log, BatchOptions::default()).unwrap();
    let file = vfs
        .open(Some("/db/main"), OpenFlags::MAIN_DB | OpenFlags::READWRITE)
        .unwrap();
    // Only the committed epoch is current; the orphaned writes never became
    // visible.
    assert_eq!(vfs.file_size(file).unwrap(), 8192);
    assert_eq!(read_page(&vfs, file, 4096), vec![1u8; 4096]);
    assert_eq!(vfs.store().block_versions("/db/main", 4096).len(), 2);

    // The next batch on this path sweeps the orphans before starting.
    vfs.file_control(file, FileControl::BeginAtomicWrite).unwrap();
    assert_eq!(vfs.store().block_versions("/db/main", 4096).len(), 1);
    vfs.file_control(file, FileControl::RollbackAtomicWrite).unwrap();
}

#[test]
fn synchronous_off_skips_the_sync_barrier() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("blocks.log");
    let options = BatchOptions {
        synchronous: Synchronous::Off,
        ..BatchOptions::default()
    };
    let vfs = BatchAtomicVfs::open(&log, options).unwrap();
    let file = vfs.open(Some("/db/main"), db_flags()).unwrap();
    vfs.write(file, &[7u8; 4096], 0).unwrap();
    vfs.sync(file).unwrap();

    assert_eq!(read_page(&vfs, file, 0), vec![7u8; 4096]);
    let stats = vfs.store().stats();
    assert!(stats.commits >= 1);
    assert_eq!(stats.syncs, 0);
}

#[test]
fn stats_serialize_for_diagnostics() {
    let vfs = BatchAtomicVfs::in_memory(BatchOptions::default()).unwrap();
    let file = vfs.open(Some("/db/main"), db_flags()).unwrap();
    vfs.write(file, &[3u8; 4096], 0).unwrap();
    let _ = read_page(&vfs, file, 0);
    vfs.sync(file).unwrap();

    let adapter = serde_json::to_value(vfs.stats()).unwrap();
    assert_eq!(adapter["writes"], 1);
    assert_eq!(adapter["reads"], 1);

    let store = serde_json::to_value(vfs.store().stats()).unwrap();
    assert!(store["commits"].as_u64().unwrap() >= 1);
    assert!(store["frames_appended"].as_u64().unwrap() >= 1);
}
