#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use bodega::pool::{PoolOptions, PoolVfs, LOCK_FILE_NAME};
use bodega::vfs::{AccessCheck, OpenFlags, ReadOutcome, Vfs};
use tempfile::tempdir;

fn db_flags() -> OpenFlags {
    OpenFlags::MAIN_DB | OpenFlags::READWRITE | OpenFlags::CREATE
}

fn reopen(dir: &Path) -> PoolVfs {
    PoolVfs::open_dir(dir, PoolOptions::default()).unwrap()
}

fn write_and_close(vfs: &PoolVfs, name: &str, fill: u8, len: usize) {
    let file = vfs.open(Some(name), db_flags()).unwrap();
    vfs.write(file, &vec![fill; len], 0).unwrap();
    vfs.sync(file).unwrap();
    vfs.close(file).unwrap();
}

fn assert_content(vfs: &PoolVfs, name: &str, fill: u8, len: usize) {
    let file = vfs.open(Some(name), OpenFlags::MAIN_DB | OpenFlags::READWRITE).unwrap();
    let mut buf = vec![0u8; len];
    assert_eq!(vfs.read(file, &mut buf, 0).unwrap(), ReadOutcome::Complete);
    assert_eq!(buf, vec![fill; len]);
    vfs.close(file).unwrap();
}

#[test]
fn engine_page_scenario() {
    let dir = tempdir().unwrap();
    let pool = reopen(dir.path());
    let file = pool.open(Some("/db/main"), db_flags()).unwrap();
    pool.write(file, &[0u8; 4096], 0).unwrap();
    pool.write(file, &[0xAB; 4096], 4096).unwrap();
    pool.sync(file).unwrap();
    pool.close(file).unwrap();
    drop(pool); // simulate the owning process exiting

    let pool = reopen(dir.path());
    let file = pool
        .open(Some("/db/main"), OpenFlags::MAIN_DB | OpenFlags::READWRITE)
        .unwrap();
    assert_eq!(pool.file_size(file).unwrap(), 8192);
    let mut page = vec![0xFF; 4096];
    assert_eq!(pool.read(file, &mut page, 4096).unwrap(), ReadOutcome::Complete);
    assert!(page.iter().all(|&b| b == 0xAB));
    assert_eq!(pool.read(file, &mut page, 0).unwrap(), ReadOutcome::Complete);
    assert!(page.iter().all(|&b| b == 0));
}

#[test]
fn contents_survive_pool_reopen() {
    let dir = tempdir().unwrap();
    let pool = reopen(dir.path());
    write_and_close(&pool, "/db/alpha", 0xA1, 4096);
    write_and_close(&pool, "/db/beta", 0xB2, 512);
    write_and_close(&pool, "/db/gamma", 0xC3, 9000);
    drop(pool); // simulate the owning process exiting

    let pool = reopen(dir.path());
    let stats = pool.stats();
    assert_eq!(stats.size, 3);
    assert_eq!(stats.capacity, bodega::pool::DEFAULT_CAPACITY);
    for name in ["/db/alpha", "/db/beta", "/db/gamma"] {
        assert!(pool.access(name, AccessCheck::Exists).unwrap());
    }
    assert_content(&pool, "/db/alpha", 0xA1, 4096);
    assert_content(&pool, "/db/beta", 0xB2, 512);
    assert_content(&pool, "/db/gamma", 0xC3, 9000);
}

#[test]
fn corrupt_headers_heal_to_free_slots() {
    let dir = tempdir().unwrap();
    let pool = PoolVfs::open_dir(dir.path(), PoolOptions { initial_capacity: 3 }).unwrap();
    write_and_close(&pool, "/db/main", 0x11, 2048);
    write_and_close(&pool, "/db/aux", 0x22, 2048);
    drop(pool); // simulate a crash before the damage is noticed

    // Damage the digest-guarded region of every backing file.
    for entry in fs::read_dir(dir.path()).unwrap() {
        let entry = entry.unwrap();
        if entry.file_name() == LOCK_FILE_NAME {
            continue;
        }
        let mut bytes = fs::read(entry.path()).unwrap();
        bytes[3] ^= 0x40;
        fs::write(entry.path(), bytes).unwrap();
    }

    let pool = PoolVfs::open_dir(dir.path(), PoolOptions { initial_capacity: 3 }).unwrap();
    assert!(!pool.access("/db/main", AccessCheck::Exists).unwrap());
    assert!(!pool.access("/db/aux", AccessCheck::Exists).unwrap());
    let stats = pool.stats();
    assert_eq!(stats.capacity, 3);
    assert_eq!(stats.size, 0);
    assert_eq!(stats.free, 3);
}

#[test]
fn deleted_files_stay_gone_after_reopen() {
    let dir = tempdir().unwrap();
    let pool = reopen(dir.path());
    write_and_close(&pool, "/db/keep", 0x5A, 1024);
    write_and_close(&pool, "/db/drop", 0x6B, 1024);
    pool.delete("/db/drop", false).unwrap();
    assert!(!pool.access("/db/drop", AccessCheck::Exists).unwrap());
    drop(pool);

    let pool = reopen(dir.path());
    assert!(!pool.access("/db/drop", AccessCheck::Exists).unwrap());
    assert!(pool.access("/db/keep", AccessCheck::Exists).unwrap());
    assert_content(&pool, "/db/keep", 0x5A, 1024);
    assert_eq!(pool.len(), 1);
    assert!(!pool.is_empty());
}

#[test]
fn journals_persist_across_reopen_but_temp_files_do_not() {
    let dir = tempdir().unwrap();
    let pool = reopen(dir.path());
    let journal = pool
        .open(
            Some("/db/main-journal"),
            OpenFlags::MAIN_JOURNAL | OpenFlags::READWRITE | OpenFlags::CREATE,
        )
        .unwrap();
    pool.write(journal, &[0x77; 512], 0).unwrap();
    pool.sync(journal).unwrap();
    let scratch = pool
        .open(
            Some("/db/scratch"),
            OpenFlags::TEMP_DB | OpenFlags::READWRITE | OpenFlags::CREATE,
        )
        .unwrap();
    pool.write(scratch, &[0x88; 512], 0).unwrap();
    pool.sync(scratch).unwrap();
    drop(pool); // simulate a crash with both files still open

    let pool = reopen(dir.path());
    assert!(pool.access("/db/main-journal", AccessCheck::Exists).unwrap());
    assert!(!pool.access("/db/scratch", AccessCheck::Exists).unwrap());
    assert_eq!(pool.stats().size, 1);

    let journal = pool
        .open(
            Some("/db/main-journal"),
            OpenFlags::MAIN_JOURNAL | OpenFlags::READWRITE,
        )
        .unwrap();
    let mut buf = vec![0u8; 512];
    assert_eq!(pool.read(journal, &mut buf, 0).unwrap(), ReadOutcome::Complete);
    assert_eq!(buf, vec![0x77; 512]);
}
