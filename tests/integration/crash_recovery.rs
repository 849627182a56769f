#![allow(missing_docs)]

use std::fs;
use std::fs::OpenOptions;

use bodega::kv::{BlockData, BlockKey, LogStore, PurgeRecord, StoreOptions};
use bodega::types::{Version, VfsError};
use tempfile::tempdir;

fn put(store: &LogStore, offset: u64, byte: u8) {
    let token = store.begin().unwrap();
    store
        .put_block(
            token,
            BlockKey::new("/db/main", offset, Version(0)),
            BlockData::bytes(vec![byte; 32]),
        )
        .unwrap();
    store.commit(token).unwrap();
}

fn fetch(store: &LogStore, offset: u64) -> Option<Vec<u8>> {
    store
        .get(&BlockKey::new("/db/main", offset, Version(0)))
        .map(|data| data.bytes)
}

#[test]
fn torn_tail_drops_only_the_unfinished_batch() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("blocks.log");

    let store = LogStore::open(&log, StoreOptions::default()).unwrap();
    put(&store, 0, 1);
    let settled = store.log_bytes();
    put(&store, 512, 2);
    drop(store); // simulate crash

    // Cut the file mid-way through the second batch's first frame header.
    let file = OpenOptions::new().write(true).open(&log).unwrap();
    file.set_len(settled + 7).unwrap();
    drop(file);

    let store = LogStore::open(&log, StoreOptions::default()).unwrap();
    assert_eq!(fetch(&store, 0), Some(vec![1u8; 32]));
    assert_eq!(fetch(&store, 512), None);
    assert_eq!(store.log_bytes(), settled);
}

#[test]
fn flipped_byte_invalidates_everything_from_that_batch_on() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("blocks.log");

    let store = LogStore::open(&log, StoreOptions::default()).unwrap();
    put(&store, 0, 1);
    let settled = store.log_bytes();
    put(&store, 512, 2);
    put(&store, 1024, 3);
    drop(store); // simulate crash

    let mut bytes = fs::read(&log).unwrap();
    bytes[settled as usize + 20] ^= 0xFF;
    fs::write(&log, &bytes).unwrap();

    let store = LogStore::open(&log, StoreOptions::default()).unwrap();
    assert_eq!(fetch(&store, 0), Some(vec![1u8; 32]));
    // Replay stops at the damaged frame; the batch behind it goes too.
    assert_eq!(fetch(&store, 512), None);
    assert_eq!(fetch(&store, 1024), None);
    assert_eq!(store.log_bytes(), settled);
}

#[test]
fn damaged_file_header_refuses_to_open() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("blocks.log");

    let store = LogStore::open(&log, StoreOptions::default()).unwrap();
    put(&store, 0, 1);
    drop(store);

    let mut bytes = fs::read(&log).unwrap();
    bytes[2] ^= 0xFF;
    fs::write(&log, &bytes).unwrap();

    let err = LogStore::open(&log, StoreOptions::default()).unwrap_err();
    assert!(matches!(err, VfsError::Corruption(_)));
}

#[test]
fn compaction_state_survives_reopen() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("blocks.log");

    let store = LogStore::open(&log, StoreOptions::default()).unwrap();
    for round in 0..64u8 {
        put(&store, 0, round);
        put(&store, 512, round);
    }
    let token = store.begin().unwrap();
    let mut record = PurgeRecord::default();
    record.absorb(Version(-1), [512]);
    store.put_purge(token, "/db/main", record).unwrap();
    store.commit(token).unwrap();

    let before = store.log_bytes();
    let report = store.compact().unwrap();
    assert!(report.log_bytes_after < before);
    assert_eq!(report.live_blocks, 2);
    assert_eq!(report.live_purge_records, 1);
    drop(store); // simulate crash after compaction

    let store = LogStore::open(&log, StoreOptions::default()).unwrap();
    assert_eq!(fetch(&store, 0), Some(vec![63u8; 32]));
    assert_eq!(fetch(&store, 512), Some(vec![63u8; 32]));
    let record = store.purge_record("/db/main").unwrap();
    assert_eq!(record.count, 1);
    assert_eq!(record.superseded.get(&512), Some(&Version(-1)));
}
