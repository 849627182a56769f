#![allow(missing_docs)]

use bodega::batch::{BatchAtomicVfs, BatchOptions};
use bodega::types::FileId;
use bodega::vfs::{FileControl, OpenFlags, ReadOutcome, Vfs};

/// A page image with the database header fields this adapter inspects: the
/// announced page size at byte 16 and the page count at byte 28.
fn header_page(page_size: u16, pages: u32, fill: u8, len: usize) -> Vec<u8> {
    let mut bytes = vec![fill; len];
    bytes[16..18].copy_from_slice(&page_size.to_be_bytes());
    bytes[28..32].copy_from_slice(&pages.to_be_bytes());
    bytes
}

fn open_main(vfs: &BatchAtomicVfs) -> FileId {
    vfs.open(
        Some("/db/main"),
        OpenFlags::MAIN_DB | OpenFlags::READWRITE | OpenFlags::CREATE,
    )
    .unwrap()
}

/// Seeds six 512-byte pages, page 0 carrying a header that announces the
/// current geometry. Returns the logical file bytes.
fn seed_old_layout(vfs: &BatchAtomicVfs, file: FileId) -> Vec<u8> {
    let mut logical = Vec::new();
    let page0 = header_page(512, 6, 0x10, 512);
    vfs.write(file, &page0, 0).unwrap();
    logical.extend_from_slice(&page0);
    for i in 1..6u8 {
        let page = vec![0x10 + i; 512];
        vfs.write(file, &page, u64::from(i) * 512).unwrap();
        logical.extend_from_slice(&page);
    }
    vfs.sync(file).unwrap();
    logical
}

fn read_all(vfs: &BatchAtomicVfs, file: FileId, page_size: usize) -> Vec<u8> {
    let size = vfs.file_size(file).unwrap();
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < size {
        let mut buf = vec![0u8; page_size];
        assert_eq!(
            vfs.read(file, &mut buf, offset).unwrap(),
            ReadOutcome::Complete
        );
        out.extend_from_slice(&buf);
        offset += page_size as u64;
    }
    out
}

#[test]
fn rebuild_preserves_logical_content() {
    let vfs = BatchAtomicVfs::in_memory(BatchOptions::default()).unwrap();
    let file = open_main(&vfs);
    let mut logical = seed_old_layout(&vfs, file);

    // The engine announces the rewrite, updates the header in place to the
    // new geometry, then syncs.
    vfs.file_control(file, FileControl::Overwrite).unwrap();
    let updated = header_page(1024, 3, 0x10, 512);
    vfs.write(file, &updated, 0).unwrap();
    logical[..512].copy_from_slice(&updated);
    vfs.file_control(file, FileControl::Sync).unwrap();

    assert_eq!(vfs.stats().reblocks, 1);
    assert_eq!(vfs.file_size(file).unwrap(), 3072);
    assert_eq!(read_all(&vfs, file, 1024), logical);

    // The layout now sits on 1024-byte boundaries only.
    assert!(vfs.store().block_versions("/db/main", 512).is_empty());
    assert!(vfs.store().block_versions("/db/main", 1536).is_empty());
    assert_eq!(vfs.store().block_versions("/db/main", 1024).len(), 1);
}

#[test]
fn sync_without_the_hint_keeps_the_layout() {
    let vfs = BatchAtomicVfs::in_memory(BatchOptions::default()).unwrap();
    let file = open_main(&vfs);
    seed_old_layout(&vfs, file);

    let updated = header_page(1024, 3, 0x10, 512);
    vfs.write(file, &updated, 0).unwrap();
    vfs.file_control(file, FileControl::Sync).unwrap();

    assert_eq!(vfs.stats().reblocks, 0);
    assert_eq!(vfs.store().block_versions("/db/main", 512).len(), 1);
}

#[test]
fn commit_phase_two_retires_the_hint() {
    let vfs = BatchAtomicVfs::in_memory(BatchOptions::default()).unwrap();
    let file = open_main(&vfs);
    seed_old_layout(&vfs, file);
    let updated = header_page(1024, 3, 0x10, 512);
    vfs.write(file, &updated, 0).unwrap();

    vfs.file_control(file, FileControl::Overwrite).unwrap();
    vfs.file_control(file, FileControl::CommitPhaseTwo).unwrap();
    vfs.file_control(file, FileControl::Sync).unwrap();
    assert_eq!(vfs.stats().reblocks, 0);

    // Announced again, the next sync rebuilds; the one after that finds the
    // geometry already matching and leaves it alone.
    vfs.file_control(file, FileControl::Overwrite).unwrap();
    vfs.file_control(file, FileControl::Sync).unwrap();
    vfs.file_control(file, FileControl::Sync).unwrap();
    assert_eq!(vfs.stats().reblocks, 1);
}
