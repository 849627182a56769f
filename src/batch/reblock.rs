#![forbid(unsafe_code)]
//! Page-size conversion for overwritten files.
//!
//! When the engine rewrites a whole file with a different page size, block
//! boundaries in the store no longer match the pages the header announces.
//! Blocks written during the rewrite sit at new-size alignments while
//! untouched ones keep the old alignment. This pass runs at the sync that
//! follows the overwrite hint: it assembles the file's visible bytes from
//! whatever block layout is present and re-stores them on the announced
//! boundary, all in one store transaction.

use std::collections::BTreeMap;

use tracing::info;

use crate::kv::{BlockData, BlockKey, KvContext};
use crate::types::{Result, Version};

/// Rebuilds `path` on the block boundary its header announces, when that
/// differs from the current block 0 length. Returns the new block 0, or
/// `None` when no rebuild is needed.
pub(crate) fn convert(
    ctx: &KvContext,
    path: &str,
    version: Version,
    block0: &BlockData,
) -> Result<Option<BlockData>> {
    let Some((new, pages)) = page_geometry(&block0.bytes) else {
        return Ok(None);
    };
    let old = block0.bytes.len() as u64;
    if new == old {
        return Ok(None);
    }
    let total = new * pages;

    // Visible layout, frozen before the rebuild. The engine holds the file
    // exclusively here, so nothing moves underneath.
    let mut content: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
    content.insert(0, block0.bytes.clone());
    for (offset, at) in ctx.store().visible_blocks(path, version) {
        if offset == 0 {
            continue;
        }
        if let Some(data) = ctx.store().get(&BlockKey::new(path, offset, at)) {
            content.insert(offset, data.bytes);
        }
    }

    let fresh = ctx.with_txn(|store, token| {
        store.delete_path(token, path)?;
        if total == 0 {
            let empty = BlockData::metadata(Vec::new(), 0);
            store.put_block(token, BlockKey::new(path, 0, version), empty.clone())?;
            return Ok(empty);
        }
        let mut first = BlockData::metadata(Vec::new(), 0);
        for out_off in (0..total).step_by(new as usize) {
            let bytes = read_span(&content, out_off, new as usize);
            if out_off == 0 {
                first = BlockData::metadata(bytes, total);
                store.put_block(token, BlockKey::new(path, 0, version), first.clone())?;
                continue;
            }
            // All-zero spans are holes; reads give zeros without a block.
            if bytes.iter().all(|&b| b == 0) {
                continue;
            }
            store.put_block(
                token,
                BlockKey::new(path, out_off, version),
                BlockData::bytes(bytes),
            )?;
        }
        Ok(first)
    })?;

    info!(path, old, new, pages, "page size rebuilt");
    Ok(Some(fresh))
}

/// Reads the announced page size and page count out of a database header.
/// `None` when the header is incomplete or the size field is not a legal
/// page size.
fn page_geometry(bytes: &[u8]) -> Option<(u64, u64)> {
    if bytes.len() < 32 {
        return None;
    }
    let raw = u16::from_be_bytes([bytes[16], bytes[17]]);
    let size = match raw {
        1 => 65536,
        n => u64::from(n),
    };
    if !(512..=65536).contains(&size) || !size.is_power_of_two() {
        return None;
    }
    let pages = u32::from_be_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]);
    Some((size, u64::from(pages)))
}

/// Copies `len` bytes starting at `start` out of the block layout into a
/// zero-filled buffer. Where blocks overlap, the earlier byte already copied
/// wins; gaps stay zero.
fn read_span(content: &BTreeMap<u64, Vec<u8>>, start: u64, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let end = start + len as u64;
    let mut cursor = start;
    let from = content
        .range(..=start)
        .next_back()
        .map(|(offset, _)| *offset)
        .unwrap_or(start);
    for (&offset, bytes) in content.range(from..end) {
        let block_end = offset + bytes.len() as u64;
        if block_end <= cursor {
            continue;
        }
        let copy_from = offset.max(cursor);
        let copy_to = block_end.min(end);
        if copy_from >= copy_to {
            continue;
        }
        let dst = (copy_from - start) as usize..(copy_to - start) as usize;
        let src = (copy_from - offset) as usize..(copy_to - offset) as usize;
        out[dst].copy_from_slice(&bytes[src]);
        cursor = copy_to;
    }
    out
}
