//! The B-tree layer: page model (C4), read-only cursors (C5), and the
//! mutating writer (C6), built on top of the page cache (spec §4.3-§4.6).

pub mod cursor;
pub mod page;
pub mod writer;

use std::rc::Rc;

use crate::error::Result;

/// What a cursor or writer needs from whatever owns the cache: fetch a
/// page's current (decrypted, usable-size-trimmed) bytes, and know the
/// usable size to compute overflow thresholds. Implemented by `Database`
/// (read path) and `Transaction` (read/write path).
pub trait PageSource {
    fn get_page(&self, page_number: u32) -> Result<Rc<[u8]>>;
    fn usable_size(&self) -> usize;
    /// The owning cache's current generation, bumped on every commit (spec
    /// §4.2, §4.5 "Cursor stability"): a cursor compares this against the
    /// value it captured at creation before trusting its in-memory path.
    fn generation(&self) -> u64;
}

/// Reassembles a payload that spilled into an overflow chain (spec §3
/// "Overflow"): `local` is the bytes stored inline on the leaf cell,
/// `first_overflow` points at the first overflow page, and `total_len` is
/// the payload's full declared length.
pub fn read_overflow_chain(
    source: &impl PageSource,
    local: &[u8],
    first_overflow: u32,
    total_len: usize,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(local);

    let usable = source.usable_size();
    let per_page = usable - 4;
    let mut page_number = first_overflow;
    while out.len() < total_len && page_number != 0 {
        let data = source.get_page(page_number)?;
        let next = u32::from_be_bytes(data[0..4].try_into().unwrap());
        let remaining = total_len - out.len();
        let take = remaining.min(per_page);
        out.extend_from_slice(&data[4..4 + take]);
        page_number = next;
    }
    Ok(out)
}

/// Splits `payload` into its locally-stored prefix and the overflow chain
/// bytes that must be written to fresh pages, used by the writer when a
/// payload exceeds the local-size threshold.
pub fn split_overflow_payload(payload: &[u8], local_len: usize) -> (&[u8], &[u8]) {
    payload.split_at(local_len)
}

/// Lays out one overflow page's body: `[next_page: u32 BE][chunk bytes]`,
/// zero-padded to `usable_size`.
pub fn build_overflow_page(next_page: u32, chunk: &[u8], usable_size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; usable_size];
    buf[0..4].copy_from_slice(&next_page.to_be_bytes());
    buf[4..4 + chunk.len()].copy_from_slice(chunk);
    buf
}
