//! The polymorphic b-tree page model shared by table/index, leaf/interior
//! pages (spec §3 "Page", §9 "Polymorphic page variants"): one structure
//! embeds the cell-pointer array and free-block chain that every variant
//! shares, and dispatches on a small tagged `BTreePageType`.

use zerocopy::big_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes};

use crate::error::{Error, Result};
use crate::varint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BTreePageType {
    InteriorIndex,
    InteriorTable,
    LeafIndex,
    LeafTable,
}

impl BTreePageType {
    pub fn is_leaf(self) -> bool {
        matches!(self, BTreePageType::LeafIndex | BTreePageType::LeafTable)
    }

    pub fn is_table(self) -> bool {
        matches!(
            self,
            BTreePageType::InteriorTable | BTreePageType::LeafTable
        )
    }

    /// In-page header size: leaves omit the 4-byte rightmost-child pointer.
    pub fn header_size(self) -> usize {
        if self.is_leaf() {
            8
        } else {
            12
        }
    }

    fn flag(self) -> u8 {
        match self {
            BTreePageType::InteriorIndex => 0x02,
            BTreePageType::InteriorTable => 0x05,
            BTreePageType::LeafIndex => 0x0a,
            BTreePageType::LeafTable => 0x0d,
        }
    }

    fn from_flag(flag: u8) -> Result<Self> {
        Ok(match flag {
            0x02 => BTreePageType::InteriorIndex,
            0x05 => BTreePageType::InteriorTable,
            0x0a => BTreePageType::LeafIndex,
            0x0d => BTreePageType::LeafTable,
            other => {
                return Err(Error::corrupt(0, format!("invalid b-tree page flag {other:#x}")))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, zerocopy::FromZeroes, zerocopy::FromBytes, zerocopy::AsBytes, zerocopy::Unaligned)]
#[repr(C)]
struct RawHeader8 {
    flags: u8,
    first_freeblock: U16,
    cell_count: U16,
    cell_content_start: U16,
    fragmented_free_bytes: u8,
}

#[derive(Debug, Clone, Copy, zerocopy::FromZeroes, zerocopy::FromBytes, zerocopy::AsBytes, zerocopy::Unaligned)]
#[repr(C)]
struct RawHeader12 {
    base: RawHeader8,
    right_most_pointer: U32,
}

/// An in-memory decode of a b-tree page header (8 or 12 bytes depending on
/// leaf/interior).
#[derive(Debug, Clone, Copy)]
pub struct BTreePageHeader {
    pub page_type: BTreePageType,
    pub first_freeblock: u16,
    pub cell_count: u16,
    /// 0 is the canonical encoding of 65536 (spec §3 "Page").
    pub cell_content_start: u32,
    pub fragmented_free_bytes: u8,
    pub right_most_pointer: u32,
}

impl BTreePageHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let ty = BTreePageType::from_flag(buf[0])?;
        let raw = RawHeader8::read_from_prefix(buf)
            .ok_or_else(|| Error::corrupt(0, "page too small for b-tree header"))?;
        let cell_content_start = if raw.cell_content_start.get() == 0 {
            65536
        } else {
            raw.cell_content_start.get() as u32
        };
        let right_most_pointer = if ty.is_leaf() {
            0
        } else {
            U32::read_from_prefix(&buf[8..])
                .ok_or_else(|| Error::corrupt(0, "page too small for interior header"))?
                .get()
        };

        Ok(Self {
            page_type: ty,
            first_freeblock: raw.first_freeblock.get(),
            cell_count: raw.cell_count.get(),
            cell_content_start,
            fragmented_free_bytes: raw.fragmented_free_bytes,
            right_most_pointer,
        })
    }

    pub fn empty(page_type: BTreePageType, page_capacity: u32) -> Self {
        Self {
            page_type,
            first_freeblock: 0,
            cell_count: 0,
            cell_content_start: page_capacity,
            fragmented_free_bytes: 0,
            right_most_pointer: 0,
        }
    }

    pub fn write_into(&self, buf: &mut [u8]) {
        let content_start_code = if self.cell_content_start >= 65536 {
            0
        } else {
            self.cell_content_start as u16
        };
        let raw = RawHeader8 {
            flags: self.page_type.flag(),
            first_freeblock: self.first_freeblock.into(),
            cell_count: self.cell_count.into(),
            cell_content_start: content_start_code.into(),
            fragmented_free_bytes: self.fragmented_free_bytes,
        };
        raw.write_to_prefix(buf).unwrap();
        if !self.page_type.is_leaf() {
            U32::from(self.right_most_pointer)
                .write_to_prefix(&mut buf[8..])
                .unwrap();
        }
    }

    pub fn header_size(&self) -> usize {
        self.page_type.header_size()
    }
}

/// A decoded b-tree page: the header plus a view over the raw bytes needed
/// to read/write cells. `base` is the byte offset of the b-tree header
/// within `data` (100 for page 1, 0 otherwise); `data` is the *whole*
/// on-disk page (header included, for page 1), trimmed to the usable page
/// size (reserved bytes excluded).
pub struct Page<'a> {
    pub page_number: u32,
    pub base: usize,
    pub header: BTreePageHeader,
    pub data: &'a [u8],
}

pub struct PageMut<'a> {
    pub page_number: u32,
    pub base: usize,
    pub header: BTreePageHeader,
    pub data: &'a mut [u8],
}

fn cell_pointer_array_offset(base: usize, header_size: usize) -> usize {
    base + header_size
}

impl<'a> Page<'a> {
    pub fn parse(page_number: u32, base: usize, data: &'a [u8]) -> Result<Self> {
        let header = BTreePageHeader::parse(&data[base..])?;
        Ok(Self {
            page_number,
            base,
            header,
            data,
        })
    }

    pub fn cell_count(&self) -> u16 {
        self.header.cell_count
    }

    pub fn page_type(&self) -> BTreePageType {
        self.header.page_type
    }

    fn cell_pointer(&self, index: u16) -> usize {
        let off = cell_pointer_array_offset(self.base, self.header.header_size()) + index as usize * 2;
        U16::read_from_prefix(&self.data[off..]).unwrap().get() as usize
    }

    fn cell_slice(&self, index: u16) -> &'a [u8] {
        let ptr = self.cell_pointer(index);
        &self.data[ptr..]
    }

    /// `(rowid, payload, overflow_page)` for a table leaf cell. `overflow_page`
    /// is `Some` when the payload spills past `max_local`.
    pub fn leaf_table_cell(&self, index: u16) -> Result<(i64, &'a [u8], Option<u32>)> {
        debug_assert_eq!(self.page_type(), BTreePageType::LeafTable);
        let mut cell = self.cell_slice(index);
        let (payload_len, len1) = varint::read(cell);
        cell = &cell[len1..];
        let (rowid, len2) = varint::read(cell);
        cell = &cell[len2..];

        let usable = self.usable_size();
        let (local_len, has_overflow) = table_leaf_local_size(usable, payload_len as usize);
        if has_overflow {
            let payload = &cell[..local_len];
            let overflow_page = U32::read_from_prefix(&cell[local_len..]).unwrap().get();
            Ok((rowid, payload, Some(overflow_page)))
        } else {
            Ok((rowid, &cell[..payload_len as usize], None))
        }
    }

    /// The full declared payload length of a table leaf cell, including
    /// any portion that spills to an overflow chain -- needed to know how
    /// many bytes to reassemble (spec §3 "Overflow").
    pub fn leaf_table_payload_len(&self, index: u16) -> i64 {
        let cell = self.cell_slice(index);
        varint::read(cell).0
    }

    /// The full declared payload length of an index leaf cell.
    pub fn leaf_index_payload_len(&self, index: u16) -> i64 {
        let cell = self.cell_slice(index);
        varint::read(cell).0
    }

    /// `(left_child_page, rowid)` for a table interior cell.
    pub fn interior_table_cell(&self, index: u16) -> (u32, i64) {
        debug_assert_eq!(self.page_type(), BTreePageType::InteriorTable);
        let cell = self.cell_slice(index);
        let left_child = U32::read_from_prefix(cell).unwrap().get();
        let (rowid, _) = varint::read(&cell[4..]);
        (left_child, rowid)
    }

    /// `(payload, overflow_page)` for an index leaf cell.
    pub fn leaf_index_cell(&self, index: u16) -> Result<(&'a [u8], Option<u32>)> {
        debug_assert_eq!(self.page_type(), BTreePageType::LeafIndex);
        let cell = self.cell_slice(index);
        let (payload_len, len1) = varint::read(cell);
        let body = &cell[len1..];

        let usable = self.usable_size();
        let (local_len, has_overflow) = index_local_size(usable, payload_len as usize);
        if has_overflow {
            let overflow_page = U32::read_from_prefix(&body[local_len..]).unwrap().get();
            Ok((&body[..local_len], Some(overflow_page)))
        } else {
            Ok((&body[..payload_len as usize], None))
        }
    }

    /// `(left_child_page, payload, overflow_page)` for an index interior cell.
    pub fn interior_index_cell(&self, index: u16) -> Result<(u32, &'a [u8], Option<u32>)> {
        debug_assert_eq!(self.page_type(), BTreePageType::InteriorIndex);
        let cell = self.cell_slice(index);
        let left_child = U32::read_from_prefix(cell).unwrap().get();
        let rest = &cell[4..];
        let (payload_len, len1) = varint::read(rest);
        let body = &rest[len1..];

        let usable = self.usable_size();
        let (local_len, has_overflow) = index_local_size(usable, payload_len as usize);
        if has_overflow {
            let overflow_page = U32::read_from_prefix(&body[local_len..]).unwrap().get();
            Ok((left_child, &body[..local_len], Some(overflow_page)))
        } else {
            Ok((left_child, &body[..payload_len as usize], None))
        }
    }

    fn usable_size(&self) -> usize {
        // The page slice handed to `Page` is already trimmed to the usable
        // size by the caller (cache/cursor layer), so its length (plus the
        // header base for page 1, which is already inside `data`) is it.
        self.data.len()
    }

    /// Byte range `[header_end, cell_content_start)` that is either free or
    /// holds the cell-pointer array plus unallocated space -- used for
    /// free-space accounting (property 5).
    pub fn unallocated_range(&self) -> std::ops::Range<usize> {
        let ptr_array_end =
            cell_pointer_array_offset(self.base, self.header.header_size()) + self.cell_count() as usize * 2;
        ptr_array_end..self.header.cell_content_start as usize
    }
}

/// Table-leaf local payload size and whether the remainder overflows, per
/// spec §3 "Overflow": `min_local = ((U-12)*32/255) - 23`, `max_local = U -
/// 35`.
pub fn table_leaf_local_size(usable: usize, total: usize) -> (usize, bool) {
    let max_local = usable - 35;
    if total <= max_local {
        return (total, false);
    }
    let min_local = (usable - 12) * 32 / 255 - 23;
    let k = min_local + (total - min_local) % (usable - 4);
    if k <= max_local {
        (k, true)
    } else {
        (min_local, true)
    }
}

/// Index-cell (and table-interior-cell, which SQLite treats identically)
/// local payload size: `max_local = (U-12)*64/255 - 23`, same `min_local`.
pub fn index_local_size(usable: usize, total: usize) -> (usize, bool) {
    let max_local = (usable - 12) * 64 / 255 - 23;
    if total <= max_local {
        return (total, false);
    }
    let min_local = (usable - 12) * 32 / 255 - 23;
    let k = min_local + (total - min_local) % (usable - 4);
    if k <= max_local {
        (k, true)
    } else {
        (min_local, true)
    }
}

impl<'a> PageMut<'a> {
    pub fn parse(page_number: u32, base: usize, data: &'a mut [u8]) -> Result<Self> {
        let header = BTreePageHeader::parse(&data[base..])?;
        Ok(Self {
            page_number,
            base,
            header,
            data,
        })
    }

    pub fn init_empty(page_number: u32, base: usize, page_type: BTreePageType, data: &'a mut [u8]) -> Self {
        let header = BTreePageHeader::empty(page_type, data.len() as u32);
        header.write_into(&mut data[base..]);
        Self {
            page_number,
            base,
            header,
            data,
        }
    }

    pub fn as_page(&self) -> Page<'_> {
        Page {
            page_number: self.page_number,
            base: self.base,
            header: self.header,
            data: self.data,
        }
    }

    fn usable_size(&self) -> usize {
        self.data.len()
    }

    fn cell_pointer_array_offset(&self) -> usize {
        cell_pointer_array_offset(self.base, self.header.header_size())
    }

    pub fn cell_pointer(&self, index: u16) -> usize {
        let off = self.cell_pointer_array_offset() + index as usize * 2;
        U16::read_from_prefix(&self.data[off..]).unwrap().get() as usize
    }

    fn set_cell_pointer(&mut self, index: u16, offset: u16) {
        let off = self.cell_pointer_array_offset() + index as usize * 2;
        U16::from(offset).write_to_prefix(&mut self.data[off..]).unwrap();
    }

    /// Free bytes between the end of the cell-pointer array and the start of
    /// cell content, ignoring any freeblock chain (defragmentation isn't
    /// needed until this runs out; callers defragment first when it does).
    pub fn contiguous_free_space(&self) -> usize {
        let ptr_array_end = self.cell_pointer_array_offset() + self.cell_count() as usize * 2;
        self.header.cell_content_start as usize - ptr_array_end
    }

    pub fn cell_count(&self) -> u16 {
        self.header.cell_count
    }

    /// Total free bytes available to a new cell after defragmenting: the
    /// contiguous gap plus every freeblock in the chain, minus the 2-byte
    /// pointer-array slot the new cell will need.
    pub fn total_free_space(&self) -> usize {
        let mut free = self.contiguous_free_space();
        let mut ptr = self.header.first_freeblock as usize;
        while ptr != 0 {
            let size = U16::read_from_prefix(&self.data[ptr + 2..]).unwrap().get() as usize;
            free += size;
            ptr = U16::read_from_prefix(&self.data[ptr..]).unwrap().get() as usize;
        }
        free
    }

    /// Collapses every freeblock into the contiguous gap by rebuilding the
    /// cell content area, preserving cell order. O(page size); only called
    /// when an insert doesn't fit in the contiguous gap alone.
    pub fn defragment(&mut self) {
        let cell_count = self.cell_count();
        let mut cells: Vec<Vec<u8>> = Vec::with_capacity(cell_count as usize);
        for i in 0..cell_count {
            let ptr = self.cell_pointer(i);
            let len = self.cell_len_at(ptr);
            cells.push(self.data[ptr..ptr + len].to_vec());
        }

        let mut write_at = self.data.len();
        for (i, cell) in cells.iter().enumerate() {
            write_at -= cell.len();
            self.data[write_at..write_at + cell.len()].copy_from_slice(cell);
            self.set_cell_pointer(i as u16, write_at as u16);
        }

        self.header.cell_content_start = write_at as u32;
        self.header.first_freeblock = 0;
        self.header.fragmented_free_bytes = 0;
    }

    /// Computes a cell's on-disk length by re-parsing its leading
    /// length fields, needed generically during defragmentation.
    fn cell_len_at(&self, ptr: usize) -> usize {
        let page = self.as_page();
        let usable = page.usable_size();
        match self.header.page_type {
            BTreePageType::LeafTable => {
                let cell = &self.data[ptr..];
                let (payload_len, l1) = varint::read(cell);
                let (_rowid, l2) = varint::read(&cell[l1..]);
                let (local, overflow) = table_leaf_local_size(usable, payload_len as usize);
                l1 + l2 + local + if overflow { 4 } else { 0 }
            }
            BTreePageType::InteriorTable => {
                let cell = &self.data[ptr..];
                let (_rowid, l2) = varint::read(&cell[4..]);
                4 + l2
            }
            BTreePageType::LeafIndex => {
                let cell = &self.data[ptr..];
                let (payload_len, l1) = varint::read(cell);
                let (local, overflow) = index_local_size(usable, payload_len as usize);
                l1 + local + if overflow { 4 } else { 0 }
            }
            BTreePageType::InteriorIndex => {
                let cell = &self.data[ptr..];
                let (payload_len, l1) = varint::read(&cell[4..]);
                let (local, overflow) = index_local_size(usable, payload_len as usize);
                4 + l1 + local + if overflow { 4 } else { 0 }
            }
        }
    }

    /// Inserts a pre-built cell so that `cell_count` stays key-ordered;
    /// caller guarantees `at` is the correct sorted position (spec
    /// invariant (i)). Panics (debug_assert) if the cell doesn't fit --
    /// callers must check `total_free_space`/defragment first.
    pub fn insert_cell(&mut self, at: u16, cell: &[u8]) {
        debug_assert!(self.contiguous_free_space() >= cell.len() + 2);

        let write_at = self.header.cell_content_start as usize - cell.len();
        self.data[write_at..write_at + cell.len()].copy_from_slice(cell);
        self.header.cell_content_start = write_at as u32;

        // Shift the pointer array to make room at `at`.
        let arr_off = self.cell_pointer_array_offset();
        let count = self.cell_count();
        for i in (at..count).rev() {
            let ptr = self.cell_pointer(i);
            let dest = arr_off + (i as usize + 1) * 2;
            U16::from(ptr as u16).write_to_prefix(&mut self.data[dest..]).unwrap();
        }
        self.header.cell_count = count + 1;
        self.set_cell_pointer(at, write_at as u16);
    }

    /// Removes the cell at sorted position `at`; its bytes become a
    /// freeblock (simplification: always tracked as a freeblock, never
    /// folded into `fragmented_free_bytes`, which stays conservative).
    pub fn remove_cell(&mut self, at: u16) {
        let ptr = self.cell_pointer(at);
        let len = self.cell_len_at(ptr);

        if len >= 4 {
            let next = self.header.first_freeblock;
            U16::from(next).write_to_prefix(&mut self.data[ptr..]).unwrap();
            U16::from(len as u16).write_to_prefix(&mut self.data[ptr + 2..]).unwrap();
            self.header.first_freeblock = ptr as u16;
        } else {
            self.header.fragmented_free_bytes =
                self.header.fragmented_free_bytes.saturating_add(len as u8);
        }

        let arr_off = self.cell_pointer_array_offset();
        let count = self.cell_count();
        for i in at..count - 1 {
            let ptr = self.cell_pointer(i + 1);
            let dest = arr_off + i as usize * 2;
            U16::from(ptr as u16).write_to_prefix(&mut self.data[dest..]).unwrap();
        }
        self.header.cell_count = count - 1;
    }

    pub fn set_right_most_pointer(&mut self, page: u32) {
        self.header.right_most_pointer = page;
    }

    pub fn commit_header(&mut self) {
        self.header.write_into(&mut self.data[self.base..]);
    }
}

impl<'a> Drop for PageMut<'a> {
    fn drop(&mut self) {
        self.commit_header();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_leaf_header_round_trip() {
        let mut buf = vec![0u8; 4096];
        {
            let page = PageMut::init_empty(1, 0, BTreePageType::LeafTable, &mut buf);
            drop(page);
        }
        let parsed = Page::parse(1, 0, &buf).unwrap();
        assert_eq!(parsed.page_type(), BTreePageType::LeafTable);
        assert_eq!(parsed.cell_count(), 0);
    }

    #[test]
    fn test_insert_and_read_leaf_table_cell() {
        let mut buf = vec![0u8; 4096];
        {
            let mut page = PageMut::init_empty(1, 0, BTreePageType::LeafTable, &mut buf);
            let mut cell = Vec::new();
            let payload = b"hello world";
            let mut vbuf = [0u8; 9];
            let l = varint::write(payload.len() as i64, &mut vbuf);
            cell.extend_from_slice(&vbuf[..l]);
            let l = varint::write(42, &mut vbuf);
            cell.extend_from_slice(&vbuf[..l]);
            cell.extend_from_slice(payload);
            page.insert_cell(0, &cell);
        }
        let parsed = Page::parse(1, 0, &buf).unwrap();
        assert_eq!(parsed.cell_count(), 1);
        let (rowid, payload, overflow) = parsed.leaf_table_cell(0).unwrap();
        assert_eq!(rowid, 42);
        assert_eq!(payload, b"hello world");
        assert!(overflow.is_none());
    }

    #[test]
    fn test_remove_cell_then_reinsert_defragmented() {
        let mut buf = vec![0u8; 512];
        let mut page = PageMut::init_empty(1, 0, BTreePageType::LeafTable, &mut buf);
        for i in 0..5i64 {
            let mut cell = Vec::new();
            let payload = vec![b'x'; 50];
            let mut vbuf = [0u8; 9];
            let l = varint::write(payload.len() as i64, &mut vbuf);
            cell.extend_from_slice(&vbuf[..l]);
            let l = varint::write(i, &mut vbuf);
            cell.extend_from_slice(&vbuf[..l]);
            cell.extend_from_slice(&payload);
            page.insert_cell(i as u16, &cell);
        }
        page.remove_cell(2);
        assert_eq!(page.cell_count(), 4);
        page.defragment();
        assert_eq!(page.total_free_space() >= 50, true);
    }

    /// Property 5 -- free-space accounting: every byte of the page is
    /// either header, pointer array, a live cell, a freeblock, or a
    /// fragmented-free byte, with no overlap and no gap.
    #[test]
    fn test_free_space_accounting_identity() {
        let mut buf = vec![0u8; 512];
        let mut page = PageMut::init_empty(1, 0, BTreePageType::LeafTable, &mut buf);
        for i in 0..6i64 {
            let mut cell = Vec::new();
            let payload = vec![b'z'; 30 + i as usize];
            let mut vbuf = [0u8; 9];
            let l = varint::write(payload.len() as i64, &mut vbuf);
            cell.extend_from_slice(&vbuf[..l]);
            let l = varint::write(i, &mut vbuf);
            cell.extend_from_slice(&vbuf[..l]);
            cell.extend_from_slice(&payload);
            page.insert_cell(i as u16, &cell);
        }
        // Remove one cell (creates a freeblock) without defragmenting, so
        // the identity must hold across a mixed cell/freeblock layout.
        page.remove_cell(2);

        let header_size = page.header.header_size();
        let ptr_array_bytes = page.cell_count() as usize * 2;
        let cell_bytes: usize = (0..page.cell_count())
            .map(|i| {
                let ptr = page.cell_pointer(i);
                page.cell_len_at(ptr)
            })
            .sum();

        let accounted = page.base
            + header_size
            + ptr_array_bytes
            + page.total_free_space()
            + page.header.fragmented_free_bytes as usize
            + cell_bytes;
        assert_eq!(accounted, page.data.len());
    }
}
