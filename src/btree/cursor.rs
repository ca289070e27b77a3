//! The read-only B-tree cursor (C5): root-to-leaf descent, seek, and
//! ordered forward/backward scan over table and index B-trees (spec §4.5).
//!
//! A cursor's path is an owned stack of `(page_number, cell_index)` pairs
//! (spec §9 "Cycles and back-references") -- there are no back-pointers on
//! pages themselves, so ascent reconstructs the parent relation from the
//! stack rather than from anything stored on disk.

use std::rc::Rc;

use crate::btree::page::{BTreePageType, Page};
use crate::btree::PageSource;
use crate::error::{Error, Result};
use crate::record::{compare_values, Row, Value};

/// Where a cursor sits relative to its B-tree's key order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    /// Positioned exactly on a cell.
    On,
    /// Ran off one end of the tree; no cell is current.
    End,
}

/// A single frame of the root-to-leaf path: the page visited and the next
/// sibling index to resume at on ascent.
struct Frame {
    page_number: u32,
    next_index: u16,
}

pub struct Cursor<'s> {
    source: &'s dyn PageSource,
    root_page: u32,
    is_table: bool,
    /// Ancestor frames above the current page, shallowest last.
    stack: Vec<Frame>,
    current_page: u32,
    current_index: u16,
    current_cell_count: u16,
    position: Position,
    /// The cache generation captured when this cursor was created or last
    /// repositioned; checked before trusting anything cached (spec §4.2,
    /// §4.5 "Cursor stability").
    generation: u64,
}

impl<'s> Cursor<'s> {
    pub fn new(source: &'s dyn PageSource, root_page: u32, is_table: bool, generation: u64) -> Result<Self> {
        let mut cursor = Self {
            source,
            root_page,
            is_table,
            stack: Vec::new(),
            current_page: root_page,
            current_index: 0,
            current_cell_count: 0,
            position: Position::End,
            generation,
        };
        cursor.reset_to_root();
        Ok(cursor)
    }

    fn reset_to_root(&mut self) {
        self.stack.clear();
        self.current_page = self.root_page;
        self.current_index = 0;
        self.position = Position::End;
    }

    fn check_generation(&self, current: u64) -> Result<()> {
        if current != self.generation {
            return Err(Error::TransactionAborted(
                "cursor is stale: a writer committed since this cursor was positioned".into(),
            ));
        }
        Ok(())
    }

    fn fetch(&self, page_number: u32) -> Result<Rc<[u8]>> {
        self.source.get_page(page_number)
    }

    fn base(&self, page_number: u32) -> usize {
        crate::page::btree_header_offset(page_number)
    }

    /// Moves to the first (leftmost) leaf cell in the tree.
    pub fn first(&mut self) -> Result<()> {
        self.reset_to_root();
        let mut page_number = self.root_page;
        loop {
            let data = self.fetch(page_number)?;
            let page = Page::parse(page_number, self.base(page_number), &data)?;
            if page.page_type().is_leaf() {
                self.current_page = page_number;
                self.current_index = 0;
                self.current_cell_count = page.cell_count();
                self.position = if page.cell_count() == 0 {
                    Position::End
                } else {
                    Position::On
                };
                return Ok(());
            }
            let child = self.leftmost_child(&page)?;
            self.stack.push(Frame {
                page_number,
                next_index: 0,
            });
            page_number = child;
        }
    }

    fn leftmost_child(&self, page: &Page) -> Result<u32> {
        if page.cell_count() == 0 {
            return Ok(page.header.right_most_pointer);
        }
        Ok(match page.page_type() {
            BTreePageType::InteriorTable => page.interior_table_cell(0).0,
            BTreePageType::InteriorIndex => page.interior_index_cell(0)?.0,
            _ => unreachable!("leftmost_child called on a leaf page"),
        })
    }

    /// Moves to the last (rightmost) leaf cell in the tree.
    pub fn last(&mut self) -> Result<()> {
        self.reset_to_root();
        let mut page_number = self.root_page;
        loop {
            let data = self.fetch(page_number)?;
            let page = Page::parse(page_number, self.base(page_number), &data)?;
            if page.page_type().is_leaf() {
                self.current_page = page_number;
                self.current_cell_count = page.cell_count();
                self.position = if page.cell_count() == 0 {
                    Position::End
                } else {
                    self.current_index = page.cell_count() - 1;
                    Position::On
                };
                return Ok(());
            }
            let child = page.header.right_most_pointer;
            self.stack.push(Frame {
                page_number,
                next_index: page.cell_count(), // exhausted on this side
            });
            page_number = child;
        }
    }

    /// Seeks a table B-tree cursor to `rowid`, landing either exactly on it
    /// or at the next greater key if absent (spec §4.5 "seek").
    pub fn seek_rowid(&mut self, rowid: i64) -> Result<bool> {
        assert!(self.is_table, "seek_rowid on an index cursor");
        self.reset_to_root();
        let mut page_number = self.root_page;
        loop {
            let data = self.fetch(page_number)?;
            let page = Page::parse(page_number, self.base(page_number), &data)?;
            if page.page_type().is_leaf() {
                let (index, found) = binary_search_table_leaf(&page, rowid)?;
                self.current_page = page_number;
                self.current_index = index;
                self.current_cell_count = page.cell_count();
                self.position = if index < page.cell_count() {
                    Position::On
                } else {
                    Position::End
                };
                return Ok(found);
            }
            let (child_index, child_page) = descend_table_interior(&page, rowid)?;
            self.stack.push(Frame {
                page_number,
                next_index: child_index + 1,
            });
            page_number = child_page;
        }
    }

    /// Seeks an index B-tree cursor to the first entry whose key is `>=
    /// key` (spec §4.5 "seek"), per-column lexicographic comparison.
    pub fn seek_index(&mut self, key: &[Value]) -> Result<bool> {
        assert!(!self.is_table, "seek_index on a table cursor");
        self.reset_to_root();
        let mut page_number = self.root_page;
        loop {
            let data = self.fetch(page_number)?;
            let page = Page::parse(page_number, self.base(page_number), &data)?;
            if page.page_type().is_leaf() {
                let (index, found) = binary_search_index_leaf(self.source, &page, key)?;
                self.current_page = page_number;
                self.current_index = index;
                self.current_cell_count = page.cell_count();
                self.position = if index < page.cell_count() {
                    Position::On
                } else {
                    Position::End
                };
                return Ok(found);
            }
            let (child_index, child_page) = descend_index_interior(self.source, &page, key)?;
            self.stack.push(Frame {
                page_number,
                next_index: child_index + 1,
            });
            page_number = child_page;
        }
    }

    /// Advances to the next leaf cell in key order. Re-ascends to the
    /// nearest ancestor with unvisited siblings, then descends back to the
    /// next leaf (spec §4.5 "Sibling iteration": there are no leaf-to-leaf
    /// pointers, only the parent's cell-pointer array).
    pub fn next(&mut self) -> Result<()> {
        self.check_generation(self.source.generation())?;
        if self.position != Position::On {
            return Ok(());
        }
        if self.current_index + 1 < self.current_cell_count {
            self.current_index += 1;
            return Ok(());
        }
        // Leaf exhausted: ascend until we find a frame with more children.
        while let Some(frame) = self.stack.pop() {
            let data = self.fetch(frame.page_number)?;
            let page = Page::parse(frame.page_number, self.base(frame.page_number), &data)?;
            let child_count = page.cell_count() as u32 + 1; // + rightmost pointer
            if (frame.next_index as u32) < child_count {
                let child_page = if (frame.next_index as u32) == page.cell_count() as u32 {
                    page.header.right_most_pointer
                } else {
                    self.child_pointer(&page, frame.next_index)?
                };
                self.stack.push(Frame {
                    page_number: frame.page_number,
                    next_index: frame.next_index + 1,
                });
                return self.descend_leftmost_from(child_page);
            }
        }
        self.position = Position::End;
        Ok(())
    }

    /// Moves to the previous leaf cell in key order (mirror of `next`).
    pub fn prev(&mut self) -> Result<()> {
        self.check_generation(self.source.generation())?;
        if self.position != Position::On {
            return Ok(());
        }
        if self.current_index > 0 {
            self.current_index -= 1;
            return Ok(());
        }
        while let Some(frame) = self.stack.pop() {
            // `next_index` was already advanced past the child we came
            // from; the sibling to its left is two steps back.
            if frame.next_index >= 2 {
                let sib_index = frame.next_index - 2;
                let data = self.fetch(frame.page_number)?;
                let page = Page::parse(frame.page_number, self.base(frame.page_number), &data)?;
                let child_page = self.child_pointer(&page, sib_index)?;
                self.stack.push(Frame {
                    page_number: frame.page_number,
                    next_index: sib_index + 1,
                });
                return self.descend_rightmost_from(child_page);
            }
        }
        self.position = Position::End;
        Ok(())
    }

    fn child_pointer(&self, page: &Page, index: u16) -> Result<u32> {
        Ok(match page.page_type() {
            BTreePageType::InteriorTable => page.interior_table_cell(index).0,
            BTreePageType::InteriorIndex => page.interior_index_cell(index)?.0,
            _ => unreachable!(),
        })
    }

    fn descend_leftmost_from(&mut self, mut page_number: u32) -> Result<()> {
        loop {
            let data = self.fetch(page_number)?;
            let page = Page::parse(page_number, self.base(page_number), &data)?;
            if page.page_type().is_leaf() {
                self.current_page = page_number;
                self.current_index = 0;
                self.current_cell_count = page.cell_count();
                self.position = if page.cell_count() == 0 {
                    Position::End
                } else {
                    Position::On
                };
                return Ok(());
            }
            let child = self.leftmost_child(&page)?;
            self.stack.push(Frame {
                page_number,
                next_index: 0,
            });
            page_number = child;
        }
    }

    fn descend_rightmost_from(&mut self, mut page_number: u32) -> Result<()> {
        loop {
            let data = self.fetch(page_number)?;
            let page = Page::parse(page_number, self.base(page_number), &data)?;
            if page.page_type().is_leaf() {
                self.current_page = page_number;
                self.current_cell_count = page.cell_count();
                self.position = if page.cell_count() == 0 {
                    Position::End
                } else {
                    self.current_index = page.cell_count() - 1;
                    Position::On
                };
                return Ok(());
            }
            let child = page.header.right_most_pointer;
            self.stack.push(Frame {
                page_number,
                next_index: page.cell_count(),
            });
            page_number = child;
        }
    }

    /// Whether the cursor currently sits on a valid row.
    pub fn valid(&self) -> bool {
        self.position == Position::On
    }

    /// Decodes the row the cursor currently sits on. `scratch` receives
    /// overflow-assembled bytes when the payload spills (spec §4.4).
    pub fn current<'a>(&self, scratch: &'a mut Vec<u8>) -> Result<Row<'a>> {
        self.check_generation(self.source.generation())?;
        if !self.valid() {
            return Err(Error::NotFound);
        }
        let data = self.fetch(self.current_page)?;
        let page = Page::parse(self.current_page, self.base(self.current_page), &data)?;

        let (payload, rowid, overflow) = if self.is_table {
            let (rowid, payload, overflow) = page.leaf_table_cell(self.current_index)?;
            (payload, Some(rowid), overflow)
        } else {
            let (payload, overflow) = page.leaf_index_cell(self.current_index)?;
            (payload, None, overflow)
        };

        if let Some(first_overflow) = overflow {
            let total_len = if self.is_table {
                page.leaf_table_payload_len(self.current_index) as usize
            } else {
                page.leaf_index_payload_len(self.current_index) as usize
            };
            *scratch = crate::btree::read_overflow_chain(self.source, payload, first_overflow, total_len)?;
            Row::decode(scratch, rowid).map_err(|e| rewrap(e, self.current_page))
        } else {
            // Safety note: `payload` borrows from `data` (an `Rc<[u8]>`
            // dropped at the end of this scope), so it cannot outlive this
            // function as a borrow of `page`/`data` directly; copy it into
            // the caller's scratch buffer uniformly, inlined or not, so the
            // returned `Row`'s lifetime is always tied to `scratch`.
            scratch.clear();
            scratch.extend_from_slice(payload);
            Row::decode(scratch, rowid).map_err(|e| rewrap(e, self.current_page))
        }
    }

    pub fn current_page_number(&self) -> u32 {
        self.current_page
    }
}

fn rewrap(e: Error, page: u32) -> Error {
    match e {
        Error::Corrupt { reason, .. } => Error::Corrupt { page, reason },
        other => other,
    }
}

fn binary_search_table_leaf(page: &Page, rowid: i64) -> Result<(u16, bool)> {
    let mut lo = 0u16;
    let mut hi = page.cell_count();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let (mid_rowid, _, _) = page.leaf_table_cell(mid)?;
        if mid_rowid < rowid {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    let found = lo < page.cell_count() && page.leaf_table_cell(lo)?.0 == rowid;
    Ok((lo, found))
}

fn descend_table_interior(page: &Page, rowid: i64) -> Result<(u16, u32)> {
    let mut lo = 0u16;
    let mut hi = page.cell_count();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let (_, key) = page.interior_table_cell(mid);
        if key < rowid {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    if lo == page.cell_count() {
        Ok((lo, page.header.right_most_pointer))
    } else {
        let (child, _) = page.interior_table_cell(lo);
        Ok((lo, child))
    }
}

fn binary_search_index_leaf(
    source: &dyn PageSource,
    page: &Page,
    key: &[Value],
) -> Result<(u16, bool)> {
    let mut lo = 0u16;
    let mut hi = page.cell_count();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let (payload, overflow) = page.leaf_index_cell(mid)?;
        let total_len = page.leaf_index_payload_len(mid) as usize;
        if index_cell_cmp(source, payload, overflow, total_len, key)? == std::cmp::Ordering::Less {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    let found = if lo < page.cell_count() {
        let (payload, overflow) = page.leaf_index_cell(lo)?;
        let total_len = page.leaf_index_payload_len(lo) as usize;
        index_cell_cmp(source, payload, overflow, total_len, key)? == std::cmp::Ordering::Equal
    } else {
        false
    };
    Ok((lo, found))
}

fn descend_index_interior(
    source: &dyn PageSource,
    page: &Page,
    key: &[Value],
) -> Result<(u16, u32)> {
    let mut lo = 0u16;
    let mut hi = page.cell_count();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let (_, payload, overflow) = page.interior_index_cell(mid)?;
        // Interior index cells carry the same payload encoding as leaf
        // cells (spec §3 "Cell"); the declared length was already consumed
        // to find `payload`, so re-derive it from the local/overflow split
        // directly: a non-overflowing cell's full length is `payload.len()`.
        let total_len = if overflow.is_some() {
            index_overflow_total_len(source, payload, overflow.unwrap())?
        } else {
            payload.len()
        };
        if index_cell_cmp(source, payload, overflow, total_len, key)? == std::cmp::Ordering::Less {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    if lo == page.cell_count() {
        Ok((lo, page.header.right_most_pointer))
    } else {
        let (child, _, _) = page.interior_index_cell(lo)?;
        Ok((lo, child))
    }
}

/// For interior-cell comparisons only: the declared length isn't directly
/// exposed once `interior_index_cell` has already parsed past it, so a
/// conservative upper bound (the usable page size) is used to bound the
/// overflow assembly instead -- the chain's own `next == 0` terminator
/// still stops the walk at the true end.
fn index_overflow_total_len(source: &dyn PageSource, local: &[u8], first: u32) -> Result<usize> {
    let mut len = local.len();
    let mut page_number = first;
    let per_page = source.usable_size() - 4;
    while page_number != 0 {
        let data = source.get_page(page_number)?;
        let next = u32::from_be_bytes(data[0..4].try_into().unwrap());
        len += per_page.min(data.len() - 4);
        page_number = next;
    }
    Ok(len)
}

/// Compares one index cell's decoded key against `key`, assembling its
/// overflow chain into a local buffer when the payload spills. The
/// decoded `Value`s borrow from that local buffer and never escape this
/// function -- only the `Ordering` result does.
fn index_cell_cmp(
    source: &dyn PageSource,
    payload: &[u8],
    overflow: Option<u32>,
    total_len: usize,
    key: &[Value],
) -> Result<std::cmp::Ordering> {
    let assembled;
    let full: &[u8] = if let Some(first) = overflow {
        assembled = crate::btree::read_overflow_chain(source, payload, first, total_len)?;
        &assembled
    } else {
        payload
    };
    let row = Row::decode(full, None)?;
    let values = row.values();
    Ok(compare_values(&values, key))
}
