//! The free list: a chain of trunk pages, each holding up to
//! `(usable_size/4 - 2)` leaf page numbers (spec §3 "Free list").

use zerocopy::big_endian::U32;
use zerocopy::FromBytes;

use crate::error::Result;

/// Minimal capability the free list needs from its backing store: read a
/// raw page, write a raw page back. Implemented by `Transaction` so the
/// free list doesn't need to know about dirty-page tracking or the cache.
pub trait FreelistStore {
    fn read_raw(&mut self, page: u32) -> Result<Box<[u8]>>;
    fn write_raw(&mut self, page: u32, data: &[u8]) -> Result<()>;
    fn usable_size(&self) -> usize;
}

/// Pops one page number off the free list, rewriting the trunk page in
/// place (or advancing the head if the popped trunk becomes empty).
/// Returns `(allocated_page, new_head, new_count)`.
pub fn pop_page(
    store: &mut impl FreelistStore,
    freelist_head: u32,
    freelist_count: u32,
) -> Result<Option<(u32, u32, u32)>> {
    if freelist_head == 0 || freelist_count == 0 {
        return Ok(None);
    }

    let mut trunk = store.read_raw(freelist_head)?;
    let leaf_count = U32::read_from_prefix(&trunk[4..]).unwrap().get();

    if leaf_count > 0 {
        // Pop the last leaf entry in the trunk (cheapest: no shifting).
        let entry_offset = 8 + (leaf_count as usize - 1) * 4;
        let page = U32::read_from_prefix(&trunk[entry_offset..]).unwrap().get();
        U32::from(leaf_count - 1)
            .write_to_prefix(&mut trunk[4..])
            .unwrap();
        store.write_raw(freelist_head, &trunk)?;
        Ok(Some((page, freelist_head, freelist_count - 1)))
    } else {
        // Trunk itself becomes the allocated page; the next trunk becomes
        // the new head.
        let next_trunk = U32::read_from_prefix(&trunk).unwrap().get();
        Ok(Some((freelist_head, next_trunk, freelist_count - 1)))
    }
}

/// Pushes `page` onto the free list, either as a new leaf entry in the
/// current head trunk (if it has room) or as a brand new trunk page.
/// Returns `(new_head, new_count)`.
pub fn push_page(
    store: &mut impl FreelistStore,
    page: u32,
    freelist_head: u32,
    freelist_count: u32,
) -> Result<(u32, u32)> {
    let max_leaves = store.usable_size() / 4 - 2;

    if freelist_head != 0 {
        let mut trunk = store.read_raw(freelist_head)?;
        let leaf_count = U32::read_from_prefix(&trunk[4..]).unwrap().get() as usize;
        if leaf_count < max_leaves {
            let entry_offset = 8 + leaf_count * 4;
            U32::from(page)
                .write_to_prefix(&mut trunk[entry_offset..])
                .unwrap();
            U32::from(leaf_count as u32 + 1)
                .write_to_prefix(&mut trunk[4..])
                .unwrap();
            store.write_raw(freelist_head, &trunk)?;
            return Ok((freelist_head, freelist_count + 1));
        }
    }

    // Make `page` itself a new trunk pointing at the old head.
    let mut new_trunk = vec![0u8; store.usable_size()].into_boxed_slice();
    U32::from(freelist_head).write_to_prefix(&mut new_trunk[..]).unwrap();
    U32::from(0u32).write_to_prefix(&mut new_trunk[4..]).unwrap();
    store.write_raw(page, &new_trunk)?;
    Ok((page, freelist_count + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeStore {
        pages: HashMap<u32, Box<[u8]>>,
        usable_size: usize,
    }

    impl FreelistStore for FakeStore {
        fn read_raw(&mut self, page: u32) -> Result<Box<[u8]>> {
            Ok(self.pages.get(&page).unwrap().clone())
        }

        fn write_raw(&mut self, page: u32, data: &[u8]) -> Result<()> {
            self.pages.insert(page, data.to_vec().into_boxed_slice());
            Ok(())
        }

        fn usable_size(&self) -> usize {
            self.usable_size
        }
    }

    #[test]
    fn test_push_then_pop_single_page() {
        let mut store = FakeStore {
            pages: HashMap::new(),
            usable_size: 512,
        };

        let (head, count) = push_page(&mut store, 5, 0, 0).unwrap();
        assert_eq!(head, 5);
        assert_eq!(count, 1);

        let popped = pop_page(&mut store, head, count).unwrap();
        assert_eq!(popped, Some((5, 0, 0)));
    }

    #[test]
    fn test_push_two_pages_same_trunk() {
        let mut store = FakeStore {
            pages: HashMap::new(),
            usable_size: 512,
        };
        let mut head = 0;
        let mut count = 0;
        for page in [10, 11] {
            let (h, c) = push_page(&mut store, page, head, count).unwrap();
            head = h;
            count = c;
        }
        assert_eq!(head, 10);
        assert_eq!(count, 2);

        let popped = pop_page(&mut store, head, count).unwrap();
        assert_eq!(popped, Some((11, 10, 1)));
    }
}
