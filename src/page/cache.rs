//! Bounded page cache with CLOCK eviction (spec §4.2). One cache per open
//! handle.
//!
//! Pages are handed out as `Rc<[u8]>` rather than borrowed slices: cloning
//! an `Rc` is cheap, and a page evicted out from under an in-progress
//! cursor traversal just means a cache miss on the next fetch, not a
//! dangling reference -- so eviction only ever costs performance, never
//! correctness, and the cache needs no separate pinning scheme.
//!
//! Dirty pages are never evicted (`evict_one` skips them); they leave the
//! cache only via `clear_dirty`/`remove` once a transaction has flushed
//! them to disk.

use std::collections::HashMap;
use std::rc::Rc;

use log::trace;

use crate::error::Result;

struct CachedPage {
    data: Rc<[u8]>,
    dirty: bool,
    clock_ref: bool,
}

pub struct PageCache {
    pages: HashMap<u32, CachedPage>,
    order: Vec<u32>,
    sweep: usize,
    capacity: usize,
    /// Bumped on every commit; cursors compare this against the value they
    /// captured to detect a concurrent writer's commit (spec §4.2, §5).
    pub generation: u64,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            pages: HashMap::new(),
            order: Vec::new(),
            sweep: 0,
            capacity: capacity.max(8),
            generation: 0,
        }
    }

    pub fn invalidate_all(&mut self) {
        self.pages.clear();
        self.order.clear();
        self.sweep = 0;
    }

    /// Returns a page's bytes, calling `fetch` (raw read, decrypted and
    /// trimmed to the usable size) on a miss and inserting into the cache
    /// (evicting if full). `fetch` is a closure rather than a `&mut
    /// PagedFile` so the caller can interpose decryption (spec §4.9)
    /// without the cache needing to know about crypto at all.
    pub fn get(
        &mut self,
        page_number: u32,
        fetch: impl FnOnce(u32) -> Result<Box<[u8]>>,
    ) -> Result<Rc<[u8]>> {
        self.load(page_number, fetch)?;
        Ok(self.pages.get(&page_number).unwrap().data.clone())
    }

    fn load(
        &mut self,
        page_number: u32,
        fetch: impl FnOnce(u32) -> Result<Box<[u8]>>,
    ) -> Result<()> {
        if let Some(p) = self.pages.get_mut(&page_number) {
            p.clock_ref = true;
            return Ok(());
        }

        if self.pages.len() >= self.capacity {
            self.evict_one();
        }

        let data: Rc<[u8]> = fetch(page_number)?.into();
        self.pages.insert(
            page_number,
            CachedPage {
                data,
                dirty: false,
                clock_ref: true,
            },
        );
        self.order.push(page_number);
        trace!("page {page_number} loaded into cache");
        Ok(())
    }

    fn evict_one(&mut self) {
        if self.order.is_empty() {
            return;
        }
        let start = self.sweep;
        loop {
            let idx = self.sweep % self.order.len();
            let page_number = self.order[idx];
            let mut evicted = false;
            if let Some(page) = self.pages.get_mut(&page_number) {
                if !page.dirty {
                    if page.clock_ref {
                        page.clock_ref = false;
                    } else {
                        evicted = true;
                    }
                }
            }
            if evicted {
                self.pages.remove(&page_number);
                self.order.remove(idx);
                return;
            }
            self.sweep = (self.sweep + 1) % self.order.len().max(1);
            if self.sweep == start {
                // Every page is dirty; grow rather than stall -- a bounded
                // cache must never block mutation correctness.
                return;
            }
        }
    }

    pub fn mark_dirty(&mut self, page_number: u32, data: Box<[u8]>) {
        let data: Rc<[u8]> = data.into();
        match self.pages.get_mut(&page_number) {
            Some(p) => {
                p.data = data;
                p.dirty = true;
                p.clock_ref = true;
            }
            None => {
                self.pages.insert(
                    page_number,
                    CachedPage {
                        data,
                        dirty: true,
                        clock_ref: true,
                    },
                );
                self.order.push(page_number);
            }
        }
    }

    /// Overwrites a page's cached bytes without marking it dirty, used after
    /// a transaction flushes a page to disk so later reads in this process
    /// see the committed content without re-reading the file.
    pub fn replace(&mut self, page_number: u32, data: Box<[u8]>) {
        let data: Rc<[u8]> = data.into();
        match self.pages.get_mut(&page_number) {
            Some(p) => {
                p.data = data;
                p.dirty = false;
                p.clock_ref = true;
            }
            None => {
                self.pages.insert(
                    page_number,
                    CachedPage {
                        data,
                        dirty: false,
                        clock_ref: true,
                    },
                );
                self.order.push(page_number);
            }
        }
    }

    pub fn is_dirty(&self, page_number: u32) -> bool {
        self.pages.get(&page_number).map(|p| p.dirty).unwrap_or(false)
    }

    pub fn dirty_pages(&self) -> impl Iterator<Item = (u32, Rc<[u8]>)> + '_ {
        self.pages
            .iter()
            .filter(|(_, p)| p.dirty)
            .map(|(&n, p)| (n, p.data.clone()))
    }

    pub fn clear_dirty(&mut self) {
        for p in self.pages.values_mut() {
            p.dirty = false;
        }
    }

    pub fn remove(&mut self, page_number: u32) {
        if self.pages.remove(&page_number).is_some() {
            self.order.retain(|&p| p != page_number);
        }
    }
}

