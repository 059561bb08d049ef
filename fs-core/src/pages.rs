//! Page store backing regular file contents.
//!
//! A file's data is a sparse map from page index to a `BLOCK_SIZE` buffer.
//! Pages are reference counted so a copy-up can share them with the
//! ancestor; the first write through a shared page splits it first.
//! Every live buffer is charged to a layer's [`BlockUsage`] and released
//! when the last reference drops.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::blockdev::BLOCK_SIZE;

/// 512-byte sectors per page, as reported in `st_blocks`
pub const SECTORS_PER_PAGE: u64 = (BLOCK_SIZE / 512) as u64;

/// Block counters of one layer, rolled up into the engine total
#[derive(Debug)]
pub struct BlockUsage {
    blocks: AtomicU64,
    total: Arc<AtomicU64>,
}

impl BlockUsage {
    /// Create a per-layer counter feeding `total`
    pub fn new(total: Arc<AtomicU64>) -> Self {
        Self {
            blocks: AtomicU64::new(0),
            total,
        }
    }

    /// Pages currently charged to this layer
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Pages charged across the whole engine
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    // The total is read by capacity reservations, hence SeqCst
    fn charge(&self) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.blocks.fetch_sub(1, Ordering::Relaxed);
        self.total.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One page of file content
pub struct Page {
    data: Box<[u8; BLOCK_SIZE]>,
    usage: Arc<BlockUsage>,
}

impl Page {
    fn zeroed(usage: Arc<BlockUsage>) -> Self {
        usage.charge();
        Self {
            data: Box::new([0u8; BLOCK_SIZE]),
            usage,
        }
    }

    fn duplicate(&self, usage: Arc<BlockUsage>) -> Self {
        usage.charge();
        Self {
            data: self.data.clone(),
            usage,
        }
    }

    /// Page contents
    pub fn data(&self) -> &[u8; BLOCK_SIZE] {
        &self.data
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        self.usage.release();
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page").finish_non_exhaustive()
    }
}

/// Sparse page chain of one regular file
#[derive(Debug)]
pub struct PageChain {
    pages: BTreeMap<u64, Arc<Page>>,
    usage: Arc<BlockUsage>,
}

impl PageChain {
    /// Empty chain charging new pages to `usage`
    pub fn new(usage: Arc<BlockUsage>) -> Self {
        Self {
            pages: BTreeMap::new(),
            usage,
        }
    }

    /// Write `data` into page `index` starting at `offset`.
    ///
    /// The page is materialized when absent and split when shared; bytes
    /// outside the written span keep their previous contents.
    pub fn add_page(&mut self, index: u64, offset: usize, data: &[u8]) {
        assert!(
            offset + data.len() <= BLOCK_SIZE,
            "write of {} bytes at {offset} crosses a page boundary",
            data.len()
        );
        let page = self.private_page(index);
        page.data[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Copy bytes `[start, end)` into `out`; unmaterialized pages read as zeros
    pub fn read_pages(&self, start: u64, end: u64, out: &mut [u8]) {
        assert_eq!(out.len() as u64, end.saturating_sub(start));
        let mut pos = start;
        while pos < end {
            let index = pos / BLOCK_SIZE as u64;
            let in_page = (pos % BLOCK_SIZE as u64) as usize;
            let len = (BLOCK_SIZE - in_page).min((end - pos) as usize);
            let dst = &mut out[(pos - start) as usize..(pos - start) as usize + len];

            match self.pages.get(&index) {
                Some(page) => dst.copy_from_slice(&page.data[in_page..in_page + len]),
                None => dst.fill(0),
            }
            pos += len as u64;
        }
    }

    /// Shrink the chain to `new_size` bytes.
    ///
    /// Pages wholly past the boundary are released and the tail of the
    /// straddling page is zeroed, so a later extension reads zeros.
    pub fn truncate_pages(&mut self, new_size: u64) {
        let keep = new_size.div_ceil(BLOCK_SIZE as u64);
        drop(self.pages.split_off(&keep));

        let tail = (new_size % BLOCK_SIZE as u64) as usize;
        let last = new_size / BLOCK_SIZE as u64;
        if tail != 0 && self.pages.contains_key(&last) {
            let page = self.private_page(last);
            page.data[tail..].fill(0);
        }
    }

    /// Number of pages a write over `[start, end)` would newly charge
    pub fn pages_needed(&self, start: u64, end: u64) -> u64 {
        if start >= end {
            return 0;
        }
        let first = start / BLOCK_SIZE as u64;
        let last = (end - 1) / BLOCK_SIZE as u64;
        (first..=last)
            .filter(|index| match self.pages.get(index) {
                Some(page) => Arc::strong_count(page) > 1,
                None => true,
            })
            .count() as u64
    }

    /// Pages a shrink to `new_size` would newly charge: one when the
    /// straddling page is shared and has to be split before zeroing
    pub fn truncate_needed(&self, new_size: u64) -> u64 {
        if new_size % BLOCK_SIZE as u64 == 0 {
            return 0;
        }
        match self.pages.get(&(new_size / BLOCK_SIZE as u64)) {
            Some(page) if Arc::strong_count(page) > 1 => 1,
            _ => 0,
        }
    }

    /// Materialized pages in this chain
    pub fn page_count(&self) -> u64 {
        self.pages.len() as u64
    }

    /// Sectors reported in `st_blocks`
    pub fn sectors(&self) -> u64 {
        self.page_count() * SECTORS_PER_PAGE
    }

    /// New chain referencing the same pages, charging later splits to `usage`
    pub fn share(&self, usage: Arc<BlockUsage>) -> PageChain {
        PageChain {
            pages: self.pages.clone(),
            usage,
        }
    }

    fn private_page(&mut self, index: u64) -> &mut Page {
        let usage = &self.usage;
        let slot = self
            .pages
            .entry(index)
            .or_insert_with(|| Arc::new(Page::zeroed(Arc::clone(usage))));
        if Arc::get_mut(slot).is_none() {
            let private = slot.duplicate(Arc::clone(usage));
            *slot = Arc::new(private);
        }
        match Arc::get_mut(slot) {
            Some(page) => page,
            None => unreachable!("page {index} still shared after split"),
        }
    }
}
