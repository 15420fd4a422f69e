//! Unbounded in-memory page cache.

use crate::page::Page;
use crate::PageCache;
use larch_common::page::PageId;
use larch_common::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// An unbounded, purely in-memory page cache.
///
/// Ids come from a monotonic counter starting at 1. Nothing is ever evicted
/// or written anywhere, so pinning and flushing are no-ops. Useful for tests
/// and volatile indexes.
pub struct MemPageCache {
    page_size: usize,
    next_id: AtomicU32,
    pages: RwLock<HashMap<PageId, Arc<Page>>>,
}

impl MemPageCache {
    /// Creates an empty in-memory cache with the given page size.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            next_id: AtomicU32::new(1),
            pages: RwLock::new(HashMap::new()),
        }
    }
}

impl PageCache for MemPageCache {
    fn new_page(&self) -> Result<Arc<Page>> {
        let pid = PageId(self.next_id.fetch_add(1, Ordering::AcqRel));
        let page = Arc::new(Page::new(pid, self.page_size));
        self.pages.write().insert(pid, page.clone());
        Ok(page)
    }

    fn fetch_page(&self, pid: PageId) -> Result<Option<Arc<Page>>> {
        Ok(self.pages.read().get(&pid).cloned())
    }

    fn pin_page(&self, _page: &Page) {}

    fn unpin_page(&self, _page: &Page, _dirty: bool) -> Result<()> {
        Ok(())
    }

    fn flush_page(&self, _page: &Page) -> Result<()> {
        Ok(())
    }

    fn flush_all_pages(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> usize {
        self.pages.read().len()
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
