//! Bounded disk-backed page cache with LRU eviction.

use crate::page::Page;
use crate::PageCache;
use larch_common::page::{PageId, DEFAULT_PAGE_SIZE};
use larch_common::{LarchError, Result};
use larch_store::HeapFile;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use sysinfo::System;

/// Configuration for the disk-backed page cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapCacheConfig {
    /// Path of the heap store file.
    pub path: PathBuf,
    /// Create the file if it does not exist.
    pub create: bool,
    /// Maximum number of resident pages.
    pub max_pages: usize,
    /// Page size in bytes; ignored when opening an existing file.
    pub page_size: usize,
    /// Issue a device sync at the end of `flush_all_pages`.
    pub sync_on_flush_all: bool,
}

impl Default for HeapCacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./larch.heap"),
            create: true,
            max_pages: 4096,
            page_size: DEFAULT_PAGE_SIZE,
            sync_on_flush_all: true,
        }
    }
}

/// A bounded page cache over a heap file.
///
/// Residency state (the owned pages and the id map) lives under one mutex;
/// the LRU victim list lives under a second mutex that is never held across
/// an I/O. The victim list is MRU-at-head: a page whose pin count returns to
/// zero is pushed to the head, the tail is the next eviction victim.
pub struct HeapPageCache {
    heap: HeapFile,
    page_size: usize,
    max_pages: usize,
    sync_on_flush_all: bool,
    inner: Mutex<Residency>,
    lru: Mutex<LruCache<PageId, ()>>,
}

struct Residency {
    /// Owned resident pages, in allocation order.
    slots: Vec<Arc<Page>>,
    /// Current residency map.
    map: HashMap<PageId, Arc<Page>>,
}

impl HeapPageCache {
    /// Opens the backing heap file and creates an empty cache over it.
    pub fn new(config: HeapCacheConfig) -> Result<Self> {
        let heap = HeapFile::open(&config.path, config.create, config.page_size)?;
        let page_size = heap.page_size();

        Ok(Self {
            heap,
            page_size,
            max_pages: config.max_pages.max(1),
            sync_on_flush_all: config.sync_on_flush_all,
            inner: Mutex::new(Residency {
                slots: Vec::new(),
                map: HashMap::new(),
            }),
            lru: Mutex::new(LruCache::unbounded()),
        })
    }

    /// Creates a cache sized to 25% of available system RAM, with a floor of
    /// 1024 pages. The `max_pages` field of the config is ignored.
    pub fn auto_sized(config: HeapCacheConfig) -> Result<Self> {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let target_bytes = sys.available_memory() as usize / 4;
        let max_pages = (target_bytes / config.page_size.max(1)).max(1024);

        Self::new(HeapCacheConfig { max_pages, ..config })
    }

    /// Returns the maximum number of resident pages.
    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// Reserves a resident slot for `pid`: a fresh buffer while below
    /// capacity, otherwise the reassigned LRU victim.
    fn alloc_page(&self, res: &mut Residency, pid: PageId) -> Result<Arc<Page>> {
        if res.slots.len() < self.max_pages {
            let page = Arc::new(Page::new(pid, self.page_size));
            res.slots.push(page.clone());
            res.map.insert(pid, page.clone());
            return Ok(page);
        }

        let victim = loop {
            let popped = self.lru.lock().pop_lru();
            let Some((victim_id, ())) = popped else {
                return Err(LarchError::CacheFull);
            };
            let Some(page) = res.map.get(&victim_id).cloned() else {
                continue;
            };
            // A pin that raced with the list update may leave a pinned entry
            // behind; its unpin-to-zero will re-insert it.
            if page.is_pinned() {
                continue;
            }
            break page;
        };

        if victim.is_dirty() {
            tracing::trace!(victim = %victim.id(), new = %pid, "flushing dirty eviction victim");
            self.flush_page(&victim)?;
        }
        res.map.remove(&victim.id());
        victim.set_id(pid);
        res.map.insert(pid, victim.clone());
        Ok(victim)
    }

    /// Pins a resident page, removing it from the victim list on the
    /// unpinned-to-pinned transition.
    fn pin_resident(&self, page: &Page) {
        if page.pin() == 0 {
            self.lru.lock().pop(&page.id());
        }
    }

    /// Drops a freshly reserved slot whose backing read failed, so a later
    /// fetch of the same id retries the read instead of seeing garbage.
    fn discard_slot(&self, res: &mut Residency, pid: PageId, page: &Arc<Page>) {
        res.map.remove(&pid);
        if let Some(i) = res.slots.iter().position(|p| Arc::ptr_eq(p, page)) {
            res.slots.swap_remove(i);
        }
    }
}

impl PageCache for HeapPageCache {
    fn new_page(&self) -> Result<Arc<Page>> {
        let mut res = self.inner.lock();

        let pid = self.heap.new_page()?;
        let page = self.alloc_page(&mut res, pid)?;
        page.data().fill(0);
        self.pin_resident(&page);
        Ok(page)
    }

    fn fetch_page(&self, pid: PageId) -> Result<Option<Arc<Page>>> {
        let mut res = self.inner.lock();

        if let Some(page) = res.map.get(&pid).cloned() {
            self.pin_resident(&page);
            return Ok(Some(page));
        }

        let page = self.alloc_page(&mut res, pid)?;
        let read = {
            let mut buf = page.data();
            self.heap.read_page(pid, &mut buf)
        };
        match read {
            Ok(()) => {
                self.pin_resident(&page);
                Ok(Some(page))
            }
            Err(err) => {
                self.discard_slot(&mut res, pid, &page);
                match err {
                    LarchError::InvalidPageId(_) | LarchError::PageOutOfBounds { .. } => Ok(None),
                    other => Err(other),
                }
            }
        }
    }

    fn pin_page(&self, page: &Page) {
        self.pin_resident(page);
    }

    fn unpin_page(&self, page: &Page, dirty: bool) -> Result<()> {
        if dirty {
            page.set_dirty(true);
        }
        let remaining = page.unpin()?;
        if remaining == 0 {
            self.lru.lock().put(page.id(), ());
        }
        Ok(())
    }

    fn flush_page(&self, page: &Page) -> Result<()> {
        if page.is_dirty() {
            let buf = page.data();
            self.heap.write_page(page.id(), &buf)?;
            page.set_dirty(false);
        }
        Ok(())
    }

    fn flush_all_pages(&self) -> Result<()> {
        let slots = self.inner.lock().slots.clone();
        for page in &slots {
            self.flush_page(page)?;
        }
        if self.sync_on_flush_all {
            self.heap.sync()?;
        }
        Ok(())
    }

    fn size(&self) -> usize {
        self.inner.lock().slots.len()
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE_SIZE: usize = 256;

    fn create_test_cache(dir: &tempfile::TempDir, max_pages: usize) -> HeapPageCache {
        HeapPageCache::new(HeapCacheConfig {
            path: dir.path().join("cache.heap"),
            create: true,
            max_pages,
            page_size: PAGE_SIZE,
            sync_on_flush_all: false,
        })
        .unwrap()
    }

    #[test]
    fn test_new_page_pinned_and_mapped() {
        let dir = tempdir().unwrap();
        let cache = create_test_cache(&dir, 8);

        let page = cache.new_page().unwrap();
        assert_eq!(page.id(), PageId(1));
        assert!(page.is_pinned());
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_fetch_resident_page() {
        let dir = tempdir().unwrap();
        let cache = create_test_cache(&dir, 8);

        let page = cache.new_page().unwrap();
        let pid = page.id();
        cache.unpin_page(&page, false).unwrap();

        let fetched = cache.fetch_page(pid).unwrap().unwrap();
        assert!(Arc::ptr_eq(&page, &fetched));
        assert!(fetched.is_pinned());
    }

    #[test]
    fn test_fetch_nonexistent_page() {
        let dir = tempdir().unwrap();
        let cache = create_test_cache(&dir, 8);

        assert!(cache.fetch_page(PageId(99)).unwrap().is_none());
        // The reserved slot must not linger.
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_unpin_to_zero_makes_victim() {
        let dir = tempdir().unwrap();
        let cache = create_test_cache(&dir, 2);

        let a = cache.new_page().unwrap();
        let b = cache.new_page().unwrap();
        cache.unpin_page(&a, false).unwrap();
        cache.unpin_page(&b, false).unwrap();

        // Third allocation reuses the LRU tail, which is the first unpinned.
        let c = cache.new_page().unwrap();
        assert_eq!(cache.size(), 2);
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(a.id(), PageId(3));
        cache.unpin_page(&c, false).unwrap();
    }

    #[test]
    fn test_eviction_writes_dirty_victim() {
        let dir = tempdir().unwrap();
        let cache = create_test_cache(&dir, 1);

        let a = cache.new_page().unwrap();
        let a_id = a.id();
        a.data()[0] = 0xAB;
        cache.unpin_page(&a, true).unwrap();

        // Evicts the dirty page, which must be written back first.
        let b = cache.new_page().unwrap();
        cache.unpin_page(&b, false).unwrap();

        let again = cache.fetch_page(a_id).unwrap().unwrap();
        assert_eq!(again.data()[0], 0xAB);
        cache.unpin_page(&again, false).unwrap();
    }

    #[test]
    fn test_all_pinned_is_cache_full() {
        let dir = tempdir().unwrap();
        let cache = create_test_cache(&dir, 2);

        let _a = cache.new_page().unwrap();
        let _b = cache.new_page().unwrap();

        assert!(matches!(cache.new_page(), Err(LarchError::CacheFull)));
    }

    #[test]
    fn test_pin_underflow_surfaces() {
        let dir = tempdir().unwrap();
        let cache = create_test_cache(&dir, 2);

        let page = cache.new_page().unwrap();
        cache.unpin_page(&page, false).unwrap();
        assert!(matches!(
            cache.unpin_page(&page, false),
            Err(LarchError::PinUnderflow(_))
        ));
    }

    #[test]
    fn test_clean_unpin_keeps_dirty_bit() {
        let dir = tempdir().unwrap();
        let cache = create_test_cache(&dir, 2);

        let page = cache.new_page().unwrap();
        cache.pin_page(&page);
        cache.unpin_page(&page, true).unwrap();
        // A clean unpin must not erase another borrower's dirty mark.
        cache.unpin_page(&page, false).unwrap();
        assert!(page.is_dirty());
    }

    #[test]
    fn test_flush_page_clears_dirty() {
        let dir = tempdir().unwrap();
        let cache = create_test_cache(&dir, 2);

        let page = cache.new_page().unwrap();
        page.data()[0] = 0x42;
        cache.unpin_page(&page, true).unwrap();

        cache.flush_page(&page).unwrap();
        assert!(!page.is_dirty());
    }

    #[test]
    fn test_flush_all_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.heap");
        let pid;

        {
            let cache = HeapPageCache::new(HeapCacheConfig {
                path: path.clone(),
                create: true,
                max_pages: 8,
                page_size: PAGE_SIZE,
                sync_on_flush_all: true,
            })
            .unwrap();
            let page = cache.new_page().unwrap();
            pid = page.id();
            page.data()[7] = 0x77;
            cache.unpin_page(&page, true).unwrap();
            cache.flush_all_pages().unwrap();
        }

        let cache = HeapPageCache::new(HeapCacheConfig {
            path,
            create: false,
            max_pages: 8,
            page_size: PAGE_SIZE,
            sync_on_flush_all: true,
        })
        .unwrap();
        let page = cache.fetch_page(pid).unwrap().unwrap();
        assert_eq!(page.data()[7], 0x77);
        cache.unpin_page(&page, false).unwrap();
    }

    #[test]
    fn test_lru_order_is_reuse_order() {
        let dir = tempdir().unwrap();
        let cache = create_test_cache(&dir, 3);

        let pages: Vec<_> = (0..3).map(|_| cache.new_page().unwrap()).collect();
        let ids: Vec<_> = pages.iter().map(|p| p.id()).collect();
        for p in &pages {
            cache.unpin_page(p, false).unwrap();
        }

        // Touch the first page so it becomes most-recently used.
        let first = cache.fetch_page(ids[0]).unwrap().unwrap();
        cache.unpin_page(&first, false).unwrap();

        // The next allocation must reuse the second page's buffer, the LRU
        // tail, and leave the recently touched first page resident.
        let new = cache.new_page().unwrap();
        assert_eq!(new.id(), PageId(4));
        assert!(Arc::ptr_eq(&new, &pages[1]));
        assert_eq!(pages[0].id(), ids[0]);
        cache.unpin_page(&new, false).unwrap();
    }

    #[test]
    fn test_page_size_from_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sized.heap");

        {
            let _ = HeapPageCache::new(HeapCacheConfig {
                path: path.clone(),
                create: true,
                max_pages: 4,
                page_size: 512,
                sync_on_flush_all: false,
            })
            .unwrap();
        }

        // Reopen with a different configured size; the header wins.
        let cache = HeapPageCache::new(HeapCacheConfig {
            path,
            create: false,
            max_pages: 4,
            page_size: 4096,
            sync_on_flush_all: false,
        })
        .unwrap();
        assert_eq!(cache.page_size(), 512);
    }

    #[test]
    fn test_config_default() {
        let config = HeapCacheConfig::default();
        assert_eq!(config.max_pages, 4096);
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert!(config.create);
        assert!(config.sync_on_flush_all);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let original = HeapCacheConfig::default();
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: HeapCacheConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original.max_pages, deserialized.max_pages);
        assert_eq!(original.page_size, deserialized.page_size);
        assert_eq!(original.path, deserialized.path);
    }
}
