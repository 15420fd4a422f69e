//! Pinned page buffers.

use larch_common::page::PageId;
use larch_common::{LarchError, Result};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// A fixed-size byte buffer resident in a page cache.
///
/// A page carries its current id (rewritten when an evicted buffer is reused
/// for a new residency), a dirty flag, a pin count, and a buffer mutex. The
/// buffer mutex guards byte-level access only; cache bookkeeping never holds
/// it across its own operations.
pub struct Page {
    id: AtomicU32,
    data: Mutex<Box<[u8]>>,
    dirty: AtomicBool,
    pins: AtomicU32,
}

impl Page {
    /// Creates a zeroed page buffer for the given id.
    pub fn new(id: PageId, size: usize) -> Self {
        Self {
            id: AtomicU32::new(id.0),
            data: Mutex::new(vec![0u8; size].into_boxed_slice()),
            dirty: AtomicBool::new(false),
            pins: AtomicU32::new(0),
        }
    }

    /// Returns the page id of the current residency.
    #[inline]
    pub fn id(&self) -> PageId {
        PageId(self.id.load(Ordering::Acquire))
    }

    /// Reassigns the buffer to a new residency.
    #[inline]
    pub(crate) fn set_id(&self, id: PageId) {
        self.id.store(id.0, Ordering::Release);
    }

    /// Locks and returns the page bytes.
    #[inline]
    pub fn data(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock()
    }

    /// Returns the buffer size in bytes.
    pub fn size(&self) -> usize {
        self.data.lock().len()
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }

    /// Increments the pin count, returning the previous count.
    #[inline]
    pub fn pin(&self) -> u32 {
        self.pins.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements the pin count, returning the new count. Fails when the page
    /// was not pinned.
    #[inline]
    pub fn unpin(&self) -> Result<u32> {
        match self
            .pins
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| p.checked_sub(1))
        {
            Ok(prev) => Ok(prev - 1),
            Err(_) => Err(LarchError::PinUnderflow(self.id())),
        }
    }

    /// Returns true if any borrower holds a pin.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    /// Returns true if the buffer was modified since it was loaded.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Sets or clears the dirty flag.
    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id())
            .field("pin_count", &self.pin_count())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_new() {
        let page = Page::new(PageId(3), 256);

        assert_eq!(page.id(), PageId(3));
        assert_eq!(page.size(), 256);
        assert_eq!(page.pin_count(), 0);
        assert!(!page.is_pinned());
        assert!(!page.is_dirty());
        assert!(page.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_page_pin_unpin() {
        let page = Page::new(PageId(1), 64);

        assert_eq!(page.pin(), 0);
        assert_eq!(page.pin(), 1);
        assert_eq!(page.pin_count(), 2);

        assert_eq!(page.unpin().unwrap(), 1);
        assert_eq!(page.unpin().unwrap(), 0);
        assert!(!page.is_pinned());
    }

    #[test]
    fn test_page_unpin_underflow() {
        let page = Page::new(PageId(1), 64);
        assert!(matches!(page.unpin(), Err(LarchError::PinUnderflow(_))));
        assert_eq!(page.pin_count(), 0);
    }

    #[test]
    fn test_page_dirty_flag() {
        let page = Page::new(PageId(1), 64);

        page.set_dirty(true);
        assert!(page.is_dirty());
        page.set_dirty(false);
        assert!(!page.is_dirty());
    }

    #[test]
    fn test_page_id_reassignment() {
        let page = Page::new(PageId(1), 64);
        page.set_id(PageId(9));
        assert_eq!(page.id(), PageId(9));
    }

    #[test]
    fn test_page_data_access() {
        let page = Page::new(PageId(1), 64);

        {
            let mut data = page.data();
            data[0] = 0xAB;
            data[63] = 0xCD;
        }
        let data = page.data();
        assert_eq!(data[0], 0xAB);
        assert_eq!(data[63], 0xCD);
    }

    #[test]
    fn test_page_debug() {
        let page = Page::new(PageId(5), 64);
        page.pin();
        let repr = format!("{:?}", page);
        assert!(repr.contains("Page"));
        assert!(repr.contains("pin_count"));
    }
}
