//! Page identifiers and sizing constants.

use serde::{Deserialize, Serialize};

/// Default page size in bytes (4 KB).
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Identifier of a page slot in a heap store.
///
/// Ids are assigned monotonically by the heap file. `0` is reserved and never
/// refers to a page; the heap file header lives at slot 0 and is addressed
/// directly, not through a `PageId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// Reserved invalid id.
    pub const INVALID: PageId = PageId(0);

    /// The tree metadata page.
    pub const META: PageId = PageId(1);

    /// Returns true if this id can refer to a page.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Byte offset of this page in a file with the given page size.
    pub fn offset(&self, page_size: usize) -> u64 {
        self.0 as u64 * page_size as u64
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
