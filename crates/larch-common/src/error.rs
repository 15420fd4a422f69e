//! Error types for larch.

use crate::page::PageId;
use thiserror::Error;

/// Result type alias using LarchError.
pub type Result<T> = std::result::Result<T, LarchError>;

/// Errors that can occur in larch operations.
#[derive(Debug, Error)]
pub enum LarchError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Format errors
    #[error("bad magic in {what}: expected {expected:#010x}, found {found:#010x}")]
    BadMagic {
        what: &'static str,
        expected: u32,
        found: u32,
    },

    #[error("page size mismatch: expected {expected}, got {actual}")]
    PageSizeMismatch { expected: usize, actual: usize },

    // Page addressing errors
    #[error("invalid page id: {0}")]
    InvalidPageId(PageId),

    #[error("page {pid} out of bounds: file has {pages} pages")]
    PageOutOfBounds { pid: PageId, pages: u32 },

    #[error("page not found: {0}")]
    PageNotFound(PageId),

    // Cache errors
    #[error("page cache full, all pages pinned")]
    CacheFull,

    #[error("unpin of page {0} with pin count 0")]
    PinUnderflow(PageId),

    // Tree errors
    #[error("invalid node tag: {0}")]
    InvalidNodeTag(u32),

    #[error("tree corrupted: {0}")]
    TreeCorrupted(String),

    #[error("invalid tree configuration: {0}")]
    InvalidConfig(String),
}
