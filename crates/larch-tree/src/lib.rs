//! A concurrent persistent B+tree index.
//!
//! Keys map to values (duplicates permitted) over any [`larch_cache::PageCache`].
//! Point lookups, ordered scans, and inserts run under multi-threaded
//! workloads using optimistic lock coupling: nodes carry a versioned latch
//! word instead of read locks, and any traversal that observes a conflict
//! retries from the root.
//!
//! ```no_run
//! use larch_cache::MemPageCache;
//! use larch_tree::BTree;
//! use std::sync::Arc;
//!
//! let cache = Arc::new(MemPageCache::new(4096));
//! let tree: BTree<u64, u64> = BTree::open(cache, 64)?;
//!
//! tree.insert(7, 700)?;
//! assert_eq!(tree.get(&7)?, vec![700]);
//! # Ok::<(), larch_common::LarchError>(())
//! ```

mod codec;
mod node;
mod olc;
mod scan;
mod tree;

pub use codec::{Codec, CopyCodec};
pub use scan::Scan;
pub use tree::{BTree, TreeStats};
