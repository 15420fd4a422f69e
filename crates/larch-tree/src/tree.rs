//! The B+tree: entry points, root installation, metadata, node I/O.

use crate::codec::{Codec, CopyCodec};
use crate::node::{Node, NodeBody, NodeIo, Probe, NODE_HEADER_LEN};
use crate::olc::OlcError;
use crate::scan::Scan;
use larch_cache::PageCache;
use larch_common::page::PageId;
use larch_common::{LarchError, Result};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Magic number on the metadata page.
const META_MAGIC: u32 = 0x00C0_FFEE;

/// A concurrent persistent B+tree index over a page cache.
///
/// Keys map to values, duplicates permitted. Readers traverse with optimistic
/// lock coupling and retry on conflict; writers split full nodes eagerly on
/// the way down. Every operation either completes or surfaces a non-restart
/// error; the restart signal itself never escapes.
pub struct BTree<K, V, KC = CopyCodec<K>, VC = CopyCodec<V>> {
    cache: Arc<dyn PageCache>,
    /// Fan-out N: at most N children per inner node, N - 1 entries per node.
    order: usize,
    key_codec: KC,
    value_codec: VC,
    /// Current root. A superseded root stays alive inside the new root's
    /// child cache, so a stale snapshot of this pointer remains safe to
    /// dereference.
    root: AtomicPtr<Node<K, V>>,
    _own: PhantomData<Box<Node<K, V>>>,
}

/// Structural counters from a full tree walk.
///
/// The walk takes no latches, so run it only while no writers are active;
/// it is meant for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    /// Levels from root to leaves, inclusive.
    pub depth: usize,
    /// Total key/value pairs in the leaves.
    pub entries: usize,
    /// Largest key count observed in any inner node.
    pub max_inner_keys: usize,
    /// Largest key count observed in any leaf.
    pub max_leaf_keys: usize,
}

impl<K, V> BTree<K, V>
where
    K: Ord + Copy + FromBytes + IntoBytes + Immutable,
    V: Copy + FromBytes + IntoBytes + Immutable,
{
    /// Opens a tree over `cache` with the default raw-copy codecs.
    pub fn open(cache: Arc<dyn PageCache>, order: usize) -> Result<Self> {
        Self::open_with(cache, order, CopyCodec::new(), CopyCodec::new())
    }
}

impl<K, V, KC, VC> BTree<K, V, KC, VC>
where
    K: Ord + Copy,
    V: Copy,
    KC: Codec<K>,
    VC: Codec<V>,
{
    /// Opens a tree over `cache` with explicit codecs.
    ///
    /// An existing tree is picked up from the metadata page; otherwise the
    /// metadata page and an empty root leaf are created and persisted.
    pub fn open_with(
        cache: Arc<dyn PageCache>,
        order: usize,
        key_codec: KC,
        value_codec: VC,
    ) -> Result<Self> {
        check_geometry(
            order,
            cache.page_size(),
            key_codec.width(),
            value_codec.width(),
        )?;

        let tree = Self {
            cache,
            order,
            key_codec,
            value_codec,
            root: AtomicPtr::new(ptr::null_mut()),
            _own: PhantomData,
        };

        match tree.read_metadata()? {
            Some(root_pid) => {
                let root = tree.load_node(ptr::null_mut(), root_pid)?;
                tree.root.store(Box::into_raw(root), Ordering::Release);
            }
            None => tree.init_empty()?,
        }
        Ok(tree)
    }

    /// Returns all values stored under `key`, in insertion-independent order.
    pub fn get(&self, key: &K) -> Result<Vec<V>> {
        let mut values = Vec::new();
        loop {
            values.clear();
            let root_ptr = self.root.load(Ordering::Acquire);
            // SAFETY: see the `root` field docs.
            let root = unsafe { &*root_ptr };

            let mut probe = Probe::Lookup {
                key,
                values: &mut values,
            };
            match root.search(self, &mut probe, 0) {
                Ok(()) => {
                    if self.root.load(Ordering::Acquire) != root_ptr {
                        continue;
                    }
                    return Ok(values);
                }
                Err(OlcError::Restart) => continue,
                Err(OlcError::Fatal(err)) => return Err(err),
            }
        }
    }

    /// Inserts a key/value pair. Duplicate keys accumulate.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        loop {
            let root_ptr = self.root.load(Ordering::Acquire);
            // SAFETY: see the `root` field docs.
            let root = unsafe { &*root_ptr };

            match root.insert(self, &key, &value, 0) {
                Ok(None) => return Ok(()),
                Ok(Some((split_key, sibling))) => {
                    // The root split and is still write-locked; grow the tree.
                    self.install_root(root_ptr, split_key, sibling)?;
                    continue;
                }
                Err(OlcError::Restart) => continue,
                Err(OlcError::Fatal(err)) => return Err(err),
            }
        }
    }

    /// Ordered scan over the whole tree.
    pub fn scan(&self) -> Scan<'_, K, V, KC, VC> {
        Scan::new(self, None)
    }

    /// Ordered scan over keys at or above `key`.
    pub fn scan_from(&self, key: &K) -> Scan<'_, K, V, KC, VC> {
        Scan::new(self, Some(*key))
    }

    /// Tree fan-out N.
    pub fn order(&self) -> usize {
        self.order
    }

    /// The page cache this tree runs on.
    pub fn cache(&self) -> &Arc<dyn PageCache> {
        &self.cache
    }

    /// Collects one leaf's worth of entries, routed by `from`, reporting the
    /// separator right of the descent path in `next_sep`. Restarts are
    /// absorbed here; the outputs hold a consistent image on return.
    pub(crate) fn collect_leaf(
        &self,
        from: Option<&K>,
        entries: &mut Vec<(K, V)>,
        next_sep: &mut Option<K>,
    ) -> Result<()> {
        loop {
            entries.clear();
            *next_sep = None;
            let root_ptr = self.root.load(Ordering::Acquire);
            // SAFETY: see the `root` field docs.
            let root = unsafe { &*root_ptr };

            let mut probe = Probe::Collect {
                from,
                entries: &mut *entries,
                next_sep: &mut *next_sep,
            };
            match root.search(self, &mut probe, 0) {
                Ok(()) => {
                    if self.root.load(Ordering::Acquire) != root_ptr {
                        continue;
                    }
                    return Ok(());
                }
                Err(OlcError::Restart) => continue,
                Err(OlcError::Fatal(err)) => return Err(err),
            }
        }
    }

    /// Grows the tree by one level above a split root.
    ///
    /// Ordering: both split halves are already persisted; the new root is
    /// persisted, then the metadata, then the root pointer swings, and only
    /// then is the old root unlocked. Persistence failures surface after the
    /// in-memory installation so the tree never holds a dangling root.
    fn install_root(
        &self,
        old_root_ptr: *mut Node<K, V>,
        split_key: K,
        sibling: Box<Node<K, V>>,
    ) -> Result<()> {
        let new_root = match NodeIo::create_node(self, ptr::null_mut(), false) {
            Ok(node) => node,
            Err(err) => {
                // SAFETY: the old root is still ours and still locked.
                unsafe { &*old_root_ptr }.latch().write_unlock();
                return Err(err);
            }
        };

        let new_root_raw = &*new_root as *const Node<K, V> as *mut Node<K, V>;
        // SAFETY: ownership of the old root moves into the new root's child
        // cache below; the raw pointer stays valid for concurrent readers
        // holding the old snapshot.
        let old_box = unsafe { Box::from_raw(old_root_ptr) };
        old_box.set_parent(new_root_raw);
        sibling.set_parent(new_root_raw);

        let old_pid = old_box.pid();
        let sibling_pid = sibling.pid();
        if let NodeBody::Inner(body) = new_root.body_mut() {
            body.keys.push(split_key);
            body.child_pages.push(old_pid);
            body.child_pages.push(sibling_pid);
            body.children.push(Some(old_box));
            body.children.push(Some(sibling));
        }

        let persisted = self
            .store_node(&new_root)
            .and_then(|_| self.write_metadata(new_root.pid()));

        tracing::debug!(root = %new_root.pid(), left = %old_pid, right = %sibling_pid, "installed new root");
        self.root.store(Box::into_raw(new_root), Ordering::Release);
        // SAFETY: the allocation lives on inside the new root's child cache.
        unsafe { &*old_root_ptr }.latch().write_unlock();
        persisted
    }

    fn init_empty(&self) -> Result<()> {
        let meta = self.cache.new_page()?;
        let meta_pid = meta.id();
        self.cache.unpin_page(&meta, false)?;
        if meta_pid != PageId::META {
            return Err(LarchError::TreeCorrupted(format!(
                "metadata page allocated at {meta_pid}"
            )));
        }

        let root = NodeIo::create_node(self, ptr::null_mut(), true)?;
        debug_assert!(root.is_leaf());
        self.store_node(&root)?;
        let root_pid = root.pid();
        self.root.store(Box::into_raw(root), Ordering::Release);
        self.write_metadata(root_pid)?;
        tracing::debug!(root = %root_pid, "initialized empty tree");
        Ok(())
    }

    /// Reads the root pid from the metadata page, or `None` when the page
    /// does not exist yet (fresh store).
    fn read_metadata(&self) -> Result<Option<PageId>> {
        let Some(page) = self.cache.fetch_page(PageId::META)? else {
            return Ok(None);
        };

        let parsed = {
            let buf = page.data();
            let magic = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
            if magic != META_MAGIC {
                Err(LarchError::BadMagic {
                    what: "metadata page",
                    expected: META_MAGIC,
                    found: magic,
                })
            } else {
                Ok(PageId(u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]])))
            }
        };
        self.cache.unpin_page(&page, false)?;
        parsed.map(Some)
    }

    fn write_metadata(&self, root_pid: PageId) -> Result<()> {
        let Some(page) = self.cache.fetch_page(PageId::META)? else {
            return Err(LarchError::PageNotFound(PageId::META));
        };
        {
            let mut buf = page.data();
            buf[0..4].copy_from_slice(&META_MAGIC.to_ne_bytes());
            buf[4..8].copy_from_slice(&root_pid.0.to_ne_bytes());
        }
        self.cache.unpin_page(&page, true)?;
        Ok(())
    }

    /// Walks the whole tree and returns structural counters. Quiesced use
    /// only; see [`TreeStats`].
    pub fn stats(&self) -> Result<TreeStats> {
        // SAFETY: see the `root` field docs.
        let root = unsafe { &*self.root.load(Ordering::Acquire) };
        let mut stats = TreeStats {
            depth: 0,
            entries: 0,
            max_inner_keys: 0,
            max_leaf_keys: 0,
        };
        self.walk(root, 1, &mut stats)?;
        Ok(stats)
    }

    /// Depth of the tree (1 = the root is a leaf). Quiesced use only.
    pub fn depth(&self) -> Result<usize> {
        Ok(self.stats()?.depth)
    }

    fn walk(&self, node: &Node<K, V>, depth: usize, stats: &mut TreeStats) -> Result<()> {
        stats.depth = stats.depth.max(depth);
        match node.body() {
            NodeBody::Inner(body) => {
                if body.child_pages.len() != body.keys.len() + 1 {
                    return Err(LarchError::TreeCorrupted(format!(
                        "inner node {} has {} keys but {} child pages",
                        node.pid(),
                        body.keys.len(),
                        body.child_pages.len()
                    )));
                }
                if body.keys.len() > self.order - 1 {
                    return Err(LarchError::TreeCorrupted(format!(
                        "inner node {} exceeds fan-out",
                        node.pid()
                    )));
                }
                stats.max_inner_keys = stats.max_inner_keys.max(body.keys.len());

                for (i, &pid) in body.child_pages.iter().enumerate() {
                    if !pid.is_valid() {
                        return Err(LarchError::TreeCorrupted(format!(
                            "inner node {} has an invalid child link",
                            node.pid()
                        )));
                    }
                    match body.children.get(i).and_then(|slot| slot.as_deref()) {
                        Some(child) => self.walk(child, depth + 1, stats)?,
                        None => {
                            let raw = node as *const Node<K, V> as *mut Node<K, V>;
                            let child = self.load_node(raw, pid)?;
                            self.walk(&child, depth + 1, stats)?;
                        }
                    }
                }
            }
            NodeBody::Leaf(body) => {
                if body.keys.len() != body.values.len() {
                    return Err(LarchError::TreeCorrupted(format!(
                        "leaf {} has {} keys but {} values",
                        node.pid(),
                        body.keys.len(),
                        body.values.len()
                    )));
                }
                if body.keys.windows(2).any(|pair| pair[0] > pair[1]) {
                    return Err(LarchError::TreeCorrupted(format!(
                        "leaf {} keys out of order",
                        node.pid()
                    )));
                }
                stats.max_leaf_keys = stats.max_leaf_keys.max(body.keys.len());
                stats.entries += body.keys.len();
            }
        }
        Ok(())
    }
}

impl<K, V, KC, VC> NodeIo<K, V> for BTree<K, V, KC, VC>
where
    K: Ord + Copy,
    V: Copy,
    KC: Codec<K>,
    VC: Codec<V>,
{
    fn load_node(&self, parent: *mut Node<K, V>, pid: PageId) -> Result<Box<Node<K, V>>> {
        let Some(page) = self.cache.fetch_page(pid)? else {
            return Err(LarchError::PageNotFound(pid));
        };
        let node = {
            let buf = page.data();
            Node::decode(
                &buf,
                pid,
                parent,
                self.order,
                &self.key_codec,
                &self.value_codec,
            )
        };
        self.cache.unpin_page(&page, false)?;
        node
    }

    fn store_node(&self, node: &Node<K, V>) -> Result<()> {
        let Some(page) = self.cache.fetch_page(node.pid())? else {
            return Err(LarchError::PageNotFound(node.pid()));
        };
        {
            let mut buf = page.data();
            node.encode(self.order, &self.key_codec, &self.value_codec, &mut buf);
        }
        self.cache.unpin_page(&page, true)?;
        Ok(())
    }

    fn create_node(&self, parent: *mut Node<K, V>, leaf: bool) -> Result<Box<Node<K, V>>> {
        let page = self.cache.new_page()?;
        let pid = page.id();
        self.cache.unpin_page(&page, false)?;

        Ok(if leaf {
            Node::new_leaf(pid, parent, self.order)
        } else {
            Node::new_inner(pid, parent, self.order)
        })
    }

    fn order(&self) -> usize {
        self.order
    }
}

impl<K, V, KC, VC> Drop for BTree<K, V, KC, VC> {
    fn drop(&mut self) {
        let root = self.root.swap(ptr::null_mut(), Ordering::AcqRel);
        if !root.is_null() {
            // SAFETY: drop has exclusive access; the child caches own the
            // rest of the graph and free it recursively.
            drop(unsafe { Box::from_raw(root) });
        }
    }
}

/// Checks that `order - 1` keys plus the per-kind payload fit one page.
fn check_geometry(
    order: usize,
    page_size: usize,
    key_width: usize,
    value_width: usize,
) -> Result<()> {
    if order < 3 {
        return Err(LarchError::InvalidConfig(format!(
            "fan-out {order} too small, need at least 3"
        )));
    }
    let inner_bytes = NODE_HEADER_LEN + (order - 1) * key_width + order * 4;
    let leaf_bytes = NODE_HEADER_LEN + (order - 1) * (key_width + value_width);
    if inner_bytes > page_size || leaf_bytes > page_size {
        return Err(LarchError::InvalidConfig(format!(
            "fan-out {order} with {key_width}-byte keys and {value_width}-byte values \
             does not fit a {page_size}-byte page"
        )));
    }
    Ok(())
}
