//! Inner and leaf tree nodes.
//!
//! A node is a shared header (page id, version latch, parent back-pointer)
//! over a tagged body. Bodies are read optimistically: a reader snapshots the
//! latch, reads, and validates the snapshot before trusting anything it saw.
//! Writers mutate only under the write lock. Two invariants make the raw
//! reads sound in practice:
//!
//! - Body vectors are built with their full capacity reserved, so in-place
//!   edits never move a buffer out from under a racing reader.
//! - A node is destroyed only through its owning child-cache slot (or the
//!   tree's root handle), so a child pointer captured under a version
//!   snapshot stays dereferenceable; the validation step rejects everything
//!   read through a stale snapshot.

use crate::codec::Codec;
use crate::olc::{OlcError, OlcResult, VersionLatch};
use bytes::{Buf, BufMut};
use larch_common::page::PageId;
use larch_common::{LarchError, Result as LarchResult};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicPtr, Ordering};

/// On-page tag for inner nodes.
pub(crate) const INNER_TAG: u32 = 1;
/// On-page tag for leaf nodes.
pub(crate) const LEAF_TAG: u32 = 2;
/// On-page header: tag (4) | entry count (4).
pub(crate) const NODE_HEADER_LEN: usize = 8;

/// How a node reaches its backing pages. Implemented by the tree, which owns
/// the page cache and the codecs.
pub(crate) trait NodeIo<K, V> {
    /// Reads and decodes the node stored at `pid`, with `parent` as its
    /// in-memory back-pointer.
    fn load_node(&self, parent: *mut Node<K, V>, pid: PageId) -> LarchResult<Box<Node<K, V>>>;

    /// Serializes `node` onto its page and marks the page dirty.
    fn store_node(&self, node: &Node<K, V>) -> LarchResult<()>;

    /// Allocates a fresh page and builds an empty node of the given kind on
    /// it.
    fn create_node(&self, parent: *mut Node<K, V>, leaf: bool) -> LarchResult<Box<Node<K, V>>>;

    /// Tree fan-out N; a node is full at `N - 1` entries.
    fn order(&self) -> usize;
}

/// Body of an inner (routing) node.
pub(crate) struct InnerBody<K, V> {
    /// Separator keys. The subtree at slot `i` holds keys `<= keys[i]`, the
    /// subtree at `i + 1` holds keys `> keys[i]`.
    pub keys: Vec<K>,
    /// Persistent child links, always one more than there are keys.
    pub child_pages: Vec<PageId>,
    /// Owning slots for materialized children, aligned with `child_pages`.
    /// Never persisted; empty after decode.
    pub children: Vec<Option<Box<Node<K, V>>>>,
}

/// Body of a leaf node.
pub(crate) struct LeafBody<K, V> {
    pub keys: Vec<K>,
    pub values: Vec<V>,
}

pub(crate) enum NodeBody<K, V> {
    Inner(InnerBody<K, V>),
    Leaf(LeafBody<K, V>),
}

/// A tree node: header plus tagged body.
pub(crate) struct Node<K, V> {
    pid: PageId,
    latch: VersionLatch,
    /// Non-owning back-pointer to the inner node whose child cache owns this
    /// node; null for the root.
    parent: AtomicPtr<Node<K, V>>,
    body: UnsafeCell<NodeBody<K, V>>,
}

// Synchronization of the body is the version latch: writes happen under the
// write lock, optimistic reads are discarded unless the version validates.
unsafe impl<K: Send, V: Send> Send for Node<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Node<K, V> {}

/// What a descent is looking for.
pub(crate) enum Probe<'a, K, V> {
    /// Copy the values stored under exactly this key.
    Lookup {
        key: &'a K,
        values: &'a mut Vec<V>,
    },
    /// Copy an entire leaf; `from` routes the descent (`None` = leftmost
    /// leaf). `next_sep` reports the tightest separator to the right of the
    /// descent path — the smallest key that can live past the reached leaf —
    /// or stays `None` on the rightmost path. Scans resume there.
    Collect {
        from: Option<&'a K>,
        entries: &'a mut Vec<(K, V)>,
        next_sep: &'a mut Option<K>,
    },
}

impl<K, V> Probe<'_, K, V> {
    fn route_key(&self) -> Option<&K> {
        match self {
            Probe::Lookup { key, .. } => Some(*key),
            Probe::Collect { from, .. } => *from,
        }
    }
}

/// Index of the first key greater than `key`.
pub(crate) fn upper_bound<K: Ord>(keys: &[K], key: &K) -> usize {
    keys.partition_point(|k| k <= key)
}

/// Index of the first key not less than `key`.
pub(crate) fn lower_bound<K: Ord>(keys: &[K], key: &K) -> usize {
    keys.partition_point(|k| k < key)
}

impl<K, V> Node<K, V> {
    fn from_body(pid: PageId, parent: *mut Node<K, V>, body: NodeBody<K, V>) -> Box<Self> {
        Box::new(Self {
            pid,
            latch: VersionLatch::new(),
            parent: AtomicPtr::new(parent),
            body: UnsafeCell::new(body),
        })
    }

    /// Builds an empty leaf. Capacities are reserved up front so later edits
    /// shift in place.
    pub fn new_leaf(pid: PageId, parent: *mut Node<K, V>, order: usize) -> Box<Self> {
        Self::from_body(
            pid,
            parent,
            NodeBody::Leaf(LeafBody {
                keys: Vec::with_capacity(order),
                values: Vec::with_capacity(order),
            }),
        )
    }

    /// Builds an empty inner node.
    pub fn new_inner(pid: PageId, parent: *mut Node<K, V>, order: usize) -> Box<Self> {
        Self::from_body(
            pid,
            parent,
            NodeBody::Inner(InnerBody {
                keys: Vec::with_capacity(order),
                child_pages: Vec::with_capacity(order + 1),
                children: Vec::with_capacity(order + 1),
            }),
        )
    }

    pub fn pid(&self) -> PageId {
        self.pid
    }

    pub fn latch(&self) -> &VersionLatch {
        &self.latch
    }

    pub fn parent_ptr(&self) -> *mut Node<K, V> {
        self.parent.load(Ordering::Acquire)
    }

    pub fn set_parent(&self, parent: *mut Node<K, V>) {
        self.parent.store(parent, Ordering::Release);
    }

    fn parent_ref(&self) -> Option<&Node<K, V>> {
        // SAFETY: a non-null parent is the inner node whose child-cache slot
        // owns this node; the owner outlives the owned.
        unsafe { self.parent_ptr().as_ref() }
    }

    /// Shared view of the body. Unreliable until the caller's version
    /// snapshot validates.
    pub(crate) fn body(&self) -> &NodeBody<K, V> {
        // SAFETY: see the module docs; raced reads are rejected by version
        // validation before anything acts on them.
        unsafe { &*self.body.get() }
    }

    /// Exclusive view of the body. Caller holds the write lock or otherwise
    /// has exclusive access to the node.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn body_mut(&self) -> &mut NodeBody<K, V> {
        // SAFETY: the write lock serializes all writers; readers validate.
        unsafe { &mut *self.body.get() }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.body(), NodeBody::Leaf(_))
    }

    /// Current entry count (keys in either variant).
    pub fn len(&self) -> usize {
        match self.body() {
            NodeBody::Inner(body) => body.keys.len(),
            NodeBody::Leaf(body) => body.keys.len(),
        }
    }
}

impl<K, V> Node<K, V>
where
    K: Ord + Copy,
    V: Copy,
{
    /// Descends toward the probe's key, copying results out of the reached
    /// leaf.
    pub fn search(
        &self,
        io: &dyn NodeIo<K, V>,
        probe: &mut Probe<'_, K, V>,
        parent_version: u64,
    ) -> OlcResult<()> {
        let version = self.latch.read_lock()?;
        if let Some(parent) = self.parent_ref() {
            parent.latch.validate(parent_version)?;
        }

        match self.body() {
            NodeBody::Inner(body) => {
                let keys = body.keys.as_slice();
                let child_idx = match probe.route_key() {
                    Some(key) => upper_bound(keys, key),
                    None => 0,
                };
                if let Probe::Collect { next_sep, .. } = probe {
                    // Deeper levels overwrite; on the rightmost child the
                    // ancestor's separator stands.
                    if let Some(&sep) = keys.get(child_idx) {
                        **next_sep = Some(sep);
                    }
                }

                let mut v = version;
                let Some(child) = self.get_child(io, child_idx, false, &mut v)? else {
                    return Ok(());
                };
                self.latch.validate(version)?;
                child.search(io, probe, version)
            }
            NodeBody::Leaf(body) => {
                // Snapshot the slices once; lengths may be torn mid-write,
                // so clamp to the shorter and let validation sort it out.
                let keys = body.keys.as_slice();
                let values = body.values.as_slice();
                let n = keys.len().min(values.len());
                let (keys, values) = (&keys[..n], &values[..n]);

                match probe {
                    Probe::Lookup { key, values: out } => {
                        let lo = lower_bound(keys, *key);
                        let hi = lo + upper_bound(&keys[lo..], *key);
                        out.extend_from_slice(&values[lo..hi]);
                    }
                    Probe::Collect { entries, .. } => {
                        entries.extend(keys.iter().copied().zip(values.iter().copied()));
                    }
                }
                self.latch.validate(version)?;
                Ok(())
            }
        }
    }

    /// Inserts below this node. A `Some` return carries the split key and the
    /// new right sibling the caller must link; the caller's own latch is then
    /// already write-locked (the split arranged it), and this node stays
    /// locked if it is the root.
    pub fn insert(
        &self,
        io: &dyn NodeIo<K, V>,
        key: &K,
        value: &V,
        parent_version: u64,
    ) -> OlcResult<Option<(K, Box<Node<K, V>>)>> {
        let version = self.latch.read_lock()?;
        match self.body() {
            NodeBody::Inner(_) => self.insert_inner(io, key, value, version, parent_version),
            NodeBody::Leaf(_) => self.insert_leaf(io, key, value, version, parent_version),
        }
    }

    fn insert_inner(
        &self,
        io: &dyn NodeIo<K, V>,
        key: &K,
        value: &V,
        version: u64,
        parent_version: u64,
    ) -> OlcResult<Option<(K, Box<Node<K, V>>)>> {
        let order = io.order();
        if self.len() == order - 1 {
            // Full: split eagerly before descending any deeper.
            return self.split_inner(io, version, parent_version, order);
        }

        if let Some(parent) = self.parent_ref() {
            parent.latch.validate(parent_version)?;
        }

        let child_idx = match self.body() {
            NodeBody::Inner(body) => upper_bound(body.keys.as_slice(), key),
            NodeBody::Leaf(_) => return Err(OlcError::Restart),
        };
        self.latch.validate(version)?;

        let mut v = version;
        let Some(child) = self.get_child(io, child_idx, false, &mut v)? else {
            return Err(OlcError::Fatal(LarchError::TreeCorrupted(format!(
                "inner node {} has no child at slot {child_idx}",
                self.pid
            ))));
        };
        let Some((split_key, new_child)) = child.insert(io, key, value, version)? else {
            return Ok(None);
        };

        // The child's split upgraded this node's latch; link the new sibling.
        let new_pid = new_child.pid();
        match self.body_mut() {
            NodeBody::Inner(body) => {
                body.keys.insert(child_idx, split_key);
                body.child_pages.insert(child_idx + 1, new_pid);
                body.children.insert(child_idx + 1, Some(new_child));
            }
            NodeBody::Leaf(_) => {
                self.latch.write_unlock();
                return Err(OlcError::Fatal(LarchError::TreeCorrupted(
                    "leaf reached as routing parent".into(),
                )));
            }
        }
        if let Err(err) = io.store_node(self) {
            self.latch.write_unlock();
            return Err(OlcError::Fatal(err));
        }
        self.latch.write_unlock();

        // The retry descends the re-linked tree instead of continuing here.
        Err(OlcError::Restart)
    }

    fn split_inner(
        &self,
        io: &dyn NodeIo<K, V>,
        version: u64,
        parent_version: u64,
        order: usize,
    ) -> OlcResult<Option<(K, Box<Node<K, V>>)>> {
        let parent = self.parent_ref();
        if let Some(parent) = parent {
            parent.latch.upgrade(parent_version)?;
        }
        if let Err(restart) = self.latch.upgrade(version) {
            if let Some(parent) = parent {
                parent.latch.write_unlock();
            }
            return Err(restart.into());
        }

        let unlock_all = |this: &Self| {
            this.latch.write_unlock();
            if let Some(parent) = parent {
                parent.latch.write_unlock();
            }
        };

        let sibling = match io.create_node(self.parent_ptr(), false) {
            Ok(node) => node,
            Err(err) => {
                unlock_all(self);
                return Err(OlcError::Fatal(err));
            }
        };

        let mid = order / 2;
        let split_key;
        match (self.body_mut(), sibling.body_mut()) {
            (NodeBody::Inner(left), NodeBody::Inner(right)) => {
                right.keys.extend_from_slice(&left.keys[mid + 1..]);
                right.child_pages.extend_from_slice(&left.child_pages[mid + 1..]);
                right.children.extend(left.children.drain(mid + 1..));

                split_key = left.keys[mid];
                left.keys.truncate(mid);
                left.child_pages.truncate(mid + 1);
            }
            _ => {
                unlock_all(self);
                return Err(OlcError::Fatal(LarchError::TreeCorrupted(
                    "inner split over mismatched node kinds".into(),
                )));
            }
        }

        // The moved children now answer to the sibling.
        let sibling_raw = &*sibling as *const Node<K, V> as *mut Node<K, V>;
        if let NodeBody::Inner(right) = sibling.body() {
            for child in right.children.iter().flatten() {
                child.set_parent(sibling_raw);
            }
        }

        if let Err(err) = io.store_node(self).and_then(|_| io.store_node(&sibling)) {
            unlock_all(self);
            return Err(OlcError::Fatal(err));
        }

        // A root split keeps this node locked until the tree has installed
        // the new root above it. The parent's lock is held either way until
        // the sibling has been linked in.
        if parent.is_some() {
            self.latch.write_unlock();
        }
        Ok(Some((split_key, sibling)))
    }

    fn insert_leaf(
        &self,
        io: &dyn NodeIo<K, V>,
        key: &K,
        value: &V,
        version: u64,
        parent_version: u64,
    ) -> OlcResult<Option<(K, Box<Node<K, V>>)>> {
        let order = io.order();
        if self.len() == order - 1 {
            return self.split_leaf(io, version, parent_version, order);
        }

        // No split needed, lock only this node.
        self.latch.upgrade(version)?;
        if let Some(parent) = self.parent_ref() {
            if parent.latch.validate(parent_version).is_err() {
                self.latch.write_unlock();
                return Err(OlcError::Restart);
            }
        }

        match self.body_mut() {
            NodeBody::Leaf(body) => {
                let pos = upper_bound(body.keys.as_slice(), key);
                body.keys.insert(pos, *key);
                body.values.insert(pos, *value);
            }
            NodeBody::Inner(_) => {
                self.latch.write_unlock();
                return Err(OlcError::Fatal(LarchError::TreeCorrupted(
                    "routing node reached as leaf".into(),
                )));
            }
        }
        if let Err(err) = io.store_node(self) {
            self.latch.write_unlock();
            return Err(OlcError::Fatal(err));
        }
        self.latch.write_unlock();
        Ok(None)
    }

    fn split_leaf(
        &self,
        io: &dyn NodeIo<K, V>,
        version: u64,
        parent_version: u64,
        order: usize,
    ) -> OlcResult<Option<(K, Box<Node<K, V>>)>> {
        let parent = self.parent_ref();
        if let Some(parent) = parent {
            parent.latch.upgrade(parent_version)?;
        }
        if let Err(restart) = self.latch.upgrade(version) {
            if let Some(parent) = parent {
                parent.latch.write_unlock();
            }
            return Err(restart.into());
        }

        let unlock_all = |this: &Self| {
            this.latch.write_unlock();
            if let Some(parent) = parent {
                parent.latch.write_unlock();
            }
        };

        let sibling = match io.create_node(self.parent_ptr(), true) {
            Ok(node) => node,
            Err(err) => {
                unlock_all(self);
                return Err(OlcError::Fatal(err));
            }
        };

        let mid = order / 2;
        let split_key;
        match (self.body_mut(), sibling.body_mut()) {
            (NodeBody::Leaf(left), NodeBody::Leaf(right)) => {
                right.keys.extend_from_slice(&left.keys[mid..]);
                right.values.extend_from_slice(&left.values[mid..]);

                split_key = left.keys[mid];
                left.keys.truncate(mid);
                left.values.truncate(mid);
            }
            _ => {
                unlock_all(self);
                return Err(OlcError::Fatal(LarchError::TreeCorrupted(
                    "leaf split over mismatched node kinds".into(),
                )));
            }
        }

        if let Err(err) = io.store_node(self).and_then(|_| io.store_node(&sibling)) {
            unlock_all(self);
            return Err(OlcError::Fatal(err));
        }

        if parent.is_some() {
            self.latch.write_unlock();
        }
        Ok(Some((split_key, sibling)))
    }

    /// Returns the child at `idx`, materializing it from the page cache when
    /// only the persistent link exists. Materializing is a structural write:
    /// it happens under the write lock and then restarts the operation, so
    /// readers that captured the pre-materialization version re-descend.
    fn get_child(
        &self,
        io: &dyn NodeIo<K, V>,
        idx: usize,
        write_locked: bool,
        version: &mut u64,
    ) -> OlcResult<Option<&Node<K, V>>> {
        let NodeBody::Inner(body) = self.body() else {
            return Ok(None);
        };

        if let Some(Some(child)) = body.children.get(idx) {
            // SAFETY: decoupled from the body borrow. The child is destroyed
            // only through its owning slot, and callers never act on it past
            // a failed validation.
            let child = unsafe { &*(&**child as *const Node<K, V>) };
            return Ok(Some(child));
        }

        let child_pid = match body.child_pages.get(idx) {
            Some(&pid) => pid,
            // Torn index from a racing writer; re-descend.
            None => return Err(OlcError::Restart),
        };
        if !child_pid.is_valid() {
            return Ok(None);
        }

        if !write_locked {
            *version = self.latch.upgrade(*version)?;
        }

        match self.body_mut() {
            NodeBody::Inner(body) => match body.children.get_mut(idx) {
                Some(slot) => {
                    if slot.is_none() {
                        let raw_self = self as *const Self as *mut Self;
                        match io.load_node(raw_self, child_pid) {
                            Ok(node) => *slot = Some(node),
                            Err(err) => {
                                self.latch.write_unlock();
                                return Err(OlcError::Fatal(err));
                            }
                        }
                    }
                }
                None => {
                    self.latch.write_unlock();
                    return Err(OlcError::Restart);
                }
            },
            NodeBody::Leaf(_) => {}
        }
        self.latch.write_unlock();

        // Readers holding the pre-materialization version must re-descend.
        Err(OlcError::Restart)
    }

    /// Serializes the body onto a page image. Caller holds the write lock or
    /// otherwise has exclusive access.
    pub(crate) fn encode(
        &self,
        order: usize,
        key_codec: &dyn Codec<K>,
        value_codec: &dyn Codec<V>,
        buf: &mut [u8],
    ) {
        buf.fill(0);
        let kw = key_codec.width();

        match self.body() {
            NodeBody::Inner(body) => {
                {
                    let mut cur = &mut buf[..];
                    cur.put_u32_ne(INNER_TAG);
                    cur.put_u32_ne(body.keys.len() as u32);
                }
                for (i, key) in body.keys.iter().enumerate() {
                    let off = NODE_HEADER_LEN + i * kw;
                    key_codec.encode(key, &mut buf[off..off + kw]);
                }
                let pages_base = NODE_HEADER_LEN + (order - 1) * kw;
                for (i, pid) in body.child_pages.iter().enumerate() {
                    let off = pages_base + i * 4;
                    buf[off..off + 4].copy_from_slice(&pid.0.to_ne_bytes());
                }
            }
            NodeBody::Leaf(body) => {
                {
                    let mut cur = &mut buf[..];
                    cur.put_u32_ne(LEAF_TAG);
                    cur.put_u32_ne(body.keys.len() as u32);
                }
                for (i, key) in body.keys.iter().enumerate() {
                    let off = NODE_HEADER_LEN + i * kw;
                    key_codec.encode(key, &mut buf[off..off + kw]);
                }
                let vw = value_codec.width();
                let values_base = NODE_HEADER_LEN + (order - 1) * kw;
                for (i, value) in body.values.iter().enumerate() {
                    let off = values_base + i * vw;
                    value_codec.encode(value, &mut buf[off..off + vw]);
                }
            }
        }
    }

    /// Rebuilds a node from a page image. All child-cache slots come back
    /// empty.
    pub(crate) fn decode(
        buf: &[u8],
        pid: PageId,
        parent: *mut Node<K, V>,
        order: usize,
        key_codec: &dyn Codec<K>,
        value_codec: &dyn Codec<V>,
    ) -> LarchResult<Box<Node<K, V>>> {
        let mut cur = &buf[..];
        let tag = cur.get_u32_ne();
        let n = cur.get_u32_ne() as usize;
        if n > order - 1 {
            return Err(LarchError::TreeCorrupted(format!(
                "node {pid} claims {n} entries with fan-out {order}"
            )));
        }

        let kw = key_codec.width();
        let mut keys = Vec::with_capacity(order);
        for i in 0..n {
            let off = NODE_HEADER_LEN + i * kw;
            keys.push(key_codec.decode(&buf[off..off + kw]));
        }

        match tag {
            INNER_TAG => {
                let pages_base = NODE_HEADER_LEN + (order - 1) * kw;
                let mut child_pages = Vec::with_capacity(order + 1);
                let mut children = Vec::with_capacity(order + 1);
                for i in 0..=n {
                    let mut cur = &buf[pages_base + i * 4..];
                    child_pages.push(PageId(cur.get_u32_ne()));
                    children.push(None);
                }
                Ok(Node::from_body(
                    pid,
                    parent,
                    NodeBody::Inner(InnerBody {
                        keys,
                        child_pages,
                        children,
                    }),
                ))
            }
            LEAF_TAG => {
                let vw = value_codec.width();
                let values_base = NODE_HEADER_LEN + (order - 1) * kw;
                let mut values = Vec::with_capacity(order);
                for i in 0..n {
                    let off = values_base + i * vw;
                    values.push(value_codec.decode(&buf[off..off + vw]));
                }
                Ok(Node::from_body(
                    pid,
                    parent,
                    NodeBody::Leaf(LeafBody { keys, values }),
                ))
            }
            other => Err(LarchError::InvalidNodeTag(other)),
        }
    }
}
