//! Ordered range scans.

use crate::codec::Codec;
use crate::tree::BTree;
use larch_common::Result;
use std::collections::VecDeque;

/// Where the next refill descends to.
enum Cursor<K> {
    /// Leftmost leaf.
    Start,
    /// The leaf holding keys at or above this separator.
    From(K),
    /// Past the rightmost leaf.
    Done,
}

/// Which collected keys are still new to the caller.
enum LowerFilter<K> {
    All,
    AtLeast(K),
    Greater(K),
}

/// Buffered ascending iterator over the tree.
///
/// Each refill collects one leaf through the ordinary descent. The descent
/// reports the separator to the right of its path, which becomes the next
/// cursor position; keys at or below the last buffered key are dropped on
/// refill so nothing is emitted twice across concurrent restructuring.
pub struct Scan<'t, K, V, KC, VC> {
    tree: &'t BTree<K, V, KC, VC>,
    buf: VecDeque<(K, V)>,
    cursor: Cursor<K>,
    filter: LowerFilter<K>,
}

impl<'t, K, V, KC, VC> Scan<'t, K, V, KC, VC>
where
    K: Ord + Copy,
    V: Copy,
    KC: Codec<K>,
    VC: Codec<V>,
{
    pub(crate) fn new(tree: &'t BTree<K, V, KC, VC>, from: Option<K>) -> Self {
        Self {
            tree,
            buf: VecDeque::new(),
            cursor: match from {
                Some(key) => Cursor::From(key),
                None => Cursor::Start,
            },
            filter: match from {
                Some(key) => LowerFilter::AtLeast(key),
                None => LowerFilter::All,
            },
        }
    }

    /// Collects leaves until something new turns up or the tree is exhausted.
    fn refill(&mut self) -> Result<()> {
        loop {
            let route = match &self.cursor {
                Cursor::Start => None,
                Cursor::From(key) => Some(*key),
                Cursor::Done => return Ok(()),
            };

            let mut entries = Vec::new();
            let mut next_sep = None;
            self.tree
                .collect_leaf(route.as_ref(), &mut entries, &mut next_sep)?;

            match &self.filter {
                LowerFilter::All => {}
                LowerFilter::AtLeast(min) => entries.retain(|(k, _)| k >= min),
                LowerFilter::Greater(min) => entries.retain(|(k, _)| k > min),
            }

            self.cursor = match next_sep {
                Some(sep) => Cursor::From(sep),
                None => Cursor::Done,
            };

            if let Some(&(last, _)) = entries.last() {
                self.filter = LowerFilter::Greater(last);
                self.buf.extend(entries);
                return Ok(());
            }
        }
    }
}

impl<K, V, KC, VC> Iterator for Scan<'_, K, V, KC, VC>
where
    K: Ord + Copy,
    V: Copy,
    KC: Codec<K>,
    VC: Codec<V>,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pair) = self.buf.pop_front() {
                return Some(Ok(pair));
            }
            if matches!(self.cursor, Cursor::Done) {
                return None;
            }
            if let Err(err) = self.refill() {
                self.cursor = Cursor::Done;
                return Some(Err(err));
            }
        }
    }
}
