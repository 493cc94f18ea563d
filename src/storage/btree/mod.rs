#![forbid(unsafe_code)]

//! B-tree of record addresses ordered by a caller-supplied comparator.
//!
//! The tree stores only addresses; ordering is derived by comparing the
//! records they point to. The root node's address lives in a pointer field of
//! some holder record, so one tree can be attached to any record.

mod node;
mod stats;

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::trace;

use crate::db::Nd;
use crate::primitives::store::ChunkStore;
use crate::types::{Address, NdError, Result};

use node::{Node, MIN_DEGREE};
pub use stats::{BTreeStats, BTreeStatsSnapshot};

/// Total order over the records held by a tree.
pub trait BTreeComparator: Send + Sync {
    /// Compares the records at `a` and `b`.
    fn compare(&self, nd: &Nd, a: Address, b: Address) -> Result<Ordering>;
}

/// Range visitor for [`BTree::accept`].
///
/// `compare` places a record relative to the range of interest: `Less` if
/// it sorts before the range, `Equal` inside it, `Greater` after it. It must
/// be monotone with the tree's own order.
pub trait BTreeVisitor {
    /// Places `record` relative to the range.
    fn compare(&mut self, nd: &Nd, record: Address) -> Result<Ordering>;
    /// Called for each record in range, in order. Return `false` to stop.
    fn visit(&mut self, nd: &Nd, record: Address) -> Result<bool>;
}

/// Handle on a tree whose root pointer is stored at `root_at`.
pub struct BTree {
    root_at: Address,
    comparator: Arc<dyn BTreeComparator>,
    stats: Arc<BTreeStats>,
}

impl BTree {
    /// Opens the tree rooted at the pointer stored at `root_at`.
    pub fn new(
        root_at: Address,
        comparator: Arc<dyn BTreeComparator>,
        stats: Arc<BTreeStats>,
    ) -> Self {
        Self {
            root_at,
            comparator,
            stats,
        }
    }

    /// Returns true if the tree holds no records.
    pub fn is_empty(&self, nd: &Nd) -> Result<bool> {
        Ok(nd.store().get_rec_ptr(self.root_at)?.is_null())
    }

    fn search(
        &self,
        nd: &Nd,
        node: &Node,
        key: Address,
    ) -> Result<std::result::Result<usize, usize>> {
        let (mut lo, mut hi) = (0, node.keys.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.comparator.compare(nd, node.keys[mid], key)? {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Inserts `key`. Returns false if an equal record is already present.
    pub fn insert(&self, nd: &Nd, key: Address) -> Result<bool> {
        if key.is_null() {
            return Err(NdError::Invalid("cannot index the null address"));
        }
        let store = nd.store();
        let root_addr = store.get_rec_ptr(self.root_at)?;
        if root_addr.is_null() {
            let mut root = Node::alloc(store, true)?;
            root.keys.push(key);
            root.write(store)?;
            store.put_rec_ptr(self.root_at, root.address)?;
            self.stats.inc_inserts();
            return Ok(true);
        }
        let mut node = Node::load(store, root_addr)?;
        if node.keys.len() == node::MAX_KEYS {
            let mut root = Node::alloc(store, false)?;
            root.children.push(node.address);
            self.split_child(store, &mut root, 0, node)?;
            store.put_rec_ptr(self.root_at, root.address)?;
            node = root;
        }
        loop {
            let pos = match self.search(nd, &node, key)? {
                Ok(_) => return Ok(false),
                Err(pos) => pos,
            };
            if node.leaf {
                node.keys.insert(pos, key);
                node.write(store)?;
                self.stats.inc_inserts();
                trace!(%key, "btree.insert");
                return Ok(true);
            }
            let child = Node::load(store, node.children[pos])?;
            if child.keys.len() < node::MAX_KEYS {
                node = child;
                continue;
            }
            let (left, right) = self.split_child(store, &mut node, pos, child)?;
            node = match self.comparator.compare(nd, key, node.keys[pos])? {
                Ordering::Less => left,
                Ordering::Greater => right,
                Ordering::Equal => return Ok(false),
            };
        }
    }

    /// Splits the full `child` (the `index`-th child of `parent`) around its median.
    fn split_child(
        &self,
        store: &dyn ChunkStore,
        parent: &mut Node,
        index: usize,
        mut child: Node,
    ) -> Result<(Node, Node)> {
        let mut right = Node::alloc(store, child.leaf)?;
        right.keys = child.keys.drain(MIN_DEGREE..).collect();
        let median = child
            .keys
            .pop()
            .ok_or_else(|| NdError::corrupt(format!("split of empty node {}", child.address)))?;
        if !child.leaf {
            right.children = child.children.drain(MIN_DEGREE..).collect();
        }
        parent.keys.insert(index, median);
        parent.children.insert(index + 1, right.address);
        child.write(store)?;
        right.write(store)?;
        parent.write(store)?;
        self.stats.inc_splits();
        Ok((child, right))
    }

    /// Removes `key`. Returns false if it was not present.
    pub fn delete(&self, nd: &Nd, key: Address) -> Result<bool> {
        let store = nd.store();
        let root_addr = store.get_rec_ptr(self.root_at)?;
        if root_addr.is_null() {
            return Ok(false);
        }
        let removed = self.delete_from(nd, Node::load(store, root_addr)?, key)?;
        let root = Node::load(store, root_addr)?;
        if root.keys.is_empty() {
            let replacement = root.children.first().copied().unwrap_or(Address::NULL);
            store.put_rec_ptr(self.root_at, replacement)?;
            store.free(root.address)?;
        }
        if removed {
            self.stats.inc_deletes();
            trace!(%key, "btree.delete");
        }
        Ok(removed)
    }

    fn delete_from(&self, nd: &Nd, mut node: Node, mut key: Address) -> Result<bool> {
        let store = nd.store();
        loop {
            match self.search(nd, &node, key)? {
                Ok(i) if node.leaf => {
                    node.keys.remove(i);
                    node.write(store)?;
                    return Ok(true);
                }
                Ok(i) => {
                    let left = Node::load(store, node.children[i])?;
                    if left.keys.len() >= MIN_DEGREE {
                        let pred = self.last_key(store, &left)?;
                        node.keys[i] = pred;
                        node.write(store)?;
                        key = pred;
                        node = left;
                        continue;
                    }
                    let right = Node::load(store, node.children[i + 1])?;
                    if right.keys.len() >= MIN_DEGREE {
                        let succ = self.first_key(store, &right)?;
                        node.keys[i] = succ;
                        node.write(store)?;
                        key = succ;
                        node = right;
                        continue;
                    }
                    node = self.merge(store, &mut node, i, left, right)?;
                }
                Err(_) if node.leaf => return Ok(false),
                Err(i) => node = self.ensure_child_has_spare(store, &mut node, i)?,
            }
        }
    }

    /// Makes sure the `index`-th child holds at least `MIN_DEGREE` keys
    /// before descending into it, borrowing from or merging with a sibling.
    fn ensure_child_has_spare(
        &self,
        store: &dyn ChunkStore,
        parent: &mut Node,
        index: usize,
    ) -> Result<Node> {
        let mut child = Node::load(store, parent.children[index])?;
        if child.keys.len() >= MIN_DEGREE {
            return Ok(child);
        }
        if index > 0 {
            let mut left = Node::load(store, parent.children[index - 1])?;
            if left.keys.len() >= MIN_DEGREE {
                let borrowed = left.keys.pop().ok_or_else(|| empty_sibling(&left))?;
                child.keys.insert(0, std::mem::replace(&mut parent.keys[index - 1], borrowed));
                if !left.leaf {
                    let moved = left.children.pop().ok_or_else(|| empty_sibling(&left))?;
                    child.children.insert(0, moved);
                }
                left.write(store)?;
                child.write(store)?;
                parent.write(store)?;
                self.stats.inc_rotations();
                return Ok(child);
            }
        }
        if index + 1 < parent.children.len() {
            let mut right = Node::load(store, parent.children[index + 1])?;
            if right.keys.len() >= MIN_DEGREE {
                let borrowed = right.keys.remove(0);
                child.keys.push(std::mem::replace(&mut parent.keys[index], borrowed));
                if !right.leaf {
                    child.children.push(right.children.remove(0));
                }
                right.write(store)?;
                child.write(store)?;
                parent.write(store)?;
                self.stats.inc_rotations();
                return Ok(child);
            }
            return self.merge(store, parent, index, child, right);
        }
        let left = Node::load(store, parent.children[index - 1])?;
        self.merge(store, parent, index - 1, left, child)
    }

    /// Folds the separator at `index` and the right sibling into `left`.
    fn merge(
        &self,
        store: &dyn ChunkStore,
        parent: &mut Node,
        index: usize,
        mut left: Node,
        right: Node,
    ) -> Result<Node> {
        let separator = parent.keys.remove(index);
        parent.children.remove(index + 1);
        left.keys.push(separator);
        left.keys.extend(right.keys);
        left.children.extend(right.children);
        left.write(store)?;
        parent.write(store)?;
        store.free(right.address)?;
        self.stats.inc_merges();
        Ok(left)
    }

    fn last_key(&self, store: &dyn ChunkStore, node: &Node) -> Result<Address> {
        let mut node = node.clone();
        while !node.leaf {
            let child = *node.children.last().ok_or_else(|| empty_sibling(&node))?;
            node = Node::load(store, child)?;
        }
        node.keys.last().copied().ok_or_else(|| empty_sibling(&node))
    }

    fn first_key(&self, store: &dyn ChunkStore, node: &Node) -> Result<Address> {
        let mut node = node.clone();
        while !node.leaf {
            node = Node::load(store, node.children[0])?;
        }
        node.keys.first().copied().ok_or_else(|| empty_sibling(&node))
    }

    /// Visits the records the visitor places in range, in tree order.
    ///
    /// Subtrees wholly before or after the range are skipped.
    pub fn accept(&self, nd: &Nd, visitor: &mut dyn BTreeVisitor) -> Result<()> {
        let root = nd.store().get_rec_ptr(self.root_at)?;
        self.stats.inc_traversals();
        if !root.is_null() {
            self.accept_node(nd, root, visitor)?;
        }
        Ok(())
    }

    fn accept_node(
        &self,
        nd: &Nd,
        address: Address,
        visitor: &mut dyn BTreeVisitor,
    ) -> Result<bool> {
        let node = Node::load(nd.store(), address)?;
        let (mut lo, mut hi) = (0, node.keys.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if visitor.compare(nd, node.keys[mid])? == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let mut i = lo;
        loop {
            if !node.leaf && !self.accept_node(nd, node.children[i], visitor)? {
                return Ok(false);
            }
            let Some(&key) = node.keys.get(i) else {
                return Ok(true);
            };
            if visitor.compare(nd, key)? == Ordering::Greater || !visitor.visit(nd, key)? {
                return Ok(false);
            }
            i += 1;
        }
    }

    /// Every record, in tree order.
    pub fn addresses(&self, nd: &Nd) -> Result<Vec<Address>> {
        struct All(Vec<Address>);
        impl BTreeVisitor for All {
            fn compare(&mut self, _nd: &Nd, _record: Address) -> Result<Ordering> {
                Ok(Ordering::Equal)
            }
            fn visit(&mut self, _nd: &Nd, record: Address) -> Result<bool> {
                self.0.push(record);
                Ok(true)
            }
        }
        let mut all = All(Vec::new());
        self.accept(nd, &mut all)?;
        Ok(all.0)
    }

    /// Frees every node and empties the tree. The indexed records are untouched.
    pub fn destruct(&self, nd: &Nd) -> Result<()> {
        let store = nd.store();
        let root = store.get_rec_ptr(self.root_at)?;
        let mut pending = vec![root];
        while let Some(address) = pending.pop() {
            if address.is_null() {
                continue;
            }
            let node = Node::load(store, address)?;
            pending.extend(node.children.iter().copied());
            store.free(address)?;
        }
        store.put_rec_ptr(self.root_at, Address::NULL)
    }
}

fn empty_sibling(node: &Node) -> NdError {
    NdError::corrupt(format!("btree node {} is unexpectedly empty", node.address))
}
