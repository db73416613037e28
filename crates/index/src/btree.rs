//! Ordered B+ tree index.
//!
//! Nodes are immutable once published: a mutation builds a replacement
//! node, installs it through the parent's atomic child slot, and retires
//! the old node through the retirement queue. Readers therefore never
//! latch anything; they chase acquire-loaded pointers and either see the
//! old node or the new one, and a retired node stays readable until the
//! epoch queue frees it.
//!
//! Writers descend with latch coupling: ancestors are released as soon as
//! a non-full child bounds the split cascade, so the retained chain is
//! exactly the parent of the topmost node that may be rebuilt plus
//! everything below it. Deletes do not rebalance; a leaf may sit empty
//! until neighboring inserts split it back into use.
//!
//! Duplicate keys hold a locator list per distinct key, so same-key
//! mutations always land in one leaf and are atomic under its latch.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use tephra_core::{
    IndexCounters, IndexError, IndexKey, IndexMetadata, IndexStats, LocatorFilter, RowIndex,
    ScanDirection, Tuple, TupleLocator,
};
use tephra_epoch::RetirementQueue;

use crate::latch::NodeLatch;

/// Max children of an inner node.
const FANOUT: usize = 64;

/// Max distinct keys in a leaf.
const LEAF_CAPACITY: usize = 64;

type LocatorList = Vec<TupleLocator>;

struct InnerNode<K> {
    latch: NodeLatch,
    /// Separators; `children[i]` holds keys in `[keys[i-1], keys[i])`.
    keys: Vec<K>,
    children: Vec<AtomicPtr<Node<K>>>,
}

struct LeafNode<K> {
    latch: NodeLatch,
    /// Sorted by key; one entry per distinct key.
    entries: Vec<(K, LocatorList)>,
}

enum Node<K> {
    Inner(InnerNode<K>),
    Leaf(LeafNode<K>),
}

impl<K> Node<K> {
    fn latch(&self) -> &NodeLatch {
        match self {
            Node::Inner(inner) => &inner.latch,
            Node::Leaf(leaf) => &leaf.latch,
        }
    }

    /// Whether absorbing one more separator or entry would overflow.
    fn is_full(&self) -> bool {
        match self {
            Node::Inner(inner) => inner.children.len() >= FANOUT,
            Node::Leaf(leaf) => leaf.entries.len() >= LEAF_CAPACITY,
        }
    }
}

fn alloc_leaf<K>(entries: Vec<(K, LocatorList)>) -> *mut Node<K> {
    Box::into_raw(Box::new(Node::Leaf(LeafNode {
        latch: NodeLatch::new(),
        entries,
    })))
}

fn alloc_inner<K>(keys: Vec<K>, children: Vec<*mut Node<K>>) -> *mut Node<K> {
    debug_assert_eq!(keys.len() + 1, children.len());

    Box::into_raw(Box::new(Node::Inner(InnerNode {
        latch: NodeLatch::new(),
        keys,
        children: children.into_iter().map(AtomicPtr::new).collect(),
    })))
}

/// Child slot for `key`: keys equal to a separator descend right of it.
fn child_index<K: Ord>(keys: &[K], key: &K) -> usize {
    keys.partition_point(|sep| sep <= key)
}

/// A replacement produced by rebuilding one level.
enum Replacement<K> {
    One(*mut Node<K>),
    Two(*mut Node<K>, K, *mut Node<K>),
}

/// The latched chain a writer retains: the parent of the topmost node
/// that may be rebuilt, plus everything below it down to the leaf.
struct LockedPath<K> {
    /// Latched nodes, top to bottom; the last is the leaf.
    nodes: Vec<*mut Node<K>>,
    /// `slots[i]` is the child slot taken from `nodes[i]`.
    slots: Vec<usize>,
    /// Whether the tree-level root slot latch is still held.
    root_slot_locked: bool,
}

pub(crate) struct BPlusTree<K: IndexKey> {
    root: AtomicPtr<Node<K>>,
    /// Pseudo-parent latch for the root slot.
    root_latch: NodeLatch,
    retirement: Arc<RetirementQueue>,
    unique_keys: bool,
}

impl<K: IndexKey> BPlusTree<K> {
    pub(crate) fn new(retirement: Arc<RetirementQueue>, unique_keys: bool) -> Self {
        Self {
            root: AtomicPtr::new(alloc_leaf(Vec::new())),
            root_latch: NodeLatch::new(),
            retirement,
            unique_keys,
        }
    }

    pub(crate) fn insert(&self, key: K, locator: TupleLocator) -> bool {
        let path = self.lock_path(&key);
        let leaf = unsafe { leaf_of(*path.nodes.last().expect("path ends at a leaf")) };

        match leaf.entries.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(pos) => {
                let list = &leaf.entries[pos].1;

                if self.unique_keys || list.contains(&locator) {
                    self.release_path(&path);
                    return false;
                }

                let mut entries = leaf.entries.clone();
                entries[pos].1.push(locator);
                unsafe { self.replace_leaf(path, entries) };
                true
            }
            Err(pos) => {
                let mut entries = leaf.entries.clone();
                entries.insert(pos, (key, vec![locator]));
                unsafe { self.replace_leaf(path, entries) };
                true
            }
        }
    }

    pub(crate) fn conditional_insert(
        &self,
        key: K,
        locator: TupleLocator,
        predicate: &dyn Fn(TupleLocator) -> bool,
    ) -> bool {
        let path = self.lock_path(&key);
        let leaf = unsafe { leaf_of(*path.nodes.last().expect("path ends at a leaf")) };

        match leaf.entries.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(pos) => {
                let list = &leaf.entries[pos].1;

                if list.iter().any(|existing| predicate(*existing)) || list.contains(&locator)
                {
                    self.release_path(&path);
                    return false;
                }

                let mut entries = leaf.entries.clone();
                entries[pos].1.push(locator);
                unsafe { self.replace_leaf(path, entries) };
                true
            }
            Err(pos) => {
                let mut entries = leaf.entries.clone();
                entries.insert(pos, (key, vec![locator]));
                unsafe { self.replace_leaf(path, entries) };
                true
            }
        }
    }

    pub(crate) fn delete(&self, key: &K, locator: TupleLocator) -> bool {
        let path = self.lock_path(key);
        let leaf = unsafe { leaf_of(*path.nodes.last().expect("path ends at a leaf")) };

        let Ok(pos) = leaf.entries.binary_search_by(|(k, _)| k.cmp(key)) else {
            self.release_path(&path);
            return false;
        };

        let Some(found) = leaf.entries[pos].1.iter().position(|l| *l == locator) else {
            self.release_path(&path);
            return false;
        };

        let mut entries = leaf.entries.clone();
        if entries[pos].1.len() == 1 {
            entries.remove(pos);
        } else {
            entries[pos].1.remove(found);
        }

        unsafe { self.replace_leaf(path, entries) };
        true
    }

    pub(crate) fn scan_key(&self, key: &K) -> Vec<TupleLocator> {
        let mut node = unsafe { &*self.root.load(Ordering::Acquire) };

        loop {
            match node {
                Node::Inner(inner) => {
                    let idx = child_index(&inner.keys, key);
                    node = unsafe { &*inner.children[idx].load(Ordering::Acquire) };
                }
                Node::Leaf(leaf) => {
                    return match leaf.entries.binary_search_by(|(k, _)| k.cmp(key)) {
                        Ok(pos) => leaf.entries[pos].1.clone(),
                        Err(_) => Vec::new(),
                    };
                }
            }
        }
    }

    /// Collect `[low, high]` (either side open when `None`) in ascending
    /// key order over a point-in-time traversal of the current nodes.
    pub(crate) fn collect_range(
        &self,
        low: Option<&K>,
        high: Option<&K>,
        filter: LocatorFilter<'_>,
        out: &mut Vec<TupleLocator>,
    ) {
        unsafe { visit(self.root.load(Ordering::Acquire), low, high, filter, out) }
    }

    /// Writer descent with latch coupling; see the module docs for the
    /// retention rule.
    fn lock_path(&self, key: &K) -> LockedPath<K> {
        self.root_latch
            .lock()
            .expect("the root slot latch is never obsolete");

        let root = self.root.load(Ordering::Acquire);
        unsafe { &*root }
            .latch()
            .lock()
            .expect("the root node cannot be replaced under the root slot latch");

        let mut nodes = vec![root];
        let mut slots = Vec::new();
        let mut root_slot_locked = true;

        loop {
            let inner = match unsafe { &**nodes.last().expect("descent holds a node") } {
                Node::Leaf(_) => break,
                Node::Inner(inner) => inner,
            };

            let idx = child_index(&inner.keys, key);
            let child = inner.children[idx].load(Ordering::Acquire);
            let child_ref = unsafe { &*child };

            child_ref
                .latch()
                .lock()
                .expect("a child of a latched parent cannot be replaced");

            slots.push(idx);
            nodes.push(child);

            if !child_ref.is_full() {
                // A non-full child bounds the split cascade: only its
                // parent can still need a slot store, so everything
                // above goes free.
                while nodes.len() > 2 {
                    let released = nodes.remove(0);
                    slots.remove(0);
                    unsafe { (*released).latch().unlock() };

                    if root_slot_locked {
                        self.root_latch.unlock();
                        root_slot_locked = false;
                    }
                }
            }
        }

        LockedPath {
            nodes,
            slots,
            root_slot_locked,
        }
    }

    fn release_path(&self, path: &LockedPath<K>) {
        for &node in &path.nodes {
            unsafe { (*node).latch().unlock() };
        }

        if path.root_slot_locked {
            self.root_latch.unlock();
        }
    }

    /// Install `new_entries` as the content of the latched leaf,
    /// splitting and propagating through the latched chain as needed.
    /// Consumes every latch in the path.
    unsafe fn replace_leaf(&self, path: LockedPath<K>, new_entries: Vec<(K, LocatorList)>) {
        let leaf_level = path.nodes.len() - 1;
        let leaf_ptr = path.nodes[leaf_level];

        let mut repl = if new_entries.len() > LEAF_CAPACITY {
            let mut left = new_entries;
            let right = left.split_off(left.len() / 2);
            let sep = right[0].0.clone();
            Replacement::Two(alloc_leaf(left), sep, alloc_leaf(right))
        } else {
            Replacement::One(alloc_leaf(new_entries))
        };

        (*leaf_ptr).latch().unlock_obsolete();
        self.retire_node(leaf_ptr);

        let mut consumed = false;

        for level in (0..leaf_level).rev() {
            let node_ptr = path.nodes[level];
            let slot = path.slots[level];
            let inner = match &*node_ptr {
                Node::Inner(inner) => inner,
                Node::Leaf(_) => unreachable!("only the last path node is a leaf"),
            };

            match repl {
                Replacement::One(new_child) => {
                    // Single replacement: an in-place slot store under
                    // this node's latch, nothing above changes.
                    inner.children[slot].store(new_child, Ordering::Release);

                    for &remaining in &path.nodes[0..=level] {
                        (*remaining).latch().unlock();
                    }

                    consumed = true;
                    break;
                }
                Replacement::Two(left, sep, right) => {
                    let mut keys = inner.keys.clone();
                    let mut children: Vec<*mut Node<K>> = inner
                        .children
                        .iter()
                        .map(|child| child.load(Ordering::Relaxed))
                        .collect();

                    keys.insert(slot, sep);
                    children[slot] = left;
                    children.insert(slot + 1, right);

                    repl = if children.len() > FANOUT {
                        let mid = children.len() / 2;
                        let right_children = children.split_off(mid);
                        let right_keys = keys.split_off(mid);
                        let up_sep = keys.pop().expect("split leaves a separator");

                        debug_assert_eq!(keys.len() + 1, children.len());
                        debug_assert_eq!(right_keys.len() + 1, right_children.len());

                        Replacement::Two(
                            alloc_inner(keys, children),
                            up_sep,
                            alloc_inner(right_keys, right_children),
                        )
                    } else {
                        Replacement::One(alloc_inner(keys, children))
                    };

                    (*node_ptr).latch().unlock_obsolete();
                    self.retire_node(node_ptr);
                }
            }
        }

        if !consumed {
            // The whole chain was rebuilt; swap the root slot.
            debug_assert!(path.root_slot_locked);

            let new_root = match repl {
                Replacement::One(node) => node,
                Replacement::Two(left, sep, right) => alloc_inner(vec![sep], vec![left, right]),
            };

            self.root.store(new_root, Ordering::Release);
            self.root_latch.unlock();
            return;
        }

        if path.root_slot_locked {
            self.root_latch.unlock();
        }
    }

    unsafe fn retire_node(&self, node: *mut Node<K>) {
        self.retirement.defer_drop(Box::from_raw(node));
    }
}

unsafe fn leaf_of<'a, K>(node: *mut Node<K>) -> &'a LeafNode<K> {
    match &*node {
        Node::Leaf(leaf) => leaf,
        Node::Inner(_) => unreachable!("write descent ends at a leaf"),
    }
}

unsafe fn visit<K: IndexKey>(
    node: *mut Node<K>,
    low: Option<&K>,
    high: Option<&K>,
    filter: LocatorFilter<'_>,
    out: &mut Vec<TupleLocator>,
) {
    match &*node {
        Node::Inner(inner) => {
            for (i, child) in inner.children.iter().enumerate() {
                // children[i] covers [keys[i-1], keys[i]); prune subtrees
                // entirely outside the requested range.
                if let Some(low) = low {
                    if i < inner.keys.len() && inner.keys[i] <= *low {
                        continue;
                    }
                }

                if let Some(high) = high {
                    if i > 0 && inner.keys[i - 1] > *high {
                        break;
                    }
                }

                visit(child.load(Ordering::Acquire), low, high, filter, out);
            }
        }
        Node::Leaf(leaf) => {
            for (key, list) in &leaf.entries {
                if let Some(low) = low {
                    if key < low {
                        continue;
                    }
                }

                if let Some(high) = high {
                    if key > high {
                        break;
                    }
                }

                match filter {
                    Some(accept) => out.extend(list.iter().copied().filter(|l| accept(*l))),
                    None => out.extend_from_slice(list),
                }
            }
        }
    }
}

unsafe fn free_subtree<K>(node: *mut Node<K>) {
    let boxed = Box::from_raw(node);

    if let Node::Inner(inner) = &*boxed {
        for child in &inner.children {
            free_subtree(child.load(Ordering::Relaxed));
        }
    }
}

impl<K: IndexKey> Drop for BPlusTree<K> {
    fn drop(&mut self) {
        // Exclusive access at drop; retired nodes are owned by the
        // retirement queue, not by the tree.
        unsafe { free_subtree(self.root.load(Ordering::Relaxed)) }
    }
}

/// The `ordered_btree` (and `ordered_bwtree`) realization of the index
/// contract.
pub struct BTreeIndex<K: IndexKey> {
    metadata: Arc<IndexMetadata>,
    counters: IndexCounters,
    tree: BPlusTree<K>,
}

impl<K: IndexKey> BTreeIndex<K> {
    pub fn new(metadata: Arc<IndexMetadata>, retirement: Arc<RetirementQueue>) -> Self {
        let unique_keys = metadata.unique_keys;

        Self {
            metadata,
            counters: IndexCounters::default(),
            tree: BPlusTree::new(retirement, unique_keys),
        }
    }

    fn ordered(&self, locators: Vec<TupleLocator>, direction: ScanDirection) -> Vec<TupleLocator> {
        match direction {
            ScanDirection::Forward => locators,
            ScanDirection::Backward => {
                let mut locators = locators;
                locators.reverse();
                locators
            }
        }
    }
}

impl<K: IndexKey> RowIndex for BTreeIndex<K> {
    fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    fn insert(&self, key: &Tuple, locator: TupleLocator) -> Result<bool, IndexError> {
        let key = K::from_tuple(key)?;
        self.counters.record_insert();
        Ok(self.tree.insert(key, locator))
    }

    fn delete(&self, key: &Tuple, locator: TupleLocator) -> Result<bool, IndexError> {
        let key = K::from_tuple(key)?;
        self.counters.record_delete();
        Ok(self.tree.delete(&key, locator))
    }

    fn conditional_insert(
        &self,
        key: &Tuple,
        locator: TupleLocator,
        predicate: &dyn Fn(TupleLocator) -> bool,
    ) -> Result<bool, IndexError> {
        let key = K::from_tuple(key)?;
        self.counters.record_insert();
        Ok(self.tree.conditional_insert(key, locator, predicate))
    }

    fn scan_key(&self, key: &Tuple) -> Result<Vec<TupleLocator>, IndexError> {
        let key = K::from_tuple(key)?;
        self.counters.record_lookup();
        Ok(self.tree.scan_key(&key))
    }

    fn scan_range(
        &self,
        low: &Tuple,
        high: &Tuple,
        direction: ScanDirection,
        filter: LocatorFilter<'_>,
    ) -> Result<Vec<TupleLocator>, IndexError> {
        let low = K::from_tuple(low)?;
        let high = K::from_tuple(high)?;
        self.counters.record_lookup();

        let mut out = Vec::new();
        self.tree.collect_range(Some(&low), Some(&high), filter, &mut out);

        Ok(self.ordered(out, direction))
    }

    fn scan_all(&self, direction: ScanDirection) -> Result<Vec<TupleLocator>, IndexError> {
        self.counters.record_lookup();

        let mut out = Vec::new();
        self.tree.collect_range(None, None, None, &mut out);

        Ok(self.ordered(out, direction))
    }

    fn scan_from(&self, low: &Tuple) -> Result<Vec<TupleLocator>, IndexError> {
        let low = K::from_tuple(low)?;
        self.counters.record_lookup();

        let mut out = Vec::new();
        self.tree.collect_range(Some(&low), None, None, &mut out);

        Ok(out)
    }

    fn stats(&self) -> IndexStats {
        self.counters.snapshot()
    }
}
