//! Adaptive radix tree index.
//!
//! The tree radixes over the codec's binary-comparable key bytes, so its
//! in-order traversal is exactly SQL order. Standard ART machinery
//! applies: four node widths (4/16/48/256), path compression with a
//! bounded stored prefix, and lazy expansion, so a leaf can sit well
//! above the full key depth. Leaves store only locator lists; when a
//! comparison needs key bytes that path compression dropped, the key is
//! recovered through the [`KeyLoader`] handed to the constructor, which
//! re-reads the row and re-encodes its indexed columns.
//!
//! Concurrency follows the same discipline as the B+ tree: readers are
//! latch-free (child slots are atomics, node contents are append-only or
//! replaced copy-on-write, replaced nodes retire through the epoch
//! queue), writers crab down with a two-node latch window. All ART
//! mutations are local to one node and its parent, so the window never
//! grows.
//!
//! Child slots hold an [`ArtNode`] enum; a pointer is a leaf because the
//! pointee says so, not because of stolen tag bits.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;

use tephra_core::codec::{self, KeyLoader};
use tephra_core::{
    IndexCounters, IndexError, IndexMetadata, IndexStats, LocatorFilter, RowIndex,
    ScanDirection, Tuple, TupleLocator,
};
use tephra_epoch::RetirementQueue;

use crate::latch::NodeLatch;

/// Stored prefix bytes; longer compressed paths are recovered through
/// the key loader.
const MAX_PREFIX: usize = 12;

/// Empty marker in a Node48 child index.
const N48_EMPTY: u8 = 0xff;

type LocatorList = Vec<TupleLocator>;

struct LeafNode {
    /// Never null while the leaf is linked; the list is immutable and
    /// swapped copy-on-write under the parent's latch.
    values: AtomicPtr<LocatorList>,
}

impl Drop for LeafNode {
    fn drop(&mut self) {
        let values = *self.values.get_mut();
        if !values.is_null() {
            unsafe { drop(Box::from_raw(values)) };
        }
    }
}

struct N4 {
    keys: [AtomicU8; 4],
    ptrs: [AtomicPtr<ArtNode>; 4],
    count: AtomicU8,
}

struct N16 {
    keys: [AtomicU8; 16],
    ptrs: [AtomicPtr<ArtNode>; 16],
    count: AtomicU8,
}

struct N48 {
    child_index: [AtomicU8; 256],
    ptrs: [AtomicPtr<ArtNode>; 48],
    count: AtomicU8,
}

struct N256 {
    ptrs: [AtomicPtr<ArtNode>; 256],
}

enum Children {
    N4(N4),
    N16(N16),
    N48(N48),
    N256(N256),
}

struct InternalNode {
    latch: NodeLatch,
    prefix_len: u16,
    prefix: [u8; MAX_PREFIX],
    /// Linked children; slots in append-only variants are not reclaimed
    /// until the node is rebuilt, so this is the live count.
    live_children: AtomicU16,
    children: Children,
}

enum ArtNode {
    Internal(InternalNode),
    Leaf(LeafNode),
}

fn null_ptrs<const N: usize>() -> [AtomicPtr<ArtNode>; N] {
    std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut()))
}

fn zero_bytes<const N: usize>() -> [AtomicU8; N] {
    std::array::from_fn(|_| AtomicU8::new(0))
}

fn alloc_leaf(locators: LocatorList) -> *mut ArtNode {
    Box::into_raw(Box::new(ArtNode::Leaf(LeafNode {
        values: AtomicPtr::new(Box::into_raw(Box::new(locators))),
    })))
}

fn alloc_n4(prefix: &[u8]) -> *mut ArtNode {
    let mut stored = [0u8; MAX_PREFIX];
    let stored_len = prefix.len().min(MAX_PREFIX);
    stored[..stored_len].copy_from_slice(&prefix[..stored_len]);

    Box::into_raw(Box::new(ArtNode::Internal(InternalNode {
        latch: NodeLatch::new(),
        prefix_len: prefix.len() as u16,
        prefix: stored,
        live_children: AtomicU16::new(0),
        children: Children::N4(N4 {
            keys: zero_bytes(),
            ptrs: null_ptrs(),
            count: AtomicU8::new(0),
        }),
    })))
}

impl InternalNode {
    /// Lock-free child lookup by key byte.
    fn find_child(&self, byte: u8) -> *mut ArtNode {
        match &self.children {
            Children::N4(n) => {
                let count = n.count.load(Ordering::Acquire) as usize;
                for i in 0..count {
                    if n.keys[i].load(Ordering::Acquire) == byte {
                        let child = n.ptrs[i].load(Ordering::Acquire);
                        if !child.is_null() {
                            return child;
                        }
                    }
                }
                ptr::null_mut()
            }
            Children::N16(n) => {
                let count = n.count.load(Ordering::Acquire) as usize;
                for i in 0..count {
                    if n.keys[i].load(Ordering::Acquire) == byte {
                        let child = n.ptrs[i].load(Ordering::Acquire);
                        if !child.is_null() {
                            return child;
                        }
                    }
                }
                ptr::null_mut()
            }
            Children::N48(n) => {
                let slot = n.child_index[byte as usize].load(Ordering::Acquire);
                if slot == N48_EMPTY {
                    ptr::null_mut()
                } else {
                    n.ptrs[slot as usize].load(Ordering::Acquire)
                }
            }
            Children::N256(n) => n.ptrs[byte as usize].load(Ordering::Acquire),
        }
    }

    /// Children as (byte, ptr) pairs in ascending byte order. Callers on
    /// the read path get a point-in-time snapshot.
    fn sorted_children(&self) -> Vec<(u8, *mut ArtNode)> {
        let mut out = Vec::new();

        match &self.children {
            Children::N4(n) => {
                let count = n.count.load(Ordering::Acquire) as usize;
                for i in 0..count {
                    let child = n.ptrs[i].load(Ordering::Acquire);
                    if !child.is_null() {
                        out.push((n.keys[i].load(Ordering::Acquire), child));
                    }
                }
                out.sort_unstable_by_key(|(byte, _)| *byte);
            }
            Children::N16(n) => {
                let count = n.count.load(Ordering::Acquire) as usize;
                for i in 0..count {
                    let child = n.ptrs[i].load(Ordering::Acquire);
                    if !child.is_null() {
                        out.push((n.keys[i].load(Ordering::Acquire), child));
                    }
                }
                out.sort_unstable_by_key(|(byte, _)| *byte);
            }
            Children::N48(n) => {
                for byte in 0..=255u8 {
                    let slot = n.child_index[byte as usize].load(Ordering::Acquire);
                    if slot != N48_EMPTY {
                        let child = n.ptrs[slot as usize].load(Ordering::Acquire);
                        if !child.is_null() {
                            out.push((byte, child));
                        }
                    }
                }
            }
            Children::N256(n) => {
                for byte in 0..=255u8 {
                    let child = n.ptrs[byte as usize].load(Ordering::Acquire);
                    if !child.is_null() {
                        out.push((byte, child));
                    }
                }
            }
        }

        out
    }

    /// Whether an in-place add is still possible.
    fn has_room(&self) -> bool {
        match &self.children {
            Children::N4(n) => (n.count.load(Ordering::Relaxed) as usize) < 4,
            Children::N16(n) => (n.count.load(Ordering::Relaxed) as usize) < 16,
            Children::N48(n) => (n.count.load(Ordering::Relaxed) as usize) < 48,
            Children::N256(_) => true,
        }
    }

    /// In-place append under the node latch. The pointer is published
    /// before the key byte (or index entry) that makes it reachable.
    fn add_child_in_place(&self, byte: u8, child: *mut ArtNode) {
        debug_assert!(self.has_room());

        match &self.children {
            Children::N4(n) => {
                let count = n.count.load(Ordering::Relaxed) as usize;
                n.ptrs[count].store(child, Ordering::Release);
                n.keys[count].store(byte, Ordering::Release);
                n.count.store(count as u8 + 1, Ordering::Release);
            }
            Children::N16(n) => {
                let count = n.count.load(Ordering::Relaxed) as usize;
                n.ptrs[count].store(child, Ordering::Release);
                n.keys[count].store(byte, Ordering::Release);
                n.count.store(count as u8 + 1, Ordering::Release);
            }
            Children::N48(n) => {
                let count = n.count.load(Ordering::Relaxed);
                n.ptrs[count as usize].store(child, Ordering::Release);
                n.child_index[byte as usize].store(count, Ordering::Release);
                n.count.store(count + 1, Ordering::Release);
            }
            Children::N256(n) => {
                n.ptrs[byte as usize].store(child, Ordering::Release);
            }
        }

        self.live_children.fetch_add(1, Ordering::Release);
    }

    /// Replace the pointer behind an existing byte, under the node
    /// latch.
    fn replace_child(&self, byte: u8, child: *mut ArtNode) {
        match &self.children {
            Children::N4(n) => {
                let count = n.count.load(Ordering::Relaxed) as usize;
                for i in 0..count {
                    if n.keys[i].load(Ordering::Relaxed) == byte
                        && !n.ptrs[i].load(Ordering::Relaxed).is_null()
                    {
                        n.ptrs[i].store(child, Ordering::Release);
                        return;
                    }
                }
                unreachable!("replace_child of an absent byte");
            }
            Children::N16(n) => {
                let count = n.count.load(Ordering::Relaxed) as usize;
                for i in 0..count {
                    if n.keys[i].load(Ordering::Relaxed) == byte
                        && !n.ptrs[i].load(Ordering::Relaxed).is_null()
                    {
                        n.ptrs[i].store(child, Ordering::Release);
                        return;
                    }
                }
                unreachable!("replace_child of an absent byte");
            }
            Children::N48(n) => {
                let slot = n.child_index[byte as usize].load(Ordering::Relaxed);
                debug_assert!(slot != N48_EMPTY);
                n.ptrs[slot as usize].store(child, Ordering::Release);
            }
            Children::N256(n) => {
                n.ptrs[byte as usize].store(child, Ordering::Release);
            }
        }
    }

    /// Unlink the child behind a byte, under the node latch. N4/N16 null
    /// the pointer slot; the entry itself is compacted away on the next
    /// rebuild.
    fn remove_child_in_place(&self, byte: u8) {
        match &self.children {
            Children::N4(n) => {
                let count = n.count.load(Ordering::Relaxed) as usize;
                for i in 0..count {
                    if n.keys[i].load(Ordering::Relaxed) == byte
                        && !n.ptrs[i].load(Ordering::Relaxed).is_null()
                    {
                        n.ptrs[i].store(ptr::null_mut(), Ordering::Release);
                        break;
                    }
                }
            }
            Children::N16(n) => {
                let count = n.count.load(Ordering::Relaxed) as usize;
                for i in 0..count {
                    if n.keys[i].load(Ordering::Relaxed) == byte
                        && !n.ptrs[i].load(Ordering::Relaxed).is_null()
                    {
                        n.ptrs[i].store(ptr::null_mut(), Ordering::Release);
                        break;
                    }
                }
            }
            Children::N48(n) => {
                n.child_index[byte as usize].store(N48_EMPTY, Ordering::Release);
            }
            Children::N256(n) => {
                n.ptrs[byte as usize].store(ptr::null_mut(), Ordering::Release);
            }
        }

        self.live_children.fetch_sub(1, Ordering::Release);
    }
}

/// The slot through which the current node is linked.
enum ParentSlot {
    RootSlot,
    Node { node: *mut ArtNode, byte: u8 },
}

pub struct AdaptiveRadixTree {
    root: AtomicPtr<ArtNode>,
    root_latch: NodeLatch,
    loader: Arc<dyn KeyLoader>,
    retirement: Arc<RetirementQueue>,
    unique_keys: bool,
}

// Raw node pointers are reached only through the latch/COW/retirement
// discipline described in the module docs.
unsafe impl Send for AdaptiveRadixTree {}
unsafe impl Sync for AdaptiveRadixTree {}

enum Step {
    Done(bool),
    Descend(*mut ArtNode, u8),
}

impl AdaptiveRadixTree {
    pub fn new(
        loader: Arc<dyn KeyLoader>,
        retirement: Arc<RetirementQueue>,
        unique_keys: bool,
    ) -> Self {
        Self {
            root: AtomicPtr::new(ptr::null_mut()),
            root_latch: NodeLatch::new(),
            loader,
            retirement,
            unique_keys,
        }
    }

    /// Recover the full key of any leaf below `node` through the loader.
    fn load_any_key_below(&self, node: *mut ArtNode) -> Result<Vec<u8>, IndexError> {
        let mut cur = node;

        loop {
            match unsafe { &*cur } {
                ArtNode::Leaf(leaf) => {
                    let values = leaf.values.load(Ordering::Acquire);
                    debug_assert!(!values.is_null(), "linked leaf has no locators");

                    let locator = unsafe { &*values }[0];
                    return Ok(self.loader.load_key(locator)?);
                }
                ArtNode::Internal(internal) => {
                    let children = internal.sorted_children();
                    match children.first() {
                        Some((_, child)) => cur = *child,
                        None => {
                            // Concurrently emptied; retry from the top of
                            // this subtree.
                            std::hint::spin_loop();
                            cur = node;
                        }
                    }
                }
            }
        }
    }

    /// Leaf key through the loader.
    fn leaf_key(&self, leaf: &LeafNode) -> Result<Vec<u8>, IndexError> {
        let values = leaf.values.load(Ordering::Acquire);
        debug_assert!(!values.is_null(), "linked leaf has no locators");

        let locator = unsafe { &*values }[0];
        Ok(self.loader.load_key(locator)?)
    }

    /// The node's full compressed prefix, recovered through the loader
    /// when it exceeds the stored bytes. `depth` is the key offset of
    /// the node.
    fn full_prefix(
        &self,
        node: *mut ArtNode,
        internal: &InternalNode,
        depth: usize,
    ) -> Result<Vec<u8>, IndexError> {
        let len = internal.prefix_len as usize;

        if len <= MAX_PREFIX {
            return Ok(internal.prefix[..len].to_vec());
        }

        let any_key = self.load_any_key_below(node)?;
        Ok(any_key[depth..depth + len].to_vec())
    }

    pub fn insert(&self, key: &[u8], locator: TupleLocator) -> Result<bool, IndexError> {
        self.insert_impl(key, locator, None)
    }

    pub fn conditional_insert(
        &self,
        key: &[u8],
        locator: TupleLocator,
        predicate: &dyn Fn(TupleLocator) -> bool,
    ) -> Result<bool, IndexError> {
        self.insert_impl(key, locator, Some(predicate))
    }

    fn insert_impl(
        &self,
        key: &[u8],
        locator: TupleLocator,
        predicate: Option<&dyn Fn(TupleLocator) -> bool>,
    ) -> Result<bool, IndexError> {
        self.root_latch
            .lock()
            .expect("the root slot latch is never obsolete");

        let root = self.root.load(Ordering::Acquire);
        if root.is_null() {
            self.root.store(alloc_leaf(vec![locator]), Ordering::Release);
            self.root_latch.unlock();
            return Ok(true);
        }

        let mut parent = ParentSlot::RootSlot;
        let mut cur = root;
        let mut depth = 0usize;

        loop {
            let step = match unsafe { &*cur } {
                ArtNode::Leaf(leaf) => {
                    let result = self.write_into_leaf(
                        &parent, cur, leaf, key, depth, locator, predicate,
                    );
                    self.unlock_parent(&parent);
                    return result;
                }
                ArtNode::Internal(internal) => {
                    internal
                        .latch
                        .lock()
                        .expect("a child of a latched parent cannot be replaced");

                    match self.write_into_internal(
                        &parent, cur, internal, key, &mut depth, locator,
                    ) {
                        Ok(Step::Done(inserted)) => {
                            self.unlock_parent(&parent);
                            return Ok(inserted);
                        }
                        Ok(step) => step,
                        Err(error) => {
                            internal.latch.unlock();
                            self.unlock_parent(&parent);
                            return Err(error);
                        }
                    }
                }
            };

            let Step::Descend(child, byte) = step else {
                unreachable!("descend is the only fallthrough")
            };

            // Hand over hand: the new window is (cur, child).
            self.unlock_parent(&parent);
            parent = ParentSlot::Node { node: cur, byte };
            cur = child;
        }
    }

    /// One insert step at a latched internal node. Either finishes the
    /// insert here (prefix split, new leaf, leaf update) or names the
    /// child to descend into. The node stays latched on descend.
    #[allow(clippy::too_many_arguments)]
    fn write_into_internal(
        &self,
        parent: &ParentSlot,
        cur: *mut ArtNode,
        internal: &InternalNode,
        key: &[u8],
        depth: &mut usize,
        locator: TupleLocator,
    ) -> Result<Step, IndexError> {
        let prefix_len = internal.prefix_len as usize;

        if prefix_len > 0 {
            let prefix = self.full_prefix(cur, internal, *depth)?;
            let mismatch = common_prefix(&prefix, &key[*depth..]);

            if mismatch < prefix_len {
                // Split the compressed path: a new parent holds the
                // common part, the old node keeps the tail, the new key
                // becomes a sibling leaf.
                let split = alloc_n4(&prefix[..mismatch]);
                let split_ref = internal_of(split);

                let rebuilt = self.rebuild_with_prefix(internal, &prefix[mismatch + 1..]);

                split_ref.add_child_in_place(prefix[mismatch], rebuilt);
                split_ref.add_child_in_place(
                    key[*depth + mismatch],
                    alloc_leaf(vec![locator]),
                );

                self.store_into_parent(parent, split);
                internal.latch.unlock_obsolete();
                unsafe { self.retire_node(cur) };

                return Ok(Step::Done(true));
            }

            *depth += prefix_len;
        }

        let byte = key[*depth];
        let child = internal.find_child(byte);

        if child.is_null() {
            let leaf = alloc_leaf(vec![locator]);

            if internal.has_room() {
                internal.add_child_in_place(byte, leaf);
                internal.latch.unlock();
            } else {
                let grown = self.grow_with_child(internal, byte, leaf);
                self.store_into_parent(parent, grown);
                internal.latch.unlock_obsolete();
                unsafe { self.retire_node(cur) };
            }

            return Ok(Step::Done(true));
        }

        *depth += 1;
        Ok(Step::Descend(child, byte))
    }

    /// Insert against an existing leaf: push a locator, reject on
    /// uniqueness or predicate, or expand the path lazily. The leaf's
    /// parent node (or the root slot) is latched.
    #[allow(clippy::too_many_arguments)]
    fn write_into_leaf(
        &self,
        parent: &ParentSlot,
        cur: *mut ArtNode,
        leaf: &LeafNode,
        key: &[u8],
        depth: usize,
        locator: TupleLocator,
        predicate: Option<&dyn Fn(TupleLocator) -> bool>,
    ) -> Result<bool, IndexError> {
        let existing_key = self.leaf_key(leaf)?;

        if existing_key == key {
            let values = leaf.values.load(Ordering::Acquire);
            let list = unsafe { &*values };

            if self.unique_keys || list.contains(&locator) {
                return Ok(false);
            }

            if let Some(predicate) = predicate {
                if list.iter().any(|existing| predicate(*existing)) {
                    return Ok(false);
                }
            }

            let mut rebuilt = list.clone();
            rebuilt.push(locator);
            leaf.values
                .store(Box::into_raw(Box::new(rebuilt)), Ordering::Release);

            unsafe { self.retirement.defer_drop(Box::from_raw(values)) };
            return Ok(true);
        }

        // Lazy expansion: hang both leaves under a node compressing
        // their common path.
        let common = common_prefix(&existing_key[depth..], &key[depth..]);

        let expansion = alloc_n4(&key[depth..depth + common]);
        let expansion_ref = internal_of(expansion);

        expansion_ref.add_child_in_place(existing_key[depth + common], cur);
        expansion_ref.add_child_in_place(key[depth + common], alloc_leaf(vec![locator]));

        self.store_into_parent(parent, expansion);
        Ok(true)
    }

    pub fn delete(&self, key: &[u8], locator: TupleLocator) -> Result<bool, IndexError> {
        self.root_latch
            .lock()
            .expect("the root slot latch is never obsolete");

        let root = self.root.load(Ordering::Acquire);
        if root.is_null() {
            self.root_latch.unlock();
            return Ok(false);
        }

        // Root leaf: remove the pair, and the leaf itself when drained.
        if let ArtNode::Leaf(leaf) = unsafe { &*root } {
            let outcome = self.delete_from_leaf(leaf, key, locator, || {
                self.root.store(ptr::null_mut(), Ordering::Release);
                unsafe { self.retire_node(root) };
            });

            self.root_latch.unlock();
            return outcome.map(|removed| !matches!(removed, DeleteOutcome::NotFound));
        }

        let mut parent = ParentSlot::RootSlot;
        let mut cur = root;
        let mut depth = 0usize;

        loop {
            let internal = match unsafe { &*cur } {
                ArtNode::Internal(internal) => internal,
                ArtNode::Leaf(_) => unreachable!("leaves are handled at their parent"),
            };

            internal
                .latch
                .lock()
                .expect("a child of a latched parent cannot be replaced");

            let prefix_len = internal.prefix_len as usize;
            if prefix_len > 0 {
                let prefix = match self.full_prefix(cur, internal, depth) {
                    Ok(prefix) => prefix,
                    Err(error) => {
                        internal.latch.unlock();
                        self.unlock_parent(&parent);
                        return Err(error);
                    }
                };

                if common_prefix(&prefix, &key[depth..]) < prefix_len {
                    internal.latch.unlock();
                    self.unlock_parent(&parent);
                    return Ok(false);
                }

                depth += prefix_len;
            }

            let byte = key[depth];
            let child = internal.find_child(byte);

            if child.is_null() {
                internal.latch.unlock();
                self.unlock_parent(&parent);
                return Ok(false);
            }

            match unsafe { &*child } {
                ArtNode::Internal(_) => {
                    self.unlock_parent(&parent);
                    parent = ParentSlot::Node { node: cur, byte };
                    cur = child;
                    depth += 1;
                }
                ArtNode::Leaf(leaf) => {
                    let outcome = self.delete_from_leaf(leaf, key, locator, || {
                        internal.remove_child_in_place(byte);
                        unsafe { self.retire_node(child) };

                        // A node left with no live children comes off its
                        // own parent as well.
                        if internal.live_children.load(Ordering::Acquire) == 0 {
                            match &parent {
                                ParentSlot::RootSlot => {
                                    self.root.store(ptr::null_mut(), Ordering::Release);
                                }
                                ParentSlot::Node {
                                    node,
                                    byte: parent_byte,
                                } => {
                                    internal_of(*node).remove_child_in_place(*parent_byte);
                                }
                            }

                            internal.latch.unlock_obsolete();
                            unsafe { self.retire_node(cur) };
                            self.unlock_parent(&parent);
                            return;
                        }

                        internal.latch.unlock();
                        self.unlock_parent(&parent);
                    });

                    // The drained-leaf closure already released the
                    // latches; the other outcomes still hold them.
                    match outcome {
                        Ok(DeleteOutcome::DrainedLeaf) => return Ok(true),
                        Ok(DeleteOutcome::Removed) => {
                            internal.latch.unlock();
                            self.unlock_parent(&parent);
                            return Ok(true);
                        }
                        Ok(DeleteOutcome::NotFound) => {
                            internal.latch.unlock();
                            self.unlock_parent(&parent);
                            return Ok(false);
                        }
                        Err(error) => {
                            internal.latch.unlock();
                            self.unlock_parent(&parent);
                            return Err(error);
                        }
                    }
                }
            }
        }
    }

    /// Delete a locator from a leaf's list. `drain` runs instead of a
    /// list swap when the last locator goes; it owns latch release.
    fn delete_from_leaf(
        &self,
        leaf: &LeafNode,
        key: &[u8],
        locator: TupleLocator,
        drain: impl FnOnce(),
    ) -> Result<DeleteOutcome, IndexError> {
        if self.leaf_key(leaf)? != key {
            return Ok(DeleteOutcome::NotFound);
        }

        let values = leaf.values.load(Ordering::Acquire);
        let list = unsafe { &*values };

        let Some(found) = list.iter().position(|l| *l == locator) else {
            return Ok(DeleteOutcome::NotFound);
        };

        if list.len() == 1 {
            drain();
            return Ok(DeleteOutcome::DrainedLeaf);
        }

        let mut rebuilt = list.clone();
        rebuilt.remove(found);
        leaf.values
            .store(Box::into_raw(Box::new(rebuilt)), Ordering::Release);

        unsafe { self.retirement.defer_drop(Box::from_raw(values)) };
        Ok(DeleteOutcome::Removed)
    }

    pub fn scan_key(&self, key: &[u8]) -> Result<Vec<TupleLocator>, IndexError> {
        let mut cur = self.root.load(Ordering::Acquire);
        let mut depth = 0usize;

        loop {
            if cur.is_null() {
                return Ok(Vec::new());
            }

            match unsafe { &*cur } {
                ArtNode::Leaf(leaf) => {
                    // Path compression may have skipped bytes; the
                    // recovered key settles whether this is a true hit.
                    if self.leaf_key(leaf)? != key {
                        return Ok(Vec::new());
                    }

                    let values = leaf.values.load(Ordering::Acquire);
                    return Ok(unsafe { &*values }.clone());
                }
                ArtNode::Internal(internal) => {
                    let prefix_len = internal.prefix_len as usize;

                    if depth + prefix_len >= key.len() {
                        return Ok(Vec::new());
                    }

                    // Compare the stored prefix bytes; any truncated
                    // remainder is verified at the leaf.
                    let stored = prefix_len.min(MAX_PREFIX);
                    if internal.prefix[..stored] != key[depth..depth + stored] {
                        return Ok(Vec::new());
                    }

                    depth += prefix_len;
                    cur = internal.find_child(key[depth]);
                    depth += 1;
                }
            }
        }
    }

    /// Collect `[low, high]` (closed; either side open when `None`) in
    /// ascending key order. `limit` caps the number of locators; when it
    /// stops the scan early the key to resume from comes back as well.
    pub fn collect_range(
        &self,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        resume: Option<&[u8]>,
        limit: usize,
        filter: LocatorFilter<'_>,
    ) -> Result<(Vec<TupleLocator>, Option<Vec<u8>>), IndexError> {
        // A resume key from a previous bounded scan tightens the low
        // bound.
        let low = match (resume, low) {
            (Some(resume), Some(low)) if resume > low => Some(resume),
            (Some(resume), None) => Some(resume),
            (_, low) => low,
        };

        let mut out = Vec::new();
        let mut continue_key = None;
        let mut path = Vec::new();

        self.visit(
            self.root.load(Ordering::Acquire),
            &mut path,
            true,
            low,
            high,
            limit,
            filter,
            &mut out,
            &mut continue_key,
        )?;

        Ok((out, continue_key))
    }

    /// DFS over a point-in-time snapshot. `exact` tracks whether `path`
    /// holds the true key bytes so far; a truncated prefix drops to
    /// inexact mode where every leaf is verified through the loader.
    /// Returns false to stop the walk (limit reached).
    #[allow(clippy::too_many_arguments)]
    fn visit(
        &self,
        node: *mut ArtNode,
        path: &mut Vec<u8>,
        exact: bool,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        limit: usize,
        filter: LocatorFilter<'_>,
        out: &mut Vec<TupleLocator>,
        continue_key: &mut Option<Vec<u8>>,
    ) -> Result<bool, IndexError> {
        if node.is_null() {
            return Ok(true);
        }

        match unsafe { &*node } {
            ArtNode::Leaf(leaf) => {
                let key = self.leaf_key(leaf)?;

                if let Some(low) = low {
                    if key.as_slice() < low {
                        return Ok(true);
                    }
                }
                if let Some(high) = high {
                    if key.as_slice() > high {
                        return Ok(true);
                    }
                }

                if out.len() >= limit {
                    *continue_key = Some(key);
                    return Ok(false);
                }

                let values = leaf.values.load(Ordering::Acquire);
                let list = unsafe { &*values };

                match filter {
                    Some(accept) => out.extend(list.iter().copied().filter(|l| accept(*l))),
                    None => out.extend_from_slice(list),
                }

                Ok(true)
            }
            ArtNode::Internal(internal) => {
                let prefix_len = internal.prefix_len as usize;
                let stored = prefix_len.min(MAX_PREFIX);

                let exact = exact && prefix_len <= MAX_PREFIX;
                let before = path.len();
                path.extend_from_slice(&internal.prefix[..stored]);

                for (byte, child) in internal.sorted_children() {
                    path.push(byte);

                    let mut descend = true;
                    if exact {
                        let p = path.len();

                        if let Some(high) = high {
                            if path.as_slice() > &high[..p.min(high.len())] {
                                // Children are sorted; everything later
                                // is larger still.
                                path.pop();
                                break;
                            }
                        }

                        if let Some(low) = low {
                            if path.as_slice() < &low[..p.min(low.len())] {
                                descend = false;
                            }
                        }
                    }

                    if descend
                        && !self.visit(
                            child,
                            path,
                            exact,
                            low,
                            high,
                            limit,
                            filter,
                            out,
                            continue_key,
                        )?
                    {
                        path.truncate(before);
                        return Ok(false);
                    }

                    path.pop();
                }

                path.truncate(before);
                Ok(true)
            }
        }
    }

    fn unlock_parent(&self, parent: &ParentSlot) {
        match parent {
            ParentSlot::RootSlot => self.root_latch.unlock(),
            ParentSlot::Node { node, .. } => internal_of(*node).latch.unlock(),
        }
    }

    fn store_into_parent(&self, parent: &ParentSlot, child: *mut ArtNode) {
        match parent {
            ParentSlot::RootSlot => self.root.store(child, Ordering::Release),
            ParentSlot::Node { node, byte } => internal_of(*node).replace_child(*byte, child),
        }
    }

    /// Copy a latched node with a different compressed prefix.
    fn rebuild_with_prefix(&self, internal: &InternalNode, prefix: &[u8]) -> *mut ArtNode {
        let mut stored = [0u8; MAX_PREFIX];
        let stored_len = prefix.len().min(MAX_PREFIX);
        stored[..stored_len].copy_from_slice(&prefix[..stored_len]);

        let children = internal.sorted_children();
        let rebuilt = match &internal.children {
            Children::N4(_) => Children::N4(N4 {
                keys: zero_bytes(),
                ptrs: null_ptrs(),
                count: AtomicU8::new(0),
            }),
            Children::N16(_) => Children::N16(N16 {
                keys: zero_bytes(),
                ptrs: null_ptrs(),
                count: AtomicU8::new(0),
            }),
            Children::N48(_) => Children::N48(N48 {
                child_index: std::array::from_fn(|_| AtomicU8::new(N48_EMPTY)),
                ptrs: null_ptrs(),
                count: AtomicU8::new(0),
            }),
            Children::N256(_) => Children::N256(N256 { ptrs: null_ptrs() }),
        };

        let node = Box::into_raw(Box::new(ArtNode::Internal(InternalNode {
            latch: NodeLatch::new(),
            prefix_len: prefix.len() as u16,
            prefix: stored,
            live_children: AtomicU16::new(0),
            children: rebuilt,
        })));

        let node_ref = internal_of(node);
        for (byte, child) in children {
            node_ref.add_child_in_place(byte, child);
        }

        node
    }

    /// Copy a full latched node into the next wider variant, with one
    /// extra child.
    fn grow_with_child(
        &self,
        internal: &InternalNode,
        byte: u8,
        child: *mut ArtNode,
    ) -> *mut ArtNode {
        let grown_children = match &internal.children {
            Children::N4(_) => Children::N16(N16 {
                keys: zero_bytes(),
                ptrs: null_ptrs(),
                count: AtomicU8::new(0),
            }),
            Children::N16(_) => Children::N48(N48 {
                child_index: std::array::from_fn(|_| AtomicU8::new(N48_EMPTY)),
                ptrs: null_ptrs(),
                count: AtomicU8::new(0),
            }),
            Children::N48(_) | Children::N256(_) => Children::N256(N256 { ptrs: null_ptrs() }),
        };

        let node = Box::into_raw(Box::new(ArtNode::Internal(InternalNode {
            latch: NodeLatch::new(),
            prefix_len: internal.prefix_len,
            prefix: internal.prefix,
            live_children: AtomicU16::new(0),
            children: grown_children,
        })));

        let node_ref = internal_of(node);
        for (existing_byte, existing_child) in internal.sorted_children() {
            node_ref.add_child_in_place(existing_byte, existing_child);
        }
        node_ref.add_child_in_place(byte, child);

        node
    }

    unsafe fn retire_node(&self, node: *mut ArtNode) {
        self.retirement.defer_drop(RetiredArtNode(node));
    }
}

enum DeleteOutcome {
    Removed,
    DrainedLeaf,
    NotFound,
}

/// Shallow retirement wrapper: dropping a retired node must not touch
/// its children, they are either still linked or retired separately.
struct RetiredArtNode(*mut ArtNode);

unsafe impl Send for RetiredArtNode {}

impl Drop for RetiredArtNode {
    fn drop(&mut self) {
        unsafe { drop(Box::from_raw(self.0)) };
    }
}

fn internal_of<'a>(node: *mut ArtNode) -> &'a InternalNode {
    match unsafe { &*node } {
        ArtNode::Internal(internal) => internal,
        ArtNode::Leaf(_) => unreachable!("expected an internal node"),
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

unsafe fn free_subtree(node: *mut ArtNode) {
    if node.is_null() {
        return;
    }

    if let ArtNode::Internal(internal) = &*node {
        for (_, child) in internal.sorted_children() {
            free_subtree(child);
        }
    }

    drop(Box::from_raw(node));
}

impl Drop for AdaptiveRadixTree {
    fn drop(&mut self) {
        unsafe { free_subtree(*self.root.get_mut()) }
    }
}

/// The `radix_art` realization of the index contract.
pub struct ArtIndex {
    metadata: Arc<IndexMetadata>,
    counters: IndexCounters,
    tree: AdaptiveRadixTree,
}

impl ArtIndex {
    pub fn new(
        metadata: Arc<IndexMetadata>,
        retirement: Arc<RetirementQueue>,
        loader: Arc<dyn KeyLoader>,
    ) -> Self {
        let unique_keys = metadata.unique_keys;

        Self {
            metadata,
            counters: IndexCounters::default(),
            tree: AdaptiveRadixTree::new(loader, retirement, unique_keys),
        }
    }

    /// Bounded range scan: collect at most `limit` locators from
    /// `[low, high]`, resuming after a previous scan's continue key.
    /// Returns the locators, the actual count, and the key to resume
    /// from when the limit cut the scan short.
    pub fn scan_range_bounded(
        &self,
        low: &Tuple,
        high: &Tuple,
        resume: Option<&[u8]>,
        limit: usize,
    ) -> Result<(Vec<TupleLocator>, usize, Option<Vec<u8>>), IndexError> {
        let low = codec::encode_tuple(low)?;
        let high = codec::encode_tuple(high)?;
        self.counters.record_lookup();

        let (out, continue_key) = self.tree.collect_range(
            Some(low.as_slice()),
            Some(high.as_slice()),
            resume,
            limit,
            None,
        )?;
        let actual = out.len();

        Ok((out, actual, continue_key))
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

impl RowIndex for ArtIndex {
    fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    fn insert(&self, key: &Tuple, locator: TupleLocator) -> Result<bool, IndexError> {
        let key = codec::encode_tuple(key)?;
        self.counters.record_insert();
        self.tree.insert(&key, locator)
    }

    fn delete(&self, key: &Tuple, locator: TupleLocator) -> Result<bool, IndexError> {
        let key = codec::encode_tuple(key)?;
        self.counters.record_delete();
        self.tree.delete(&key, locator)
    }

    fn conditional_insert(
        &self,
        key: &Tuple,
        locator: TupleLocator,
        predicate: &dyn Fn(TupleLocator) -> bool,
    ) -> Result<bool, IndexError> {
        let key = codec::encode_tuple(key)?;
        self.counters.record_insert();
        self.tree.conditional_insert(&key, locator, predicate)
    }

    fn scan_key(&self, key: &Tuple) -> Result<Vec<TupleLocator>, IndexError> {
        let key = codec::encode_tuple(key)?;
        self.counters.record_lookup();
        self.tree.scan_key(&key)
    }

    fn scan_range(
        &self,
        low: &Tuple,
        high: &Tuple,
        direction: ScanDirection,
        filter: LocatorFilter<'_>,
    ) -> Result<Vec<TupleLocator>, IndexError> {
        let low = codec::encode_tuple(low)?;
        let high = codec::encode_tuple(high)?;
        self.counters.record_lookup();

        let (out, _) = self.tree.collect_range(
            Some(low.as_slice()),
            Some(high.as_slice()),
            None,
            usize::MAX,
            filter,
        )?;

        Ok(self.ordered(out, direction))
    }

    fn scan_all(&self, direction: ScanDirection) -> Result<Vec<TupleLocator>, IndexError> {
        self.counters.record_lookup();

        let (out, _) = self
            .tree
            .collect_range(None, None, None, usize::MAX, None)?;

        Ok(self.ordered(out, direction))
    }

    fn scan_from(&self, low: &Tuple) -> Result<Vec<TupleLocator>, IndexError> {
        let low = codec::encode_tuple(low)?;
        self.counters.record_lookup();

        let (out, _) =
            self.tree
                .collect_range(Some(low.as_slice()), None, None, usize::MAX, None)?;

        Ok(out)
    }

    fn stats(&self) -> IndexStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tephra_core::codec::KeyCodecError;
    use tephra_epoch::EpochManager;

    /// Test loader: a locator -> key-bytes map standing in for the
    /// storage layer.
    #[derive(Default)]
    struct MapLoader {
        rows: Mutex<HashMap<TupleLocator, Vec<u8>>>,
    }

    impl MapLoader {
        fn register(&self, locator: TupleLocator, key: Vec<u8>) {
            self.rows.lock().unwrap().insert(locator, key);
        }
    }

    impl KeyLoader for MapLoader {
        fn load_key(&self, locator: TupleLocator) -> Result<Vec<u8>, KeyCodecError> {
            self.rows
                .lock()
                .unwrap()
                .get(&locator)
                .cloned()
                .ok_or(KeyCodecError::RowUnavailable(locator))
        }
    }

    struct Fixture {
        tree: AdaptiveRadixTree,
        loader: Arc<MapLoader>,
    }

    fn fixture(unique: bool) -> Fixture {
        let manager = EpochManager::new(64);
        let queue = RetirementQueue::new(manager);
        let loader = Arc::new(MapLoader::default());

        Fixture {
            tree: AdaptiveRadixTree::new(loader.clone(), queue, unique),
            loader,
        }
    }

    fn key(n: u64) -> Vec<u8> {
        n.to_be_bytes().to_vec()
    }

    fn loc(n: u32) -> TupleLocator {
        TupleLocator::new(n, 0)
    }

    impl Fixture {
        fn insert(&self, n: u64, l: u32) -> bool {
            self.loader.register(loc(l), key(n));
            self.tree.insert(&key(n), loc(l)).unwrap()
        }
    }

    #[test]
    fn point_lookups_after_lazy_expansion() {
        let f = fixture(false);

        assert!(f.insert(0x0101, 1));
        assert!(f.insert(0x0102, 2));
        assert!(f.insert(0xff00_0000_0000_0000, 3));

        assert_eq!(f.tree.scan_key(&key(0x0101)).unwrap(), vec![loc(1)]);
        assert_eq!(f.tree.scan_key(&key(0x0102)).unwrap(), vec![loc(2)]);
        assert_eq!(
            f.tree.scan_key(&key(0xff00_0000_0000_0000)).unwrap(),
            vec![loc(3)]
        );
        assert!(f.tree.scan_key(&key(0x0103)).unwrap().is_empty());
    }

    #[test]
    fn duplicates_and_unique_mode() {
        let f = fixture(false);

        assert!(f.insert(7, 1));
        assert!(f.insert(7, 2));
        assert!(!f.insert(7, 2));

        let mut found = f.tree.scan_key(&key(7)).unwrap();
        found.sort();
        assert_eq!(found, vec![loc(1), loc(2)]);

        let unique = fixture(true);
        assert!(unique.insert(7, 1));
        assert!(!unique.insert(7, 2));
    }

    #[test]
    fn node_growth_keeps_all_children() {
        let f = fixture(false);

        // 300 distinct first bytes is impossible; instead spread over
        // two byte positions to force N4 -> N16 -> N48 -> N256 growth.
        for n in 0..300u64 {
            assert!(f.insert(n, n as u32), "insert {n}");
        }

        for n in 0..300u64 {
            assert_eq!(f.tree.scan_key(&key(n)).unwrap(), vec![loc(n as u32)]);
        }
    }

    #[test]
    fn range_scans_are_ordered_and_bounded() {
        let f = fixture(false);

        for n in (0..500u64).rev() {
            f.insert(n, n as u32);
        }

        let (low, high) = (key(100), key(120));
        let (out, cont) = f
            .tree
            .collect_range(
                Some(low.as_slice()),
                Some(high.as_slice()),
                None,
                usize::MAX,
                None,
            )
            .unwrap();

        assert!(cont.is_none());
        assert_eq!(out, (100..=120).map(|n| loc(n as u32)).collect::<Vec<_>>());
    }

    #[test]
    fn bounded_scan_reports_resume_key() {
        let f = fixture(false);

        for n in 0..100u64 {
            f.insert(n, n as u32);
        }

        let (low, high) = (key(0), key(99));
        let (first, cont) = f
            .tree
            .collect_range(Some(low.as_slice()), Some(high.as_slice()), None, 10, None)
            .unwrap();

        assert_eq!(first.len(), 10);
        let cont = cont.expect("limit cut the scan short");
        assert_eq!(cont, key(10));

        // Resuming from the continue key yields the remainder.
        let (rest, cont2) = f
            .tree
            .collect_range(
                Some(low.as_slice()),
                Some(high.as_slice()),
                Some(cont.as_slice()),
                usize::MAX,
                None,
            )
            .unwrap();

        assert!(cont2.is_none());
        assert_eq!(rest.len(), 90);
        assert_eq!(rest[0], loc(10));
    }

    #[test]
    fn delete_prunes_leaves_and_empty_nodes() {
        let f = fixture(false);

        for n in 0..50u64 {
            f.insert(n, n as u32);
        }

        for n in 0..50u64 {
            assert!(f.tree.delete(&key(n), loc(n as u32)).unwrap(), "delete {n}");
            assert!(!f.tree.delete(&key(n), loc(n as u32)).unwrap());
        }

        let (out, _) = f
            .tree
            .collect_range(None, None, None, usize::MAX, None)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn delete_removes_only_the_exact_pair() {
        let f = fixture(false);

        f.insert(5, 1);
        f.insert(5, 2);

        assert!(!f.tree.delete(&key(5), loc(3)).unwrap());
        assert!(f.tree.delete(&key(5), loc(1)).unwrap());
        assert_eq!(f.tree.scan_key(&key(5)).unwrap(), vec![loc(2)]);
    }

    #[test]
    fn conditional_insert_checks_existing_locators() {
        let f = fixture(false);

        f.loader.register(loc(1), key(9));
        f.loader.register(loc(2), key(9));
        f.loader.register(loc(3), key(9));

        assert!(f.tree.conditional_insert(&key(9), loc(1), &|_| false).unwrap());
        assert!(!f
            .tree
            .conditional_insert(&key(9), loc(2), &|l| l == loc(1))
            .unwrap());
        assert!(f
            .tree
            .conditional_insert(&key(9), loc(3), &|l| l == loc(42))
            .unwrap());
    }

    #[test]
    fn concurrent_inserts_converge() {
        let f = fixture(false);
        let tree = &f.tree;
        let loader = &f.loader;

        std::thread::scope(|scope| {
            for t in 0..4u64 {
                scope.spawn(move || {
                    for n in 0..500u64 {
                        let k = t * 500 + n;
                        loader.register(loc(k as u32), key(k));
                        assert!(tree.insert(&key(k), loc(k as u32)).unwrap());
                    }
                });
            }
        });

        let (out, _) = tree
            .collect_range(None, None, None, usize::MAX, None)
            .unwrap();
        assert_eq!(out.len(), 2000);

        for k in 0..2000u64 {
            assert_eq!(tree.scan_key(&key(k)).unwrap(), vec![loc(k as u32)]);
        }
    }
}
