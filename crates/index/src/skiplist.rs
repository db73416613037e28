//! Ordered skip list index.
//!
//! A classic CAS-linked skip list with two twists that keep it honest
//! without stolen pointer bits:
//!
//!  - A node's liveness lives in its `values` pointer: non-null means
//!    active, null means logically deleted. The locator list behind the
//!    pointer is immutable; same-key mutations swap in a rebuilt list and
//!    retire the old one, so the swap is the linearization point and a
//!    racing push can never be silently dropped by a delete.
//!  - Unlinking freezes the dying node's tower by swapping each forward
//!    pointer to a tree-wide `dead` sentinel address. The swap returns
//!    the latest successor (including one linked in by a racing insert),
//!    and any CAS still targeting the frozen pointer fails and restarts.
//!
//! Readers never block: they chase acquire-loaded forward pointers, skip
//! logically deleted nodes, and restart the walk on the rare frozen
//! pointer. Retired nodes stay readable until the epoch queue frees them.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use tephra_core::{
    IndexCounters, IndexError, IndexKey, IndexMetadata, IndexStats, LocatorFilter, RowIndex,
    ScanDirection, Tuple, TupleLocator,
};
use tephra_epoch::RetirementQueue;

const MAX_LEVEL: usize = 16;

type LocatorList = Vec<TupleLocator>;

struct SkipNode<K> {
    key: K,
    /// Null once the node is logically deleted.
    values: AtomicPtr<LocatorList>,
    /// Forward pointers, one per level.
    tower: Vec<AtomicPtr<SkipNode<K>>>,
}

impl<K> SkipNode<K> {
    fn height(&self) -> usize {
        self.tower.len()
    }
}

impl<K> Drop for SkipNode<K> {
    fn drop(&mut self) {
        let values = *self.values.get_mut();
        if !values.is_null() {
            unsafe { drop(Box::from_raw(values)) };
        }
    }
}

fn alloc_node<K>(key: K, values: Option<LocatorList>, height: usize) -> *mut SkipNode<K> {
    let values = match values {
        Some(list) => Box::into_raw(Box::new(list)),
        None => ptr::null_mut(),
    };

    Box::into_raw(Box::new(SkipNode {
        key,
        values: AtomicPtr::new(values),
        tower: (0..height).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
    }))
}

pub(crate) struct SkipList<K: IndexKey> {
    head: *mut SkipNode<K>,
    /// Sentinel address marking frozen forward pointers; never
    /// dereferenced, compared by address only.
    dead: *mut SkipNode<K>,
    retirement: Arc<RetirementQueue>,
    unique_keys: bool,
    seed: AtomicU64,
}

// Raw pointers are only reached through the CAS discipline above; the
// sentinels are immutable and nodes are epoch-protected.
unsafe impl<K: IndexKey> Send for SkipList<K> {}
unsafe impl<K: IndexKey> Sync for SkipList<K> {}

impl<K: IndexKey> SkipList<K> {
    pub(crate) fn new(retirement: Arc<RetirementQueue>, unique_keys: bool) -> Self {
        let sentinel_key = || K::from_bytes(&[]).expect("empty key bytes always fit");

        Self {
            head: alloc_node(sentinel_key(), None, MAX_LEVEL),
            dead: alloc_node(sentinel_key(), None, 0),
            retirement,
            unique_keys,
            seed: AtomicU64::new(0x9E37_79B9_7F4A_7C15),
        }
    }

    fn random_height(&self) -> usize {
        // splitmix64 over a shared counter; no external RNG needed for a
        // p = 1/2 level distribution.
        let mut x = self.seed.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
        x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        x ^= x >> 31;

        let mut height = 1;
        while x & 1 == 1 && height < MAX_LEVEL {
            height += 1;
            x >>= 1;
        }
        height
    }

    /// Predecessors and successors per level for `key`; `succs[0]` is the
    /// first node with key >= `key`, or null.
    fn find_position(
        &self,
        key: &K,
    ) -> ([*mut SkipNode<K>; MAX_LEVEL], [*mut SkipNode<K>; MAX_LEVEL]) {
        'retry: loop {
            let mut preds = [self.head; MAX_LEVEL];
            let mut succs = [ptr::null_mut(); MAX_LEVEL];

            let mut pred = self.head;
            for level in (0..MAX_LEVEL).rev() {
                loop {
                    let next = unsafe { &*pred }.tower[level].load(Ordering::Acquire);

                    if next == self.dead {
                        // pred is being unlinked under us.
                        continue 'retry;
                    }

                    if next.is_null() || unsafe { &*next }.key >= *key {
                        preds[level] = pred;
                        succs[level] = next;
                        break;
                    }

                    pred = next;
                }
            }

            return (preds, succs);
        }
    }

    /// First active node with exactly this key, walking the level-0 chain
    /// across any same-key transients. Ok(None) when absent; Err when a
    /// frozen pointer forces a retry.
    fn find_active(&self, start: *mut SkipNode<K>, key: &K) -> Result<Option<*mut SkipNode<K>>, ()> {
        let mut cur = start;

        loop {
            if cur.is_null() {
                return Ok(None);
            }

            let node = unsafe { &*cur };
            if node.key != *key {
                return Ok(None);
            }

            if !node.values.load(Ordering::Acquire).is_null() {
                return Ok(Some(cur));
            }

            let next = node.tower[0].load(Ordering::Acquire);
            if next == self.dead {
                return Err(());
            }
            cur = next;
        }
    }

    /// Swap a rebuilt locator list into an active node.
    ///
    /// `None` means the node died first and the caller must restart.
    fn push_locator(
        &self,
        node: &SkipNode<K>,
        locator: TupleLocator,
        predicate: Option<&dyn Fn(TupleLocator) -> bool>,
    ) -> Option<bool> {
        loop {
            let cur = node.values.load(Ordering::Acquire);
            if cur.is_null() {
                return None;
            }

            let list = unsafe { &*cur };

            if self.unique_keys || list.contains(&locator) {
                return Some(false);
            }

            if let Some(predicate) = predicate {
                if list.iter().any(|existing| predicate(*existing)) {
                    return Some(false);
                }
            }

            let mut rebuilt = list.clone();
            rebuilt.push(locator);
            let rebuilt = Box::into_raw(Box::new(rebuilt));

            if node
                .values
                .compare_exchange(cur, rebuilt, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                unsafe { self.retirement.defer_drop(Box::from_raw(cur)) };
                return Some(true);
            }

            // Lost the race; the rebuilt list was never published.
            unsafe { drop(Box::from_raw(rebuilt)) };
        }
    }

    fn insert_with(
        &self,
        key: K,
        locator: TupleLocator,
        predicate: Option<&dyn Fn(TupleLocator) -> bool>,
    ) -> bool {
        loop {
            let (preds, succs) = self.find_position(&key);

            match self.find_active(succs[0], &key) {
                Err(()) => continue,
                Ok(Some(existing)) => {
                    match self.push_locator(unsafe { &*existing }, locator, predicate) {
                        Some(result) => return result,
                        None => continue,
                    }
                }
                Ok(None) => {}
            }

            let height = self.random_height();
            let node = alloc_node(key.clone(), Some(vec![locator]), height);

            // Level 0 makes the node reachable; the CAS fails if anything
            // moved and the whole find restarts.
            unsafe { &*node }.tower[0].store(succs[0], Ordering::Relaxed);

            let pred = unsafe { &*preds[0] };
            if pred.tower[0]
                .compare_exchange(succs[0], node, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                unsafe { drop(Box::from_raw(node)) };
                continue;
            }

            self.link_upper_levels(node, height, &key);
            return true;
        }
    }

    /// Best-effort upper-level linking. A concurrent delete freezes the
    /// node's tower; the failed CAS on our own forward pointer tells us
    /// to stop.
    fn link_upper_levels(&self, node: *mut SkipNode<K>, height: usize, key: &K) {
        for level in 1..height {
            let mut expected = ptr::null_mut();

            loop {
                let (preds, succs) = self.find_position(key);
                let succ = succs[level];

                if unsafe { &*node }.tower[level]
                    .compare_exchange(expected, succ, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Frozen mid-insert: the node was deleted already.
                    return;
                }
                expected = succ;

                let pred = unsafe { &*preds[level] };
                if pred.tower[level]
                    .compare_exchange(succ, node, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
        }
    }

    pub(crate) fn insert(&self, key: K, locator: TupleLocator) -> bool {
        self.insert_with(key, locator, None)
    }

    pub(crate) fn conditional_insert(
        &self,
        key: K,
        locator: TupleLocator,
        predicate: &dyn Fn(TupleLocator) -> bool,
    ) -> bool {
        self.insert_with(key, locator, Some(predicate))
    }

    pub(crate) fn delete(&self, key: &K, locator: TupleLocator) -> bool {
        'retry: loop {
            let (_, succs) = self.find_position(key);
            let mut cur = succs[0];

            // Check every same-key node; transient duplicates can hold
            // the pair we are after.
            loop {
                if cur.is_null() {
                    return false;
                }

                let node = unsafe { &*cur };
                if node.key != *key {
                    return false;
                }

                let values = node.values.load(Ordering::Acquire);
                if !values.is_null() {
                    let list = unsafe { &*values };

                    if let Some(found) = list.iter().position(|l| *l == locator) {
                        if list.len() > 1 {
                            let mut rebuilt = list.clone();
                            rebuilt.remove(found);
                            let rebuilt = Box::into_raw(Box::new(rebuilt));

                            if node
                                .values
                                .compare_exchange(
                                    values,
                                    rebuilt,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                )
                                .is_ok()
                            {
                                unsafe { self.retirement.defer_drop(Box::from_raw(values)) };
                                return true;
                            }

                            unsafe { drop(Box::from_raw(rebuilt)) };
                            continue 'retry;
                        }

                        // Last locator: the null swap is the logical
                        // delete.
                        if node
                            .values
                            .compare_exchange(
                                values,
                                ptr::null_mut(),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            unsafe { self.retirement.defer_drop(Box::from_raw(values)) };
                            self.unlink(cur, key);
                            return true;
                        }

                        continue 'retry;
                    }
                }

                let next = node.tower[0].load(Ordering::Acquire);
                if next == self.dead {
                    continue 'retry;
                }
                cur = next;
            }
        }
    }

    /// Physically unlink a logically deleted node and retire it. Only the
    /// thread that won the null swap gets here.
    fn unlink(&self, node: *mut SkipNode<K>, key: &K) {
        let height = unsafe { &*node }.height();

        for level in (0..height).rev() {
            // Freeze: any racing CAS on this pointer now fails, and the
            // swap hands us the latest successor.
            let succ = unsafe { &*node }.tower[level].swap(self.dead, Ordering::AcqRel);
            debug_assert!(succ != self.dead, "tower frozen twice");

            if succ.is_null() && level > 0 {
                // Never linked at this level.
                continue;
            }

            loop {
                match self.find_pred_of(level, node, key) {
                    Some(pred) => {
                        if unsafe { &*pred }.tower[level]
                            .compare_exchange(node, succ, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            break;
                        }
                    }
                    // Not (or no longer) linked at this level.
                    None => break,
                }
            }
        }

        unsafe { self.retirement.defer_drop(Box::from_raw(node)) };
    }

    /// The node whose level-`level` forward pointer targets `node`.
    fn find_pred_of(
        &self,
        level: usize,
        node: *mut SkipNode<K>,
        key: &K,
    ) -> Option<*mut SkipNode<K>> {
        'retry: loop {
            let mut cur = self.head;

            loop {
                let next = unsafe { &*cur }.tower[level].load(Ordering::Acquire);

                if next == self.dead {
                    continue 'retry;
                }

                if next.is_null() {
                    return None;
                }

                if next == node {
                    return Some(cur);
                }

                if unsafe { &*next }.key > *key {
                    return None;
                }

                cur = next;
            }
        }
    }

    pub(crate) fn scan_key(&self, key: &K) -> Vec<TupleLocator> {
        'retry: loop {
            let (_, succs) = self.find_position(key);

            let mut out = Vec::new();
            let mut cur = succs[0];

            loop {
                if cur.is_null() {
                    return out;
                }

                let node = unsafe { &*cur };
                if node.key != *key {
                    return out;
                }

                let values = node.values.load(Ordering::Acquire);
                if !values.is_null() {
                    out.extend_from_slice(unsafe { &*values });
                }

                let next = node.tower[0].load(Ordering::Acquire);
                if next == self.dead {
                    continue 'retry;
                }
                cur = next;
            }
        }
    }

    /// Ascending collection of `[low, high]`, either side open.
    pub(crate) fn collect_range(
        &self,
        low: Option<&K>,
        high: Option<&K>,
        filter: LocatorFilter<'_>,
        out: &mut Vec<TupleLocator>,
    ) {
        'retry: loop {
            out.clear();

            let mut cur = match low {
                Some(low) => self.find_position(low).1[0],
                None => unsafe { &*self.head }.tower[0].load(Ordering::Acquire),
            };

            loop {
                if cur.is_null() || cur == self.dead {
                    if cur == self.dead {
                        continue 'retry;
                    }
                    return;
                }

                let node = unsafe { &*cur };

                if let Some(high) = high {
                    if node.key > *high {
                        return;
                    }
                }

                let values = node.values.load(Ordering::Acquire);
                if !values.is_null() {
                    let list = unsafe { &*values };
                    match filter {
                        Some(accept) => {
                            out.extend(list.iter().copied().filter(|l| accept(*l)))
                        }
                        None => out.extend_from_slice(list),
                    }
                }

                cur = node.tower[0].load(Ordering::Acquire);
            }
        }
    }
}

impl<K: IndexKey> Drop for SkipList<K> {
    fn drop(&mut self) {
        // Exclusive access: no frozen pointers can be reachable once all
        // writers have quiesced.
        unsafe {
            let mut cur = (&(*self.head).tower)[0].load(Ordering::Relaxed);
            while !cur.is_null() {
                let next = (&(*cur).tower)[0].load(Ordering::Relaxed);
                drop(Box::from_raw(cur));
                cur = next;
            }

            drop(Box::from_raw(self.head));
            drop(Box::from_raw(self.dead));
        }
    }
}

/// The `ordered_skiplist` realization of the index contract.
pub struct SkipListIndex<K: IndexKey> {
    metadata: Arc<IndexMetadata>,
    counters: IndexCounters,
    list: SkipList<K>,
}

impl<K: IndexKey> SkipListIndex<K> {
    pub fn new(metadata: Arc<IndexMetadata>, retirement: Arc<RetirementQueue>) -> Self {
        let unique_keys = metadata.unique_keys;

        Self {
            metadata,
            counters: IndexCounters::default(),
            list: SkipList::new(retirement, unique_keys),
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

impl<K: IndexKey> RowIndex for SkipListIndex<K> {
    fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    fn insert(&self, key: &Tuple, locator: TupleLocator) -> Result<bool, IndexError> {
        let key = K::from_tuple(key)?;
        self.counters.record_insert();
        Ok(self.list.insert(key, locator))
    }

    fn delete(&self, key: &Tuple, locator: TupleLocator) -> Result<bool, IndexError> {
        let key = K::from_tuple(key)?;
        self.counters.record_delete();
        Ok(self.list.delete(&key, locator))
    }

    fn conditional_insert(
        &self,
        key: &Tuple,
        locator: TupleLocator,
        predicate: &dyn Fn(TupleLocator) -> bool,
    ) -> Result<bool, IndexError> {
        let key = K::from_tuple(key)?;
        self.counters.record_insert();
        Ok(self.list.conditional_insert(key, locator, predicate))
    }

    fn scan_key(&self, key: &Tuple) -> Result<Vec<TupleLocator>, IndexError> {
        let key = K::from_tuple(key)?;
        self.counters.record_lookup();
        Ok(self.list.scan_key(&key))
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
        self.list.collect_range(Some(&low), Some(&high), filter, &mut out);

        Ok(self.ordered(out, direction))
    }

    fn scan_all(&self, direction: ScanDirection) -> Result<Vec<TupleLocator>, IndexError> {
        self.counters.record_lookup();

        let mut out = Vec::new();
        self.list.collect_range(None, None, None, &mut out);

        Ok(self.ordered(out, direction))
    }

    fn scan_from(&self, low: &Tuple) -> Result<Vec<TupleLocator>, IndexError> {
        let low = K::from_tuple(low)?;
        self.counters.record_lookup();

        let mut out = Vec::new();
        self.list.collect_range(Some(&low), None, None, &mut out);

        Ok(out)
    }

    fn stats(&self) -> IndexStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tephra_core::TupleKey;
    use tephra_epoch::EpochManager;

    fn test_list(unique: bool) -> (SkipList<TupleKey>, Arc<RetirementQueue>) {
        let manager = EpochManager::new(64);
        let queue = RetirementQueue::new(manager);
        (SkipList::new(queue.clone(), unique), queue)
    }

    fn key(n: u32) -> TupleKey {
        TupleKey::from_bytes(&n.to_be_bytes()).unwrap()
    }

    fn loc(n: u32) -> TupleLocator {
        TupleLocator::new(n, 0)
    }

    #[test]
    fn insert_scan_delete_roundtrip() {
        let (list, _queue) = test_list(false);

        assert!(list.insert(key(3), loc(3)));
        assert!(list.insert(key(1), loc(1)));
        assert!(list.insert(key(2), loc(2)));

        assert_eq!(list.scan_key(&key(2)), vec![loc(2)]);

        let mut out = Vec::new();
        list.collect_range(None, None, None, &mut out);
        assert_eq!(out, vec![loc(1), loc(2), loc(3)]);

        assert!(list.delete(&key(2), loc(2)));
        assert!(!list.delete(&key(2), loc(2)));
        assert!(list.scan_key(&key(2)).is_empty());
    }

    #[test]
    fn duplicates_share_one_key() {
        let (list, _queue) = test_list(false);

        assert!(list.insert(key(5), loc(1)));
        assert!(list.insert(key(5), loc(2)));
        assert!(!list.insert(key(5), loc(2)));

        let mut found = list.scan_key(&key(5));
        found.sort();
        assert_eq!(found, vec![loc(1), loc(2)]);

        assert!(list.delete(&key(5), loc(1)));
        assert_eq!(list.scan_key(&key(5)), vec![loc(2)]);
    }

    #[test]
    fn unique_list_rejects_second_key() {
        let (list, _queue) = test_list(true);

        assert!(list.insert(key(9), loc(1)));
        assert!(!list.insert(key(9), loc(2)));
    }

    #[test]
    fn range_scan_is_sorted_and_bounded() {
        let (list, _queue) = test_list(false);

        for n in (0..200u32).rev() {
            list.insert(key(n), loc(n));
        }

        let mut out = Vec::new();
        list.collect_range(Some(&key(50)), Some(&key(60)), None, &mut out);
        assert_eq!(out, (50..=60).map(loc).collect::<Vec<_>>());
    }

    #[test]
    fn deleted_nodes_are_retired_not_leaked() {
        let (list, queue) = test_list(false);

        for n in 0..100u32 {
            list.insert(key(n), loc(n));
        }
        for n in 0..100u32 {
            assert!(list.delete(&key(n), loc(n)));
        }

        let mut out = Vec::new();
        list.collect_range(None, None, None, &mut out);
        assert!(out.is_empty());

        // Each delete retires the node and its final locator list.
        assert!(queue.stats().retired >= 200);
    }

    #[test]
    fn conditional_insert_is_atomic_per_key() {
        let (list, _queue) = test_list(false);

        assert!(list.conditional_insert(key(1), loc(1), &|_| false));
        assert!(!list.conditional_insert(key(1), loc(2), &|l| l == loc(1)));
        assert!(list.conditional_insert(key(1), loc(3), &|l| l == loc(42)));
    }

    #[test]
    fn concurrent_insert_delete_mix_converges() {
        let (list, _queue) = test_list(false);
        let list = &list;

        std::thread::scope(|scope| {
            // Writers insert disjoint key ranges, then delete half of
            // them again.
            for t in 0..4u32 {
                scope.spawn(move || {
                    let base = t * 1000;
                    for n in 0..1000u32 {
                        assert!(list.insert(key(base + n), loc(base + n)));
                    }
                    for n in (0..1000u32).step_by(2) {
                        assert!(list.delete(&key(base + n), loc(base + n)));
                    }
                });
            }
        });

        let mut out = Vec::new();
        list.collect_range(None, None, None, &mut out);
        assert_eq!(out.len(), 2000);
        assert!(out.iter().all(|l| l.block % 2 == 1));
    }
}
