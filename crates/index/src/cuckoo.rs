//! Unordered cuckoo hash index.
//!
//! Two xxh3 hash functions give every key two home buckets of four slots
//! each. Readers are lock-free: they acquire-load the table pointer and
//! the slot pointers, and entries are immutable once published, so a
//! reader sees either the old or the new entry. Writers latch the
//! affected buckets in ascending index order under a shared resize gate;
//! a full pair triggers a single-displacement eviction, and when that
//! fails too the table doubles behind the gate's exclusive side.
//!
//! During an eviction the moved entry is installed in its alternate
//! bucket before it leaves the old one, so a concurrent reader finds it
//! in at least one of its two homes. A replaced table keeps ownership of
//! its entries and is retired whole; the new table starts from clones.
//!
//! Range scans, ordered scans and conditional inserts are not part of
//! the hash index's contract; the planner routes only equality
//! predicates here.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, RwLock};

use xxhash_rust::xxh3::xxh3_64_with_seed;

use tephra_core::{
    IndexCounters, IndexError, IndexKey, IndexMetadata, IndexStats, LocatorFilter, RowIndex,
    ScanDirection, Tuple, TupleLocator,
};
use tephra_epoch::RetirementQueue;

use crate::latch::NodeLatch;

const BUCKET_SLOTS: usize = 4;
const INITIAL_BUCKETS: usize = 64;

const SEED_PRIMARY: u64 = 0x7c0f_3c8d_95d1_0b4f;
const SEED_SECONDARY: u64 = 0x1b87_3a5e_c8d4_29e1;

type LocatorList = Vec<TupleLocator>;

struct Entry<K> {
    key: K,
    locators: LocatorList,
}

struct Bucket<K> {
    latch: NodeLatch,
    slots: [AtomicPtr<Entry<K>>; BUCKET_SLOTS],
}

impl<K> Bucket<K> {
    fn new() -> Self {
        Self {
            latch: NodeLatch::new(),
            slots: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }
    }

    fn free_slot(&self) -> Option<usize> {
        (0..BUCKET_SLOTS).find(|&i| self.slots[i].load(Ordering::Acquire).is_null())
    }
}

struct Table<K> {
    buckets: Box<[Bucket<K>]>,
}

impl<K> Table<K> {
    fn new(bucket_count: usize) -> Self {
        debug_assert!(bucket_count.is_power_of_two());

        Self {
            buckets: (0..bucket_count).map(|_| Bucket::new()).collect(),
        }
    }

    fn bucket_pair(&self, key_bytes: &[u8]) -> (usize, usize) {
        let mask = self.buckets.len() - 1;
        let primary = xxh3_64_with_seed(key_bytes, SEED_PRIMARY) as usize & mask;
        let secondary = xxh3_64_with_seed(key_bytes, SEED_SECONDARY) as usize & mask;
        (primary, secondary)
    }
}

impl<K> Drop for Table<K> {
    fn drop(&mut self) {
        // The table owns its entries; a replaced table is retired whole
        // and drops them after the grace period.
        for bucket in self.buckets.iter() {
            for slot in &bucket.slots {
                let entry = slot.load(Ordering::Relaxed);
                if !entry.is_null() {
                    unsafe { drop(Box::from_raw(entry)) };
                }
            }
        }
    }
}

pub(crate) struct CuckooHash<K: IndexKey> {
    table: AtomicPtr<Table<K>>,
    /// Writers hold the shared side; a table swap holds the exclusive
    /// side, so bucket latches always refer to the current table.
    resize_gate: RwLock<()>,
    retirement: Arc<RetirementQueue>,
    unique_keys: bool,
}

impl<K: IndexKey> CuckooHash<K> {
    pub(crate) fn new(retirement: Arc<RetirementQueue>, unique_keys: bool) -> Self {
        Self {
            table: AtomicPtr::new(Box::into_raw(Box::new(Table::new(INITIAL_BUCKETS)))),
            resize_gate: RwLock::new(()),
            retirement,
            unique_keys,
        }
    }

    pub(crate) fn scan_key(&self, key: &K) -> Vec<TupleLocator> {
        let table = unsafe { &*self.table.load(Ordering::Acquire) };
        let (primary, secondary) = table.bucket_pair(key.as_bytes());

        for bucket_idx in [primary, secondary] {
            for slot in &table.buckets[bucket_idx].slots {
                let entry = slot.load(Ordering::Acquire);
                if entry.is_null() {
                    continue;
                }

                let entry = unsafe { &*entry };
                if entry.key == *key {
                    return entry.locators.clone();
                }
            }
        }

        Vec::new()
    }

    pub(crate) fn insert(&self, key: K, locator: TupleLocator) -> bool {
        loop {
            let _gate = self.resize_gate.read().expect("resize gate poisoned");
            let table_ptr = self.table.load(Ordering::Acquire);
            let table = unsafe { &*table_ptr };
            let (primary, secondary) = table.bucket_pair(key.as_bytes());

            lock_buckets(table, &[primary, secondary]);

            if let Some(done) =
                self.try_insert_locked(table, primary, secondary, &key, locator)
            {
                unlock_buckets(table, &[primary, secondary]);
                return done;
            }

            // Both buckets full and the key is absent: try to displace
            // one occupant into its alternate bucket.
            let candidates = collect_eviction_candidates(table, primary, secondary);
            unlock_buckets(table, &[primary, secondary]);

            let mut moved = false;
            for (home, slot_idx, victim, alt) in candidates {
                let locks = [primary, secondary, home, alt];
                lock_buckets(table, &locks);

                // The world may have changed while nothing was latched;
                // resolve the easy outcomes first.
                if let Some(done) =
                    self.try_insert_locked(table, primary, secondary, &key, locator)
                {
                    unlock_buckets(table, &locks);
                    return done;
                }

                let victim_still_home =
                    table.buckets[home].slots[slot_idx].load(Ordering::Acquire) == victim;

                if victim_still_home {
                    if let Some(free) = table.buckets[alt].free_slot() {
                        // Install in the alternate bucket before leaving
                        // the old one, so readers never lose the entry.
                        table.buckets[alt].slots[free].store(victim, Ordering::Release);

                        let fresh = Box::into_raw(Box::new(Entry {
                            key: key.clone(),
                            locators: vec![locator],
                        }));
                        table.buckets[home].slots[slot_idx].store(fresh, Ordering::Release);

                        unlock_buckets(table, &locks);
                        moved = true;
                        break;
                    }
                }

                unlock_buckets(table, &locks);
            }

            if moved {
                return true;
            }

            // No displacement worked: grow the table and try again.
            drop(_gate);
            self.grow(table_ptr);
        }
    }

    pub(crate) fn delete(&self, key: &K, locator: TupleLocator) -> bool {
        let _gate = self.resize_gate.read().expect("resize gate poisoned");
        let table = unsafe { &*self.table.load(Ordering::Acquire) };
        let (primary, secondary) = table.bucket_pair(key.as_bytes());

        lock_buckets(table, &[primary, secondary]);

        let mut removed = false;

        'search: for bucket_idx in [primary, secondary] {
            for slot in &table.buckets[bucket_idx].slots {
                let entry_ptr = slot.load(Ordering::Acquire);
                if entry_ptr.is_null() {
                    continue;
                }

                let entry = unsafe { &*entry_ptr };
                if entry.key != *key {
                    continue;
                }

                let Some(found) = entry.locators.iter().position(|l| *l == locator) else {
                    break 'search;
                };

                if entry.locators.len() == 1 {
                    slot.store(ptr::null_mut(), Ordering::Release);
                } else {
                    let mut locators = entry.locators.clone();
                    locators.remove(found);

                    let rebuilt = Box::into_raw(Box::new(Entry {
                        key: entry.key.clone(),
                        locators,
                    }));
                    slot.store(rebuilt, Ordering::Release);
                }

                unsafe { self.retirement.defer_drop(Box::from_raw(entry_ptr)) };
                removed = true;
                break 'search;
            }
        }

        unlock_buckets(table, &[primary, secondary]);
        removed
    }

    /// Resolve an insert while the key's bucket pair is latched.
    ///
    /// `Some(result)` when the insert finished (existing key updated,
    /// unique violation, or a free slot used); `None` when both buckets
    /// are full and eviction is needed.
    fn try_insert_locked(
        &self,
        table: &Table<K>,
        primary: usize,
        secondary: usize,
        key: &K,
        locator: TupleLocator,
    ) -> Option<bool> {
        for bucket_idx in [primary, secondary] {
            for slot in &table.buckets[bucket_idx].slots {
                let entry_ptr = slot.load(Ordering::Acquire);
                if entry_ptr.is_null() {
                    continue;
                }

                let entry = unsafe { &*entry_ptr };
                if entry.key != *key {
                    continue;
                }

                if self.unique_keys || entry.locators.contains(&locator) {
                    return Some(false);
                }

                let mut locators = entry.locators.clone();
                locators.push(locator);

                let rebuilt = Box::into_raw(Box::new(Entry {
                    key: entry.key.clone(),
                    locators,
                }));
                slot.store(rebuilt, Ordering::Release);

                unsafe { self.retirement.defer_drop(Box::from_raw(entry_ptr)) };
                return Some(true);
            }
        }

        for bucket_idx in [primary, secondary] {
            if let Some(free) = table.buckets[bucket_idx].free_slot() {
                let fresh = Box::into_raw(Box::new(Entry {
                    key: key.clone(),
                    locators: vec![locator],
                }));
                table.buckets[bucket_idx].slots[free].store(fresh, Ordering::Release);
                return Some(true);
            }
        }

        None
    }

    /// Double the table. `failed` is the table the caller gave up on; if
    /// someone already swapped it out there is nothing to do.
    fn grow(&self, failed: *mut Table<K>) {
        let _gate = self.resize_gate.write().expect("resize gate poisoned");

        let current = self.table.load(Ordering::Acquire);
        if current != failed {
            return;
        }

        let old = unsafe { &*current };
        let mut bucket_count = old.buckets.len() * 2;

        'grow: loop {
            let new_table = Table::new(bucket_count);

            for bucket in old.buckets.iter() {
                for slot in &bucket.slots {
                    let entry_ptr = slot.load(Ordering::Acquire);
                    if entry_ptr.is_null() {
                        continue;
                    }

                    let entry = unsafe { &*entry_ptr };
                    let clone = Entry {
                        key: entry.key.clone(),
                        locators: entry.locators.clone(),
                    };

                    if !place_direct(&new_table, clone) {
                        bucket_count *= 2;
                        continue 'grow;
                    }
                }
            }

            self.table
                .store(Box::into_raw(Box::new(new_table)), Ordering::Release);
            unsafe { self.retirement.defer_drop(Box::from_raw(current)) };
            return;
        }
    }
}

impl<K: IndexKey> Drop for CuckooHash<K> {
    fn drop(&mut self) {
        unsafe { drop(Box::from_raw(*self.table.get_mut())) };
    }
}

fn lock_buckets<K>(table: &Table<K>, indices: &[usize]) {
    let mut ordered: Vec<usize> = indices.to_vec();
    ordered.sort_unstable();
    ordered.dedup();

    for idx in ordered {
        table.buckets[idx]
            .latch
            .lock()
            .expect("bucket latches are never obsolete");
    }
}

fn unlock_buckets<K>(table: &Table<K>, indices: &[usize]) {
    let mut ordered: Vec<usize> = indices.to_vec();
    ordered.sort_unstable();
    ordered.dedup();

    for idx in ordered {
        table.buckets[idx].latch.unlock();
    }
}

/// Occupants of the pair with a different alternate bucket:
/// `(home bucket, slot, entry, alternate bucket)`.
fn collect_eviction_candidates<K: IndexKey>(
    table: &Table<K>,
    primary: usize,
    secondary: usize,
) -> Vec<(usize, usize, *mut Entry<K>, usize)> {
    let mut candidates = Vec::new();

    for home in [primary, secondary] {
        for (slot_idx, slot) in table.buckets[home].slots.iter().enumerate() {
            let entry_ptr = slot.load(Ordering::Acquire);
            if entry_ptr.is_null() {
                continue;
            }

            let entry = unsafe { &*entry_ptr };
            let (first, second) = table.bucket_pair(entry.key.as_bytes());
            let alt = if first == home { second } else { first };

            if alt != home {
                candidates.push((home, slot_idx, entry_ptr, alt));
            }
        }
    }

    candidates
}

/// Uncontended placement into a fresh table during a rehash.
fn place_direct<K: IndexKey>(table: &Table<K>, entry: Entry<K>) -> bool {
    let (primary, secondary) = table.bucket_pair(entry.key.as_bytes());

    for bucket_idx in [primary, secondary] {
        if let Some(free) = table.buckets[bucket_idx].free_slot() {
            table.buckets[bucket_idx].slots[free]
                .store(Box::into_raw(Box::new(entry)), Ordering::Relaxed);
            return true;
        }
    }

    false
}

/// The `unordered_hash` realization of the index contract.
pub struct HashIndex<K: IndexKey> {
    metadata: Arc<IndexMetadata>,
    counters: IndexCounters,
    map: CuckooHash<K>,
}

impl<K: IndexKey> HashIndex<K> {
    pub fn new(metadata: Arc<IndexMetadata>, retirement: Arc<RetirementQueue>) -> Self {
        let unique_keys = metadata.unique_keys;

        Self {
            metadata,
            counters: IndexCounters::default(),
            map: CuckooHash::new(retirement, unique_keys),
        }
    }

    fn unsupported(operation: &'static str) -> IndexError {
        IndexError::Unsupported {
            operation,
            shape: "hash",
        }
    }
}

impl<K: IndexKey> RowIndex for HashIndex<K> {
    fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    fn insert(&self, key: &Tuple, locator: TupleLocator) -> Result<bool, IndexError> {
        let key = K::from_tuple(key)?;
        self.counters.record_insert();
        Ok(self.map.insert(key, locator))
    }

    fn delete(&self, key: &Tuple, locator: TupleLocator) -> Result<bool, IndexError> {
        let key = K::from_tuple(key)?;
        self.counters.record_delete();
        Ok(self.map.delete(&key, locator))
    }

    fn conditional_insert(
        &self,
        _key: &Tuple,
        _locator: TupleLocator,
        _predicate: &dyn Fn(TupleLocator) -> bool,
    ) -> Result<bool, IndexError> {
        Err(Self::unsupported("conditional_insert"))
    }

    fn scan_key(&self, key: &Tuple) -> Result<Vec<TupleLocator>, IndexError> {
        let key = K::from_tuple(key)?;
        self.counters.record_lookup();
        Ok(self.map.scan_key(&key))
    }

    fn scan_range(
        &self,
        _low: &Tuple,
        _high: &Tuple,
        _direction: ScanDirection,
        _filter: LocatorFilter<'_>,
    ) -> Result<Vec<TupleLocator>, IndexError> {
        Err(Self::unsupported("scan_range"))
    }

    fn scan_all(&self, _direction: ScanDirection) -> Result<Vec<TupleLocator>, IndexError> {
        Err(Self::unsupported("scan_all"))
    }

    fn scan_from(&self, _low: &Tuple) -> Result<Vec<TupleLocator>, IndexError> {
        Err(Self::unsupported("scan_from"))
    }

    fn supports_range_scan(&self) -> bool {
        false
    }

    fn stats(&self) -> IndexStats {
        self.counters.snapshot()
    }
}
