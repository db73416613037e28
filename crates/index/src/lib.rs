//! The index cores: four interchangeable realizations of the index
//! contract defined in `tephra-core`.
//!
//! | Shape | Realization | Ordered |
//! |-------|-------------|---------|
//! | `ordered_btree` / `ordered_bwtree` | copy-on-write B+ tree | yes |
//! | `ordered_skiplist` | lock-free skip list | yes |
//! | `unordered_hash` | cuckoo hash | no |
//! | `radix_art` | adaptive radix tree | yes |
//!
//! All four share the same memory discipline: readers never latch,
//! structure nodes are immutable or atomically-linked once published,
//! and every unlinked node goes through the retirement queue instead of
//! being freed in place. Callers bracket each operation in an epoch;
//! the cores themselves never talk to the epoch manager.

mod art;
mod btree;
mod cuckoo;
mod factory;
mod latch;
mod skiplist;

pub use art::{AdaptiveRadixTree, ArtIndex};
pub use btree::BTreeIndex;
pub use cuckoo::HashIndex;
pub use factory::build_index;
pub use skiplist::SkipListIndex;
