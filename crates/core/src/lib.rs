//! Types and machinery shared by all tephra crates.
//!
//! Glossary:
//!  - `tuple locator`: the (block, offset) pair naming a versioned row in
//!    a tile group. Indexes hold locators and treat them as opaque.
//!  - `key schema`: the projection of a table schema over the indexed
//!    columns. Index keys are encoded from key-schema tuples.
//!  - `cid`: commit id. The epoch manager tracks cid watermarks so that
//!    the transaction manager can garbage-collect old versions.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

pub mod codec;
pub mod config;
pub mod contract;
pub mod key;
pub mod metadata;
pub mod predicate;
pub mod schema;
pub mod value;

/// A catalog object id (table, index, column position).
pub type Oid = u32;

/// Sentinel for "no oid" slots in sparse mappings.
pub const INVALID_OID: Oid = u32::MAX;

/// A commit id assigned by the transaction manager.
pub type Cid = u64;

/// A logical epoch number handed out by the epoch manager.
pub type EpochId = u64;

pub use codec::{KeyCodecError, KeyLoader};
pub use config::EngineConfig;
pub use contract::{scan_disjunction, IndexError, LocatorFilter, RowIndex, ScanDirection};
pub use key::{CompactKey, GenericKey, IndexKey, TupleKey};
pub use metadata::{IndexConstraint, IndexCounters, IndexMetadata, IndexShape, IndexStats};
pub use predicate::{ConjunctionScanPredicate, IndexScanPredicate, ScanError, ScanOp};
pub use schema::{Column, Schema, Tuple};
pub use value::{SqlType, Value, ValueError};

/// The location of a versioned row inside a tile group.
///
/// Packed into eight bytes so that indexes can move it around by value.
/// Comparison is lexicographic: block first, then offset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(C, align(8))]
pub struct TupleLocator {
    pub block: u32,
    pub offset: u32,
}

impl TupleLocator {
    /// Sentinel locator used for unbound slots.
    pub const INVALID: Self = Self {
        block: u32::MAX,
        offset: u32::MAX,
    };

    pub fn new(block: u32, offset: u32) -> Self {
        Self { block, offset }
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl Display for TupleLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.block, self.offset)
    }
}

impl From<(u32, u32)> for TupleLocator {
    fn from(value: (u32, u32)) -> Self {
        Self::new(value.0, value.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_orders_by_block_then_offset() {
        let a = TupleLocator::new(1, 9);
        let b = TupleLocator::new(2, 0);
        let c = TupleLocator::new(2, 1);

        assert!(a < b);
        assert!(b < c);
        assert!(TupleLocator::INVALID > c);
    }

    #[test]
    fn invalid_locator_is_not_valid() {
        assert!(!TupleLocator::INVALID.is_valid());
        assert!(TupleLocator::new(0, 0).is_valid());
    }
}
