//! The contract shared by every index realization.
//!
//! The engine hands out `Arc<dyn RowIndex>` handles; the concrete type
//! behind each handle is monomorphized over a key shape at build time, so
//! virtual dispatch happens once per operation, never inside a traversal.
//!
//! Callers bracket every operation between `enter_epoch` and `exit_epoch`
//! on their own thread; the index itself never talks to the epoch
//! manager, it only retires unlinked nodes through the retirement queue.

use std::collections::HashSet;

use thiserror::Error;

use crate::codec::KeyCodecError;
use crate::metadata::{IndexMetadata, IndexStats};
use crate::predicate::{ConjunctionScanPredicate, IndexScanPredicate};
use crate::schema::Tuple;
use crate::TupleLocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    Forward,
    Backward,
}

/// Residual predicate applied to locators during a range scan.
pub type LocatorFilter<'a> = Option<&'a (dyn Fn(TupleLocator) -> bool + Send + Sync)>;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("{operation} is not supported by a {shape} index")]
    Unsupported {
        operation: &'static str,
        shape: &'static str,
    },

    #[error("index shape requires a key loader")]
    MissingKeyLoader,

    #[error(transparent)]
    Codec(#[from] KeyCodecError),
}

/// A concurrent index over encoded tuple keys.
///
/// Uniqueness handling: `insert` reports a unique violation as
/// `Ok(false)`; whether that is a user error is the caller's call. For a
/// non-unique index, many locators may live under one key and `delete`
/// removes only the exact `(key, locator)` pair.
pub trait RowIndex: Send + Sync {
    fn metadata(&self) -> &IndexMetadata;

    /// Insert a key/locator pair. Returns false on a unique violation.
    fn insert(&self, key: &Tuple, locator: TupleLocator) -> Result<bool, IndexError>;

    /// Remove the exact pair. Returns false when it was not present.
    fn delete(&self, key: &Tuple, locator: TupleLocator) -> Result<bool, IndexError>;

    /// Insert unless `predicate` approves an existing locator under the
    /// same key. Atomic with respect to concurrent same-key inserts.
    fn conditional_insert(
        &self,
        key: &Tuple,
        locator: TupleLocator,
        predicate: &dyn Fn(TupleLocator) -> bool,
    ) -> Result<bool, IndexError>;

    /// All locators stored under exactly this key.
    fn scan_key(&self, key: &Tuple) -> Result<Vec<TupleLocator>, IndexError>;

    /// All pairs with `low <= key <= high`, ordered by key in scan
    /// direction. Ordered shapes only.
    fn scan_range(
        &self,
        low: &Tuple,
        high: &Tuple,
        direction: ScanDirection,
        filter: LocatorFilter<'_>,
    ) -> Result<Vec<TupleLocator>, IndexError>;

    /// Every locator in the index, ordered by key in scan direction for
    /// ordered shapes.
    fn scan_all(&self, direction: ScanDirection) -> Result<Vec<TupleLocator>, IndexError>;

    /// Locators for all keys `>= low`, ascending. Ordered shapes only.
    fn scan_from(&self, low: &Tuple) -> Result<Vec<TupleLocator>, IndexError>;

    /// Run a planned conjunction against the index.
    fn scan(
        &self,
        predicate: &ConjunctionScanPredicate,
        direction: ScanDirection,
    ) -> Result<Vec<TupleLocator>, IndexError> {
        if predicate.is_full_index_scan() {
            self.scan_all(direction)
        } else if predicate.is_point_query() {
            self.scan_key(predicate.point_query_key())
        } else {
            self.scan_range(predicate.low_key(), predicate.high_key(), direction, None)
        }
    }

    /// Point query: the short-circuit of a range scan whose bounds meet.
    fn point_query(&self, key: &Tuple) -> Result<Vec<TupleLocator>, IndexError> {
        self.scan_key(key)
    }

    /// Whether range and ordered scans are available; the planner must
    /// not route non-equality predicates to an index that says no.
    fn supports_range_scan(&self) -> bool {
        true
    }

    fn stats(&self) -> IndexStats;
}

/// Run a disjunction of conjunctions against an index.
///
/// When any conjunction has degraded to a full index scan, one pass over
/// the index covers every disjunct; otherwise each conjunction scans
/// separately and the results are unioned, keeping the first occurrence
/// of each locator.
pub fn scan_disjunction(
    index: &dyn RowIndex,
    predicate: &IndexScanPredicate,
    direction: ScanDirection,
) -> Result<Vec<TupleLocator>, IndexError> {
    if predicate.is_full_index_scan() {
        return index.scan_all(direction);
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for conjunction in predicate.conjunctions() {
        for locator in index.scan(conjunction, direction)? {
            if seen.insert(locator) {
                out.push(locator);
            }
        }
    }

    Ok(out)
}
