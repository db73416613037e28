//! Index metadata: immutable after index creation.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::schema::Schema;
use crate::{Oid, INVALID_OID};

/// The physical shape of an index.
///
/// `BwTree` and `BTree` both route to the ordered B+ tree core; the two
/// tags are kept so that catalog entries written for either shape keep
/// working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexShape {
    BwTree,
    BTree,
    SkipList,
    Hash,
    Art,
}

impl IndexShape {
    /// Whether the shape supports range and ordered scans.
    pub fn is_ordered(&self) -> bool {
        !matches!(self, IndexShape::Hash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexConstraint {
    Default,
    PrimaryKey,
    Unique,
}

/// Everything the engine needs to know about one index.
///
/// Owns the key schema (a projection of the tuple schema over
/// `key_attrs`) and the sparse reverse mapping from tuple columns to key
/// columns. Immutable once built.
#[derive(Debug, Clone)]
pub struct IndexMetadata {
    pub name: String,
    pub index_oid: Oid,
    pub table_oid: Oid,
    pub database_oid: Oid,
    pub shape: IndexShape,
    pub constraint: IndexConstraint,
    key_schema: Arc<Schema>,
    tuple_schema: Arc<Schema>,
    key_attrs: Vec<Oid>,
    tuple_to_index: Vec<Oid>,
    pub unique_keys: bool,
}

impl IndexMetadata {
    pub fn new(
        name: impl Into<String>,
        index_oid: Oid,
        table_oid: Oid,
        database_oid: Oid,
        shape: IndexShape,
        constraint: IndexConstraint,
        tuple_schema: Arc<Schema>,
        key_attrs: Vec<Oid>,
        unique_keys: bool,
    ) -> Self {
        debug_assert!(!key_attrs.is_empty());

        let key_schema = Arc::new(tuple_schema.project(&key_attrs));

        // Reverse mapping: tuple column id -> key column id, sparse with
        // INVALID_OID where the tuple column is not indexed.
        let mut tuple_to_index = vec![INVALID_OID; tuple_schema.column_count()];
        for (key_column, tuple_column) in key_attrs.iter().enumerate() {
            debug_assert!((*tuple_column as usize) < tuple_to_index.len());
            tuple_to_index[*tuple_column as usize] = key_column as Oid;
        }

        Self {
            name: name.into(),
            index_oid,
            table_oid,
            database_oid,
            shape,
            constraint,
            key_schema,
            tuple_schema,
            key_attrs,
            tuple_to_index,
            unique_keys,
        }
    }

    pub fn key_schema(&self) -> &Arc<Schema> {
        &self.key_schema
    }

    pub fn tuple_schema(&self) -> &Arc<Schema> {
        &self.tuple_schema
    }

    pub fn key_attrs(&self) -> &[Oid] {
        &self.key_attrs
    }

    /// Number of indexed columns.
    pub fn column_count(&self) -> usize {
        self.key_schema.column_count()
    }

    /// Map a tuple column to its position inside the index key.
    ///
    /// Returns `INVALID_OID` when the tuple column is not indexed.
    pub fn tuple_column_to_key_column(&self, tuple_column: Oid) -> Oid {
        self.tuple_to_index
            .get(tuple_column as usize)
            .copied()
            .unwrap_or(INVALID_OID)
    }
}

/// Point-in-time operation counts for one index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub inserts: u64,
    pub deletes: u64,
    pub lookups: u64,
}

/// Per-index operation counters, bumped on the hot path with relaxed
/// ordering; read only by monitoring.
#[derive(Debug, Default)]
pub struct IndexCounters {
    inserts: AtomicU64,
    deletes: AtomicU64,
    lookups: AtomicU64,
}

impl IndexCounters {
    pub fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IndexStats {
        IndexStats {
            inserts: self.inserts.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use crate::value::SqlType;

    fn metadata() -> IndexMetadata {
        let tuple_schema = Arc::new(Schema::new(vec![
            Column::new("a", SqlType::Integer),
            Column::new("b", SqlType::Varchar(8)),
            Column::new("c", SqlType::BigInt),
        ]));

        IndexMetadata::new(
            "test_idx",
            1,
            2,
            3,
            IndexShape::BTree,
            IndexConstraint::Default,
            tuple_schema,
            vec![2, 0],
            false,
        )
    }

    #[test]
    fn reverse_mapping_is_sparse() {
        let meta = metadata();

        assert_eq!(meta.tuple_column_to_key_column(2), 0);
        assert_eq!(meta.tuple_column_to_key_column(0), 1);
        assert_eq!(meta.tuple_column_to_key_column(1), INVALID_OID);
        assert_eq!(meta.tuple_column_to_key_column(99), INVALID_OID);
    }

    #[test]
    fn key_schema_follows_key_attrs() {
        let meta = metadata();

        assert_eq!(meta.column_count(), 2);
        assert_eq!(meta.key_schema().column(0).name, "c");
        assert_eq!(meta.key_schema().column(1).name, "a");
    }

    #[test]
    fn counters_accumulate() {
        let counters = IndexCounters::default();
        counters.record_insert();
        counters.record_insert();
        counters.record_lookup();

        let stats = counters.snapshot();
        assert_eq!(stats.inserts, 2);
        assert_eq!(stats.deletes, 0);
        assert_eq!(stats.lookups, 1);
    }
}
