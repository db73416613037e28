//! Shared fixtures for tephra tests: schemas, key tuples, locators and
//! a map-backed key loader standing in for the storage layer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tephra_core::codec::{self, KeyCodecError, KeyLoader};
use tephra_core::{
    Column, IndexConstraint, IndexMetadata, IndexShape, Schema, SqlType, Tuple, TupleLocator,
    Value,
};
use tephra_epoch::{EpochManager, RetirementQueue};

/// Install a fmt subscriber honoring `RUST_LOG`. Safe to call from
/// every test; only the first call wins.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The workhorse two-column schema: `(a INT, b VARCHAR(8))`.
pub fn int_varchar_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Column::new("a", SqlType::Integer),
        Column::new("b", SqlType::Varchar(8)),
    ]))
}

/// An all-integer schema of `n` bigint columns.
pub fn bigint_schema(n: usize) -> Arc<Schema> {
    Arc::new(Schema::new(
        (0..n)
            .map(|i| Column::new(format!("c{i}"), SqlType::BigInt))
            .collect(),
    ))
}

/// Index metadata over every column of the given tuple schema.
pub fn index_metadata(
    shape: IndexShape,
    tuple_schema: Arc<Schema>,
    unique_keys: bool,
) -> Arc<IndexMetadata> {
    let key_attrs = (0..tuple_schema.column_count() as u32).collect();

    Arc::new(IndexMetadata::new(
        "test_idx",
        1,
        1,
        1,
        shape,
        if unique_keys {
            IndexConstraint::Unique
        } else {
            IndexConstraint::Default
        },
        tuple_schema,
        key_attrs,
        unique_keys,
    ))
}

/// A key tuple over the schema from plain values.
pub fn key_tuple(schema: &Arc<Schema>, values: Vec<Value>) -> Tuple {
    Tuple::from_values(schema.clone(), values)
}

/// Shorthand `(a, b)` tuple for [`int_varchar_schema`].
pub fn int_varchar_key(schema: &Arc<Schema>, a: i32, b: &str) -> Tuple {
    key_tuple(schema, vec![Value::Integer(a), Value::varchar(b)])
}

pub fn loc(block: u32, offset: u32) -> TupleLocator {
    TupleLocator::new(block, offset)
}

/// A fresh epoch manager plus retirement queue pair for index tests.
pub fn retirement_fixture() -> (Arc<EpochManager>, Arc<RetirementQueue>) {
    let manager = EpochManager::new(64);
    let queue = RetirementQueue::new(manager.clone());
    (manager, queue)
}

/// Map-backed key loader: tests register each locator's key tuple and
/// the radix index recovers the encoded bytes through it, the same way
/// the real loader re-reads a row from its tile group.
#[derive(Default)]
pub struct MapKeyLoader {
    rows: Mutex<HashMap<TupleLocator, Vec<u8>>>,
}

impl MapKeyLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, locator: TupleLocator, key: &Tuple) {
        let bytes = codec::encode_tuple(key).expect("fixture keys encode");
        self.rows.lock().unwrap().insert(locator, bytes);
    }

    pub fn forget(&self, locator: TupleLocator) {
        self.rows.lock().unwrap().remove(&locator);
    }
}

impl KeyLoader for MapKeyLoader {
    fn load_key(&self, locator: TupleLocator) -> Result<Vec<u8>, KeyCodecError> {
        self.rows
            .lock()
            .unwrap()
            .get(&locator)
            .cloned()
            .ok_or(KeyCodecError::RowUnavailable(locator))
    }
}
