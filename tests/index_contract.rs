//! End-to-end behavior of the index contract across every shape.

use std::sync::Arc;

use tephra::{
    Engine, EngineConfig, IndexError, IndexShape, RowIndex, ScanDirection, Tuple, Value,
};
use tephra_testing::{int_varchar_key, int_varchar_schema, index_metadata, loc, MapKeyLoader};

/// Shapes that support ordered scans.
const ORDERED_SHAPES: [IndexShape; 4] = [
    IndexShape::BTree,
    IndexShape::BwTree,
    IndexShape::SkipList,
    IndexShape::Art,
];

struct Fixture {
    engine: Engine,
    loader: Arc<MapKeyLoader>,
    next_oid: u32,
}

impl Fixture {
    fn new() -> Self {
        tephra_testing::init_tracing();

        Self {
            engine: Engine::start_manual(EngineConfig::default()),
            loader: MapKeyLoader::new(),
            next_oid: 1,
        }
    }

    fn build(&mut self, shape: IndexShape, unique: bool) -> Arc<dyn RowIndex> {
        let mut metadata =
            Arc::try_unwrap(index_metadata(shape, int_varchar_schema(), unique))
                .expect("fresh metadata");
        metadata.index_oid = self.next_oid;
        self.next_oid += 1;

        self.engine
            .build_index(Arc::new(metadata), Some(self.loader.clone()))
            .expect("index builds")
    }

    /// Insert and register the row with the key loader so the radix
    /// shape can recover it.
    fn insert(&self, index: &Arc<dyn RowIndex>, key: &Tuple, l: tephra::TupleLocator) -> bool {
        self.loader.register(l, key);
        index.insert(key, l).unwrap()
    }
}

#[test]
fn basic_insert_scan_on_every_ordered_shape() {
    let mut f = Fixture::new();

    for shape in ORDERED_SHAPES {
        let index = f.build(shape, false);
        let schema = index.metadata().key_schema().clone();

        let k1 = int_varchar_key(&schema, 100, "a");
        let k2 = int_varchar_key(&schema, 100, "b");
        let k3 = int_varchar_key(&schema, 200, "c");

        assert!(f.insert(&index, &k1, loc(1, 0)), "{shape:?}");
        assert!(f.insert(&index, &k2, loc(2, 0)), "{shape:?}");
        assert!(f.insert(&index, &k3, loc(3, 0)), "{shape:?}");

        assert_eq!(index.scan_key(&k1).unwrap(), vec![loc(1, 0)], "{shape:?}");

        let range = index
            .scan_range(&k1, &k3, ScanDirection::Forward, None)
            .unwrap();
        assert_eq!(range, vec![loc(1, 0), loc(2, 0), loc(3, 0)], "{shape:?}");

        let backward = index
            .scan_range(&k1, &k3, ScanDirection::Backward, None)
            .unwrap();
        assert_eq!(backward, vec![loc(3, 0), loc(2, 0), loc(1, 0)], "{shape:?}");
    }
}

#[test]
fn unique_violation_is_reported_not_raised() {
    let mut f = Fixture::new();

    for shape in [
        IndexShape::BTree,
        IndexShape::SkipList,
        IndexShape::Hash,
        IndexShape::Art,
    ] {
        let index = f.build(shape, true);
        let schema = index.metadata().key_schema().clone();
        let key = int_varchar_key(&schema, 1, "x");

        assert!(f.insert(&index, &key, loc(1, 0)), "{shape:?}");
        assert!(!f.insert(&index, &key, loc(2, 0)), "{shape:?}");
        assert_eq!(index.scan_key(&key).unwrap(), vec![loc(1, 0)], "{shape:?}");
    }
}

#[test]
fn delete_from_two_threads_then_scan_all() {
    let mut f = Fixture::new();

    for shape in ORDERED_SHAPES {
        let index = f.build(shape, false);
        let schema = index.metadata().key_schema().clone();

        let keys: Vec<Tuple> = (0..7)
            .map(|i| int_varchar_key(&schema, i, "k"))
            .collect();

        for (i, key) in keys.iter().enumerate() {
            assert!(f.insert(&index, key, loc(i as u32, 0)));
        }

        // Two threads delete four keys between them.
        std::thread::scope(|scope| {
            let index = &index;
            let keys = &keys;

            scope.spawn(move || {
                assert!(index.delete(&keys[0], loc(0, 0)).unwrap());
                assert!(index.delete(&keys[2], loc(2, 0)).unwrap());
            });
            scope.spawn(move || {
                assert!(index.delete(&keys[4], loc(4, 0)).unwrap());
                assert!(index.delete(&keys[6], loc(6, 0)).unwrap());
            });
        });

        let survivors = index.scan_all(ScanDirection::Forward).unwrap();
        assert_eq!(
            survivors,
            vec![loc(1, 0), loc(3, 0), loc(5, 0)],
            "{shape:?}"
        );
    }
}

#[test]
fn hash_index_supports_point_ops_only() {
    let mut f = Fixture::new();
    let index = f.build(IndexShape::Hash, false);
    let schema = index.metadata().key_schema().clone();

    let key = int_varchar_key(&schema, 5, "v");
    assert!(f.insert(&index, &key, loc(1, 0)));
    assert_eq!(index.scan_key(&key).unwrap(), vec![loc(1, 0)]);

    assert!(!index.supports_range_scan());
    assert!(matches!(
        index.scan_range(&key, &key, ScanDirection::Forward, None),
        Err(IndexError::Unsupported { .. })
    ));
    assert!(matches!(
        index.scan_all(ScanDirection::Forward),
        Err(IndexError::Unsupported { .. })
    ));
    assert!(matches!(
        index.conditional_insert(&key, loc(2, 0), &|_| false),
        Err(IndexError::Unsupported { .. })
    ));

    assert!(index.delete(&key, loc(1, 0)).unwrap());
    assert!(index.scan_key(&key).unwrap().is_empty());
}

#[test]
fn conditional_insert_guards_across_ordered_shapes() {
    let mut f = Fixture::new();

    for shape in ORDERED_SHAPES {
        let index = f.build(shape, false);
        let schema = index.metadata().key_schema().clone();
        let key = int_varchar_key(&schema, 9, "z");

        f.loader.register(loc(1, 0), &key);
        f.loader.register(loc(2, 0), &key);

        assert!(index.conditional_insert(&key, loc(1, 0), &|_| false).unwrap());
        assert!(
            !index
                .conditional_insert(&key, loc(2, 0), &|l| l == loc(1, 0))
                .unwrap(),
            "{shape:?}"
        );
    }
}

#[test]
fn idempotent_scan_on_a_quiescent_index() {
    let mut f = Fixture::new();

    for shape in ORDERED_SHAPES {
        let index = f.build(shape, false);
        let schema = index.metadata().key_schema().clone();

        for i in 0..50 {
            let key = int_varchar_key(&schema, i, "s");
            f.insert(&index, &key, loc(i as u32, 0));
        }

        let first = index.scan_all(ScanDirection::Forward).unwrap();
        let second = index.scan_all(ScanDirection::Forward).unwrap();
        assert_eq!(first, second, "{shape:?}");
        assert_eq!(first.len(), 50, "{shape:?}");
    }
}

#[test]
fn scan_dispatches_point_range_and_full() {
    use tephra::{ConjunctionScanPredicate, ScanOp};

    let mut f = Fixture::new();
    let index = f.build(IndexShape::BTree, false);
    let schema = index.metadata().key_schema().clone();

    for i in 0..10 {
        let key = int_varchar_key(&schema, i, "p");
        f.insert(&index, &key, loc(i as u32, 0));
    }

    // Point query: both columns pinned.
    let point = ConjunctionScanPredicate::new(
        index.metadata(),
        &[Value::Integer(3), Value::varchar("p")],
        &[0, 1],
        &[ScanOp::Equal, ScanOp::Equal],
    )
    .unwrap();
    assert!(point.is_point_query());
    assert_eq!(
        index.scan(&point, ScanDirection::Forward).unwrap(),
        vec![loc(3, 0)]
    );

    // Range on the leading column.
    let range = ConjunctionScanPredicate::new(
        index.metadata(),
        &[Value::Integer(2), Value::Integer(5)],
        &[0, 0],
        &[ScanOp::GreaterEqual, ScanOp::LessEqual],
    )
    .unwrap();
    assert_eq!(
        index.scan(&range, ScanDirection::Forward).unwrap(),
        vec![loc(2, 0), loc(3, 0), loc(4, 0), loc(5, 0)]
    );

    // LIKE degrades to a full scan.
    let full = ConjunctionScanPredicate::new(
        index.metadata(),
        &[Value::varchar("p%")],
        &[1],
        &[ScanOp::Like],
    )
    .unwrap();
    assert!(full.is_full_index_scan());
    assert_eq!(index.scan(&full, ScanDirection::Forward).unwrap().len(), 10);
}

#[test]
fn disjunction_scans_union_their_conjunctions() {
    use tephra::{scan_disjunction, IndexScanPredicate, ScanOp};

    let mut f = Fixture::new();
    let index = f.build(IndexShape::BTree, false);
    let schema = index.metadata().key_schema().clone();

    for i in 0..20 {
        let key = int_varchar_key(&schema, i, "u");
        f.insert(&index, &key, loc(i as u32, 0));
    }

    // (a >= 2 AND a <= 5) OR (a >= 4 AND a <= 8): overlapping ranges,
    // the union must not duplicate 4 and 5.
    let mut pred = IndexScanPredicate::new();
    pred.add_conjunction(
        index.metadata(),
        &[Value::Integer(2), Value::Integer(5)],
        &[0, 0],
        &[ScanOp::GreaterEqual, ScanOp::LessEqual],
    )
    .unwrap();
    pred.add_conjunction(
        index.metadata(),
        &[Value::Integer(4), Value::Integer(8)],
        &[0, 0],
        &[ScanOp::GreaterEqual, ScanOp::LessEqual],
    )
    .unwrap();

    let union = scan_disjunction(index.as_ref(), &pred, ScanDirection::Forward).unwrap();
    assert_eq!(union, (2..=8).map(|i| loc(i, 0)).collect::<Vec<_>>());

    // One degraded conjunction collapses the whole thing into a single
    // full scan.
    pred.add_conjunction(
        index.metadata(),
        &[Value::varchar("u%")],
        &[1],
        &[ScanOp::Like],
    )
    .unwrap();
    let all = scan_disjunction(index.as_ref(), &pred, ScanDirection::Forward).unwrap();
    assert_eq!(all.len(), 20);
}

#[test]
fn engine_registry_round_trip() {
    let mut f = Fixture::new();
    let index = f.build(IndexShape::SkipList, false);
    let oid = index.metadata().index_oid;

    assert!(f.engine.index(oid).is_some());
    assert_eq!(f.engine.vitals().index_count, 1);

    // Duplicate oids are refused.
    let duplicate = index_metadata(IndexShape::BTree, int_varchar_schema(), false);
    let mut duplicate = Arc::try_unwrap(duplicate).unwrap();
    duplicate.index_oid = oid;
    assert!(f
        .engine
        .build_index(Arc::new(duplicate), None)
        .is_err());

    f.engine.drop_index(oid).unwrap();
    assert!(f.engine.index(oid).is_none());
    assert!(f.engine.drop_index(oid).is_err());

    // The handle stays usable after the drop.
    let schema = index.metadata().key_schema().clone();
    let key = int_varchar_key(&schema, 1, "d");
    assert!(f.insert(&index, &key, loc(1, 0)));
}
