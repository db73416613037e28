//! Tephra: the concurrency core of an in-memory relational storage
//! engine.
//!
//! Two tightly coupled subsystems live here: a family of pluggable
//! concurrent index structures keyed on composite relational keys, and
//! a centralized epoch manager coordinating safe memory reclamation for
//! those indexes. Every index traversal and mutation happens inside an
//! epoch; every node unlinked from an index is held until no epoch old
//! enough to observe it remains.
//!
//! The [`Engine`] value owns it all: construct one, build indexes
//! through it, bracket operations with its epoch interface, and shut it
//! down when the last worker has quiesced.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tephra::{
//!     Column, Engine, EngineConfig, IndexConstraint, IndexMetadata, IndexShape, RowIndex,
//!     Schema, SqlType, Tuple, TupleLocator, Value,
//! };
//!
//! let engine = Engine::start(EngineConfig::default());
//!
//! let tuple_schema = Arc::new(Schema::new(vec![
//!     Column::new("id", SqlType::BigInt),
//!     Column::new("name", SqlType::Varchar(16)),
//! ]));
//!
//! let metadata = Arc::new(IndexMetadata::new(
//!     "orders_pkey", 1, 1, 1,
//!     IndexShape::BTree, IndexConstraint::PrimaryKey,
//!     tuple_schema, vec![0], true,
//! ));
//!
//! let index = engine.build_index(metadata, None).unwrap();
//!
//! let epoch = engine.enter_epoch(1);
//! let key = Tuple::from_values(
//!     index.metadata().key_schema().clone(),
//!     vec![Value::BigInt(42)],
//! );
//! index.insert(&key, TupleLocator::new(0, 7)).unwrap();
//! engine.exit_epoch(epoch);
//!
//! engine.shutdown();
//! ```

mod engine;

pub use engine::{Engine, EngineError, EngineVitals};

pub use tephra_core::codec;

pub use tephra_core::{
    scan_disjunction, Cid, Column, ConjunctionScanPredicate, EngineConfig, EpochId,
    IndexConstraint, IndexError,
    IndexMetadata, IndexScanPredicate, IndexShape, IndexStats, KeyCodecError, KeyLoader,
    LocatorFilter, Oid, RowIndex, ScanDirection, ScanError, ScanOp, Schema, SqlType, Tuple,
    TupleLocator, Value, ValueError, INVALID_OID,
};
pub use tephra_epoch::{
    EpochManager, EpochTicker, EpochWatermarks, RetirementQueue, RetirementStats,
    SAFETY_INTERVAL,
};
pub use tephra_index::{build_index, AdaptiveRadixTree, ArtIndex, BTreeIndex, HashIndex,
    SkipListIndex};
