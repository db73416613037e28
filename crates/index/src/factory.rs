//! Index construction: key-shape dispatch and shape routing.
//!
//! Two decisions, made once at build time:
//!
//! 1. Key specialization. Integer-only key schemas that fit four u64
//!    slots get the packed compact-ints key; everything else lands in
//!    the smallest generic bucket (4/8/16/64/256 bytes) that holds the
//!    encoded key, falling back to the heap-backed tuple key beyond
//!    that. The chosen type monomorphizes the whole index core, so the
//!    traversal loops never see a virtual call.
//! 2. Shape routing. The metadata's shape tag picks the realization;
//!    `ordered_bwtree` and `ordered_btree` both land on the B+ tree,
//!    and the radix tree additionally needs the key loader for its
//!    compressed paths.

use std::sync::Arc;

use tracing::info;

use tephra_core::codec::KeyLoader;
use tephra_core::{
    CompactKey, GenericKey, IndexError, IndexMetadata, IndexShape, RowIndex, TupleKey,
};
use tephra_epoch::RetirementQueue;

use crate::art::ArtIndex;
use crate::btree::BTreeIndex;
use crate::cuckoo::HashIndex;
use crate::skiplist::SkipListIndex;

/// Instantiate `$index` with the key specialization for the metadata's
/// key schema.
macro_rules! with_key_shape {
    ($index:ident, $metadata:expr, $retirement:expr) => {{
        let metadata = $metadata;
        let retirement = $retirement;
        let key_size = metadata.key_schema().total_len();
        let ints_only = metadata.key_schema().is_integer_only();

        if ints_only && key_size <= 32 {
            if key_size <= 8 {
                Arc::new($index::<CompactKey<8>>::new(metadata, retirement))
                    as Arc<dyn RowIndex>
            } else if key_size <= 16 {
                Arc::new($index::<CompactKey<16>>::new(metadata, retirement))
                    as Arc<dyn RowIndex>
            } else if key_size <= 24 {
                Arc::new($index::<CompactKey<24>>::new(metadata, retirement))
                    as Arc<dyn RowIndex>
            } else {
                Arc::new($index::<CompactKey<32>>::new(metadata, retirement))
                    as Arc<dyn RowIndex>
            }
        } else if key_size <= 4 {
            Arc::new($index::<GenericKey<4>>::new(metadata, retirement)) as Arc<dyn RowIndex>
        } else if key_size <= 8 {
            Arc::new($index::<GenericKey<8>>::new(metadata, retirement)) as Arc<dyn RowIndex>
        } else if key_size <= 16 {
            Arc::new($index::<GenericKey<16>>::new(metadata, retirement)) as Arc<dyn RowIndex>
        } else if key_size <= 64 {
            Arc::new($index::<GenericKey<64>>::new(metadata, retirement)) as Arc<dyn RowIndex>
        } else if key_size <= 256 {
            Arc::new($index::<GenericKey<256>>::new(metadata, retirement)) as Arc<dyn RowIndex>
        } else {
            Arc::new($index::<TupleKey>::new(metadata, retirement)) as Arc<dyn RowIndex>
        }
    }};
}

/// Build the index realization described by the metadata.
///
/// The radix shape requires a key loader; every other shape ignores it.
pub fn build_index(
    metadata: Arc<IndexMetadata>,
    retirement: Arc<RetirementQueue>,
    loader: Option<Arc<dyn KeyLoader>>,
) -> Result<Arc<dyn RowIndex>, IndexError> {
    info!(
        index = %metadata.name,
        shape = ?metadata.shape,
        key_bytes = metadata.key_schema().total_len(),
        "building index"
    );

    let index: Arc<dyn RowIndex> = match metadata.shape {
        IndexShape::BwTree | IndexShape::BTree => {
            with_key_shape!(BTreeIndex, metadata, retirement)
        }
        IndexShape::SkipList => with_key_shape!(SkipListIndex, metadata, retirement),
        IndexShape::Hash => with_key_shape!(HashIndex, metadata, retirement),
        IndexShape::Art => {
            let loader = loader.ok_or(IndexError::MissingKeyLoader)?;
            Arc::new(ArtIndex::new(metadata, retirement, loader))
        }
    };

    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tephra_core::{Column, IndexConstraint, Schema, SqlType};
    use tephra_epoch::EpochManager;

    fn metadata(shape: IndexShape, columns: Vec<Column>) -> Arc<IndexMetadata> {
        let key_attrs = (0..columns.len() as u32).collect();
        let tuple_schema = Arc::new(Schema::new(columns));

        Arc::new(IndexMetadata::new(
            "factory_idx",
            1,
            1,
            1,
            shape,
            IndexConstraint::Default,
            tuple_schema,
            key_attrs,
            false,
        ))
    }

    fn retirement() -> Arc<RetirementQueue> {
        RetirementQueue::new(EpochManager::new(64))
    }

    #[test]
    fn every_shape_except_art_builds_without_a_loader() {
        let columns = vec![Column::new("a", SqlType::Integer)];

        for shape in [
            IndexShape::BwTree,
            IndexShape::BTree,
            IndexShape::SkipList,
            IndexShape::Hash,
        ] {
            let index = build_index(metadata(shape, columns.clone()), retirement(), None)
                .expect("shape should build");
            assert_eq!(index.metadata().shape, shape);
        }
    }

    #[test]
    fn art_requires_a_key_loader() {
        let columns = vec![Column::new("a", SqlType::Integer)];
        let result = build_index(metadata(IndexShape::Art, columns), retirement(), None);

        assert!(matches!(result, Err(IndexError::MissingKeyLoader)));
    }

    #[test]
    fn wide_keys_fall_back_to_the_tuple_key() {
        // 300 bytes of varchar exceeds the largest generic bucket; the
        // build must still succeed.
        let columns = vec![Column::new("v", SqlType::Varchar(300))];
        let index = build_index(metadata(IndexShape::BTree, columns), retirement(), None)
            .expect("tuple key fallback");

        assert!(index.supports_range_scan());
    }

    #[test]
    fn hash_shape_reports_no_range_support() {
        let columns = vec![Column::new("a", SqlType::BigInt)];
        let index =
            build_index(metadata(IndexShape::Hash, columns), retirement(), None).unwrap();

        assert!(!index.supports_range_scan());
    }
}
