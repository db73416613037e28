//! Scan planning: turning a conjunction of column predicates into index
//! scan bounds.
//!
//! A conjunction like `a > 5 AND a <= 9 AND b = 'x'` becomes a low key and
//! a high key over the index key schema, plus bind lists for parameterized
//! slots that are filled in at execution time. Two corner cases carry
//! flags instead of keys: point queries (every key column pinned by
//! equality) and full index scans (a predicate shape the index cannot
//! narrow).

use thiserror::Error;
use tracing::trace;

use crate::metadata::IndexMetadata;
use crate::schema::Tuple;
use crate::value::{Value, ValueError};
use crate::{Oid, INVALID_OID};

/// Comparison operator of one column predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOp {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    In,
    Like,
    NotLike,
}

impl ScanOp {
    /// Whether a predicate with this operator constrains the scan's low
    /// key. Equality pins both bounds.
    pub fn defines_lower_bound(&self) -> bool {
        matches!(self, ScanOp::Equal | ScanOp::Greater | ScanOp::GreaterEqual)
    }

    /// Whether a predicate with this operator constrains the scan's high
    /// key.
    pub fn defines_upper_bound(&self) -> bool {
        matches!(self, ScanOp::Equal | ScanOp::Less | ScanOp::LessEqual)
    }

    /// Operators the planner cannot turn into key bounds; any one of them
    /// degrades the whole conjunction to a full index scan.
    pub fn is_non_optimizable(&self) -> bool {
        matches!(
            self,
            ScanOp::NotEqual | ScanOp::In | ScanOp::Like | ScanOp::NotLike
        )
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("predicate arity mismatch: {columns} columns vs {ops} operators")]
    ArityMismatch { columns: usize, ops: usize },

    #[error("tuple column {0} is not covered by the index")]
    ColumnNotIndexed(Oid),

    #[error(transparent)]
    Value(#[from] ValueError),
}

/// Fast path: check for operators that force a full index scan.
fn has_non_optimizable_op(ops: &[ScanOp]) -> bool {
    ops.iter().any(|op| op.is_non_optimizable())
}

/// Build the per-key-column bound table and detect point queries.
///
/// For each index key column the result holds `(lo, hi)`: indices into
/// the value array defining its lower and upper bound, or `INVALID_OID`
/// where the predicate leaves a side open. An equality fills both sides.
///
/// The predicate list may mention the same column more than once (e.g.
/// `a > 5 AND a < 3`) and only the first bound per side wins; redundant
/// or contradictory predicates are the executor's problem. Returns true
/// iff every key column is pinned by an equality, short-circuiting as
/// soon as the equality count covers all columns.
fn find_value_index(
    metadata: &IndexMetadata,
    tuple_column_ids: &[Oid],
    ops: &[ScanOp],
    value_index_list: &mut Vec<(Oid, Oid)>,
) -> Result<bool, ScanError> {
    let column_count = metadata.column_count();

    value_index_list.clear();
    value_index_list.resize(column_count, (INVALID_OID, INVALID_OID));

    // How many key columns have been pinned by an equality so far.
    let mut equality_count = 0;

    for (i, tuple_column) in tuple_column_ids.iter().enumerate() {
        let key_column = metadata.tuple_column_to_key_column(*tuple_column);
        if key_column == INVALID_OID {
            return Err(ScanError::ColumnNotIndexed(*tuple_column));
        }

        let slot = &mut value_index_list[key_column as usize];
        let op = ops[i];

        // An equality defines both sides, so the two checks run
        // independently rather than as if/else.
        if op.defines_lower_bound() && slot.0 == INVALID_OID {
            slot.0 = i as Oid;
        }

        if op.defines_upper_bound() && slot.1 == INVALID_OID {
            slot.1 = i as Oid;

            if slot.1 == slot.0 {
                equality_count += 1;

                if equality_count == column_count {
                    return Ok(true);
                }
            }
        }
    }

    Ok(false)
}

/// A series of AND-ed column predicates compiled against one index.
///
/// Holds the low-key and high-key templates plus the bind lists that map
/// parameter placeholders to key slots. For a full index scan no keys are
/// allocated; for a point query only the low key is used.
#[derive(Debug, Clone)]
pub struct ConjunctionScanPredicate {
    value_index_list: Vec<(Oid, Oid)>,

    // (key column, parameter index) pairs still waiting for a value.
    low_key_bind_list: Vec<(usize, usize)>,
    high_key_bind_list: Vec<(usize, usize)>,

    is_point_query: bool,
    full_index_scan: bool,

    low_key: Option<Tuple>,
    high_key: Option<Tuple>,
}

impl ConjunctionScanPredicate {
    pub fn new(
        metadata: &IndexMetadata,
        values: &[Value],
        tuple_column_ids: &[Oid],
        ops: &[ScanOp],
    ) -> Result<Self, ScanError> {
        if tuple_column_ids.len() != ops.len() {
            return Err(ScanError::ArityMismatch {
                columns: tuple_column_ids.len(),
                ops: ops.len(),
            });
        }

        if has_non_optimizable_op(ops) {
            return Ok(Self {
                value_index_list: Vec::new(),
                low_key_bind_list: Vec::new(),
                high_key_bind_list: Vec::new(),
                is_point_query: false,
                full_index_scan: true,
                low_key: None,
                high_key: None,
            });
        }

        let mut value_index_list = Vec::new();
        let is_point_query =
            find_value_index(metadata, tuple_column_ids, ops, &mut value_index_list)?;

        trace!(index = %metadata.name, point = is_point_query, "constructing scan interval");

        let key_schema = metadata.key_schema().clone();

        // A fresh tuple is pre-filled with column minimums, which is
        // exactly what an unbounded low side needs.
        let mut low_key = Tuple::new(key_schema.clone());
        let mut high_key = if is_point_query {
            None
        } else {
            Some(Tuple::new(key_schema.clone()))
        };

        let mut low_key_bind_list = Vec::new();
        let mut high_key_bind_list = Vec::new();

        for (key_column, &(lo, hi)) in value_index_list.iter().enumerate() {
            let column_type = &key_schema.column(key_column).sql_type;

            if lo != INVALID_OID {
                let value = &values[lo as usize];
                match value.parameter_index() {
                    Some(param) => low_key_bind_list.push((key_column, param)),
                    None => low_key.set_value(key_column, value.cast_to(column_type)?),
                }
            }

            if let Some(high_key) = high_key.as_mut() {
                if hi == INVALID_OID {
                    high_key.set_value(key_column, Value::max_of(column_type));
                } else {
                    let value = &values[hi as usize];
                    match value.parameter_index() {
                        Some(param) => high_key_bind_list.push((key_column, param)),
                        None => high_key.set_value(key_column, value.cast_to(column_type)?),
                    }
                }
            }
        }

        Ok(Self {
            value_index_list,
            low_key_bind_list,
            high_key_bind_list,
            is_point_query,
            full_index_scan: false,
            low_key: Some(low_key),
            high_key,
        })
    }

    /// Write late-bound parameter values into the key templates.
    ///
    /// Point queries bind only the low key; full index scans must not
    /// call this at all.
    pub fn bind_values(&mut self, values: &[Value]) -> Result<(), ScanError> {
        assert!(
            !self.full_index_scan,
            "nothing to bind on a full index scan"
        );

        let low_key = self.low_key.as_mut().expect("low key must exist");
        let schema = low_key.schema().clone();

        for &(key_column, param) in &self.low_key_bind_list {
            let column_type = &schema.column(key_column).sql_type;
            low_key.set_value(key_column, values[param].cast_to(column_type)?);
        }

        if let Some(high_key) = self.high_key.as_mut() {
            for &(key_column, param) in &self.high_key_bind_list {
                let column_type = &schema.column(key_column).sql_type;
                high_key.set_value(key_column, values[param].cast_to(column_type)?);
            }
        }

        Ok(())
    }

    pub fn is_point_query(&self) -> bool {
        self.is_point_query
    }

    pub fn is_full_index_scan(&self) -> bool {
        self.full_index_scan
    }

    /// Scan low key. Only meaningful for a bounded range scan.
    pub fn low_key(&self) -> &Tuple {
        assert!(!self.is_point_query && !self.full_index_scan);
        self.low_key.as_ref().expect("range scan has a low key")
    }

    /// Scan high key. Only meaningful for a bounded range scan.
    pub fn high_key(&self) -> &Tuple {
        assert!(!self.is_point_query && !self.full_index_scan);
        self.high_key.as_ref().expect("range scan has a high key")
    }

    /// The single lookup key of a point query.
    pub fn point_query_key(&self) -> &Tuple {
        assert!(self.is_point_query && !self.full_index_scan);
        self.low_key.as_ref().expect("point query has a key")
    }

    /// Number of parameter slots still bound at execution time.
    pub fn binding_count(&self) -> usize {
        self.low_key_bind_list.len() + self.high_key_bind_list.len()
    }

    /// The per-key-column (low, high) value indices; exposed for tests
    /// and diagnostics.
    pub fn value_index_list(&self) -> &[(Oid, Oid)] {
        &self.value_index_list
    }
}

/// A disjunction of conjunction predicates for one index scan.
///
/// The scan degenerates to a single full index scan as soon as any
/// conjunction does; there is no point running several partial scans and
/// unioning them when one pass over the index covers everything.
#[derive(Debug, Clone, Default)]
pub struct IndexScanPredicate {
    conjunctions: Vec<ConjunctionScanPredicate>,
    full_index_scan: bool,
}

impl IndexScanPredicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_conjunction(
        &mut self,
        metadata: &IndexMetadata,
        values: &[Value],
        tuple_column_ids: &[Oid],
        ops: &[ScanOp],
    ) -> Result<(), ScanError> {
        let conjunction =
            ConjunctionScanPredicate::new(metadata, values, tuple_column_ids, ops)?;

        self.full_index_scan = self.full_index_scan || conjunction.is_full_index_scan();
        self.conjunctions.push(conjunction);

        Ok(())
    }

    /// Bind parameter values into every conjunction.
    ///
    /// A predicate that has degraded into a full index scan skips
    /// binding entirely; the keys would never be read.
    pub fn bind_values(&mut self, values: &[Value]) -> Result<(), ScanError> {
        if self.full_index_scan {
            return Ok(());
        }

        for conjunction in &mut self.conjunctions {
            conjunction.bind_values(values)?;
        }

        Ok(())
    }

    pub fn conjunctions(&self) -> &[ConjunctionScanPredicate] {
        &self.conjunctions
    }

    pub fn is_full_index_scan(&self) -> bool {
        self.full_index_scan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{IndexConstraint, IndexShape};
    use crate::schema::{Column, Schema};
    use crate::value::SqlType;
    use std::sync::Arc;

    fn metadata() -> IndexMetadata {
        let tuple_schema = Arc::new(Schema::new(vec![
            Column::new("a", SqlType::Integer),
            Column::new("b", SqlType::Varchar(8)),
            Column::new("c", SqlType::BigInt),
        ]));

        IndexMetadata::new(
            "scan_idx",
            1,
            1,
            1,
            IndexShape::BTree,
            IndexConstraint::Default,
            tuple_schema,
            vec![0, 2],
            false,
        )
    }

    #[test]
    fn equalities_on_every_column_make_a_point_query() {
        let meta = metadata();
        let pred = ConjunctionScanPredicate::new(
            &meta,
            &[Value::Integer(7), Value::BigInt(9)],
            &[0, 2],
            &[ScanOp::Equal, ScanOp::Equal],
        )
        .unwrap();

        assert!(pred.is_point_query());
        assert!(!pred.is_full_index_scan());
        assert_eq!(pred.point_query_key().value(0), &Value::Integer(7));
        assert_eq!(pred.point_query_key().value(1), &Value::BigInt(9));
    }

    #[test]
    fn redundant_equalities_still_detect_point_query() {
        let meta = metadata();
        let pred = ConjunctionScanPredicate::new(
            &meta,
            &[Value::Integer(7), Value::BigInt(9), Value::Integer(8)],
            &[0, 2, 0],
            &[ScanOp::Equal, ScanOp::Equal, ScanOp::Equal],
        )
        .unwrap();

        // First bound per side wins; the trailing a = 8 is ignored here
        // and filtered by the executor.
        assert!(pred.is_point_query());
        assert_eq!(pred.point_query_key().value(0), &Value::Integer(7));
    }

    #[test]
    fn range_predicates_fill_open_sides_with_extremes() {
        let meta = metadata();
        let pred = ConjunctionScanPredicate::new(
            &meta,
            &[Value::Integer(5)],
            &[0],
            &[ScanOp::Greater],
        )
        .unwrap();

        assert!(!pred.is_point_query());
        assert_eq!(pred.low_key().value(0), &Value::Integer(5));
        assert_eq!(pred.low_key().value(1), &Value::BigInt(i64::MIN));
        assert_eq!(pred.high_key().value(0), &Value::Integer(i32::MAX));
        assert_eq!(pred.high_key().value(1), &Value::BigInt(i64::MAX));
    }

    #[test]
    fn non_optimizable_operator_forces_full_scan() {
        let meta = metadata();
        let pred = ConjunctionScanPredicate::new(
            &meta,
            &[Value::Integer(5)],
            &[0],
            &[ScanOp::NotEqual],
        )
        .unwrap();

        assert!(pred.is_full_index_scan());
        assert!(!pred.is_point_query());
        assert_eq!(pred.binding_count(), 0);
    }

    #[test]
    fn unindexed_column_is_rejected() {
        let meta = metadata();
        let result = ConjunctionScanPredicate::new(
            &meta,
            &[Value::varchar("x")],
            &[1],
            &[ScanOp::Equal],
        );

        assert!(matches!(result, Err(ScanError::ColumnNotIndexed(1))));
    }

    #[test]
    fn parameters_record_bind_slots_and_late_bind() {
        let meta = metadata();
        let mut pred = ConjunctionScanPredicate::new(
            &meta,
            &[Value::Parameter(0), Value::Parameter(1), Value::Parameter(2)],
            &[0, 0, 2],
            &[ScanOp::Greater, ScanOp::LessEqual, ScanOp::GreaterEqual],
        )
        .unwrap();

        assert_eq!(pred.binding_count(), 3);

        pred.bind_values(&[
            Value::Integer(100),
            Value::Integer(200),
            Value::BigInt(50),
        ])
        .unwrap();

        assert_eq!(pred.low_key().value(0), &Value::Integer(100));
        assert_eq!(pred.low_key().value(1), &Value::BigInt(50));
        assert_eq!(pred.high_key().value(0), &Value::Integer(200));
        assert_eq!(pred.high_key().value(1), &Value::BigInt(i64::MAX));
    }

    #[test]
    fn bind_values_applies_type_coercion() {
        let meta = metadata();
        let mut pred = ConjunctionScanPredicate::new(
            &meta,
            &[Value::Parameter(0)],
            &[2],
            &[ScanOp::Equal],
        )
        .unwrap();

        // One equality over a two-column key is a range, not a point
        // query; the parameter bounds column c on both sides.
        assert!(!pred.is_point_query());
        assert_eq!(pred.binding_count(), 2);

        // Column c is a BigInt; the parameter arrives as Integer.
        pred.bind_values(&[Value::Integer(42)]).unwrap();
        assert_eq!(pred.low_key().value(1), &Value::BigInt(42));
        assert_eq!(pred.high_key().value(1), &Value::BigInt(42));
    }

    #[test]
    fn disjunction_degrades_when_any_conjunction_does() {
        let meta = metadata();
        let mut pred = IndexScanPredicate::new();

        pred.add_conjunction(&meta, &[Value::Integer(5)], &[0], &[ScanOp::Equal])
            .unwrap();
        assert!(!pred.is_full_index_scan());

        pred.add_conjunction(&meta, &[Value::Integer(5)], &[0], &[ScanOp::Like])
            .unwrap();
        assert!(pred.is_full_index_scan());
    }
}
