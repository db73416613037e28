//! Column schemas and the owned tuples that act as index key carriers.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::value::{SqlType, Value};
use crate::Oid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub sql_type: SqlType,
}

impl Column {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
        }
    }

    /// Bytes this column occupies inside an encoded key.
    pub fn fixed_len(&self) -> usize {
        self.sql_type.fixed_len()
    }
}

/// An ordered list of columns.
///
/// Both table schemas and index key schemas use this shape; a key schema
/// is produced by projecting the indexed columns out of a table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, idx: usize) -> &Column {
        &self.columns[idx]
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Total encoded length of a key over this schema.
    pub fn total_len(&self) -> usize {
        self.columns.iter().map(|c| c.fixed_len()).sum()
    }

    /// Whether every column can be packed by the compact-ints codec.
    pub fn is_integer_only(&self) -> bool {
        self.columns.iter().all(|c| c.sql_type.is_integer())
    }

    /// Build the key schema for the given column positions.
    pub fn project(&self, key_attrs: &[Oid]) -> Schema {
        let columns = key_attrs
            .iter()
            .map(|attr| self.columns[*attr as usize].clone())
            .collect();

        Schema { columns }
    }
}

/// An owned row of values over a schema.
///
/// Used as the carrier for index keys: the scan planner allocates key
/// tuples, fills their slots, and the key codec serializes them.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    schema: Arc<Schema>,
    values: Vec<Value>,
}

impl Tuple {
    /// Allocate a tuple with every slot set to the column minimum.
    pub fn new(schema: Arc<Schema>) -> Self {
        let values = schema
            .columns()
            .iter()
            .map(|c| Value::min_of(&c.sql_type))
            .collect();

        Self { schema, values }
    }

    /// Build a tuple directly from values.
    ///
    /// The value count must match the schema; slot types are the
    /// caller's responsibility (the planner casts before setting).
    pub fn from_values(schema: Arc<Schema>, values: Vec<Value>) -> Self {
        debug_assert_eq!(schema.column_count(), values.len());
        Self { schema, values }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn value(&self, idx: usize) -> &Value {
        &self.values[idx]
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn set_value(&mut self, idx: usize, value: Value) {
        debug_assert!(
            value.matches_type(&self.schema.column(idx).sql_type),
            "slot {} expects {} but got {}",
            idx,
            self.schema.column(idx).sql_type,
            value.kind_name(),
        );

        self.values[idx] = value;
    }

    pub fn column_count(&self) -> usize {
        self.values.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_schema() -> Schema {
        Schema::new(vec![
            Column::new("id", SqlType::Integer),
            Column::new("name", SqlType::Varchar(8)),
            Column::new("score", SqlType::Double),
        ])
    }

    #[test]
    fn projection_keeps_declaration_order() {
        let key = table_schema().project(&[2, 0]);

        assert_eq!(key.column_count(), 2);
        assert_eq!(key.column(0).name, "score");
        assert_eq!(key.column(1).name, "id");
        assert_eq!(key.total_len(), 12);
    }

    #[test]
    fn new_tuple_is_filled_with_minimums() {
        let schema = Arc::new(table_schema());
        let tuple = Tuple::new(schema);

        assert_eq!(tuple.value(0), &Value::Integer(i32::MIN));
        assert_eq!(tuple.value(1), &Value::Varchar(Vec::new()));
    }

    #[test]
    fn integer_only_detection() {
        assert!(!table_schema().is_integer_only());
        assert!(Schema::new(vec![
            Column::new("a", SqlType::BigInt),
            Column::new("b", SqlType::Date),
        ])
        .is_integer_only());
    }
}
