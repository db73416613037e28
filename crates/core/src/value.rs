//! SQL value types carried through index keys and scan predicates.
//!
//! Only the subset of the type system that can appear in an index key is
//! modeled here. Every type has a total order that the key codec preserves
//! byte-lexicographically, including floats (IEEE total ordering).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::Display;
use thiserror::Error;

/// The declared type of a column.
///
/// Varchar and varbinary carry their declared length, which is also the
/// number of bytes the key codec reserves for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Date,
    Timestamp,
    Varchar(u32),
    Varbinary(u32),
}

impl SqlType {
    /// Number of bytes this type occupies inside an encoded key.
    pub fn fixed_len(&self) -> usize {
        match self {
            SqlType::Boolean | SqlType::TinyInt => 1,
            SqlType::SmallInt => 2,
            SqlType::Integer | SqlType::Real | SqlType::Date => 4,
            SqlType::BigInt | SqlType::Double | SqlType::Timestamp => 8,
            SqlType::Varchar(len) | SqlType::Varbinary(len) => *len as usize,
        }
    }

    /// Whether the compact-ints key encoding can hold this type.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            SqlType::Boolean
                | SqlType::TinyInt
                | SqlType::SmallInt
                | SqlType::Integer
                | SqlType::BigInt
                | SqlType::Date
                | SqlType::Timestamp
        )
    }
}

impl Display for SqlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlType::Boolean => write!(f, "boolean"),
            SqlType::TinyInt => write!(f, "tinyint"),
            SqlType::SmallInt => write!(f, "smallint"),
            SqlType::Integer => write!(f, "integer"),
            SqlType::BigInt => write!(f, "bigint"),
            SqlType::Real => write!(f, "real"),
            SqlType::Double => write!(f, "double"),
            SqlType::Date => write!(f, "date"),
            SqlType::Timestamp => write!(f, "timestamp"),
            SqlType::Varchar(len) => write!(f, "varchar({len})"),
            SqlType::Varbinary(len) => write!(f, "varbinary({len})"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ValueError {
    #[error("cannot cast {from} to {to}")]
    Uncastable { from: &'static str, to: SqlType },

    #[error("value out of range for {0}")]
    OutOfRange(SqlType),

    #[error("unbound parameter placeholder {0}")]
    UnboundParameter(usize),
}

/// A runtime value.
///
/// `Parameter` is a placeholder slot produced by the planner for
/// parameterized queries; it never reaches the key codec, the scan
/// planner resolves it during late binding.
#[derive(Debug, Clone)]
pub enum Value {
    Boolean(bool),
    TinyInt(i8),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Real(f32),
    Double(f64),
    Date(u32),
    Timestamp(u64),
    Varchar(Vec<u8>),
    Varbinary(Vec<u8>),
    Parameter(usize),
}

impl Value {
    pub fn varchar(s: impl AsRef<str>) -> Self {
        Value::Varchar(s.as_ref().as_bytes().to_vec())
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Boolean(_) => "boolean",
            Value::TinyInt(_) => "tinyint",
            Value::SmallInt(_) => "smallint",
            Value::Integer(_) => "integer",
            Value::BigInt(_) => "bigint",
            Value::Real(_) => "real",
            Value::Double(_) => "double",
            Value::Date(_) => "date",
            Value::Timestamp(_) => "timestamp",
            Value::Varchar(_) => "varchar",
            Value::Varbinary(_) => "varbinary",
            Value::Parameter(_) => "parameter",
        }
    }

    pub fn is_parameter(&self) -> bool {
        matches!(self, Value::Parameter(_))
    }

    pub fn parameter_index(&self) -> Option<usize> {
        match self {
            Value::Parameter(idx) => Some(*idx),
            _ => None,
        }
    }

    /// The smallest value of a type, used for unbounded scan low keys.
    pub fn min_of(ty: &SqlType) -> Self {
        match ty {
            SqlType::Boolean => Value::Boolean(false),
            SqlType::TinyInt => Value::TinyInt(i8::MIN),
            SqlType::SmallInt => Value::SmallInt(i16::MIN),
            SqlType::Integer => Value::Integer(i32::MIN),
            SqlType::BigInt => Value::BigInt(i64::MIN),
            SqlType::Real => Value::Real(f32::NEG_INFINITY),
            SqlType::Double => Value::Double(f64::NEG_INFINITY),
            SqlType::Date => Value::Date(u32::MIN),
            SqlType::Timestamp => Value::Timestamp(u64::MIN),
            SqlType::Varchar(_) => Value::Varchar(Vec::new()),
            SqlType::Varbinary(_) => Value::Varbinary(Vec::new()),
        }
    }

    /// The largest value of a type, used for unbounded scan high keys.
    pub fn max_of(ty: &SqlType) -> Self {
        match ty {
            SqlType::Boolean => Value::Boolean(true),
            SqlType::TinyInt => Value::TinyInt(i8::MAX),
            SqlType::SmallInt => Value::SmallInt(i16::MAX),
            SqlType::Integer => Value::Integer(i32::MAX),
            SqlType::BigInt => Value::BigInt(i64::MAX),
            SqlType::Real => Value::Real(f32::INFINITY),
            SqlType::Double => Value::Double(f64::INFINITY),
            SqlType::Date => Value::Date(u32::MAX),
            SqlType::Timestamp => Value::Timestamp(u64::MAX),
            SqlType::Varchar(len) => Value::Varchar(vec![0xff; *len as usize]),
            SqlType::Varbinary(len) => Value::Varbinary(vec![0xff; *len as usize]),
        }
    }

    /// Whether this value already matches the declared column type.
    pub fn matches_type(&self, ty: &SqlType) -> bool {
        matches!(
            (self, ty),
            (Value::Boolean(_), SqlType::Boolean)
                | (Value::TinyInt(_), SqlType::TinyInt)
                | (Value::SmallInt(_), SqlType::SmallInt)
                | (Value::Integer(_), SqlType::Integer)
                | (Value::BigInt(_), SqlType::BigInt)
                | (Value::Real(_), SqlType::Real)
                | (Value::Double(_), SqlType::Double)
                | (Value::Date(_), SqlType::Date)
                | (Value::Timestamp(_), SqlType::Timestamp)
                | (Value::Varchar(_), SqlType::Varchar(_))
                | (Value::Varbinary(_), SqlType::Varbinary(_))
        )
    }

    /// Implicit coercion path used when a supplied value's type differs
    /// from the key column's declared type.
    pub fn cast_to(&self, ty: &SqlType) -> Result<Value, ValueError> {
        if self.matches_type(ty) {
            return Ok(self.clone());
        }

        let out_of_range = || ValueError::OutOfRange(*ty);

        let casted = match (self, ty) {
            (Value::Parameter(idx), _) => return Err(ValueError::UnboundParameter(*idx)),

            // integer widenings and checked narrowings
            (v, SqlType::TinyInt) => {
                Value::TinyInt(i8::try_from(v.as_i64(ty)?).map_err(|_| out_of_range())?)
            }
            (v, SqlType::SmallInt) => {
                Value::SmallInt(i16::try_from(v.as_i64(ty)?).map_err(|_| out_of_range())?)
            }
            (v, SqlType::Integer) => {
                Value::Integer(i32::try_from(v.as_i64(ty)?).map_err(|_| out_of_range())?)
            }
            (v, SqlType::BigInt) => Value::BigInt(v.as_i64(ty)?),

            // numeric to float
            (Value::Real(v), SqlType::Double) => Value::Double(*v as f64),
            (Value::Double(v), SqlType::Real) => Value::Real(*v as f32),
            (v, SqlType::Real) => Value::Real(v.as_i64(ty)? as f32),
            (v, SqlType::Double) => Value::Double(v.as_i64(ty)? as f64),

            // temporal widening
            (Value::Date(v), SqlType::Timestamp) => Value::Timestamp(*v as u64),
            (Value::Timestamp(v), SqlType::Date) => {
                Value::Date(u32::try_from(*v).map_err(|_| out_of_range())?)
            }

            // byte strings are interchangeable; the codec handles padding
            (Value::Varchar(v), SqlType::Varbinary(_)) => Value::Varbinary(v.clone()),
            (Value::Varbinary(v), SqlType::Varchar(_)) => Value::Varchar(v.clone()),

            (v, ty) => {
                return Err(ValueError::Uncastable {
                    from: v.kind_name(),
                    to: *ty,
                })
            }
        };

        Ok(casted)
    }

    fn as_i64(&self, target: &SqlType) -> Result<i64, ValueError> {
        match self {
            Value::Boolean(v) => Ok(*v as i64),
            Value::TinyInt(v) => Ok(*v as i64),
            Value::SmallInt(v) => Ok(*v as i64),
            Value::Integer(v) => Ok(*v as i64),
            Value::BigInt(v) => Ok(*v),
            Value::Date(v) => Ok(*v as i64),
            Value::Timestamp(v) => {
                i64::try_from(*v).map_err(|_| ValueError::OutOfRange(*target))
            }
            v => Err(ValueError::Uncastable {
                from: v.kind_name(),
                to: *target,
            }),
        }
    }

    fn same_variant_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::TinyInt(a), Value::TinyInt(b)) => Some(a.cmp(b)),
            (Value::SmallInt(a), Value::SmallInt(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::BigInt(a), Value::BigInt(b)) => Some(a.cmp(b)),
            (Value::Real(a), Value::Real(b)) => Some(a.total_cmp(b)),
            (Value::Double(a), Value::Double(b)) => Some(a.total_cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Varchar(a), Value::Varchar(b)) => Some(a.cmp(b)),
            (Value::Varbinary(a), Value::Varbinary(b)) => Some(a.cmp(b)),
            (Value::Parameter(a), Value::Parameter(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.same_variant_cmp(other) == Some(Ordering::Equal)
    }
}

// Lawful because float comparison goes through total_cmp, which is
// reflexive for NaN.
impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.same_variant_cmp(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_lens_follow_declared_widths() {
        assert_eq!(SqlType::TinyInt.fixed_len(), 1);
        assert_eq!(SqlType::Integer.fixed_len(), 4);
        assert_eq!(SqlType::Timestamp.fixed_len(), 8);
        assert_eq!(SqlType::Varchar(12).fixed_len(), 12);
    }

    #[test]
    fn integer_casts_check_range() {
        let wide = Value::BigInt(300);
        assert!(matches!(
            wide.cast_to(&SqlType::TinyInt),
            Err(ValueError::OutOfRange(_))
        ));
        assert_eq!(
            Value::SmallInt(42).cast_to(&SqlType::BigInt).unwrap(),
            Value::BigInt(42)
        );
    }

    #[test]
    fn parameters_do_not_cast() {
        assert!(matches!(
            Value::Parameter(0).cast_to(&SqlType::Integer),
            Err(ValueError::UnboundParameter(0))
        ));
    }

    #[test]
    fn float_comparison_uses_total_order() {
        assert!(Value::Double(f64::NEG_INFINITY) < Value::Double(-1.0));
        assert!(Value::Double(f64::NAN) == Value::Double(f64::NAN));
        assert!(Value::Double(-0.0) < Value::Double(0.0));
    }

    #[test]
    fn min_max_bracket_the_domain() {
        let ty = SqlType::Integer;
        assert!(Value::min_of(&ty) < Value::Integer(0));
        assert!(Value::Integer(0) < Value::max_of(&ty));

        let vty = SqlType::Varchar(4);
        assert!(Value::min_of(&vty) < Value::varchar("a"));
        assert!(Value::varchar("zzzz") < Value::max_of(&vty));
    }
}
