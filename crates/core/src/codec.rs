//! Order-preserving key encoding.
//!
//! Every indexed column is serialized so that plain byte comparison of the
//! concatenated key equals SQL comparison of the original values:
//!
//! | SQL type | Encoding |
//! |----------|----------|
//! | boolean | 1 byte, 0 or 1 |
//! | tinyint/smallint/integer/bigint | big-endian, sign bit flipped |
//! | real/double | IEEE bits, big-endian, total-order transform |
//! | date/timestamp | unsigned big-endian |
//! | varchar/varbinary | raw bytes, zero-padded to the declared length |
//!
//! The float transform flips the top bit for non-negative values and all
//! bits for negative ones, which makes byte order agree with the IEEE
//! total ordering (including NaN and signed zero).

use thiserror::Error;

use crate::schema::Tuple;
use crate::value::{SqlType, Value};
use crate::TupleLocator;

#[derive(Debug, Error)]
pub enum KeyCodecError {
    #[error("key slot holds {found} but column is declared {declared}")]
    TypeMismatch {
        declared: SqlType,
        found: &'static str,
    },

    #[error("unbound parameter placeholder in key slot {0}")]
    UnboundParameter(usize),

    #[error("encoded key is {len} bytes but the key buffer holds {capacity}")]
    KeyTooLarge { len: usize, capacity: usize },

    #[error("cannot load key for locator {0}")]
    RowUnavailable(TupleLocator),
}

/// Serialize one value at `offset` inside `out`.
///
/// `declared` drives both the byte layout and, for byte strings, the
/// reserved width. Returns the number of bytes written.
pub fn encode_value_at(
    value: &Value,
    declared: &SqlType,
    out: &mut [u8],
    offset: usize,
) -> Result<usize, KeyCodecError> {
    let width = declared.fixed_len();
    debug_assert!(offset + width <= out.len());

    let mismatch = || KeyCodecError::TypeMismatch {
        declared: *declared,
        found: value.kind_name(),
    };

    match (value, declared) {
        (Value::Boolean(v), SqlType::Boolean) => {
            out[offset] = *v as u8;
        }
        (Value::TinyInt(v), SqlType::TinyInt) => {
            out[offset] = (*v as u8) ^ 0x80;
        }
        (Value::SmallInt(v), SqlType::SmallInt) => {
            let flipped = (*v as u16) ^ (1 << 15);
            out[offset..offset + 2].copy_from_slice(&flipped.to_be_bytes());
        }
        (Value::Integer(v), SqlType::Integer) => {
            let flipped = (*v as u32) ^ (1 << 31);
            out[offset..offset + 4].copy_from_slice(&flipped.to_be_bytes());
        }
        (Value::BigInt(v), SqlType::BigInt) => {
            let flipped = (*v as u64) ^ (1 << 63);
            out[offset..offset + 8].copy_from_slice(&flipped.to_be_bytes());
        }
        (Value::Real(v), SqlType::Real) => {
            let bits = v.to_bits();
            let ordered = if bits & (1 << 31) == 0 {
                bits ^ (1 << 31)
            } else {
                !bits
            };
            out[offset..offset + 4].copy_from_slice(&ordered.to_be_bytes());
        }
        (Value::Double(v), SqlType::Double) => {
            let bits = v.to_bits();
            let ordered = if bits & (1 << 63) == 0 {
                bits ^ (1 << 63)
            } else {
                !bits
            };
            out[offset..offset + 8].copy_from_slice(&ordered.to_be_bytes());
        }
        (Value::Date(v), SqlType::Date) => {
            out[offset..offset + 4].copy_from_slice(&v.to_be_bytes());
        }
        (Value::Timestamp(v), SqlType::Timestamp) => {
            out[offset..offset + 8].copy_from_slice(&v.to_be_bytes());
        }
        (Value::Varchar(bytes), SqlType::Varchar(_))
        | (Value::Varbinary(bytes), SqlType::Varbinary(_))
        | (Value::Varchar(bytes), SqlType::Varbinary(_))
        | (Value::Varbinary(bytes), SqlType::Varchar(_)) => {
            let used = bytes.len().min(width);
            out[offset..offset + used].copy_from_slice(&bytes[..used]);
            out[offset + used..offset + width].fill(0);
        }
        (Value::Parameter(idx), _) => return Err(KeyCodecError::UnboundParameter(*idx)),
        _ => return Err(mismatch()),
    }

    Ok(width)
}

/// Serialize a key tuple into a caller-provided buffer.
///
/// Used by the fixed-size key shapes to encode straight into their stack
/// storage. Returns the encoded length. Fails with `KeyTooLarge` when the
/// schema does not fit the buffer.
pub fn encode_tuple_into(tuple: &Tuple, out: &mut [u8]) -> Result<usize, KeyCodecError> {
    let schema = tuple.schema();
    let len = schema.total_len();

    if len > out.len() {
        return Err(KeyCodecError::KeyTooLarge {
            len,
            capacity: out.len(),
        });
    }

    let mut offset = 0;
    for (idx, column) in schema.columns().iter().enumerate() {
        offset += encode_value_at(tuple.value(idx), &column.sql_type, out, offset)?;
    }

    debug_assert_eq!(offset, len);
    Ok(offset)
}

/// Serialize a key tuple into a fresh byte vector.
pub fn encode_tuple(tuple: &Tuple) -> Result<Vec<u8>, KeyCodecError> {
    let mut out = vec![0u8; tuple.schema().total_len()];
    encode_tuple_into(tuple, &mut out)?;
    Ok(out)
}

/// Recovers the encoded key bytes for a tuple locator.
///
/// The radix index stores only locators at its leaves; when path
/// compression has dropped key bytes it asks the storage layer, through
/// this handle, to re-read the row and re-encode its indexed columns.
pub trait KeyLoader: Send + Sync {
    fn load_key(&self, locator: TupleLocator) -> Result<Vec<u8>, KeyCodecError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, Schema};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn encode_single(value: Value, ty: SqlType) -> Vec<u8> {
        let schema = Arc::new(Schema::new(vec![Column::new("k", ty)]));
        let tuple = Tuple::from_values(schema, vec![value]);
        encode_tuple(&tuple).unwrap()
    }

    #[test]
    fn signed_integers_sort_across_zero() {
        let lo = encode_single(Value::Integer(-5), SqlType::Integer);
        let mid = encode_single(Value::Integer(0), SqlType::Integer);
        let hi = encode_single(Value::Integer(5), SqlType::Integer);

        assert!(lo < mid);
        assert!(mid < hi);
    }

    #[test]
    fn varchar_is_padded_to_declared_length() {
        let short = encode_single(Value::varchar("ab"), SqlType::Varchar(4));
        assert_eq!(short, vec![b'a', b'b', 0, 0]);

        let long = encode_single(Value::varchar("abcdef"), SqlType::Varchar(4));
        assert_eq!(long, vec![b'a', b'b', b'c', b'd']);
    }

    #[test]
    fn negative_doubles_order_correctly() {
        let a = encode_single(Value::Double(-2.0), SqlType::Double);
        let b = encode_single(Value::Double(-1.0), SqlType::Double);
        let c = encode_single(Value::Double(0.0), SqlType::Double);
        let d = encode_single(Value::Double(f64::INFINITY), SqlType::Double);

        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn composite_keys_compare_column_by_column() {
        let schema = Arc::new(Schema::new(vec![
            Column::new("a", SqlType::Integer),
            Column::new("b", SqlType::Varchar(4)),
        ]));

        let k1 = encode_tuple(&Tuple::from_values(
            schema.clone(),
            vec![Value::Integer(100), Value::varchar("b")],
        ))
        .unwrap();
        let k2 = encode_tuple(&Tuple::from_values(
            schema,
            vec![Value::Integer(200), Value::varchar("a")],
        ))
        .unwrap();

        assert!(k1 < k2);
    }

    #[test]
    fn unbound_parameter_is_rejected() {
        let schema = Arc::new(Schema::new(vec![Column::new("k", SqlType::Integer)]));
        let tuple = Tuple::from_values(schema, vec![Value::Parameter(0)]);

        assert!(matches!(
            encode_tuple(&tuple),
            Err(KeyCodecError::UnboundParameter(0))
        ));
    }

    #[test]
    fn boolean_and_temporal_encodings_order() {
        let f = encode_single(Value::Boolean(false), SqlType::Boolean);
        let t = encode_single(Value::Boolean(true), SqlType::Boolean);
        assert!(f < t);

        let d1 = encode_single(Value::Date(19_000), SqlType::Date);
        let d2 = encode_single(Value::Date(20_000), SqlType::Date);
        assert!(d1 < d2);

        let t1 = encode_single(Value::Timestamp(1_000_000), SqlType::Timestamp);
        let t2 = encode_single(Value::Timestamp(2_000_000), SqlType::Timestamp);
        assert!(t1 < t2);
    }

    #[test]
    fn tinyint_sign_flip_orders_across_zero() {
        let lo = encode_single(Value::TinyInt(i8::MIN), SqlType::TinyInt);
        let neg = encode_single(Value::TinyInt(-1), SqlType::TinyInt);
        let zero = encode_single(Value::TinyInt(0), SqlType::TinyInt);
        let hi = encode_single(Value::TinyInt(i8::MAX), SqlType::TinyInt);

        assert!(lo < neg);
        assert!(neg < zero);
        assert!(zero < hi);
        assert_eq!(lo, vec![0x00]);
        assert_eq!(hi, vec![0xff]);
    }

    proptest! {
        #[test]
        fn bigint_encoding_preserves_order(a: i64, b: i64) {
            let ea = encode_single(Value::BigInt(a), SqlType::BigInt);
            let eb = encode_single(Value::BigInt(b), SqlType::BigInt);
            prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
        }

        #[test]
        fn double_encoding_preserves_total_order(a: f64, b: f64) {
            let ea = encode_single(Value::Double(a), SqlType::Double);
            let eb = encode_single(Value::Double(b), SqlType::Double);
            prop_assert_eq!(a.total_cmp(&b), ea.cmp(&eb));
        }

        #[test]
        fn smallint_encoding_preserves_order(a: i16, b: i16) {
            let ea = encode_single(Value::SmallInt(a), SqlType::SmallInt);
            let eb = encode_single(Value::SmallInt(b), SqlType::SmallInt);
            prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
        }

        #[test]
        fn real_encoding_preserves_total_order(a: f32, b: f32) {
            let ea = encode_single(Value::Real(a), SqlType::Real);
            let eb = encode_single(Value::Real(b), SqlType::Real);
            prop_assert_eq!(a.total_cmp(&b), ea.cmp(&eb));
        }

        #[test]
        fn varbinary_encoding_preserves_order_at_fixed_width(
            a in proptest::collection::vec(0u8..=255, 0..8),
            b in proptest::collection::vec(0u8..=255, 0..8),
        ) {
            let ea = encode_single(Value::Varbinary(a.clone()), SqlType::Varbinary(8));
            let eb = encode_single(Value::Varbinary(b.clone()), SqlType::Varbinary(8));

            // Zero padding to the declared width preserves byte order
            // for values that fit.
            let mut pa = a;
            pa.resize(8, 0);
            let mut pb = b;
            pb.resize(8, 0);
            prop_assert_eq!(pa.cmp(&pb), ea.cmp(&eb));
        }
    }
}
