//! Index key shapes.
//!
//! The codec produces byte strings whose lexicographic order equals SQL
//! order, so every key shape is just storage for those bytes plus a plain
//! byte comparison. Fixed-size shapes exist so that the index cores can be
//! monomorphized at build time and keep the hot path free of heap
//! allocation:
//!
//! - `CompactKey<N>`: integer-only schemas packed into 1..4 u64-sized
//!   slots (N in {8, 16, 24, 32}).
//! - `GenericKey<N>`: any schema whose encoded length fits N bytes
//!   (N in {4, 8, 16, 64, 256}), zero-padded.
//! - `TupleKey`: heap fallback for keys larger than the biggest bucket.
//!
//! Zero padding beyond the encoded length is harmless: all keys in one
//! index share a schema, so padded suffixes compare equal.

use std::fmt;

use crate::codec::{self, KeyCodecError};
use crate::schema::Tuple;

/// The contract every key shape satisfies.
///
/// Construction from a key tuple or from raw codec output, plus access to
/// the comparable byte form. Ordering is derived from the byte form;
/// consumers that hash keys (the cuckoo index) hash the byte form
/// directly.
pub trait IndexKey: Clone + Ord + Eq + Send + Sync + fmt::Debug + 'static {
    /// Encode a key tuple into this shape.
    fn from_tuple(tuple: &Tuple) -> Result<Self, KeyCodecError>;

    /// Wrap already-encoded key bytes.
    fn from_bytes(bytes: &[u8]) -> Result<Self, KeyCodecError>;

    /// The comparable byte form.
    fn as_bytes(&self) -> &[u8];
}

macro_rules! fixed_key_shape {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $name<const N: usize> {
            data: [u8; N],
        }

        impl<const N: usize> $name<N> {
            pub const WIDTH: usize = N;
        }

        impl<const N: usize> IndexKey for $name<N> {
            fn from_tuple(tuple: &Tuple) -> Result<Self, KeyCodecError> {
                let mut data = [0u8; N];
                codec::encode_tuple_into(tuple, &mut data)?;
                Ok(Self { data })
            }

            fn from_bytes(bytes: &[u8]) -> Result<Self, KeyCodecError> {
                if bytes.len() > N {
                    return Err(KeyCodecError::KeyTooLarge {
                        len: bytes.len(),
                        capacity: N,
                    });
                }

                let mut data = [0u8; N];
                data[..bytes.len()].copy_from_slice(bytes);
                Ok(Self { data })
            }

            fn as_bytes(&self) -> &[u8] {
                &self.data
            }
        }

        impl<const N: usize> fmt::Debug for $name<N> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "<{}>("), N)?;
                for byte in &self.data {
                    write!(f, "{byte:02x}")?;
                }
                write!(f, ")")
            }
        }
    };
}

fixed_key_shape!(
    CompactKey,
    "Packed integer-only key: up to four u64-sized slots of \
     endianness-normalized, sign-flipped integers."
);

fixed_key_shape!(
    GenericKey,
    "Fixed-size bucket for arbitrary key schemas, zero-padded to N bytes."
);

/// Variable-length key for schemas wider than the largest fixed bucket.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TupleKey {
    data: Box<[u8]>,
}

impl IndexKey for TupleKey {
    fn from_tuple(tuple: &Tuple) -> Result<Self, KeyCodecError> {
        Ok(Self {
            data: codec::encode_tuple(tuple)?.into_boxed_slice(),
        })
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, KeyCodecError> {
        Ok(Self {
            data: bytes.to_vec().into_boxed_slice(),
        })
    }

    fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for TupleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TupleKey(")?;
        for byte in self.data.iter() {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}
