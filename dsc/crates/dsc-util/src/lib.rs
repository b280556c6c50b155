//! dsc-util - Foundation types for the Decision compiler and VM.
//!
//! This crate holds everything more than one pipeline stage needs to agree
//! on: the scalar value model, the data-type bitset, socket and node
//! definitions, the word-width configuration, and the diagnostics handler
//! that accumulates compile errors per compilation.

pub mod diagnostic;
pub mod meta;
pub mod types;
pub mod value;

pub use diagnostic::{Diagnostic, Handler, Level};
pub use meta::{NodeDefinition, SocketMeta};
pub use types::{DType, TypeSet};
pub use value::DValue;

// Re-export the hash map used for hot compiler-internal tables.
pub use rustc_hash::FxHashMap;
pub use rustc_hash::FxHashSet;

/// A signed integer of the language's word width.
#[cfg(feature = "bits32")]
pub type DInt = i32;
/// A signed integer of the language's word width.
#[cfg(not(feature = "bits32"))]
pub type DInt = i64;

/// An unsigned integer of the language's word width.
#[cfg(feature = "bits32")]
pub type DUInt = u32;
/// An unsigned integer of the language's word width.
#[cfg(not(feature = "bits32"))]
pub type DUInt = u64;

/// A floating point number of the language's word width.
#[cfg(feature = "bits32")]
pub type DFloat = f32;
/// A floating point number of the language's word width.
#[cfg(not(feature = "bits32"))]
pub type DFloat = f64;

/// The size of a language word in bytes.
pub const WORD_SIZE: usize = std::mem::size_of::<DInt>();

/// Reinterpret the bits of a word as a float.
pub fn word_to_float(word: DInt) -> DFloat {
    DFloat::from_bits(word as DUInt)
}

/// Reinterpret the bits of a float as a word.
pub fn float_to_word(value: DFloat) -> DInt {
    value.to_bits() as DInt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_size_matches_types() {
        assert_eq!(WORD_SIZE, std::mem::size_of::<DUInt>());
        assert_eq!(WORD_SIZE, std::mem::size_of::<DFloat>());
    }

    #[test]
    fn test_float_word_round_trip() {
        for value in [0.0, 1.5, -2.25, 1234.5678] {
            assert_eq!(word_to_float(float_to_word(value)), value);
        }
    }
}
