//! Literal values attached to sockets and tokens.

use crate::types::DType;
use crate::{float_to_word, DFloat, DInt};
use std::fmt;

/// A tagged literal value.
///
/// The variant always matches the type tag the value travels with; the
/// semantic pass checks this when connecting literals to sockets.
#[derive(Clone, Debug, PartialEq)]
pub enum DValue {
    Int(DInt),
    Float(DFloat),
    Str(String),
    Bool(bool),
}

impl DValue {
    /// The scalar type of this value.
    pub fn type_of(&self) -> DType {
        match self {
            DValue::Int(_) => DType::Int,
            DValue::Float(_) => DType::Float,
            DValue::Str(_) => DType::String,
            DValue::Bool(_) => DType::Bool,
        }
    }

    /// The value as a stack word.
    ///
    /// Floats yield their bit pattern, matching how the code generator pushes
    /// them; strings yield 0 since their word is only known at link time.
    pub fn as_word(&self) -> DInt {
        match self {
            DValue::Int(i) => *i,
            DValue::Float(f) => float_to_word(*f),
            DValue::Str(_) => 0,
            DValue::Bool(b) => *b as DInt,
        }
    }

    /// The value as an integer, converting floats numerically.
    pub fn as_int(&self) -> DInt {
        match self {
            DValue::Int(i) => *i,
            DValue::Float(f) => *f as DInt,
            DValue::Str(_) => 0,
            DValue::Bool(b) => *b as DInt,
        }
    }

    /// The value as a float, converting integers numerically.
    pub fn as_float(&self) -> DFloat {
        match self {
            DValue::Int(i) => *i as DFloat,
            DValue::Float(f) => *f,
            DValue::Str(_) => 0.0,
            DValue::Bool(b) => *b as u8 as DFloat,
        }
    }

    /// The string payload, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl Default for DValue {
    fn default() -> Self {
        DValue::Int(0)
    }
}

impl fmt::Display for DValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DValue::Int(i) => write!(f, "{}", i),
            DValue::Float(v) => write!(f, "{}", v),
            DValue::Str(s) => write!(f, "'{}'", s),
            DValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::word_to_float;

    #[test]
    fn test_type_of() {
        assert_eq!(DValue::Int(3).type_of(), DType::Int);
        assert_eq!(DValue::Float(1.5).type_of(), DType::Float);
        assert_eq!(DValue::Str("hi".into()).type_of(), DType::String);
        assert_eq!(DValue::Bool(true).type_of(), DType::Bool);
    }

    #[test]
    fn test_float_word_is_bit_pattern() {
        let value = DValue::Float(2.5);
        assert_eq!(word_to_float(value.as_word()), 2.5);
    }

    #[test]
    fn test_numeric_conversions() {
        assert_eq!(DValue::Int(2).as_float(), 2.0);
        assert_eq!(DValue::Float(2.9).as_int(), 2);
    }
}
