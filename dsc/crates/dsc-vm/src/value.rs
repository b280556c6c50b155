//! Stack values.
//!
//! Every stack entry carries a payload and a type tag. String entries may
//! own their payload or borrow it from the program image; owned payloads are
//! released deterministically when the entry is popped or overwritten, which
//! in Rust is simply the entry being dropped.

use dsc_util::{float_to_word, word_to_float, DFloat, DInt, DUInt};

/// A string payload on the stack.
#[derive(Clone, Debug, PartialEq)]
pub enum StrValue {
    /// The entry owns the string; it is released when the entry goes.
    Owned(String),
    /// An address of a string in the program image.
    Borrowed(DUInt),
}

/// One entry of the VM stack.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(DInt),
    Float(DFloat),
    Str(StrValue),
}

impl Value {
    /// Read the entry as an integer word.
    ///
    /// Floats yield their bit pattern, matching a raw stack slot being read
    /// with the wrong accessor; borrowed strings yield their address.
    pub fn as_int(&self) -> DInt {
        match self {
            Value::Int(i) => *i,
            Value::Float(f) => float_to_word(*f),
            Value::Str(StrValue::Borrowed(addr)) => *addr as DInt,
            Value::Str(StrValue::Owned(_)) => 0,
        }
    }

    /// Read the entry as a float, reinterpreting integer bit patterns.
    pub fn as_float(&self) -> DFloat {
        match self {
            Value::Int(i) => word_to_float(*i),
            Value::Float(f) => *f,
            Value::Str(_) => 0.0,
        }
    }

    /// Is the entry a non-zero word?
    pub fn is_truthy(&self) -> bool {
        self.as_int() != 0
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Int(0)
    }
}
