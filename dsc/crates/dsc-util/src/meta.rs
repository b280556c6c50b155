//! Socket metadata and node definitions.
//!
//! A node definition describes one kind of node: its name, description, and
//! ordered sockets. Sockets before `start_output_index` are inputs, the rest
//! are outputs. A definition with `infinite_inputs` accepts any number of
//! inputs from its last declared input socket onwards, all sharing that
//! socket's metadata.

use crate::types::{self, DType, TypeSet};
use crate::value::DValue;

/// The metadata of one socket: its name, description, declared type (possibly
/// vague) and the literal used when no wire is connected.
#[derive(Clone, Debug, PartialEq)]
pub struct SocketMeta {
    pub name: String,
    pub description: String,
    pub typ: TypeSet,
    pub default: DValue,
}

impl SocketMeta {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        typ: impl Into<TypeSet>,
        default: DValue,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            typ: typ.into(),
            default,
        }
    }

    /// Is this an execution socket?
    pub fn is_execution(&self) -> bool {
        self.typ == TypeSet::from(DType::Execution)
    }
}

/// The definition of a kind of node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeDefinition {
    pub name: String,
    pub description: String,
    pub sockets: Vec<SocketMeta>,
    pub start_output_index: usize,
    pub infinite_inputs: bool,
}

impl NodeDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        sockets: Vec<SocketMeta>,
        start_output_index: usize,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            sockets,
            start_output_index,
            infinite_inputs: false,
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.start_output_index
    }

    pub fn num_outputs(&self) -> usize {
        self.sockets.len() - self.start_output_index
    }

    /// A definition is an execution definition iff at least one of its
    /// sockets is an execution socket.
    pub fn is_execution(&self) -> bool {
        self.sockets.iter().any(|s| s.is_execution())
    }

    pub fn is_socket_index_valid(&self, socket_index: usize) -> bool {
        socket_index < self.sockets.len()
    }

    /// The inputs of the definition.
    pub fn inputs(&self) -> &[SocketMeta] {
        &self.sockets[..self.start_output_index]
    }

    /// The outputs of the definition.
    pub fn outputs(&self) -> &[SocketMeta] {
        &self.sockets[self.start_output_index..]
    }
}

/// Shorthand for building a socket with an empty description and a zero
/// default, used all over the core-op tables.
pub fn socket(name: &str, typ: impl Into<TypeSet>) -> SocketMeta {
    let typ = typ.into();
    let default = if typ == TypeSet::from(DType::Bool) {
        DValue::Bool(false)
    } else if typ == TypeSet::from(DType::String) {
        DValue::Str(String::new())
    } else if typ == TypeSet::from(DType::Float) {
        DValue::Float(0.0)
    } else {
        DValue::Int(0)
    };
    SocketMeta::new(name, "", typ, default)
}

/// An execution socket.
pub fn exec_socket(name: &str, description: &str) -> SocketMeta {
    SocketMeta::new(name, description, DType::Execution, DValue::Int(0))
}
