//! The syntax tree.
//!
//! Statements are a closed sum: a property declaration or a node
//! instantiation. Both keep the 1-based line they started on for
//! diagnostics.

use dsc_util::{DInt, DType, DValue};

/// A parsed source file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyntaxTree {
    pub stmts: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Property(PropertyStmt),
    Node(NodeStmt),
}

impl Stmt {
    pub fn line(&self) -> usize {
        match self {
            Stmt::Property(p) => p.line,
            Stmt::Node(n) => n.line,
        }
    }
}

/// `[ Name ( args? ) ]` — declares variables, functions, subroutines,
/// function sockets, and includes.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyStmt {
    pub name: String,
    pub args: Vec<PropertyArg>,
    pub line: usize,
}

/// An argument of a property statement.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyArg {
    Name(String),
    Literal(DValue),
    DataType(DType),
}

/// `Name ( args? ) ( ~ lineList )?` — instantiates a node. The trailing line
/// list names the node's outputs.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeStmt {
    pub name: String,
    pub args: Vec<NodeArg>,
    pub outputs: Vec<DInt>,
    pub line: usize,
}

/// An argument of a node statement.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeArg {
    Name(String),
    Literal(DValue),
    /// A `#<int>` line identifier connecting this input to a named output.
    Line(DInt),
}
