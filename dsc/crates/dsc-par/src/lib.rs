//! dsc-par - Parser for the Decision language.
//!
//! Recursive-descent LL(1) over the token stream. The grammar has two
//! top-level constructs:
//!
//! - property statements: `[ Name ( args? ) ] eos`
//! - node statements: `Name ( args? ) ( ~ lineList )? eos`
//!
//! On error the parser reports the offending file and line, drops the partial
//! statement, and resynchronises at the next end of statement so that one run
//! surfaces as many syntax errors as possible. Callers must not trust the
//! tree when the returned success flag is false.

mod ast;
mod parser;

pub use ast::{NodeArg, NodeStmt, PropertyArg, PropertyStmt, Stmt, SyntaxTree};
pub use parser::{parse, ParseResult};
