//! dsc-sem - Semantic analysis for the Decision language.
//!
//! Builds the node graph from a parsed syntax tree, resolves names across
//! the include tree, reduces vague socket types to concrete ones, and
//! rejects feedback loops. Also home to the graph IR, the sheet type that
//! owns everything through compilation, and the debug-info tables the code
//! generator fills in.

pub mod analysis;
pub mod core;
pub mod debug;
pub mod graph;
pub mod infer;
pub mod name;
pub mod sheet;

pub use analysis::IncludeContext;
pub use core::CoreOp;
pub use debug::{DebugInfo, InsExecInfo, InsNodeInfo, InsValueInfo};
pub use graph::{Graph, Node, NodeSocket, Wire};
pub use name::{NameDefinition, NameItem};
pub use sheet::{
    start_definition, InsToLink, LinkKind, LinkMeta, NativeDecl, Sheet, SheetFunction,
    SheetVariable,
};

use dsc_par::SyntaxTree;
use dsc_util::Handler;

/// Perform semantic analysis on a syntax tree.
///
/// Runs the four phases in order: properties, nodes, type reduction, loop
/// detection. Diagnostics go to the handler; callers should check it before
/// generating code.
pub fn scan(sheet: &mut Sheet, tree: &SyntaxTree, handler: &Handler, includes: &IncludeContext) {
    analysis::scan_properties(sheet, tree, handler, includes);
    analysis::scan_nodes(sheet, tree, handler);
    infer::reduce_types(sheet, handler);
    infer::detect_loops(sheet, handler);
}
