//! Sheets: the compilation unit.
//!
//! A sheet owns its include tree, its variables, functions and native
//! declarations, the graph built from its source, and, once compiled, the
//! text and data sections plus the link metadata needed to run or serialise
//! it.

use crate::debug::DebugInfo;
use crate::graph::Graph;
use dsc_util::meta::exec_socket;
use dsc_util::{DType, NodeDefinition, SocketMeta};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// A variable defined on a sheet.
#[derive(Clone, Debug, PartialEq)]
pub struct SheetVariable {
    pub meta: SocketMeta,
}

/// A function or subroutine defined on a sheet.
///
/// Alongside the callable definition, each function carries the synthesised
/// definitions of its `Define` and `Return` nodes, plus counters the node
/// phase uses to enforce that each appears the right number of times.
#[derive(Clone, Debug)]
pub struct SheetFunction {
    pub definition: Rc<NodeDefinition>,
    pub define_definition: Rc<NodeDefinition>,
    pub return_definition: Rc<NodeDefinition>,
    pub define_node: Option<usize>,
    pub num_define_nodes: usize,
    pub last_return_node: Option<usize>,
    pub num_return_nodes: usize,
}

impl SheetFunction {
    pub fn is_subroutine(&self) -> bool {
        self.definition.is_execution()
    }
}

/// A native function the sheet requires from the host registry.
#[derive(Clone, Debug)]
pub struct NativeDecl {
    pub definition: Rc<NodeDefinition>,
}

/// What kind of object a link record points to.
///
/// The discriminants are the object-format byte values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkKind {
    /// A string literal in the data section.
    StringLiteral = 0,
    /// A variable that stores its data directly.
    Variable = 1,
    /// A variable whose storage cell holds an owning pointer, e.g. a String.
    VariablePointer = 2,
    /// The default value of a string variable.
    VariableStringDefault = 3,
    /// A user function.
    Function = 4,
    /// A native function provided by the host.
    CFunction = 5,
}

impl LinkKind {
    pub fn from_byte(byte: u8) -> Option<LinkKind> {
        match byte {
            0 => Some(LinkKind::StringLiteral),
            1 => Some(LinkKind::Variable),
            2 => Some(LinkKind::VariablePointer),
            3 => Some(LinkKind::VariableStringDefault),
            4 => Some(LinkKind::Function),
            5 => Some(LinkKind::CFunction),
            _ => None,
        }
    }
}

/// A link record: a symbol an instruction or data slot refers to.
///
/// `ptr` is the symbol's offset in this sheet's own data section (variables,
/// string literals) or text section (functions). `None` means the symbol
/// lives in another sheet and the linker must find it by name.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkMeta {
    pub kind: LinkKind,
    pub name: String,
    pub ptr: Option<usize>,
}

impl LinkMeta {
    pub fn new(kind: LinkKind, name: impl Into<String>) -> Self {
        LinkMeta {
            kind,
            name: name.into(),
            ptr: None,
        }
    }
}

/// A relocation: instruction `ins` (a byte offset into the text section)
/// must be patched with the resolved value of link record `link`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InsToLink {
    pub ins: usize,
    pub link: usize,
}

/// A compilation unit.
#[derive(Debug, Default)]
pub struct Sheet {
    pub file_path: PathBuf,
    /// The path this sheet was included by, as written in source.
    pub include_path: Option<String>,
    pub includes: Vec<Sheet>,
    pub variables: Vec<SheetVariable>,
    pub functions: Vec<SheetFunction>,
    pub natives: Vec<NativeDecl>,

    pub graph: Graph,
    pub start_node: Option<usize>,
    pub num_starts: usize,

    pub has_errors: bool,

    // Compiled artifacts.
    pub is_compiled: bool,
    pub text: Vec<u8>,
    pub data: Vec<u8>,
    pub links: Vec<LinkMeta>,
    pub ins_links: Vec<InsToLink>,
    /// Byte offset of the `Start` stream's first real instruction.
    pub main: Option<usize>,
    pub debug_info: Option<DebugInfo>,
}

impl Sheet {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Sheet {
            file_path: file_path.into(),
            ..Sheet::default()
        }
    }

    /// The path as shown in diagnostics.
    pub fn file_name(&self) -> String {
        self.file_path.display().to_string()
    }

    /// The directory include paths resolve relative to.
    pub fn directory(&self) -> &Path {
        self.file_path.parent().unwrap_or_else(|| Path::new(""))
    }

    pub fn add_variable(&mut self, meta: SocketMeta) {
        self.variables.push(SheetVariable { meta });
    }

    /// Add a function, synthesising the definitions of its `Define` and
    /// `Return` nodes.
    ///
    /// `Define` has a name input naming the function, then the function's
    /// inputs as outputs (so the body can read its arguments). `Return` has a
    /// name input, then the function's outputs as inputs.
    pub fn add_function(&mut self, definition: NodeDefinition) {
        let mut define_sockets = vec![SocketMeta::new(
            "function/subroutine",
            "The function or subroutine to define.",
            DType::Name,
            dsc_util::DValue::Str(definition.name.clone()),
        )];
        define_sockets.extend(definition.inputs().iter().cloned());

        let define_definition = NodeDefinition::new(
            "Define",
            "Define a function or subroutine.",
            define_sockets,
            1,
        );

        let mut return_sockets = vec![SocketMeta::new(
            "function/subroutine",
            "The function or subroutine to return from.",
            DType::Name,
            dsc_util::DValue::Str(definition.name.clone()),
        )];
        return_sockets.extend(definition.outputs().iter().cloned());
        let num_return_sockets = return_sockets.len();

        let return_definition = NodeDefinition::new(
            "Return",
            "Return from a function or subroutine.",
            return_sockets,
            num_return_sockets,
        );

        self.functions.push(SheetFunction {
            definition: Rc::new(definition),
            define_definition: Rc::new(define_definition),
            return_definition: Rc::new(return_definition),
            define_node: None,
            num_define_nodes: 0,
            last_return_node: None,
            num_return_nodes: 0,
        });
    }

    pub fn add_native(&mut self, definition: NodeDefinition) {
        self.natives.push(NativeDecl {
            definition: Rc::new(definition),
        });
    }

    pub fn add_include(&mut self, include: Sheet) {
        self.includes.push(include);
    }
}

/// The definition of the `Start` node: a single execution output that is the
/// sheet's entry point.
pub fn start_definition() -> NodeDefinition {
    NodeDefinition::new(
        "Start",
        "The entry point of the sheet.",
        vec![exec_socket(
            "main",
            "Activated when the sheet starts running.",
        )],
        0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsc_util::meta::socket;
    use dsc_util::types;

    fn double_definition() -> NodeDefinition {
        NodeDefinition::new(
            "Double",
            "Double a number.",
            vec![
                socket("value", DType::Float),
                socket("doubled", DType::Float),
            ],
            1,
        )
    }

    fn subroutine_definition() -> NodeDefinition {
        NodeDefinition::new(
            "Greet",
            "",
            vec![
                exec_socket("before", ""),
                socket("name", DType::String),
                socket("greeting", DType::String),
                exec_socket("after", ""),
            ],
            2,
        )
    }

    #[test]
    fn test_define_definition_exposes_inputs_as_outputs() {
        let mut sheet = Sheet::new("test.dc");
        sheet.add_function(double_definition());

        let func = &sheet.functions[0];
        assert!(!func.is_subroutine());

        let define = &func.define_definition;
        assert_eq!(define.num_inputs(), 1);
        assert_eq!(define.sockets[0].typ, types::TypeSet::from(DType::Name));
        assert_eq!(define.num_outputs(), 1);
        assert_eq!(define.sockets[1].name, "value");
    }

    #[test]
    fn test_return_definition_takes_outputs_as_inputs() {
        let mut sheet = Sheet::new("test.dc");
        sheet.add_function(double_definition());

        let ret = &sheet.functions[0].return_definition;
        assert_eq!(ret.num_inputs(), 2);
        assert_eq!(ret.sockets[1].name, "doubled");
        assert_eq!(ret.num_outputs(), 0);
    }

    #[test]
    fn test_subroutine_keeps_execution_sockets() {
        let mut sheet = Sheet::new("test.dc");
        sheet.add_function(subroutine_definition());

        let func = &sheet.functions[0];
        assert!(func.is_subroutine());

        // Define's first output is the subroutine's "before" socket, which
        // is where the body's execution chain starts.
        let define = &func.define_definition;
        assert!(define.sockets[1].is_execution());
    }

    #[test]
    fn test_start_definition() {
        let def = start_definition();
        assert_eq!(def.num_inputs(), 0);
        assert_eq!(def.num_outputs(), 1);
        assert!(def.is_execution());
    }

    #[test]
    fn test_link_kind_bytes_round_trip() {
        for kind in [
            LinkKind::StringLiteral,
            LinkKind::Variable,
            LinkKind::VariablePointer,
            LinkKind::VariableStringDefault,
            LinkKind::Function,
            LinkKind::CFunction,
        ] {
            assert_eq!(LinkKind::from_byte(kind as u8), Some(kind));
        }
        assert_eq!(LinkKind::from_byte(6), None);
    }
}
