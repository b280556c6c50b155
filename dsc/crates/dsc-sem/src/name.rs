//! Name resolution.
//!
//! A textual name can refer to a core op, a variable, a user function, or a
//! native function, on the sheet itself or anywhere in its include tree.
//! Resolved names are stored as an include *path* (indices into each sheet's
//! include list) plus an item reference, so sheets stay purely owned data
//! with no cross-sheet pointers.

use crate::core::CoreOp;
use crate::sheet::Sheet;
use dsc_util::{Handler, NodeDefinition};
use std::rc::Rc;

/// What a name refers to within one sheet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NameItem {
    Core(CoreOp),
    /// Index into the defining sheet's variable list.
    Variable(usize),
    /// Index into the defining sheet's function list.
    Function(usize),
    /// Index into the defining sheet's native-function list.
    Native(usize),
}

/// Where a name is defined: the include path from the sheet the search
/// started at (empty = that sheet itself), and the item within it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameDefinition {
    pub path: Vec<usize>,
    pub item: NameItem,
}

impl NameDefinition {
    pub fn core(op: CoreOp) -> Self {
        NameDefinition {
            path: Vec::new(),
            item: NameItem::Core(op),
        }
    }

    pub fn local(item: NameItem) -> Self {
        NameDefinition {
            path: Vec::new(),
            item,
        }
    }

    /// Is the referenced item defined on the sheet the search started at?
    pub fn is_local(&self) -> bool {
        self.path.is_empty()
    }
}

/// Follow an include path from a sheet to the sheet it names.
pub fn sheet_at_path<'a>(sheet: &'a Sheet, path: &[usize]) -> &'a Sheet {
    let mut current = sheet;
    for &index in path {
        current = &current.includes[index];
    }
    current
}

/// Get all of the places where a name is defined.
///
/// The search order is fixed: the core-op table, then the sheet's own
/// variables, functions and native functions, then the includes depth-first
/// in declaration order. Multiple hits are an ambiguity error at the use
/// site; zero hits an unknown-name error.
pub fn get_name_definitions(sheet: &Sheet, name: &str) -> Vec<NameDefinition> {
    let mut found = Vec::new();

    if let Some(op) = CoreOp::find_name(name) {
        found.push(NameDefinition::core(op));
    }

    collect_from_sheet(sheet, name, &mut Vec::new(), &mut found);
    found
}

fn collect_from_sheet(
    sheet: &Sheet,
    name: &str,
    path: &mut Vec<usize>,
    found: &mut Vec<NameDefinition>,
) {
    for (index, variable) in sheet.variables.iter().enumerate() {
        if variable.meta.name == name {
            found.push(NameDefinition {
                path: path.clone(),
                item: NameItem::Variable(index),
            });
        }
    }

    for (index, function) in sheet.functions.iter().enumerate() {
        if function.definition.name == name {
            found.push(NameDefinition {
                path: path.clone(),
                item: NameItem::Function(index),
            });
        }
    }

    for (index, native) in sheet.natives.iter().enumerate() {
        if native.definition.name == name {
            found.push(NameDefinition {
                path: path.clone(),
                item: NameItem::Native(index),
            });
        }
    }

    for (index, include) in sheet.includes.iter().enumerate() {
        path.push(index);
        collect_from_sheet(include, name, path, found);
        path.pop();
    }
}

/// Select the single definition of a name, erroring on zero or many.
pub fn select_name_definition(
    sheet: &Sheet,
    name: &str,
    line: usize,
    handler: &Handler,
) -> Option<NameDefinition> {
    let mut definitions = get_name_definitions(sheet, name);

    match definitions.len() {
        0 => {
            handler.error(
                &sheet.file_name(),
                line,
                format!("Name {} is not defined", name),
            );
            None
        }
        1 => Some(definitions.remove(0)),
        _ => {
            handler.error(
                &sheet.file_name(),
                line,
                format!("Name {} is defined multiple times", name),
            );
            None
        }
    }
}

/// Get the node definition a name definition instantiates as.
///
/// Variables become their getter definition: a node with a single output
/// socket carrying the variable's metadata.
pub fn node_definition_of(sheet: &Sheet, name_def: &NameDefinition) -> Rc<NodeDefinition> {
    let owner = sheet_at_path(sheet, &name_def.path);
    match &name_def.item {
        NameItem::Core(op) => Rc::new(op.definition()),
        NameItem::Variable(index) => {
            let variable = &owner.variables[*index];
            Rc::new(NodeDefinition::new(
                variable.meta.name.clone(),
                variable.meta.description.clone(),
                vec![variable.meta.clone()],
                0,
            ))
        }
        NameItem::Function(index) => owner.functions[*index].definition.clone(),
        NameItem::Native(index) => owner.natives[*index].definition.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsc_util::meta::socket;
    use dsc_util::{DType, DValue, SocketMeta};

    fn sheet_with_variable(name: &str) -> Sheet {
        let mut sheet = Sheet::new("test.dc");
        sheet.add_variable(SocketMeta::new(name, "", DType::Int, DValue::Int(0)));
        sheet
    }

    #[test]
    fn test_core_op_resolves() {
        let sheet = Sheet::new("test.dc");
        let defs = get_name_definitions(&sheet, "Add");
        assert_eq!(defs, vec![NameDefinition::core(CoreOp::Add)]);
    }

    #[test]
    fn test_variable_resolves_locally() {
        let sheet = sheet_with_variable("count");
        let defs = get_name_definitions(&sheet, "count");
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].item, NameItem::Variable(0));
        assert!(defs[0].is_local());
    }

    #[test]
    fn test_variable_resolves_through_includes() {
        let mut sheet = Sheet::new("main.dc");
        sheet.includes.push(sheet_with_variable("shared"));

        let defs = get_name_definitions(&sheet, "shared");
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].path, vec![0]);

        let owner = sheet_at_path(&sheet, &defs[0].path);
        assert_eq!(owner.variables[0].meta.name, "shared");
    }

    #[test]
    fn test_ambiguity_is_an_error() {
        let mut sheet = sheet_with_variable("x");
        sheet.includes.push(sheet_with_variable("x"));

        let handler = Handler::new();
        assert!(select_name_definition(&sheet, "x", 1, &handler).is_none());
        assert!(handler.has_errors());
    }

    #[test]
    fn test_unknown_name_is_an_error() {
        let sheet = Sheet::new("test.dc");
        let handler = Handler::new();
        assert!(select_name_definition(&sheet, "nope", 1, &handler).is_none());
        assert!(handler.has_errors());
    }

    #[test]
    fn test_variable_getter_definition() {
        let sheet = sheet_with_variable("count");
        let def = node_definition_of(&sheet, &NameDefinition::local(NameItem::Variable(0)));
        assert_eq!(def.name, "count");
        assert_eq!(def.num_inputs(), 0);
        assert_eq!(def.num_outputs(), 1);
    }

    #[test]
    fn test_function_sockets_are_grounded() {
        let mut sheet = Sheet::new("test.dc");
        let def = NodeDefinition::new(
            "Double",
            "",
            vec![
                socket("value", DType::Float),
                socket("doubled", DType::Float),
            ],
            1,
        );
        sheet.add_function(def);

        let defs = get_name_definitions(&sheet, "Double");
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].item, NameItem::Function(0));
    }
}
