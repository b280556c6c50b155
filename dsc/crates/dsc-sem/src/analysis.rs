//! The property and node phases of semantic analysis.
//!
//! The property phase processes `Variable`, `Include`, `Function`,
//! `Subroutine`, `FunctionInput` and `FunctionOutput` statements. The node
//! phase instantiates nodes, connects literal inputs, and matches line
//! identifiers between producers and consumers.

use crate::core::CoreOp;
use crate::graph::{Node, NodeSocket, Wire};
use crate::name::{self, NameDefinition, NameItem};
use crate::sheet::{start_definition, Sheet};
use dsc_par::{NodeArg, NodeStmt, PropertyArg, PropertyStmt, Stmt, SyntaxTree};
use dsc_util::{types, DInt, DType, DValue, Handler, NodeDefinition, SocketMeta};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::debug;

/// How includes are resolved while scanning.
///
/// The loader is injected by the driver: it compiles the included file and
/// returns the finished sheet, reporting that file's diagnostics through the
/// same handler. `priors` is the chain of sheets currently being loaded,
/// used to refuse circular inclusion.
pub struct IncludeContext<'a> {
    pub priors: Vec<PathBuf>,
    #[allow(clippy::type_complexity)]
    pub loader: Option<&'a dyn Fn(&Path, &[PathBuf]) -> Result<Sheet, String>>,
}

impl<'a> Default for IncludeContext<'a> {
    fn default() -> Self {
        IncludeContext {
            priors: Vec::new(),
            loader: None,
        }
    }
}

/// Scan the property statements of a syntax tree into a sheet.
pub fn scan_properties(
    sheet: &mut Sheet,
    tree: &SyntaxTree,
    handler: &Handler,
    includes: &IncludeContext,
) {
    debug!("scanning properties");

    // Functions are built up across several statements and only added to the
    // sheet once every property has been seen.
    let mut pending: Vec<NodeDefinition> = Vec::new();

    for stmt in &tree.stmts {
        let prop = match stmt {
            Stmt::Property(prop) => prop,
            Stmt::Node(_) => continue,
        };

        match prop.name.as_str() {
            "Variable" => add_variable(sheet, prop, handler),
            "Include" => add_include(sheet, prop, handler, includes),
            "Function" => create_function(&mut pending, sheet, prop, handler, false),
            "Subroutine" => create_function(&mut pending, sheet, prop, handler, true),
            "FunctionInput" => add_function_socket(&mut pending, sheet, prop, handler, true),
            "FunctionOutput" => add_function_socket(&mut pending, sheet, prop, handler, false),
            name => {
                handler.error(
                    &sheet.file_name(),
                    prop.line,
                    format!("Unknown property {}", name),
                );
            }
        }
    }

    for definition in pending {
        sheet.add_function(definition);
    }
}

fn add_variable(sheet: &mut Sheet, prop: &PropertyStmt, handler: &Handler) {
    let file = sheet.file_name();

    if prop.args.len() < 2 {
        handler.error(&file, prop.line, "Variable property needs at least 2 arguments");
        return;
    }
    if prop.args.len() > 4 {
        handler.error(&file, prop.line, "Variable property needs at most 4 arguments");
        return;
    }

    let name = match &prop.args[0] {
        PropertyArg::Name(name) => name.clone(),
        _ => {
            handler.error(&file, prop.line, "Variable name must be a name");
            return;
        }
    };

    if sheet.variables.iter().any(|v| v.meta.name == name) {
        handler.error(
            &file,
            prop.line,
            format!("Variable {} is already defined", name),
        );
        return;
    }

    let typ = match &prop.args[1] {
        PropertyArg::DataType(typ) if types::var_any().contains(*typ) => *typ,
        PropertyArg::DataType(_) => {
            handler.error(&file, prop.line, "Variable data type must not be vague");
            return;
        }
        _ => {
            handler.error(&file, prop.line, "Variable property needs a data type");
            return;
        }
    };

    let default = match prop.args.get(2) {
        Some(PropertyArg::Literal(value)) => {
            // An integer literal is fine for a float variable.
            let value = match (typ, value) {
                (DType::Float, DValue::Int(i)) => DValue::Float(*i as dsc_util::DFloat),
                _ => value.clone(),
            };
            if value.type_of() != typ {
                handler.error(
                    &file,
                    prop.line,
                    format!(
                        "Default value type ({}) does not match variable type ({})",
                        types::type_name(value.type_of().into()),
                        types::type_name(typ.into())
                    ),
                );
                return;
            }
            value
        }
        Some(_) => {
            handler.error(&file, prop.line, "Variable default value must be a literal");
            return;
        }
        None => {
            handler.warning(
                &file,
                prop.line,
                "No default value specified in Variable property",
            );
            zero_value(typ)
        }
    };

    let description = match prop.args.get(3) {
        Some(PropertyArg::Literal(DValue::Str(desc))) => desc.clone(),
        Some(_) => {
            handler.error(&file, prop.line, "Variable description must be a string");
            return;
        }
        None => String::new(),
    };

    sheet.add_variable(SocketMeta::new(name, description, typ, default));
}

fn zero_value(typ: DType) -> DValue {
    match typ {
        DType::Float => DValue::Float(0.0),
        DType::String => DValue::Str(String::new()),
        DType::Bool => DValue::Bool(false),
        _ => DValue::Int(0),
    }
}

fn add_include(
    sheet: &mut Sheet,
    prop: &PropertyStmt,
    handler: &Handler,
    includes: &IncludeContext,
) {
    let file = sheet.file_name();

    let path_str = match prop.args.first() {
        Some(PropertyArg::Literal(DValue::Str(path))) if prop.args.len() == 1 => path.clone(),
        _ => {
            handler.error(&file, prop.line, "Include property needs a file path string");
            return;
        }
    };

    // Includes resolve relative to the including sheet's own directory.
    let resolved = sheet.directory().join(&path_str);

    if includes.priors.iter().any(|p| p == &resolved) {
        handler.error(
            &file,
            prop.line,
            format!("Circular inclusion of {}", resolved.display()),
        );
        return;
    }

    let loader = match includes.loader {
        Some(loader) => loader,
        None => {
            handler.error(&file, prop.line, "Includes are not available here");
            return;
        }
    };

    match loader(&resolved, &includes.priors) {
        Ok(mut included) => {
            included.include_path = Some(path_str);
            sheet.add_include(included);
        }
        Err(err) => {
            handler.error(
                &file,
                prop.line,
                format!("Could not include {}: {}", resolved.display(), err),
            );
        }
    }
}

fn create_function(
    pending: &mut Vec<NodeDefinition>,
    sheet: &Sheet,
    prop: &PropertyStmt,
    handler: &Handler,
    subroutine: bool,
) {
    let file = sheet.file_name();
    let kind = if subroutine { "Subroutine" } else { "Function" };

    if prop.args.is_empty() || prop.args.len() > 2 {
        handler.error(
            &file,
            prop.line,
            format!("{} property needs 1 or 2 arguments", kind),
        );
        return;
    }

    let name = match &prop.args[0] {
        PropertyArg::Name(name) => name.clone(),
        _ => {
            handler.error(&file, prop.line, format!("{} name must be a name", kind));
            return;
        }
    };

    if pending.iter().any(|f| f.name == name) {
        handler.error(
            &file,
            prop.line,
            format!("{} {} is already defined", kind, name),
        );
        return;
    }

    let description = match prop.args.get(1) {
        Some(PropertyArg::Literal(DValue::Str(desc))) => desc.clone(),
        Some(_) => {
            handler.error(
                &file,
                prop.line,
                format!("{} description must be a string", kind),
            );
            return;
        }
        None => String::new(),
    };

    let mut definition = NodeDefinition::new(name, description, Vec::new(), 0);

    // Subroutines get their execution sockets up front.
    if subroutine {
        definition.sockets.push(SocketMeta::new(
            "before",
            "The node will activate when this input is activated.",
            DType::Execution,
            DValue::Int(0),
        ));
        definition.start_output_index = 1;
        definition.sockets.push(SocketMeta::new(
            "after",
            "This output will activate once the node has finished executing.",
            DType::Execution,
            DValue::Int(0),
        ));
    }

    pending.push(definition);
}

fn add_function_socket(
    pending: &mut Vec<NodeDefinition>,
    sheet: &Sheet,
    prop: &PropertyStmt,
    handler: &Handler,
    is_input: bool,
) {
    let file = sheet.file_name();
    let kind = if is_input {
        "FunctionInput"
    } else {
        "FunctionOutput"
    };

    let min_args = 3;
    let max_args = if is_input { 5 } else { 4 };
    if prop.args.len() < min_args || prop.args.len() > max_args {
        handler.error(
            &file,
            prop.line,
            format!(
                "{} property needs between {} and {} arguments",
                kind, min_args, max_args
            ),
        );
        return;
    }

    let func_name = match &prop.args[0] {
        PropertyArg::Name(name) => name.clone(),
        _ => {
            handler.error(&file, prop.line, format!("{} needs a function name", kind));
            return;
        }
    };

    let socket_name = match &prop.args[1] {
        PropertyArg::Name(name) => name.clone(),
        _ => {
            handler.error(&file, prop.line, format!("{} needs a socket name", kind));
            return;
        }
    };

    let typ = match &prop.args[2] {
        PropertyArg::DataType(typ) if types::var_any().contains(*typ) => *typ,
        _ => {
            handler.error(
                &file,
                prop.line,
                format!("{} needs a non-vague data type", kind),
            );
            return;
        }
    };

    let mut default = zero_value(typ);
    let mut description = String::new();

    let mut extra = prop.args.iter().skip(3);
    if is_input {
        if let Some(arg) = extra.next() {
            match arg {
                PropertyArg::Literal(value) => {
                    let value = match (typ, value) {
                        (DType::Float, DValue::Int(i)) => {
                            DValue::Float(*i as dsc_util::DFloat)
                        }
                        _ => value.clone(),
                    };
                    if value.type_of() != typ {
                        handler.error(
                            &file,
                            prop.line,
                            "Default value type does not match the socket type",
                        );
                        return;
                    }
                    default = value;
                }
                _ => {
                    handler.error(&file, prop.line, "Default value must be a literal");
                    return;
                }
            }
        }
    }
    if let Some(arg) = extra.next() {
        match arg {
            PropertyArg::Literal(DValue::Str(desc)) => description = desc.clone(),
            _ => {
                handler.error(&file, prop.line, "Socket description must be a string");
                return;
            }
        }
    }

    let definition = match pending.iter_mut().find(|f| f.name == func_name) {
        Some(definition) => definition,
        None => {
            handler.error(
                &file,
                prop.line,
                format!("Function {} is not defined", func_name),
            );
            return;
        }
    };

    let meta = SocketMeta::new(socket_name, description, typ, default);

    if is_input {
        // Inputs go before the outputs.
        let index = definition.start_output_index;
        definition.sockets.insert(index, meta);
        definition.start_output_index += 1;
    } else {
        definition.sockets.push(meta);
    }
}

/// The outcome of resolving one node statement's name.
struct ResolvedNode {
    definition: Rc<NodeDefinition>,
    name_definition: Option<NameDefinition>,
}

fn first_arg_name(stmt: &NodeStmt) -> Option<&str> {
    match stmt.args.first() {
        Some(NodeArg::Name(name)) => Some(name),
        _ => None,
    }
}

/// Get a node's definition from its name.
///
/// `Start`, `Define` and `Return` are special-cased; `Define` and `Return`
/// take the containing function's name as their first argument and must
/// reference a function defined on this sheet.
fn resolve_node(sheet: &Sheet, stmt: &NodeStmt, handler: &Handler) -> Option<ResolvedNode> {
    let file = sheet.file_name();

    match stmt.name.as_str() {
        "Start" => Some(ResolvedNode {
            definition: Rc::new(start_definition()),
            name_definition: None,
        }),
        "Define" | "Return" => {
            let func_name = match first_arg_name(stmt) {
                Some(name) => name,
                None => {
                    handler.error(
                        &file,
                        stmt.line,
                        format!("{} needs a function name as its first argument", stmt.name),
                    );
                    return None;
                }
            };

            let index = match sheet
                .functions
                .iter()
                .position(|f| f.definition.name == func_name)
            {
                Some(index) => index,
                None => {
                    handler.error(
                        &file,
                        stmt.line,
                        format!(
                            "{} node for function {} that is not defined on the same sheet",
                            stmt.name, func_name
                        ),
                    );
                    return None;
                }
            };

            let function = &sheet.functions[index];
            let definition = if stmt.name == "Define" {
                function.define_definition.clone()
            } else {
                function.return_definition.clone()
            };

            Some(ResolvedNode {
                definition,
                name_definition: Some(NameDefinition::local(NameItem::Function(index))),
            })
        }
        name => {
            let name_def = name::select_name_definition(sheet, name, stmt.line, handler)?;
            let definition = name::node_definition_of(sheet, &name_def);
            Some(ResolvedNode {
                definition,
                name_definition: Some(name_def),
            })
        }
    }
}

/// Scan the node statements of a syntax tree into the sheet's graph,
/// connecting the wires named by line identifiers.
pub fn scan_nodes(sheet: &mut Sheet, tree: &SyntaxTree, handler: &Handler) {
    debug!("scanning nodes");

    let file = sheet.file_name();

    // Line identifiers waiting to be matched: outputs we know produce a
    // line, and inputs that consume one.
    let mut known_lines: Vec<(DInt, NodeSocket)> = Vec::new();
    let mut unknown_lines: Vec<(DInt, NodeSocket)> = Vec::new();

    for stmt in &tree.stmts {
        let stmt = match stmt {
            Stmt::Node(stmt) => stmt,
            Stmt::Property(_) => continue,
        };

        let resolved = match resolve_node(sheet, stmt, handler) {
            Some(resolved) => resolved,
            None => continue,
        };

        scan_node(
            sheet,
            stmt,
            resolved,
            handler,
            &mut known_lines,
            &mut unknown_lines,
        );
    }

    // Each consumer must find a producer with the same identifier.
    for &(identifier, to) in &unknown_lines {
        let mut found = false;
        for &(known_id, from) in &known_lines {
            if known_id == identifier {
                found = true;
                sheet.graph.add_wire(Wire::new(from, to), &file, handler);
            }
        }

        if !found {
            let line = sheet.graph.nodes[to.node].line;
            handler.error(
                &file,
                line,
                format!("Undefined line identifier {}", identifier),
            );
        }
    }

    check_node_accounting(sheet, handler);
}

fn scan_node(
    sheet: &mut Sheet,
    stmt: &NodeStmt,
    resolved: ResolvedNode,
    handler: &Handler,
    known_lines: &mut Vec<(DInt, NodeSocket)>,
    unknown_lines: &mut Vec<(DInt, NodeSocket)>,
) {
    let file = sheet.file_name();
    let definition = resolved.definition;
    let mut name_definition = resolved.name_definition;

    // Check the number of inputs is what the definition expects.
    let def_inputs = definition.num_inputs();
    let valid_count = if definition.infinite_inputs {
        stmt.args.len() >= def_inputs
    } else {
        stmt.args.len() == def_inputs
    };
    if !valid_count {
        handler.error(
            &file,
            stmt.line,
            format!(
                "Expected {} inputs in node {}, got {}",
                def_inputs,
                definition.name,
                stmt.args.len()
            ),
        );
        return;
    }

    let extra_inputs = stmt.args.len().saturating_sub(def_inputs);
    let node_index = sheet.graph.nodes.len();

    let mut node = Node::from_definition(definition.clone(), stmt.line, extra_inputs, None);

    let is_set_node = name_definition
        .as_ref()
        .map(|d| d.item == NameItem::Core(CoreOp::Set))
        .unwrap_or(false);

    for (input_index, arg) in stmt.args.iter().enumerate() {
        let socket = NodeSocket::new(node_index, input_index);
        let socket_type = node.reduced_types[input_index];

        match arg {
            NodeArg::Literal(value) => {
                let literal_type = value.type_of();
                if socket_type.contains(literal_type) {
                    node.literal_values[input_index] = value.clone();
                    node.reduced_types[input_index] = literal_type.into();
                } else if literal_type == DType::Int
                    && socket_type == types::TypeSet::from(DType::Float)
                {
                    // The node expected a float but got an integer; convert.
                    node.literal_values[input_index] =
                        DValue::Float(value.as_int() as dsc_util::DFloat);
                } else {
                    handler.error(
                        &file,
                        stmt.line,
                        format!(
                            "Literal argument type ({}) does not match type of socket ({})",
                            types::type_name(literal_type.into()),
                            types::type_name(socket_type)
                        ),
                    );
                }
            }
            NodeArg::Line(identifier) => {
                unknown_lines.push((*identifier, socket));
            }
            NodeArg::Name(arg_name) => {
                if socket_type != types::TypeSet::from(DType::Name) {
                    handler.error(
                        &file,
                        stmt.line,
                        "Name argument given when socket input isn't a name",
                    );
                    continue;
                }

                let definitions = name::get_name_definitions(sheet, arg_name);
                if definitions.is_empty() {
                    handler.error(
                        &file,
                        stmt.line,
                        format!("Name {} is not defined", arg_name),
                    );
                    continue;
                }

                node.literal_values[input_index] = DValue::Str(arg_name.clone());

                // A Set node's name definition points at the variable being
                // set, not at the Set core op.
                if is_set_node {
                    match name::select_name_definition(sheet, arg_name, stmt.line, handler) {
                        Some(def) if matches!(def.item, NameItem::Variable(_)) => {
                            name_definition = Some(def);
                        }
                        Some(_) => {
                            handler.error(
                                &file,
                                stmt.line,
                                format!("Set target {} is not a variable", arg_name),
                            );
                        }
                        None => {}
                    }
                }
            }
        }
    }

    // Collect the outputs named by the statement's line list.
    let num_inputs = node.num_inputs();
    let num_outputs = node.num_outputs();
    for (output_index, identifier) in stmt.outputs.iter().enumerate() {
        if output_index >= num_outputs {
            handler.warning(
                &file,
                stmt.line,
                format!(
                    "Got more outputs than expected (expected at most {}), ignoring redundant outputs",
                    num_outputs
                ),
            );
            break;
        }
        let socket = NodeSocket::new(node_index, num_inputs + output_index);
        known_lines.push((*identifier, socket));
    }

    node.name_definition = name_definition.clone();
    sheet.graph.add_node(node);

    // Special accounting for the nodes the code generator anchors on.
    match definition.name.as_str() {
        "Start" => {
            sheet.start_node = Some(node_index);
            sheet.num_starts += 1;
        }
        "Define" => {
            if let Some(NameDefinition {
                item: NameItem::Function(index),
                ..
            }) = name_definition
            {
                let function = &mut sheet.functions[index];
                function.define_node = Some(node_index);
                function.num_define_nodes += 1;
            }
        }
        "Return" => {
            if let Some(NameDefinition {
                item: NameItem::Function(index),
                ..
            }) = name_definition
            {
                let function = &mut sheet.functions[index];
                function.last_return_node = Some(node_index);
                function.num_return_nodes += 1;
            }
        }
        _ => {}
    }
}

fn check_node_accounting(sheet: &Sheet, handler: &Handler) {
    let file = sheet.file_name();

    if sheet.num_starts > 1 {
        handler.error(&file, 0, "Sheet has more than one Start node");
    }

    for function in &sheet.functions {
        let name = &function.definition.name;

        if function.num_define_nodes > 1 {
            handler.error(
                &file,
                0,
                format!("Function {} has more than one Define node", name),
            );
        }

        if function.is_subroutine() {
            if function.num_define_nodes != 1 {
                handler.error(
                    &file,
                    0,
                    format!("Subroutine {} needs exactly one Define node", name),
                );
            }
        } else if function.num_return_nodes != 1 {
            handler.error(
                &file,
                0,
                format!("Function {} needs exactly one Return node", name),
            );
        }
    }
}
