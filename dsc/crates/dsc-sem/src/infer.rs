//! Type reduction and loop detection.
//!
//! Reduction is an iterative fixed-point pass: each sweep walks the nodes
//! that are not yet reduced and applies a core-op-specific rule that
//! propagates concreteness between inputs and outputs. A node is marked
//! reduced when either all its inputs are reduced or a mismatch has been
//! reported; the loop terminates when a full sweep reduces nothing new.

use crate::core::CoreOp;
use crate::graph::{Graph, NodeSocket};
use crate::name::{self, NameItem};
use crate::sheet::Sheet;
use dsc_util::{types, DType, FxHashMap, Handler, SocketMeta, TypeSet};
use tracing::debug;

/// Reduce the vague socket types of a sheet's graph.
pub fn reduce_types(sheet: &mut Sheet, handler: &Handler) {
    debug!("reducing data types");

    let file = sheet.file_name();

    // Prefetch the target variable of every Set node; the reduction loop
    // needs the variable's metadata without borrowing the whole sheet.
    let mut set_targets: FxHashMap<usize, SocketMeta> = FxHashMap::default();
    for (index, node) in sheet.graph.nodes.iter().enumerate() {
        if node.definition.name != "Set" {
            continue;
        }
        if let Some(name_def) = &node.name_definition {
            if let NameItem::Variable(var_index) = name_def.item {
                let owner = name::sheet_at_path(sheet, &name_def.path);
                set_targets.insert(index, owner.variables[var_index].meta.clone());
            }
        }
    }

    let graph = &mut sheet.graph;
    let mut reduced = vec![false; graph.nodes.len()];

    // Iterate to a fixed point: stop once a full sweep reduces nothing new.
    // Nodes that can never reduce are part of a cycle, which loop detection
    // reports afterwards.
    loop {
        let mut progressed = false;

        for node_index in 0..graph.nodes.len() {
            if reduced[node_index] {
                continue;
            }

            let name = graph.nodes[node_index].definition.name.clone();
            match CoreOp::find_name(&name) {
                Some(op) => {
                    progressed |= reduce_core_node(
                        graph,
                        &file,
                        op,
                        node_index,
                        handler,
                        &mut reduced,
                        set_targets.get(&node_index),
                    );
                }
                None => {
                    // Functions and variable getters carry concrete types
                    // already.
                    reduced[node_index] = true;
                    progressed = true;
                }
            }
        }

        if !progressed {
            break;
        }
    }
}

/// A socket's currently-known type, following its wire if it has one.
///
/// Returns the reduced type and whether it is concrete, along with the
/// update to record if the concreteness came over a wire.
fn socket_type_via_wire(
    graph: &Graph,
    socket: NodeSocket,
) -> (TypeSet, bool, Option<(usize, TypeSet)>) {
    let own = graph.nodes[socket.node].reduced_types[socket.socket];
    if types::is_reduced(own) {
        return (own, true, None);
    }

    if let Some(other) = graph.connected_from(socket) {
        let other_type = graph.nodes[other.node].reduced_types[other.socket];
        if types::is_reduced(other_type) {
            return (other_type, true, Some((socket.socket, other_type)));
        }
    }

    (own, false, None)
}

/// Apply recorded type updates and say whether any socket actually changed.
fn apply_updates(graph: &mut Graph, node_index: usize, updates: &[(usize, TypeSet)]) -> bool {
    let mut changed = false;
    for &(socket, typ) in updates {
        let slot = &mut graph.nodes[node_index].reduced_types[socket];
        if *slot != typ {
            *slot = typ;
            changed = true;
        }
    }
    changed
}

fn reduce_core_node(
    graph: &mut Graph,
    file: &str,
    op: CoreOp,
    node_index: usize,
    handler: &Handler,
    reduced: &mut [bool],
    set_target: Option<&SocketMeta>,
) -> bool {
    let num_sockets = graph.nodes[node_index].num_sockets();
    let start_output = graph.nodes[node_index].start_output_index;
    let line = graph.nodes[node_index].line;

    let mut updates: Vec<(usize, TypeSet)> = Vec::new();
    let mut reduced_all_inputs = true;

    match op {
        // Arithmetic: the output is a Float iff any numeric input is a
        // Float, else an Integer. Divide always returns a Float, and Div
        // narrows back to an Integer. This also covers For's index output.
        CoreOp::Add
        | CoreOp::Subtract
        | CoreOp::Multiply
        | CoreOp::Divide
        | CoreOp::Div
        | CoreOp::Mod
        | CoreOp::For => {
            let mut has_float_input = false;
            let mut output_socket = None;

            for socket_index in 0..num_sockets {
                let socket = NodeSocket::new(node_index, socket_index);
                let typ = graph.nodes[node_index].reduced_types[socket_index];

                if typ == TypeSet::from(DType::Execution) {
                    continue;
                }

                if socket_index < start_output {
                    let (resolved, concrete, update) = socket_type_via_wire(graph, socket);
                    if let Some(update) = update {
                        updates.push(update);
                    }
                    if concrete {
                        if resolved == TypeSet::from(DType::Float) {
                            has_float_input = true;
                        }
                    } else {
                        reduced_all_inputs = false;
                    }
                } else {
                    output_socket = Some(socket_index);
                }
            }

            if !matches!(op, CoreOp::Divide | CoreOp::Div | CoreOp::Mod) {
                if let Some(output) = output_socket {
                    let out_type = if has_float_input {
                        DType::Float
                    } else {
                        DType::Int
                    };
                    updates.push((output, out_type.into()));
                }
            }

            if reduced_all_inputs {
                reduced[node_index] = true;
            }
        }

        // Print and Set have a single vague value input that resolves from
        // its wire. Set's resolved type must equal the target variable's
        // declared type.
        CoreOp::Print | CoreOp::Set => {
            let mut resolved_to: Option<TypeSet> = None;

            for socket_index in 0..start_output {
                let typ = graph.nodes[node_index].reduced_types[socket_index];
                if typ == TypeSet::from(DType::Execution) || typ == TypeSet::from(DType::Name) {
                    continue;
                }

                let socket = NodeSocket::new(node_index, socket_index);
                let (resolved, concrete, update) = socket_type_via_wire(graph, socket);
                if let Some(update) = update {
                    updates.push(update);
                }
                if concrete {
                    resolved_to = Some(resolved);
                } else {
                    reduced_all_inputs = false;
                }
            }

            if let Some(resolved) = resolved_to {
                if reduced_all_inputs {
                    reduced[node_index] = true;

                    if op == CoreOp::Set {
                        if let Some(var_meta) = set_target {
                            if resolved != TypeSet::from(var_meta.typ) {
                                handler.error(
                                    file,
                                    line,
                                    format!(
                                        "Input type ({}) does not match variable's type \
                                         ({} has type {})",
                                        types::type_name(resolved),
                                        var_meta.name,
                                        types::type_name(var_meta.typ)
                                    ),
                                );
                            }
                        }
                    }
                }
            }
        }

        // Bitwise: every participating socket must agree on Integer or
        // Boolean; mixing is an error that ends reduction for the node.
        CoreOp::And | CoreOp::Or | CoreOp::Xor | CoreOp::Not => {
            let mut final_type: Option<TypeSet> = None;
            let mut all_same = true;

            for socket_index in 0..start_output {
                let socket = NodeSocket::new(node_index, socket_index);
                let (resolved, concrete, update) = socket_type_via_wire(graph, socket);
                if let Some(update) = update {
                    updates.push(update);
                }

                if concrete {
                    if let Some(final_type) = final_type {
                        if final_type != resolved {
                            handler.error(
                                file,
                                line,
                                "All inputs in bitwise operators must be of the same type",
                            );
                            all_same = false;
                        }
                    }
                    final_type = Some(resolved);
                } else {
                    reduced_all_inputs = false;
                }
            }

            if let Some(final_type) = final_type {
                for socket_index in start_output..num_sockets {
                    updates.push((socket_index, final_type));
                }
            }

            if reduced_all_inputs || !all_same {
                reduced[node_index] = true;
            }
        }

        // Comparisons: the inputs must all be numeric, all strings, or all
        // booleans; the output is always a Boolean.
        CoreOp::Equal
        | CoreOp::NotEqual
        | CoreOp::LessThan
        | CoreOp::LessThanOrEqual
        | CoreOp::MoreThan
        | CoreOp::MoreThanOrEqual => {
            let mut has_number = false;
            let mut has_string = false;
            let mut has_bool = false;

            for socket_index in 0..start_output {
                let socket = NodeSocket::new(node_index, socket_index);
                let (resolved, concrete, update) = socket_type_via_wire(graph, socket);
                if let Some(update) = update {
                    updates.push(update);
                }

                if concrete {
                    if !(resolved & types::number()).is_empty() {
                        has_number = true;
                    } else if resolved == TypeSet::from(DType::String) {
                        has_string = true;
                    } else if resolved == TypeSet::from(DType::Bool) {
                        has_bool = true;
                    }
                } else {
                    reduced_all_inputs = false;
                }
            }

            if has_number && has_string {
                handler.error(
                    file,
                    line,
                    "Comparison operators cannot compare between numbers and strings",
                );
            }
            if has_number && has_bool {
                handler.error(
                    file,
                    line,
                    "Comparison operators cannot compare between numbers and booleans",
                );
            }
            if has_string && has_bool {
                handler.error(
                    file,
                    line,
                    "Comparison operators cannot compare between strings and booleans",
                );
            }

            if reduced_all_inputs {
                reduced[node_index] = true;
            }
        }

        // Ternary: both value inputs and the output must agree.
        CoreOp::Ternary => {
            let mut input_type: Option<TypeSet> = None;
            let mut inputs_same = true;

            for socket_index in 1..start_output {
                let socket = NodeSocket::new(node_index, socket_index);
                let (resolved, concrete, update) = socket_type_via_wire(graph, socket);
                if let Some(update) = update {
                    updates.push(update);
                }

                if concrete {
                    if let Some(input_type) = input_type {
                        if input_type != resolved {
                            handler.error(
                                file,
                                line,
                                "Value inputs in a Ternary operator must be of the same type",
                            );
                            inputs_same = false;
                        }
                    }
                    input_type = Some(resolved);
                } else {
                    reduced_all_inputs = false;
                }
            }

            if let Some(input_type) = input_type {
                for socket_index in start_output..num_sockets {
                    updates.push((socket_index, input_type));
                }
            }

            if reduced_all_inputs || !inputs_same {
                reduced[node_index] = true;
            }
        }

        // The remaining core ops have no vague sockets to reduce.
        _ => {
            reduced[node_index] = true;
        }
    }

    let changed = apply_updates(graph, node_index, &updates);
    changed || reduced[node_index]
}

/// Detect feedback loops in a graph.
///
/// From every node with no non-Name inputs, walk the directed graph
/// depth-first; revisiting a node on the current path is a cycle error.
pub fn detect_loops(sheet: &Sheet, handler: &Handler) {
    debug!("detecting loops");

    let file = sheet.file_name();
    let graph = &sheet.graph;

    for (index, node) in graph.nodes.iter().enumerate() {
        let has_inputs = node.definition.inputs().iter().any(|meta| {
            meta.typ != TypeSet::from(DType::Name)
        });

        if !has_inputs {
            let mut path = Vec::with_capacity(graph.nodes.len());
            path.push(index);
            check_loop(graph, &file, index, &mut path, handler);
        }
    }
}

fn check_loop(
    graph: &Graph,
    file: &str,
    current: usize,
    path: &mut Vec<usize>,
    handler: &Handler,
) {
    let node = &graph.nodes[current];
    let num_inputs = node.num_inputs();
    let num_sockets = node.num_sockets();

    for socket_index in num_inputs..num_sockets {
        let socket = NodeSocket::new(current, socket_index);

        // Collect first so the recursion can re-borrow the graph.
        let next_nodes: Vec<usize> =
            graph.wires_from(socket).map(|w| w.to.node).collect();

        for next in next_nodes {
            if path.contains(&next) {
                let node = &graph.nodes[next];
                handler.error(
                    file,
                    node.line,
                    format!("Detected loop entering node {}", node.definition.name),
                );
                continue;
            }

            path.push(next);
            check_loop(graph, file, next, path, handler);
            path.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Node, Wire};
    use dsc_util::DValue;
    use std::rc::Rc;

    fn node(graph: &mut Graph, op: CoreOp) -> usize {
        let def = Rc::new(op.definition());
        graph.add_node(Node::from_definition(def, 1, 0, None))
    }

    fn wire(graph: &mut Graph, from: (usize, usize), to: (usize, usize)) {
        let handler = Handler::new();
        assert!(graph.add_wire(
            Wire::new(
                NodeSocket::new(from.0, from.1),
                NodeSocket::new(to.0, to.1)
            ),
            "test.dc",
            &handler
        ));
        assert!(!handler.has_errors(), "{:?}", handler.diagnostics());
    }

    fn reduce(sheet: &mut Sheet) -> Handler {
        let handler = Handler::new();
        reduce_types(sheet, &handler);
        handler
    }

    #[test]
    fn test_integer_addition_reduces_to_int() {
        let mut sheet = Sheet::new("test.dc");
        let add = node(&mut sheet.graph, CoreOp::Add);
        sheet.graph.nodes[add].reduced_types[0] = DType::Int.into();

        let handler = reduce(&mut sheet);
        assert!(!handler.has_errors());
        assert_eq!(sheet.graph.nodes[add].reduced_types[1], TypeSet::from(DType::Int));
    }

    #[test]
    fn test_float_propagates_through_chain() {
        let mut sheet = Sheet::new("test.dc");
        let graph = &mut sheet.graph;

        // Add(1, 2.5) -> Subtract(#, 1)
        let add = node(graph, CoreOp::Subtract);
        graph.nodes[add].reduced_types[0] = DType::Int.into();
        graph.nodes[add].reduced_types[1] = DType::Float.into();

        let sub = node(graph, CoreOp::Subtract);
        graph.nodes[sub].reduced_types[1] = DType::Int.into();

        wire(graph, (add, 2), (sub, 0));

        let handler = reduce(&mut sheet);
        assert!(!handler.has_errors());

        // The first node's output became Float, and that propagated into
        // the second node's input and output.
        assert_eq!(sheet.graph.nodes[add].reduced_types[2], TypeSet::from(DType::Float));
        assert_eq!(sheet.graph.nodes[sub].reduced_types[0], TypeSet::from(DType::Float));
        assert_eq!(sheet.graph.nodes[sub].reduced_types[2], TypeSet::from(DType::Float));
    }

    #[test]
    fn test_divide_always_returns_float() {
        let mut sheet = Sheet::new("test.dc");
        let div = node(&mut sheet.graph, CoreOp::Divide);
        sheet.graph.nodes[div].reduced_types[0] = DType::Int.into();
        sheet.graph.nodes[div].reduced_types[1] = DType::Int.into();

        let handler = reduce(&mut sheet);
        assert!(!handler.has_errors());
        assert_eq!(
            sheet.graph.nodes[div].reduced_types[2],
            TypeSet::from(DType::Float)
        );
    }

    #[test]
    fn test_bitwise_mixing_is_an_error() {
        let mut sheet = Sheet::new("test.dc");
        let and = node(&mut sheet.graph, CoreOp::And);
        sheet.graph.nodes[and].reduced_types[0] = DType::Int.into();
        sheet.graph.nodes[and].reduced_types[1] = DType::Bool.into();

        let handler = reduce(&mut sheet);
        assert!(handler.has_errors());
    }

    #[test]
    fn test_comparison_mixing_string_and_number_is_an_error() {
        let mut sheet = Sheet::new("test.dc");
        let eq = node(&mut sheet.graph, CoreOp::Equal);
        sheet.graph.nodes[eq].reduced_types[0] = DType::String.into();
        sheet.graph.nodes[eq].reduced_types[1] = DType::Int.into();

        let handler = reduce(&mut sheet);
        assert!(handler.has_errors());
    }

    #[test]
    fn test_ternary_inputs_must_agree() {
        let mut sheet = Sheet::new("test.dc");
        let ternary = node(&mut sheet.graph, CoreOp::Ternary);
        sheet.graph.nodes[ternary].reduced_types[1] = DType::Int.into();
        sheet.graph.nodes[ternary].reduced_types[2] = DType::String.into();

        let handler = reduce(&mut sheet);
        assert!(handler.has_errors());
    }

    #[test]
    fn test_ternary_output_takes_input_type() {
        let mut sheet = Sheet::new("test.dc");
        let ternary = node(&mut sheet.graph, CoreOp::Ternary);
        sheet.graph.nodes[ternary].reduced_types[1] = DType::String.into();
        sheet.graph.nodes[ternary].reduced_types[2] = DType::String.into();

        let handler = reduce(&mut sheet);
        assert!(!handler.has_errors());
        assert_eq!(
            sheet.graph.nodes[ternary].reduced_types[3],
            TypeSet::from(DType::String)
        );
    }

    #[test]
    fn test_execution_loop_is_detected() {
        let mut sheet = Sheet::new("test.dc");
        let graph = &mut sheet.graph;

        let start = graph.add_node(Node::from_definition(
            Rc::new(crate::sheet::start_definition()),
            1,
            0,
            None,
        ));

        // Two Prints whose execution sockets feed each other: a cycle
        // reachable from Start. Execution inputs admit several incoming
        // wires, so add_wire accepts this.
        let p1 = node(graph, CoreOp::Print);
        let p2 = node(graph, CoreOp::Print);
        wire(graph, (start, 0), (p1, 0));
        wire(graph, (p1, 2), (p2, 0));
        wire(graph, (p2, 2), (p1, 0));

        let handler = Handler::new();
        detect_loops(&sheet, &handler);
        assert!(handler.has_errors());
    }

    #[test]
    fn test_straight_line_has_no_loops() {
        let mut sheet = Sheet::new("test.dc");
        let graph = &mut sheet.graph;

        let start = graph.add_node(Node::from_definition(
            Rc::new(crate::sheet::start_definition()),
            1,
            0,
            None,
        ));
        let print = node(graph, CoreOp::Print);
        graph.nodes[print].literal_values[1] = DValue::Str("hi".into());
        graph.nodes[print].reduced_types[1] = DType::String.into();
        wire(graph, (start, 0), (print, 0));

        let handler = Handler::new();
        detect_loops(&sheet, &handler);
        assert!(!handler.has_errors(), "{:?}", handler.diagnostics());
    }
}
