//! The graph intermediate representation.
//!
//! A graph is a set of nodes and the wires between their sockets. Wires are
//! stored as pairs of `(node index, socket index)` rather than as pointers
//! between nodes, which sidesteps cyclic ownership. Every wire appears twice,
//! once in each direction, and the whole list is kept sorted
//! lexicographically by the `from` endpoint so that all wires originating at
//! a given socket form a contiguous range locatable by binary search.

use crate::name::NameDefinition;
use dsc_util::{types, DValue, Handler, NodeDefinition, SocketMeta};
use std::rc::Rc;

/// A reference to one socket of one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeSocket {
    pub node: usize,
    pub socket: usize,
}

impl NodeSocket {
    pub fn new(node: usize, socket: usize) -> Self {
        NodeSocket { node, socket }
    }
}

/// A directed connection between two sockets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Wire {
    pub from: NodeSocket,
    pub to: NodeSocket,
}

impl Wire {
    pub fn new(from: NodeSocket, to: NodeSocket) -> Self {
        Wire { from, to }
    }

    /// The same wire, seen from the other endpoint.
    pub fn reversed(self) -> Self {
        Wire {
            from: self.to,
            to: self.from,
        }
    }
}

/// A node instance in a graph.
#[derive(Clone, Debug)]
pub struct Node {
    pub definition: Rc<NodeDefinition>,
    /// The source line the node statement was on.
    pub line: usize,
    /// Per-socket reduced types. Starts as the definition's declared types
    /// and is narrowed by the semantic pass.
    pub reduced_types: Vec<types::TypeSet>,
    /// Per-input literal values used when no wire is connected.
    pub literal_values: Vec<DValue>,
    /// Where the outputs start for this instance. Differs from the
    /// definition for infinite-input nodes.
    pub start_output_index: usize,
    /// What this node's name resolved to, if it names something.
    pub name_definition: Option<NameDefinition>,
}

impl Node {
    /// Build a node instance straight from a definition, with `extra_inputs`
    /// additional inputs for infinite-input definitions.
    pub fn from_definition(
        definition: Rc<NodeDefinition>,
        line: usize,
        extra_inputs: usize,
        name_definition: Option<NameDefinition>,
    ) -> Self {
        let num_inputs = definition.num_inputs() + extra_inputs;
        let start_output_index = num_inputs;

        let mut reduced_types = Vec::with_capacity(definition.sockets.len() + extra_inputs);
        for meta in definition.inputs() {
            reduced_types.push(meta.typ);
        }
        for _ in 0..extra_inputs {
            let last = definition.inputs().last().map(|m| m.typ).unwrap_or_default();
            reduced_types.push(last);
        }
        for meta in definition.outputs() {
            reduced_types.push(meta.typ);
        }

        let mut literal_values = Vec::with_capacity(num_inputs);
        for meta in definition.inputs() {
            literal_values.push(meta.default.clone());
        }
        for _ in 0..extra_inputs {
            let last = definition
                .inputs()
                .last()
                .map(|m| m.default.clone())
                .unwrap_or_default();
            literal_values.push(last);
        }

        Node {
            definition,
            line,
            reduced_types,
            literal_values,
            start_output_index,
            name_definition,
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.start_output_index
    }

    pub fn num_outputs(&self) -> usize {
        self.reduced_types.len() - self.start_output_index
    }

    pub fn num_sockets(&self) -> usize {
        self.reduced_types.len()
    }

    /// Fold an instance socket index onto a definition socket index,
    /// accounting for infinite-input definitions.
    fn definition_socket_index(&self, socket: usize) -> usize {
        if !self.definition.infinite_inputs {
            return socket;
        }
        if socket < self.start_output_index {
            socket.min(self.definition.start_output_index - 1)
        } else {
            self.definition.start_output_index + (socket - self.start_output_index)
        }
    }
}

/// A collection of nodes and wires.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub wires: Vec<Wire>,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    /// Add a node, returning its stable index.
    pub fn add_node(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn is_node_index_valid(&self, node: usize) -> bool {
        node < self.nodes.len()
    }

    pub fn is_socket_valid(&self, socket: NodeSocket) -> bool {
        self.nodes
            .get(socket.node)
            .map(|n| socket.socket < n.num_sockets())
            .unwrap_or(false)
    }

    pub fn is_input_socket(&self, socket: NodeSocket) -> bool {
        self.nodes
            .get(socket.node)
            .map(|n| socket.socket < n.start_output_index)
            .unwrap_or(false)
    }

    /// Is the node an execution node, i.e. does it have at least one
    /// execution socket?
    pub fn is_execution_node(&self, node: usize) -> bool {
        self.nodes
            .get(node)
            .map(|n| n.definition.is_execution())
            .unwrap_or(false)
    }

    /// Get the metadata of a node's socket, honouring per-instance type
    /// reductions and literal overrides.
    pub fn socket_meta(&self, socket: NodeSocket) -> SocketMeta {
        let node = &self.nodes[socket.node];
        let def_index = node.definition_socket_index(socket.socket);
        let def_meta = &node.definition.sockets[def_index];

        let default = if socket.socket < node.start_output_index {
            node.literal_values[socket.socket].clone()
        } else {
            def_meta.default.clone()
        };

        SocketMeta {
            name: def_meta.name.clone(),
            description: def_meta.description.clone(),
            typ: node.reduced_types[socket.socket],
            default,
        }
    }

    /// Find the index of the first wire originating at the given socket, by
    /// binary search over the sorted wire list.
    pub fn wire_find_first(&self, socket: NodeSocket) -> Option<usize> {
        let index = self
            .wires
            .partition_point(|w| w.from < socket);
        if index < self.wires.len() && self.wires[index].from == socket {
            Some(index)
        } else {
            None
        }
    }

    /// Iterate over the wires originating at the given socket.
    pub fn wires_from(&self, socket: NodeSocket) -> impl Iterator<Item = &Wire> {
        let start = self.wires.partition_point(|w| w.from < socket);
        self.wires[start..].iter().take_while(move |w| w.from == socket)
    }

    /// The number of connections a socket has.
    pub fn num_connections(&self, socket: NodeSocket) -> usize {
        self.wires_from(socket).count()
    }

    /// The socket on the far side of an input socket's single wire, if any.
    pub fn connected_from(&self, socket: NodeSocket) -> Option<NodeSocket> {
        self.wire_find_first(socket).map(|i| self.wires[i].to)
    }

    /// Add a wire connecting two sockets. Both orientations are inserted and
    /// the wire list stays sorted.
    ///
    /// Validates that both endpoints exist, that their declared types
    /// intersect, and that the single-connection rules hold: a non-execution
    /// input admits at most one incoming wire, and an execution output
    /// admits at most one outgoing wire.
    pub fn add_wire(&mut self, wire: Wire, file: &str, handler: &Handler) -> bool {
        if !self.is_socket_valid(wire.from) || !self.is_socket_valid(wire.to) {
            handler.error(
                file,
                self.wire_line(wire),
                "Wire endpoint does not exist".to_string(),
            );
            return false;
        }

        let from_meta = self.socket_meta(wire.from);
        let to_meta = self.socket_meta(wire.to);

        if (from_meta.typ & to_meta.typ).is_empty() {
            handler.error(
                file,
                self.wire_line(wire),
                format!(
                    "Wire between sockets of incompatible types ({} and {})",
                    types::type_name(from_meta.typ),
                    types::type_name(to_meta.typ)
                ),
            );
            return false;
        }

        let from_is_exec = from_meta.is_execution();
        let to_is_exec = to_meta.is_execution();

        if !self.is_input_socket(wire.from) && from_is_exec && self.num_connections(wire.from) > 0
        {
            handler.error(
                file,
                self.wire_line(wire),
                "Execution output socket can only have one connection",
            );
            return false;
        }

        if self.is_input_socket(wire.to) && !to_is_exec && self.num_connections(wire.to) > 0 {
            handler.error(
                file,
                self.wire_line(wire),
                "Input socket can only have one connection",
            );
            return false;
        }

        self.insert_sorted(wire);
        self.insert_sorted(wire.reversed());
        true
    }

    fn insert_sorted(&mut self, wire: Wire) {
        let index = self.wires.partition_point(|w| *w < wire);
        self.wires.insert(index, wire);
    }

    fn wire_line(&self, wire: Wire) -> usize {
        self.nodes
            .get(wire.to.node)
            .or_else(|| self.nodes.get(wire.from.node))
            .map(|n| n.line)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CoreOp;
    use dsc_util::DType;

    fn add_node(graph: &mut Graph, op: CoreOp) -> usize {
        let def = Rc::new(op.definition());
        graph.add_node(Node::from_definition(def, 1, 0, None))
    }

    #[test]
    fn test_add_node_returns_stable_indices() {
        let mut graph = Graph::new();
        assert_eq!(add_node(&mut graph, CoreOp::Subtract), 0);
        assert_eq!(add_node(&mut graph, CoreOp::Print), 1);
    }

    #[test]
    fn test_wires_are_stored_twice_and_sorted() {
        let mut graph = Graph::new();
        let sub = add_node(&mut graph, CoreOp::Subtract);
        let print = add_node(&mut graph, CoreOp::Print);

        let handler = Handler::new();
        let wire = Wire::new(NodeSocket::new(sub, 2), NodeSocket::new(print, 1));
        assert!(graph.add_wire(wire, "test.dc", &handler));
        assert!(!handler.has_errors());

        assert_eq!(graph.wires.len(), 2);
        for window in graph.wires.windows(2) {
            assert!(window[0] <= window[1]);
        }
        assert!(graph.wires.contains(&wire));
        assert!(graph.wires.contains(&wire.reversed()));
    }

    #[test]
    fn test_wire_find_first() {
        let mut graph = Graph::new();
        let sub = add_node(&mut graph, CoreOp::Subtract);
        let print = add_node(&mut graph, CoreOp::Print);

        let handler = Handler::new();
        let out = NodeSocket::new(sub, 2);
        let input = NodeSocket::new(print, 1);
        graph.add_wire(Wire::new(out, input), "test.dc", &handler);

        assert_eq!(graph.connected_from(input), Some(out));
        assert_eq!(graph.connected_from(out), Some(input));
        assert_eq!(graph.wire_find_first(NodeSocket::new(sub, 0)), None);
    }

    #[test]
    fn test_input_single_connection_rule() {
        let mut graph = Graph::new();
        let a = add_node(&mut graph, CoreOp::Subtract);
        let b = add_node(&mut graph, CoreOp::Subtract);
        let print = add_node(&mut graph, CoreOp::Print);

        let handler = Handler::new();
        let input = NodeSocket::new(print, 1);
        assert!(graph.add_wire(
            Wire::new(NodeSocket::new(a, 2), input),
            "test.dc",
            &handler
        ));
        assert!(!graph.add_wire(
            Wire::new(NodeSocket::new(b, 2), input),
            "test.dc",
            &handler
        ));
        assert!(handler.has_errors());
    }

    #[test]
    fn test_type_intersection_rule() {
        let mut graph = Graph::new();
        let sub = add_node(&mut graph, CoreOp::Subtract);
        let ifthen = add_node(&mut graph, CoreOp::IfThen);

        let handler = Handler::new();
        // Subtract's numeric output into IfThen's boolean condition.
        let wire = Wire::new(NodeSocket::new(sub, 2), NodeSocket::new(ifthen, 1));
        assert!(!graph.add_wire(wire, "test.dc", &handler));
        assert!(handler.has_errors());
    }

    #[test]
    fn test_infinite_input_socket_meta() {
        let mut graph = Graph::new();
        let def = Rc::new(CoreOp::Add.definition());
        // Add with three inputs instead of the declared one.
        let node = graph.add_node(Node::from_definition(def, 1, 2, None));

        assert_eq!(graph.nodes[node].num_inputs(), 3);
        let meta = graph.socket_meta(NodeSocket::new(node, 2));
        assert_eq!(meta.name, "value");

        // The output socket index is rewritten so definition-relative
        // indexing still works.
        let out = graph.socket_meta(NodeSocket::new(node, 3));
        assert_eq!(out.name, "output");
    }

    #[test]
    fn test_execution_output_single_connection() {
        let mut graph = Graph::new();
        let print_a = add_node(&mut graph, CoreOp::Print);
        let print_b = add_node(&mut graph, CoreOp::Print);
        let print_c = add_node(&mut graph, CoreOp::Print);

        let handler = Handler::new();
        let after = NodeSocket::new(print_a, 2);
        assert!(graph.add_wire(
            Wire::new(after, NodeSocket::new(print_b, 0)),
            "t",
            &handler
        ));
        assert!(!graph.add_wire(
            Wire::new(after, NodeSocket::new(print_c, 0)),
            "t",
            &handler
        ));
    }

    #[test]
    fn test_socket_meta_uses_reduced_types() {
        let mut graph = Graph::new();
        let sub = add_node(&mut graph, CoreOp::Subtract);
        graph.nodes[sub].reduced_types[2] = DType::Int.into();
        let meta = graph.socket_meta(NodeSocket::new(sub, 2));
        assert_eq!(meta.typ, types::TypeSet::from(DType::Int));
    }
}
