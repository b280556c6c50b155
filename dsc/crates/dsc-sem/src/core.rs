//! The core operations built into the language.
//!
//! There are exactly 24 of them. The name table is kept in alphabetical
//! order so lookup is a binary search.

use dsc_util::meta::{exec_socket, socket};
use dsc_util::{types, DType, NodeDefinition, SocketMeta};

/// A core operation.
///
/// The discriminants match the alphabetical name table below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CoreOp {
    Add,
    And,
    Div,
    Divide,
    Equal,
    For,
    IfThen,
    IfThenElse,
    Length,
    LessThan,
    LessThanOrEqual,
    Mod,
    MoreThan,
    MoreThanOrEqual,
    Multiply,
    Not,
    NotEqual,
    Or,
    Print,
    Set,
    Subtract,
    Ternary,
    While,
    Xor,
}

/// Core-op names, in alphabetical order for binary search.
const CORE_OP_NAMES: [(&str, CoreOp); 24] = [
    ("Add", CoreOp::Add),
    ("And", CoreOp::And),
    ("Div", CoreOp::Div),
    ("Divide", CoreOp::Divide),
    ("Equal", CoreOp::Equal),
    ("For", CoreOp::For),
    ("IfThen", CoreOp::IfThen),
    ("IfThenElse", CoreOp::IfThenElse),
    ("Length", CoreOp::Length),
    ("LessThan", CoreOp::LessThan),
    ("LessThanOrEqual", CoreOp::LessThanOrEqual),
    ("Mod", CoreOp::Mod),
    ("MoreThan", CoreOp::MoreThan),
    ("MoreThanOrEqual", CoreOp::MoreThanOrEqual),
    ("Multiply", CoreOp::Multiply),
    ("Not", CoreOp::Not),
    ("NotEqual", CoreOp::NotEqual),
    ("Or", CoreOp::Or),
    ("Print", CoreOp::Print),
    ("Set", CoreOp::Set),
    ("Subtract", CoreOp::Subtract),
    ("Ternary", CoreOp::Ternary),
    ("While", CoreOp::While),
    ("Xor", CoreOp::Xor),
];

impl CoreOp {
    /// Look a name up in the core-op table.
    pub fn find_name(name: &str) -> Option<CoreOp> {
        CORE_OP_NAMES
            .binary_search_by(|(n, _)| n.cmp(&name))
            .ok()
            .map(|i| CORE_OP_NAMES[i].1)
    }

    pub fn name(self) -> &'static str {
        CORE_OP_NAMES
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(n, _)| *n)
            .unwrap_or("?")
    }

    /// Build the node definition of this core op.
    pub fn definition(self) -> NodeDefinition {
        let (description, inputs, outputs, infinite): (
            &str,
            Vec<SocketMeta>,
            Vec<SocketMeta>,
            bool,
        ) = match self {
            CoreOp::Add => (
                "Add numbers together.",
                vec![socket("value", types::number())],
                vec![socket("output", types::number())],
                true,
            ),
            CoreOp::And => (
                "Bitwise or logical AND.",
                vec![socket("a", types::bitwise()), socket("b", types::bitwise())],
                vec![socket("output", types::bitwise())],
                false,
            ),
            CoreOp::Div => (
                "Integer division, discarding the remainder.",
                vec![socket("a", types::number()), socket("b", types::number())],
                vec![socket("output", DType::Int)],
                false,
            ),
            CoreOp::Divide => (
                "Division, keeping the fractional part.",
                vec![socket("a", types::number()), socket("b", types::number())],
                vec![socket("output", DType::Float)],
                false,
            ),
            CoreOp::Equal => (
                "Are the two inputs equal?",
                vec![socket("a", types::var_any()), socket("b", types::var_any())],
                vec![socket("output", DType::Bool)],
                false,
            ),
            CoreOp::For => (
                "Loop over a range of numbers.",
                vec![
                    exec_socket("before", "Activating this starts the loop."),
                    socket("start", types::number()),
                    socket("stop", types::number()),
                    socket("step", types::number()),
                ],
                vec![
                    exec_socket("loop", "Activated for each value of the index."),
                    socket("index", types::number()),
                    exec_socket("after", "Activated once the loop has finished."),
                ],
                false,
            ),
            CoreOp::IfThen => (
                "Only run if the condition is true.",
                vec![
                    exec_socket("before", ""),
                    socket("condition", DType::Bool),
                ],
                vec![
                    exec_socket("then", "Activated if the condition is true."),
                    exec_socket("after", ""),
                ],
                false,
            ),
            CoreOp::IfThenElse => (
                "Choose a branch depending on the condition.",
                vec![
                    exec_socket("before", ""),
                    socket("condition", DType::Bool),
                ],
                vec![
                    exec_socket("then", "Activated if the condition is true."),
                    exec_socket("else", "Activated if the condition is false."),
                    exec_socket("after", ""),
                ],
                false,
            ),
            CoreOp::Length => (
                "The length of a string.",
                vec![socket("string", DType::String)],
                vec![socket("length", DType::Int)],
                false,
            ),
            CoreOp::LessThan => (
                "Is a less than b?",
                vec![
                    socket("a", types::var_any()),
                    socket("b", types::var_any()),
                ],
                vec![socket("output", DType::Bool)],
                false,
            ),
            CoreOp::LessThanOrEqual => (
                "Is a less than or equal to b?",
                vec![
                    socket("a", types::var_any()),
                    socket("b", types::var_any()),
                ],
                vec![socket("output", DType::Bool)],
                false,
            ),
            CoreOp::Mod => (
                "The remainder of an integer division.",
                vec![socket("a", DType::Int), socket("b", DType::Int)],
                vec![socket("output", DType::Int)],
                false,
            ),
            CoreOp::MoreThan => (
                "Is a more than b?",
                vec![
                    socket("a", types::var_any()),
                    socket("b", types::var_any()),
                ],
                vec![socket("output", DType::Bool)],
                false,
            ),
            CoreOp::MoreThanOrEqual => (
                "Is a more than or equal to b?",
                vec![
                    socket("a", types::var_any()),
                    socket("b", types::var_any()),
                ],
                vec![socket("output", DType::Bool)],
                false,
            ),
            CoreOp::Multiply => (
                "Multiply numbers together.",
                vec![socket("value", types::number())],
                vec![socket("output", types::number())],
                true,
            ),
            CoreOp::Not => (
                "Bitwise or logical NOT.",
                vec![socket("value", types::bitwise())],
                vec![socket("output", types::bitwise())],
                false,
            ),
            CoreOp::NotEqual => (
                "Are the two inputs different?",
                vec![socket("a", types::var_any()), socket("b", types::var_any())],
                vec![socket("output", DType::Bool)],
                false,
            ),
            CoreOp::Or => (
                "Bitwise or logical OR.",
                vec![socket("a", types::bitwise()), socket("b", types::bitwise())],
                vec![socket("output", types::bitwise())],
                false,
            ),
            CoreOp::Print => (
                "Print a value to the standard output.",
                vec![exec_socket("before", ""), socket("value", types::var_any())],
                vec![exec_socket("after", "")],
                false,
            ),
            CoreOp::Set => (
                "Store a new value in a variable.",
                vec![
                    socket("variable", DType::Name),
                    exec_socket("before", ""),
                    socket("value", types::var_any()),
                ],
                vec![exec_socket("after", "")],
                false,
            ),
            CoreOp::Subtract => (
                "Subtract one number from another.",
                vec![socket("a", types::number()), socket("b", types::number())],
                vec![socket("output", types::number())],
                false,
            ),
            CoreOp::Ternary => (
                "Choose one of two values depending on a condition.",
                vec![
                    socket("condition", DType::Bool),
                    socket("if_true", types::var_any()),
                    socket("if_false", types::var_any()),
                ],
                vec![socket("output", types::var_any())],
                false,
            ),
            CoreOp::While => (
                "Loop while the condition is true.",
                vec![exec_socket("before", ""), socket("condition", DType::Bool)],
                vec![
                    exec_socket("loop", "Activated while the condition holds."),
                    exec_socket("after", ""),
                ],
                false,
            ),
            CoreOp::Xor => (
                "Bitwise or logical XOR.",
                vec![socket("a", types::bitwise()), socket("b", types::bitwise())],
                vec![socket("output", types::bitwise())],
                false,
            ),
        };

        let start_output_index = inputs.len();
        let mut sockets = inputs;
        sockets.extend(outputs);

        let mut def = NodeDefinition::new(self.name(), description, sockets, start_output_index);
        def.infinite_inputs = infinite;
        def
    }
}
