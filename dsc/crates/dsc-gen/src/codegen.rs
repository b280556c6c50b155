//! Lowering the typed graph to stack-machine bytecode.
//!
//! The generator virtually models the operand stack: `stack_top` is the
//! index of the current top entry (frame-relative, -1 when empty), and every
//! socket records the index its value lives at once computed. Subsequent
//! uses either find the value at the top or emit a copy-from-frame
//! instruction to bring it there.

use crate::bcode::{BCode, LinkTable};
use dsc_sem::name::{self, NameDefinition, NameItem};
use dsc_sem::{CoreOp, Graph, LinkKind, LinkMeta, NodeSocket, Sheet, SheetFunction};
use dsc_util::{types, DInt, DType, NodeDefinition, SocketMeta, WORD_SIZE};
use dsc_vm::{Opcode, Syscall, FIMM_SIZE};
use std::rc::Rc;
use tracing::{debug, trace};

/// Everything the generator tracks while building one sheet's bytecode.
pub struct BuildContext<'a> {
    sheet: &'a Sheet,
    /// Frame-relative index of the virtual stack's top entry; -1 when the
    /// frame is empty.
    stack_top: DInt,
    /// The data section being appended to.
    pub data: Vec<u8>,
    /// The link-metadata table being accumulated.
    pub links: LinkTable,
    /// Scratch per-socket stack positions, kept out of the graph itself.
    stack_positions: Vec<Vec<Option<DInt>>>,
    /// Whether to record debug annotations.
    debug: bool,
}

impl<'a> BuildContext<'a> {
    pub fn new(sheet: &'a Sheet, debug: bool) -> Self {
        let stack_positions = sheet
            .graph
            .nodes
            .iter()
            .map(|n| vec![None; n.num_sockets()])
            .collect();

        BuildContext {
            sheet,
            stack_top: -1,
            data: Vec::new(),
            links: LinkTable::default(),
            stack_positions,
            debug,
        }
    }

    fn graph(&self) -> &'a Graph {
        &self.sheet.graph
    }

    fn stack_index(&self, socket: NodeSocket) -> Option<DInt> {
        self.stack_positions[socket.node][socket.socket]
    }

    fn set_stack_index(&mut self, socket: NodeSocket, index: DInt) {
        self.stack_positions[socket.node][socket.socket] = Some(index);
    }

    /// Turn a frame-relative index into a top-relative one (always <= 0).
    fn index_from_top(&self, index: DInt) -> DInt {
        index - self.stack_top
    }

    fn is_index_top(&self, index: DInt) -> bool {
        index == self.stack_top
    }

    /// Allocate bytes from the data section.
    fn alloc_data(&mut self, size: usize) -> usize {
        let offset = self.data.len();
        self.data.resize(offset + size, 0);
        offset
    }

    fn write_data_word(&mut self, offset: usize, value: DInt) {
        self.data[offset..offset + WORD_SIZE].copy_from_slice(&value.to_le_bytes());
    }

    /// Find or add a link record, and point the instruction at `ins` in the
    /// fragment at it.
    fn add_link(
        &mut self,
        bcode: Option<&mut BCode>,
        ins: usize,
        meta: LinkMeta,
    ) -> (usize, bool) {
        trace!(name = %meta.name, kind = ?meta.kind, "linking instruction");
        let (index, was_duplicate) = self.links.intern(meta);
        if let Some(bcode) = bcode {
            bcode.add_link(ins, index);
        }
        (index, was_duplicate)
    }

    /// Allocate a string literal in the data section, deduplicated by
    /// value, and register a relocation for the given instruction.
    fn alloc_string_literal(
        &mut self,
        bcode: Option<&mut BCode>,
        ins: usize,
        literal: &str,
    ) -> usize {
        let meta = LinkMeta::new(LinkKind::StringLiteral, literal);
        let (index, was_duplicate) = self.add_link(bcode, ins, meta);

        if !was_duplicate {
            let offset = self.alloc_data(literal.len() + 1);
            self.data[offset..offset + literal.len()].copy_from_slice(literal.as_bytes());
            self.links.list[index].ptr = Some(offset);
        }

        self.links.list[index].ptr.expect("literal was allocated")
    }

    /// Lay a variable out in the data section, initialised with its default
    /// value.
    fn alloc_variable(&mut self, meta: &SocketMeta, link_index: usize) {
        let size = if meta.typ == types::TypeSet::from(DType::Bool) {
            1
        } else {
            WORD_SIZE
        };
        let offset = self.alloc_data(size);

        if meta.typ == types::TypeSet::from(DType::Bool) {
            self.data[offset] = meta.default.as_int() as u8;
        } else if meta.typ == types::TypeSet::from(DType::String) {
            // The default value goes into the data section as a literal;
            // linking allocates a fresh owning string from it and stores
            // the address in the variable's cell.
            let name = self.links.list[link_index].name.clone();
            let default = match &meta.default {
                dsc_util::DValue::Str(s) => s.clone(),
                _ => String::new(),
            };

            let meta = LinkMeta::new(LinkKind::VariableStringDefault, name);
            let (default_index, was_duplicate) = self.add_link(None, 0, meta);
            if !was_duplicate {
                let literal_offset = self.alloc_string_literal(None, 0, &default);
                self.links.list[default_index].ptr = Some(literal_offset);
            }
        } else {
            self.write_data_word(offset, meta.default.as_word());
        }

        self.links.list[link_index].ptr = Some(offset);
    }

    /// The metadata of the variable a name definition points at.
    fn variable_meta(&self, name_def: &NameDefinition) -> &'a SocketMeta {
        let owner = name::sheet_at_path(self.sheet, &name_def.path);
        match name_def.item {
            NameItem::Variable(index) => &owner.variables[index].meta,
            _ => unreachable!("name definition is not a variable"),
        }
    }

    /// The function a name definition points at.
    fn function(&self, name_def: &NameDefinition) -> &'a SheetFunction {
        let owner = name::sheet_at_path(self.sheet, &name_def.path);
        match name_def.item {
            NameItem::Function(index) => &owner.functions[index],
            _ => unreachable!("name definition is not a function"),
        }
    }

    /// The definition of the native function a name definition points at.
    fn native_definition(&self, name_def: &NameDefinition) -> &'a Rc<NodeDefinition> {
        let owner = name::sheet_at_path(self.sheet, &name_def.path);
        match name_def.item {
            NameItem::Native(index) => &owner.natives[index].definition,
            _ => unreachable!("name definition is not a native function"),
        }
    }
}

/// Generate bytecode to push a socket's literal onto the stack.
///
/// Strings go into the data section (deduplicated by value) with a
/// relocation so the push operand becomes the literal's address at link
/// time. With `cvt_float`, integer literals are pushed then converted.
fn push_literal(ctx: &mut BuildContext, socket: NodeSocket, cvt_float: bool) -> BCode {
    let meta = ctx.graph().socket_meta(socket);

    let mut out = BCode::ins(Opcode::PushF);
    out.set_fimm(1, meta.default.as_word());

    if meta.typ == types::TypeSet::from(DType::Int) && cvt_float {
        out.append(BCode::ins(Opcode::CvtF));
    } else if meta.typ == types::TypeSet::from(DType::String) {
        let literal = meta.default.as_str().unwrap_or("").to_string();
        ctx.alloc_string_literal(Some(&mut out), 0, &literal);
    }

    ctx.stack_top += 1;
    let top = ctx.stack_top;
    ctx.set_stack_index(socket, top);

    out
}

/// Generate bytecode to push a variable's value onto the stack, given the
/// getter node. Booleans dereference a single byte.
fn push_variable(ctx: &mut BuildContext, node_index: usize) -> BCode {
    let name_def = ctx.graph().nodes[node_index]
        .name_definition
        .clone()
        .expect("variable getter has a name definition");
    let var_meta = ctx.variable_meta(&name_def);
    let var_name = var_meta.name.clone();
    let is_bool = var_meta.typ == types::TypeSet::from(DType::Bool);
    let is_string = var_meta.typ == types::TypeSet::from(DType::String);

    let opcode = if is_bool {
        Opcode::DerefBI
    } else {
        Opcode::DerefI
    };

    // The address operand is filled in by the linker.
    let mut out = BCode::ins(opcode);
    out.set_fimm(1, 0);

    ctx.stack_top += 1;
    let top = ctx.stack_top;
    ctx.set_stack_index(NodeSocket::new(node_index, 0), top);

    let kind = if is_string {
        LinkKind::VariablePointer
    } else {
        LinkKind::Variable
    };
    ctx.add_link(Some(&mut out), 0, LinkMeta::new(kind, var_name));

    if ctx.debug {
        out.mark_node(0, node_index);
    }

    out
}

/// Push a function or subroutine argument: by the calling convention it
/// already sits in the frame, so copy it to the top.
fn push_argument(ctx: &mut BuildContext, socket: NodeSocket) -> BCode {
    if ctx.graph().is_input_socket(socket) {
        return BCode::new();
    }

    let mut index = socket.socket as DInt;
    if ctx.graph().is_execution_node(socket.node) {
        index -= 1;
    }

    let mut out = BCode::ins(Opcode::GetFI);
    out.set_fimm(1, index);

    // The caller sets the consumer socket's stack index, since the value is
    // a copy.
    ctx.stack_top += 1;
    out
}

/// Generate bytecode to bring the value of an input socket to the top of
/// the stack, computing it first if necessary.
fn push_input(ctx: &mut BuildContext, socket: NodeSocket, force_float: bool) -> BCode {
    let meta = ctx.graph().socket_meta(socket);
    let mut out = BCode::new();

    if !ctx.graph().is_input_socket(socket)
        || meta.typ == types::TypeSet::from(DType::Execution)
    {
        return out;
    }

    let wire_index = match ctx.graph().wire_find_first(socket) {
        None => {
            // The input is a literal.
            return push_literal(ctx, socket, force_float);
        }
        Some(index) => index,
    };

    let wire = ctx.graph().wires[wire_index];
    let conn = wire.to;
    let conn_node = &ctx.graph().nodes[conn.node];
    let is_execution = conn_node.definition.is_execution();
    let is_define = conn_node.definition.name == "Define";
    let is_variable = matches!(
        conn_node.name_definition.as_ref().map(|d| &d.item),
        Some(NameItem::Variable(_))
    );

    let mut check_if_on_top = true;
    let mut force_on_top = false;

    // Has this output not been generated yet, or has it been popped off?
    let conn_index = ctx.stack_index(conn);
    let available = conn_index.map(|i| i <= ctx.stack_top).unwrap_or(false);

    if !available {
        if is_define {
            out = push_argument(ctx, conn);
            let top = ctx.stack_top;
            ctx.set_stack_index(socket, top);
            check_if_on_top = false;
        } else if !is_execution {
            out = generate_nonexecution_node(ctx, conn.node);
        }
    } else if is_execution {
        // The value was produced by an execution node earlier in the chain;
        // copy it to the top like an argument.
        force_on_top = true;
    } else if is_variable {
        // The getter was already used, but the variable may have been Set
        // since; read it again.
        out = push_variable(ctx, conn.node);
    }

    if check_if_on_top || force_on_top {
        let input_index = ctx.stack_index(conn).unwrap_or(ctx.stack_top);

        if !ctx.is_index_top(input_index) || force_on_top {
            let mut get = BCode::ins(Opcode::GetFI);
            get.set_fimm(1, ctx.index_from_top(input_index));
            out.append(get);

            ctx.stack_top += 1;
            let top = ctx.stack_top;
            if !force_on_top {
                ctx.set_stack_index(conn, top);
            }
            ctx.set_stack_index(socket, top);
        } else {
            ctx.set_stack_index(socket, input_index);
        }
    }

    // The first instruction after this bytecode sees the value arrive over
    // the wire.
    if ctx.debug {
        let forward = dsc_sem::Wire::new(conn, socket);
        out.mark_value_wire(out.size(), forward, 0);
    }

    out
}

/// Generate bytecode to push a node's input values.
///
/// With `order` the inputs are pushed first-to-last so the last input ends
/// on top; without it they are pushed last-to-first so the first input ends
/// on top. After generation, if the inputs do not sit contiguously at the
/// top of the stack in that order, copies are emitted to put them there.
fn push_node_inputs(
    ctx: &mut BuildContext,
    node_index: usize,
    order: bool,
    ignore_literals: bool,
    force_float: bool,
) -> BCode {
    let num_inputs = ctx.graph().nodes[node_index].num_inputs();

    let relevant: Vec<usize> = (0..num_inputs)
        .filter(|&i| {
            let socket = NodeSocket::new(node_index, i);
            let meta = ctx.graph().socket_meta(socket);
            if (meta.typ & types::var_any()).is_empty() {
                return false;
            }
            ctx.graph().num_connections(socket) >= 1
                || meta.typ == types::TypeSet::from(DType::Float)
                || !ignore_literals
        })
        .collect();

    let push_order: Vec<usize> = if order {
        relevant.clone()
    } else {
        relevant.iter().rev().copied().collect()
    };

    let mut out = BCode::new();
    for &i in &push_order {
        let input = push_input(ctx, NodeSocket::new(node_index, i), force_float);
        out.append(input);
    }

    // Verify the inputs sit in order at the top of the stack.
    let mut positions_correct = true;
    for (checked, &i) in push_order.iter().rev().enumerate() {
        let index = ctx.stack_index(NodeSocket::new(node_index, i));
        match index {
            Some(index) if ctx.index_from_top(index) == -(checked as DInt) => {}
            _ => {
                positions_correct = false;
                break;
            }
        }
    }

    // If not, copy them into the expected layout.
    if !positions_correct {
        for &i in &push_order {
            let socket = NodeSocket::new(node_index, i);
            let index = ctx.stack_index(socket).unwrap_or(ctx.stack_top);

            let mut get = BCode::ins(Opcode::GetFI);
            get.set_fimm(1, ctx.index_from_top(index));
            out.append(get);

            ctx.stack_top += 1;
            let top = ctx.stack_top;
            ctx.set_stack_index(socket, top);
        }
    }

    out
}

/// Generate bytecode for an operator node.
///
/// Prefers the full-immediate variant when an operand is a non-float
/// literal; switches the whole node to the float variant when any input is
/// a float or the caller forces it.
fn generate_operator(
    ctx: &mut BuildContext,
    node_index: usize,
    opcode: Opcode,
    fopcode: Option<Opcode>,
    fiopcode: Option<Opcode>,
    force_float: bool,
) -> BCode {
    let num_inputs = ctx.graph().nodes[node_index].num_inputs();

    let mut convert_float = force_float;
    if !convert_float {
        for i in 0..num_inputs {
            let meta = ctx.graph().socket_meta(NodeSocket::new(node_index, i));
            if meta.typ == types::TypeSet::from(DType::Float) {
                convert_float = true;
                break;
            }
        }
    }

    let init_stack_top = ctx.stack_top;
    let first_socket = NodeSocket::new(node_index, 0);
    let first_connections = ctx.graph().num_connections(first_socket);

    // Push the connected inputs; literals stay behind as immediates, except
    // that the first input is always materialised.
    let mut out = push_node_inputs(ctx, node_index, false, !convert_float, convert_float);
    if !convert_float && first_connections == 0 {
        let literal = push_literal(ctx, first_socket, convert_float);
        out.append(literal);
    }

    if ctx.debug {
        out.mark_node(out.size(), node_index);
    }

    let non_immediate = if convert_float {
        fopcode.unwrap_or(opcode)
    } else {
        opcode
    };

    for socket_index in 1..=num_inputs {
        let socket = NodeSocket::new(node_index, socket_index);

        if socket_index < num_inputs {
            let meta = ctx.graph().socket_meta(socket);
            let connections = ctx.graph().num_connections(socket);

            let use_immediate = !convert_float
                && meta.typ != types::TypeSet::from(DType::Float)
                && connections == 0
                && fiopcode.is_some();

            if use_immediate {
                let mut sub = BCode::ins(fiopcode.expect("immediate opcode"));
                sub.set_fimm(1, meta.default.as_word());
                out.append(sub);
            } else {
                out.append(BCode::ins(non_immediate));
            }
        } else {
            // The output socket.
            if socket_index == 1 {
                // A single-input operator applies its opcode in place.
                out.append(BCode::ins(non_immediate));
            }

            ctx.stack_top = init_stack_top + 1;
            let top = ctx.stack_top;
            ctx.set_stack_index(socket, top);
        }
    }

    out
}

/// Generate bytecode for a comparator node. String comparisons go through
/// the strcmp syscall with an argument selecting the predicate.
fn generate_comparator(
    ctx: &mut BuildContext,
    node_index: usize,
    opcode: Opcode,
    fopcode: Opcode,
    strcmp_arg: DInt,
    not_after: bool,
) -> BCode {
    let num_inputs = ctx.graph().nodes[node_index].num_inputs();

    let mut is_string = false;
    let mut is_float = false;
    for i in 0..num_inputs {
        let meta = ctx.graph().socket_meta(NodeSocket::new(node_index, i));
        if meta.typ == types::TypeSet::from(DType::String) {
            is_string = true;
            break;
        } else if meta.typ == types::TypeSet::from(DType::Float) {
            is_float = true;
            break;
        }
    }

    let mut out = push_node_inputs(ctx, node_index, false, false, is_float);

    if ctx.debug {
        out.mark_node(out.size(), node_index);
    }

    if is_string {
        let mut arg = BCode::ins(Opcode::PushF);
        arg.set_fimm(1, strcmp_arg);
        out.append(arg);

        let mut syscall = BCode::ins(Opcode::Syscall);
        syscall.set_byte(1, Syscall::Strcmp as i8);
        out.append(syscall);
    } else {
        let comp = if is_float { fopcode } else { opcode };
        out.append(BCode::ins(comp));
    }

    if not_after {
        out.append(BCode::ins(Opcode::Not));
    }

    ctx.stack_top -= 1;
    let top = ctx.stack_top;
    ctx.set_stack_index(NodeSocket::new(node_index, 2), top);

    out
}

/// Generate bytecode to call a function or subroutine node.
///
/// Arguments are pushed in order; the callee leaves its return values at
/// the top of the stack in declaration order.
fn generate_call(ctx: &mut BuildContext, node_index: usize) -> BCode {
    let name_def = ctx.graph().nodes[node_index]
        .name_definition
        .clone()
        .expect("call node has a name definition");

    let (func_def, opcode, link_kind): (Rc<NodeDefinition>, Opcode, LinkKind) =
        match name_def.item {
            NameItem::Function(_) => (
                ctx.function(&name_def).definition.clone(),
                Opcode::CallI,
                LinkKind::Function,
            ),
            NameItem::Native(_) => (
                ctx.native_definition(&name_def).clone(),
                Opcode::CallCI,
                LinkKind::CFunction,
            ),
            _ => unreachable!("call node resolves to a function or native"),
        };

    let is_subroutine = func_def.is_execution();
    let mut num_args = func_def.num_inputs();
    let mut num_returns = func_def.num_outputs();
    if is_subroutine {
        num_args -= 1;
        num_returns -= 1;
    }

    let stack_before_args = ctx.stack_top;

    // Push the arguments in order, so the first argument is deepest.
    let mut out = push_node_inputs(ctx, node_index, true, false, false);

    let mut call = BCode::ins(opcode);
    call.set_byte(FIMM_SIZE + 1, num_args as i8);
    ctx.add_link(
        Some(&mut call),
        0,
        LinkMeta::new(link_kind, func_def.name.clone()),
    );

    if ctx.debug {
        call.mark_node(0, node_index);
    }

    out.append(call);

    // A user function's return discards the argument run, leaving only the
    // return values; a native call pushes its returns above the arguments.
    let is_native = matches!(name_def.item, NameItem::Native(_));
    ctx.stack_top = if is_native {
        stack_before_args + num_args as DInt + num_returns as DInt
    } else {
        stack_before_args + num_returns as DInt
    };

    let num_inputs = func_def.num_inputs();
    let num_outputs = func_def.num_outputs();
    let mut top = ctx.stack_top;
    for socket_index in num_inputs..num_inputs + num_outputs {
        let socket = NodeSocket::new(node_index, socket_index);
        let meta = ctx.graph().socket_meta(socket);
        if meta.typ != types::TypeSet::from(DType::Execution) {
            ctx.set_stack_index(socket, top);
            top -= 1;
        }
    }

    out
}

/// Generate bytecode for a Return node: push the return values and return.
fn generate_return(ctx: &mut BuildContext, node_index: usize) -> BCode {
    let name_def = ctx.graph().nodes[node_index]
        .name_definition
        .clone()
        .expect("return node names its function");
    let func_def = ctx.function(&name_def).definition.clone();

    let mut num_returns = func_def.num_outputs();
    if func_def.is_execution() {
        num_returns -= 1;
    }

    let mut out = if num_returns > 0 {
        push_node_inputs(ctx, node_index, false, false, false)
    } else {
        BCode::new()
    };

    let mut ret = if num_returns == 0 {
        BCode::ins(Opcode::Ret)
    } else {
        let mut ret = BCode::ins(Opcode::Retn);
        ret.set_byte(1, num_returns as i8);
        ret
    };

    if ctx.debug {
        ret.mark_node(0, node_index);
    }

    out.append(ret);
    out
}

/// Generate bytecode for a Ternary node.
///
/// Each branch's bytecode is emitted separately and only the active one
/// runs, so the two branches are padded with zero-pushes to the same net
/// stack growth, keeping the operand stack height deterministic.
fn generate_ternary(ctx: &mut BuildContext, node_index: usize) -> BCode {
    let bool_socket = NodeSocket::new(node_index, 0);
    let true_socket = NodeSocket::new(node_index, 1);
    let false_socket = NodeSocket::new(node_index, 2);
    let out_socket = NodeSocket::new(node_index, 3);

    let bool_meta = ctx.graph().socket_meta(bool_socket);
    let bool_is_literal = ctx.graph().num_connections(bool_socket) == 0;
    let bool_literal_value = bool_meta.default.as_int() != 0;

    // A literal condition picks its branch at compile time; only that
    // branch's bytecode is ever emitted.
    if bool_is_literal {
        let chosen = if bool_literal_value {
            true_socket
        } else {
            false_socket
        };
        let out = push_input(ctx, chosen, false);
        if let Some(index) = ctx.stack_index(chosen) {
            ctx.set_stack_index(out_socket, index);
        }
        return out;
    }

    let mut out = push_input(ctx, bool_socket, false);

    // The jump pops the condition. If other nodes still need its value,
    // duplicate it so the original survives; the duplicate is what gets
    // popped, so the stack model does not count it.
    let mut consumed_original = true;
    if let Some(wire_index) = ctx.graph().wire_find_first(bool_socket) {
        let conn = ctx.graph().wires[wire_index].to;
        if ctx.graph().num_connections(conn) > 1 {
            let mut copy = BCode::ins(Opcode::GetFI);
            copy.set_fimm(1, 0);
            out.append(copy);
            consumed_original = false;
        }
    }
    if consumed_original {
        ctx.stack_top -= 1;
    }

    let stack_top_before = ctx.stack_top;

    let mut true_code = push_input(ctx, true_socket, false);
    let stack_top_true = ctx.stack_top;

    ctx.stack_top = stack_top_before;
    let mut false_code = push_input(ctx, false_socket, false);
    let stack_top_false = ctx.stack_top;

    // Equalise the two branches' net stack growth with zero-pushes on the
    // shorter side.
    let final_stack_top = stack_top_true.max(stack_top_false);
    if stack_top_true > stack_top_false {
        let mut pad = BCode::ins(Opcode::PushNF);
        pad.set_fimm(1, stack_top_true - stack_top_false);
        pad.append(false_code);
        false_code = pad;
    } else if stack_top_false > stack_top_true {
        let mut pad = BCode::ins(Opcode::PushNF);
        pad.set_fimm(1, stack_top_false - stack_top_true);
        pad.append(true_code);
        true_code = pad;
    }

    ctx.stack_top = final_stack_top;
    ctx.set_stack_index(out_socket, final_stack_top);

    // [JRCONFI][false][JRFI][true]
    let jump_over_true = (Opcode::JrFI.ins_size() + true_code.size()) as DInt;
    let mut jump = BCode::ins(Opcode::JrFI);
    jump.set_fimm(1, jump_over_true);
    false_code.append(jump);

    let jump_to_true = (Opcode::JrConFI.ins_size() + false_code.size()) as DInt;
    let mut branch = BCode::ins(Opcode::JrConFI);
    branch.set_fimm(1, jump_to_true);

    if ctx.debug {
        branch.mark_node(0, node_index);
    }

    out.append(branch);
    out.append(false_code);
    out.append(true_code);
    out
}

/// Generate bytecode for a non-execution node: an operator, comparator,
/// ternary, variable getter, or pure function call.
fn generate_nonexecution_node(ctx: &mut BuildContext, node_index: usize) -> BCode {
    let def_name = ctx.graph().nodes[node_index].definition.name.clone();
    trace!(node = node_index, name = %def_name, "generating non-execution node");

    let core = CoreOp::find_name(&def_name);

    match core {
        Some(CoreOp::Ternary) => generate_ternary(ctx, node_index),
        Some(CoreOp::Add) => generate_operator(
            ctx,
            node_index,
            Opcode::Add,
            Some(Opcode::AddF),
            Some(Opcode::AddFI),
            false,
        ),
        Some(CoreOp::And) => {
            generate_operator(ctx, node_index, Opcode::And, None, Some(Opcode::AndFI), false)
        }
        Some(op @ (CoreOp::Div | CoreOp::Divide)) => {
            let mut out = generate_operator(
                ctx,
                node_index,
                Opcode::Div,
                Some(Opcode::DivF),
                Some(Opcode::DivFI),
                op == CoreOp::Divide,
            );

            if op == CoreOp::Div {
                // Integer division of floats narrows the result back.
                let float = types::TypeSet::from(DType::Float);
                let a = ctx.graph().socket_meta(NodeSocket::new(node_index, 0));
                let b = ctx.graph().socket_meta(NodeSocket::new(node_index, 1));
                if a.typ == float || b.typ == float {
                    out.append(BCode::ins(Opcode::CvtI));
                }
            }
            out
        }
        Some(CoreOp::Equal) => {
            generate_comparator(ctx, node_index, Opcode::Ceq, Opcode::CeqF, 0, false)
        }
        Some(CoreOp::Length) => {
            let mut out = push_input(ctx, NodeSocket::new(node_index, 0), false);

            if ctx.debug {
                out.mark_node(out.size(), node_index);
            }

            let mut args = BCode::ins(Opcode::PushNF);
            args.set_fimm(1, 2);
            out.append(args);

            let mut syscall = BCode::ins(Opcode::Syscall);
            syscall.set_byte(1, Syscall::Strlen as i8);
            out.append(syscall);

            let top = ctx.stack_top;
            ctx.set_stack_index(NodeSocket::new(node_index, 1), top);
            out
        }
        Some(CoreOp::LessThan) => {
            generate_comparator(ctx, node_index, Opcode::Clt, Opcode::CltF, 2, false)
        }
        Some(CoreOp::LessThanOrEqual) => {
            generate_comparator(ctx, node_index, Opcode::Cleq, Opcode::CleqF, 1, false)
        }
        Some(CoreOp::Mod) => {
            generate_operator(ctx, node_index, Opcode::Mod, None, Some(Opcode::ModFI), false)
        }
        Some(CoreOp::MoreThan) => {
            generate_comparator(ctx, node_index, Opcode::Cmt, Opcode::CmtF, 4, false)
        }
        Some(CoreOp::MoreThanOrEqual) => {
            generate_comparator(ctx, node_index, Opcode::Cmeq, Opcode::CmeqF, 3, false)
        }
        Some(CoreOp::Multiply) => generate_operator(
            ctx,
            node_index,
            Opcode::Mul,
            Some(Opcode::MulF),
            Some(Opcode::MulFI),
            false,
        ),
        Some(CoreOp::Not) => {
            // Integer Not is a bitwise complement, boolean Not is logical.
            let meta = ctx.graph().socket_meta(NodeSocket::new(node_index, 0));
            let not_op = if meta.typ == types::TypeSet::from(DType::Int) {
                Opcode::Inv
            } else {
                Opcode::Not
            };
            generate_operator(ctx, node_index, not_op, None, None, false)
        }
        Some(CoreOp::NotEqual) => {
            generate_comparator(ctx, node_index, Opcode::Ceq, Opcode::CeqF, 0, true)
        }
        Some(CoreOp::Or) => {
            generate_operator(ctx, node_index, Opcode::Or, None, Some(Opcode::OrFI), false)
        }
        Some(CoreOp::Subtract) => generate_operator(
            ctx,
            node_index,
            Opcode::Sub,
            Some(Opcode::SubF),
            Some(Opcode::SubFI),
            false,
        ),
        Some(CoreOp::Xor) => {
            generate_operator(ctx, node_index, Opcode::Xor, None, Some(Opcode::XorFI), false)
        }
        Some(_) => BCode::new(),
        None => {
            // A custom-named node: a variable getter or a function call.
            let name_def = ctx.graph().nodes[node_index].name_definition.clone();
            match name_def.map(|d| d.item) {
                Some(NameItem::Variable(_)) => push_variable(ctx, node_index),
                Some(NameItem::Function(_)) | Some(NameItem::Native(_)) => {
                    generate_call(ctx, node_index)
                }
                _ => BCode::new(),
            }
        }
    }
}

/// The For loop.
///
/// The start value doubles as the loop index: the loop head copies the stop
/// value and the index, compares them with a comparator baked in at compile
/// time when the step is a literal (otherwise a prologue selects it at run
/// time), runs the body, pops the body's leftovers, steps the index and
/// jumps back.
fn generate_for(ctx: &mut BuildContext, node_index: usize, force_floats: bool) -> BCode {
    let index_socket = NodeSocket::new(node_index, 5);
    let step_socket = NodeSocket::new(node_index, 3);
    let loop_socket = NodeSocket::new(node_index, 4);

    let top = ctx.stack_top;
    ctx.set_stack_index(index_socket, top);

    let step_meta = ctx.graph().socket_meta(step_socket);
    let step_is_immediate = ctx.graph().num_connections(step_socket) == 0;
    let step_positive = if force_floats {
        step_meta.default.as_float() > 0.0
    } else {
        step_meta.default.as_int() > 0
    };

    // Loop head: copy the stop value, then the index.
    let mut head = BCode::ins(Opcode::GetFI);
    head.set_fimm(1, -1);
    let mut get_index = BCode::ins(Opcode::GetFI);
    get_index.set_fimm(1, -1);
    head.append(get_index);

    // The comparison must push 1 to leave the loop and 0 to stay in it.
    if step_is_immediate {
        let cmp_op = match (force_floats, step_positive) {
            (true, true) => Opcode::CmtF,
            (true, false) => Opcode::CltF,
            (false, true) => Opcode::Cmt,
            (false, false) => Opcode::Clt,
        };
        head.append(BCode::ins(cmp_op));
    } else {
        // Decide the comparator at run time from the step's sign.
        let mut select = BCode::ins(Opcode::PushF);
        select.set_fimm(1, 0);

        let mut push_step = BCode::ins(Opcode::GetFI);
        push_step.set_fimm(1, -5);
        select.append(push_step);

        let more_than_zero = if force_floats {
            Opcode::CmtF
        } else {
            Opcode::Cmt
        };
        select.append(BCode::ins(more_than_zero));

        let step_pos = BCode::ins(if force_floats { Opcode::CmtF } else { Opcode::Cmt });
        let mut step_neg = BCode::ins(if force_floats { Opcode::CltF } else { Opcode::Clt });

        let mut jump_over_pos = BCode::ins(Opcode::JrFI);
        jump_over_pos.set_fimm(1, (Opcode::JrFI.ins_size() + step_pos.size()) as DInt);
        step_neg.append(jump_over_pos);

        let mut jump_to_pos = BCode::ins(Opcode::JrConFI);
        jump_to_pos.set_fimm(1, (Opcode::JrConFI.ins_size() + step_neg.size()) as DInt);
        select.append(jump_to_pos);

        select.append(step_neg);
        select.append(step_pos);

        head.append(select);
    }

    // The exit jump; its amount is known once the body is assembled.
    let mut jump_over_loop = BCode::ins(Opcode::JrConFI);

    // The body.
    let stack_top_before_loop = ctx.stack_top;
    let mut body = BCode::new();
    if let Some(wire_index) = ctx.graph().wire_find_first(loop_socket) {
        let wire = ctx.graph().wires[wire_index];
        body = generate_execution_node(ctx, wire.to.node, false);

        if ctx.debug {
            let mut marked = BCode::new();
            marked.mark_exec_wire(0, wire);
            marked.append(body);
            body = marked;
        }
    }

    // Pop back to the index value.
    let num_pop = (ctx.stack_top - stack_top_before_loop).max(0);
    let mut pop = BCode::ins(Opcode::PopF);
    pop.set_fimm(1, num_pop);
    body.append(pop);
    ctx.stack_top = stack_top_before_loop;

    // Step the index.
    if force_floats {
        let mut get_step = BCode::ins(Opcode::GetFI);
        get_step.set_fimm(1, -2);
        body.append(get_step);
        body.append(BCode::ins(Opcode::AddF));
    } else if step_is_immediate {
        let mut add = BCode::ins(Opcode::AddFI);
        add.set_fimm(1, step_meta.default.as_int());
        body.append(add);
    } else {
        let mut get_step = BCode::ins(Opcode::GetFI);
        get_step.set_fimm(1, -2);
        body.append(get_step);
        body.append(BCode::ins(Opcode::Add));
    }

    // Loop back to re-check the condition. Relative jumps are relative to
    // the jump instruction's own start.
    let loop_back = -((head.size() + jump_over_loop.size() + body.size()) as DInt);
    let mut jump_back = BCode::ins(Opcode::JrFI);
    jump_back.set_fimm(1, loop_back);
    body.append(jump_back);

    // Now the exit jump amount is known.
    let exit_amount = (jump_over_loop.size() + body.size()) as DInt;
    jump_over_loop.set_fimm(1, exit_amount);

    head.append(jump_over_loop);
    head.append(body);
    head
}

/// IfThen and IfThenElse.
///
/// Layout: `[JRCONFI][else][JR][then]`; each branch ends with pops that
/// restore the stack height from before the branch ran.
fn generate_if(ctx: &mut BuildContext, node_index: usize, has_else: bool) -> BCode {
    // The branch jump pops the condition before either branch runs.
    ctx.stack_top -= 1;
    let init_stack_top = ctx.stack_top;

    let mut then_branch = BCode::new();
    if let Some(wire_index) = ctx.graph().wire_find_first(NodeSocket::new(node_index, 2)) {
        let wire = ctx.graph().wires[wire_index];
        then_branch = generate_execution_node(ctx, wire.to.node, false);

        if ctx.debug {
            let mut marked = BCode::new();
            marked.mark_exec_wire(0, wire);
            marked.append(then_branch);
            then_branch = marked;
        }
    }
    let then_diff = (ctx.stack_top - init_stack_top).max(0);
    ctx.stack_top = init_stack_top;

    let mut else_branch = BCode::new();
    let mut else_diff = 0;
    if has_else {
        if let Some(wire_index) = ctx.graph().wire_find_first(NodeSocket::new(node_index, 3)) {
            let wire = ctx.graph().wires[wire_index];
            else_branch = generate_execution_node(ctx, wire.to.node, false);

            if ctx.debug {
                let mut marked = BCode::new();
                marked.mark_exec_wire(0, wire);
                marked.append(else_branch);
                else_branch = marked;
            }
        }
        else_diff = (ctx.stack_top - init_stack_top).max(0);
        ctx.stack_top = init_stack_top;
    }

    // Both branches pop whatever they pushed.
    let mut pop_then = BCode::ins(Opcode::PopF);
    pop_then.set_fimm(1, then_diff);
    then_branch.append(pop_then);

    if has_else {
        let mut pop_else = BCode::ins(Opcode::PopF);
        pop_else.set_fimm(1, else_diff);
        else_branch.append(pop_else);
    }

    // If the then branch is empty there is nothing to jump over.
    let skip_end_jump = then_branch.size() == Opcode::PopF.ins_size() && then_diff == 0;

    let mut jump_to_then = (Opcode::JrConFI.ins_size() + else_branch.size()) as DInt;
    if !skip_end_jump {
        jump_to_then += Opcode::JrFI.ins_size() as DInt;
    }

    let mut out = BCode::ins(Opcode::JrConFI);
    out.set_fimm(1, jump_to_then);
    out.append(else_branch);

    if !skip_end_jump {
        let jump_to_end = (Opcode::JrFI.ins_size() + then_branch.size()) as DInt;
        let mut jump = BCode::ins(Opcode::JrFI);
        jump.set_fimm(1, jump_to_end);
        out.append(jump);
    }

    out.append(then_branch);
    out
}

/// Print: the value is already at the top; push the newline flag and the
/// type tag and invoke the print syscall.
fn generate_print(ctx: &mut BuildContext, node_index: usize) -> BCode {
    let meta = ctx.graph().socket_meta(NodeSocket::new(node_index, 1));

    let type_arg: DInt = if meta.typ == types::TypeSet::from(DType::Float) {
        1
    } else if meta.typ == types::TypeSet::from(DType::String) {
        2
    } else if meta.typ == types::TypeSet::from(DType::Bool) {
        3
    } else {
        0
    };

    let mut out = BCode::ins(Opcode::PushF);
    out.set_fimm(1, 1); // trailing newline

    let mut tag = BCode::ins(Opcode::PushF);
    tag.set_fimm(1, type_arg);
    out.append(tag);

    let mut syscall = BCode::ins(Opcode::Syscall);
    syscall.set_byte(1, Syscall::Print as i8);
    out.append(syscall);

    out
}

/// Set: produce the target variable's address (via a relocation) and store.
fn generate_set(ctx: &mut BuildContext, node_index: usize) -> BCode {
    let name_def = ctx.graph().nodes[node_index]
        .name_definition
        .clone()
        .expect("set node resolves to its variable");
    let var_meta = ctx.variable_meta(&name_def);
    let var_name = var_meta.name.clone();
    let is_bool = var_meta.typ == types::TypeSet::from(DType::Bool);
    let is_string = var_meta.typ == types::TypeSet::from(DType::String);

    let store = if is_bool {
        Opcode::SetAdrB
    } else {
        Opcode::SetAdr
    };
    let kind = if is_string {
        LinkKind::VariablePointer
    } else {
        LinkKind::Variable
    };

    // The address is linked later.
    let mut out = BCode::ins(Opcode::PushF);
    out.append(BCode::ins(store));
    ctx.stack_top -= 1;

    ctx.add_link(Some(&mut out), 0, LinkMeta::new(kind, var_name));
    out
}

/// While: re-evaluate the condition on each iteration; its single stack
/// slot is accounted for exactly once regardless of the loop count.
fn generate_while(
    ctx: &mut BuildContext,
    node_index: usize,
    inputs_size: usize,
    stack_top_before: DInt,
    stack_after_inputs: DInt,
) -> BCode {
    let cond_socket = NodeSocket::new(node_index, 1);
    let cond_meta = ctx.graph().socket_meta(cond_socket);

    // While over a false literal never runs.
    if ctx.graph().num_connections(cond_socket) == 0 && cond_meta.default.as_int() == 0 {
        return BCode::new();
    }

    let mut body = BCode::new();
    if let Some(wire_index) = ctx.graph().wire_find_first(NodeSocket::new(node_index, 2)) {
        let wire = ctx.graph().wires[wire_index];

        // The branch jump pops the condition before the body runs.
        ctx.stack_top -= 1;
        body = generate_execution_node(ctx, wire.to.node, false);

        if ctx.debug {
            let mut marked = BCode::new();
            marked.mark_exec_wire(0, wire);
            marked.append(body);
            body = marked;
        }
    }

    // Pop the body's leftovers and jump back far enough to recompute the
    // condition.
    let num_pop = (ctx.stack_top - stack_top_before).max(0);
    let mut pop = BCode::ins(Opcode::PopF);
    pop.set_fimm(1, num_pop);
    body.append(pop);

    let loop_back = -((inputs_size
        + Opcode::Not.ins_size()
        + Opcode::JrConFI.ins_size()
        + body.size()) as DInt);
    let mut jump_back = BCode::ins(Opcode::JrFI);
    jump_back.set_fimm(1, loop_back);
    body.append(jump_back);

    // Skip the body when the condition is false.
    let mut out = BCode::ins(Opcode::Not);
    let mut jump_over = BCode::ins(Opcode::JrConFI);
    jump_over.set_fimm(1, (Opcode::JrConFI.ins_size() + body.size()) as DInt);
    out.append(jump_over);
    out.append(body);

    // However many times the loop ran, exactly one condition slot was
    // consumed.
    ctx.stack_top = stack_after_inputs - 1;
    out
}

/// Generate bytecode for an execution node and, recursively, the chain
/// hanging off its last execution output.
pub fn generate_execution_node(
    ctx: &mut BuildContext,
    node_index: usize,
    ret_at_end: bool,
) -> BCode {
    let def_name = ctx.graph().nodes[node_index].definition.name.clone();
    trace!(node = node_index, name = %def_name, "generating execution node");

    let core = CoreOp::find_name(&def_name);
    let stack_top_before = ctx.stack_top;

    let mut pop_after = true;
    let mut added_return = false;

    let mut out;
    match core {
        Some(op) => {
            // For needs float inputs when its index output is a float.
            let force_floats = op == CoreOp::For
                && ctx.graph().socket_meta(NodeSocket::new(node_index, 5)).typ
                    == types::TypeSet::from(DType::Float);

            out = push_node_inputs(ctx, node_index, false, false, force_floats);
            let inputs_size = out.size();
            let stack_after_inputs = ctx.stack_top;

            let mut action = match op {
                CoreOp::For => generate_for(ctx, node_index, force_floats),
                CoreOp::IfThen => generate_if(ctx, node_index, false),
                CoreOp::IfThenElse => generate_if(ctx, node_index, true),
                CoreOp::Print => generate_print(ctx, node_index),
                CoreOp::Set => generate_set(ctx, node_index),
                CoreOp::While => generate_while(
                    ctx,
                    node_index,
                    inputs_size,
                    stack_top_before,
                    stack_after_inputs,
                ),
                _ => BCode::new(),
            };

            if ctx.debug {
                let mut marked = BCode::new();
                marked.mark_node(0, node_index);
                marked.append(action);
                action = marked;
            }

            out.append(action);
        }
        None if def_name == "Return" => {
            out = generate_return(ctx, node_index);
            added_return = true;
        }
        None => {
            // A subroutine call; its return values stay on the stack.
            out = generate_call(ctx, node_index);
            pop_after = false;
        }
    }

    // The inputs have served their purpose; pop back to where the stack was
    // before this node.
    if pop_after {
        let num_pop = (ctx.stack_top - stack_top_before).max(0);
        let mut pop = BCode::ins(Opcode::PopF);
        pop.set_fimm(1, num_pop);
        out.append(pop);
        ctx.stack_top = stack_top_before;
    }

    // Chain to whatever hangs off the last execution output socket.
    let node = &ctx.graph().nodes[node_index];
    let num_inputs = node.num_inputs();
    let num_sockets = node.num_sockets();

    let mut last_exec_socket = None;
    for socket_index in num_inputs..num_sockets {
        let socket = NodeSocket::new(node_index, socket_index);
        let meta = ctx.graph().socket_meta(socket);
        if meta.typ == types::TypeSet::from(DType::Execution) {
            last_exec_socket = Some(socket);
        }
    }

    let mut has_next = false;
    if let Some(socket) = last_exec_socket {
        if let Some(wire_index) = ctx.graph().wire_find_first(socket) {
            let wire = ctx.graph().wires[wire_index];
            has_next = true;

            let mut next = generate_execution_node(ctx, wire.to.node, ret_at_end);
            if ctx.debug {
                let mut marked = BCode::new();
                marked.mark_exec_wire(0, wire);
                marked.append(next);
                next = marked;
            }
            out.append(next);
        }
    }

    if !(has_next || added_return) && ret_at_end {
        out.append(BCode::ins(Opcode::Ret));
    }

    out
}

/// Generate the bytecode of the Start stream.
///
/// The first instruction is a safety `RET` so a preceding function cannot
/// fall through into it.
fn generate_start(ctx: &mut BuildContext, start_index: usize) -> BCode {
    let mut out = BCode::ins(Opcode::Ret);

    let socket = NodeSocket::new(start_index, 0);
    if ctx.graph().nodes[start_index].num_outputs() == 1 {
        if let Some(wire_index) = ctx.graph().wire_find_first(socket) {
            let wire = ctx.graph().wires[wire_index];
            debug!("generating bytecode for the Start stream");

            let mut exe = generate_execution_node(ctx, wire.to.node, true);
            if ctx.debug {
                let mut marked = BCode::new();
                marked.mark_exec_wire(0, wire);
                marked.append(exe);
                exe = marked;
            }
            out.append(exe);
        }
    }

    out
}

/// Generate the bytecode of one user function, prefixed by a safety `RET`.
fn generate_function(ctx: &mut BuildContext, func_index: usize) -> BCode {
    let function = &ctx.sheet.functions[func_index];
    let definition = function.definition.clone();
    let is_subroutine = function.is_subroutine();
    let define_node = function.define_node;
    let num_defines = function.num_define_nodes;
    let return_node = function.last_return_node;
    let num_returns = function.num_return_nodes;

    let mut out = BCode::ins(Opcode::Ret);

    // The frame starts with the arguments already pushed.
    let num_args = definition.num_inputs() - usize::from(is_subroutine);
    ctx.stack_top = num_args as DInt;

    if is_subroutine {
        if num_defines == 1 {
            debug!(name = %definition.name, "generating bytecode for subroutine");

            // Walk the execution chain hanging off the Define node.
            let socket = NodeSocket::new(define_node.expect("define node exists"), 1);
            if let Some(wire_index) = ctx.graph().wire_find_first(socket) {
                let wire = ctx.graph().wires[wire_index];
                let mut exe = generate_execution_node(ctx, wire.to.node, true);
                if ctx.debug {
                    let mut marked = BCode::new();
                    marked.mark_exec_wire(0, wire);
                    marked.append(exe);
                    exe = marked;
                }
                out.append(exe);
            }
        }
    } else if num_returns == 1 {
        debug!(name = %definition.name, "generating bytecode for function");

        // A pure function's body is its Return node's input expression.
        let code = generate_return(ctx, return_node.expect("return node exists"));
        out.append(code);
    }

    out
}

/// Lower a semantically-analysed sheet to bytecode.
///
/// Lays the variables out in the data section, emits each user function,
/// then the Start stream, recording the entry offset. With `debug`, the
/// instruction-to-graph tables are filled in as well.
pub fn compile(sheet: &mut Sheet, debug_mode: bool) {
    debug!(sheet = %sheet.file_name(), "generating bytecode");

    let (text, links, ins_links, data, debug_info, main) = {
        let mut ctx = BuildContext::new(sheet, debug_mode);
        let mut text = BCode::new();

        // Variables first, so every getter and setter can link to them.
        for variable in &sheet.variables {
            let kind = if variable.meta.typ == types::TypeSet::from(DType::String) {
                LinkKind::VariablePointer
            } else {
                LinkKind::Variable
            };
            let (index, _) = ctx
                .links
                .intern(LinkMeta::new(kind, variable.meta.name.clone()));
            let meta = variable.meta.clone();
            ctx.alloc_variable(&meta, index);
        }

        // User functions, each recording its entry offset in its link
        // record (skipping the guard RET).
        for func_index in 0..sheet.functions.len() {
            let code = generate_function(&mut ctx, func_index);

            let name = sheet.functions[func_index].definition.name.clone();
            let (meta_index, _) = ctx.links.intern(LinkMeta::new(LinkKind::Function, name));
            ctx.links.list[meta_index].ptr = Some(text.size() + 1);

            text.append(code);
        }

        // The Start stream last; main points at its first real instruction.
        let mut main = None;
        if let Some(start_index) = sheet.start_node {
            ctx.stack_top = -1;
            let mut start = generate_start(&mut ctx, start_index);
            main = Some(text.size() + 1);

            // If Start leads nowhere, the stream is just the guard RET;
            // add another one so main has something to run.
            if start.size() == 1 {
                start.append(BCode::ins(Opcode::Ret));
            }

            text.append(start);
        }

        (
            text.code,
            ctx.links.list,
            text.links,
            ctx.data,
            text.debug,
            main,
        )
    };

    sheet.text = text;
    sheet.links = links;
    sheet.ins_links = ins_links;
    sheet.data = data;
    sheet.main = main;
    sheet.debug_info = debug_mode.then_some(debug_info);
    sheet.is_compiled = true;
}
