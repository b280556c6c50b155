//! Debug information mapping instructions back to graph elements.
//!
//! When a sheet is compiled in debug mode, the code generator records which
//! node, execution wire or value-carrying wire each instruction offset came
//! from. The debugger consults these tables before executing each
//! instruction.

use crate::graph::Wire;
use dsc_util::DInt;

/// Marks the instruction at which a node "starts" in bytecode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InsNodeInfo {
    pub ins: usize,
    pub node: usize,
}

/// Marks the instruction at which an execution wire is followed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InsExecInfo {
    pub ins: usize,
    pub wire: Wire,
}

/// Marks the instruction after which a value has crossed a wire. The value
/// sits on the VM stack at `stack_index` (top-relative, 0 = top).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InsValueInfo {
    pub ins: usize,
    pub wire: Wire,
    pub stack_index: DInt,
}

/// A collection of info used for debugging one sheet.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DebugInfo {
    pub node_info: Vec<InsNodeInfo>,
    pub exec_info: Vec<InsExecInfo>,
    pub value_info: Vec<InsValueInfo>,
}

impl DebugInfo {
    /// The node activated at an instruction offset, if any.
    pub fn node_at(&self, ins: usize) -> Option<usize> {
        self.node_info
            .iter()
            .find(|info| info.ins == ins)
            .map(|info| info.node)
    }

    /// The execution wire followed at an instruction offset, if any.
    pub fn exec_wire_at(&self, ins: usize) -> Option<Wire> {
        self.exec_info
            .iter()
            .find(|info| info.ins == ins)
            .map(|info| info.wire)
    }

    /// The value transfer recorded at an instruction offset, if any.
    pub fn value_at(&self, ins: usize) -> Option<InsValueInfo> {
        self.value_info.iter().find(|info| info.ins == ins).copied()
    }

    /// Shift every recorded offset by `base`, used when a fragment is
    /// appended to the text section.
    pub fn rebase(&mut self, base: usize) {
        for info in &mut self.node_info {
            info.ins += base;
        }
        for info in &mut self.exec_info {
            info.ins += base;
        }
        for info in &mut self.value_info {
            info.ins += base;
        }
    }

    /// Append another table, assuming it has already been rebased.
    pub fn append(&mut self, other: DebugInfo) {
        self.node_info.extend(other.node_info);
        self.exec_info.extend(other.exec_info);
        self.value_info.extend(other.value_info);
    }
}
