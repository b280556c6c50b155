//! Debugging sessions.
//!
//! A session wraps a single-stepping VM around a sheet compiled in debug
//! mode (its text is unoptimized and carries instruction-to-graph tables).
//! Before each instruction the session consults the tables and fires the
//! instrumentation callbacks; "continue" runs until a breakpoint fires or
//! the VM halts.

use dsc_gen::LinkError;
use dsc_sem::{DebugInfo, Sheet, Wire};
use dsc_util::FxHashSet;
use dsc_vm::{NativeRegistry, Opcode, Program, Value, Vm};
use std::io::Write;
use std::path::Path;

/// The instrumentation callbacks a host can hook.
#[derive(Default)]
pub struct DebugHooks<'a> {
    pub on_node_activated: Option<Box<dyn FnMut(usize) + 'a>>,
    pub on_execution_wire: Option<Box<dyn FnMut(Wire) + 'a>>,
    pub on_wire_value: Option<Box<dyn FnMut(Wire, Value) + 'a>>,
    pub on_call: Option<Box<dyn FnMut(usize) + 'a>>,
    pub on_return: Option<Box<dyn FnMut(usize) + 'a>>,
    pub on_node_breakpoint: Option<Box<dyn FnMut(usize) + 'a>>,
    pub on_wire_breakpoint: Option<Box<dyn FnMut(Wire) + 'a>>,
}

/// A debugging session over one sheet tree.
pub struct DebugSession<'a> {
    sheet: &'a Sheet,
    program: Program,
    vm: Vm,
    started: bool,
    node_breakpoints: FxHashSet<usize>,
    wire_breakpoints: Vec<Wire>,
    pub hooks: DebugHooks<'a>,
}

impl<'a> DebugSession<'a> {
    /// Create a session in its starting state. The sheet must have been
    /// compiled in debug mode.
    pub fn new(
        sheet: &'a Sheet,
        natives: &NativeRegistry,
        output: Box<dyn Write>,
    ) -> Result<Self, LinkError> {
        let program = dsc_gen::link(sheet, natives)?;
        Ok(DebugSession {
            sheet,
            program,
            vm: Vm::with_output(output),
            started: false,
            node_breakpoints: FxHashSet::default(),
            wire_breakpoints: Vec::new(),
            hooks: DebugHooks::default(),
        })
    }

    pub fn add_node_breakpoint(&mut self, node: usize) {
        self.node_breakpoints.insert(node);
    }

    pub fn add_wire_breakpoint(&mut self, wire: Wire) {
        self.wire_breakpoints.push(wire);
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn is_halted(&self) -> bool {
        self.started && self.vm.is_halted()
    }

    /// The sheet in the session's tree whose text contains the program
    /// counter, along with the counter's sheet-local offset.
    fn locate(&self, pc: usize) -> Option<(&'a Sheet, usize)> {
        let layout = self.program.layout_at_text(pc)?;
        let sheet = find_sheet(self.sheet, &layout.path)?;
        Some((sheet, pc - layout.text_base))
    }

    /// Execute one instruction, firing callbacks first. Returns whether a
    /// breakpoint fired.
    pub fn step(&mut self) -> bool {
        if !self.started {
            self.vm.begin(self.program.main);
            self.started = true;
        }

        if self.vm.is_halted() {
            return false;
        }

        let pc = self.vm.pc();
        let mut hit_breakpoint = false;

        if let Some((sheet, offset)) = self.locate(pc) {
            if let Some(info) = &sheet.debug_info {
                hit_breakpoint = self.fire_info_hooks(info, offset);
            }
        }

        // Calls and returns are recognised from the instruction itself.
        match self.program.text.get(pc).copied().and_then(Opcode::from_byte) {
            Some(
                Opcode::Call
                | Opcode::CallI
                | Opcode::CallR
                | Opcode::CallRB
                | Opcode::CallRH
                | Opcode::CallRF
                | Opcode::CallC
                | Opcode::CallCI,
            ) => {
                if let Some(hook) = self.hooks.on_call.as_mut() {
                    hook(pc);
                }
            }
            Some(Opcode::Ret | Opcode::Retn) => {
                if let Some(hook) = self.hooks.on_return.as_mut() {
                    hook(pc);
                }
            }
            _ => {}
        }

        self.vm.step(&mut self.program);
        hit_breakpoint
    }

    fn fire_info_hooks(&mut self, info: &DebugInfo, offset: usize) -> bool {
        let mut hit_breakpoint = false;

        if let Some(value_info) = info.value_at(offset) {
            let value = self.vm.get(value_info.stack_index);
            if let Some(hook) = self.hooks.on_wire_value.as_mut() {
                hook(value_info.wire, value);
            }
        }

        if let Some(wire) = info.exec_wire_at(offset) {
            if let Some(hook) = self.hooks.on_execution_wire.as_mut() {
                hook(wire);
            }
            if self.wire_breakpoints.contains(&wire) {
                if let Some(hook) = self.hooks.on_wire_breakpoint.as_mut() {
                    hook(wire);
                }
                hit_breakpoint = true;
            }
        }

        if let Some(node) = info.node_at(offset) {
            if let Some(hook) = self.hooks.on_node_activated.as_mut() {
                hook(node);
            }
            if self.node_breakpoints.contains(&node) {
                if let Some(hook) = self.hooks.on_node_breakpoint.as_mut() {
                    hook(node);
                }
                hit_breakpoint = true;
            }
        }

        hit_breakpoint
    }

    /// Run until a breakpoint fires or the VM halts.
    ///
    /// The first instruction is always executed, so continuing from a
    /// breakpoint makes progress.
    pub fn continue_run(&mut self) {
        self.step();
        loop {
            if self.vm.is_halted() {
                break;
            }
            if self.step() {
                break;
            }
        }
    }
}

fn find_sheet<'s>(sheet: &'s Sheet, path: &Path) -> Option<&'s Sheet> {
    if sheet.file_path == path {
        return Some(sheet);
    }
    sheet.includes.iter().find_map(|inc| find_sheet(inc, path))
}
