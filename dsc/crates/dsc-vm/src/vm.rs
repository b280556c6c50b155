//! The virtual machine.
//!
//! A register-less stack machine. The program counter walks the image's text
//! section; each instruction sets `inc_pc` to its own size so the dispatcher
//! knows how far to advance, and jumps, calls and returns override it to
//! zero after setting the counter themselves.
//!
//! Stack indexing convention, shared with the native-function surface: a
//! positive index is relative to the current frame base, a non-positive
//! index is relative to the top (0 = top, -1 = one below).

use crate::opcode::{Opcode, Syscall, BIMM_SIZE, FIMM_SIZE, HIMM_SIZE};
use crate::program::Program;
use crate::value::{StrValue, Value};
use dsc_util::{DFloat, DInt, DUInt};
use std::io::Write;

/// The minimum, and starting, capacity of the VM's stack.
const STACK_SIZE_MIN: usize = 16;

/// The virtual machine state.
pub struct Vm {
    pc: usize,
    /// How many bytes to advance after the current instruction. Jumps,
    /// calls and returns set this to zero.
    inc_pc: usize,
    stack: Vec<Value>,
    /// Index of the current frame's return-address cell; -1 in the base
    /// frame.
    frame_ptr: isize,
    halted: bool,
    runtime_error: bool,
    output: Box<dyn Write>,
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Vm {
            pc: 0,
            inc_pc: 0,
            stack: Vec::with_capacity(STACK_SIZE_MIN),
            frame_ptr: -1,
            halted: false,
            runtime_error: false,
            output: Box::new(std::io::stdout()),
        }
    }

    /// A VM whose syscall output goes to the given writer instead of
    /// standard output.
    pub fn with_output(output: Box<dyn Write>) -> Self {
        Vm {
            output,
            ..Vm::new()
        }
    }

    /// Reset to the starting state, keeping the output handle.
    pub fn reset(&mut self) {
        self.pc = 0;
        self.inc_pc = 0;
        self.stack.clear();
        self.stack.shrink_to(STACK_SIZE_MIN);
        self.frame_ptr = -1;
        self.halted = false;
        self.runtime_error = false;
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Stop the VM between instructions.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn had_runtime_error(&self) -> bool {
        self.runtime_error
    }

    /// The number of entries on the stack.
    pub fn top(&self) -> usize {
        self.stack.len()
    }

    /// The number of entries in the current stack frame.
    pub fn frame(&self) -> usize {
        (self.stack.len() as isize - (self.frame_ptr + 1)) as usize
    }

    fn slot(&self, index: DInt) -> Option<usize> {
        let slot = if index > 0 {
            self.frame_ptr + index as isize
        } else {
            self.stack.len() as isize - 1 + index as isize
        };
        if slot >= 0 && (slot as usize) < self.stack.len() {
            Some(slot as usize)
        } else {
            None
        }
    }

    /// Get the entry at a stack index.
    pub fn get(&self, index: DInt) -> Value {
        self.slot(index)
            .map(|s| self.stack[s].clone())
            .unwrap_or_default()
    }

    pub fn get_int(&self, index: DInt) -> DInt {
        self.get(index).as_int()
    }

    pub fn get_float(&self, index: DInt) -> DFloat {
        self.get(index).as_float()
    }

    /// Overwrite the entry at a stack index, releasing whatever payload the
    /// old entry owned.
    pub fn set(&mut self, index: DInt, value: Value) {
        if let Some(slot) = self.slot(index) {
            self.stack[slot] = value;
        }
    }

    /// Insert an entry so that it sits at the given index afterwards.
    pub fn insert(&mut self, index: DInt, value: Value) {
        let at = if index > 0 {
            self.frame_ptr + index as isize
        } else {
            self.stack.len() as isize + index as isize
        };
        let at = at.clamp(0, self.stack.len() as isize) as usize;
        self.grow_for(1);
        self.stack.insert(at, value);
    }

    /// Remove the entry at a stack index.
    pub fn remove(&mut self, index: DInt) {
        if let Some(slot) = self.slot(index) {
            self.stack.remove(slot);
            self.maybe_shrink();
        }
    }

    /// Remove `len` entries starting at a stack index.
    pub fn remove_len(&mut self, index: DInt, len: usize) {
        if let Some(slot) = self.slot(index) {
            let end = (slot + len).min(self.stack.len());
            self.stack.drain(slot..end);
            self.maybe_shrink();
        }
    }

    pub fn push(&mut self, value: Value) {
        self.grow_for(1);
        self.stack.push(value);
    }

    pub fn push_int(&mut self, value: DInt) {
        self.push(Value::Int(value));
    }

    pub fn push_float(&mut self, value: DFloat) {
        self.push(Value::Float(value));
    }

    /// Push a string the stack entry will own.
    pub fn push_string(&mut self, value: String) {
        self.push(Value::Str(StrValue::Owned(value)));
    }

    /// Push zero `n` times.
    pub fn pushn(&mut self, n: usize) {
        self.grow_for(n);
        for _ in 0..n {
            self.stack.push(Value::Int(0));
        }
    }

    pub fn pop(&mut self) -> Value {
        let value = self.stack.pop().unwrap_or_default();
        self.maybe_shrink();
        value
    }

    pub fn popn(&mut self, n: usize) {
        let keep = self.stack.len().saturating_sub(n);
        self.stack.truncate(keep);
        self.maybe_shrink();
    }

    /// Grow the stack's capacity by the scale factor once it is exhausted.
    fn grow_for(&mut self, extra: usize) {
        let needed = self.stack.len() + extra;
        if needed > self.stack.capacity() {
            let scaled = self.stack.capacity() * 3 / 2;
            let target = scaled.max(needed).max(STACK_SIZE_MIN);
            self.stack.reserve_exact(target - self.stack.len());
        }
    }

    /// Shrink the stack's capacity once usage drops below a quarter, never
    /// below the minimum.
    fn maybe_shrink(&mut self) {
        let capacity = self.stack.capacity();
        if capacity > STACK_SIZE_MIN && self.stack.len() < capacity / 4 {
            let target = (capacity / 2).max(STACK_SIZE_MIN);
            self.stack.shrink_to(target);
        }
    }

    /// Print a runtime error identifying the program counter, and halt.
    pub fn runtime_error(&mut self, message: &str) {
        let _ = writeln!(self.output, "Fatal: ({:#x}) {}", self.pc, message);
        self.halted = true;
        self.runtime_error = true;
    }

    /// Point the program counter at `start` and clear the halted flag,
    /// ready for stepping.
    pub fn begin(&mut self, start: usize) {
        self.pc = start;
        self.halted = false;
    }

    /// Run from `start` until the VM halts. Returns whether it ran without
    /// any runtime errors.
    pub fn run(&mut self, program: &mut Program, start: usize) -> bool {
        self.begin(start);

        while !self.halted {
            self.step(program);
        }

        !self.runtime_error
    }

    fn read_imm(&self, program: &Program, offset: usize, size: usize) -> DInt {
        let bytes = match program.text.get(self.pc + offset..self.pc + offset + size) {
            Some(bytes) => bytes,
            None => return 0,
        };
        let mut acc: u64 = 0;
        for (i, byte) in bytes.iter().enumerate() {
            acc |= (*byte as u64) << (8 * i);
        }
        let shift = 64 - size * 8;
        (((acc << shift) as i64) >> shift) as DInt
    }

    fn bimm(&self, program: &Program, offset: usize) -> DInt {
        self.read_imm(program, offset, BIMM_SIZE)
    }

    fn himm(&self, program: &Program, offset: usize) -> DInt {
        self.read_imm(program, offset, HIMM_SIZE)
    }

    fn fimm(&self, program: &Program, offset: usize) -> DInt {
        self.read_imm(program, offset, FIMM_SIZE)
    }

    /// Pop two operands, apply an integer operation, push the result.
    /// The top of the stack is the left operand.
    fn op_2_1(&mut self, f: impl FnOnce(DInt, DInt) -> DInt) {
        let value = f(self.get_int(0), self.get_int(-1));
        self.set(-1, Value::Int(value));
        self.popn(1);
    }

    fn op_2_1_float(&mut self, f: impl FnOnce(DFloat, DFloat) -> DFloat) {
        let value = f(self.get_float(0), self.get_float(-1));
        self.set(-1, Value::Float(value));
        self.popn(1);
    }

    /// Float comparison: two float operands, one integer result.
    fn op_2_1_cmp(&mut self, f: impl FnOnce(DFloat, DFloat) -> bool) {
        let value = f(self.get_float(0), self.get_float(-1)) as DInt;
        self.set(-1, Value::Int(value));
        self.popn(1);
    }

    /// Apply an integer operation between the top of the stack and an
    /// immediate, in place.
    fn op_imm(&mut self, imm: DInt, f: impl FnOnce(DInt, DInt) -> DInt) {
        let value = f(self.get_int(0), imm);
        self.set(0, Value::Int(value));
    }

    /// The common part of every call opcode: insert the caller's frame base
    /// and the return address beneath the arguments, and point the frame
    /// pointer at the return-address cell.
    fn call(&mut self, new_pc: usize, num_args: usize, ret_addr: usize) {
        let insert_at = self.stack.len().saturating_sub(num_args);
        self.grow_for(2);
        self.stack
            .insert(insert_at, Value::Int(self.frame_ptr as DInt));
        self.stack
            .insert(insert_at + 1, Value::Int(ret_addr as DInt));
        self.frame_ptr = (insert_at + 1) as isize;
        self.pc = new_pc;
        self.inc_pc = 0;
    }

    fn call_native(&mut self, program: &mut Program, index: usize, num_args: usize) {
        let func = match program.natives.get(index) {
            Some(native) => native.func,
            None => {
                self.runtime_error(&format!("unknown native function {}", index));
                return;
            }
        };

        // Point the frame at the arguments for the duration of the call.
        let saved_frame = self.frame_ptr;
        self.frame_ptr = self.stack.len() as isize - num_args as isize - 1;
        func(self, program);
        self.frame_ptr = saved_frame;
    }

    fn rel_target(&self, rel: DInt) -> usize {
        (self.pc as i64 + rel as i64) as usize
    }

    /// The string an argument denotes: an owned payload, or an address into
    /// the program image.
    fn str_arg(&self, program: &Program, index: DInt) -> String {
        match self.get(index) {
            Value::Str(StrValue::Owned(s)) => s,
            value => program
                .string_at(value.as_int() as DUInt)
                .unwrap_or_default()
                .to_string(),
        }
    }

    /// A value popped for storage, as a word. Owned strings move onto the
    /// program's heap, transferring their ownership to the image.
    fn value_to_word(&mut self, program: &mut Program, value: Value) -> DInt {
        match value {
            Value::Str(StrValue::Owned(s)) => program.alloc_string(s) as DInt,
            value => value.as_int(),
        }
    }

    /// Execute the single instruction at the program counter, then advance.
    pub fn step(&mut self, program: &mut Program) {
        let byte = match program.text.get(self.pc) {
            Some(byte) => *byte,
            None => {
                self.runtime_error("program counter ran off the end of the text section");
                return;
            }
        };

        let opcode = match Opcode::from_byte(byte) {
            Some(opcode) => opcode,
            None => {
                self.runtime_error(&format!("unknown opcode {}", byte));
                return;
            }
        };

        self.inc_pc = opcode.ins_size();
        self.exec(program, opcode);

        self.pc += self.inc_pc;
    }

    fn exec(&mut self, program: &mut Program, opcode: Opcode) {
        use Opcode::*;

        match opcode {
            Ret | Retn => {
                // A return in the base frame halts the VM normally, leaving
                // the stack for the host to read.
                if self.frame_ptr < 0 {
                    self.halted = true;
                    self.inc_pc = 0;
                    return;
                }

                let num_returns = if opcode == Retn {
                    self.bimm(program, 1).max(0) as usize
                } else {
                    0
                };

                let fp = self.frame_ptr as usize;
                if fp == 0 || fp >= self.stack.len() {
                    self.runtime_error("corrupt stack frame");
                    return;
                }

                self.pc = self.stack[fp].as_int() as usize;
                self.frame_ptr = self.stack[fp - 1].as_int() as isize;

                let keep_from = self.stack.len().saturating_sub(num_returns).max(fp - 1);
                self.stack.drain(fp - 1..keep_from);
                self.maybe_shrink();

                self.inc_pc = 0;
            }

            Add => self.op_2_1(|a, b| a.wrapping_add(b)),
            AddF => self.op_2_1_float(|a, b| a + b),
            AddBI => {
                let imm = self.bimm(program, 1);
                self.op_imm(imm, |a, b| a.wrapping_add(b));
            }
            AddHI => {
                let imm = self.himm(program, 1);
                self.op_imm(imm, |a, b| a.wrapping_add(b));
            }
            AddFI => {
                let imm = self.fimm(program, 1);
                self.op_imm(imm, |a, b| a.wrapping_add(b));
            }

            And => self.op_2_1(|a, b| a & b),
            AndBI => {
                let imm = self.bimm(program, 1);
                self.op_imm(imm, |a, b| a & b);
            }
            AndHI => {
                let imm = self.himm(program, 1);
                self.op_imm(imm, |a, b| a & b);
            }
            AndFI => {
                let imm = self.fimm(program, 1);
                self.op_imm(imm, |a, b| a & b);
            }

            Call => {
                let target = self.pop().as_int() as usize;
                let num_args = self.bimm(program, 1).max(0) as usize;
                let ret_addr = self.pc + opcode.ins_size();
                self.call(target, num_args, ret_addr);
            }
            CallI => {
                let target = self.fimm(program, 1) as usize;
                let num_args = self.bimm(program, 1 + FIMM_SIZE).max(0) as usize;
                let ret_addr = self.pc + opcode.ins_size();
                self.call(target, num_args, ret_addr);
            }
            CallR => {
                let rel = self.pop().as_int();
                let num_args = self.bimm(program, 1).max(0) as usize;
                let ret_addr = self.pc + opcode.ins_size();
                self.call(self.rel_target(rel), num_args, ret_addr);
            }
            CallRB => {
                let rel = self.bimm(program, 1);
                let num_args = self.bimm(program, 1 + BIMM_SIZE).max(0) as usize;
                let ret_addr = self.pc + opcode.ins_size();
                self.call(self.rel_target(rel), num_args, ret_addr);
            }
            CallRH => {
                let rel = self.himm(program, 1);
                let num_args = self.bimm(program, 1 + HIMM_SIZE).max(0) as usize;
                let ret_addr = self.pc + opcode.ins_size();
                self.call(self.rel_target(rel), num_args, ret_addr);
            }
            CallRF => {
                let rel = self.fimm(program, 1);
                let num_args = self.bimm(program, 1 + FIMM_SIZE).max(0) as usize;
                let ret_addr = self.pc + opcode.ins_size();
                self.call(self.rel_target(rel), num_args, ret_addr);
            }

            CallC => {
                let index = self.pop().as_int().max(0) as usize;
                let num_args = self.bimm(program, 1).max(0) as usize;
                self.call_native(program, index, num_args);
            }
            CallCI => {
                let index = self.fimm(program, 1).max(0) as usize;
                let num_args = self.bimm(program, 1 + FIMM_SIZE).max(0) as usize;
                self.call_native(program, index, num_args);
            }

            Ceq => self.op_2_1(|a, b| (a == b) as DInt),
            CeqF => self.op_2_1_cmp(|a, b| a == b),
            Cleq => self.op_2_1(|a, b| (a <= b) as DInt),
            CleqF => self.op_2_1_cmp(|a, b| a <= b),
            Clt => self.op_2_1(|a, b| (a < b) as DInt),
            CltF => self.op_2_1_cmp(|a, b| a < b),
            Cmeq => self.op_2_1(|a, b| (a >= b) as DInt),
            CmeqF => self.op_2_1_cmp(|a, b| a >= b),
            Cmt => self.op_2_1(|a, b| (a > b) as DInt),
            CmtF => self.op_2_1_cmp(|a, b| a > b),

            CvtF => {
                let value = self.get_int(0) as DFloat;
                self.set(0, Value::Float(value));
            }
            CvtI => {
                let value = self.get_float(0) as DInt;
                self.set(0, Value::Int(value));
            }

            Deref => {
                let addr = self.get_int(0).max(0) as usize;
                let value = program.read_word(addr);
                self.set(0, Value::Int(value));
            }
            DerefI => {
                let addr = self.fimm(program, 1).max(0) as usize;
                self.push(Value::Int(program.read_word(addr)));
            }
            DerefB => {
                let addr = self.get_int(0).max(0) as usize;
                let value = program.read_byte(addr) as DInt;
                self.set(0, Value::Int(value));
            }
            DerefBI => {
                let addr = self.fimm(program, 1).max(0) as usize;
                self.push(Value::Int(program.read_byte(addr) as DInt));
            }

            Div => {
                if self.get_int(-1) == 0 {
                    self.runtime_error("Division by 0");
                } else {
                    self.op_2_1(|a, b| a.wrapping_div(b));
                }
            }
            DivF => {
                if self.get_float(-1) == 0.0 {
                    self.runtime_error("Division by 0");
                } else {
                    self.op_2_1_float(|a, b| a / b);
                }
            }
            DivBI => {
                let imm = self.bimm(program, 1);
                if imm == 0 {
                    self.runtime_error("Division by 0");
                } else {
                    self.op_imm(imm, |a, b| a.wrapping_div(b));
                }
            }
            DivHI => {
                let imm = self.himm(program, 1);
                if imm == 0 {
                    self.runtime_error("Division by 0");
                } else {
                    self.op_imm(imm, |a, b| a.wrapping_div(b));
                }
            }
            DivFI => {
                let imm = self.fimm(program, 1);
                if imm == 0 {
                    self.runtime_error("Division by 0");
                } else {
                    self.op_imm(imm, |a, b| a.wrapping_div(b));
                }
            }

            Get => {
                let index = self.pop().as_int();
                let value = self.get(index);
                self.push(value);
            }
            GetBI => {
                let index = self.bimm(program, 1);
                let value = self.get(index);
                self.push(value);
            }
            GetHI => {
                let index = self.himm(program, 1);
                let value = self.get(index);
                self.push(value);
            }
            GetFI => {
                let index = self.fimm(program, 1);
                let value = self.get(index);
                self.push(value);
            }

            Inv => {
                let value = !self.get_int(0);
                self.set(0, Value::Int(value));
            }

            J => {
                self.pc = self.pop().as_int().max(0) as usize;
                self.inc_pc = 0;
            }
            JI => {
                self.pc = self.fimm(program, 1).max(0) as usize;
                self.inc_pc = 0;
            }
            Jcon => {
                if self.get(0).is_truthy() {
                    self.pc = self.get_int(-1).max(0) as usize;
                    self.inc_pc = 0;
                }
                self.popn(2);
            }
            JconI => {
                if self.pop().is_truthy() {
                    self.pc = self.fimm(program, 1).max(0) as usize;
                    self.inc_pc = 0;
                }
            }
            Jr => {
                let rel = self.pop().as_int();
                self.pc = self.rel_target(rel);
                self.inc_pc = 0;
            }
            JrBI => {
                self.pc = self.rel_target(self.bimm(program, 1));
                self.inc_pc = 0;
            }
            JrHI => {
                self.pc = self.rel_target(self.himm(program, 1));
                self.inc_pc = 0;
            }
            JrFI => {
                self.pc = self.rel_target(self.fimm(program, 1));
                self.inc_pc = 0;
            }
            JrCon => {
                if self.get(0).is_truthy() {
                    self.pc = self.rel_target(self.get_int(-1));
                    self.inc_pc = 0;
                }
                self.popn(2);
            }
            JrConBI => {
                let rel = self.bimm(program, 1);
                if self.pop().is_truthy() {
                    self.pc = self.rel_target(rel);
                    self.inc_pc = 0;
                }
            }
            JrConHI => {
                let rel = self.himm(program, 1);
                if self.pop().is_truthy() {
                    self.pc = self.rel_target(rel);
                    self.inc_pc = 0;
                }
            }
            JrConFI => {
                let rel = self.fimm(program, 1);
                if self.pop().is_truthy() {
                    self.pc = self.rel_target(rel);
                    self.inc_pc = 0;
                }
            }

            Mod => {
                if self.get_int(-1) == 0 {
                    self.runtime_error("Division by 0");
                } else {
                    self.op_2_1(|a, b| a.wrapping_rem(b));
                }
            }
            ModBI => {
                let imm = self.bimm(program, 1);
                if imm == 0 {
                    self.runtime_error("Division by 0");
                } else {
                    self.op_imm(imm, |a, b| a.wrapping_rem(b));
                }
            }
            ModHI => {
                let imm = self.himm(program, 1);
                if imm == 0 {
                    self.runtime_error("Division by 0");
                } else {
                    self.op_imm(imm, |a, b| a.wrapping_rem(b));
                }
            }
            ModFI => {
                let imm = self.fimm(program, 1);
                if imm == 0 {
                    self.runtime_error("Division by 0");
                } else {
                    self.op_imm(imm, |a, b| a.wrapping_rem(b));
                }
            }

            Mul => self.op_2_1(|a, b| a.wrapping_mul(b)),
            MulF => self.op_2_1_float(|a, b| a * b),
            MulBI => {
                let imm = self.bimm(program, 1);
                self.op_imm(imm, |a, b| a.wrapping_mul(b));
            }
            MulHI => {
                let imm = self.himm(program, 1);
                self.op_imm(imm, |a, b| a.wrapping_mul(b));
            }
            MulFI => {
                let imm = self.fimm(program, 1);
                self.op_imm(imm, |a, b| a.wrapping_mul(b));
            }

            Not => {
                let value = (self.get_int(0) == 0) as DInt;
                self.set(0, Value::Int(value));
            }

            Or => self.op_2_1(|a, b| a | b),
            OrBI => {
                let imm = self.bimm(program, 1);
                self.op_imm(imm, |a, b| a | b);
            }
            OrHI => {
                let imm = self.himm(program, 1);
                self.op_imm(imm, |a, b| a | b);
            }
            OrFI => {
                let imm = self.fimm(program, 1);
                self.op_imm(imm, |a, b| a | b);
            }

            Pop => self.popn(1),
            PopB => {
                let n = self.bimm(program, 1).max(0) as usize;
                self.popn(n);
            }
            PopH => {
                let n = self.himm(program, 1).max(0) as usize;
                self.popn(n);
            }
            PopF => {
                let n = self.fimm(program, 1).max(0) as usize;
                self.popn(n);
            }

            PushB => {
                let imm = self.bimm(program, 1);
                self.push(Value::Int(imm));
            }
            PushH => {
                let imm = self.himm(program, 1);
                self.push(Value::Int(imm));
            }
            PushF => {
                let imm = self.fimm(program, 1);
                self.push(Value::Int(imm));
            }
            PushNB => {
                let n = self.bimm(program, 1).max(0) as usize;
                self.pushn(n);
            }
            PushNH => {
                let n = self.himm(program, 1).max(0) as usize;
                self.pushn(n);
            }
            PushNF => {
                let n = self.fimm(program, 1).max(0) as usize;
                self.pushn(n);
            }

            SetAdr => {
                let addr = self.pop().as_int().max(0) as usize;
                let value = self.pop();
                let word = self.value_to_word(program, value);
                program.write_word(addr, word);
            }
            SetAdrB => {
                let addr = self.pop().as_int().max(0) as usize;
                let value = self.pop();
                program.write_byte(addr, value.as_int() as u8);
            }

            Sub => self.op_2_1(|a, b| a.wrapping_sub(b)),
            SubF => self.op_2_1_float(|a, b| a - b),
            SubBI => {
                let imm = self.bimm(program, 1);
                self.op_imm(imm, |a, b| a.wrapping_sub(b));
            }
            SubHI => {
                let imm = self.himm(program, 1);
                self.op_imm(imm, |a, b| a.wrapping_sub(b));
            }
            SubFI => {
                let imm = self.fimm(program, 1);
                self.op_imm(imm, |a, b| a.wrapping_sub(b));
            }

            Syscall => {
                let selector = self.bimm(program, 1);
                self.syscall(program, selector);
            }

            Xor => self.op_2_1(|a, b| a ^ b),
            XorBI => {
                let imm = self.bimm(program, 1);
                self.op_imm(imm, |a, b| a ^ b);
            }
            XorHI => {
                let imm = self.himm(program, 1);
                self.op_imm(imm, |a, b| a ^ b);
            }
            XorFI => {
                let imm = self.fimm(program, 1);
                self.op_imm(imm, |a, b| a ^ b);
            }
        }
    }

    /// Syscall argument layout: arg0 at the top of the stack, arg1 below
    /// it, arg2 below that. The result overwrites arg2's slot and the other
    /// two are popped.
    fn syscall(&mut self, program: &mut Program, selector: DInt) {
        let syscall = match Syscall::from_byte(selector.max(0) as u8) {
            Some(syscall) => syscall,
            None => {
                self.runtime_error(&format!("unknown syscall {}", selector));
                return;
            }
        };

        match syscall {
            Syscall::Print => {
                let newline = self.get(-1).is_truthy();
                match self.get_int(0) {
                    0 => {
                        let value = self.get_int(-2);
                        let _ = write!(self.output, "{}", value);
                    }
                    1 => {
                        let value = self.get_float(-2);
                        let _ = write!(self.output, "{}", value);
                    }
                    2 => {
                        let value = self.str_arg(program, -2);
                        let _ = write!(self.output, "{}", value);
                    }
                    _ => {
                        let value = if self.get(-2).is_truthy() {
                            "true"
                        } else {
                            "false"
                        };
                        let _ = write!(self.output, "{}", value);
                    }
                }
                if newline {
                    let _ = writeln!(self.output);
                }
                self.set(-2, Value::Int(0));
            }
            Syscall::Strcmp => {
                let a = self.str_arg(program, -1);
                let b = self.str_arg(program, -2);
                let ordering = a.cmp(&b);

                let result = match self.get_int(0) {
                    0 => ordering.is_eq(),
                    1 => ordering.is_le(),
                    2 => ordering.is_lt(),
                    3 => ordering.is_ge(),
                    4 => ordering.is_gt(),
                    _ => false,
                };
                self.set(-2, Value::Int(result as DInt));
            }
            Syscall::Strlen => {
                let value = self.str_arg(program, -2);
                self.set(-2, Value::Int(value.len() as DInt));
            }
        }

        self.popn(2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;
    use dsc_util::WORD_SIZE;

    fn ins(text: &mut Vec<u8>, opcode: Opcode) {
        text.push(opcode as u8);
    }

    fn ins_f(text: &mut Vec<u8>, opcode: Opcode, imm: DInt) {
        text.push(opcode as u8);
        text.extend_from_slice(&imm.to_le_bytes());
    }

    fn ins_b(text: &mut Vec<u8>, opcode: Opcode, imm: i8) {
        text.push(opcode as u8);
        text.push(imm as u8);
    }

    fn run(text: Vec<u8>) -> (Vm, Program) {
        let mut program = Program {
            text,
            ..Program::default()
        };
        let mut vm = Vm::with_output(Box::new(Vec::new()));
        assert!(vm.run(&mut program, 0));
        (vm, program)
    }

    #[test]
    fn test_push_and_add() {
        let mut text = Vec::new();
        ins_f(&mut text, Opcode::PushF, 2);
        ins_f(&mut text, Opcode::PushF, 3);
        ins(&mut text, Opcode::Add);
        ins(&mut text, Opcode::Ret);

        let (vm, _) = run(text);
        assert_eq!(vm.top(), 1);
        assert_eq!(vm.get_int(0), 5);
    }

    #[test]
    fn test_subtraction_operand_order() {
        // SUB takes the top as the left operand.
        let mut text = Vec::new();
        ins_f(&mut text, Opcode::PushF, 3);
        ins_f(&mut text, Opcode::PushF, 10);
        ins(&mut text, Opcode::Sub);
        ins(&mut text, Opcode::Ret);

        let (vm, _) = run(text);
        assert_eq!(vm.get_int(0), 7);
    }

    #[test]
    fn test_immediate_variants() {
        let mut text = Vec::new();
        ins_f(&mut text, Opcode::PushF, 10);
        ins_b(&mut text, Opcode::AddBI, -3);
        ins(&mut text, Opcode::Ret);

        let (vm, _) = run(text);
        assert_eq!(vm.get_int(0), 7);
    }

    #[test]
    fn test_float_arithmetic() {
        let mut text = Vec::new();
        ins_f(&mut text, Opcode::PushF, 2);
        ins(&mut text, Opcode::CvtF);
        ins_f(&mut text, Opcode::PushF, 8);
        ins(&mut text, Opcode::CvtF);
        ins(&mut text, Opcode::DivF);
        ins(&mut text, Opcode::CvtI);
        ins(&mut text, Opcode::Ret);

        // 8.0 / 2.0: the top is the left operand.
        let (vm, _) = run(text);
        assert_eq!(vm.get_int(0), 4);
    }

    #[test]
    fn test_division_by_zero_is_a_runtime_error() {
        let mut text = Vec::new();
        ins_f(&mut text, Opcode::PushF, 0);
        ins_f(&mut text, Opcode::PushF, 1);
        ins(&mut text, Opcode::Div);
        ins(&mut text, Opcode::Ret);

        let mut program = Program {
            text,
            ..Program::default()
        };
        let mut vm = Vm::with_output(Box::new(Vec::new()));
        assert!(!vm.run(&mut program, 0));
        assert!(vm.had_runtime_error());
        assert!(vm.is_halted());
    }

    #[test]
    fn test_relative_jump_skips_instructions() {
        let mut text = Vec::new();
        // Jump over a push.
        ins_f(
            &mut text,
            Opcode::JrFI,
            (1 + WORD_SIZE + 1 + WORD_SIZE) as DInt,
        );
        ins_f(&mut text, Opcode::PushF, 111);
        ins_f(&mut text, Opcode::PushF, 222);
        ins(&mut text, Opcode::Ret);

        let (vm, _) = run(text);
        assert_eq!(vm.top(), 1);
        assert_eq!(vm.get_int(0), 222);
    }

    #[test]
    fn test_conditional_jump_pops_condition() {
        let mut text = Vec::new();
        ins_f(&mut text, Opcode::PushF, 1);
        ins_f(
            &mut text,
            Opcode::JrConFI,
            (1 + WORD_SIZE + 1 + WORD_SIZE) as DInt,
        );
        ins_f(&mut text, Opcode::PushF, 111);
        ins_f(&mut text, Opcode::PushF, 222);
        ins(&mut text, Opcode::Ret);

        let (vm, _) = run(text);
        assert_eq!(vm.top(), 1);
        assert_eq!(vm.get_int(0), 222);
    }

    #[test]
    fn test_call_and_return() {
        let mut text = Vec::new();
        // 0: RET guard
        ins(&mut text, Opcode::Ret);
        // 1: function body: double the argument and return it.
        let func = text.len();
        ins_f(&mut text, Opcode::GetFI, 1);
        ins_f(&mut text, Opcode::MulFI, 2);
        ins_b(&mut text, Opcode::Retn, 1);
        // main: push 21, call the function with one argument.
        let main = text.len();
        ins_f(&mut text, Opcode::PushF, 21);
        text.push(Opcode::CallI as u8);
        text.extend_from_slice(&(func as DInt).to_le_bytes());
        text.push(1u8);
        ins(&mut text, Opcode::Ret);

        let mut program = Program {
            text,
            ..Program::default()
        };
        let mut vm = Vm::with_output(Box::new(Vec::new()));
        assert!(vm.run(&mut program, main));
        // The argument run was replaced by the single return value.
        assert_eq!(vm.top(), 1);
        assert_eq!(vm.get_int(0), 42);
    }

    #[test]
    fn test_get_frame_relative_and_top_relative() {
        let mut text = Vec::new();
        ins_f(&mut text, Opcode::PushF, 10);
        ins_f(&mut text, Opcode::PushF, 20);
        ins_f(&mut text, Opcode::GetFI, -1); // copy the 10 to the top
        ins(&mut text, Opcode::Ret);

        let (vm, _) = run(text);
        assert_eq!(vm.top(), 3);
        assert_eq!(vm.get_int(0), 10);
    }

    #[test]
    fn test_deref_and_setadr() {
        let mut text = Vec::new();
        // data[WORD] = 7; push it, add one, store it back.
        ins_f(&mut text, Opcode::DerefI, WORD_SIZE as DInt);
        ins_b(&mut text, Opcode::AddBI, 1);
        ins_f(&mut text, Opcode::PushF, WORD_SIZE as DInt);
        ins(&mut text, Opcode::SetAdr);
        ins(&mut text, Opcode::Ret);

        let mut program = Program {
            text,
            ..Program::default()
        };
        program.data.resize(WORD_SIZE * 2, 0);
        program.write_word(WORD_SIZE, 7);

        let mut vm = Vm::with_output(Box::new(Vec::new()));
        assert!(vm.run(&mut program, 0));
        assert_eq!(program.read_word(WORD_SIZE), 8);
        assert_eq!(vm.top(), 0);
    }

    #[test]
    fn test_unknown_opcode_is_a_runtime_error() {
        let text = vec![0xEE];
        let mut program = Program {
            text,
            ..Program::default()
        };
        let mut vm = Vm::with_output(Box::new(Vec::new()));
        assert!(!vm.run(&mut program, 0));
        assert!(vm.had_runtime_error());
    }

    #[test]
    fn test_syscall_strcmp() {
        let mut program = Program::default();
        program.data.extend_from_slice(b"abc\0abcd\0");

        let mut text = Vec::new();
        ins_f(&mut text, Opcode::PushF, 4); // second string "abcd"
        ins_f(&mut text, Opcode::PushF, 0); // first string "abc"
        ins_f(&mut text, Opcode::PushF, 0); // predicate: equal
        ins_b(&mut text, Opcode::Syscall, Syscall::Strcmp as i8);
        ins(&mut text, Opcode::Ret);
        program.text = text;

        let mut vm = Vm::with_output(Box::new(Vec::new()));
        assert!(vm.run(&mut program, 0));
        assert_eq!(vm.top(), 1);
        assert_eq!(vm.get_int(0), 0);
    }

    #[test]
    fn test_owned_string_moves_to_heap_on_store() {
        let mut program = Program::default();
        program.data.resize(WORD_SIZE, 0);

        let mut text = Vec::new();
        ins_f(&mut text, Opcode::PushF, 0); // address 0
        ins(&mut text, Opcode::SetAdr);
        ins(&mut text, Opcode::Ret);
        program.text = text;

        let mut vm = Vm::with_output(Box::new(Vec::new()));
        vm.push_string("moved".into());
        assert!(vm.run(&mut program, 0));

        let handle = program.read_word(0) as DUInt;
        assert_eq!(program.string_at(handle), Some("moved"));
    }
}
