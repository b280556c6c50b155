//! dsc-vm - The Decision virtual machine.
//!
//! A stack-based bytecode machine. This crate owns the instruction set, the
//! linked program image the machine executes, the stack whose entries can
//! own string payloads, the three syscalls (typed print, strcmp, strlen),
//! the host-injected native-function registry, and the disassembler.

pub mod dasm;
pub mod native;
pub mod opcode;
pub mod program;
pub mod value;
pub mod vm;

pub use native::{NativeFn, NativeFunction, NativeRegistry};
pub use opcode::{Opcode, Operands, Syscall, BIMM_SIZE, FIMM_SIZE, HIMM_SIZE, NUM_OPCODES};
pub use program::{FunctionEntry, Program, SheetLayout, HEAP_ADDR_BIT};
pub use value::{StrValue, Value};
pub use vm::Vm;
