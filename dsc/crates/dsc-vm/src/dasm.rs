//! Reading and printing compiled machine code.

use crate::opcode::{Opcode, Operands, BIMM_SIZE, FIMM_SIZE, HIMM_SIZE};
use dsc_util::DInt;
use std::fmt::Write;

fn read_imm(bytes: &[u8]) -> DInt {
    let mut acc: u64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        acc |= (*byte as u64) << (8 * i);
    }
    let shift = 64 - bytes.len() * 8;
    (((acc << shift) as i64) >> shift) as DInt
}

/// One decoded instruction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Instruction {
    pub offset: usize,
    pub opcode: Opcode,
    pub immediate: Option<DInt>,
    /// The trailing argument count of the call opcodes that carry one.
    pub arg_count: Option<DInt>,
}

/// Iterate over the instructions of a text section.
///
/// Stops early if it runs into a byte that is not an opcode, which in
/// well-formed code never happens.
pub fn instructions(text: &[u8]) -> impl Iterator<Item = Instruction> + '_ {
    let mut offset = 0;
    std::iter::from_fn(move || {
        let byte = *text.get(offset)?;
        let opcode = Opcode::from_byte(byte)?;

        let start = offset + 1;
        let (immediate, arg_count) = match opcode.operands() {
            Operands::None => (None, None),
            Operands::Byte => (Some(read_imm(text.get(start..start + BIMM_SIZE)?)), None),
            Operands::Half => (Some(read_imm(text.get(start..start + HIMM_SIZE)?)), None),
            Operands::Full => (Some(read_imm(text.get(start..start + FIMM_SIZE)?)), None),
            Operands::FullByte => (
                Some(read_imm(text.get(start..start + FIMM_SIZE)?)),
                Some(read_imm(
                    text.get(start + FIMM_SIZE..start + FIMM_SIZE + BIMM_SIZE)?,
                )),
            ),
        };

        let ins = Instruction {
            offset,
            opcode,
            immediate,
            arg_count,
        };
        offset += opcode.ins_size();
        Some(ins)
    })
}

/// De-assemble a text section into readable lines.
pub fn text_dump(text: &[u8]) -> String {
    let mut out = String::new();
    for ins in instructions(text) {
        let _ = write!(out, "{:08x}  {}", ins.offset, ins.opcode.mnemonic());
        if let Some(imm) = ins.immediate {
            let _ = write!(out, " {}", imm);
        }
        if let Some(args) = ins.arg_count {
            let _ = write!(out, ", {}", args);
        }
        out.push('\n');
    }
    out
}

/// Print a data section in hex, sixteen bytes per line.
pub fn data_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x} ", line * 16);
        for byte in chunk {
            let _ = write!(out, " {:02x}", byte);
        }
        out.push('\n');
    }
    out
}
