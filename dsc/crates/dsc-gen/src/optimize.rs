//! Peephole optimization of compiled bytecode.
//!
//! A driver alternates the pattern passes until neither changes the text,
//! then runs the one-shot passes: rewriting same-sheet absolute calls to
//! relative ones, simplifying fixed-count instructions, and shrinking full
//! immediates to narrower widths. All deletions go through one primitive
//! that rewrites crossing relative jumps, relocation indices, function
//! offsets and the entry point.

use dsc_sem::{LinkKind, Sheet};
use dsc_util::DInt;
use dsc_vm::{Opcode, BIMM_SIZE, FIMM_SIZE, HIMM_SIZE};
use tracing::debug;

fn opcode_at(text: &[u8], offset: usize) -> Opcode {
    Opcode::from_byte(text[offset]).unwrap_or_else(|| {
        panic!(
            "byte {} of part-optimized bytecode is not a valid opcode",
            offset
        )
    })
}

fn read_imm(text: &[u8], offset: usize, size: usize) -> DInt {
    let mut acc: u64 = 0;
    for (i, byte) in text[offset..offset + size].iter().enumerate() {
        acc |= (*byte as u64) << (8 * i);
    }
    let shift = 64 - size * 8;
    (((acc << shift) as i64) >> shift) as DInt
}

fn write_imm(text: &mut [u8], offset: usize, size: usize, value: DInt) {
    let bytes = value.to_le_bytes();
    text[offset..offset + size].copy_from_slice(&bytes[..size]);
}

/// The width of a relative-jump opcode's immediate, if it is one.
fn rel_jump_width(opcode: Opcode) -> Option<usize> {
    use Opcode::*;
    match opcode {
        CallRF | JrFI | JrConFI => Some(FIMM_SIZE),
        CallRH | JrHI | JrConHI => Some(HIMM_SIZE),
        CallRB | JrBI | JrConBI => Some(BIMM_SIZE),
        _ => None,
    }
}

/// Remove a byte range from a sheet's text, making every adjustment the
/// rest of the data needs.
///
/// Relative jumps whose span crosses the deletion are rewritten to close
/// the gap; relocations, user-function offsets and the entry point are
/// shifted. A jump that landed inside the deleted range means a pass
/// deleted something it should not have, and is an internal error.
pub fn remove_bytecode(sheet: &mut Sheet, start: usize, len: usize) {
    if len == 0 {
        return;
    }

    sheet.text.drain(start..start + len);

    // Fix relative jumps that crossed the deleted region. Instruction
    // offsets here are post-deletion.
    let mut i = 0;
    while i < sheet.text.len() {
        let opcode = opcode_at(&sheet.text, i);

        if let Some(width) = rel_jump_width(opcode) {
            let amount = read_imm(&sheet.text, i + 1, width);

            if i >= start && amount < 0 {
                // A backward jump from beyond the deletion.
                let target = i as i64 + len as i64 + amount as i64;
                if target < start as i64 {
                    write_imm(&mut sheet.text, i + 1, width, amount + len as DInt);
                } else if (target as usize) > start && (target as usize) < start + len {
                    // Jumping to the start of the deletion lands on whatever
                    // shifted into its place; the interior is gone.
                    panic!("relative jump at {} lands inside deleted bytecode", i);
                }
            } else if i < start && amount > 0 {
                // A forward jump from before the deletion.
                let target = i as i64 + amount as i64;
                if target >= (start + len) as i64 {
                    write_imm(&mut sheet.text, i + 1, width, amount - len as DInt);
                } else if target as usize > start && (target as usize) < start + len {
                    panic!("relative jump at {} lands inside deleted bytecode", i);
                }
            }
        }

        i += opcode.ins_size();
    }

    // Relocations inside the deleted region go away; later ones shift.
    sheet.ins_links.retain_mut(|link| {
        if link.ins >= start && link.ins < start + len {
            false
        } else {
            if link.ins >= start + len {
                link.ins -= len;
            }
            true
        }
    });

    // User-function text offsets shift with the deletion.
    for meta in &mut sheet.links {
        if meta.kind == LinkKind::Function {
            if let Some(ptr) = meta.ptr {
                if ptr >= start && ptr < start + len {
                    meta.ptr = Some(start);
                } else if ptr >= start + len {
                    meta.ptr = Some(ptr - len);
                }
            }
        }
    }

    // So does the entry point.
    if let Some(main) = sheet.main {
        if main >= start && main < start + len {
            sheet.main = Some(start);
        } else if main >= start + len {
            sheet.main = Some(main - len);
        }
    }
}

/// Remove pairs of consecutive `NOT` instructions; they cancel out.
pub fn not_consecutive(sheet: &mut Sheet) -> bool {
    let mut optimized = false;
    let mut i = 0;

    while i < sheet.text.len() {
        let opcode = opcode_at(&sheet.text, i);
        let size = opcode.ins_size();

        if opcode == Opcode::Not && i + size < sheet.text.len() {
            if opcode_at(&sheet.text, i + size) == Opcode::Not {
                remove_bytecode(sheet, i, 2 * Opcode::Not.ins_size());
                optimized = true;
                // Re-check the same offset; another pair may have shifted in.
                continue;
            }
        }

        i += size;
    }

    optimized
}

/// Remove no-op forms: popping zero entries and pushing zero zeroes.
pub fn useless(sheet: &mut Sheet) -> bool {
    use Opcode::*;

    let mut optimized = false;
    let mut i = 0;

    while i < sheet.text.len() {
        let opcode = opcode_at(&sheet.text, i);

        let width = match opcode {
            PopB | PushNB => Some(BIMM_SIZE),
            PopH | PushNH => Some(HIMM_SIZE),
            PopF | PushNF => Some(FIMM_SIZE),
            _ => None,
        };

        if let Some(width) = width {
            if read_imm(&sheet.text, i + 1, width) == 0 {
                remove_bytecode(sheet, i, opcode.ins_size());
                optimized = true;
                continue;
            }
        }

        i += opcode.ins_size();
    }

    optimized
}

/// Rewrite absolute calls to functions on the same sheet into relative
/// calls, dropping the relocation: the linker is no longer needed to reach
/// them.
pub fn call_func_relative(sheet: &mut Sheet) -> bool {
    let mut optimized = false;
    let mut index = 0;

    while index < sheet.ins_links.len() {
        let link = sheet.ins_links[index];
        let meta = &sheet.links[link.link];

        if meta.kind == LinkKind::Function {
            if let Some(target) = meta.ptr {
                // The function lives in this sheet's own text section.
                let jump = target as DInt - link.ins as DInt;

                sheet.text[link.ins] = Opcode::CallRF as u8;
                write_imm(&mut sheet.text, link.ins + 1, FIMM_SIZE, jump);

                sheet.ins_links.remove(index);
                optimized = true;
                continue;
            }
        }

        index += 1;
    }

    optimized
}

/// Simplify fixed-count instructions to their plain counterparts:
/// `RETN 0` to `RET` and `POPx 1` to `POP`.
pub fn simplify(sheet: &mut Sheet) -> bool {
    use Opcode::*;

    let mut optimized = false;
    let mut i = 0;

    while i < sheet.text.len() {
        let mut opcode = opcode_at(&sheet.text, i);

        let rewrite = match opcode {
            Retn if read_imm(&sheet.text, i + 1, BIMM_SIZE) == 0 => Some((Ret, BIMM_SIZE)),
            PopB if read_imm(&sheet.text, i + 1, BIMM_SIZE) == 1 => Some((Pop, BIMM_SIZE)),
            PopH if read_imm(&sheet.text, i + 1, HIMM_SIZE) == 1 => Some((Pop, HIMM_SIZE)),
            PopF if read_imm(&sheet.text, i + 1, FIMM_SIZE) == 1 => Some((Pop, FIMM_SIZE)),
            _ => None,
        };

        if let Some((plain, operand_size)) = rewrite {
            sheet.text[i] = plain as u8;
            remove_bytecode(sheet, i + 1, operand_size);
            opcode = plain;
            optimized = true;
        }

        i += opcode.ins_size();
    }

    optimized
}

/// Opcodes that exist in full, half and byte immediate widths.
const SHRINK_OPS: [(Opcode, Opcode, Opcode); 15] = [
    (Opcode::AddFI, Opcode::AddHI, Opcode::AddBI),
    (Opcode::AndFI, Opcode::AndHI, Opcode::AndBI),
    (Opcode::CallRF, Opcode::CallRH, Opcode::CallRB),
    (Opcode::DivFI, Opcode::DivHI, Opcode::DivBI),
    (Opcode::GetFI, Opcode::GetHI, Opcode::GetBI),
    (Opcode::JrFI, Opcode::JrHI, Opcode::JrBI),
    (Opcode::JrConFI, Opcode::JrConHI, Opcode::JrConBI),
    (Opcode::ModFI, Opcode::ModHI, Opcode::ModBI),
    (Opcode::MulFI, Opcode::MulHI, Opcode::MulBI),
    (Opcode::OrFI, Opcode::OrHI, Opcode::OrBI),
    (Opcode::PopF, Opcode::PopH, Opcode::PopB),
    (Opcode::PushF, Opcode::PushH, Opcode::PushB),
    (Opcode::PushNF, Opcode::PushNH, Opcode::PushNB),
    (Opcode::SubFI, Opcode::SubHI, Opcode::SubBI),
    (Opcode::XorFI, Opcode::XorHI, Opcode::XorBI),
];

fn himm_min_max() -> (DInt, DInt) {
    let bits = HIMM_SIZE * 8;
    let max = (1u64 << (bits - 1)) - 1;
    (-(max as DInt) - 1, max as DInt)
}

/// Shrink full immediates that fit a narrower width.
///
/// An instruction referenced by a pending relocation is pinned to full
/// width: linking writes a full immediate. Relative jumps that shrink get
/// their (positive) amounts adjusted, since the instruction itself got
/// shorter.
pub fn shrink_fimmediate(sheet: &mut Sheet) -> bool {
    let mut optimized = false;
    let mut i = 0;

    while i < sheet.text.len() {
        let opcode = opcode_at(&sheet.text, i);

        let pinned = sheet.ins_links.iter().any(|link| link.ins == i);

        if !pinned {
            if let Some(&(full, half, byte)) =
                SHRINK_OPS.iter().find(|(full, _, _)| *full == opcode)
            {
                let mut immediate = read_imm(&sheet.text, i + 1, FIMM_SIZE);
                let is_jump =
                    matches!(full, Opcode::CallRF | Opcode::JrFI | Opcode::JrConFI);
                let (half_min, half_max) = himm_min_max();

                if (i8::MIN as DInt..=i8::MAX as DInt).contains(&immediate) {
                    if is_jump && immediate > 0 {
                        immediate -= (FIMM_SIZE - BIMM_SIZE) as DInt;
                    }

                    sheet.text[i] = byte as u8;
                    remove_bytecode(sheet, i + 1, FIMM_SIZE - BIMM_SIZE);
                    write_imm(&mut sheet.text, i + 1, BIMM_SIZE, immediate);
                    optimized = true;

                    i += byte.ins_size();
                    continue;
                } else if (half_min..=half_max).contains(&immediate) {
                    if is_jump && immediate > 0 {
                        immediate -= (FIMM_SIZE - HIMM_SIZE) as DInt;
                    }

                    sheet.text[i] = half as u8;
                    remove_bytecode(sheet, i + 1, FIMM_SIZE - HIMM_SIZE);
                    write_imm(&mut sheet.text, i + 1, HIMM_SIZE, immediate);
                    optimized = true;

                    i += half.ins_size();
                    continue;
                }
            }
        }

        i += opcode.ins_size();
    }

    optimized
}

/// Run every optimization pass over a compiled sheet.
pub fn optimize(sheet: &mut Sheet) {
    debug!(sheet = %sheet.file_name(), "optimizing bytecode");

    // The pattern passes can expose more work for each other, so alternate
    // until neither finds anything.
    loop {
        let mut repeat = false;
        repeat |= not_consecutive(sheet);
        repeat |= useless(sheet);
        if !repeat {
            break;
        }
    }

    // These run once; immediate shrinking must come last.
    call_func_relative(sheet);
    simplify(sheet);
    shrink_fimmediate(sheet);
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsc_sem::InsToLink;

    fn sheet_with_text(text: Vec<u8>) -> Sheet {
        let mut sheet = Sheet::new("test.dc");
        sheet.text = text;
        sheet.is_compiled = true;
        sheet
    }

    fn push_f(text: &mut Vec<u8>, value: DInt) {
        text.push(Opcode::PushF as u8);
        text.extend_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn test_not_pairs_cancel() {
        let mut text = Vec::new();
        push_f(&mut text, 700); // too big to shrink to a byte
        text.push(Opcode::Not as u8);
        text.push(Opcode::Not as u8);
        text.push(Opcode::Ret as u8);

        let mut sheet = sheet_with_text(text);
        assert!(not_consecutive(&mut sheet));

        let not = Opcode::Not as u8;
        assert!(!sheet.text.contains(&not));
        assert_eq!(sheet.text.len(), 1 + FIMM_SIZE + 1);
    }

    #[test]
    fn test_three_nots_leave_one() {
        let mut text = Vec::new();
        text.push(Opcode::Not as u8);
        text.push(Opcode::Not as u8);
        text.push(Opcode::Not as u8);
        text.push(Opcode::Ret as u8);

        let mut sheet = sheet_with_text(text);
        not_consecutive(&mut sheet);
        assert_eq!(sheet.text, vec![Opcode::Not as u8, Opcode::Ret as u8]);
    }

    #[test]
    fn test_pop_zero_is_removed() {
        let mut text = Vec::new();
        text.push(Opcode::PopF as u8);
        text.extend_from_slice(&(0 as DInt).to_le_bytes());
        text.push(Opcode::Ret as u8);

        let mut sheet = sheet_with_text(text);
        assert!(useless(&mut sheet));
        assert_eq!(sheet.text, vec![Opcode::Ret as u8]);
    }

    #[test]
    fn test_retn_zero_simplifies_to_ret() {
        let mut sheet = sheet_with_text(vec![Opcode::Retn as u8, 0]);
        assert!(simplify(&mut sheet));
        assert_eq!(sheet.text, vec![Opcode::Ret as u8]);
    }

    #[test]
    fn test_shrink_push_to_byte() {
        let mut text = Vec::new();
        push_f(&mut text, 5);
        text.push(Opcode::Ret as u8);

        let mut sheet = sheet_with_text(text);
        assert!(shrink_fimmediate(&mut sheet));
        assert_eq!(
            sheet.text,
            vec![Opcode::PushB as u8, 5, Opcode::Ret as u8]
        );
    }

    #[test]
    fn test_linked_instructions_are_pinned() {
        let mut text = Vec::new();
        push_f(&mut text, 5);
        text.push(Opcode::Ret as u8);

        let mut sheet = sheet_with_text(text);
        sheet
            .links
            .push(dsc_sem::LinkMeta::new(LinkKind::StringLiteral, "s"));
        sheet.ins_links.push(InsToLink { ins: 0, link: 0 });

        assert!(!shrink_fimmediate(&mut sheet));
        assert_eq!(sheet.text[0], Opcode::PushF as u8);
    }

    #[test]
    fn test_deletion_rewrites_forward_jump() {
        // JRFI over a PUSHNF 0 to a RET.
        let mut text = Vec::new();
        text.push(Opcode::JrFI as u8);
        text.extend_from_slice(&((1 + FIMM_SIZE + 1 + FIMM_SIZE) as DInt).to_le_bytes());
        text.push(Opcode::PushNF as u8);
        text.extend_from_slice(&(0 as DInt).to_le_bytes());
        text.push(Opcode::Ret as u8);

        let mut sheet = sheet_with_text(text);
        assert!(useless(&mut sheet));

        // The jump now goes straight to the RET.
        assert_eq!(sheet.text.len(), 1 + FIMM_SIZE + 1);
        assert_eq!(
            read_imm(&sheet.text, 1, FIMM_SIZE),
            (1 + FIMM_SIZE) as DInt
        );
    }

    #[test]
    fn test_deletion_rewrites_backward_jump() {
        // RET, POPF 0, JRFI back to the RET.
        let mut text = Vec::new();
        text.push(Opcode::Ret as u8);
        text.push(Opcode::PopF as u8);
        text.extend_from_slice(&(0 as DInt).to_le_bytes());
        let jump_at = text.len();
        text.push(Opcode::JrFI as u8);
        text.extend_from_slice(&(-(jump_at as DInt)).to_le_bytes());

        let mut sheet = sheet_with_text(text);
        assert!(useless(&mut sheet));

        assert_eq!(sheet.text.len(), 1 + 1 + FIMM_SIZE);
        assert_eq!(read_imm(&sheet.text, 2, FIMM_SIZE), -1);
    }

    #[test]
    fn test_deletion_updates_main_and_function_offsets() {
        let mut text = Vec::new();
        text.push(Opcode::PopF as u8);
        text.extend_from_slice(&(0 as DInt).to_le_bytes());
        text.push(Opcode::Ret as u8);
        text.push(Opcode::Ret as u8);

        let mut sheet = sheet_with_text(text);
        let mut func = dsc_sem::LinkMeta::new(LinkKind::Function, "f");
        func.ptr = Some(1 + FIMM_SIZE + 1);
        sheet.links.push(func);
        sheet.main = Some(1 + FIMM_SIZE);

        useless(&mut sheet);

        assert_eq!(sheet.links[0].ptr, Some(1));
        assert_eq!(sheet.main, Some(0));
    }

    #[test]
    fn test_same_sheet_call_becomes_relative() {
        let mut text = Vec::new();
        // A function at offset 0, then a CALLI to it.
        text.push(Opcode::Ret as u8);
        let call_at = text.len();
        text.push(Opcode::CallI as u8);
        text.extend_from_slice(&(0 as DInt).to_le_bytes());
        text.push(0u8);
        text.push(Opcode::Ret as u8);

        let mut sheet = sheet_with_text(text);
        let mut func = dsc_sem::LinkMeta::new(LinkKind::Function, "f");
        func.ptr = Some(0);
        sheet.links.push(func);
        sheet.ins_links.push(InsToLink {
            ins: call_at,
            link: 0,
        });

        assert!(call_func_relative(&mut sheet));
        assert!(sheet.ins_links.is_empty());
        assert_eq!(sheet.text[call_at], Opcode::CallRF as u8);
        assert_eq!(
            read_imm(&sheet.text, call_at + 1, FIMM_SIZE),
            -(call_at as DInt)
        );
    }

    #[test]
    fn test_optimizer_is_idempotent() {
        let mut text = Vec::new();
        push_f(&mut text, 3);
        text.push(Opcode::Not as u8);
        text.push(Opcode::Not as u8);
        text.push(Opcode::PopF as u8);
        text.extend_from_slice(&(1 as DInt).to_le_bytes());
        text.push(Opcode::Ret as u8);

        let mut sheet = sheet_with_text(text);
        optimize(&mut sheet);
        let once = sheet.text.clone();

        optimize(&mut sheet);
        assert_eq!(sheet.text, once);
    }
}
