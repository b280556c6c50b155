//! Bytecode fragments.
//!
//! The code generator builds small fragments and composes them by
//! appending. A fragment carries its instructions, the relocations whose
//! instruction offsets are relative to the fragment's own start, and any
//! debug annotations; appending rebases both.

use dsc_sem::{DebugInfo, InsExecInfo, InsNodeInfo, InsToLink, InsValueInfo, LinkMeta, Wire};
use dsc_util::DInt;
use dsc_vm::{Opcode, BIMM_SIZE, FIMM_SIZE, HIMM_SIZE};

/// A contiguous instruction buffer with attached relocations and debug
/// annotations.
#[derive(Debug, Default)]
pub struct BCode {
    pub code: Vec<u8>,
    /// Relocations; `ins` offsets are fragment-relative until composed.
    pub links: Vec<InsToLink>,
    pub debug: DebugInfo,
}

impl BCode {
    pub fn new() -> Self {
        BCode::default()
    }

    /// A fragment holding a single instruction with zeroed operands.
    pub fn ins(opcode: Opcode) -> Self {
        let mut code = vec![0u8; opcode.ins_size()];
        code[0] = opcode as u8;
        BCode {
            code,
            ..BCode::default()
        }
    }

    pub fn size(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Write a byte operand at a byte offset into the fragment.
    pub fn set_byte(&mut self, offset: usize, value: i8) {
        self.code[offset] = value as u8;
    }

    /// Write a half immediate at a byte offset into the fragment.
    pub fn set_himm(&mut self, offset: usize, value: DInt) {
        let bytes = value.to_le_bytes();
        self.code[offset..offset + HIMM_SIZE].copy_from_slice(&bytes[..HIMM_SIZE]);
    }

    /// Write a full immediate at a byte offset into the fragment.
    pub fn set_fimm(&mut self, offset: usize, value: DInt) {
        let bytes = value.to_le_bytes();
        self.code[offset..offset + FIMM_SIZE].copy_from_slice(&bytes[..FIMM_SIZE]);
    }

    /// Record a relocation against the link-table entry `link` for the
    /// instruction at `ins`.
    pub fn add_link(&mut self, ins: usize, link: usize) {
        self.links.push(InsToLink { ins, link });
    }

    /// Record that the instruction at `ins` activates a node.
    pub fn mark_node(&mut self, ins: usize, node: usize) {
        self.debug.node_info.push(InsNodeInfo { ins, node });
    }

    /// Record that the instruction at `ins` follows an execution wire.
    pub fn mark_exec_wire(&mut self, ins: usize, wire: Wire) {
        self.debug.exec_info.push(InsExecInfo { ins, wire });
    }

    /// Record that after the instruction at `ins` a value has crossed a
    /// wire and sits at the given top-relative stack index.
    pub fn mark_value_wire(&mut self, ins: usize, wire: Wire, stack_index: DInt) {
        self.debug.value_info.push(InsValueInfo {
            ins,
            wire,
            stack_index,
        });
    }

    /// Append another fragment, rebasing its relocations and annotations.
    pub fn append(&mut self, mut other: BCode) {
        let base = self.code.len();

        for link in &mut other.links {
            link.ins += base;
        }
        other.debug.rebase(base);

        self.code.extend(other.code);
        self.links.extend(other.links);
        self.debug.append(other.debug);
    }
}

/// The code generator's link-table builder, shared across fragments.
///
/// Entries are deduplicated by kind and name so that every instruction
/// referring to the same symbol points at the same record.
#[derive(Debug, Default)]
pub struct LinkTable {
    pub list: Vec<LinkMeta>,
}

impl LinkTable {
    /// Find or add a record, returning its index and whether it was
    /// already present.
    pub fn intern(&mut self, meta: LinkMeta) -> (usize, bool) {
        for (index, existing) in self.list.iter().enumerate() {
            if existing.kind == meta.kind && existing.name == meta.name {
                return (index, true);
            }
        }
        self.list.push(meta);
        (self.list.len() - 1, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsc_sem::LinkKind;

    #[test]
    fn test_single_instruction_fragment() {
        let mut push = BCode::ins(Opcode::PushF);
        push.set_fimm(1, -7);
        assert_eq!(push.size(), 1 + FIMM_SIZE);
        assert_eq!(push.code[0], Opcode::PushF as u8);

        let mut bytes = [0u8; FIMM_SIZE];
        bytes.copy_from_slice(&push.code[1..]);
        assert_eq!(DInt::from_le_bytes(bytes), -7);
    }

    #[test]
    fn test_append_rebases_links() {
        let mut a = BCode::ins(Opcode::Ret);

        let mut b = BCode::ins(Opcode::PushF);
        b.add_link(0, 3);
        b.mark_node(0, 9);

        a.append(b);
        assert_eq!(a.links, vec![InsToLink { ins: 1, link: 3 }]);
        assert_eq!(a.debug.node_at(1), Some(9));
    }

    #[test]
    fn test_link_table_dedup() {
        let mut table = LinkTable::default();
        let (first, dup) = table.intern(LinkMeta::new(LinkKind::StringLiteral, "hi"));
        assert!(!dup);
        let (second, dup) = table.intern(LinkMeta::new(LinkKind::StringLiteral, "hi"));
        assert!(dup);
        assert_eq!(first, second);

        let (third, dup) = table.intern(LinkMeta::new(LinkKind::Variable, "hi"));
        assert!(!dup);
        assert_ne!(first, third);
    }

    #[test]
    fn test_byte_operand() {
        let mut retn = BCode::ins(Opcode::Retn);
        retn.set_byte(1, 2);
        assert_eq!(retn.code[1], 2);
        assert_eq!(retn.size(), 1 + BIMM_SIZE);
    }
}
