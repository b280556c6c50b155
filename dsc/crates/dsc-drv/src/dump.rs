//! Human-readable dumps of compiled sheets.

use dsc_sem::Sheet;
use dsc_vm::dasm;
use std::fmt::Write;

/// Dump every section of a compiled sheet: disassembled text, hex data,
/// the link table, the relocation list and the includes.
pub fn dump_sheet(sheet: &Sheet) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "{}:", sheet.file_name());

    if let Some(main) = sheet.main {
        let _ = writeln!(out, ".main: {:#x}", main);
    }

    let _ = writeln!(out, ".text ({} bytes):", sheet.text.len());
    out.push_str(&dasm::text_dump(&sheet.text));

    let _ = writeln!(out, ".data ({} bytes):", sheet.data.len());
    out.push_str(&dasm::data_dump(&sheet.data));

    let _ = writeln!(out, ".lmeta ({} records):", sheet.links.len());
    for (index, meta) in sheet.links.iter().enumerate() {
        let ptr = meta
            .ptr
            .map(|p| format!("{:#x}", p))
            .unwrap_or_else(|| "external".to_string());
        let _ = writeln!(out, "  [{}] {:?} {} -> {}", index, meta.kind, meta.name, ptr);
    }

    let _ = writeln!(out, ".link ({} records):", sheet.ins_links.len());
    for link in &sheet.ins_links {
        let _ = writeln!(out, "  ins {:#x} -> lmeta [{}]", link.ins, link.link);
    }

    if !sheet.includes.is_empty() {
        let _ = writeln!(out, ".incl:");
        for include in &sheet.includes {
            let _ = writeln!(out, "  {}", include.file_name());
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsc_sem::IncludeContext;
    use dsc_util::Handler;

    #[test]
    fn test_dump_covers_sections() {
        let handler = Handler::new();
        let tokens = dsc_lex::lex("Start~#1; Print(#1, 'hi');", "t.dc", &handler);
        let parsed = dsc_par::parse(&tokens, "t.dc", &handler);

        let mut sheet = Sheet::new("t.dc");
        dsc_sem::scan(&mut sheet, &parsed.tree, &handler, &IncludeContext::default());
        dsc_gen::compile(&mut sheet, false);

        let dump = dump_sheet(&sheet);
        assert!(dump.contains(".text"));
        assert!(dump.contains(".data"));
        assert!(dump.contains("SYSCALL"));
        assert!(dump.contains("StringLiteral"));
    }
}
