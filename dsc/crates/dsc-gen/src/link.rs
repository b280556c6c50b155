//! The linker.
//!
//! Walks a compiled sheet tree, lays every sheet's text and data section
//! out in one program image, and patches each relocation's full-width
//! immediate with its resolved value: variables and string literals become
//! data addresses, user functions become text addresses, native functions
//! become indices into the host registry's table, and string-variable
//! defaults allocate a fresh owning string initialised from the literal.
//!
//! Cross-sheet references are resolved by walking the referencing sheet's
//! includes depth-first; an unresolved reference is a link error.

use dsc_sem::{LinkKind, Sheet};
use dsc_util::{DInt, FxHashMap};
use dsc_vm::{FunctionEntry, NativeRegistry, Program, SheetLayout};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("sheet {0} has not been compiled")]
    NotCompiled(String),
    #[error("unresolved symbol {name} referenced by {sheet}")]
    Unresolved { sheet: String, name: String },
    #[error("native function {0} is not provided by the host")]
    MissingNative(String),
}

/// One sheet flattened into the image, keyed by its address for identity.
struct Placed<'a> {
    sheet: &'a Sheet,
    text_base: usize,
    data_base: usize,
}

fn place<'a>(sheet: &'a Sheet, placed: &mut Vec<Placed<'a>>, text_len: &mut usize, data_len: &mut usize) {
    placed.push(Placed {
        sheet,
        text_base: *text_len,
        data_base: *data_len,
    });
    *text_len += sheet.text.len();
    *data_len += sheet.data.len();

    for include in &sheet.includes {
        place(include, placed, text_len, data_len);
    }
}

fn find_placed<'a, 'b>(placed: &'b [Placed<'a>], sheet: &Sheet) -> &'b Placed<'a> {
    placed
        .iter()
        .find(|p| std::ptr::eq(p.sheet, sheet))
        .expect("every sheet in the tree was placed")
}

/// Search a sheet and then its includes depth-first for a link record
/// defining the given symbol.
fn resolve_symbol<'a, 'b>(
    placed: &'b [Placed<'a>],
    from: &Sheet,
    kind: LinkKind,
    name: &str,
) -> Option<(&'b Placed<'a>, usize)> {
    let own = find_placed(placed, from);
    for meta in &from.links {
        if meta.kind == kind && meta.name == name {
            if let Some(ptr) = meta.ptr {
                return Some((own, ptr));
            }
        }
    }

    for include in &from.includes {
        if let Some(found) = resolve_symbol(placed, include, kind, name) {
            return Some(found);
        }
    }

    None
}

/// Link a compiled sheet and its whole include tree into a runnable
/// program.
pub fn link(sheet: &Sheet, natives: &NativeRegistry) -> Result<Program, LinkError> {
    debug!(sheet = %sheet.file_name(), "linking");

    let mut placed = Vec::new();
    let mut text_len = 0;
    let mut data_len = 0;
    place(sheet, &mut placed, &mut text_len, &mut data_len);

    let mut program = Program::default();
    program.text.reserve(text_len);
    program.data.reserve(data_len);

    // Native indices follow the registry's registration order.
    let mut native_indices: FxHashMap<&str, usize> = FxHashMap::default();
    for (index, (name, native)) in natives.iter().enumerate() {
        native_indices.insert(name, index);
        program.natives.push(native.clone());
    }

    // Lay the sections out and sanity-check the tree.
    for p in &placed {
        if !p.sheet.is_compiled {
            return Err(LinkError::NotCompiled(p.sheet.file_name()));
        }

        for decl in &p.sheet.natives {
            if natives.get(&decl.definition.name).is_none() {
                return Err(LinkError::MissingNative(decl.definition.name.clone()));
            }
        }

        program.text.extend_from_slice(&p.sheet.text);
        program.data.extend_from_slice(&p.sheet.data);
        program.layouts.push(SheetLayout {
            path: p.sheet.file_path.clone(),
            text_base: p.text_base,
            text_size: p.sheet.text.len(),
            data_base: p.data_base,
            data_size: p.sheet.data.len(),
        });
    }

    // Resolve every relocation and patch the instruction's full immediate.
    for p in &placed {
        for link in &p.sheet.ins_links {
            let meta = &p.sheet.links[link.link];

            let value: DInt = match meta.kind {
                LinkKind::StringLiteral => {
                    let ptr = meta.ptr.ok_or_else(|| LinkError::Unresolved {
                        sheet: p.sheet.file_name(),
                        name: meta.name.clone(),
                    })?;
                    (p.data_base + ptr) as DInt
                }
                LinkKind::Variable | LinkKind::VariablePointer => {
                    let (owner, ptr) = match meta.ptr {
                        Some(ptr) => (p, ptr),
                        None => resolve_symbol(&placed, p.sheet, meta.kind, &meta.name)
                            .ok_or_else(|| LinkError::Unresolved {
                                sheet: p.sheet.file_name(),
                                name: meta.name.clone(),
                            })?,
                    };
                    (owner.data_base + ptr) as DInt
                }
                LinkKind::Function => {
                    let (owner, ptr) = match meta.ptr {
                        Some(ptr) => (p, ptr),
                        None => resolve_symbol(&placed, p.sheet, meta.kind, &meta.name)
                            .ok_or_else(|| LinkError::Unresolved {
                                sheet: p.sheet.file_name(),
                                name: meta.name.clone(),
                            })?,
                    };
                    (owner.text_base + ptr) as DInt
                }
                LinkKind::CFunction => {
                    *native_indices.get(meta.name.as_str()).ok_or_else(|| {
                        LinkError::MissingNative(meta.name.clone())
                    })? as DInt
                }
                // Data-cell fixups carry no instruction.
                LinkKind::VariableStringDefault => continue,
            };

            let at = p.text_base + link.ins + 1;
            let bytes = value.to_le_bytes();
            program.text[at..at + bytes.len()].copy_from_slice(&bytes);
        }
    }

    // String variables get a fresh owning string built from their default
    // literal, with the handle stored in the variable's cell.
    for p in &placed {
        for meta in &p.sheet.links {
            if meta.kind != LinkKind::VariableStringDefault {
                continue;
            }

            let literal_offset = meta.ptr.ok_or_else(|| LinkError::Unresolved {
                sheet: p.sheet.file_name(),
                name: meta.name.clone(),
            })?;

            let cell_offset = p
                .sheet
                .links
                .iter()
                .find(|m| {
                    matches!(m.kind, LinkKind::Variable | LinkKind::VariablePointer)
                        && m.name == meta.name
                })
                .and_then(|m| m.ptr)
                .ok_or_else(|| LinkError::Unresolved {
                    sheet: p.sheet.file_name(),
                    name: meta.name.clone(),
                })?;

            let literal = read_nul_terminated(&p.sheet.data, literal_offset);
            let handle = program.alloc_string(literal);
            program.write_word(p.data_base + cell_offset, handle as DInt);
        }
    }

    // Exported functions, preferring definitions nearer the root.
    for p in &placed {
        for function in &p.sheet.functions {
            let definition = &function.definition;
            let is_subroutine = definition.is_execution();

            let address = p
                .sheet
                .links
                .iter()
                .find(|m| m.kind == LinkKind::Function && m.name == definition.name)
                .and_then(|m| m.ptr)
                .map(|ptr| p.text_base + ptr);

            if let Some(address) = address {
                program
                    .functions
                    .entry(definition.name.clone())
                    .or_insert(FunctionEntry {
                        address,
                        num_args: definition.num_inputs() - usize::from(is_subroutine),
                        num_returns: definition.num_outputs() - usize::from(is_subroutine),
                    });
            }
        }
    }

    let root = &placed[0];
    program.main = root.text_base + root.sheet.main.unwrap_or(0);

    Ok(program)
}

fn read_nul_terminated(data: &[u8], offset: usize) -> String {
    let bytes = &data[offset..];
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
