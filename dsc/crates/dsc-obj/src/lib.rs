//! dsc-obj - The object-file codec.
//!
//! A compiled sheet serialises to a self-describing byte stream. The header
//! is an ASCII `D` followed by `32` or `64`, recording the integer width
//! the stream was written with; reading with a mismatched width fails fast.
//! The body is a sequence of named sections, each introduced by an ASCII
//! tag and (for the variable-length ones) a length, terminated by a `.`
//! marker and a NUL. All integers are little-endian at the build's word
//! width.

use dsc_sem::{analysis::IncludeContext, InsToLink, LinkKind, LinkMeta, Sheet};
use dsc_util::{types, DUInt, DValue, NodeDefinition, SocketMeta, WORD_SIZE};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("not a valid object file")]
    BadMagic,
    #[error("object was written with {found}-bit words, this build uses {expected}-bit words")]
    WrongWordSize { expected: usize, found: usize },
    #[error("object file ends unexpectedly")]
    UnexpectedEnd,
    #[error("unknown section in object file")]
    UnknownSection,
    #[error("invalid link kind byte {0}")]
    BadLinkKind(u8),
    #[error("invalid data type byte {0}")]
    BadType(u8),
    #[error("could not load include {path}: {reason}")]
    Include { path: String, reason: String },
}

const WORD_BITS_TAG: &str = if WORD_SIZE == 4 { "32" } else { "64" };

/// The sentinel written for pointers that live in another sheet.
const EXTERNAL_PTR: DUInt = DUInt::MAX;

// ---------------------------------------------------------------------------
// Writing

struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn tag(&mut self, tag: &str) {
        self.out.extend_from_slice(tag.as_bytes());
    }

    fn uword(&mut self, value: DUInt) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    fn byte(&mut self, value: u8) {
        self.out.push(value);
    }

    fn cstr(&mut self, value: &str) {
        self.out.extend_from_slice(value.as_bytes());
        self.out.push(0);
    }

    fn bytes(&mut self, value: &[u8]) {
        self.out.extend_from_slice(value);
    }

    /// Write a section tag and a placeholder length, returning where the
    /// length lives so it can be patched once the section is written.
    fn begin_section(&mut self, tag: &str) -> usize {
        self.tag(tag);
        let at = self.out.len();
        self.uword(0);
        at
    }

    fn end_section(&mut self, length_at: usize) {
        let length = (self.out.len() - length_at - WORD_SIZE) as DUInt;
        self.out[length_at..length_at + WORD_SIZE].copy_from_slice(&length.to_le_bytes());
    }
}

fn write_socket_meta(writer: &mut Writer, meta: &SocketMeta) {
    writer.cstr(&meta.name);
    writer.cstr(&meta.description);
    writer.byte(meta.typ.bits());

    if meta.typ == types::TypeSet::from(dsc_util::DType::String) {
        writer.cstr(meta.default.as_str().unwrap_or(""));
    } else {
        writer.uword(meta.default.as_word() as DUInt);
    }
}

fn write_node_definition(writer: &mut Writer, definition: &NodeDefinition) {
    writer.cstr(&definition.name);
    writer.cstr(&definition.description);
    writer.uword(definition.start_output_index as DUInt);
    writer.uword(definition.sockets.len() as DUInt);

    for socket in &definition.sockets {
        write_socket_meta(writer, socket);
    }
}

/// Serialise a compiled sheet into the contents of its object file.
pub fn generate(sheet: &Sheet) -> Vec<u8> {
    let mut writer = Writer { out: Vec::new() };

    writer.tag("D");
    writer.tag(WORD_BITS_TAG);

    // .text
    let at = writer.begin_section(".text");
    writer.bytes(&sheet.text);
    writer.end_section(at);

    // .main carries a single fixed-width value.
    writer.tag(".main");
    writer.uword(sheet.main.unwrap_or(0) as DUInt);

    // .data
    let at = writer.begin_section(".data");
    writer.bytes(&sheet.data);
    writer.end_section(at);

    // .lmeta
    let at = writer.begin_section(".lmeta");
    for meta in &sheet.links {
        writer.byte(meta.kind as u8);
        writer.cstr(&meta.name);
        writer.uword(meta.ptr.map(|p| p as DUInt).unwrap_or(EXTERNAL_PTR));
    }
    writer.end_section(at);

    // .link
    let at = writer.begin_section(".link");
    for link in &sheet.ins_links {
        writer.uword(link.ins as DUInt);
        writer.uword(link.link as DUInt);
    }
    writer.end_section(at);

    // .func
    let at = writer.begin_section(".func");
    for function in &sheet.functions {
        let meta_index = sheet
            .links
            .iter()
            .position(|m| m.kind == LinkKind::Function && m.name == function.definition.name)
            .unwrap_or(0);
        writer.uword(meta_index as DUInt);
        write_node_definition(&mut writer, &function.definition);
    }
    writer.end_section(at);

    // .var
    let at = writer.begin_section(".var");
    for variable in &sheet.variables {
        let meta_index = sheet
            .links
            .iter()
            .position(|m| {
                matches!(m.kind, LinkKind::Variable | LinkKind::VariablePointer)
                    && m.name == variable.meta.name
            })
            .unwrap_or(0);
        writer.uword(meta_index as DUInt);
        write_socket_meta(&mut writer, &variable.meta);
    }
    writer.end_section(at);

    // .incl
    let at = writer.begin_section(".incl");
    for include in &sheet.includes {
        let path = include
            .include_path
            .clone()
            .unwrap_or_else(|| include.file_name());
        writer.cstr(&path);
    }
    writer.end_section(at);

    // .c: required native-function signatures. Written empty; the link
    // records already imply the requirements.
    let at = writer.begin_section(".c");
    writer.end_section(at);

    writer.tag(".");
    writer.byte(0);

    writer.out
}

// ---------------------------------------------------------------------------
// Reading

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ObjectError> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + n)
            .ok_or(ObjectError::UnexpectedEnd)?;
        self.pos += n;
        Ok(slice)
    }

    fn peek(&self, n: usize) -> Option<&'a [u8]> {
        self.bytes.get(self.pos..self.pos + n)
    }

    fn eat_tag(&mut self, tag: &str) -> bool {
        if self.peek(tag.len()) == Some(tag.as_bytes()) {
            self.pos += tag.len();
            true
        } else {
            false
        }
    }

    fn uword(&mut self) -> Result<DUInt, ObjectError> {
        let mut bytes = [0u8; WORD_SIZE];
        bytes.copy_from_slice(self.take(WORD_SIZE)?);
        Ok(DUInt::from_le_bytes(bytes))
    }

    fn byte(&mut self) -> Result<u8, ObjectError> {
        Ok(self.take(1)?[0])
    }

    fn cstr(&mut self) -> Result<String, ObjectError> {
        let rest = self.bytes.get(self.pos..).ok_or(ObjectError::UnexpectedEnd)?;
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ObjectError::UnexpectedEnd)?;
        let value = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(value)
    }
}

fn read_socket_meta(reader: &mut Reader) -> Result<SocketMeta, ObjectError> {
    let name = reader.cstr()?;
    let description = reader.cstr()?;

    let type_byte = reader.byte()?;
    let typ = types::from_bits(type_byte).ok_or(ObjectError::BadType(type_byte))?;

    let default = if typ == types::TypeSet::from(dsc_util::DType::String) {
        DValue::Str(reader.cstr()?)
    } else if typ == types::TypeSet::from(dsc_util::DType::Bool) {
        DValue::Bool(reader.uword()? != 0)
    } else if typ == types::TypeSet::from(dsc_util::DType::Float) {
        DValue::Float(dsc_util::word_to_float(reader.uword()? as dsc_util::DInt))
    } else {
        DValue::Int(reader.uword()? as dsc_util::DInt)
    };

    Ok(SocketMeta {
        name,
        description,
        typ,
        default,
    })
}

fn read_node_definition(reader: &mut Reader) -> Result<NodeDefinition, ObjectError> {
    let name = reader.cstr()?;
    let description = reader.cstr()?;
    let start_output_index = reader.uword()? as usize;
    let num_sockets = reader.uword()? as usize;

    let mut sockets = Vec::with_capacity(num_sockets.min(256));
    for _ in 0..num_sockets {
        sockets.push(read_socket_meta(reader)?);
    }

    Ok(NodeDefinition::new(
        name,
        description,
        sockets,
        start_output_index,
    ))
}

/// Deserialise an object file back into a sheet, loading its includes and
/// leaving it ready to be re-linked.
pub fn load(
    bytes: &[u8],
    file_path: &Path,
    includes: &IncludeContext,
) -> Result<Sheet, ObjectError> {
    let mut reader = Reader { bytes, pos: 0 };

    if !reader.eat_tag("D") {
        return Err(ObjectError::BadMagic);
    }
    if !reader.eat_tag(WORD_BITS_TAG) {
        let found = if reader.eat_tag("32") {
            32
        } else if reader.eat_tag("64") {
            64
        } else {
            return Err(ObjectError::BadMagic);
        };
        return Err(ObjectError::WrongWordSize {
            expected: WORD_SIZE * 8,
            found,
        });
    }

    let mut sheet = Sheet::new(file_path);
    sheet.is_compiled = true;

    loop {
        if reader.eat_tag(".text") {
            let size = reader.uword()? as usize;
            sheet.text = reader.take(size)?.to_vec();
        } else if reader.eat_tag(".main") {
            sheet.main = Some(reader.uword()? as usize);
        } else if reader.eat_tag(".data") {
            let size = reader.uword()? as usize;
            sheet.data = reader.take(size)?.to_vec();
        } else if reader.eat_tag(".lmeta") {
            let size = reader.uword()? as usize;
            let end = reader.pos + size;
            while reader.pos < end {
                let kind_byte = reader.byte()?;
                let kind =
                    LinkKind::from_byte(kind_byte).ok_or(ObjectError::BadLinkKind(kind_byte))?;
                let name = reader.cstr()?;
                let ptr = reader.uword()?;

                let mut meta = LinkMeta::new(kind, name);
                if ptr != EXTERNAL_PTR {
                    meta.ptr = Some(ptr as usize);
                }
                sheet.links.push(meta);
            }
        } else if reader.eat_tag(".link") {
            let size = reader.uword()? as usize;
            let end = reader.pos + size;
            while reader.pos < end {
                let ins = reader.uword()? as usize;
                let link = reader.uword()? as usize;
                sheet.ins_links.push(InsToLink { ins, link });
            }
        } else if reader.eat_tag(".func") {
            let size = reader.uword()? as usize;
            let end = reader.pos + size;
            while reader.pos < end {
                let _meta_index = reader.uword()?;
                let definition = read_node_definition(&mut reader)?;
                sheet.add_function(definition);
            }
        } else if reader.eat_tag(".var") {
            let size = reader.uword()? as usize;
            let end = reader.pos + size;
            while reader.pos < end {
                let _meta_index = reader.uword()?;
                let meta = read_socket_meta(&mut reader)?;
                sheet.add_variable(meta);
            }
        } else if reader.eat_tag(".incl") {
            let size = reader.uword()? as usize;
            let end = reader.pos + size;
            while reader.pos < end {
                let path = reader.cstr()?;
                let resolved = sheet.directory().join(&path);

                let loader = includes.loader.ok_or_else(|| ObjectError::Include {
                    path: path.clone(),
                    reason: "includes are not available here".to_string(),
                })?;

                let mut included = loader(&resolved, &includes.priors).map_err(|reason| {
                    ObjectError::Include {
                        path: path.clone(),
                        reason,
                    }
                })?;
                included.include_path = Some(path);
                sheet.add_include(included);
            }
        } else if reader.eat_tag(".c") {
            let size = reader.uword()? as usize;
            let end = reader.pos + size;
            // Each requirement is a name followed by NUL-terminated input
            // and output type lists. Satisfaction is checked at link time
            // against the host registry.
            while reader.pos < end {
                let name = reader.cstr()?;
                let mut sockets = Vec::new();
                let mut start_output_index = 0;

                loop {
                    let byte = reader.byte()?;
                    if byte == 0 {
                        break;
                    }
                    let typ = types::from_bits(byte).ok_or(ObjectError::BadType(byte))?;
                    sockets.push(SocketMeta::new("", "", typ, DValue::Int(0)));
                    start_output_index += 1;
                }
                loop {
                    let byte = reader.byte()?;
                    if byte == 0 {
                        break;
                    }
                    let typ = types::from_bits(byte).ok_or(ObjectError::BadType(byte))?;
                    sockets.push(SocketMeta::new("", "", typ, DValue::Int(0)));
                }

                sheet.add_native(NodeDefinition::new(name, "", sockets, start_output_index));
            }
        } else if reader.eat_tag(".") {
            break;
        } else {
            return Err(ObjectError::UnknownSection);
        }
    }

    Ok(sheet)
}

/// Does the byte stream look like an object file of this build's width?
pub fn is_object(bytes: &[u8]) -> bool {
    bytes.starts_with(b"D32") || bytes.starts_with(b"D64")
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsc_lex::lex;
    use dsc_par::parse;
    use dsc_util::Handler;

    fn compile_source(source: &str) -> Sheet {
        let handler = Handler::new();
        let tokens = lex(source, "test.dc", &handler);
        let result = parse(&tokens, "test.dc", &handler);
        assert!(result.success);

        let mut sheet = Sheet::new("test.dc");
        dsc_sem::scan(
            &mut sheet,
            &result.tree,
            &handler,
            &IncludeContext::default(),
        );
        assert!(!handler.has_errors(), "{:?}", handler.diagnostics());

        dsc_gen::compile(&mut sheet, false);
        dsc_gen::optimize(&mut sheet);
        sheet
    }

    fn round_trip(sheet: &Sheet) -> Sheet {
        let bytes = generate(sheet);
        load(&bytes, Path::new("test.dco"), &IncludeContext::default()).expect("loads")
    }

    #[test]
    fn test_header() {
        let sheet = compile_source("Start~#1; Print(#1, 'hi');");
        let bytes = generate(&sheet);
        assert!(bytes.starts_with(b"D"));
        assert!(is_object(&bytes));
        assert_eq!(*bytes.last().unwrap(), 0);
    }

    #[test]
    fn test_round_trip_preserves_sections() {
        let sheet = compile_source(
            "[Variable(count, Integer, 5)]\n\
             Start~#1\n\
             Set(count, #1, 12)~#2\n\
             count~#3\n\
             Print(#2, #3)\n",
        );

        let loaded = round_trip(&sheet);

        assert!(loaded.is_compiled);
        assert_eq!(loaded.text, sheet.text);
        assert_eq!(loaded.data, sheet.data);
        assert_eq!(loaded.links, sheet.links);
        assert_eq!(loaded.ins_links, sheet.ins_links);
        assert_eq!(loaded.main, sheet.main);
        assert_eq!(loaded.variables.len(), sheet.variables.len());
        assert_eq!(loaded.variables[0].meta, sheet.variables[0].meta);
    }

    #[test]
    fn test_round_trip_preserves_functions() {
        let sheet = compile_source(
            "[Function(Double)]\n\
             [FunctionInput(Double, value, Integer, 0)]\n\
             [FunctionOutput(Double, doubled, Integer)]\n\
             Define(Double)~#1\n\
             Multiply(#1, 2)~#2\n\
             Return(Double, #2)\n\
             Start~#10\n\
             Double(21)~#11\n\
             Print(#10, #11)\n",
        );

        let loaded = round_trip(&sheet);

        assert_eq!(loaded.functions.len(), 1);
        assert_eq!(
            *loaded.functions[0].definition,
            *sheet.functions[0].definition
        );
        // The synthesised Define and Return definitions are rebuilt too.
        assert_eq!(
            *loaded.functions[0].define_definition,
            *sheet.functions[0].define_definition
        );
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let result = load(b"ELF", Path::new("x"), &IncludeContext::default());
        assert!(matches!(result, Err(ObjectError::BadMagic)));
    }

    #[test]
    fn test_wrong_width_is_rejected() {
        let other = if WORD_BITS_TAG == "64" { b"D32" } else { b"D64" };
        let result = load(other, Path::new("x"), &IncludeContext::default());
        assert!(matches!(result, Err(ObjectError::WrongWordSize { .. })));
    }

    #[test]
    fn test_truncated_object_is_rejected() {
        let sheet = compile_source("Start~#1; Print(#1, 'hi');");
        let bytes = generate(&sheet);
        let result = load(
            &bytes[..bytes.len() / 2],
            Path::new("x"),
            &IncludeContext::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_float_default_round_trips() {
        let sheet = compile_source(
            "[Variable(ratio, Float, 2.5)]\nStart~#1\nratio~#2\nPrint(#1, #2)\n",
        );
        let loaded = round_trip(&sheet);
        assert_eq!(loaded.variables[0].meta.default, DValue::Float(2.5));
    }
}
