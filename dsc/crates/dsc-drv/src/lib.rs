//! dsc-drv - The compiler driver.
//!
//! Orchestrates the pipeline (lex, parse, semantic analysis, code
//! generation, optimization, linking) and exposes the entry points the CLI
//! and embedding hosts consume: loading sheets from source or object form,
//! running them, calling exported functions, and debugging.

pub mod debug;
pub mod dump;

use dsc_gen::LinkError;
use dsc_sem::{IncludeContext, Sheet};
use dsc_util::Handler;
use dsc_vm::{NativeRegistry, Program, Value, Vm};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug as trace_debug;

/// Options threaded through a compilation.
#[derive(Clone, Debug, Default)]
pub struct CompileOptions {
    /// Build debug information and skip optimization.
    pub debug: bool,
    /// The chain of sheets currently being loaded, so circular inclusion
    /// fails with a diagnostic instead of recursing.
    pub priors: Vec<PathBuf>,
}

impl CompileOptions {
    pub fn debug() -> Self {
        CompileOptions {
            debug: true,
            ..CompileOptions::default()
        }
    }
}

/// Compile a source string into a sheet.
///
/// Runs every stage the diagnostics allow: a stage is skipped iff its
/// predecessor produced at least one error. The returned sheet's
/// `has_errors` mirrors the handler; callers decide how to report.
pub fn load_string(
    source: &str,
    file: &str,
    options: &CompileOptions,
    natives: &NativeRegistry,
    handler: &Handler,
) -> Sheet {
    trace_debug!(sheet = %file, "compiling");

    let mut sheet = Sheet::new(file);

    // The host's native functions are visible to name resolution.
    for (_, native) in natives.iter() {
        sheet.add_native(native.definition.clone());
    }

    let tokens = dsc_lex::lex(source, file, handler);
    let result = dsc_par::parse(&tokens, file, handler);

    if result.success && !handler.has_errors() {
        let mut priors = options.priors.clone();
        priors.push(PathBuf::from(file));

        let loader = |path: &Path, priors: &[PathBuf]| -> Result<Sheet, String> {
            let options = CompileOptions {
                debug: options.debug,
                priors: priors.to_vec(),
            };
            load_file(path, &options, natives, handler)
        };

        let includes = IncludeContext {
            priors,
            loader: Some(&loader),
        };

        dsc_sem::scan(&mut sheet, &result.tree, handler, &includes);

        if !handler.has_errors() {
            dsc_gen::compile(&mut sheet, options.debug);

            // Debug builds keep the generated text intact so the
            // instruction-to-graph tables stay valid.
            if !options.debug {
                dsc_gen::optimize(&mut sheet);
            }
        }
    }

    sheet.has_errors = handler.has_errors();
    sheet
}

/// Compile a source file into a sheet.
pub fn load_source_file(
    path: &Path,
    options: &CompileOptions,
    natives: &NativeRegistry,
    handler: &Handler,
) -> Result<Sheet, String> {
    let source =
        std::fs::read_to_string(path).map_err(|e| format!("could not read file: {}", e))?;
    Ok(load_string(
        &source,
        &path.display().to_string(),
        options,
        natives,
        handler,
    ))
}

/// Load a compiled sheet from an object file.
///
/// The sheet still needs linking before it can run; native requirements are
/// verified against the registry here.
pub fn load_object_file(
    path: &Path,
    options: &CompileOptions,
    natives: &NativeRegistry,
    handler: &Handler,
) -> Result<Sheet, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("could not read file: {}", e))?;

    let mut priors = options.priors.clone();
    priors.push(path.to_path_buf());

    let loader = |path: &Path, priors: &[PathBuf]| -> Result<Sheet, String> {
        let options = CompileOptions {
            debug: options.debug,
            priors: priors.to_vec(),
        };
        load_file(path, &options, natives, handler)
    };

    let includes = IncludeContext {
        priors,
        loader: Some(&loader),
    };

    let mut sheet = dsc_obj::load(&bytes, path, &includes).map_err(|e| e.to_string())?;

    for decl in &sheet.natives {
        if natives.get(&decl.definition.name).is_none() {
            handler.error(
                &sheet.file_name(),
                0,
                format!(
                    "Native function {} required by the object is not provided",
                    decl.definition.name
                ),
            );
        }
    }

    sheet.has_errors = handler.has_errors();
    Ok(sheet)
}

/// Does the file look like an object file?
pub fn is_object_file(path: &Path) -> bool {
    let mut magic = [0u8; 3];
    match std::fs::File::open(path) {
        Ok(mut file) => {
            use std::io::Read;
            file.read_exact(&mut magic).is_ok() && dsc_obj::is_object(&magic)
        }
        Err(_) => false,
    }
}

/// Load a sheet from a file, sniffing whether it is source or object form.
pub fn load_file(
    path: &Path,
    options: &CompileOptions,
    natives: &NativeRegistry,
    handler: &Handler,
) -> Result<Sheet, String> {
    if is_object_file(path) {
        load_object_file(path, options, natives, handler)
    } else {
        load_source_file(path, options, natives, handler)
    }
}

/// Compile a source string and serialise it to object form. Returns `None`
/// if there were compile errors.
pub fn compile_string(
    source: &str,
    file: &str,
    natives: &NativeRegistry,
    handler: &Handler,
) -> Option<Vec<u8>> {
    let sheet = load_string(source, file, &CompileOptions::default(), natives, handler);
    if sheet.has_errors {
        return None;
    }
    Some(dsc_obj::generate(&sheet))
}

/// Compile a source file to an object file.
pub fn compile_file(
    input: &Path,
    output: &Path,
    natives: &NativeRegistry,
    handler: &Handler,
) -> Result<bool, String> {
    let source =
        std::fs::read_to_string(input).map_err(|e| format!("could not read file: {}", e))?;

    match compile_string(&source, &input.display().to_string(), natives, handler) {
        Some(bytes) => {
            std::fs::write(output, bytes).map_err(|e| format!("could not write file: {}", e))?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Link a sheet tree into a runnable program.
pub fn link_sheet(sheet: &Sheet, natives: &NativeRegistry) -> Result<Program, LinkError> {
    dsc_gen::link(sheet, natives)
}

/// Link and run a sheet from its Start node, writing syscall output to the
/// given writer. Returns whether the run finished without runtime errors.
pub fn run_sheet_with_output(
    sheet: &Sheet,
    natives: &NativeRegistry,
    output: Box<dyn Write>,
) -> Result<bool, LinkError> {
    let mut program = link_sheet(sheet, natives)?;
    let mut vm = Vm::with_output(output);
    let main = program.main;
    Ok(vm.run(&mut program, main))
}

/// Link and run a sheet from its Start node with output on stdout.
pub fn run_sheet(sheet: &Sheet, natives: &NativeRegistry) -> Result<bool, LinkError> {
    run_sheet_with_output(sheet, natives, Box::new(std::io::stdout()))
}

/// Errors from calling an exported function by name.
#[derive(Debug)]
pub enum CallError {
    Link(LinkError),
    UnknownFunction(String),
    WrongArgumentCount { expected: usize, got: usize },
    Runtime,
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Link(e) => write!(f, "{}", e),
            CallError::UnknownFunction(name) => write!(f, "unknown function {}", name),
            CallError::WrongArgumentCount { expected, got } => {
                write!(f, "expected {} arguments, got {}", expected, got)
            }
            CallError::Runtime => write!(f, "runtime error"),
        }
    }
}

impl std::error::Error for CallError {}

/// Link a sheet tree and call one of its functions or subroutines by name,
/// returning the values it left on the stack, first return value first.
pub fn run_function(
    sheet: &Sheet,
    natives: &NativeRegistry,
    name: &str,
    args: &[Value],
) -> Result<Vec<Value>, CallError> {
    let mut program = link_sheet(sheet, natives).map_err(CallError::Link)?;

    let entry = *program
        .functions
        .get(name)
        .ok_or_else(|| CallError::UnknownFunction(name.to_string()))?;

    if entry.num_args != args.len() {
        return Err(CallError::WrongArgumentCount {
            expected: entry.num_args,
            got: args.len(),
        });
    }

    let mut vm = Vm::new();
    for arg in args {
        vm.push(arg.clone());
    }

    if !vm.run(&mut program, entry.address) {
        return Err(CallError::Runtime);
    }

    // The base-frame return leaves the return values at the top of the
    // stack, first value on top.
    let mut values = Vec::with_capacity(entry.num_returns);
    for index in 0..entry.num_returns {
        values.push(vm.get(-(index as dsc_util::DInt)));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_string_reports_lex_and_parse_errors() {
        let handler = Handler::new();
        let sheet = load_string(
            "Print(#1, 'unterminated\n",
            "bad.dc",
            &CompileOptions::default(),
            &NativeRegistry::new(),
            &handler,
        );
        assert!(sheet.has_errors);
        assert!(handler.has_errors());
        assert!(!sheet.is_compiled);
    }

    #[test]
    fn test_semantic_errors_skip_code_generation() {
        let handler = Handler::new();
        let sheet = load_string(
            "Start~#1\nBogus(#1)\n",
            "bad.dc",
            &CompileOptions::default(),
            &NativeRegistry::new(),
            &handler,
        );
        assert!(sheet.has_errors);
        assert!(!sheet.is_compiled);
        assert!(sheet.text.is_empty());
    }

    #[test]
    fn test_clean_compile_is_optimized() {
        let handler = Handler::new();
        let sheet = load_string(
            "Start~#1; Print(#1, 'hi');",
            "ok.dc",
            &CompileOptions::default(),
            &NativeRegistry::new(),
            &handler,
        );
        assert!(!sheet.has_errors);
        assert!(sheet.is_compiled);
        assert!(sheet.debug_info.is_none());
    }

    #[test]
    fn test_debug_compile_keeps_debug_info() {
        let handler = Handler::new();
        let sheet = load_string(
            "Start~#1; Print(#1, 'hi');",
            "ok.dc",
            &CompileOptions::debug(),
            &NativeRegistry::new(),
            &handler,
        );
        assert!(sheet.debug_info.is_some());
        assert!(!sheet.debug_info.as_ref().unwrap().node_info.is_empty());
    }
}
