//! The `dsc` command line.
//!
//! Compile a Decision source file to an object file, run a source or object
//! file, dump disassembly, or run under the debugger printing every event.

use anyhow::{bail, Context, Result};
use clap::Parser;
use dsc_drv::debug::DebugSession;
use dsc_drv::{compile_file, load_file, run_sheet, CompileOptions};
use dsc_util::Handler;
use dsc_vm::NativeRegistry;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// The Decision compiler and virtual machine.
#[derive(Parser, Debug)]
#[command(name = "dsc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Compile and run Decision sheets", long_about = None)]
struct Cli {
    /// The source or object file to work on.
    file: PathBuf,

    /// Compile to an object file instead of running.
    #[arg(short, long)]
    compile: bool,

    /// Where to write the object file (defaults to the input with a .dco
    /// extension).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Dump the compiled sheet's sections instead of running.
    #[arg(short, long)]
    disassemble: bool,

    /// Compile with debug information and run under the debugger, printing
    /// every event.
    #[arg(short = 'D', long)]
    debug: bool,

    /// Increase logging verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {:#}", error);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();

    let natives = NativeRegistry::new();
    let handler = Handler::new();

    if cli.compile {
        let output = cli
            .output
            .clone()
            .unwrap_or_else(|| cli.file.with_extension("dco"));

        let ok = compile_file(&cli.file, &output, &natives, &handler)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("compiling {}", cli.file.display()))?;

        handler.report(&mut std::io::stderr());
        if !ok {
            bail!("compilation failed");
        }
        return Ok(());
    }

    let options = if cli.debug {
        CompileOptions::debug()
    } else {
        CompileOptions::default()
    };

    let sheet = load_file(&cli.file, &options, &natives, &handler)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("loading {}", cli.file.display()))?;

    handler.report(&mut std::io::stderr());
    if sheet.has_errors {
        bail!("compilation failed");
    }

    if cli.disassemble {
        print!("{}", dsc_drv::dump::dump_sheet(&sheet));
        return Ok(());
    }

    if cli.debug {
        let mut session = DebugSession::new(&sheet, &natives, Box::new(std::io::stdout()))
            .context("linking")?;

        session.hooks.on_node_activated = Some(Box::new(|node| {
            println!("Node {} activated!", node);
        }));
        session.hooks.on_execution_wire = Some(Box::new(|wire| {
            println!(
                "Execution wire activated! ({}, {}) -> ({}, {})",
                wire.from.node, wire.from.socket, wire.to.node, wire.to.socket
            );
        }));
        session.hooks.on_wire_value = Some(Box::new(|wire, value| {
            println!(
                "Value {:?} transferred from ({}, {}) to ({}, {})!",
                value, wire.from.node, wire.from.socket, wire.to.node, wire.to.socket
            );
        }));

        while !session.is_halted() {
            session.continue_run();
        }
        return Ok(());
    }

    let ok = run_sheet(&sheet, &natives).context("linking")?;
    if !ok {
        bail!("runtime error");
    }

    Ok(())
}
