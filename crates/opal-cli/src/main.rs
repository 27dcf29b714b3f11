//! Opal VM command-line host
//!
//! Loads an encoded program, verifies it, runs it against the standard
//! streams, and optionally dumps post-mortem state through the engine's
//! inspection surface.

use anyhow::{Context, Result};
use clap::Parser;
use opal_bytecode::{verify_program, Program};
use opal_core::{Vm, VmOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "opal")]
#[command(about = "Opal virtual machine host", long_about = None)]
#[command(version)]
struct Cli {
    /// Encoded program file
    file: PathBuf,

    /// Dump the operand stack after execution
    #[arg(long)]
    dump_stack: bool,

    /// Dump non-nil globals after execution
    #[arg(long)]
    dump_globals: bool,

    /// Dump heap and collector statistics after execution
    #[arg(long)]
    gc_stats: bool,

    /// Skip static verification of the loaded program
    #[arg(long)]
    no_verify: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let bytes = std::fs::read(&cli.file)
        .with_context(|| format!("reading {}", cli.file.display()))?;
    let program = Program::decode(&bytes)
        .with_context(|| format!("decoding {}", cli.file.display()))?;
    if !cli.no_verify {
        verify_program(&program).context("verifying program")?;
    }

    let mut vm = Vm::with_options(program, VmOptions::default());
    let outcome = vm.execute();

    if let Err(err) = &outcome {
        eprintln!("runtime error: {err}");
    }
    if cli.dump_stack {
        vm.print_stack()?;
    }
    if cli.dump_globals {
        vm.print_globals()?;
    }
    if cli.gc_stats {
        vm.print_memory_stats()?;
    }

    if outcome.is_err() {
        std::process::exit(1);
    }
    Ok(())
}
