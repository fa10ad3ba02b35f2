// File: src/main.rs
//
// Main entry point for the Moss interpreter.
// Runs a script file when given a path, otherwise starts the interactive
// REPL. Exit codes follow the usual sysexits split: 65 for compile errors,
// 70 for runtime errors, 74 for I/O failures.

mod bytecode;
mod compiler;
mod gc;
mod lexer;
mod object;
mod repl;
mod value;
mod vm;

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::Parser;

use crate::repl::Repl;
use crate::vm::{InterpretResult, Vm};

#[derive(Parser)]
#[command(
    name = "moss",
    about = "Moss: a small class-based scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Script to run; omit to start the interactive REPL
    file: Option<PathBuf>,

    /// Dump compiled bytecode instead of running
    #[arg(long)]
    disassemble: bool,

    /// Trace each instruction to stderr while executing
    #[arg(long)]
    trace: bool,
}

fn main() {
    let cli = Cli::parse();

    match cli.file {
        Some(path) => {
            let source = match fs::read_to_string(&path) {
                Ok(source) => source,
                Err(err) => {
                    eprintln!("Could not read \"{}\": {}.", path.display(), err);
                    process::exit(74);
                }
            };

            let mut vm = Vm::new();
            vm.trace = cli.trace;
            let result = if cli.disassemble {
                vm.dump_bytecode(&source)
            } else {
                vm.interpret(&source)
            };
            match result {
                InterpretResult::Ok => {}
                InterpretResult::CompileError => process::exit(65),
                InterpretResult::RuntimeError => process::exit(70),
            }
        }
        None => {
            let mut repl = match Repl::new() {
                Ok(repl) => repl,
                Err(err) => {
                    eprintln!("Failed to start the REPL: {}", err);
                    process::exit(74);
                }
            };
            if let Err(err) = repl.run() {
                eprintln!("REPL error: {}", err);
                process::exit(74);
            }
        }
    }
}
