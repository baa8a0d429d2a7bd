//! Ember CLI
//!
//! Runs a source file through the virtual machine. Exit codes: 0 on
//! success, 10 for compile errors, 11 for runtime errors, 12 for fatal
//! faults.

use clap::{CommandFactory, Parser as ClapParser};
use ember_runtime::{InterpretResult, Vm, VmOptions};
use std::path::PathBuf;
use std::process;

const EXIT_COMPILE_ERROR: i32 = 10;
const EXIT_RUNTIME_ERROR: i32 = 11;
const EXIT_FATAL: i32 = 12;

#[derive(ClapParser)]
#[command(name = "ember")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(disable_version_flag = true)]
#[command(about = "Ember interpreter - run .em programs", long_about = None)]
struct Cli {
    /// Source file to run
    file: Option<PathBuf>,

    /// Print version
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Dump compiled bytecode before running
    #[arg(short = 'd', long = "dump")]
    dump: bool,

    /// Trace the stack at each instruction
    #[arg(short = 'j', long = "trace")]
    trace: bool,

    /// Line-buffer standard output
    #[arg(short = 'b', long = "buffered")]
    buffered: bool,

    /// Minimum heap size in KiB before the first collection
    #[arg(short = 'g', long = "min-heap", value_name = "KIB")]
    min_heap: Option<usize>,
}

fn main() {
    let cli = Cli::parse();

    let Some(file) = cli.file else {
        let mut command = Cli::command();
        let _ = command.print_help();
        return;
    };

    let source = match std::fs::read_to_string(&file) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("could not read {}: {}", file.display(), err);
            process::exit(EXIT_COMPILE_ERROR);
        }
    };

    let options = VmOptions {
        trace: cli.trace,
        dump: cli.dump,
        buffered: cli.buffered,
        min_heap: cli.min_heap.map(|kib| kib * 1024),
    };
    let mut vm = Vm::with_options(options);
    let result = vm.interpret(&source, &file.to_string_lossy());
    vm.shutdown();

    match result {
        InterpretResult::Ok => {}
        InterpretResult::CompileError => process::exit(EXIT_COMPILE_ERROR),
        InterpretResult::RuntimeError => process::exit(EXIT_RUNTIME_ERROR),
        InterpretResult::Fatal => process::exit(EXIT_FATAL),
    }
}
