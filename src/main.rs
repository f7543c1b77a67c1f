use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use orus::bytecode::disasm::disassemble_program;
use orus::diagnostic::{Diagnostic, ansi::AnsiRenderer, json};
use orus::optimizer::OptimizerStats;
use orus::{CompiledProgram, ObjectHeap, PeepholeOptimizer, Vm, VmConfig, VmIo, assemble};

const EXIT_ASSEMBLY: u8 = 1;
const EXIT_RUNTIME: u8 = 2;

#[derive(Parser)]
#[command(name = "orus", version, about = "Register-based bytecode VM")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble and run a program
    Run {
        file: PathBuf,
        /// Run the peephole optimizer before execution
        #[arg(long)]
        optimize: bool,
        /// Print execution, GC and optimizer statistics as JSON on stderr
        #[arg(long)]
        stats: bool,
        /// Render diagnostics as JSON
        #[arg(long)]
        json: bool,
    },
    /// Assemble a program and print its disassembly
    Disasm {
        file: PathBuf,
        #[arg(long)]
        optimize: bool,
    },
}

struct Reporter {
    json: bool,
    color: bool,
}

impl Reporter {
    fn emit(&self, d: &Diagnostic) {
        if self.json {
            eprintln!("{}", json::render(d));
        } else {
            eprint!("{}", AnsiRenderer { use_color: self.color }.render(d));
        }
    }
}

/// Assembles, optionally optimizes, then resolves jumps.
fn build(
    path: &Path,
    optimize: bool,
    heap: &mut ObjectHeap,
    reporter: &Reporter,
) -> Result<(String, CompiledProgram, OptimizerStats), ExitCode> {
    let source = std::fs::read_to_string(path).map_err(|e| {
        reporter.emit(&Diagnostic::error(format!("cannot read {}: {e}", path.display())));
        ExitCode::from(EXIT_ASSEMBLY)
    })?;
    let mut program = assemble(&source, heap).map_err(|e| {
        reporter.emit(&Diagnostic::from(&e).with_source(source.as_str()));
        ExitCode::from(EXIT_ASSEMBLY)
    })?;

    let mut optimizer = PeepholeOptimizer::new();
    if optimize {
        for chunk in &mut program.chunks {
            if let Err(e) = optimizer.optimize(&mut chunk.code) {
                reporter.emit(&Diagnostic::error(e.to_string()).with_note(format!("in function '{}'", chunk.name)));
                return Err(ExitCode::from(EXIT_ASSEMBLY));
            }
        }
    }
    program.resolve_jumps().map_err(|e| {
        reporter.emit(&Diagnostic::error(e.to_string()));
        ExitCode::from(EXIT_ASSEMBLY)
    })?;
    Ok((source, program, optimizer.stats()))
}

fn run_file(path: &Path, optimize: bool, stats: bool, reporter: &Reporter) -> ExitCode {
    let config = match VmConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            reporter.emit(&Diagnostic::error(e.to_string()));
            return ExitCode::from(EXIT_ASSEMBLY);
        }
    };
    let mut heap = ObjectHeap::new();
    let (source, program, opt_stats) = match build(path, optimize, &mut heap, reporter) {
        Ok(built) => built,
        Err(code) => return code,
    };

    let mut vm = Vm::new(&program, heap, config, VmIo::stdio());
    let result = vm.run();
    if stats {
        let report = serde_json::json!({
            "exec": vm.stats(),
            "gc": vm.gc_stats(),
            "optimizer": opt_stats,
        });
        eprintln!("{report}");
    }
    match result {
        Ok(value) => {
            if !value.is_void() {
                println!("{}", vm.format_value(value));
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            reporter.emit(&Diagnostic::for_runtime(&e, &source).with_listing(&program, vm.heap()));
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

fn disasm_file(path: &Path, optimize: bool, reporter: &Reporter) -> ExitCode {
    let mut heap = ObjectHeap::new();
    match build(path, optimize, &mut heap, reporter) {
        Ok((_, program, _)) => {
            print!("{}", disassemble_program(&program, &heap));
            ExitCode::SUCCESS
        }
        Err(code) => code,
    }
}

fn main() -> ExitCode {
    if let Ok(filter) = EnvFilter::try_from_env("ORUS_LOG") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }

    let cli = Cli::parse();
    let color = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    match cli.command {
        Commands::Run { file, optimize, stats, json } => run_file(&file, optimize, stats, &Reporter { json, color }),
        Commands::Disasm { file, optimize } => disasm_file(&file, optimize, &Reporter { json: false, color }),
    }
}
