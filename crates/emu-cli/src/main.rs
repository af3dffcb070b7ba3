//! Command-line front end. Loads an ELF64 executable, wires up the concrete
//! ELF loader and `iced-x86` decoder `emu-kernel` treats as out-of-scope
//! collaborators, and drives the guest to completion.

mod decoder;
mod elf_loader;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use emu_core::CpuState;
use emu_kernel::{run_to_completion, EngineConfig, Process};

use decoder::IcedDisassembler;

/// Run a statically linked x86-64 Linux executable under emulation.
#[derive(Parser)]
#[command(name = "emu-cli", version, about)]
struct Args {
    /// Path to the guest ELF64 executable.
    program: String,

    /// Arguments passed to the guest program (argv[1..]).
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,

    /// Disable the JIT entirely; step every instruction through the
    /// interpreter. Equivalent to `--opt-level 0`.
    #[arg(long)]
    no_jit: bool,

    /// Disable chaining direct branches between compiled JIT blocks.
    #[arg(long)]
    no_chaining: bool,

    /// 0 = interpreter only, 1 = JIT without chaining, 2 = JIT with
    /// chaining (default).
    #[arg(long, default_value_t = 2)]
    opt_level: u8,

    /// Log every retired instruction at TRACE level.
    #[arg(long)]
    log_instructions: bool,

    /// Only start instruction logging after this many instructions have
    /// retired; useful to skip past known-good startup code.
    #[arg(long, default_value_t = 0)]
    log_instructions_after: u64,

    /// Log syscall entry/return at DEBUG level.
    #[arg(long)]
    log_syscalls: bool,

    /// Print JIT block/exit counters to stderr after the guest exits.
    #[arg(long)]
    profile: bool,

    /// Number of host worker threads driving guest threads. Defaults to
    /// the host's available parallelism.
    #[arg(long)]
    workers: Option<usize>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("emu-cli: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Everything past arg parsing, so the ELF-load/program-load errors (the
/// only failures here that happen before a `Process` exists, and so have
/// no guest thread to deliver an `Errno` to) can pick up file-path context
/// via `anyhow::Context` instead of just printing a bare errno.
fn run() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let mut config = EngineConfig {
        jit_enabled: !args.no_jit,
        jit_chaining: !args.no_chaining,
        log_instructions: args.log_instructions,
        log_instructions_after: args.log_instructions_after,
        log_syscalls: args.log_syscalls,
        opt_level: if args.no_jit { 0 } else { args.opt_level },
        profiling: args.profile,
        ..EngineConfig::default()
    };
    if let Some(workers) = args.workers {
        config.worker_threads = workers;
    }

    let mut argv = vec![args.program.clone()];
    argv.extend(args.args.iter().cloned());
    let envp: Vec<String> = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();

    let loader = elf_loader::loader();
    let initial_brk = loader
        .plan_brk(&args.program)
        .with_context(|| format!("failed to load {}", args.program))?;

    let process =
        Process::with_loader(std::process::id() as u64, initial_brk, argv.clone(), envp.clone(), config.effective_chaining(), loader);

    let image = {
        let mut mmu = process.mmu.write().unwrap();
        process
            .loader
            .load(&args.program, &argv, &envp, &mut mmu)
            .with_context(|| format!("failed to load {}", args.program))?
    };

    let cpu = CpuState::new(image.entry, image.stack_top);
    let disasm = Arc::new(IcedDisassembler);
    let status = run_to_completion(process, config, disasm, "main".to_string(), cpu);

    Ok(ExitCode::from((status & 0xFF) as u8))
}
