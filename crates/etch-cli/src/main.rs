//! The `etch` command-line driver.
//!
//! Compiles and runs Etch programs. The lexer/parser ships separately; this
//! binary therefore runs compiled `.etcx` artifacts directly and routes
//! `.etch` sources through whatever frontend the build links in (none by
//! default, which reports a compile diagnostic).
//!
//! Exit codes: 0 success, 1 compile/runtime error, 2 internal error.

use anyhow::Result;
use clap::Parser;
use etch_engine::bytecode;
use etch_engine::{CValue, Context, ContextOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "etch")]
#[command(about = "Etch language toolchain", version)]
struct Cli {
    /// Compile and run the given program (default when a file is passed)
    #[arg(long)]
    run: bool,

    /// Backend for --run / --gen: "vm" (default) or "c"
    #[arg(long, default_value = "vm")]
    gen: String,

    /// Chatty compilation and GC reporting
    #[arg(long, short)]
    verbose: bool,

    /// Enable the optimization passes (inlining, cleanup)
    #[arg(long)]
    release: bool,

    /// Run every compiled program under a directory as a test suite
    #[arg(long, value_name = "DIR")]
    test: Option<PathBuf>,

    /// Run a directory as a timing suite
    #[arg(long, value_name = "DIR")]
    perf: Option<PathBuf>,

    /// Run one program under the stdio DAP debug server
    #[arg(long, value_name = "FILE")]
    debug_server: Option<PathBuf>,

    /// Print the disassembly of a compiled program
    #[arg(long, value_name = "FILE")]
    dump_bytecode: Option<PathBuf>,

    /// Program file (.etch source or .etcx bytecode)
    file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("internal error: {e}");
            ExitCode::from(2)
        }
    }
}

fn dispatch(cli: &Cli) -> Result<ExitCode> {
    if cli.gen != "vm" && cli.gen != "c" {
        eprintln!("error: unknown backend '{}'", cli.gen);
        return Ok(ExitCode::from(1));
    }
    if cli.gen == "c" {
        // The C emitter is a separate tool; the core only drives the VM.
        eprintln!("error: the C backend is not linked into this build");
        return Ok(ExitCode::from(1));
    }

    if let Some(path) = &cli.dump_bytecode {
        return dump_bytecode(cli, path);
    }
    if let Some(dir) = &cli.test {
        return run_suite(cli, dir, false);
    }
    if let Some(dir) = &cli.perf {
        return run_suite(cli, dir, true);
    }
    if let Some(path) = &cli.debug_server {
        return run_debug_server(cli, path);
    }
    match &cli.file {
        Some(path) => run_file(cli, path),
        None if cli.run => {
            eprintln!("error: --run needs a program file");
            Ok(ExitCode::from(1))
        }
        None => {
            eprintln!("error: no input file (try --help)");
            Ok(ExitCode::from(1))
        }
    }
}

fn make_context(cli: &Cli, debug: bool) -> Context {
    Context::new(ContextOptions {
        verbose: cli.verbose,
        debug,
        release: cli.release,
        opt_level: if cli.release { 2 } else { 0 },
        ..ContextOptions::default()
    })
}

/// Load a program into the context: `.etcx` decodes directly, everything else
/// goes through `compile_file` (cache + frontend).
fn load_program(ctx: &mut Context, path: &Path) -> Result<bool> {
    if path.extension().and_then(|e| e.to_str()) == Some(bytecode::cache::CACHE_EXT) {
        let bytes = std::fs::read(path)?;
        match bytecode::decode_program(&bytes) {
            Ok(mut program) => {
                program.reindex();
                return Ok(ctx_install(ctx, program));
            }
            Err(e) => {
                eprintln!("{}: error: {e}", path.display());
                return Ok(false);
            }
        }
    }
    match ctx.compile_file(path) {
        Ok(()) => Ok(true),
        Err(_) => {
            if let Some(message) = ctx.get_error() {
                eprintln!("{message}");
            }
            Ok(false)
        }
    }
}

fn ctx_install(ctx: &mut Context, program: bytecode::BytecodeProgram) -> bool {
    match ctx.install_precompiled(program) {
        Ok(()) => true,
        Err(_) => {
            if let Some(message) = ctx.get_error() {
                eprintln!("{message}");
            }
            false
        }
    }
}

fn run_file(cli: &Cli, path: &Path) -> Result<ExitCode> {
    let mut ctx = make_context(cli, false);
    if !load_program(&mut ctx, path)? {
        return Ok(ExitCode::from(1));
    }
    match ctx.execute() {
        Ok(CValue::Int(code)) => Ok(ExitCode::from((code & 0xFF) as u8)),
        Ok(CValue::Err(e)) => {
            // `?` propagation escaping main.
            eprintln!("error: {e:?}");
            Ok(ExitCode::from(1))
        }
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(_) => {
            if let Some(message) = ctx.get_error() {
                eprintln!("{message}");
            }
            Ok(ExitCode::from(1))
        }
    }
}

fn run_suite(cli: &Cli, dir: &Path, timed: bool) -> Result<ExitCode> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("etch") | Some(bytecode::cache::CACHE_EXT)
            )
        })
        .collect();
    entries.sort();

    let mut passed = 0usize;
    let mut failed = 0usize;
    for path in &entries {
        let mut ctx = make_context(cli, false);
        let started = Instant::now();
        let ok = load_program(&mut ctx, path)? && ctx.execute().is_ok();
        let elapsed = started.elapsed();
        if ok {
            passed += 1;
            if timed {
                println!("ok   {} ({} us)", path.display(), elapsed.as_micros());
            } else {
                println!("ok   {}", path.display());
            }
        } else {
            failed += 1;
            println!("FAIL {}", path.display());
        }
    }
    println!("{passed} passed, {failed} failed");
    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn run_debug_server(cli: &Cli, path: &Path) -> Result<ExitCode> {
    let mut ctx = make_context(cli, true);
    if !load_program(&mut ctx, path)? {
        return Ok(ExitCode::from(1));
    }
    // The stdio DAP session runs on its own thread; the VM pauses at entry
    // and waits for the client's first continue.
    if let Some(state) = ctx.debug_state_or_init() {
        state
            .break_at_entry
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let server_state = state.clone();
        std::thread::spawn(move || {
            etch_engine::vm::dap::serve_stdio(server_state);
        });
    }
    match ctx.execute() {
        Ok(CValue::Int(code)) => Ok(ExitCode::from((code & 0xFF) as u8)),
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(_) => {
            if let Some(message) = ctx.get_error() {
                eprintln!("{message}");
            }
            Ok(ExitCode::from(1))
        }
    }
}

fn dump_bytecode(cli: &Cli, path: &Path) -> Result<ExitCode> {
    let mut ctx = make_context(cli, false);
    if !load_program(&mut ctx, path)? {
        return Ok(ExitCode::from(1));
    }
    match ctx.dump_bytecode() {
        Some(text) => {
            print!("{text}");
            Ok(ExitCode::SUCCESS)
        }
        None => Ok(ExitCode::from(1)),
    }
}
