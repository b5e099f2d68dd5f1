//! The Rust-level embedding surface: one `Context` owns a compiled program,
//! its VM, host functions, global overrides, and the per-context error slot.
//! The C ABI in `etch-sdk` is a thin veneer over this type.

use crate::ast::{builder, Program, Type};
use crate::bytecode::{self, BytecodeProgram};
use crate::codegen::{self, CodegenOptions};
use crate::diagnostics::{
    render_diagnostic, Diagnostic, ErrorKind, EtchError, Severity, SourceLineCache,
};
use crate::ffi::CffiRegistry;
use crate::fold;
use crate::frontend::Frontend;
use crate::prover;
use crate::vm::{dap, debug::DebugState, from_c, to_c, CValue, GcStats, HostFn, StepInfo, Vm};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

/// Context construction options.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub verbose: bool,
    pub debug: bool,
    pub release: bool,
    pub opt_level: u8,
    pub gc_cycle_interval: u64,
    /// Overrides `ETCH_DEBUG_PORT`
    pub debug_port: Option<u16>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        ContextOptions {
            verbose: false,
            debug: false,
            release: false,
            opt_level: 0,
            gc_cycle_interval: crate::vm::DEFAULT_GC_CYCLE_INTERVAL,
            debug_port: None,
        }
    }
}

/// One embedding context: compile, execute, inspect. Not thread-safe; the
/// host synchronizes externally.
pub struct Context {
    pub options: ContextOptions,
    frontend: Option<Box<dyn Frontend>>,
    bytecode: Option<Rc<BytecodeProgram>>,
    vm: Option<Vm>,
    host_fns: Rc<RefCell<FxHashMap<String, HostFn>>>,
    /// Globals set by the host before execution
    overrides: Vec<(String, CValue)>,
    cffi: Rc<CffiRegistry>,
    last_error: Option<String>,
    line_cache: SourceLineCache,
    debug_state: Option<Arc<DebugState>>,
    /// Budget installed before the VM exists
    pending_budget_us: u64,
    step_callback: Option<Box<dyn FnMut(&StepInfo) -> i32>>,
}

impl Context {
    pub fn new(options: ContextOptions) -> Self {
        Context {
            options,
            frontend: None,
            bytecode: None,
            vm: None,
            host_fns: Rc::new(RefCell::new(FxHashMap::default())),
            overrides: Vec::new(),
            cffi: Rc::new(CffiRegistry::new()),
            last_error: None,
            line_cache: SourceLineCache::new(),
            debug_state: None,
            pending_budget_us: 0,
            step_callback: None,
        }
    }

    pub fn set_frontend(&mut self, frontend: Box<dyn Frontend>) {
        self.frontend = Some(frontend);
    }

    // ========================================================================
    // Errors
    // ========================================================================

    pub fn get_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    fn fail<T>(&mut self, message: String) -> Result<T, EtchError> {
        self.last_error = Some(message.clone());
        Err(EtchError::Internal(message))
    }

    fn fail_diag<T>(&mut self, diag: Diagnostic) -> Result<T, EtchError> {
        let rendered = render_diagnostic(&diag, &mut self.line_cache);
        self.last_error = Some(rendered);
        Err(EtchError::Diagnostic(diag))
    }

    // ========================================================================
    // Compilation
    // ========================================================================

    /// Parse (through the installed frontend) and compile source text.
    pub fn compile_str(&mut self, source: &str, filename: &str) -> Result<(), EtchError> {
        self.line_cache.insert_source(filename, source);
        let Some(frontend) = self.frontend.as_ref() else {
            return self.fail("no frontend installed; compile from an AST or install one".into());
        };
        let mut program = match frontend.parse(source, filename) {
            Ok(p) => p,
            Err(diag) => return self.fail_diag(diag),
        };
        program.source_hash = bytecode::source_digest(source, self.options.opt_level);
        self.compile_ast(program)
    }

    /// Compile a source file, honoring the sibling `__etch__` cache.
    pub fn compile_file(&mut self, path: &Path) -> Result<(), EtchError> {
        let source = std::fs::read_to_string(path)?;
        let expected_flags = self.codegen_options().flag_bits();
        match bytecode::load_cached(path, &source, expected_flags, self.options.opt_level) {
            Ok(program) => {
                self.install_bytecode(program)?;
                self.last_error = None;
                return Ok(());
            }
            Err(_) => {
                // Miss: fall through to a fresh compile.
            }
        }
        let filename = path.to_string_lossy().into_owned();
        self.compile_str(&source, &filename)?;
        if let Some(bytecode) = &self.bytecode {
            if let Err(e) = bytecode::save_cached(path, bytecode) {
                if self.options.verbose {
                    eprintln!("warning: could not write bytecode cache: {e}");
                }
            }
        }
        Ok(())
    }

    /// Compile an already-built typed AST.
    pub fn compile_ast(&mut self, mut program: Program) -> Result<(), EtchError> {
        // Host-set globals that the program does not declare become implicit
        // global declarations so the emitter can slot them.
        for (name, value) in &self.overrides {
            let declared = program.globals.iter().any(|s| {
                matches!(&s.kind, crate::ast::StmtKind::Let { name: n, .. } if n == name)
            });
            if !declared {
                if let Some((ty, init)) = cvalue_decl(value) {
                    program.globals.push(builder::let_stmt(name, ty, init));
                }
            }
        }

        // Folder first, so the prover sees concrete constants.
        let warnings = fold::fold_program(&mut program);
        for warning in &warnings {
            if self.options.verbose || warning.severity == Severity::Warning {
                eprint!("{}", render_diagnostic(warning, &mut self.line_cache));
            }
        }

        // The prover rejects by diagnostic; it never rewrites.
        let diags = prover::check_program(&program);
        let mut fatal = None;
        for diag in &diags {
            eprint!("{}", render_diagnostic(diag, &mut self.line_cache));
            if diag.severity == Severity::Error && fatal.is_none() {
                fatal = Some(diag.clone());
            }
        }
        if let Some(diag) = fatal {
            let rendered = render_diagnostic(&diag, &mut self.line_cache);
            self.last_error = Some(rendered);
            return Err(EtchError::Diagnostic(diag));
        }

        if self.options.release {
            let stats = codegen::passes::optimize(&mut program);
            if self.options.verbose {
                eprintln!(
                    "optimize: {} call(s) inlined, {} statement(s) removed in {} pass(es)",
                    stats.inlined_calls, stats.removed_stmts, stats.iterations
                );
            }
        }

        let options = self.codegen_options();
        let compiled = match codegen::emit_program(&program, &options) {
            Ok(b) => b,
            Err(diag) => return self.fail_diag(diag),
        };
        self.install_bytecode(compiled)?;
        self.last_error = None;
        Ok(())
    }

    fn codegen_options(&self) -> CodegenOptions {
        CodegenOptions {
            verbose: self.options.verbose,
            debug: self.options.debug,
            release: self.options.release,
            opt_level: self.options.opt_level,
        }
    }

    fn install_bytecode(&mut self, program: BytecodeProgram) -> Result<(), EtchError> {
        if let Err(e) = self.cffi.bind_all(&program.cffi) {
            let diag = Diagnostic::error(ErrorKind::Compile, e.to_string());
            return self.fail_diag(diag);
        }
        self.bytecode = Some(Rc::new(program));
        // A new program invalidates any running VM.
        self.vm = None;
        Ok(())
    }

    /// Install an already-decoded bytecode program (e.g. a loaded `.etcx`).
    pub fn install_precompiled(&mut self, program: BytecodeProgram) -> Result<(), EtchError> {
        self.install_bytecode(program)?;
        self.last_error = None;
        Ok(())
    }

    /// The debug state, creating and activating it on first use.
    pub fn debug_state_or_init(&mut self) -> Option<&Arc<DebugState>> {
        let state = self.debug_state.get_or_insert_with(|| {
            let state = Arc::new(DebugState::new());
            state.activate();
            state
        });
        Some(&*state)
    }

    /// The compiled program's disassembly.
    pub fn dump_bytecode(&self) -> Option<String> {
        self.bytecode.as_ref().map(|b| b.dump())
    }

    pub fn bytecode(&self) -> Option<&Rc<BytecodeProgram>> {
        self.bytecode.as_ref()
    }

    // ========================================================================
    // Execution
    // ========================================================================

    fn ensure_vm(&mut self) -> Result<(), EtchError> {
        if self.vm.is_some() {
            return Ok(());
        }
        let Some(bytecode) = self.bytecode.clone() else {
            return self.fail("no program compiled".into());
        };
        let mut vm = Vm::new(bytecode);
        vm.host_fns = self.host_fns.clone();
        vm.cffi = Some(self.cffi.clone());
        vm.gc_cycle_interval = self.options.gc_cycle_interval;
        if self.pending_budget_us > 0 {
            vm.begin_frame(self.pending_budget_us);
        }
        if let Some(cb) = self.step_callback.take() {
            vm.step_callback = Some(cb);
        }
        for (name, value) in &self.overrides {
            let v = from_c(&mut vm.heap, value);
            vm.override_global(name, v);
        }
        if self.options.debug {
            let state = self.debug_state.get_or_insert_with(|| {
                let state = Arc::new(DebugState::new());
                state.activate();
                state
            });
            vm.debug = Some(state.clone());
        }
        self.vm = Some(vm);
        Ok(())
    }

    /// Run `main`. Returns its value; integer results double as the process
    /// exit code at the CLI.
    pub fn execute(&mut self) -> Result<CValue, EtchError> {
        self.ensure_vm()?;
        self.maybe_start_debug_server()?;
        let vm = self.vm.as_mut().expect("vm ensured");
        match vm.execute() {
            Ok(value) => {
                let out = to_c(&vm.heap, &value);
                vm.heap.release(&value);
                self.last_error = None;
                Ok(out)
            }
            Err(e) => {
                let message = e.to_string();
                self.last_error = Some(message.clone());
                Err(EtchError::Diagnostic(Diagnostic {
                    kind: ErrorKind::Runtime,
                    severity: Severity::Error,
                    message: e.message,
                    file: e.file,
                    line: e.line,
                    col: e.col,
                    original_function: e.origin,
                }))
            }
        }
    }

    /// Call a function by fully-qualified key (or unambiguous plain name).
    pub fn call_function(&mut self, name: &str, args: &[CValue]) -> Result<CValue, EtchError> {
        self.ensure_vm()?;
        let vm = self.vm.as_mut().expect("vm ensured");
        let vm_args: Vec<crate::vm::Value> =
            args.iter().map(|cv| from_c(&mut vm.heap, cv)).collect();
        match vm.call_function(name, vm_args) {
            Ok(value) => {
                let out = to_c(&vm.heap, &value);
                vm.heap.release(&value);
                self.last_error = None;
                Ok(out)
            }
            Err(e) => {
                let message = e.to_string();
                self.last_error = Some(message);
                Err(EtchError::Internal(e.to_string()))
            }
        }
    }

    fn maybe_start_debug_server(&mut self) -> Result<(), EtchError> {
        if !self.options.debug {
            return Ok(());
        }
        let port = self.options.debug_port.or_else(|| {
            std::env::var(dap::DEBUG_PORT_ENV)
                .ok()
                .and_then(|s| s.parse::<u16>().ok())
        });
        let Some(port) = port else {
            return Ok(());
        };
        let state = self
            .debug_state
            .get_or_insert_with(|| {
                let state = Arc::new(DebugState::new());
                state.activate();
                state
            })
            .clone();
        state.break_at_entry.store(true, std::sync::atomic::Ordering::SeqCst);
        dap::serve_tcp(state, port, dap::configured_timeout())?;
        Ok(())
    }

    /// Start the inline (stdio) DAP server. Blocks the calling thread until
    /// the client disconnects; intended to be called from a dedicated host
    /// thread.
    pub fn serve_debug_stdio(&mut self) {
        let state = self
            .debug_state
            .get_or_insert_with(|| {
                let state = Arc::new(DebugState::new());
                state.activate();
                state
            })
            .clone();
        dap::serve_stdio(state);
    }

    pub fn debug_state(&self) -> Option<&Arc<DebugState>> {
        self.debug_state.as_ref()
    }

    // ========================================================================
    // Globals & host functions
    // ========================================================================

    pub fn set_global(&mut self, name: &str, value: CValue) {
        if let Some(vm) = self.vm.as_mut() {
            let v = from_c(&mut vm.heap, &value);
            // set_global retains its own copy; drop the marshalling handle.
            vm.set_global(name, v.clone());
            vm.heap.release(&v);
        }
        // Remember for (re)compilation and fresh VMs.
        self.overrides.retain(|(n, _)| n != name);
        self.overrides.push((name.to_string(), value));
    }

    pub fn get_global(&self, name: &str) -> Option<CValue> {
        if let Some(vm) = &self.vm {
            return vm.get_global(name).map(|v| to_c(&vm.heap, v));
        }
        self.overrides
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    /// Register a host callback dispatched when the VM calls `name`.
    pub fn register_function(&mut self, name: &str, callback: HostFn) {
        self.host_fns.borrow_mut().insert(name.to_string(), callback);
    }

    pub fn set_step_callback(&mut self, callback: Box<dyn FnMut(&StepInfo) -> i32>) {
        match self.vm.as_mut() {
            Some(vm) => vm.step_callback = Some(callback),
            None => self.step_callback = Some(callback),
        }
    }

    // ========================================================================
    // GC budgeting & inspection
    // ========================================================================

    pub fn begin_frame(&mut self, budget_us: u64) {
        match self.vm.as_mut() {
            Some(vm) => vm.begin_frame(budget_us),
            None => self.pending_budget_us = budget_us,
        }
    }

    pub fn gc_stats(&mut self) -> GcStats {
        match self.vm.as_mut() {
            Some(vm) => vm.gc_stats(),
            None => GcStats::default(),
        }
    }

    pub fn heap_needs_collection(&self) -> bool {
        self.vm
            .as_ref()
            .map(|vm| vm.heap_needs_collection())
            .unwrap_or(false)
    }

    pub fn vm(&self) -> Option<&Vm> {
        self.vm.as_ref()
    }

    pub fn vm_mut(&mut self) -> Option<&mut Vm> {
        self.vm.as_mut()
    }

    pub fn current_pc(&self) -> usize {
        self.vm.as_ref().map(|vm| vm.current_pc()).unwrap_or(0)
    }

    pub fn call_depth(&self) -> usize {
        self.vm.as_ref().map(|vm| vm.call_depth()).unwrap_or(0)
    }

    pub fn current_function_name(&self) -> String {
        self.vm
            .as_ref()
            .map(|vm| vm.current_function_name())
            .unwrap_or_default()
    }

    pub fn instruction_count(&self) -> u64 {
        self.vm.as_ref().map(|vm| vm.instruction_count).unwrap_or(0)
    }

    /// Width of the current frame's register window.
    pub fn register_count(&self) -> usize {
        self.vm.as_ref().map(|vm| vm.registers().len()).unwrap_or(0)
    }

    /// Marshal one register of the current frame.
    pub fn register_value(&self, index: usize) -> Option<CValue> {
        let vm = self.vm.as_ref()?;
        let regs = vm.registers();
        regs.get(index).map(|v| to_c(&vm.heap, v))
    }
}

fn cvalue_decl(value: &CValue) -> Option<(Type, crate::ast::Expr)> {
    Some(match value {
        CValue::Int(v) => (Type::Int, builder::int(*v)),
        CValue::Float(v) => (Type::Float, builder::float(*v)),
        CValue::Bool(v) => (Type::Bool, builder::boolean(*v)),
        CValue::Str(v) => (Type::Str, builder::string(v)),
        CValue::Nil => (Type::Inferred, builder::nil()),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builder::*;
    use crate::ast::BinOp;

    fn int_program(body: Vec<crate::ast::Stmt>) -> Program {
        let mut program = Program::new();
        program.add_function(func("main", vec![], Type::Int, body));
        program
    }

    #[test]
    fn test_compile_and_execute() {
        let mut ctx = Context::new(ContextOptions::default());
        ctx.compile_ast(int_program(vec![ret(binary(
            BinOp::Add,
            int(40),
            int(2),
        ))]))
        .unwrap();
        assert_eq!(ctx.execute().unwrap(), CValue::Int(42));
        assert!(ctx.get_error().is_none());
    }

    #[test]
    fn test_prover_rejection_sets_error() {
        let mut ctx = Context::new(ContextOptions::default());
        let result = ctx.compile_ast(int_program(vec![
            let_stmt("a", Type::Int, int(9_223_372_036_854_775_800)),
            let_stmt("b", Type::Int, int(100)),
            ret(binary(BinOp::Add, var("a"), var("b"))),
        ]));
        assert!(result.is_err());
        assert!(ctx.get_error().unwrap().contains("overflow"));
        ctx.clear_error();
        assert!(ctx.get_error().is_none());
    }

    #[test]
    fn test_global_override_round_trip() {
        // setGlobal(n, 42); compile "fn main()->int { return n; }"; execute
        let mut ctx = Context::new(ContextOptions::default());
        ctx.set_global("n", CValue::Int(42));
        ctx.compile_ast(int_program(vec![ret(var("n"))])).unwrap();
        assert_eq!(ctx.execute().unwrap(), CValue::Int(42));
        assert_eq!(ctx.get_global("n"), Some(CValue::Int(42)));
    }

    #[test]
    fn test_host_function_dispatch() {
        let mut program = Program::new();
        let mut host_decl = func("hostAdd", vec![param("a", Type::Int), param("b", Type::Int)], Type::Int, vec![]);
        host_decl.flags.host = true;
        program.add_function(host_decl);
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![ret(call("hostAdd", vec![int(20), int(22)]))],
        ));

        let mut ctx = Context::new(ContextOptions::default());
        ctx.register_function(
            "hostAdd",
            Box::new(|args| {
                let (Some(CValue::Int(a)), Some(CValue::Int(b))) = (args.first(), args.get(1))
                else {
                    return Err("expected two ints".to_string());
                };
                Ok(CValue::Int(a + b))
            }),
        );
        ctx.compile_ast(program).unwrap();
        assert_eq!(ctx.execute().unwrap(), CValue::Int(42));
    }

    #[test]
    fn test_call_function_by_name() {
        let mut program = Program::new();
        program.add_function(func(
            "triple",
            vec![param("n", Type::Int)],
            Type::Int,
            vec![ret(binary(BinOp::Mul, var("n"), int(3)))],
        ));
        program.add_function(func("main", vec![], Type::Int, vec![ret(int(0))]));

        let mut ctx = Context::new(ContextOptions::default());
        ctx.compile_ast(program).unwrap();
        assert_eq!(
            ctx.call_function("triple", &[CValue::Int(14)]).unwrap(),
            CValue::Int(42)
        );
    }

    #[test]
    fn test_runtime_error_reported_with_position() {
        // Force a runtime failure the prover cannot see: host fn error.
        let mut program = Program::new();
        let mut host_decl = func("boom", vec![], Type::Int, vec![]);
        host_decl.flags.host = true;
        program.add_function(host_decl);
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![ret(at(call("boom", vec![]), 3, 9))],
        ));
        let mut ctx = Context::new(ContextOptions::default());
        ctx.register_function("boom", Box::new(|_| Err("kaput".to_string())));
        ctx.compile_ast(program).unwrap();
        let err = ctx.execute().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("kaput"), "got: {text}");
        assert!(ctx.get_error().is_some());
    }
}
