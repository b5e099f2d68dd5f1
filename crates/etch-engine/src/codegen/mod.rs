//! Lowering the typed, folded AST to register bytecode.
//!
//! Registers are assigned by a linear scan within each body: parameters
//! occupy 0..param_count-1, locals claim the next slots as they are declared,
//! and expression temporaries grow above the live locals and retract at
//! statement boundaries.

pub mod passes;

use crate::ast::{
    mangle, BinOp, EnumDecl, Expr, ExprKind, FunctionDecl, LValue, Program, SourcePos, Stmt,
    StmtKind, Type, UnOp,
};
use crate::bytecode::{
    match_tag, pack_call, BytecodeProgram, CffiDescriptor, DebugRecord, FuncKind, FunctionInfo,
    GlobalInfo, InitialValue, Instr, Opcode, MAX_CONSTANTS, MAX_REGISTERS,
};
use crate::diagnostics::{Diagnostic, ErrorKind};
use crate::ffi::resolve_library_path;
use crate::vm::builtins;
use rustc_hash::FxHashMap;

/// Compilation options that affect emission.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodegenOptions {
    pub verbose: bool,
    pub debug: bool,
    pub release: bool,
    pub opt_level: u8,
}

impl CodegenOptions {
    pub fn flag_bits(&self) -> u32 {
        use crate::bytecode::flags;
        let mut bits = 0;
        if self.verbose {
            bits |= flags::VERBOSE;
        }
        if self.debug {
            bits |= flags::DEBUG;
        }
        if self.release {
            bits |= flags::RELEASE;
        }
        bits | ((self.opt_level as u32) << flags::OPT_SHIFT)
    }
}

/// Lower a program. Release mode should run `passes::optimize` first.
pub fn emit_program(
    program: &Program,
    options: &CodegenOptions,
) -> Result<BytecodeProgram, Diagnostic> {
    let mut emitter = Emitter::new(program, options);
    emitter.run()?;
    Ok(emitter.out)
}

struct Emitter<'p> {
    program: &'p Program,
    out: BytecodeProgram,
    string_index: FxHashMap<String, u32>,
    float_index: FxHashMap<u64, u32>,
    int_index: FxHashMap<i64, u32>,
    global_slots: FxHashMap<String, u32>,
    /// Mangled key → function table slot
    func_slots: FxHashMap<String, u32>,
    /// Cffi mangled key → descriptor index
    cffi_slots: FxHashMap<String, u32>,
    /// Lambda bodies discovered during lowering, compiled after their hosts
    pending_lambdas: Vec<PendingLambda>,
    lambda_counter: u32,
}

struct PendingLambda {
    slot: u32,
    name: String,
    captures: Vec<String>,
    decl: FunctionDecl,
}

impl<'p> Emitter<'p> {
    fn new(program: &'p Program, options: &CodegenOptions) -> Self {
        let mut out = BytecodeProgram::new();
        out.flags = options.flag_bits();
        out.source_hash = program.source_hash;
        out.source_files = program.source_files.clone();
        out.origin_names = program.origin_names.clone();
        Emitter {
            program,
            out,
            string_index: FxHashMap::default(),
            float_index: FxHashMap::default(),
            int_index: FxHashMap::default(),
            global_slots: FxHashMap::default(),
            func_slots: FxHashMap::default(),
            cffi_slots: FxHashMap::default(),
            pending_lambdas: Vec::new(),
            lambda_counter: 0,
        }
    }

    fn run(&mut self) -> Result<(), Diagnostic> {
        self.collect_globals();
        self.assign_function_slots()?;
        self.collect_destructors();

        // Lower the synthetic <global> initializer first.
        self.emit_global_init()?;

        let mut keys: Vec<String> = self.program.functions.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let decl = &self.program.functions[&key];
            if decl.flags.builtin || decl.flags.host || decl.flags.cffi {
                continue;
            }
            self.emit_function(&key, decl, &[])?;
        }

        // Lambdas queue more lambdas; drain until settled.
        while let Some(pending) = self.pending_lambdas.pop() {
            let decl = pending.decl.clone();
            self.emit_lambda(&pending, &decl)?;
        }

        self.out.reindex();
        self.out
            .verify()
            .map_err(|e| Diagnostic::error(ErrorKind::Compile, e.to_string()))?;
        Ok(())
    }

    // ========================================================================
    // Tables
    // ========================================================================

    fn intern_string(&mut self, s: &str) -> Result<u32, Diagnostic> {
        if let Some(&idx) = self.string_index.get(s) {
            return Ok(idx);
        }
        if self.out.strings.len() >= MAX_CONSTANTS {
            return Err(Diagnostic::error(
                ErrorKind::Compile,
                "string constant pool overflow",
            ));
        }
        let idx = self.out.strings.len() as u32;
        self.out.strings.push(s.to_string());
        self.string_index.insert(s.to_string(), idx);
        Ok(idx)
    }

    fn intern_float(&mut self, f: f64) -> Result<u32, Diagnostic> {
        let bits = f.to_bits();
        if let Some(&idx) = self.float_index.get(&bits) {
            return Ok(idx);
        }
        if self.out.floats.len() >= MAX_CONSTANTS {
            return Err(Diagnostic::error(
                ErrorKind::Compile,
                "float constant pool overflow",
            ));
        }
        let idx = self.out.floats.len() as u32;
        self.out.floats.push(f);
        self.float_index.insert(bits, idx);
        Ok(idx)
    }

    fn intern_int(&mut self, v: i64) -> Result<u32, Diagnostic> {
        if let Some(&idx) = self.int_index.get(&v) {
            return Ok(idx);
        }
        if self.out.ints.len() >= MAX_CONSTANTS {
            return Err(Diagnostic::error(
                ErrorKind::Compile,
                "int constant pool overflow",
            ));
        }
        let idx = self.out.ints.len() as u32;
        self.out.ints.push(v);
        self.int_index.insert(v, idx);
        Ok(idx)
    }

    fn collect_globals(&mut self) {
        for stmt in &self.program.globals {
            if let StmtKind::Let { name, ty, init } = &stmt.kind {
                let slot = self.out.globals.len() as u32;
                let initial = match init.as_ref().map(|e| &e.kind) {
                    Some(ExprKind::Int(v)) => InitialValue::Int(*v),
                    Some(ExprKind::Float(v)) => InitialValue::Float(*v),
                    Some(ExprKind::Bool(v)) => InitialValue::Bool(*v),
                    Some(ExprKind::Str(v)) => InitialValue::Str(v.clone()),
                    _ => InitialValue::Nil,
                };
                self.out.globals.push(GlobalInfo {
                    name: name.clone(),
                    type_code: ty.code(),
                    initial,
                });
                self.global_slots.insert(name.clone(), slot);
            }
        }
    }

    fn collect_destructors(&mut self) {
        let mut pairs: Vec<(String, String)> = self
            .program
            .user_types
            .objects
            .values()
            .filter_map(|o| o.destructor.clone().map(|d| (o.name.clone(), d)))
            .collect();
        pairs.sort();
        self.out.destructors = pairs;
    }

    fn assign_function_slots(&mut self) -> Result<(), Diagnostic> {
        // <global> gets slot 0 so the loader can find it cheaply.
        let global_key = mangle("<global>", &[], &Type::Void);
        self.func_slots.insert(global_key.clone(), 0);
        self.out.functions.push(FunctionInfo {
            name: global_key,
            start_pc: 0,
            end_pc: 0,
            kind: FuncKind::Native,
            param_count: 0,
            max_register: 0,
            param_names: Vec::new(),
            return_type_code: Type::Void.code(),
        });

        let mut keys: Vec<String> = self.program.functions.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let decl = &self.program.functions[&key];
            if decl.flags.builtin {
                continue;
            }
            let slot = self.out.functions.len() as u32;
            let kind = if decl.flags.cffi {
                FuncKind::Cffi
            } else if decl.flags.host {
                FuncKind::Host
            } else {
                FuncKind::Native
            };
            self.out.functions.push(FunctionInfo {
                name: key.clone(),
                start_pc: 0,
                end_pc: 0,
                kind,
                param_count: decl.params.len() as u8,
                max_register: decl.params.len().max(1) as u8 - 1,
                param_names: decl.params.iter().map(|p| p.name.clone()).collect(),
                return_type_code: decl.ret.code(),
            });
            self.func_slots.insert(key.clone(), slot);

            if decl.flags.cffi {
                let library = decl.extern_library.clone().unwrap_or_else(|| "c".to_string());
                let resolved_path = resolve_library_path(&library).unwrap_or_default();
                let descriptor_idx = self.out.cffi.len() as u32;
                self.out.cffi.push(CffiDescriptor {
                    mangled: key.clone(),
                    library,
                    symbol: decl.name.clone(),
                    param_codes: decl.params.iter().map(|p| p.ty.code()).collect(),
                    return_code: decl.ret.code(),
                    resolved_path,
                });
                self.cffi_slots.insert(key, descriptor_idx);
            }
        }
        Ok(())
    }

    fn emit_global_init(&mut self) -> Result<(), Diagnostic> {
        let start_pc = self.out.code.len() as u32;
        let mut fe = FnEmitter::new(self, "<global>", &[]);
        for stmt in fe.emitter.program.globals.clone() {
            if let StmtKind::Let { name, init, .. } = &stmt.kind {
                if let Some(init_expr) = init {
                    let slot = fe.emitter.global_slots[name];
                    let save = fe.next_reg;
                    let t = fe.alloc_temp(stmt.pos)?;
                    fe.emit_expr(init_expr, t)?;
                    fe.push(Opcode::InitGlobal, t, 0, slot, stmt.pos);
                    fe.next_reg = save;
                }
            }
        }
        fe.push(Opcode::ReturnVoid, 0, 0, 0, SourcePos::unknown());
        let max_register = fe.max_reg;
        let end_pc = fe.emitter.out.code.len() as u32;
        let info = &mut fe.emitter.out.functions[0];
        info.start_pc = start_pc;
        info.end_pc = end_pc;
        info.max_register = max_register;
        Ok(())
    }

    fn emit_function(
        &mut self,
        key: &str,
        decl: &FunctionDecl,
        captures: &[String],
    ) -> Result<(), Diagnostic> {
        let start_pc = self.out.code.len() as u32;
        let params: Vec<(String, Type)> = captures
            .iter()
            .map(|c| (c.clone(), Type::Inferred))
            .chain(decl.params.iter().map(|p| (p.name.clone(), p.ty.clone())))
            .collect();
        let mut fe = FnEmitter::new(self, &decl.name, &params);
        fe.emit_body(&decl.body)?;
        let max_register = fe.max_reg;
        let end_pc = fe.emitter.out.code.len() as u32;

        let slot = self.func_slots[key] as usize;
        let info = &mut self.out.functions[slot];
        info.start_pc = start_pc;
        info.end_pc = end_pc;
        info.param_count = params.len() as u8;
        info.max_register = max_register;
        info.param_names = params.into_iter().map(|(n, _)| n).collect();
        Ok(())
    }

    fn emit_lambda(&mut self, pending: &PendingLambda, decl: &FunctionDecl) -> Result<(), Diagnostic> {
        self.func_slots
            .insert(pending.name.clone(), pending.slot);
        let key = pending.name.clone();
        // Lambda table entries were pre-created at MakeClosure emission.
        let start_pc = self.out.code.len() as u32;
        let params: Vec<(String, Type)> = pending
            .captures
            .iter()
            .map(|c| (c.clone(), Type::Inferred))
            .chain(decl.params.iter().map(|p| (p.name.clone(), p.ty.clone())))
            .collect();
        let mut fe = FnEmitter::new(self, &key, &params);
        fe.emit_body(&decl.body)?;
        let max_register = fe.max_reg;
        let end_pc = self.out.code.len() as u32;
        let info = &mut self.out.functions[pending.slot as usize];
        info.start_pc = start_pc;
        info.end_pc = end_pc;
        info.param_count = params.len() as u8;
        info.max_register = max_register;
        info.param_names = params.into_iter().map(|(n, _)| n).collect();
        Ok(())
    }
}

// ============================================================================
// Per-function emission
// ============================================================================

/// Patch bookkeeping for one enclosing loop. While-loops know their continue
/// target up front; for-loops patch it to the increment after the body.
struct LoopCtx {
    breaks: Vec<usize>,
    continues: Vec<usize>,
    continue_target: Option<usize>,
}

struct FnEmitter<'a, 'p> {
    emitter: &'a mut Emitter<'p>,
    func_name: String,
    /// Scope stack of name → register
    scopes: Vec<FxHashMap<String, u8>>,
    /// Static types of locals, best effort, for typed opcode selection
    local_types: FxHashMap<String, Type>,
    next_reg: u16,
    max_reg: u8,
    loops: Vec<LoopCtx>,
    /// Deferred bodies, emitted after the main body with the scope stack
    /// captured at registration
    defer_bodies: Vec<(usize, Vec<Stmt>, Vec<FxHashMap<String, u8>>)>,
}

impl<'a, 'p> FnEmitter<'a, 'p> {
    fn new(emitter: &'a mut Emitter<'p>, func_name: &str, params: &[(String, Type)]) -> Self {
        let mut scope = FxHashMap::default();
        let mut local_types = FxHashMap::default();
        for (i, (name, ty)) in params.iter().enumerate() {
            scope.insert(name.clone(), i as u8);
            local_types.insert(name.clone(), ty.clone());
        }
        FnEmitter {
            emitter,
            func_name: func_name.to_string(),
            scopes: vec![scope],
            local_types,
            next_reg: params.len() as u16,
            max_reg: params.len().max(1) as u8 - 1,
            loops: Vec::new(),
            defer_bodies: Vec::new(),
        }
    }

    fn push(&mut self, op: Opcode, a: u8, b: u8, wide: u32, pos: SourcePos) -> usize {
        let pc = self.emitter.out.code.len();
        self.emitter.out.code.push(Instr::new(op, a, b, wide));
        self.emitter.out.debug.push(DebugRecord {
            file: pos.file,
            line: pos.line,
            col: pos.col,
            origin: pos.origin,
        });
        pc
    }

    fn patch_wide(&mut self, pc: usize, wide: u32) {
        self.emitter.out.code[pc].wide = wide;
    }

    fn here(&self) -> u32 {
        self.emitter.out.code.len() as u32
    }

    fn alloc_temp(&mut self, pos: SourcePos) -> Result<u8, Diagnostic> {
        if self.next_reg as usize >= MAX_REGISTERS {
            return Err(Diagnostic::error(
                ErrorKind::Compile,
                format!("function '{}' needs more than 256 registers", self.func_name),
            )
            .at(
                self.emitter.program.file_name(pos.file),
                pos,
            ));
        }
        let reg = self.next_reg as u8;
        self.next_reg += 1;
        if reg > self.max_reg {
            self.max_reg = reg;
        }
        Ok(reg)
    }

    fn declare_local(&mut self, name: &str, ty: Type, pos: SourcePos) -> Result<u8, Diagnostic> {
        let reg = self.alloc_temp(pos)?;
        self.scopes
            .last_mut()
            .expect("scope stack never empty")
            .insert(name.to_string(), reg);
        self.local_types.insert(name.to_string(), ty);
        Ok(reg)
    }

    fn lookup_local(&self, name: &str) -> Option<u8> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
    }

    // ========================================================================
    // Bodies & statements
    // ========================================================================

    fn emit_body(&mut self, body: &[Stmt]) -> Result<(), Diagnostic> {
        for stmt in body {
            self.emit_stmt(stmt)?;
        }
        // Implicit return for fall-through paths.
        self.push(Opcode::ReturnVoid, 0, 0, 0, SourcePos::unknown());
        self.flush_defer_bodies()?;
        Ok(())
    }

    fn flush_defer_bodies(&mut self) -> Result<(), Diagnostic> {
        while !self.defer_bodies.is_empty() {
            let (push_site, body, scopes) = self.defer_bodies.remove(0);
            let start = self.here();
            self.patch_wide(push_site, start);
            // The block sees the bindings that were live at its registration.
            let outer_scopes = std::mem::replace(&mut self.scopes, scopes);
            for stmt in &body {
                self.emit_stmt(stmt)?;
            }
            self.scopes = outer_scopes;
            self.push(Opcode::DeferEnd, 0, 0, 0, SourcePos::unknown());
        }
        Ok(())
    }

    fn emit_stmt(&mut self, stmt: &Stmt) -> Result<(), Diagnostic> {
        match &stmt.kind {
            StmtKind::Let { name, ty, init } => {
                let declared_ty = if *ty == Type::Inferred {
                    init.as_ref()
                        .and_then(|e| self.infer_type(e))
                        .unwrap_or(Type::Inferred)
                } else {
                    ty.clone()
                };
                let reg = self.declare_local(name, declared_ty, stmt.pos)?;
                match init {
                    Some(e) => {
                        let save = self.next_reg;
                        self.emit_expr(e, reg)?;
                        self.next_reg = save;
                    }
                    None => {
                        self.push(Opcode::LoadNil, reg, 0, 0, stmt.pos);
                    }
                }
            }
            StmtKind::Assign { target, value } => {
                let save = self.next_reg;
                match target {
                    LValue::Var(name) => {
                        if let Some(reg) = self.lookup_local(name) {
                            self.emit_expr(value, reg)?;
                        } else if let Some(&slot) = self.emitter.global_slots.get(name) {
                            let t = self.alloc_temp(stmt.pos)?;
                            self.emit_expr(value, t)?;
                            self.push(Opcode::StoreGlobal, t, 0, slot, stmt.pos);
                        } else {
                            return Err(self.undefined(name, stmt.pos));
                        }
                    }
                    LValue::Index { base, index } => {
                        let tb = self.alloc_temp(stmt.pos)?;
                        self.emit_expr(base, tb)?;
                        let ti = self.alloc_temp(stmt.pos)?;
                        self.emit_expr(index, ti)?;
                        let tv = self.alloc_temp(stmt.pos)?;
                        self.emit_expr(value, tv)?;
                        self.push(Opcode::ArraySet, tb, ti, tv as u32, stmt.pos);
                    }
                    LValue::Field { base, field } => {
                        let tb = self.alloc_temp(stmt.pos)?;
                        self.emit_expr(base, tb)?;
                        let tv = self.alloc_temp(stmt.pos)?;
                        self.emit_expr(value, tv)?;
                        let field_idx = self.emitter.intern_string(field)?;
                        self.push(Opcode::ObjectSet, tb, tv, field_idx, stmt.pos);
                    }
                    LValue::Deref(base) => {
                        let tb = self.alloc_temp(stmt.pos)?;
                        self.emit_expr(base, tb)?;
                        let tv = self.alloc_temp(stmt.pos)?;
                        self.emit_expr(value, tv)?;
                        self.push(Opcode::StoreRef, tb, tv, 0, stmt.pos);
                    }
                }
                self.next_reg = save;
            }
            StmtKind::ExprStmt(e) => {
                let save = self.next_reg;
                let t = self.alloc_temp(stmt.pos)?;
                self.emit_expr(e, t)?;
                self.next_reg = save;
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                let save = self.next_reg;
                let t = self.alloc_temp(stmt.pos)?;
                self.emit_expr(cond, t)?;
                let to_else = self.push(Opcode::JumpIfFalse, t, 0, 0, stmt.pos);
                self.next_reg = save;

                self.with_scope(|fe| fe.emit_stmts(then_body))?;
                if else_body.is_empty() {
                    let end = self.here();
                    self.patch_wide(to_else, end);
                } else {
                    let to_end = self.push(Opcode::Jump, 0, 0, 0, stmt.pos);
                    let else_start = self.here();
                    self.patch_wide(to_else, else_start);
                    self.with_scope(|fe| fe.emit_stmts(else_body))?;
                    let end = self.here();
                    self.patch_wide(to_end, end);
                }
            }
            StmtKind::While { cond, body } => {
                let loop_start = self.here() as usize;
                let save = self.next_reg;
                let t = self.alloc_temp(stmt.pos)?;
                self.emit_expr(cond, t)?;
                let to_end = self.push(Opcode::JumpIfFalse, t, 0, 0, stmt.pos);
                self.next_reg = save;

                self.loops.push(LoopCtx {
                    breaks: Vec::new(),
                    continues: Vec::new(),
                    continue_target: Some(loop_start),
                });
                self.with_scope(|fe| fe.emit_stmts(body))?;
                self.push(Opcode::Jump, 0, 0, loop_start as u32, stmt.pos);
                let end = self.here();
                self.patch_wide(to_end, end);
                let ctx = self.loops.pop().expect("loop stack");
                for site in ctx.breaks {
                    self.patch_wide(site, end);
                }
            }
            StmtKind::For {
                var,
                from,
                to,
                body,
            } => {
                let outer_save = self.next_reg;
                self.scopes.push(FxHashMap::default());
                let i_reg = self.declare_local(var, Type::Int, stmt.pos)?;
                self.emit_expr(from, i_reg)?;
                let end_reg = self.alloc_temp(stmt.pos)?;
                self.emit_expr(to, end_reg)?;
                let one_reg = self.alloc_temp(stmt.pos)?;
                self.push(Opcode::LoadInt, one_reg, 0, 1, stmt.pos);

                let loop_start = self.here() as usize;
                let save = self.next_reg;
                let flag = self.alloc_temp(stmt.pos)?;
                self.push(Opcode::ILt, flag, i_reg, end_reg as u32, stmt.pos);
                let to_end = self.push(Opcode::JumpIfFalse, flag, 0, 0, stmt.pos);
                self.next_reg = save;

                self.loops.push(LoopCtx {
                    breaks: Vec::new(),
                    continues: Vec::new(),
                    continue_target: None,
                });
                self.with_scope(|fe| fe.emit_stmts(body))?;
                // The increment is the continue target.
                let incr = self.here();
                self.push(Opcode::IAdd, i_reg, i_reg, one_reg as u32, stmt.pos);
                self.push(Opcode::Jump, 0, 0, loop_start as u32, stmt.pos);
                let end = self.here();
                self.patch_wide(to_end, end);
                let ctx = self.loops.pop().expect("loop stack");
                for site in ctx.breaks {
                    self.patch_wide(site, end);
                }
                for site in ctx.continues {
                    self.patch_wide(site, incr);
                }
                self.scopes.pop();
                self.next_reg = outer_save;
            }
            StmtKind::Return(expr) => {
                let save = self.next_reg;
                match expr {
                    Some(e) => {
                        let t = self.alloc_temp(stmt.pos)?;
                        self.emit_expr(e, t)?;
                        self.push(Opcode::Return, t, 0, 0, stmt.pos);
                    }
                    None => {
                        self.push(Opcode::ReturnVoid, 0, 0, 0, stmt.pos);
                    }
                }
                self.next_reg = save;
            }
            StmtKind::Block(body) => {
                self.with_scope(|fe| fe.emit_stmts(body))?;
            }
            StmtKind::Defer(body) => {
                let site = self.push(Opcode::DeferPush, 0, 0, 0, stmt.pos);
                self.defer_bodies
                    .push((site, body.clone(), self.scopes.clone()));
            }
            StmtKind::Break => {
                if self.loops.is_empty() {
                    return Err(Diagnostic::error(ErrorKind::Compile, "break outside of loop")
                        .at(self.emitter.program.file_name(stmt.pos.file), stmt.pos));
                }
                let site = self.push(Opcode::Jump, 0, 0, 0, stmt.pos);
                self.loops.last_mut().expect("loop stack").breaks.push(site);
            }
            StmtKind::Continue => {
                if self.loops.is_empty() {
                    return Err(Diagnostic::error(ErrorKind::Compile, "continue outside of loop")
                        .at(self.emitter.program.file_name(stmt.pos.file), stmt.pos));
                }
                let target = self.loops.last().expect("loop stack").continue_target;
                match target {
                    Some(t) => {
                        self.push(Opcode::Jump, 0, 0, t as u32, stmt.pos);
                    }
                    None => {
                        let site = self.push(Opcode::Jump, 0, 0, 0, stmt.pos);
                        self.loops
                            .last_mut()
                            .expect("loop stack")
                            .continues
                            .push(site);
                    }
                }
            }
            StmtKind::Comptime(_) => {
                // Folded away before emission; nothing to lower.
            }
        }
        Ok(())
    }

    fn emit_stmts(&mut self, body: &[Stmt]) -> Result<(), Diagnostic> {
        for stmt in body {
            self.emit_stmt(stmt)?;
        }
        Ok(())
    }

    fn with_scope(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<(), Diagnostic>,
    ) -> Result<(), Diagnostic> {
        self.scopes.push(FxHashMap::default());
        let save = self.next_reg;
        let result = f(self);
        self.scopes.pop();
        self.next_reg = save;
        result
    }

    fn undefined(&self, name: &str, pos: SourcePos) -> Diagnostic {
        Diagnostic::error(
            ErrorKind::Compile,
            format!("undefined variable '{name}'"),
        )
        .at(self.emitter.program.file_name(pos.file), pos)
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn emit_expr(&mut self, e: &Expr, dst: u8) -> Result<(), Diagnostic> {
        match &e.kind {
            ExprKind::Int(v) => {
                if let Result::Ok(small) = i32::try_from(*v) {
                    self.push(Opcode::LoadInt, dst, 0, small as u32, e.pos);
                } else {
                    let idx = self.emitter.intern_int(*v)?;
                    self.push(Opcode::LoadConstInt, dst, 0, idx, e.pos);
                }
            }
            ExprKind::Float(v) => {
                let idx = self.emitter.intern_float(*v)?;
                self.push(Opcode::LoadFloat, dst, 0, idx, e.pos);
            }
            ExprKind::Bool(v) => {
                let op = if *v { Opcode::LoadTrue } else { Opcode::LoadFalse };
                self.push(op, dst, 0, 0, e.pos);
            }
            ExprKind::Char(v) => {
                self.push(Opcode::LoadChar, dst, 0, *v as u32, e.pos);
            }
            ExprKind::Str(v) => {
                let idx = self.emitter.intern_string(v)?;
                self.push(Opcode::LoadStr, dst, 0, idx, e.pos);
            }
            ExprKind::Nil => {
                self.push(Opcode::LoadNil, dst, 0, 0, e.pos);
            }
            ExprKind::NoneLit => {
                self.push(Opcode::MakeNone, dst, 0, 0, e.pos);
            }
            ExprKind::Var(name) => {
                if let Some(reg) = self.lookup_local(name) {
                    if reg != dst {
                        self.push(Opcode::Move, dst, reg, 0, e.pos);
                    }
                } else if let Some(&slot) = self.emitter.global_slots.get(name) {
                    self.push(Opcode::LoadGlobal, dst, 0, slot, e.pos);
                } else {
                    return Err(self.undefined(name, e.pos));
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                self.emit_binary(e, *op, lhs, rhs, dst)?;
            }
            ExprKind::Unary { op, operand } => {
                let save = self.next_reg;
                let t = self.alloc_temp(e.pos)?;
                self.emit_expr(operand, t)?;
                let opcode = match op {
                    UnOp::Not => Opcode::Not,
                    UnOp::Neg => {
                        if self.infer_type(operand) == Some(Type::Float) {
                            Opcode::FNeg
                        } else {
                            Opcode::INeg
                        }
                    }
                };
                self.push(opcode, dst, t, 0, e.pos);
                self.next_reg = save;
            }
            ExprKind::Call { name, args } => {
                self.emit_call(e, name, args, dst)?;
            }
            ExprKind::Invoke { callee, args } => {
                let save = self.next_reg;
                let base = self.alloc_temp(e.pos)?;
                self.emit_expr(callee, base)?;
                for arg in args {
                    let t = self.alloc_temp(e.pos)?;
                    self.emit_expr(arg, t)?;
                }
                self.push(Opcode::Invoke, dst, base, args.len() as u32, e.pos);
                self.next_reg = save;
            }
            ExprKind::Index { base, index } => {
                let save = self.next_reg;
                let tb = self.alloc_temp(e.pos)?;
                self.emit_expr(base, tb)?;
                let ti = self.alloc_temp(e.pos)?;
                self.emit_expr(index, ti)?;
                self.push(Opcode::ArrayGet, dst, tb, ti as u32, e.pos);
                self.next_reg = save;
            }
            ExprKind::Slice { base, lo, hi } => {
                let save = self.next_reg;
                let tb = self.alloc_temp(e.pos)?;
                self.emit_expr(base, tb)?;
                let tl = self.alloc_temp(e.pos)?;
                self.emit_expr(lo, tl)?;
                let th = self.alloc_temp(e.pos)?;
                self.emit_expr(hi, th)?;
                let wide = (tl as u32) | ((th as u32) << 8);
                self.push(Opcode::ArraySlice, dst, tb, wide, e.pos);
                self.next_reg = save;
            }
            ExprKind::Field { base, field } => {
                let save = self.next_reg;
                let tb = self.alloc_temp(e.pos)?;
                self.emit_expr(base, tb)?;
                let idx = self.emitter.intern_string(field)?;
                self.push(Opcode::ObjectGet, dst, tb, idx, e.pos);
                self.next_reg = save;
            }
            ExprKind::NewRef(inner) => {
                let save = self.next_reg;
                let t = self.alloc_temp(e.pos)?;
                self.emit_expr(inner, t)?;
                self.push(Opcode::NewRef, dst, t, 0, e.pos);
                self.next_reg = save;
            }
            ExprKind::Deref(inner) => {
                let save = self.next_reg;
                let t = self.alloc_temp(e.pos)?;
                self.emit_expr(inner, t)?;
                self.push(Opcode::Deref, dst, t, 0, e.pos);
                self.next_reg = save;
            }
            ExprKind::WeakOf(inner) => {
                let save = self.next_reg;
                let t = self.alloc_temp(e.pos)?;
                self.emit_expr(inner, t)?;
                self.push(Opcode::NewWeak, dst, t, 0, e.pos);
                self.next_reg = save;
            }
            ExprKind::SomeOf(inner) => {
                let save = self.next_reg;
                let t = self.alloc_temp(e.pos)?;
                self.emit_expr(inner, t)?;
                self.push(Opcode::MakeSome, dst, t, 0, e.pos);
                self.next_reg = save;
            }
            ExprKind::OkOf(inner) => {
                let save = self.next_reg;
                let t = self.alloc_temp(e.pos)?;
                self.emit_expr(inner, t)?;
                self.push(Opcode::MakeOk, dst, t, 0, e.pos);
                self.next_reg = save;
            }
            ExprKind::ErrOf(inner) => {
                let save = self.next_reg;
                let t = self.alloc_temp(e.pos)?;
                self.emit_expr(inner, t)?;
                self.push(Opcode::MakeErr, dst, t, 0, e.pos);
                self.next_reg = save;
            }
            ExprKind::ArrayLit(items) => {
                let save = self.next_reg;
                let base = self.next_reg as u8;
                for item in items {
                    let t = self.alloc_temp(e.pos)?;
                    self.emit_expr(item, t)?;
                }
                self.push(Opcode::ArrayMake, dst, base, items.len() as u32, e.pos);
                self.next_reg = save;
            }
            ExprKind::TupleLit(items) => {
                let save = self.next_reg;
                let base = self.next_reg as u8;
                for item in items {
                    let t = self.alloc_temp(e.pos)?;
                    self.emit_expr(item, t)?;
                }
                self.push(Opcode::MakeTuple, dst, base, items.len() as u32, e.pos);
                self.next_reg = save;
            }
            ExprKind::ObjectLit { type_name, fields } => {
                let name_idx = self.emitter.intern_string(type_name)?;
                self.push(Opcode::MakeObject, dst, 0, name_idx, e.pos);
                for (field, value) in fields {
                    let save = self.next_reg;
                    let t = self.alloc_temp(e.pos)?;
                    self.emit_expr(value, t)?;
                    let field_idx = self.emitter.intern_string(field)?;
                    self.push(Opcode::ObjectSet, dst, t, field_idx, e.pos);
                    self.next_reg = save;
                }
            }
            ExprKind::EnumLit { enum_name, variant } => {
                let ordinal = self
                    .emitter
                    .program
                    .user_types
                    .enums
                    .get(enum_name)
                    .and_then(|decl: &EnumDecl| {
                        decl.variants.iter().position(|v| v == variant)
                    })
                    .unwrap_or(0);
                let idx = self
                    .emitter
                    .intern_string(&format!("{enum_name}.{variant}"))?;
                self.push(Opcode::MakeEnum, dst, ordinal as u8, idx, e.pos);
            }
            ExprKind::Cast { expr, target } => {
                let save = self.next_reg;
                let t = self.alloc_temp(e.pos)?;
                self.emit_expr(expr, t)?;
                let source = self.infer_type(expr);
                let op = match (source, target) {
                    (Some(Type::Int), Type::Float) => Some(Opcode::CastIntFloat),
                    (Some(Type::Float), Type::Int) => Some(Opcode::CastFloatInt),
                    (Some(Type::Char), Type::Int) => Some(Opcode::CastCharInt),
                    (Some(Type::Int), Type::Char) => Some(Opcode::CastIntChar),
                    _ => None,
                };
                match op {
                    Some(op) => {
                        self.push(op, dst, t, 0, e.pos);
                    }
                    None => {
                        if t != dst {
                            self.push(Opcode::Move, dst, t, 0, e.pos);
                        }
                    }
                }
                self.next_reg = save;
            }
            ExprKind::Lambda { params, body, ret } => {
                self.emit_lambda_expr(e, params, body, ret, dst)?;
            }
            ExprKind::Propagate(inner) => {
                let save = self.next_reg;
                let t = self.alloc_temp(e.pos)?;
                self.emit_expr(inner, t)?;
                let flag = self.alloc_temp(e.pos)?;
                self.push(Opcode::MatchValue, flag, t, match_tag::ERR, e.pos);
                let skip_err = self.push(Opcode::JumpIfFalse, flag, 0, 0, e.pos);
                // err arm: rewrap and return through the defers
                let err_payload = self.alloc_temp(e.pos)?;
                self.push(Opcode::ExtractErr, err_payload, t, 0, e.pos);
                self.push(Opcode::MakeErr, err_payload, err_payload, 0, e.pos);
                self.push(Opcode::Return, err_payload, 0, 0, e.pos);
                let ok_arm = self.here();
                self.patch_wide(skip_err, ok_arm);
                self.push(Opcode::ExtractOk, dst, t, 0, e.pos);
                self.next_reg = save;
            }
            ExprKind::Compiles(_) => {
                // Resolved to a literal by the folder; a stray probe is
                // conservatively false.
                self.push(Opcode::LoadFalse, dst, 0, 0, e.pos);
            }
            ExprKind::Spawn { call } => {
                let ExprKind::Call { name, args } = &call.kind else {
                    return Err(Diagnostic::error(
                        ErrorKind::Compile,
                        "spawn expects a direct function call",
                    )
                    .at(self.emitter.program.file_name(e.pos.file), e.pos));
                };
                let Some((slot, _decl_key)) = self.resolve_user_function(name, args.len()) else {
                    return Err(self.undefined(name, e.pos));
                };
                let save = self.next_reg;
                let base = self.next_reg as u8;
                for arg in args {
                    let t = self.alloc_temp(e.pos)?;
                    self.emit_expr(arg, t)?;
                }
                self.push(
                    Opcode::Spawn,
                    dst,
                    base,
                    pack_call(slot, args.len() as u8),
                    e.pos,
                );
                self.next_reg = save;
            }
            ExprKind::YieldExpr(value) => {
                match value {
                    Some(v) => {
                        let save = self.next_reg;
                        let t = self.alloc_temp(e.pos)?;
                        self.emit_expr(v, t)?;
                        self.push(Opcode::YieldVal, t, 0, 0, e.pos);
                        self.next_reg = save;
                    }
                    None => {
                        self.push(Opcode::YieldVoid, 0, 0, 0, e.pos);
                    }
                }
                self.push(Opcode::LoadNil, dst, 0, 0, e.pos);
            }
            ExprKind::Resume(task) => {
                let save = self.next_reg;
                let t = self.alloc_temp(e.pos)?;
                self.emit_expr(task, t)?;
                self.push(Opcode::Resume, dst, t, 0, e.pos);
                self.next_reg = save;
            }
            ExprKind::MakeChannel { capacity, .. } => {
                let save = self.next_reg;
                let t = self.alloc_temp(e.pos)?;
                self.emit_expr(capacity, t)?;
                self.push(Opcode::ChannelNew, dst, t, 0, e.pos);
                self.next_reg = save;
            }
            ExprKind::ChanSend { chan, value } => {
                let save = self.next_reg;
                let tc = self.alloc_temp(e.pos)?;
                self.emit_expr(chan, tc)?;
                let tv = self.alloc_temp(e.pos)?;
                self.emit_expr(value, tv)?;
                self.push(Opcode::ChannelSend, tc, tv, 0, e.pos);
                self.push(Opcode::LoadNil, dst, 0, 0, e.pos);
                self.next_reg = save;
            }
            ExprKind::ChanRecv { chan } => {
                let save = self.next_reg;
                let tc = self.alloc_temp(e.pos)?;
                self.emit_expr(chan, tc)?;
                self.push(Opcode::ChannelRecv, dst, tc, 0, e.pos);
                self.next_reg = save;
            }
        }
        Ok(())
    }

    fn emit_binary(
        &mut self,
        e: &Expr,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        dst: u8,
    ) -> Result<(), Diagnostic> {
        // Short-circuit logical operators lower to jumps.
        if op == BinOp::And || op == BinOp::Or {
            self.emit_expr(lhs, dst)?;
            let site = self.push(Opcode::JumpIfFalse, dst, 0, 0, e.pos);
            if op == BinOp::And {
                // lhs true: result is rhs.
                self.emit_expr(rhs, dst)?;
                let end = self.here();
                self.patch_wide(site, end);
            } else {
                // lhs false: result is rhs; lhs true: keep true.
                let to_end = self.push(Opcode::Jump, 0, 0, 0, e.pos);
                let rhs_start = self.here();
                self.patch_wide(site, rhs_start);
                self.emit_expr(rhs, dst)?;
                let end = self.here();
                self.patch_wide(to_end, end);
            }
            return Ok(());
        }

        let save = self.next_reg;
        let tl = self.alloc_temp(e.pos)?;
        self.emit_expr(lhs, tl)?;
        let tr = self.alloc_temp(e.pos)?;
        self.emit_expr(rhs, tr)?;

        let lt = self.infer_type(lhs);
        let rt = self.infer_type(rhs);
        let stringy = lt == Some(Type::Str) || rt == Some(Type::Str);
        let floaty = lt == Some(Type::Float) || rt == Some(Type::Float);
        let nil_cmp = matches!(lhs.kind, ExprKind::Nil | ExprKind::NoneLit)
            || matches!(rhs.kind, ExprKind::Nil | ExprKind::NoneLit);
        let inty = !stringy && !floaty && !nil_cmp
            && (lt == Some(Type::Int)
                || rt == Some(Type::Int)
                || lt == Some(Type::Char)
                || rt == Some(Type::Char)
                || (lt.is_none() || rt.is_none()));

        let opcode = match op {
            BinOp::Add if stringy => Opcode::SConcat,
            BinOp::Add if floaty => Opcode::FAdd,
            BinOp::Add => Opcode::IAdd,
            BinOp::Sub if floaty => Opcode::FSub,
            BinOp::Sub => Opcode::ISub,
            BinOp::Mul if floaty => Opcode::FMul,
            BinOp::Mul => Opcode::IMul,
            BinOp::Div if floaty => Opcode::FDiv,
            BinOp::Div => Opcode::IDiv,
            BinOp::Mod if floaty => Opcode::FMod,
            BinOp::Mod => Opcode::IMod,
            BinOp::Eq if stringy => Opcode::SEq,
            BinOp::Eq if floaty => Opcode::FEq,
            BinOp::Eq if inty => Opcode::IEq,
            BinOp::Eq => Opcode::Eq,
            BinOp::Ne if stringy => Opcode::SNe,
            BinOp::Ne if floaty => Opcode::FNe,
            BinOp::Ne if inty => Opcode::INe,
            BinOp::Ne => Opcode::Ne,
            BinOp::Lt if stringy => Opcode::SLt,
            BinOp::Lt if floaty => Opcode::FLt,
            BinOp::Lt => Opcode::ILt,
            BinOp::Le if floaty => Opcode::FLe,
            BinOp::Le => Opcode::ILe,
            BinOp::Gt if floaty => Opcode::FGt,
            BinOp::Gt => Opcode::IGt,
            BinOp::Ge if floaty => Opcode::FGe,
            BinOp::Ge => Opcode::IGe,
            BinOp::And | BinOp::Or => unreachable!("lowered above"),
        };
        self.push(opcode, dst, tl, tr as u32, e.pos);
        self.next_reg = save;
        Ok(())
    }

    fn resolve_user_function(&self, name: &str, argc: usize) -> Option<(u32, String)> {
        let program = self.emitter.program;
        if let Some(decl) = program.resolve(name) {
            let key = decl.key();
            return self.emitter.func_slots.get(&key).map(|&s| (s, key));
        }
        // Ambiguous overload set: pick by arity when unique.
        let keys = program.overloads.get(name)?;
        let matching: Vec<&String> = keys
            .iter()
            .filter(|k| {
                program
                    .functions
                    .get(*k)
                    .map(|d| d.params.len() == argc)
                    .unwrap_or(false)
            })
            .collect();
        if matching.len() == 1 {
            let key = matching[0].clone();
            return self.emitter.func_slots.get(&key).map(|&s| (s, key));
        }
        None
    }

    fn emit_call(
        &mut self,
        e: &Expr,
        name: &str,
        args: &[Expr],
        dst: u8,
    ) -> Result<(), Diagnostic> {
        // A local closure variable takes precedence over a builtin name.
        if self.lookup_local(name).is_some() {
            let callee = Expr::new(
                ExprKind::Var(name.to_string()),
                Type::Inferred,
                e.pos,
            );
            let invoke = ExprKind::Invoke {
                callee: Box::new(callee),
                args: args.to_vec(),
            };
            let expr = Expr::new(invoke, e.ty.clone(), e.pos);
            return self.emit_expr(&expr, dst);
        }

        // User functions shadow builtins.
        if let Some((slot, key)) = self.resolve_user_function(name, args.len()) {
            let decl = &self.emitter.program.functions[&key];
            let kind = if decl.flags.cffi {
                FuncKind::Cffi
            } else if decl.flags.host {
                FuncKind::Host
            } else {
                FuncKind::Native
            };
            // Fill omitted trailing arguments from declared defaults.
            let mut full_args: Vec<Expr> = args.to_vec();
            if full_args.len() < decl.params.len() {
                for p in decl.params.iter().skip(full_args.len()) {
                    match &p.default {
                        Some(d) => full_args.push(d.clone()),
                        None => break,
                    }
                }
            }
            let save = self.next_reg;
            let base = self.next_reg as u8;
            for arg in &full_args {
                let t = self.alloc_temp(e.pos)?;
                self.emit_expr(arg, t)?;
            }
            match kind {
                FuncKind::Native => {
                    self.push(
                        Opcode::Call,
                        dst,
                        base,
                        pack_call(slot, full_args.len() as u8),
                        e.pos,
                    );
                }
                FuncKind::Host => {
                    let name_idx = self.emitter.intern_string(&decl.name)?;
                    self.push(
                        Opcode::CallHost,
                        dst,
                        base,
                        pack_call(name_idx, full_args.len() as u8),
                        e.pos,
                    );
                }
                FuncKind::Cffi => {
                    let cffi_idx = self.emitter.cffi_slots[&key];
                    self.push(
                        Opcode::CallCffi,
                        dst,
                        base,
                        pack_call(cffi_idx, full_args.len() as u8),
                        e.pos,
                    );
                }
                FuncKind::Builtin => unreachable!("builtins are filtered out of the table"),
            }
            self.next_reg = save;
            return Ok(());
        }

        if let Some(bid) = builtins::lookup(name) {
            let save = self.next_reg;
            let base = self.next_reg as u8;
            for arg in args {
                let t = self.alloc_temp(e.pos)?;
                self.emit_expr(arg, t)?;
            }
            self.push(
                Opcode::Builtin,
                dst,
                base,
                pack_call(bid, args.len() as u8),
                e.pos,
            );
            self.next_reg = save;
            return Ok(());
        }

        Err(Diagnostic::error(
            ErrorKind::Compile,
            format!("unknown function '{name}'"),
        )
        .at(self.emitter.program.file_name(e.pos.file), e.pos))
    }

    fn emit_lambda_expr(
        &mut self,
        e: &Expr,
        params: &[crate::ast::Param],
        body: &[Stmt],
        ret: &Type,
        dst: u8,
    ) -> Result<(), Diagnostic> {
        // Free variables of the body become captures, in lookup order.
        let mut captures: Vec<String> = Vec::new();
        let mut declared: Vec<String> = params.iter().map(|p| p.name.clone()).collect();
        collect_free_vars(body, &mut declared, &mut |name| {
            if self.lookup_local(name).is_some() && !captures.contains(&name.to_string()) {
                captures.push(name.to_string());
            }
        });

        let lambda_name = format!("{}$lambda{}", self.func_name, self.emitter.lambda_counter);
        self.emitter.lambda_counter += 1;

        // Reserve the function table slot now so MakeClosure can reference it.
        let slot = self.emitter.out.functions.len() as u32;
        self.emitter.out.functions.push(FunctionInfo {
            name: lambda_name.clone(),
            start_pc: 0,
            end_pc: 0,
            kind: FuncKind::Native,
            param_count: (captures.len() + params.len()) as u8,
            max_register: 0,
            param_names: Vec::new(),
            return_type_code: ret.code(),
        });

        let decl = FunctionDecl {
            name: lambda_name.clone(),
            type_params: Vec::new(),
            params: params.to_vec(),
            ret: ret.clone(),
            body: body.to_vec(),
            flags: Default::default(),
            uses_result_propagation: false,
            first_propagation_pos: None,
            extern_library: None,
            pos: e.pos,
        };
        self.emitter.pending_lambdas.push(PendingLambda {
            slot,
            name: lambda_name,
            captures: captures.clone(),
            decl,
        });

        let save = self.next_reg;
        let base = self.next_reg as u8;
        for cap in &captures {
            let t = self.alloc_temp(e.pos)?;
            let src = self.lookup_local(cap).expect("capture is a local");
            if src != t {
                self.push(Opcode::Move, t, src, 0, e.pos);
            }
        }
        self.push(
            Opcode::MakeClosure,
            dst,
            base,
            pack_call(slot, captures.len() as u8),
            e.pos,
        );
        self.next_reg = save;
        Ok(())
    }

    /// Best-effort static type of an expression, for typed opcode selection.
    fn infer_type(&self, e: &Expr) -> Option<Type> {
        match &e.kind {
            ExprKind::Int(_) => Some(Type::Int),
            ExprKind::Float(_) => Some(Type::Float),
            ExprKind::Bool(_) => Some(Type::Bool),
            ExprKind::Char(_) => Some(Type::Char),
            ExprKind::Str(_) => Some(Type::Str),
            ExprKind::ArrayLit(_) => Some(Type::Array(Box::new(Type::Inferred))),
            ExprKind::Var(name) => self.local_types.get(name).cloned().filter(|t| *t != Type::Inferred),
            ExprKind::Binary { op, lhs, rhs } => {
                if op.is_comparison() || op.is_logical() {
                    return Some(Type::Bool);
                }
                self.infer_type(lhs).or_else(|| self.infer_type(rhs))
            }
            ExprKind::Unary { op: UnOp::Not, .. } => Some(Type::Bool),
            ExprKind::Unary { operand, .. } => self.infer_type(operand),
            ExprKind::Cast { target, .. } => Some(target.clone()),
            ExprKind::Call { name, .. } => {
                let decl = self.emitter.program.resolve(name)?;
                (decl.ret != Type::Inferred).then(|| decl.ret.clone())
            }
            ExprKind::SomeOf(_) => Some(Type::Option(Box::new(Type::Inferred))),
            ExprKind::OkOf(_) | ExprKind::ErrOf(_) => Some(Type::ResultTy(
                Box::new(Type::Inferred),
                Box::new(Type::Inferred),
            )),
            _ => {
                if e.ty != Type::Inferred {
                    Some(e.ty.clone())
                } else {
                    None
                }
            }
        }
    }
}

/// Walk statements calling `visit` on every variable read that is not locally
/// declared (lambda capture discovery).
fn collect_free_vars(
    body: &[Stmt],
    declared: &mut Vec<String>,
    visit: &mut impl FnMut(&str),
) {
    fn walk_expr(e: &Expr, declared: &mut Vec<String>, visit: &mut impl FnMut(&str)) {
        match &e.kind {
            ExprKind::Var(name) => {
                if !declared.contains(name) {
                    visit(name);
                }
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                walk_expr(lhs, declared, visit);
                walk_expr(rhs, declared, visit);
            }
            ExprKind::Unary { operand, .. } => walk_expr(operand, declared, visit),
            ExprKind::Call { args, .. } => args.iter().for_each(|a| walk_expr(a, declared, visit)),
            ExprKind::Invoke { callee, args } => {
                walk_expr(callee, declared, visit);
                args.iter().for_each(|a| walk_expr(a, declared, visit));
            }
            ExprKind::Index { base, index } => {
                walk_expr(base, declared, visit);
                walk_expr(index, declared, visit);
            }
            ExprKind::Slice { base, lo, hi } => {
                walk_expr(base, declared, visit);
                walk_expr(lo, declared, visit);
                walk_expr(hi, declared, visit);
            }
            ExprKind::Field { base, .. } => walk_expr(base, declared, visit),
            ExprKind::ArrayLit(items) | ExprKind::TupleLit(items) => {
                items.iter().for_each(|a| walk_expr(a, declared, visit))
            }
            ExprKind::NewRef(x)
            | ExprKind::Deref(x)
            | ExprKind::WeakOf(x)
            | ExprKind::SomeOf(x)
            | ExprKind::OkOf(x)
            | ExprKind::ErrOf(x)
            | ExprKind::Propagate(x) => walk_expr(x, declared, visit),
            ExprKind::Cast { expr, .. } => walk_expr(expr, declared, visit),
            ExprKind::Lambda { params, body, .. } => {
                let depth = declared.len();
                declared.extend(params.iter().map(|p| p.name.clone()));
                walk_stmts(body, declared, visit);
                declared.truncate(depth);
            }
            ExprKind::Spawn { call } => walk_expr(call, declared, visit),
            ExprKind::YieldExpr(Some(v)) => walk_expr(v, declared, visit),
            ExprKind::Resume(t) => walk_expr(t, declared, visit),
            ExprKind::ObjectLit { fields, .. } => {
                fields.iter().for_each(|(_, v)| walk_expr(v, declared, visit))
            }
            ExprKind::MakeChannel { capacity, .. } => walk_expr(capacity, declared, visit),
            ExprKind::ChanSend { chan, value } => {
                walk_expr(chan, declared, visit);
                walk_expr(value, declared, visit);
            }
            ExprKind::ChanRecv { chan } => walk_expr(chan, declared, visit),
            _ => {}
        }
    }
    fn walk_stmts(body: &[Stmt], declared: &mut Vec<String>, visit: &mut impl FnMut(&str)) {
        let depth = declared.len();
        for stmt in body {
            match &stmt.kind {
                StmtKind::Let { name, init, .. } => {
                    if let Some(e) = init {
                        walk_expr(e, declared, visit);
                    }
                    declared.push(name.clone());
                }
                StmtKind::Assign { target, value } => {
                    walk_expr(value, declared, visit);
                    match target {
                        LValue::Var(name) => {
                            if !declared.contains(name) {
                                visit(name);
                            }
                        }
                        LValue::Index { base, index } => {
                            walk_expr(base, declared, visit);
                            walk_expr(index, declared, visit);
                        }
                        LValue::Field { base, .. } => walk_expr(base, declared, visit),
                        LValue::Deref(base) => walk_expr(base, declared, visit),
                    }
                }
                StmtKind::ExprStmt(e) => walk_expr(e, declared, visit),
                StmtKind::If {
                    cond,
                    then_body,
                    else_body,
                } => {
                    walk_expr(cond, declared, visit);
                    walk_stmts(then_body, declared, visit);
                    walk_stmts(else_body, declared, visit);
                }
                StmtKind::While { cond, body } => {
                    walk_expr(cond, declared, visit);
                    walk_stmts(body, declared, visit);
                }
                StmtKind::For {
                    var,
                    from,
                    to,
                    body,
                } => {
                    walk_expr(from, declared, visit);
                    walk_expr(to, declared, visit);
                    declared.push(var.clone());
                    walk_stmts(body, declared, visit);
                }
                StmtKind::Return(Some(e)) => walk_expr(e, declared, visit),
                StmtKind::Block(b) | StmtKind::Defer(b) | StmtKind::Comptime(b) => {
                    walk_stmts(b, declared, visit)
                }
                _ => {}
            }
        }
        declared.truncate(depth);
    }
    walk_stmts(body, declared, visit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builder::*;

    fn emit(program: &Program) -> BytecodeProgram {
        emit_program(program, &CodegenOptions::default()).expect("emit")
    }

    #[test]
    fn test_simple_function_lowers() {
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![
                let_stmt("a", Type::Int, int(2)),
                let_stmt("b", Type::Int, int(3)),
                ret(binary(BinOp::Add, var("a"), var("b"))),
            ],
        ));
        let out = emit(&program);
        let main = &out.functions[out.find_function("main").unwrap()];
        assert_eq!(main.kind, FuncKind::Native);
        assert!(main.end_pc > main.start_pc);
        let ops: Vec<Opcode> = out.code[main.start_pc as usize..main.end_pc as usize]
            .iter()
            .map(|i| i.op)
            .collect();
        assert!(ops.contains(&Opcode::IAdd));
        assert!(ops.contains(&Opcode::Return));
    }

    #[test]
    fn test_big_int_goes_to_pool() {
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![ret(int(9_000_000_000_000_000_000))],
        ));
        let out = emit(&program);
        assert_eq!(out.ints, vec![9_000_000_000_000_000_000]);
        assert!(out.code.iter().any(|i| i.op == Opcode::LoadConstInt));
    }

    #[test]
    fn test_globals_get_init_function() {
        let mut program = Program::new();
        program.globals.push(let_stmt("n", Type::Int, int(42)));
        program.add_function(func("main", vec![], Type::Int, vec![ret(var("n"))]));
        let out = emit(&program);
        assert_eq!(out.globals.len(), 1);
        assert_eq!(out.globals[0].initial, InitialValue::Int(42));
        assert!(out.find_function("<global>").is_some());
        assert!(out.code.iter().any(|i| i.op == Opcode::InitGlobal));
        assert!(out.code.iter().any(|i| i.op == Opcode::LoadGlobal));
    }

    #[test]
    fn test_branch_targets_verify() {
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![
                let_stmt("x", Type::Int, int(1)),
                if_stmt(
                    binary(BinOp::Lt, var("x"), int(5)),
                    vec![ret(int(1))],
                    vec![ret(int(0))],
                ),
            ],
        ));
        let out = emit(&program);
        assert!(out.verify().is_ok());
    }

    #[test]
    fn test_builtin_call_uses_builtin_opcode() {
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Void,
            vec![expr_stmt(call("print", vec![string("hi")]))],
        ));
        let out = emit(&program);
        assert!(out.code.iter().any(|i| i.op == Opcode::Builtin));
    }

    #[test]
    fn test_propagate_lowers_to_match_and_return() {
        let mut program = Program::new();
        program.add_function(func(
            "parse",
            vec![param("s", Type::Str)],
            Type::ResultTy(Box::new(Type::Int), Box::new(Type::Str)),
            vec![ret(call("parseInt", vec![var("s")]))],
        ));
        program.add_function(func(
            "run",
            vec![],
            Type::ResultTy(Box::new(Type::Int), Box::new(Type::Str)),
            vec![
                let_stmt("n", Type::Int, propagate(call("parse", vec![string("12")]))),
                ret(ok_of(var("n"))),
            ],
        ));
        let out = emit(&program);
        assert!(out.code.iter().any(|i| i.op == Opcode::MatchValue));
        assert!(out.code.iter().any(|i| i.op == Opcode::ExtractOk));
        assert!(out.code.iter().any(|i| i.op == Opcode::ExtractErr));
    }

    #[test]
    fn test_lambda_emits_closure() {
        use crate::ast::{Expr, ExprKind};
        let lambda = Expr::new(
            ExprKind::Lambda {
                params: vec![param("y", Type::Int)],
                body: vec![ret(binary(BinOp::Add, var("x"), var("y")))],
                ret: Type::Int,
            },
            Type::Inferred,
            SourcePos::unknown(),
        );
        let invoke = Expr::new(
            ExprKind::Invoke {
                callee: Box::new(var("f")),
                args: vec![int(10)],
            },
            Type::Inferred,
            SourcePos::unknown(),
        );
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![
                let_stmt("x", Type::Int, int(5)),
                let_stmt("f", Type::Inferred, lambda),
                ret(invoke),
            ],
        ));
        let out = emit(&program);
        assert!(out.code.iter().any(|i| i.op == Opcode::MakeClosure));
        assert!(out.code.iter().any(|i| i.op == Opcode::Invoke));
        // The lambda body landed in the function table.
        assert!(out.functions.iter().any(|f| f.name.contains("$lambda")));
    }
}
