//! The safety prover.
//!
//! Abstract interpretation over environments of `Info` values: statements
//! fold through a transfer function, branches refine per-successor copies of
//! the environment, merge points join pointwise. Functions get lazily
//! memoized contracts; pure calls over literal arguments are run through the
//! symbolic executor. The prover reports diagnostics and never rewrites the
//! program.

pub mod contracts;
pub mod env;
pub mod info;
pub mod interval;
pub mod symexec;
pub mod unused;

pub use contracts::{Contract, ParamConstraint};
pub use env::Env;
pub use info::Info;
pub use interval::{complement, intersect, normalize, union, Interval, IMAX, IMIN};
pub use symexec::MAX_LOOP_ITERATIONS;

use crate::ast::{
    BinOp, Expr, ExprKind, FunctionDecl, LValue, Program, SourcePos, Stmt, StmtKind, Type, UnOp,
};
use crate::diagnostics::{Diagnostic, ErrorKind};
use interval::{sat_add, sat_mul, sat_sub};
use rustc_hash::{FxHashMap, FxHashSet};
use symexec::SymValue;

/// Run the prover over a whole program. Returns every diagnostic found;
/// compilation proceeds only when no error-severity diagnostic is present.
pub fn check_program(program: &Program) -> Vec<Diagnostic> {
    let mut prover = Prover::new(program);
    prover.run();
    prover.diags
}

struct Prover<'p> {
    program: &'p Program,
    diags: Vec<Diagnostic>,
    contracts: FxHashMap<String, Contract>,
    contract_stack: FxHashSet<String>,
    purity: FxHashMap<String, bool>,
    purity_stack: FxHashSet<String>,
    global_info: FxHashMap<String, Info>,
}

/// Per-function analysis state.
struct FnCtx {
    /// Parameter name → position, for precondition inference
    params: FxHashMap<String, usize>,
    pre: Vec<ParamConstraint>,
    returns: Vec<Info>,
    /// Suppress reporting and constraint recording during the re-evaluation
    /// that `apply_constraints` performs on condition operands.
    quiet: u32,
}

impl FnCtx {
    fn for_decl(decl: &FunctionDecl) -> Self {
        FnCtx {
            params: decl
                .params
                .iter()
                .enumerate()
                .map(|(i, p)| (p.name.clone(), i))
                .collect(),
            pre: Vec::new(),
            returns: Vec::new(),
            quiet: 0,
        }
    }
}

impl<'p> Prover<'p> {
    fn new(program: &'p Program) -> Self {
        Prover {
            program,
            diags: Vec::new(),
            contracts: FxHashMap::default(),
            contract_stack: FxHashSet::default(),
            purity: FxHashMap::default(),
            purity_stack: FxHashSet::default(),
            global_info: FxHashMap::default(),
        }
    }

    fn run(&mut self) {
        self.check_globals();

        let mut keys: Vec<String> = self.program.functions.keys().cloned().collect();
        keys.sort();

        for key in &keys {
            let program = self.program;
            let decl = &program.functions[key];
            if decl.flags.builtin || decl.flags.host || decl.flags.cffi {
                continue;
            }
            self.check_signature(decl);
            // Analyzes at most once; call sites may already have forced it.
            self.get_contract(key);
        }

        for key in &keys {
            let decl = &self.program.functions[key];
            if decl.flags.builtin || decl.flags.host || decl.flags.cffi {
                continue;
            }
            for finding in unused::sweep(decl, &self.program.user_types) {
                self.push_diag(
                    Diagnostic::error(ErrorKind::Prove, format!("unused variable '{}'", finding.name))
                        .at(self.program.file_name(finding.pos.file), finding.pos),
                    finding.pos,
                );
            }
        }
    }

    fn check_globals(&mut self) {
        let program = self.program;
        let mut env = Env::new();
        let mut fx = FnCtx {
            params: FxHashMap::default(),
            pre: Vec::new(),
            returns: Vec::new(),
            quiet: 0,
        };
        for stmt in &program.globals {
            self.exec_stmt(&mut env, stmt, &mut fx);
        }
        // Function bodies see globals at type precision only: execution order
        // and host overrides make value-level facts unsound across calls.
        for (name, ty) in &env.types {
            self.global_info.insert(name.clone(), type_info(ty));
        }
    }

    fn check_signature(&mut self, decl: &FunctionDecl) {
        if decl.name == "main" && !matches!(decl.ret, Type::Void | Type::Int) {
            self.push_diag(
                Diagnostic::error(
                    ErrorKind::Prove,
                    format!("main must return void or int, found '{}'", decl.ret),
                )
                .at(self.program.file_name(decl.pos.file), decl.pos),
                decl.pos,
            );
        }
        // `?` in main is the documented exception: an err arm becomes a
        // nonzero process exit instead of a propagated result.
        if decl.uses_result_propagation
            && decl.name != "main"
            && !matches!(decl.ret, Type::ResultTy(_, _))
        {
            let pos = decl.first_propagation_pos.unwrap_or(decl.pos);
            self.push_diag(
                Diagnostic::error(
                    ErrorKind::Prove,
                    format!(
                        "operator '?' requires a result return type, but '{}' returns '{}'",
                        decl.name, decl.ret
                    ),
                )
                .at(self.program.file_name(pos.file), pos),
                pos,
            );
        }
    }

    fn push_diag(&mut self, mut diag: Diagnostic, pos: SourcePos) {
        if let Some(origin) = self.program.origin_name(pos.origin) {
            diag = diag.in_function(origin);
        }
        self.diags.push(diag);
    }

    fn report(&mut self, fx: &FnCtx, pos: SourcePos, message: String) {
        if fx.quiet > 0 {
            return;
        }
        let diag = Diagnostic::error(ErrorKind::Prove, message)
            .at(self.program.file_name(pos.file), pos);
        self.push_diag(diag, pos);
    }

    fn warn(&mut self, fx: &FnCtx, pos: SourcePos, message: String) {
        if fx.quiet > 0 {
            return;
        }
        let diag = Diagnostic::warning(ErrorKind::Prove, message)
            .at(self.program.file_name(pos.file), pos);
        self.push_diag(diag, pos);
    }

    // ========================================================================
    // Contracts
    // ========================================================================

    fn get_contract(&mut self, key: &str) -> Contract {
        if let Some(c) = self.contracts.get(key) {
            return c.clone();
        }
        if self.contract_stack.contains(key) {
            return Contract::unknown();
        }
        let program = self.program;
        let Some(decl) = program.functions.get(key) else {
            return Contract::unknown();
        };
        if decl.flags.builtin || decl.flags.host || decl.flags.cffi {
            let c = Contract::unknown();
            self.contracts.insert(key.to_string(), c.clone());
            return c;
        }
        self.contract_stack.insert(key.to_string());
        let contract = self.analyze_function(decl);
        self.contract_stack.remove(key);
        self.contracts.insert(key.to_string(), contract.clone());
        contract
    }

    /// Analyze a function body once: emits its diagnostics, collects the
    /// parameter preconditions and the join of return-site values.
    fn analyze_function(&mut self, decl: &FunctionDecl) -> Contract {
        let mut env = Env::new();
        for p in &decl.params {
            env.declare(&p.name, p.ty.clone(), type_info(&p.ty), decl.pos);
        }
        let mut fx = FnCtx::for_decl(decl);
        let body = &decl.body;
        self.exec_block(&mut env, body, &mut fx);

        let post = fx
            .returns
            .iter()
            .skip(1)
            .fold(fx.returns.first().cloned().unwrap_or_else(Info::unknown), |acc, i| {
                acc.union_with(i)
            });
        let mut pre = fx.pre;
        dedupe_constraints(&mut pre);
        Contract {
            pre,
            post,
            pure: self.is_pure(&decl.key()),
        }
    }

    // ========================================================================
    // Purity
    // ========================================================================

    fn is_pure(&mut self, key: &str) -> bool {
        if let Some(&p) = self.purity.get(key) {
            return p;
        }
        if self.purity_stack.contains(key) {
            // Recursion alone does not make a function impure.
            return true;
        }
        let program = self.program;
        let Some(decl) = program.functions.get(key) else {
            return false;
        };
        if decl.flags.builtin || decl.flags.host || decl.flags.cffi {
            return false;
        }
        self.purity_stack.insert(key.to_string());
        let mut locals: FxHashSet<String> =
            decl.params.iter().map(|p| p.name.clone()).collect();
        let pure = self.stmts_pure(&decl.body, &mut locals);
        self.purity_stack.remove(key);
        self.purity.insert(key.to_string(), pure);
        pure
    }

    fn stmts_pure(&mut self, body: &[Stmt], locals: &mut FxHashSet<String>) -> bool {
        body.iter().all(|stmt| match &stmt.kind {
            StmtKind::Let { name, init, .. } => {
                let ok = init.as_ref().map_or(true, |e| self.expr_pure(e, locals));
                locals.insert(name.clone());
                ok
            }
            StmtKind::Assign { target, value } => {
                let target_local = target.base_var().map_or(false, |v| locals.contains(v));
                target_local && self.expr_pure(value, locals)
            }
            StmtKind::ExprStmt(e) => self.expr_pure(e, locals),
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                self.expr_pure(cond, locals)
                    && self.stmts_pure(then_body, locals)
                    && self.stmts_pure(else_body, locals)
            }
            StmtKind::While { cond, body } => {
                self.expr_pure(cond, locals) && self.stmts_pure(body, locals)
            }
            StmtKind::For {
                var, from, to, body, ..
            } => {
                locals.insert(var.clone());
                self.expr_pure(from, locals)
                    && self.expr_pure(to, locals)
                    && self.stmts_pure(body, locals)
            }
            StmtKind::Return(e) => e.as_ref().map_or(true, |e| self.expr_pure(e, locals)),
            StmtKind::Block(body) => self.stmts_pure(body, locals),
            StmtKind::Break | StmtKind::Continue => true,
            StmtKind::Defer(_) | StmtKind::Comptime(_) => false,
        })
    }

    fn expr_pure(&mut self, expr: &Expr, locals: &mut FxHashSet<String>) -> bool {
        const IMPURE_BUILTINS: &[&str] = &["print", "println", "rand", "seed", "readFile", "inject"];
        match &expr.kind {
            ExprKind::Call { name, args } => {
                if IMPURE_BUILTINS.contains(&name.as_str()) {
                    return false;
                }
                if !args.iter().all(|a| self.expr_pure(a, locals)) {
                    return false;
                }
                if crate::vm::builtins::lookup(name).is_some() {
                    return true;
                }
                let program = self.program;
                match program.resolve(name) {
                    Some(decl) => self.is_pure(&decl.key()),
                    None => false,
                }
            }
            ExprKind::Spawn { .. }
            | ExprKind::YieldExpr(_)
            | ExprKind::Resume(_)
            | ExprKind::MakeChannel { .. }
            | ExprKind::ChanSend { .. }
            | ExprKind::ChanRecv { .. }
            | ExprKind::Invoke { .. } => false,
            ExprKind::Binary { lhs, rhs, .. } => {
                self.expr_pure(lhs, locals) && self.expr_pure(rhs, locals)
            }
            ExprKind::Unary { operand, .. } => self.expr_pure(operand, locals),
            ExprKind::Index { base, index } => {
                self.expr_pure(base, locals) && self.expr_pure(index, locals)
            }
            ExprKind::Slice { base, lo, hi } => {
                self.expr_pure(base, locals)
                    && self.expr_pure(lo, locals)
                    && self.expr_pure(hi, locals)
            }
            ExprKind::Field { base, .. } => self.expr_pure(base, locals),
            ExprKind::ArrayLit(items) | ExprKind::TupleLit(items) => {
                items.iter().all(|e| self.expr_pure(e, locals))
            }
            ExprKind::NewRef(e)
            | ExprKind::Deref(e)
            | ExprKind::WeakOf(e)
            | ExprKind::SomeOf(e)
            | ExprKind::OkOf(e)
            | ExprKind::ErrOf(e)
            | ExprKind::Propagate(e) => self.expr_pure(e, locals),
            ExprKind::Cast { expr, .. } => self.expr_pure(expr, locals),
            ExprKind::ObjectLit { fields, .. } => {
                fields.iter().all(|(_, e)| self.expr_pure(e, locals))
            }
            ExprKind::Lambda { .. } | ExprKind::Compiles(_) => true,
            ExprKind::Var(name) => {
                // Reading a global is pure; writing one is caught above.
                let _ = name;
                true
            }
            _ => true,
        }
    }

    // ========================================================================
    // Statement transfer
    // ========================================================================

    fn exec_block(&mut self, env: &mut Env, body: &[Stmt], fx: &mut FnCtx) {
        for stmt in body {
            if env.unreachable {
                break;
            }
            self.exec_stmt(env, stmt, fx);
        }
    }

    fn exec_stmt(&mut self, env: &mut Env, stmt: &Stmt, fx: &mut FnCtx) {
        match &stmt.kind {
            StmtKind::Let { name, ty, init } => match init {
                Some(e) => {
                    let mut info = self.eval_expr(env, e, fx);
                    info.initialized = true;
                    let declared_ty = if *ty == Type::Inferred {
                        static_type_of(e).unwrap_or(Type::Inferred)
                    } else {
                        ty.clone()
                    };
                    env.declare(name, declared_ty, info, stmt.pos);
                }
                None => {
                    env.declare(name, ty.clone(), Info::uninitialized(), stmt.pos);
                }
            },
            StmtKind::Assign { target, value } => {
                let info = self.eval_expr(env, value, fx);
                match target {
                    LValue::Var(name) => {
                        env.set(name, info);
                    }
                    LValue::Index { base, index } => {
                        let base_info = self.eval_expr(env, base, fx);
                        let idx_info = self.eval_expr(env, index, fx);
                        self.check_index(&base_info, &idx_info, base, index, stmt.pos, fx);
                        if let Some(root) = target.base_var() {
                            env.invalidate_rooted(root);
                        }
                    }
                    LValue::Field { base, .. } => {
                        self.eval_expr(env, base, fx);
                        if let Some(root) = target.base_var() {
                            env.invalidate_rooted(root);
                        }
                    }
                    LValue::Deref(base) => {
                        let base_info = self.eval_expr(env, base, fx);
                        self.check_deref(env, &base_info, base, stmt.pos, fx);
                        if let Some(root) = target.base_var() {
                            env.invalidate_rooted(root);
                        }
                    }
                }
            }
            StmtKind::ExprStmt(e) => {
                self.eval_expr(env, e, fx);
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                let cond_info = self.eval_expr(env, cond, fx);
                if cond_info.known && cond_info.is_bool {
                    // Constant condition: only the live branch contributes.
                    let live = if cond_info.cval != 0 {
                        then_body
                    } else {
                        else_body
                    };
                    let mut branch = env.copy_env();
                    self.apply_constraints(&mut branch, cond, cond_info.cval != 0, fx);
                    self.exec_block(&mut branch, live, fx);
                    *env = branch;
                    return;
                }
                let mut then_env = env.copy_env();
                self.apply_constraints(&mut then_env, cond, true, fx);
                self.exec_block(&mut then_env, then_body, fx);

                let mut else_env = env.copy_env();
                self.apply_constraints(&mut else_env, cond, false, fx);
                self.exec_block(&mut else_env, else_body, fx);

                *env = then_env.union_env(&else_env);
            }
            StmtKind::While { cond, body } => {
                let cond_info = self.eval_expr(env, cond, fx);
                if cond_info.known && cond_info.is_bool && cond_info.cval == 0 {
                    self.warn(
                        fx,
                        stmt.pos,
                        "loop body is unreachable (condition is always false)".to_string(),
                    );
                    return;
                }
                let assigned = collect_assigned(body);
                let mut body_env = env.copy_env();
                for name in &assigned {
                    let ty = env.types.get(name).cloned().unwrap_or(Type::Inferred);
                    if body_env.get(name).is_some() {
                        body_env.set(name, type_info(&ty));
                    }
                }
                self.apply_constraints(&mut body_env, cond, true, fx);
                self.exec_block(&mut body_env, body, fx);

                let mut after = env.union_env(&body_env);
                after.unreachable = false;
                self.apply_constraints(&mut after, cond, false, fx);
                *env = after;
            }
            StmtKind::For {
                var,
                from,
                to,
                body,
            } => {
                let from_info = self.eval_expr(env, from, fx);
                let to_info = self.eval_expr(env, to, fx);
                if from_info.known && to_info.known && from_info.cval >= to_info.cval {
                    self.warn(
                        fx,
                        stmt.pos,
                        "loop body is unreachable (empty range)".to_string(),
                    );
                    return;
                }
                let assigned = collect_assigned(body);
                let mut body_env = env.copy_env();
                for name in &assigned {
                    let ty = env.types.get(name).cloned().unwrap_or(Type::Inferred);
                    if body_env.get(name).is_some() {
                        body_env.set(name, type_info(&ty));
                    }
                }
                let lo = from_info.minv;
                let hi = sat_sub(to_info.maxv, 1);
                let induction = if lo <= hi {
                    Info::range(lo, hi)
                } else {
                    Info::unknown()
                };
                body_env.declare(var, Type::Int, induction, stmt.pos);
                self.exec_block(&mut body_env, body, fx);

                body_env.vars.remove(var);
                body_env.types.remove(var);
                let mut after = env.union_env(&body_env);
                after.unreachable = false;
                *env = after;
            }
            StmtKind::Return(expr) => {
                let info = match expr {
                    Some(e) => self.eval_expr(env, e, fx),
                    None => Info::unknown(),
                };
                if fx.quiet == 0 {
                    fx.returns.push(info);
                }
                env.unreachable = true;
            }
            StmtKind::Block(body) => {
                self.exec_block(env, body, fx);
            }
            StmtKind::Defer(body) => {
                // Deferred blocks run on every exit path; analyze against the
                // state at registration, which under-approximates but keeps
                // their own failure classes covered.
                let mut defer_env = env.copy_env();
                self.exec_block(&mut defer_env, body, fx);
            }
            StmtKind::Break | StmtKind::Continue => {
                env.unreachable = true;
            }
            StmtKind::Comptime(_) => {
                // Executed and removed by the folder; nothing left to prove.
            }
        }
    }

    // ========================================================================
    // Expression transfer
    // ========================================================================

    fn eval_expr(&mut self, env: &mut Env, expr: &Expr, fx: &mut FnCtx) -> Info {
        match &expr.kind {
            ExprKind::Int(v) => Info::int_const(*v),
            ExprKind::Float(_) => Info {
                non_nil: true,
                ..Info::unknown()
            },
            ExprKind::Bool(v) => Info::bool_const(*v),
            ExprKind::Char(v) => Info::int_const(*v as i64),
            ExprKind::Str(s) => Info::string_of(Some(s.chars().count() as i64)),
            ExprKind::Nil | ExprKind::NoneLit => Info {
                non_nil: false,
                known: false,
                ..Info::unknown()
            },
            ExprKind::ArrayLit(items) => {
                for item in items {
                    self.eval_expr(env, item, fx);
                }
                Info::array_of(items.len() as i64)
            }
            ExprKind::TupleLit(items) => {
                for item in items {
                    self.eval_expr(env, item, fx);
                }
                Info {
                    non_nil: true,
                    ..Info::unknown()
                }
            }
            ExprKind::Var(name) => {
                if let Some(info) = env.get(name) {
                    let mut out = info.clone();
                    if !out.initialized {
                        self.report(
                            fx,
                            expr.pos,
                            format!("use of uninitialized variable '{name}'"),
                        );
                        // Silence repeats on the same path.
                        if let Some(slot) = env.get_mut(name) {
                            slot.initialized = true;
                        }
                        out.initialized = true;
                    }
                    env.mark_used(name);
                    out
                } else if let Some(info) = self.global_info.get(name) {
                    info.clone()
                } else {
                    Info::unknown()
                }
            }
            ExprKind::Binary { op, lhs, rhs } => self.eval_binary(env, expr, *op, lhs, rhs, fx),
            ExprKind::Unary { op, operand } => {
                let inner = self.eval_expr(env, operand, fx);
                match op {
                    UnOp::Not => {
                        if inner.known && inner.is_bool {
                            Info::bool_const(inner.cval == 0)
                        } else {
                            Info {
                                is_bool: true,
                                non_nil: true,
                                ..Info::unknown()
                            }
                        }
                    }
                    UnOp::Neg => {
                        if is_float_expr(operand, env) {
                            return Info {
                                non_nil: true,
                                ..Info::unknown()
                            };
                        }
                        if inner.minv == IMIN {
                            self.overflow_or_constrain(
                                env, fx, expr.pos, "-", operand, None, |p_lo, _p_hi| {
                                    (sat_add(IMIN, 1), IMAX, p_lo == IMIN)
                                },
                            );
                        }
                        let mut out = Info::unknown();
                        out.set_intervals(vec![Interval::new(
                            sat_mul(inner.maxv, -1),
                            sat_mul(inner.minv, -1),
                        )]);
                        out.non_nil = true;
                        out
                    }
                }
            }
            ExprKind::Call { name, args } => self.eval_call(env, expr, name, args, fx),
            ExprKind::Invoke { callee, args } => {
                self.eval_expr(env, callee, fx);
                for a in args {
                    self.eval_expr(env, a, fx);
                }
                Info::unknown()
            }
            ExprKind::Index { base, index } => {
                let base_info = self.eval_expr(env, base, fx);
                let idx_info = self.eval_expr(env, index, fx);
                self.check_index(&base_info, &idx_info, base, index, expr.pos, fx);
                Info::unknown()
            }
            ExprKind::Slice { base, lo, hi } => {
                let base_info = self.eval_expr(env, base, fx);
                let lo_info = self.eval_expr(env, lo, fx);
                let hi_info = self.eval_expr(env, hi, fx);
                // Both endpoints must sit inside [0, len].
                if base_info.array_size_known {
                    let len = base_info.array_size;
                    if !(lo_info.within(0, len) && hi_info.within(0, len)) {
                        self.report(
                            fx,
                            expr.pos,
                            "cannot prove slice bounds within array length".to_string(),
                        );
                    }
                }
                let mut out = Info {
                    is_array: base_info.is_array,
                    is_string: base_info.is_string,
                    non_nil: true,
                    ..Info::unknown()
                };
                if lo_info.known && hi_info.known && hi_info.cval >= lo_info.cval {
                    out.array_size = hi_info.cval - lo_info.cval;
                    out.array_size_known = true;
                }
                out
            }
            ExprKind::Field { base, .. } => {
                self.eval_expr(env, base, fx);
                Info::unknown()
            }
            ExprKind::NewRef(inner) => {
                let inner_info = self.eval_expr(env, inner, fx);
                Info {
                    non_nil: true,
                    ref_value: Some(Box::new(inner_info)),
                    ..Info::unknown()
                }
            }
            ExprKind::WeakOf(inner) => {
                self.eval_expr(env, inner, fx);
                // A weak handle needs a fresh nil check before every deref.
                Info {
                    non_nil: false,
                    ..Info::unknown()
                }
            }
            ExprKind::Deref(inner) => {
                let inner_info = self.eval_expr(env, inner, fx);
                self.check_deref(env, &inner_info, inner, expr.pos, fx);
                match inner_info.ref_value {
                    Some(boxed) => *boxed,
                    None => Info::unknown(),
                }
            }
            ExprKind::SomeOf(inner) | ExprKind::OkOf(inner) | ExprKind::ErrOf(inner) => {
                self.eval_expr(env, inner, fx);
                Info {
                    non_nil: true,
                    ..Info::unknown()
                }
            }
            ExprKind::Cast { expr: inner, target } => {
                self.eval_expr(env, inner, fx);
                type_info(target)
            }
            ExprKind::Lambda { .. } => Info {
                non_nil: true,
                ..Info::unknown()
            },
            ExprKind::Propagate(inner) => {
                self.eval_expr(env, inner, fx);
                Info::unknown()
            }
            ExprKind::Compiles(_) => Info {
                is_bool: true,
                non_nil: true,
                ..Info::unknown()
            },
            ExprKind::Spawn { call } => {
                self.eval_expr(env, call, fx);
                Info {
                    non_nil: true,
                    ..Info::unknown()
                }
            }
            ExprKind::YieldExpr(value) => {
                if let Some(v) = value {
                    self.eval_expr(env, v, fx);
                }
                Info::unknown()
            }
            ExprKind::Resume(task) => {
                self.eval_expr(env, task, fx);
                Info::unknown()
            }
            ExprKind::EnumLit { .. } => Info {
                non_nil: true,
                ..Info::unknown()
            },
            ExprKind::ObjectLit { fields, .. } => {
                for (_, e) in fields {
                    self.eval_expr(env, e, fx);
                }
                Info {
                    non_nil: true,
                    ..Info::unknown()
                }
            }
            ExprKind::MakeChannel { capacity, .. } => {
                self.eval_expr(env, capacity, fx);
                Info {
                    non_nil: true,
                    ..Info::unknown()
                }
            }
            ExprKind::ChanSend { chan, value } => {
                self.eval_expr(env, chan, fx);
                self.eval_expr(env, value, fx);
                Info::unknown()
            }
            ExprKind::ChanRecv { chan } => {
                self.eval_expr(env, chan, fx);
                Info::unknown()
            }
        }
    }

    fn eval_binary(
        &mut self,
        env: &mut Env,
        expr: &Expr,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        fx: &mut FnCtx,
    ) -> Info {
        if op == BinOp::And || op == BinOp::Or {
            let l = self.eval_expr(env, lhs, fx);
            // The right side is only reached on one outcome of the left.
            let mut rhs_env = env.copy_env();
            self.apply_constraints(&mut rhs_env, lhs, op == BinOp::And, fx);
            let r = self.eval_expr(&mut rhs_env, rhs, fx);
            if l.known && l.is_bool && r.known && r.is_bool {
                let lv = l.cval != 0;
                let rv = r.cval != 0;
                return Info::bool_const(if op == BinOp::And { lv && rv } else { lv || rv });
            }
            return Info {
                is_bool: true,
                non_nil: true,
                ..Info::unknown()
            };
        }

        let l = self.eval_expr(env, lhs, fx);
        let r = self.eval_expr(env, rhs, fx);

        if op.is_comparison() {
            if l.known && r.known && !l.is_string && !r.is_string {
                let res = match op {
                    BinOp::Eq => l.cval == r.cval,
                    BinOp::Ne => l.cval != r.cval,
                    BinOp::Lt => l.cval < r.cval,
                    BinOp::Le => l.cval <= r.cval,
                    BinOp::Gt => l.cval > r.cval,
                    BinOp::Ge => l.cval >= r.cval,
                    _ => unreachable!(),
                };
                return Info::bool_const(res);
            }
            // Disjoint ranges decide ordering comparisons statically.
            if !l.is_string && !r.is_string {
                match op {
                    BinOp::Lt if l.maxv < r.minv => return Info::bool_const(true),
                    BinOp::Lt if l.minv >= r.maxv => return Info::bool_const(false),
                    BinOp::Le if l.maxv <= r.minv => return Info::bool_const(true),
                    BinOp::Le if l.minv > r.maxv => return Info::bool_const(false),
                    BinOp::Gt if l.minv > r.maxv => return Info::bool_const(true),
                    BinOp::Gt if l.maxv <= r.minv => return Info::bool_const(false),
                    BinOp::Ge if l.minv >= r.maxv => return Info::bool_const(true),
                    BinOp::Ge if l.maxv < r.minv => return Info::bool_const(false),
                    _ => {}
                }
            }
            return Info {
                is_bool: true,
                non_nil: true,
                ..Info::unknown()
            };
        }

        // String concatenation.
        if l.is_string || r.is_string {
            if op == BinOp::Add {
                let len = if l.array_size_known && r.array_size_known {
                    Some(l.array_size + r.array_size)
                } else {
                    None
                };
                return Info::string_of(len);
            }
            return Info::unknown();
        }

        // Float arithmetic has no prover failure class.
        if is_float_expr(lhs, env) || is_float_expr(rhs, env) {
            return Info {
                non_nil: true,
                ..Info::unknown()
            };
        }

        match op {
            BinOp::Add => {
                let lo = l.minv.checked_add(r.minv);
                let hi = l.maxv.checked_add(r.maxv);
                if lo.is_none() || hi.is_none() {
                    self.arith_failure(env, fx, expr.pos, "+", lhs, rhs, &l, &r);
                }
                let mut out = Info::unknown();
                out.set_intervals(vec![Interval::new(
                    sat_add(l.minv, r.minv),
                    sat_add(l.maxv, r.maxv),
                )]);
                out.non_nil = true;
                out
            }
            BinOp::Sub => {
                let lo = l.minv.checked_sub(r.maxv);
                let hi = l.maxv.checked_sub(r.minv);
                if lo.is_none() || hi.is_none() {
                    self.arith_failure(env, fx, expr.pos, "-", lhs, rhs, &l, &r);
                }
                let mut out = Info::unknown();
                out.set_intervals(vec![Interval::new(
                    sat_sub(l.minv, r.maxv),
                    sat_sub(l.maxv, r.minv),
                )]);
                out.non_nil = true;
                out
            }
            BinOp::Mul => {
                let products = [
                    l.minv.checked_mul(r.minv),
                    l.minv.checked_mul(r.maxv),
                    l.maxv.checked_mul(r.minv),
                    l.maxv.checked_mul(r.maxv),
                ];
                if products.iter().any(|p| p.is_none()) {
                    self.arith_failure(env, fx, expr.pos, "*", lhs, rhs, &l, &r);
                }
                let sat = [
                    sat_mul(l.minv, r.minv),
                    sat_mul(l.minv, r.maxv),
                    sat_mul(l.maxv, r.minv),
                    sat_mul(l.maxv, r.maxv),
                ];
                let mut out = Info::unknown();
                out.set_intervals(vec![Interval::new(
                    *sat.iter().min().unwrap(),
                    *sat.iter().max().unwrap(),
                )]);
                out.non_nil = true;
                out
            }
            BinOp::Div | BinOp::Mod => {
                let sym = if op == BinOp::Div { "/" } else { "%" };
                if !r.non_zero && r.effective_contains(0) {
                    self.divisor_failure(env, fx, expr.pos, sym, rhs, &r);
                }
                if l.known && r.known && r.cval != 0 {
                    let result = if op == BinOp::Div {
                        l.cval.checked_div(r.cval)
                    } else {
                        l.cval.checked_rem(r.cval)
                    };
                    if let Some(v) = result {
                        return Info::int_const(v);
                    }
                }
                if op == BinOp::Mod && r.minv > 0 {
                    let mut out = Info::unknown();
                    if l.minv >= 0 {
                        out.set_intervals(vec![Interval::new(0, sat_sub(r.maxv, 1))]);
                    } else {
                        out.set_intervals(vec![Interval::new(
                            sat_sub(1, r.maxv),
                            sat_sub(r.maxv, 1),
                        )]);
                    }
                    out.non_nil = true;
                    return out;
                }
                Info {
                    non_nil: true,
                    ..Info::unknown()
                }
            }
            _ => Info::unknown(),
        }
    }

    /// Integer overflow finding. When one operand is directly a parameter,
    /// record a precondition instead of reporting.
    #[allow(clippy::too_many_arguments)]
    fn arith_failure(
        &mut self,
        _env: &mut Env,
        fx: &mut FnCtx,
        pos: SourcePos,
        op: &str,
        lhs: &Expr,
        rhs: &Expr,
        l: &Info,
        r: &Info,
    ) {
        if fx.quiet > 0 {
            return;
        }
        // param + constant-range partner: constrain the parameter so the sum
        // cannot cross the domain.
        for (side, partner) in [(lhs, r), (rhs, l)] {
            if let ExprKind::Var(name) = &side.kind {
                if let Some(&idx) = fx.params.get(name) {
                    let (min, max) = match op {
                        "+" => (
                            sat_sub(IMIN, partner.minv.min(0)),
                            sat_sub(IMAX, partner.maxv.max(0)),
                        ),
                        "-" => (
                            sat_add(IMIN, partner.maxv.max(0)),
                            sat_add(IMAX, partner.minv.min(0)),
                        ),
                        _ => {
                            // Multiplication bounds are not linear in one
                            // operand; require the conservative safe band.
                            let cap_u = partner
                                .maxv
                                .unsigned_abs()
                                .max(partner.minv.unsigned_abs())
                                .max(1);
                            let cap = cap_u.min(i64::MAX as u64) as i64;
                            (IMIN / cap, IMAX / cap)
                        }
                    };
                    let mut c = ParamConstraint::new(idx, format!("used in '{op}'"));
                    c.min = min;
                    c.max = max;
                    fx.pre.push(c);
                    return;
                }
            }
        }
        self.report(fx, pos, format!("integer overflow in '{op}'"));
    }

    fn divisor_failure(
        &mut self,
        _env: &mut Env,
        fx: &mut FnCtx,
        pos: SourcePos,
        op: &str,
        rhs: &Expr,
        _r: &Info,
    ) {
        if fx.quiet > 0 {
            return;
        }
        if let ExprKind::Var(name) = &rhs.kind {
            if let Some(&idx) = fx.params.get(name) {
                let mut c = ParamConstraint::new(idx, "used as divisor".to_string());
                c.non_zero = true;
                fx.pre.push(c);
                return;
            }
        }
        self.report(fx, pos, format!("division by zero in '{op}'"));
    }

    /// Used by unary negation; shares the parameter-vs-report split.
    #[allow(clippy::too_many_arguments)]
    fn overflow_or_constrain(
        &mut self,
        _env: &mut Env,
        fx: &mut FnCtx,
        pos: SourcePos,
        op: &str,
        operand: &Expr,
        _partner: Option<&Info>,
        bounds: impl Fn(i64, i64) -> (i64, i64, bool),
    ) {
        if fx.quiet > 0 {
            return;
        }
        if let ExprKind::Var(name) = &operand.kind {
            if let Some(&idx) = fx.params.get(name) {
                let (min, max, _) = bounds(IMIN, IMAX);
                let mut c = ParamConstraint::new(idx, format!("used in '{op}'"));
                c.min = min;
                c.max = max;
                fx.pre.push(c);
                return;
            }
        }
        self.report(fx, pos, format!("integer overflow in '{op}'"));
    }

    fn check_index(
        &mut self,
        base: &Info,
        idx: &Info,
        base_expr: &Expr,
        idx_expr: &Expr,
        pos: SourcePos,
        fx: &mut FnCtx,
    ) {
        if fx.quiet > 0 {
            return;
        }
        let _ = base_expr;
        if base.array_size_known {
            let len = base.array_size;
            let in_bounds = idx
                .effective_intervals()
                .iter()
                .all(|iv| iv.lo >= 0 && iv.hi < len);
            if in_bounds {
                return;
            }
            if let ExprKind::Var(name) = &idx_expr.kind {
                if let Some(&pidx) = fx.params.get(name) {
                    let mut c = ParamConstraint::new(pidx, "used as index".to_string());
                    c.min = 0;
                    c.max = len - 1;
                    fx.pre.push(c);
                    return;
                }
            }
            self.report(
                fx,
                pos,
                format!(
                    "index out of bounds: index range [{}, {}] does not fit in [0, {})",
                    idx.minv, idx.maxv, len
                ),
            );
        } else if base.is_array || base.is_string {
            self.report(
                fx,
                pos,
                "cannot prove index within bounds (length unknown)".to_string(),
            );
        }
    }

    fn check_deref(
        &mut self,
        env: &Env,
        inner: &Info,
        inner_expr: &Expr,
        pos: SourcePos,
        fx: &mut FnCtx,
    ) {
        if fx.quiet > 0 {
            return;
        }
        let path = serialize_path(inner_expr);
        let checked = path
            .as_ref()
            .and_then(|p| env.nil_known.get(p))
            .copied()
            .unwrap_or(false);
        let is_weak = matches!(static_var_type(inner_expr, env), Some(Type::Weak(_)));
        if is_weak {
            if !checked {
                self.report(
                    fx,
                    pos,
                    "weak reference dereferenced without a nil check".to_string(),
                );
            }
            return;
        }
        if inner.non_nil || checked {
            return;
        }
        if let ExprKind::Var(name) = &inner_expr.kind {
            if let Some(&idx) = fx.params.get(name) {
                let mut c = ParamConstraint::new(idx, "dereferenced".to_string());
                c.non_nil = true;
                fx.pre.push(c);
                return;
            }
        }
        self.report(
            fx,
            pos,
            "dereference of a reference not proven non-nil".to_string(),
        );
    }

    fn eval_call(
        &mut self,
        env: &mut Env,
        expr: &Expr,
        name: &str,
        args: &[Expr],
        fx: &mut FnCtx,
    ) -> Info {
        let arg_infos: Vec<Info> = args.iter().map(|a| self.eval_expr(env, a, fx)).collect();

        // Builtins with prover-visible semantics.
        match name {
            "len" => {
                if let Some(info) = arg_infos.first() {
                    if info.array_size_known {
                        return Info::int_const(info.array_size);
                    }
                }
                let mut out = Info::unknown();
                out.set_intervals(vec![Interval::new(0, IMAX)]);
                out.non_nil = true;
                return out;
            }
            "abs" => {
                let mut out = Info::unknown();
                out.set_intervals(vec![Interval::new(0, IMAX)]);
                out.non_nil = true;
                return out;
            }
            "rand" => {
                let mut out = Info::unknown();
                out.set_intervals(vec![Interval::new(0, IMAX)]);
                out.non_nil = true;
                return out;
            }
            _ => {}
        }
        if crate::vm::builtins::lookup(name).is_some() && self.program.resolve(name).is_none() {
            return Info {
                non_nil: true,
                ..Info::unknown()
            };
        }

        let program = self.program;
        let Some(decl) = program.resolve(name) else {
            return Info::unknown();
        };
        let key = decl.key();
        let contract = self.get_contract(&key);

        // Pure callee over literal arguments: concrete execution both proves
        // the call safe for these exact inputs and yields the exact result.
        if contract.pure && args.iter().all(|a| a.is_literal()) {
            let sym_args: Vec<SymValue> = args.iter().filter_map(literal_sym).collect();
            if sym_args.len() == args.len() {
                if let Some(result) = symexec::execute(program, decl, &sym_args) {
                    if let Some(info) = sym_to_info(&result) {
                        return info;
                    }
                }
            }
        }

        if fx.quiet == 0 {
            for constraint in &contract.pre {
                if let Some(arg_info) = arg_infos.get(constraint.index) {
                    if !constraint.satisfied_by(arg_info) {
                        let pname = decl
                            .params
                            .get(constraint.index)
                            .map(|p| p.name.as_str())
                            .unwrap_or("?");
                        self.report(
                            fx,
                            expr.pos,
                            format!(
                                "argument {} ('{}') to '{}' may violate its precondition ({})",
                                constraint.index + 1,
                                pname,
                                decl.name,
                                constraint.reason
                            ),
                        );
                    }
                }
            }
        }

        contract.post.clone()
    }

    // ========================================================================
    // Path conditions
    // ========================================================================

    fn apply_constraints(&mut self, env: &mut Env, cond: &Expr, truth: bool, fx: &mut FnCtx) {
        match &cond.kind {
            ExprKind::Bool(v) => {
                if *v != truth {
                    env.unreachable = true;
                }
            }
            ExprKind::Unary {
                op: UnOp::Not,
                operand,
            } => self.apply_constraints(env, operand, !truth, fx),
            ExprKind::Binary { op, lhs, rhs } => match op {
                BinOp::And => {
                    if truth {
                        self.apply_constraints(env, lhs, true, fx);
                        self.apply_constraints(env, rhs, true, fx);
                    } else {
                        // !(A and B) = !A or !B — disjunctive refinement.
                        let mut left = env.copy_env();
                        self.apply_constraints(&mut left, lhs, false, fx);
                        let mut right = env.copy_env();
                        self.apply_constraints(&mut right, rhs, false, fx);
                        *env = left.union_env(&right);
                    }
                }
                BinOp::Or => {
                    if truth {
                        // A or B — per-variable interval union of the two
                        // single-branch refinements.
                        let mut left = env.copy_env();
                        self.apply_constraints(&mut left, lhs, true, fx);
                        let mut right = env.copy_env();
                        self.apply_constraints(&mut right, rhs, true, fx);
                        *env = left.union_env(&right);
                    } else {
                        self.apply_constraints(env, lhs, false, fx);
                        self.apply_constraints(env, rhs, false, fx);
                    }
                }
                _ if op.is_comparison() => {
                    self.apply_comparison(env, *op, lhs, rhs, truth, fx);
                }
                _ => {}
            },
            ExprKind::Var(name) => {
                if let Some(info) = env.get_mut(name) {
                    if info.is_bool {
                        let mut refined = Info::bool_const(truth);
                        refined.used = info.used;
                        *info = refined;
                    }
                }
            }
            _ => {}
        }
    }

    fn apply_comparison(
        &mut self,
        env: &mut Env,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        truth: bool,
        fx: &mut FnCtx,
    ) {
        // Equality against nil updates tracked nil knowledge.
        let lhs_nil = matches!(lhs.kind, ExprKind::Nil | ExprKind::NoneLit);
        let rhs_nil = matches!(rhs.kind, ExprKind::Nil | ExprKind::NoneLit);
        if lhs_nil || rhs_nil {
            let subject = if lhs_nil { rhs } else { lhs };
            let is_nil = match op {
                BinOp::Eq => truth,
                BinOp::Ne => !truth,
                _ => return,
            };
            if let Some(path) = serialize_path(subject) {
                env.nil_known.insert(path, !is_nil);
            }
            if let ExprKind::Var(name) = &subject.kind {
                if let Some(info) = env.get_mut(name) {
                    info.non_nil = !is_nil;
                }
            }
            return;
        }

        let effective = if truth { op } else { negate_op(op) };

        // Refine a variable against the other side's interval.
        fx.quiet += 1;
        let l_info = self.eval_expr(env, lhs, fx);
        let r_info = self.eval_expr(env, rhs, fx);
        fx.quiet -= 1;

        if let ExprKind::Var(name) = &lhs.kind {
            self.refine_var(env, name, effective, &r_info);
        }
        if let ExprKind::Var(name) = &rhs.kind {
            self.refine_var(env, name, mirror_op(effective), &l_info);
        }
    }

    fn refine_var(&mut self, env: &mut Env, name: &str, op: BinOp, other: &Info) {
        let Some(info) = env.get(name) else {
            return;
        };
        let current = info.effective_intervals();
        let constraint: Vec<Interval> = match op {
            BinOp::Lt => vec![Interval::new(IMIN, sat_sub(other.maxv, 1))],
            BinOp::Le => vec![Interval::new(IMIN, other.maxv)],
            BinOp::Gt => vec![Interval::new(sat_add(other.minv, 1), IMAX)],
            BinOp::Ge => vec![Interval::new(other.minv, IMAX)],
            BinOp::Eq => other.effective_intervals(),
            BinOp::Ne => {
                if other.known {
                    complement(&[Interval::point(other.cval)])
                } else {
                    return;
                }
            }
            _ => return,
        };
        let refined = intersect(&current, &constraint);
        if refined.is_empty() {
            env.unreachable = true;
            return;
        }
        if let Some(slot) = env.get_mut(name) {
            slot.set_intervals(refined);
            // Comparing against a number implies the value is a number.
            slot.non_nil = true;
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Abstract value derived from a static type alone.
pub fn type_info(ty: &Type) -> Info {
    match ty {
        Type::Bool => Info {
            is_bool: true,
            non_nil: true,
            ..Info::unknown()
        },
        Type::Int | Type::Char | Type::Float => Info {
            non_nil: true,
            ..Info::unknown()
        },
        Type::Str => Info::string_of(None),
        Type::Array(_) => Info {
            is_array: true,
            non_nil: true,
            ..Info::unknown()
        },
        Type::Ref(_) | Type::Weak(_) | Type::Option(_) => Info {
            non_nil: false,
            ..Info::unknown()
        },
        _ => Info::unknown(),
    }
}

fn negate_op(op: BinOp) -> BinOp {
    match op {
        BinOp::Eq => BinOp::Ne,
        BinOp::Ne => BinOp::Eq,
        BinOp::Lt => BinOp::Ge,
        BinOp::Le => BinOp::Gt,
        BinOp::Gt => BinOp::Le,
        BinOp::Ge => BinOp::Lt,
        other => other,
    }
}

/// `a < b` seen from b's side is `b > a`.
fn mirror_op(op: BinOp) -> BinOp {
    match op {
        BinOp::Lt => BinOp::Gt,
        BinOp::Le => BinOp::Ge,
        BinOp::Gt => BinOp::Lt,
        BinOp::Ge => BinOp::Le,
        other => other,
    }
}

/// Serialized l-value path used as the tracked-expression key for nil
/// knowledge: `x`, `arr[0]`, `p.next`, `*p`.
fn serialize_path(expr: &Expr) -> Option<String> {
    match &expr.kind {
        ExprKind::Var(name) => Some(name.clone()),
        ExprKind::Index { base, index } => {
            let b = serialize_path(base)?;
            match &index.kind {
                ExprKind::Int(i) => Some(format!("{b}[{i}]")),
                _ => None,
            }
        }
        ExprKind::Field { base, field } => Some(format!("{}.{}", serialize_path(base)?, field)),
        ExprKind::Deref(inner) => Some(format!("*{}", serialize_path(inner)?)),
        _ => None,
    }
}

fn static_var_type<'e>(expr: &Expr, env: &'e Env) -> Option<&'e Type> {
    match &expr.kind {
        ExprKind::Var(name) => env.types.get(name),
        _ => None,
    }
}

fn is_float_expr(expr: &Expr, env: &Env) -> bool {
    match &expr.kind {
        ExprKind::Float(_) => true,
        ExprKind::Var(name) => matches!(env.types.get(name), Some(Type::Float)),
        ExprKind::Binary { lhs, rhs, .. } => is_float_expr(lhs, env) || is_float_expr(rhs, env),
        ExprKind::Unary { operand, .. } => is_float_expr(operand, env),
        ExprKind::Cast { target, .. } => *target == Type::Float,
        _ => expr.ty == Type::Float,
    }
}

/// All variable names assigned anywhere in a loop body.
fn collect_assigned(body: &[Stmt]) -> FxHashSet<String> {
    let mut out = FxHashSet::default();
    fn walk(body: &[Stmt], out: &mut FxHashSet<String>) {
        for stmt in body {
            match &stmt.kind {
                StmtKind::Assign { target, .. } => {
                    if let Some(name) = target.base_var() {
                        out.insert(name.to_string());
                    }
                }
                StmtKind::Let { name, .. } => {
                    out.insert(name.clone());
                }
                StmtKind::If {
                    then_body,
                    else_body,
                    ..
                } => {
                    walk(then_body, out);
                    walk(else_body, out);
                }
                StmtKind::While { body, .. } | StmtKind::For { body, .. } => walk(body, out),
                StmtKind::Block(b) | StmtKind::Defer(b) => walk(b, out),
                _ => {}
            }
        }
    }
    walk(body, &mut out);
    out
}

fn literal_sym(expr: &Expr) -> Option<SymValue> {
    Some(match &expr.kind {
        ExprKind::Int(v) => SymValue::Int(*v),
        ExprKind::Float(v) => SymValue::Float(*v),
        ExprKind::Bool(v) => SymValue::Bool(*v),
        ExprKind::Char(v) => SymValue::Char(*v),
        ExprKind::Str(v) => SymValue::Str(v.clone()),
        ExprKind::Nil | ExprKind::NoneLit => SymValue::Nil,
        _ => return None,
    })
}

fn sym_to_info(v: &SymValue) -> Option<Info> {
    Some(match v {
        SymValue::Int(i) => Info::int_const(*i),
        SymValue::Bool(b) => Info::bool_const(*b),
        SymValue::Char(c) => Info::int_const(*c as i64),
        SymValue::Str(s) => Info::string_of(Some(s.chars().count() as i64)),
        SymValue::Array(items) => Info::array_of(items.len() as i64),
        _ => return None,
    })
}

fn static_type_of(expr: &Expr) -> Option<Type> {
    Some(match &expr.kind {
        ExprKind::Int(_) => Type::Int,
        ExprKind::Float(_) => Type::Float,
        ExprKind::Bool(_) => Type::Bool,
        ExprKind::Char(_) => Type::Char,
        ExprKind::Str(_) => Type::Str,
        ExprKind::ArrayLit(_) => Type::Array(Box::new(Type::Inferred)),
        _ => {
            if expr.ty != Type::Inferred {
                expr.ty.clone()
            } else {
                return None;
            }
        }
    })
}

fn dedupe_constraints(constraints: &mut Vec<ParamConstraint>) {
    let mut merged: Vec<ParamConstraint> = Vec::new();
    for c in constraints.drain(..) {
        match merged.iter_mut().find(|m| m.index == c.index) {
            Some(m) => {
                m.min = m.min.max(c.min);
                m.max = m.max.min(c.max);
                m.non_zero |= c.non_zero;
                m.non_nil |= c.non_nil;
                if !m.reason.contains(&c.reason) {
                    m.reason.push_str("; ");
                    m.reason.push_str(&c.reason);
                }
            }
            None => merged.push(c),
        }
    }
    *constraints = merged;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builder::*;
    use crate::diagnostics::Severity;

    fn check(program: &Program) -> Vec<Diagnostic> {
        check_program(program)
    }

    fn errors(diags: &[Diagnostic]) -> Vec<&Diagnostic> {
        diags
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .collect()
    }

    #[test]
    fn test_overflow_rejected() {
        // fn main() -> int { let a = 9223372036854775800; let b = 100; return a + b; }
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![
                let_stmt("a", Type::Int, int(9_223_372_036_854_775_800)),
                let_stmt("b", Type::Int, int(100)),
                ret(binary(BinOp::Add, var("a"), var("b"))),
            ],
        ));
        let diags = check(&program);
        assert!(errors(&diags)
            .iter()
            .any(|d| d.message.contains("overflow")));
    }

    #[test]
    fn test_index_in_range_accepted() {
        // fn main() -> int { let xs = [1,2,3]; let i = 2; return xs[i]; }
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![
                let_stmt(
                    "xs",
                    Type::Array(Box::new(Type::Int)),
                    array(vec![int(1), int(2), int(3)]),
                ),
                let_stmt("i", Type::Int, int(2)),
                ret(index(var("xs"), var("i"))),
            ],
        ));
        let diags = check(&program);
        assert!(errors(&diags).is_empty(), "diags: {diags:?}");
    }

    #[test]
    fn test_index_out_of_range_rejected() {
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![
                let_stmt(
                    "xs",
                    Type::Array(Box::new(Type::Int)),
                    array(vec![int(1), int(2), int(3)]),
                ),
                ret(index(var("xs"), int(3))),
            ],
        ));
        let diags = check(&program);
        assert!(errors(&diags)
            .iter()
            .any(|d| d.message.contains("index out of bounds")));
    }

    #[test]
    fn test_unused_variable_rejected() {
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Void,
            vec![
                let_stmt("x", Type::Int, int(5)),
                expr_stmt(call("print", vec![int(0)])),
            ],
        ));
        let diags = check(&program);
        assert!(errors(&diags)
            .iter()
            .any(|d| d.message.contains("unused variable 'x'")));
    }

    #[test]
    fn test_branch_refinement_allows_division() {
        // fn main() -> int { let n = rand(); if n != 0 { return 10 / n; } return 0; }
        // rand() yields [0, IMAX]; the != 0 path makes it non-zero.
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![
                let_stmt("n", Type::Int, call("rand", vec![])),
                if_stmt(
                    binary(BinOp::Ne, var("n"), int(0)),
                    vec![ret(binary(BinOp::Div, int(10), var("n")))],
                    vec![],
                ),
                ret(int(0)),
            ],
        ));
        let diags = check(&program);
        assert!(errors(&diags).is_empty(), "diags: {diags:?}");
    }

    #[test]
    fn test_unguarded_division_rejected() {
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![
                let_stmt("n", Type::Int, call("rand", vec![])),
                ret(binary(BinOp::Div, int(10), var("n"))),
            ],
        ));
        let diags = check(&program);
        assert!(errors(&diags)
            .iter()
            .any(|d| d.message.contains("division by zero")));
    }

    #[test]
    fn test_disjunctive_or_refinement() {
        // if i == 0 or i == 2 { xs[i] } with xs of length 3 — both arms fit.
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![
                let_stmt(
                    "xs",
                    Type::Array(Box::new(Type::Int)),
                    array(vec![int(1), int(2), int(3)]),
                ),
                let_stmt("i", Type::Int, call("rand", vec![])),
                if_stmt(
                    binary(
                        BinOp::Or,
                        binary(BinOp::Eq, var("i"), int(0)),
                        binary(BinOp::Eq, var("i"), int(2)),
                    ),
                    vec![ret(index(var("xs"), var("i")))],
                    vec![],
                ),
                ret(int(0)),
            ],
        ));
        let diags = check(&program);
        assert!(errors(&diags).is_empty(), "diags: {diags:?}");
    }

    #[test]
    fn test_uninitialized_use_rejected() {
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![let_uninit("x", Type::Int), ret(var("x"))],
        ));
        let diags = check(&program);
        assert!(errors(&diags)
            .iter()
            .any(|d| d.message.contains("uninitialized variable 'x'")));
    }

    #[test]
    fn test_nil_deref_rejected_then_refined() {
        // let r: ref[int] = nil; *r        → rejected
        // if r != nil { *r }               → accepted
        let mut program = Program::new();
        program.add_function(func(
            "bad",
            vec![],
            Type::Int,
            vec![
                let_stmt("r", Type::Ref(Box::new(Type::Int)), nil()),
                ret(deref(var("r"))),
            ],
        ));
        program.add_function(func(
            "good",
            vec![],
            Type::Int,
            vec![
                let_stmt("r", Type::Ref(Box::new(Type::Int)), nil()),
                if_stmt(
                    binary(BinOp::Ne, var("r"), nil()),
                    vec![ret(deref(var("r")))],
                    vec![],
                ),
                ret(int(0)),
            ],
        ));
        let diags = check(&program);
        let errs = errors(&diags);
        assert_eq!(
            errs.iter()
                .filter(|d| d.message.contains("non-nil"))
                .count(),
            1
        );
    }

    #[test]
    fn test_propagation_in_non_result_function() {
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![
                let_stmt("n", Type::Int, propagate(call("parseInt", vec![string("1")]))),
                ret(var("n")),
            ],
        ));
        let diags = check(&program);
        assert!(errors(&diags)
            .iter()
            .any(|d| d.message.contains("'?'")));
    }

    #[test]
    fn test_main_signature_enforced() {
        let mut program = Program::new();
        program.add_function(func("main", vec![], Type::Str, vec![ret(string("x"))]));
        let diags = check(&program);
        assert!(errors(&diags)
            .iter()
            .any(|d| d.message.contains("main must return void or int")));
    }

    #[test]
    fn test_contract_precondition_flows_to_call_site() {
        // fn half(d: int) -> int { return 100 / d; }  — d gets a nonZero precondition
        // fn main() -> int { return half(0); }        — violates it
        let mut program = Program::new();
        program.add_function(func(
            "half",
            vec![param("d", Type::Int)],
            Type::Int,
            vec![ret(binary(BinOp::Div, int(100), var("d")))],
        ));
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![ret(call("half", vec![int(0)]))],
        ));
        let diags = check(&program);
        assert!(errors(&diags)
            .iter()
            .any(|d| d.message.contains("precondition")));
    }

    #[test]
    fn test_contract_ok_call_site_clean() {
        let mut program = Program::new();
        program.add_function(func(
            "half",
            vec![param("d", Type::Int)],
            Type::Int,
            vec![ret(binary(BinOp::Div, int(100), var("d")))],
        ));
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![ret(call("half", vec![int(4)]))],
        ));
        let diags = check(&program);
        assert!(errors(&diags).is_empty(), "diags: {diags:?}");
    }

    #[test]
    fn test_symbolic_execution_refines_result() {
        // fn sq(n: int) -> int { return n * n; } is pure; sq(3) is literal.
        // The result 9 must index a 10-element array cleanly.
        let mut program = Program::new();
        program.add_function(func(
            "sq",
            vec![param("n", Type::Int)],
            Type::Int,
            vec![ret(binary(BinOp::Mul, var("n"), var("n")))],
        ));
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![
                let_stmt(
                    "xs",
                    Type::Array(Box::new(Type::Int)),
                    array((0..10).map(int).collect()),
                ),
                ret(index(var("xs"), call("sq", vec![int(3)]))),
            ],
        ));
        let diags = check(&program);
        assert!(errors(&diags).is_empty(), "diags: {diags:?}");
    }

    #[test]
    fn test_constant_false_loop_flagged() {
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Void,
            vec![while_stmt(boolean(false), vec![expr_stmt(call("print", vec![int(1)]))])],
        ));
        let diags = check(&program);
        assert!(diags
            .iter()
            .any(|d| d.severity == Severity::Warning && d.message.contains("unreachable")));
    }

    #[test]
    fn test_for_loop_induction_bounds() {
        // for i in 0..3 { xs[i] } over a 3-element array is provable.
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Void,
            vec![
                let_stmt(
                    "xs",
                    Type::Array(Box::new(Type::Int)),
                    array(vec![int(1), int(2), int(3)]),
                ),
                for_stmt(
                    "i",
                    int(0),
                    int(3),
                    vec![expr_stmt(call("print", vec![index(var("xs"), var("i"))]))],
                ),
            ],
        ));
        let diags = check(&program);
        assert!(errors(&diags).is_empty(), "diags: {diags:?}");
    }
}
