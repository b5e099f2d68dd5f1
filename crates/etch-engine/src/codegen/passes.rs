//! Release-mode AST optimization passes.
//!
//! The pass manager iterates inlining and cleanup until neither reports
//! progress, aggregating counters. Both passes run on the AST before
//! lowering; inlined positions are re-tagged with the callee's name so
//! diagnostics keep their original attribution.

use crate::ast::{Expr, ExprKind, FunctionDecl, LValue, Program, Stmt, StmtKind};
use rustc_hash::FxHashMap;

/// Callee body statement limit.
pub const MAX_INLINE_SIZE: usize = 8;

/// Inlining budget per caller.
pub const MAX_INLINES_PER_FUNCTION: usize = 16;

/// Aggregated pass counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub inlined_calls: u32,
    pub removed_stmts: u32,
    pub iterations: u32,
}

/// Run the pass pipeline to a fixpoint.
pub fn optimize(program: &mut Program) -> PassStats {
    let mut stats = PassStats::default();
    loop {
        stats.iterations += 1;
        let inlined = inline_pass(program);
        let removed = cleanup_pass(program);
        stats.inlined_calls += inlined;
        stats.removed_stmts += removed;
        if inlined == 0 && removed == 0 {
            break;
        }
        // A runaway fixpoint means a pass keeps undoing the other's work.
        if stats.iterations > 32 {
            break;
        }
    }
    stats
}

// ============================================================================
// Inlining
// ============================================================================

/// A callee qualifies when its body is a single `return expr`, it uses no
/// defer/async/coroutine machinery and no `?`, and the call site's arguments
/// are all pure. Parameters are substituted directly; substitution respects
/// shadowing so names captured by inner lambdas keep their identity.
fn inline_pass(program: &mut Program) -> u32 {
    // Snapshot inlinable bodies first; the mutation loop below needs them
    // while function bodies are being rewritten.
    let mut candidates: FxHashMap<String, (Vec<String>, Expr)> = FxHashMap::default();
    for (key, decl) in &program.functions {
        if let Some(body_expr) = inlinable_body(decl) {
            candidates.insert(
                key.clone(),
                (
                    decl.params.iter().map(|p| p.name.clone()).collect(),
                    body_expr.clone(),
                ),
            );
        }
    }
    if candidates.is_empty() {
        return 0;
    }

    let resolve: FxHashMap<String, String> = program
        .overloads
        .iter()
        .filter(|(_, keys)| keys.len() == 1)
        .map(|(name, keys)| (name.clone(), keys[0].clone()))
        .collect();

    let mut total = 0;
    let mut origin_cache: FxHashMap<String, u32> = FxHashMap::default();
    let keys: Vec<String> = program.functions.keys().cloned().collect();
    for key in keys {
        let mut budget = MAX_INLINES_PER_FUNCTION;
        let mut body = std::mem::take(&mut program.functions.get_mut(&key).unwrap().body);
        let mut count = 0;
        for stmt in &mut body {
            inline_stmt(
                stmt,
                &key,
                &candidates,
                &resolve,
                &mut budget,
                &mut count,
                &mut |callee| {
                    *origin_cache
                        .entry(callee.to_string())
                        .or_insert_with(|| program.intern_origin(callee))
                },
            );
        }
        program.functions.get_mut(&key).unwrap().body = body;
        total += count;
    }
    total
}

fn inlinable_body(decl: &FunctionDecl) -> Option<&Expr> {
    if decl.flags.host || decl.flags.cffi || decl.flags.builtin || decl.flags.is_async {
        return None;
    }
    if decl.uses_result_propagation {
        return None;
    }
    if decl.body.len() != 1 || decl.body.len() > MAX_INLINE_SIZE {
        return None;
    }
    match &decl.body[0].kind {
        StmtKind::Return(Some(expr)) => {
            if expr_uses_effect_machinery(expr) {
                None
            } else {
                Some(expr)
            }
        }
        _ => None,
    }
}

fn expr_uses_effect_machinery(e: &Expr) -> bool {
    match &e.kind {
        ExprKind::Spawn { .. }
        | ExprKind::YieldExpr(_)
        | ExprKind::Resume(_)
        | ExprKind::ChanSend { .. }
        | ExprKind::ChanRecv { .. }
        | ExprKind::MakeChannel { .. }
        | ExprKind::Propagate(_) => true,
        ExprKind::Binary { lhs, rhs, .. } => {
            expr_uses_effect_machinery(lhs) || expr_uses_effect_machinery(rhs)
        }
        ExprKind::Unary { operand, .. } => expr_uses_effect_machinery(operand),
        ExprKind::Call { args, .. } => args.iter().any(expr_uses_effect_machinery),
        ExprKind::Invoke { callee, args } => {
            expr_uses_effect_machinery(callee) || args.iter().any(expr_uses_effect_machinery)
        }
        ExprKind::Index { base, index } => {
            expr_uses_effect_machinery(base) || expr_uses_effect_machinery(index)
        }
        ExprKind::ArrayLit(items) | ExprKind::TupleLit(items) => {
            items.iter().any(expr_uses_effect_machinery)
        }
        ExprKind::NewRef(x)
        | ExprKind::Deref(x)
        | ExprKind::WeakOf(x)
        | ExprKind::SomeOf(x)
        | ExprKind::OkOf(x)
        | ExprKind::ErrOf(x) => expr_uses_effect_machinery(x),
        ExprKind::Cast { expr, .. } => expr_uses_effect_machinery(expr),
        _ => false,
    }
}

#[allow(clippy::too_many_arguments)]
fn inline_stmt(
    stmt: &mut Stmt,
    caller_key: &str,
    candidates: &FxHashMap<String, (Vec<String>, Expr)>,
    resolve: &FxHashMap<String, String>,
    budget: &mut usize,
    count: &mut u32,
    intern_origin: &mut impl FnMut(&str) -> u32,
) {
    match &mut stmt.kind {
        StmtKind::Let { init: Some(e), .. } | StmtKind::ExprStmt(e) => {
            inline_expr(e, caller_key, candidates, resolve, budget, count, intern_origin)
        }
        StmtKind::Assign { value, .. } => {
            inline_expr(value, caller_key, candidates, resolve, budget, count, intern_origin)
        }
        StmtKind::Return(Some(e)) => {
            inline_expr(e, caller_key, candidates, resolve, budget, count, intern_origin)
        }
        StmtKind::If {
            cond,
            then_body,
            else_body,
        } => {
            inline_expr(cond, caller_key, candidates, resolve, budget, count, intern_origin);
            for s in then_body.iter_mut().chain(else_body.iter_mut()) {
                inline_stmt(s, caller_key, candidates, resolve, budget, count, intern_origin);
            }
        }
        StmtKind::While { cond, body } => {
            inline_expr(cond, caller_key, candidates, resolve, budget, count, intern_origin);
            for s in body {
                inline_stmt(s, caller_key, candidates, resolve, budget, count, intern_origin);
            }
        }
        StmtKind::For { from, to, body, .. } => {
            inline_expr(from, caller_key, candidates, resolve, budget, count, intern_origin);
            inline_expr(to, caller_key, candidates, resolve, budget, count, intern_origin);
            for s in body {
                inline_stmt(s, caller_key, candidates, resolve, budget, count, intern_origin);
            }
        }
        StmtKind::Block(body) | StmtKind::Defer(body) => {
            for s in body {
                inline_stmt(s, caller_key, candidates, resolve, budget, count, intern_origin);
            }
        }
        _ => {}
    }
}

#[allow(clippy::too_many_arguments)]
fn inline_expr(
    e: &mut Expr,
    caller_key: &str,
    candidates: &FxHashMap<String, (Vec<String>, Expr)>,
    resolve: &FxHashMap<String, String>,
    budget: &mut usize,
    count: &mut u32,
    intern_origin: &mut impl FnMut(&str) -> u32,
) {
    // Children first, so nested calls inline bottom-up.
    match &mut e.kind {
        ExprKind::Binary { lhs, rhs, .. } => {
            inline_expr(lhs, caller_key, candidates, resolve, budget, count, intern_origin);
            inline_expr(rhs, caller_key, candidates, resolve, budget, count, intern_origin);
        }
        ExprKind::Unary { operand, .. } => {
            inline_expr(operand, caller_key, candidates, resolve, budget, count, intern_origin)
        }
        ExprKind::Call { args, .. } => {
            for a in args.iter_mut() {
                inline_expr(a, caller_key, candidates, resolve, budget, count, intern_origin);
            }
        }
        ExprKind::Index { base, index } => {
            inline_expr(base, caller_key, candidates, resolve, budget, count, intern_origin);
            inline_expr(index, caller_key, candidates, resolve, budget, count, intern_origin);
        }
        ExprKind::ArrayLit(items) | ExprKind::TupleLit(items) => {
            for a in items.iter_mut() {
                inline_expr(a, caller_key, candidates, resolve, budget, count, intern_origin);
            }
        }
        ExprKind::NewRef(x)
        | ExprKind::Deref(x)
        | ExprKind::WeakOf(x)
        | ExprKind::SomeOf(x)
        | ExprKind::OkOf(x)
        | ExprKind::ErrOf(x)
        | ExprKind::Propagate(x) => {
            inline_expr(x, caller_key, candidates, resolve, budget, count, intern_origin)
        }
        _ => {}
    }

    let ExprKind::Call { name, args } = &e.kind else {
        return;
    };
    if *budget == 0 {
        return;
    }
    let Some(callee_key) = resolve.get(name) else {
        return;
    };
    // Self-recursion never inlines.
    if callee_key == caller_key {
        return;
    }
    let Some((params, body)) = candidates.get(callee_key) else {
        return;
    };
    if params.len() != args.len() || !args.iter().all(|a| a.is_pure()) {
        return;
    }

    let substitutions: FxHashMap<&str, &Expr> = params
        .iter()
        .map(|p| p.as_str())
        .zip(args.iter())
        .collect();
    let origin = intern_origin(name);
    let mut inlined = body.clone();
    substitute(&mut inlined, &substitutions, &mut Vec::new());
    retag_origin(&mut inlined, origin);
    inlined.ty = e.ty.clone();
    *e = inlined;
    *budget -= 1;
    *count += 1;
}

/// Replace parameter references by argument expressions, skipping scopes
/// where a lambda parameter or local declaration shadows the name.
fn substitute(e: &mut Expr, subs: &FxHashMap<&str, &Expr>, shadowed: &mut Vec<String>) {
    match &mut e.kind {
        ExprKind::Var(name) => {
            if !shadowed.contains(name) {
                if let Some(replacement) = subs.get(name.as_str()) {
                    let pos = e.pos;
                    *e = (*replacement).clone();
                    e.pos = pos;
                }
            }
        }
        ExprKind::Binary { lhs, rhs, .. } => {
            substitute(lhs, subs, shadowed);
            substitute(rhs, subs, shadowed);
        }
        ExprKind::Unary { operand, .. } => substitute(operand, subs, shadowed),
        ExprKind::Call { args, .. } => {
            args.iter_mut().for_each(|a| substitute(a, subs, shadowed))
        }
        ExprKind::Invoke { callee, args } => {
            substitute(callee, subs, shadowed);
            args.iter_mut().for_each(|a| substitute(a, subs, shadowed));
        }
        ExprKind::Index { base, index } => {
            substitute(base, subs, shadowed);
            substitute(index, subs, shadowed);
        }
        ExprKind::Slice { base, lo, hi } => {
            substitute(base, subs, shadowed);
            substitute(lo, subs, shadowed);
            substitute(hi, subs, shadowed);
        }
        ExprKind::Field { base, .. } => substitute(base, subs, shadowed),
        ExprKind::ArrayLit(items) | ExprKind::TupleLit(items) => {
            items.iter_mut().for_each(|a| substitute(a, subs, shadowed))
        }
        ExprKind::NewRef(x)
        | ExprKind::Deref(x)
        | ExprKind::WeakOf(x)
        | ExprKind::SomeOf(x)
        | ExprKind::OkOf(x)
        | ExprKind::ErrOf(x)
        | ExprKind::Propagate(x) => substitute(x, subs, shadowed),
        ExprKind::Cast { expr, .. } => substitute(expr, subs, shadowed),
        ExprKind::Lambda { params, body, .. } => {
            let depth = shadowed.len();
            shadowed.extend(params.iter().map(|p| p.name.clone()));
            substitute_stmts(body, subs, shadowed);
            shadowed.truncate(depth);
        }
        _ => {}
    }
}

fn substitute_stmts(body: &mut [Stmt], subs: &FxHashMap<&str, &Expr>, shadowed: &mut Vec<String>) {
    for stmt in body {
        match &mut stmt.kind {
            StmtKind::Let { name, init, .. } => {
                if let Some(e) = init {
                    substitute(e, subs, shadowed);
                }
                shadowed.push(name.clone());
            }
            StmtKind::Assign { target, value } => {
                substitute(value, subs, shadowed);
                match target {
                    LValue::Index { base, index } => {
                        substitute(base, subs, shadowed);
                        substitute(index, subs, shadowed);
                    }
                    LValue::Field { base, .. } => substitute(base, subs, shadowed),
                    LValue::Deref(base) => substitute(base, subs, shadowed),
                    LValue::Var(_) => {}
                }
            }
            StmtKind::ExprStmt(e) | StmtKind::Return(Some(e)) => substitute(e, subs, shadowed),
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                substitute(cond, subs, shadowed);
                substitute_stmts(then_body, subs, shadowed);
                substitute_stmts(else_body, subs, shadowed);
            }
            StmtKind::While { cond, body } => {
                substitute(cond, subs, shadowed);
                substitute_stmts(body, subs, shadowed);
            }
            StmtKind::For {
                var,
                from,
                to,
                body,
            } => {
                substitute(from, subs, shadowed);
                substitute(to, subs, shadowed);
                shadowed.push(var.clone());
                substitute_stmts(body, subs, shadowed);
            }
            StmtKind::Block(b) | StmtKind::Defer(b) => substitute_stmts(b, subs, shadowed),
            _ => {}
        }
    }
}

/// Tag every position in the inlined expression with the callee's name.
fn retag_origin(e: &mut Expr, origin: u32) {
    e.pos.origin = origin;
    match &mut e.kind {
        ExprKind::Binary { lhs, rhs, .. } => {
            retag_origin(lhs, origin);
            retag_origin(rhs, origin);
        }
        ExprKind::Unary { operand, .. } => retag_origin(operand, origin),
        ExprKind::Call { args, .. } => args.iter_mut().for_each(|a| retag_origin(a, origin)),
        ExprKind::Index { base, index } => {
            retag_origin(base, origin);
            retag_origin(index, origin);
        }
        ExprKind::ArrayLit(items) | ExprKind::TupleLit(items) => {
            items.iter_mut().for_each(|a| retag_origin(a, origin))
        }
        ExprKind::NewRef(x)
        | ExprKind::Deref(x)
        | ExprKind::WeakOf(x)
        | ExprKind::SomeOf(x)
        | ExprKind::OkOf(x)
        | ExprKind::ErrOf(x)
        | ExprKind::Propagate(x) => retag_origin(x, origin),
        ExprKind::Cast { expr, .. } => retag_origin(expr, origin),
        _ => {}
    }
}

// ============================================================================
// Cleanup
// ============================================================================

/// Remove `x = x` self-assignments, pure expression statements, and dead
/// stores where the very next statement overwrites the same variable without
/// reading it.
fn cleanup_pass(program: &mut Program) -> u32 {
    let mut removed = 0;
    let keys: Vec<String> = program.functions.keys().cloned().collect();
    for key in keys {
        let decl = program.functions.get_mut(&key).unwrap();
        removed += cleanup_block(&mut decl.body);
    }
    removed += cleanup_block(&mut program.globals);
    removed
}

fn cleanup_block(body: &mut Vec<Stmt>) -> u32 {
    let mut removed = 0;

    // Recurse into nested bodies first.
    for stmt in body.iter_mut() {
        match &mut stmt.kind {
            StmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                removed += cleanup_block(then_body);
                removed += cleanup_block(else_body);
            }
            StmtKind::While { body, .. } | StmtKind::For { body, .. } => {
                removed += cleanup_block(body);
            }
            StmtKind::Block(b) | StmtKind::Defer(b) => {
                removed += cleanup_block(b);
            }
            _ => {}
        }
    }

    let mut keep: Vec<bool> = vec![true; body.len()];
    for i in 0..body.len() {
        match &body[i].kind {
            // x = x
            StmtKind::Assign {
                target: LValue::Var(name),
                value,
            } if matches!(&value.kind, ExprKind::Var(v) if v == name) => {
                keep[i] = false;
                removed += 1;
            }
            // Pure expression statement.
            StmtKind::ExprStmt(e) if e.is_pure() => {
                keep[i] = false;
                removed += 1;
            }
            // Dead store: next statement rewrites the variable without
            // reading the stored value.
            StmtKind::Assign {
                target: LValue::Var(name),
                value,
            } if value.is_pure() => {
                if let Some(next) = body.get(i + 1) {
                    if let StmtKind::Assign {
                        target: LValue::Var(next_name),
                        value: next_value,
                    } = &next.kind
                    {
                        if next_name == name && !expr_reads_var(next_value, name) {
                            keep[i] = false;
                            removed += 1;
                        }
                    }
                }
            }
            _ => {}
        }
    }
    let mut idx = 0;
    body.retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });
    removed
}

fn expr_reads_var(e: &Expr, name: &str) -> bool {
    match &e.kind {
        ExprKind::Var(v) => v == name,
        ExprKind::Binary { lhs, rhs, .. } => {
            expr_reads_var(lhs, name) || expr_reads_var(rhs, name)
        }
        ExprKind::Unary { operand, .. } => expr_reads_var(operand, name),
        ExprKind::Call { args, .. } => args.iter().any(|a| expr_reads_var(a, name)),
        ExprKind::Invoke { callee, args } => {
            expr_reads_var(callee, name) || args.iter().any(|a| expr_reads_var(a, name))
        }
        ExprKind::Index { base, index } => {
            expr_reads_var(base, name) || expr_reads_var(index, name)
        }
        ExprKind::Field { base, .. } => expr_reads_var(base, name),
        ExprKind::ArrayLit(items) | ExprKind::TupleLit(items) => {
            items.iter().any(|a| expr_reads_var(a, name))
        }
        ExprKind::NewRef(x)
        | ExprKind::Deref(x)
        | ExprKind::WeakOf(x)
        | ExprKind::SomeOf(x)
        | ExprKind::OkOf(x)
        | ExprKind::ErrOf(x)
        | ExprKind::Propagate(x) => expr_reads_var(x, name),
        ExprKind::Cast { expr, .. } => expr_reads_var(expr, name),
        ExprKind::Lambda { .. } => true, // captures may read it later
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builder::*;
    use crate::ast::{BinOp, Type};

    #[test]
    fn test_single_return_callee_inlines() {
        let mut program = Program::new();
        program.add_function(func(
            "double",
            vec![param("n", Type::Int)],
            Type::Int,
            vec![ret(binary(BinOp::Mul, var("n"), int(2)))],
        ));
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![ret(call("double", vec![int(21)]))],
        ));
        let stats = optimize(&mut program);
        assert!(stats.inlined_calls >= 1);

        let main = program.resolve("main").unwrap();
        match &main.body[0].kind {
            StmtKind::Return(Some(e)) => {
                assert!(matches!(e.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
                // Inlined code carries the callee's name for attribution.
                assert_eq!(program.origin_name(e.pos.origin), Some("double"));
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_impure_args_block_inlining() {
        let mut program = Program::new();
        program.add_function(func(
            "double",
            vec![param("n", Type::Int)],
            Type::Int,
            vec![ret(binary(BinOp::Mul, var("n"), int(2)))],
        ));
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![ret(call("double", vec![call("rand", vec![])]))],
        ));
        let stats = optimize(&mut program);
        assert_eq!(stats.inlined_calls, 0);
    }

    #[test]
    fn test_self_assignment_removed() {
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![
                let_stmt("x", Type::Int, int(1)),
                assign("x", var("x")),
                ret(var("x")),
            ],
        ));
        let stats = optimize(&mut program);
        assert!(stats.removed_stmts >= 1);
        assert_eq!(program.resolve("main").unwrap().body.len(), 2);
    }

    #[test]
    fn test_dead_store_removed() {
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![
                let_stmt("x", Type::Int, int(1)),
                assign("x", int(2)),
                assign("x", int(3)),
                ret(var("x")),
            ],
        ));
        optimize(&mut program);
        let body = &program.resolve("main").unwrap().body;
        // `x = 2` is gone; the declaration and final store remain.
        assert_eq!(body.len(), 3);
    }

    #[test]
    fn test_pure_expr_stmt_removed() {
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![
                expr_stmt(binary(BinOp::Add, int(1), int(2))),
                ret(int(0)),
            ],
        ));
        let stats = optimize(&mut program);
        assert!(stats.removed_stmts >= 1);
        assert_eq!(program.resolve("main").unwrap().body.len(), 1);
    }

    #[test]
    fn test_recursion_does_not_inline() {
        let mut program = Program::new();
        program.add_function(func(
            "loopy",
            vec![param("n", Type::Int)],
            Type::Int,
            vec![ret(call("loopy", vec![var("n")]))],
        ));
        let stats = optimize(&mut program);
        assert_eq!(stats.inlined_calls, 0);
    }
}
