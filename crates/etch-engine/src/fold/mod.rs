//! The compile-time folder.
//!
//! Reduces the AST before the type-driven passes: folds literal operator
//! applications (leaving anything that would divide by zero or overflow for
//! the prover to flag), executes `comptime` blocks in a sandboxed VM
//! sub-session, materializes `inject` declarations as globals, and resolves
//! `compiles { … }` probes on a second pass once the type environment is
//! populated.

pub mod comptime;

use crate::ast::{builder, BinOp, Expr, ExprKind, Program, Stmt, StmtKind, Type, UnOp};
use crate::diagnostics::Diagnostic;
use crate::vm::CValue;

/// Run both fold passes and all comptime blocks. Returned diagnostics are
/// warnings (comptime failures downgrade); compilation continues.
pub fn fold_program(program: &mut Program) -> Vec<Diagnostic> {
    let mut warnings = Vec::new();

    // Pass one: plain constant folding; `compiles` probes are skipped.
    fold_all(program, false);

    // Comptime execution against the folded program.
    run_comptime_blocks(program, &mut warnings);

    // Pass two: resolve `compiles` probes, then fold the results through.
    resolve_compiles(program);
    fold_all(program, true);

    warnings
}

fn fold_all(program: &mut Program, _second_pass: bool) {
    let keys: Vec<String> = program.functions.keys().cloned().collect();
    for key in keys {
        let mut body = std::mem::take(&mut program.functions.get_mut(&key).unwrap().body);
        for stmt in &mut body {
            fold_stmt(stmt);
        }
        program.functions.get_mut(&key).unwrap().body = body;
    }
    let mut globals = std::mem::take(&mut program.globals);
    for stmt in &mut globals {
        fold_stmt(stmt);
    }
    program.globals = globals;
}

fn run_comptime_blocks(program: &mut Program, warnings: &mut Vec<Diagnostic>) {
    // Collect block bodies first; each executes against a snapshot of the
    // program with every comptime statement stripped.
    let mut blocks: Vec<(Vec<Stmt>, crate::ast::SourcePos)> = Vec::new();
    let keys: Vec<String> = program.functions.keys().cloned().collect();
    for key in &keys {
        collect_comptime(&program.functions[key].body, &mut blocks);
    }
    collect_comptime(&program.globals, &mut blocks);
    if blocks.is_empty() {
        return;
    }

    let snapshot = comptime::strip_comptime(program);
    for (block, pos) in blocks {
        match comptime::run_comptime_block(&snapshot, &block, pos) {
            Ok(injected) => {
                for (name, ty_str, value) in injected {
                    let ty = crate::ast::parse_type_str(&ty_str).unwrap_or(Type::Inferred);
                    if let Some(init) = cvalue_to_expr(&value) {
                        program.globals.push(builder::let_stmt(&name, ty, init));
                    } else {
                        warnings.push(
                            Diagnostic::warning(
                                crate::diagnostics::ErrorKind::Compile,
                                format!("inject '{name}': value has no literal form"),
                            )
                            .at(program.file_name(pos.file), pos),
                        );
                    }
                }
            }
            Err(diag) => warnings.push(diag),
        }
    }

    // Comptime blocks are consumed: drop them from every body.
    for key in keys {
        let decl = program.functions.get_mut(&key).unwrap();
        remove_comptime(&mut decl.body);
    }
    remove_comptime(&mut program.globals);
}

fn collect_comptime(body: &[Stmt], out: &mut Vec<(Vec<Stmt>, crate::ast::SourcePos)>) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Comptime(block) => out.push((block.clone(), stmt.pos)),
            StmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                collect_comptime(then_body, out);
                collect_comptime(else_body, out);
            }
            StmtKind::While { body, .. } | StmtKind::For { body, .. } => {
                collect_comptime(body, out)
            }
            StmtKind::Block(b) | StmtKind::Defer(b) => collect_comptime(b, out),
            _ => {}
        }
    }
}

fn remove_comptime(body: &mut Vec<Stmt>) {
    body.retain(|s| !matches!(s.kind, StmtKind::Comptime(_)));
    for stmt in body {
        match &mut stmt.kind {
            StmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                remove_comptime(then_body);
                remove_comptime(else_body);
            }
            StmtKind::While { body, .. } | StmtKind::For { body, .. } => remove_comptime(body),
            StmtKind::Block(b) | StmtKind::Defer(b) => remove_comptime(b),
            _ => {}
        }
    }
}

fn resolve_compiles(program: &mut Program) {
    let snapshot = comptime::strip_comptime(program);
    let keys: Vec<String> = program.functions.keys().cloned().collect();
    for key in keys {
        let mut body = std::mem::take(&mut program.functions.get_mut(&key).unwrap().body);
        for stmt in &mut body {
            resolve_compiles_stmt(stmt, &snapshot);
        }
        program.functions.get_mut(&key).unwrap().body = body;
    }
}

fn resolve_compiles_stmt(stmt: &mut Stmt, snapshot: &Program) {
    visit_exprs_mut(stmt, &mut |e| {
        if let ExprKind::Compiles(block) = &e.kind {
            let ok = comptime::block_typechecks(snapshot, block);
            e.kind = ExprKind::Bool(ok);
            e.ty = Type::Bool;
        }
    });
}

/// Statement-level expression walker used by the fold passes.
fn visit_exprs_mut(stmt: &mut Stmt, f: &mut impl FnMut(&mut Expr)) {
    fn walk(e: &mut Expr, f: &mut impl FnMut(&mut Expr)) {
        match &mut e.kind {
            ExprKind::Binary { lhs, rhs, .. } => {
                walk(lhs, f);
                walk(rhs, f);
            }
            ExprKind::Unary { operand, .. } => walk(operand, f),
            ExprKind::Call { args, .. } => args.iter_mut().for_each(|a| walk(a, f)),
            ExprKind::Invoke { callee, args } => {
                walk(callee, f);
                args.iter_mut().for_each(|a| walk(a, f));
            }
            ExprKind::Index { base, index } => {
                walk(base, f);
                walk(index, f);
            }
            ExprKind::Slice { base, lo, hi } => {
                walk(base, f);
                walk(lo, f);
                walk(hi, f);
            }
            ExprKind::Field { base, .. } => walk(base, f),
            ExprKind::ArrayLit(items) | ExprKind::TupleLit(items) => {
                items.iter_mut().for_each(|a| walk(a, f))
            }
            ExprKind::NewRef(x)
            | ExprKind::Deref(x)
            | ExprKind::WeakOf(x)
            | ExprKind::SomeOf(x)
            | ExprKind::OkOf(x)
            | ExprKind::ErrOf(x)
            | ExprKind::Propagate(x) => walk(x, f),
            ExprKind::Cast { expr, .. } => walk(expr, f),
            ExprKind::Lambda { body, .. } => {
                for s in body {
                    visit_exprs_inner(s, f);
                }
            }
            ExprKind::Spawn { call } => walk(call, f),
            ExprKind::YieldExpr(Some(v)) => walk(v, f),
            ExprKind::Resume(t) => walk(t, f),
            ExprKind::ObjectLit { fields, .. } => {
                fields.iter_mut().for_each(|(_, v)| walk(v, f))
            }
            ExprKind::MakeChannel { capacity, .. } => walk(capacity, f),
            ExprKind::ChanSend { chan, value } => {
                walk(chan, f);
                walk(value, f);
            }
            ExprKind::ChanRecv { chan } => walk(chan, f),
            _ => {}
        }
        f(e);
    }
    fn visit_exprs_inner(stmt: &mut Stmt, f: &mut impl FnMut(&mut Expr)) {
        match &mut stmt.kind {
            StmtKind::Let { init: Some(e), .. } | StmtKind::ExprStmt(e) => walk(e, f),
            StmtKind::Assign { target, value } => {
                walk(value, f);
                use crate::ast::LValue;
                match target {
                    LValue::Index { base, index } => {
                        walk(base, f);
                        walk(index, f);
                    }
                    LValue::Field { base, .. } => walk(base, f),
                    LValue::Deref(base) => walk(base, f),
                    LValue::Var(_) => {}
                }
            }
            StmtKind::Return(Some(e)) => walk(e, f),
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                walk(cond, f);
                then_body.iter_mut().for_each(|s| visit_exprs_inner(s, f));
                else_body.iter_mut().for_each(|s| visit_exprs_inner(s, f));
            }
            StmtKind::While { cond, body } => {
                walk(cond, f);
                body.iter_mut().for_each(|s| visit_exprs_inner(s, f));
            }
            StmtKind::For { from, to, body, .. } => {
                walk(from, f);
                walk(to, f);
                body.iter_mut().for_each(|s| visit_exprs_inner(s, f));
            }
            StmtKind::Block(b) | StmtKind::Defer(b) | StmtKind::Comptime(b) => {
                b.iter_mut().for_each(|s| visit_exprs_inner(s, f))
            }
            _ => {}
        }
    }
    visit_exprs_inner(stmt, f);
}

fn fold_stmt(stmt: &mut Stmt) {
    visit_exprs_mut(stmt, &mut fold_expr_once);
}

/// Fold one node if its children are literals. `compiles` probes fold on the
/// second pass only (they are rewritten to bool literals before this runs
/// again); canonicalizes the `isError` alias.
fn fold_expr_once(e: &mut Expr) {
    if let ExprKind::Call { name, .. } = &mut e.kind {
        if name == "isError" {
            *name = "isErr".to_string();
        }
    }
    let folded: Option<ExprKind> = match &e.kind {
        ExprKind::Binary { op, lhs, rhs } => fold_binary(*op, lhs, rhs),
        ExprKind::Unary { op, operand } => fold_unary(*op, operand),
        _ => None,
    };
    if let Some(kind) = folded {
        e.ty = match &kind {
            ExprKind::Int(_) => Type::Int,
            ExprKind::Float(_) => Type::Float,
            ExprKind::Bool(_) => Type::Bool,
            ExprKind::Str(_) => Type::Str,
            _ => e.ty.clone(),
        };
        e.kind = kind;
    }
}

fn fold_binary(op: BinOp, lhs: &Expr, rhs: &Expr) -> Option<ExprKind> {
    use ExprKind::*;
    Some(match (op, &lhs.kind, &rhs.kind) {
        // Integer arithmetic; division/modulo by zero and overflow are left
        // in place for the prover.
        (BinOp::Add, Int(a), Int(b)) => Int(a.checked_add(*b)?),
        (BinOp::Sub, Int(a), Int(b)) => Int(a.checked_sub(*b)?),
        (BinOp::Mul, Int(a), Int(b)) => Int(a.checked_mul(*b)?),
        (BinOp::Div, Int(a), Int(b)) if *b != 0 => Int(a.checked_div(*b)?),
        (BinOp::Mod, Int(a), Int(b)) if *b != 0 => Int(a.checked_rem(*b)?),

        (BinOp::Add, Float(a), Float(b)) => Float(a + b),
        (BinOp::Sub, Float(a), Float(b)) => Float(a - b),
        (BinOp::Mul, Float(a), Float(b)) => Float(a * b),
        (BinOp::Div, Float(a), Float(b)) => Float(a / b),

        (BinOp::Add, Str(a), Str(b)) => Str(format!("{a}{b}")),

        (BinOp::Eq, Int(a), Int(b)) => Bool(a == b),
        (BinOp::Ne, Int(a), Int(b)) => Bool(a != b),
        (BinOp::Lt, Int(a), Int(b)) => Bool(a < b),
        (BinOp::Le, Int(a), Int(b)) => Bool(a <= b),
        (BinOp::Gt, Int(a), Int(b)) => Bool(a > b),
        (BinOp::Ge, Int(a), Int(b)) => Bool(a >= b),

        (BinOp::Eq, Str(a), Str(b)) => Bool(a == b),
        (BinOp::Ne, Str(a), Str(b)) => Bool(a != b),
        (BinOp::Lt, Str(a), Str(b)) => Bool(a < b),

        (BinOp::Eq, Bool(a), Bool(b)) => Bool(a == b),
        (BinOp::Ne, Bool(a), Bool(b)) => Bool(a != b),
        (BinOp::And, Bool(a), Bool(b)) => Bool(*a && *b),
        (BinOp::Or, Bool(a), Bool(b)) => Bool(*a || *b),

        _ => return None,
    })
}

fn fold_unary(op: UnOp, operand: &Expr) -> Option<ExprKind> {
    use ExprKind::*;
    Some(match (op, &operand.kind) {
        (UnOp::Neg, Int(v)) => Int(v.checked_neg()?),
        (UnOp::Neg, Float(v)) => Float(-v),
        (UnOp::Not, Bool(v)) => Bool(!v),
        _ => return None,
    })
}

fn cvalue_to_expr(cv: &CValue) -> Option<Expr> {
    Some(match cv {
        CValue::Int(v) => builder::int(*v),
        CValue::Float(v) => builder::float(*v),
        CValue::Bool(v) => builder::boolean(*v),
        CValue::Str(v) => builder::string(v),
        CValue::Char(v) => Expr::new(ExprKind::Char(*v), Type::Char, Default::default()),
        CValue::Nil => builder::nil(),
        CValue::Array(items) => {
            let exprs: Option<Vec<Expr>> = items.iter().map(cvalue_to_expr).collect();
            builder::array(exprs?)
        }
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builder::*;

    #[test]
    fn test_literal_arithmetic_folds() {
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![ret(binary(
                BinOp::Add,
                binary(BinOp::Mul, int(6), int(7)),
                int(0),
            ))],
        ));
        fold_program(&mut program);
        let main = program.resolve("main").unwrap();
        assert!(matches!(
            main.body[0].kind,
            StmtKind::Return(Some(Expr {
                kind: ExprKind::Int(42),
                ..
            }))
        ));
    }

    #[test]
    fn test_overflow_not_folded() {
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![ret(binary(BinOp::Add, int(i64::MAX), int(1)))],
        ));
        fold_program(&mut program);
        let main = program.resolve("main").unwrap();
        assert!(matches!(
            main.body[0].kind,
            StmtKind::Return(Some(Expr {
                kind: ExprKind::Binary { .. },
                ..
            }))
        ));
    }

    #[test]
    fn test_division_by_zero_not_folded() {
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![ret(binary(BinOp::Div, int(1), int(0)))],
        ));
        fold_program(&mut program);
        let main = program.resolve("main").unwrap();
        assert!(matches!(
            main.body[0].kind,
            StmtKind::Return(Some(Expr {
                kind: ExprKind::Binary { .. },
                ..
            }))
        ));
    }

    #[test]
    fn test_string_concat_folds() {
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Str,
            vec![ret(binary(BinOp::Add, string("et"), string("ch")))],
        ));
        fold_program(&mut program);
        let main = program.resolve("main").unwrap();
        match &main.body[0].kind {
            StmtKind::Return(Some(e)) => {
                assert_eq!(e.kind, ExprKind::Str("etch".to_string()));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_is_error_alias_canonicalized() {
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Bool,
            vec![ret(call("isError", vec![call("parseInt", vec![string("x")])]))],
        ));
        fold_program(&mut program);
        let main = program.resolve("main").unwrap();
        match &main.body[0].kind {
            StmtKind::Return(Some(e)) => match &e.kind {
                ExprKind::Call { name, .. } => assert_eq!(name, "isErr"),
                other => panic!("unexpected: {other:?}"),
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_comptime_inject_creates_global() {
        // comptime { inject("answer", "int", 6 * 7); }
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Int,
            vec![
                Stmt::new(
                    StmtKind::Comptime(vec![expr_stmt(call(
                        "inject",
                        vec![string("answer"), string("int"), binary(BinOp::Mul, int(6), int(7))],
                    ))]),
                    Default::default(),
                ),
                ret(var("answer")),
            ],
        ));
        let warnings = fold_program(&mut program);
        assert!(warnings.is_empty(), "warnings: {warnings:?}");
        // Comptime block is consumed.
        let main = program.resolve("main").unwrap();
        assert_eq!(main.body.len(), 1);
        // And the injected global exists with the computed value.
        assert!(program.globals.iter().any(|s| matches!(
            &s.kind,
            StmtKind::Let { name, init: Some(e), .. }
                if name == "answer" && e.kind == ExprKind::Int(42)
        )));
    }

    #[test]
    fn test_comptime_failure_downgrades_to_warning() {
        // comptime { let xs = [1]; print(xs[5]); } — runtime error inside the
        // sandbox must not abort compilation.
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Void,
            vec![Stmt::new(
                StmtKind::Comptime(vec![
                    let_stmt("xs", Type::Array(Box::new(Type::Int)), array(vec![int(1)])),
                    expr_stmt(call("print", vec![index(var("xs"), int(5))])),
                ]),
                Default::default(),
            )],
        ));
        let warnings = fold_program(&mut program);
        assert_eq!(warnings.len(), 1);
        // The block is still consumed so compilation can continue.
        assert!(program.resolve("main").unwrap().body.is_empty());
    }

    #[test]
    fn test_compiles_probe_resolves() {
        use crate::ast::Expr;
        // compiles { let x: int = 1; } → true
        // compiles { let x: int = "s"; } → false
        let good = Expr::new(
            ExprKind::Compiles(vec![let_stmt("x", Type::Int, int(1))]),
            Type::Inferred,
            Default::default(),
        );
        let bad = Expr::new(
            ExprKind::Compiles(vec![let_stmt("x", Type::Int, string("s"))]),
            Type::Inferred,
            Default::default(),
        );
        let mut program = Program::new();
        program.add_function(func(
            "main",
            vec![],
            Type::Bool,
            vec![let_stmt("a", Type::Bool, good), ret(bad)],
        ));
        fold_program(&mut program);
        let main = program.resolve("main").unwrap();
        match &main.body[0].kind {
            StmtKind::Let { init: Some(e), .. } => assert_eq!(e.kind, ExprKind::Bool(true)),
            other => panic!("unexpected: {other:?}"),
        }
        match &main.body[1].kind {
            StmtKind::Return(Some(e)) => assert_eq!(e.kind, ExprKind::Bool(false)),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
