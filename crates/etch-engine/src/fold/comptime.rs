//! Comptime block execution and the `compiles` probe's type check.
//!
//! A `comptime { … }` block becomes the body of a synthetic entry function in
//! an isolated copy of the program, compiled through the normal emitter and
//! run on a sandboxed VM (fresh heap, no host functions, buffered output).
//! `inject` calls observed during the run surface as global declarations;
//! any failure downgrades to a warning at the block's position.

use crate::ast::{
    mangle, BinOp, Expr, ExprKind, FunctionDecl, LValue, Program, SourcePos, Stmt, StmtKind, Type,
};
use crate::codegen::{emit_program, CodegenOptions};
use crate::diagnostics::{Diagnostic, ErrorKind};
use crate::vm::{builtins, CValue, Vm};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// Entry-function name for comptime bodies; can never collide with user code.
const COMPTIME_ENTRY: &str = "<comptime>";

/// A deep copy of the program with every comptime statement removed, suitable
/// for compiling sandbox sessions and checking `compiles` probes.
pub fn strip_comptime(program: &Program) -> Program {
    let mut copy = program.clone();
    let keys: Vec<String> = copy.functions.keys().cloned().collect();
    for key in keys {
        strip(&mut copy.functions.get_mut(&key).unwrap().body);
    }
    strip(&mut copy.globals);
    copy
}

fn strip(body: &mut Vec<Stmt>) {
    body.retain(|s| !matches!(s.kind, StmtKind::Comptime(_)));
    for stmt in body {
        match &mut stmt.kind {
            StmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                strip(then_body);
                strip(else_body);
            }
            StmtKind::While { body, .. } | StmtKind::For { body, .. } => strip(body),
            StmtKind::Block(b) | StmtKind::Defer(b) => strip(b),
            _ => {}
        }
    }
}

/// Compile and execute one comptime block. Returns the observed `inject`
/// declarations, or a warning diagnostic on any failure.
///
/// The sandbox program contains the globals plus only the functions
/// transitively reachable from the block, so bodies that depend on
/// yet-to-be-injected globals never disturb the sandbox compile.
pub fn run_comptime_block(
    snapshot: &Program,
    block: &[Stmt],
    pos: SourcePos,
) -> Result<Vec<(String, String, CValue)>, Diagnostic> {
    let mut sub = Program {
        functions: Default::default(),
        overloads: Default::default(),
        globals: snapshot.globals.clone(),
        user_types: snapshot.user_types.clone(),
        source_hash: snapshot.source_hash,
        source_files: snapshot.source_files.clone(),
        origin_names: snapshot.origin_names.clone(),
    };
    let mut wanted: Vec<String> = Vec::new();
    collect_called_names(block, &mut wanted);
    for stmt in &snapshot.globals {
        collect_called_names(std::slice::from_ref(stmt), &mut wanted);
    }
    let mut cursor = 0;
    while cursor < wanted.len() {
        let name = wanted[cursor].clone();
        cursor += 1;
        if let Some(decl) = snapshot.resolve(&name) {
            let key = decl.key();
            if !sub.functions.contains_key(&key) {
                let decl = decl.clone();
                collect_called_names(&decl.body, &mut wanted);
                sub.add_function(decl);
            }
        }
    }
    sub.add_function(FunctionDecl {
        name: COMPTIME_ENTRY.to_string(),
        type_params: Vec::new(),
        params: Vec::new(),
        ret: Type::Void,
        body: block.to_vec(),
        flags: Default::default(),
        uses_result_propagation: false,
        first_propagation_pos: None,
        extern_library: None,
        pos,
    });

    let downgrade = |message: String| {
        Diagnostic::warning(
            ErrorKind::Compile,
            format!("comptime block failed: {message}"),
        )
        .at(snapshot.file_name(pos.file), pos)
    };

    let bytecode =
        emit_program(&sub, &CodegenOptions::default()).map_err(|d| downgrade(d.message))?;

    let out = Rc::new(RefCell::new(String::new()));
    let mut vm = Vm::sandbox(Rc::new(bytecode), out);
    let entry_key = mangle(COMPTIME_ENTRY, &[], &Type::Void);
    vm.call_function(&entry_key, Vec::new())
        .map_err(|e| downgrade(e.to_string()))?;
    Ok(std::mem::take(&mut vm.inject_log))
}

/// Collect every name invoked through calls or spawns in a statement list.
fn collect_called_names(body: &[Stmt], out: &mut Vec<String>) {
    fn walk_expr(e: &Expr, out: &mut Vec<String>) {
        match &e.kind {
            ExprKind::Call { name, args } => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
                args.iter().for_each(|a| walk_expr(a, out));
            }
            ExprKind::Spawn { call } => walk_expr(call, out),
            ExprKind::Binary { lhs, rhs, .. } => {
                walk_expr(lhs, out);
                walk_expr(rhs, out);
            }
            ExprKind::Unary { operand, .. } => walk_expr(operand, out),
            ExprKind::Invoke { callee, args } => {
                walk_expr(callee, out);
                args.iter().for_each(|a| walk_expr(a, out));
            }
            ExprKind::Index { base, index } => {
                walk_expr(base, out);
                walk_expr(index, out);
            }
            ExprKind::Slice { base, lo, hi } => {
                walk_expr(base, out);
                walk_expr(lo, out);
                walk_expr(hi, out);
            }
            ExprKind::Field { base, .. } => walk_expr(base, out),
            ExprKind::ArrayLit(items) | ExprKind::TupleLit(items) => {
                items.iter().for_each(|a| walk_expr(a, out))
            }
            ExprKind::NewRef(x)
            | ExprKind::Deref(x)
            | ExprKind::WeakOf(x)
            | ExprKind::SomeOf(x)
            | ExprKind::OkOf(x)
            | ExprKind::ErrOf(x)
            | ExprKind::Propagate(x) => walk_expr(x, out),
            ExprKind::Cast { expr, .. } => walk_expr(expr, out),
            ExprKind::Lambda { body, .. } => collect_called_names(body, out),
            ExprKind::YieldExpr(Some(v)) => walk_expr(v, out),
            ExprKind::Resume(t) => walk_expr(t, out),
            ExprKind::ObjectLit { fields, .. } => {
                fields.iter().for_each(|(_, v)| walk_expr(v, out))
            }
            ExprKind::MakeChannel { capacity, .. } => walk_expr(capacity, out),
            ExprKind::ChanSend { chan, value } => {
                walk_expr(chan, out);
                walk_expr(value, out);
            }
            ExprKind::ChanRecv { chan } => walk_expr(chan, out),
            _ => {}
        }
    }
    for stmt in body {
        match &stmt.kind {
            StmtKind::Let { init: Some(e), .. } | StmtKind::ExprStmt(e) => walk_expr(e, out),
            StmtKind::Assign { target, value } => {
                walk_expr(value, out);
                match target {
                    LValue::Index { base, index } => {
                        walk_expr(base, out);
                        walk_expr(index, out);
                    }
                    LValue::Field { base, .. } => walk_expr(base, out),
                    LValue::Deref(base) => walk_expr(base, out),
                    LValue::Var(_) => {}
                }
            }
            StmtKind::Return(Some(e)) => walk_expr(e, out),
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                walk_expr(cond, out);
                collect_called_names(then_body, out);
                collect_called_names(else_body, out);
            }
            StmtKind::While { cond, body } => {
                walk_expr(cond, out);
                collect_called_names(body, out);
            }
            StmtKind::For { from, to, body, .. } => {
                walk_expr(from, out);
                walk_expr(to, out);
                collect_called_names(body, out);
            }
            StmtKind::Block(b) | StmtKind::Defer(b) | StmtKind::Comptime(b) => {
                collect_called_names(b, out)
            }
            _ => {}
        }
    }
}

// ============================================================================
// `compiles { … }` probe
// ============================================================================

/// Attempt to type check a block against the program's captured type
/// environment (globals and function signatures). Any type error yields
/// false.
pub fn block_typechecks(program: &Program, block: &[Stmt]) -> bool {
    let mut env: FxHashMap<String, Type> = FxHashMap::default();
    for stmt in &program.globals {
        if let StmtKind::Let { name, ty, init } = &stmt.kind {
            let resolved = if *ty == Type::Inferred {
                init.as_ref()
                    .and_then(|e| infer(e, &env, program))
                    .unwrap_or(Type::Inferred)
            } else {
                ty.clone()
            };
            env.insert(name.clone(), resolved);
        }
    }
    check_block(block, &mut env, program)
}

fn check_block(block: &[Stmt], env: &mut FxHashMap<String, Type>, program: &Program) -> bool {
    for stmt in block {
        if !check_stmt(stmt, env, program) {
            return false;
        }
    }
    true
}

fn check_stmt(stmt: &Stmt, env: &mut FxHashMap<String, Type>, program: &Program) -> bool {
    match &stmt.kind {
        StmtKind::Let { name, ty, init } => {
            let init_ty = match init {
                Some(e) => {
                    let Some(t) = infer(e, env, program) else {
                        return false;
                    };
                    Some(t)
                }
                None => None,
            };
            let declared = if *ty == Type::Inferred {
                init_ty.clone().unwrap_or(Type::Inferred)
            } else {
                if let Some(actual) = &init_ty {
                    if !types_compatible(ty, actual) {
                        return false;
                    }
                }
                ty.clone()
            };
            env.insert(name.clone(), declared);
            true
        }
        StmtKind::Assign { target, value } => {
            let Some(value_ty) = infer(value, env, program) else {
                return false;
            };
            match target {
                LValue::Var(name) => match env.get(name) {
                    Some(t) => types_compatible(t, &value_ty),
                    None => false,
                },
                LValue::Index { base, index } => {
                    let Some(base_ty) = infer(base, env, program) else {
                        return false;
                    };
                    let Some(index_ty) = infer(index, env, program) else {
                        return false;
                    };
                    matches!(base_ty, Type::Array(_)) && types_compatible(&Type::Int, &index_ty)
                }
                LValue::Field { base, .. } => infer(base, env, program).is_some(),
                LValue::Deref(base) => {
                    matches!(infer(base, env, program), Some(Type::Ref(_) | Type::Weak(_)))
                }
            }
        }
        StmtKind::ExprStmt(e) => infer(e, env, program).is_some(),
        StmtKind::If {
            cond,
            then_body,
            else_body,
        } => {
            matches!(infer(cond, env, program), Some(Type::Bool))
                && check_block(then_body, env, program)
                && check_block(else_body, env, program)
        }
        StmtKind::While { cond, body } => {
            matches!(infer(cond, env, program), Some(Type::Bool))
                && check_block(body, env, program)
        }
        StmtKind::For {
            var,
            from,
            to,
            body,
        } => {
            let from_ok = matches!(infer(from, env, program), Some(Type::Int));
            let to_ok = matches!(infer(to, env, program), Some(Type::Int));
            env.insert(var.clone(), Type::Int);
            from_ok && to_ok && check_block(body, env, program)
        }
        StmtKind::Return(Some(e)) => infer(e, env, program).is_some(),
        StmtKind::Return(None) | StmtKind::Break | StmtKind::Continue => true,
        StmtKind::Block(b) | StmtKind::Defer(b) => check_block(b, env, program),
        StmtKind::Comptime(_) => true,
    }
}

fn types_compatible(expected: &Type, actual: &Type) -> bool {
    expected == actual
        || *expected == Type::Inferred
        || *actual == Type::Inferred
        || matches!(
            (expected, actual),
            (Type::Option(_), Type::Inferred) | (Type::Float, Type::Int)
        )
}

fn infer(e: &Expr, env: &FxHashMap<String, Type>, program: &Program) -> Option<Type> {
    match &e.kind {
        ExprKind::Int(_) => Some(Type::Int),
        ExprKind::Float(_) => Some(Type::Float),
        ExprKind::Bool(_) => Some(Type::Bool),
        ExprKind::Char(_) => Some(Type::Char),
        ExprKind::Str(_) => Some(Type::Str),
        ExprKind::Nil | ExprKind::NoneLit => Some(Type::Inferred),
        ExprKind::Var(name) => env.get(name).cloned(),
        ExprKind::ArrayLit(items) => {
            let mut elem = Type::Inferred;
            for item in items {
                let t = infer(item, env, program)?;
                if elem == Type::Inferred {
                    elem = t;
                } else if !types_compatible(&elem, &t) {
                    return None;
                }
            }
            Some(Type::Array(Box::new(elem)))
        }
        ExprKind::Binary { op, lhs, rhs } => {
            let lt = infer(lhs, env, program)?;
            let rt = infer(rhs, env, program)?;
            match op {
                BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                    let numeric = |t: &Type| matches!(t, Type::Int | Type::Float | Type::Inferred);
                    if *op == BinOp::Add && lt == Type::Str && rt == Type::Str {
                        return Some(Type::Str);
                    }
                    if !numeric(&lt) || !numeric(&rt) {
                        return None;
                    }
                    if lt == Type::Float || rt == Type::Float {
                        Some(Type::Float)
                    } else {
                        Some(Type::Int)
                    }
                }
                BinOp::Eq | BinOp::Ne => {
                    if types_compatible(&lt, &rt) || types_compatible(&rt, &lt) {
                        Some(Type::Bool)
                    } else {
                        None
                    }
                }
                BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                    if types_compatible(&lt, &rt) {
                        Some(Type::Bool)
                    } else {
                        None
                    }
                }
                BinOp::And | BinOp::Or => {
                    if lt == Type::Bool && rt == Type::Bool {
                        Some(Type::Bool)
                    } else {
                        None
                    }
                }
            }
        }
        ExprKind::Unary { op, operand } => {
            let t = infer(operand, env, program)?;
            match op {
                crate::ast::UnOp::Not => (t == Type::Bool).then_some(Type::Bool),
                crate::ast::UnOp::Neg => t.is_numeric().then_some(t),
            }
        }
        ExprKind::Call { name, args } => {
            for arg in args {
                infer(arg, env, program)?;
            }
            if let Some(decl) = program.resolve(name) {
                if args.len() > decl.params.len() {
                    return None;
                }
                return Some(decl.ret.clone());
            }
            builtins::lookup(name).map(|_| Type::Inferred)
        }
        ExprKind::Index { base, index } => {
            let base_ty = infer(base, env, program)?;
            let index_ty = infer(index, env, program)?;
            if !types_compatible(&Type::Int, &index_ty) {
                return None;
            }
            match base_ty {
                Type::Array(elem) => Some(*elem),
                Type::Str => Some(Type::Char),
                _ => None,
            }
        }
        ExprKind::NewRef(inner) => {
            Some(Type::Ref(Box::new(infer(inner, env, program)?)))
        }
        ExprKind::Deref(inner) => match infer(inner, env, program)? {
            Type::Ref(t) | Type::Weak(t) => Some(*t),
            _ => None,
        },
        ExprKind::SomeOf(inner) => {
            Some(Type::Option(Box::new(infer(inner, env, program)?)))
        }
        ExprKind::OkOf(inner) | ExprKind::ErrOf(inner) => {
            infer(inner, env, program)?;
            Some(Type::ResultTy(
                Box::new(Type::Inferred),
                Box::new(Type::Inferred),
            ))
        }
        ExprKind::Cast { expr, target } => {
            infer(expr, env, program)?;
            Some(target.clone())
        }
        _ => Some(Type::Inferred),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builder::*;

    #[test]
    fn test_block_typechecks_accepts_sound_code() {
        let program = Program::new();
        let block = vec![
            let_stmt("x", Type::Int, int(1)),
            let_stmt("y", Type::Int, binary(BinOp::Add, var("x"), int(2))),
        ];
        assert!(block_typechecks(&program, &block));
    }

    #[test]
    fn test_block_typechecks_rejects_mismatch() {
        let program = Program::new();
        let block = vec![let_stmt("x", Type::Int, string("nope"))];
        assert!(!block_typechecks(&program, &block));
    }

    #[test]
    fn test_block_typechecks_rejects_unknown_var() {
        let program = Program::new();
        let block = vec![expr_stmt(binary(BinOp::Add, var("ghost"), int(1)))];
        assert!(!block_typechecks(&program, &block));
    }

    #[test]
    fn test_block_typechecks_sees_globals() {
        let mut program = Program::new();
        program.globals.push(let_stmt("n", Type::Int, int(3)));
        let block = vec![expr_stmt(binary(BinOp::Mul, var("n"), int(2)))];
        assert!(block_typechecks(&program, &block));
    }

    #[test]
    fn test_run_comptime_block_injects() {
        let program = Program::new();
        let block = vec![expr_stmt(call(
            "inject",
            vec![string("flag"), string("bool"), boolean(true)],
        ))];
        let injected = run_comptime_block(&program, &block, SourcePos::unknown()).unwrap();
        assert_eq!(injected.len(), 1);
        assert_eq!(injected[0].0, "flag");
        assert_eq!(injected[0].1, "bool");
        assert_eq!(injected[0].2, CValue::Bool(true));
    }
}
