//! Symbolic execution of pure functions over literal arguments.
//!
//! A call whose callee is pure and whose arguments are all literal constants
//! is run through this small interpreter. If it terminates inside the
//! operation budget without reaching an unknown value, the concrete result
//! refines the call's abstract value at the call site.

use crate::ast::{BinOp, Expr, ExprKind, FunctionDecl, Program, Stmt, StmtKind, UnOp};
use rustc_hash::FxHashMap;

/// Operation budget shared across the whole (possibly recursive) execution.
pub const MAX_LOOP_ITERATIONS: u64 = 1_000_000;

/// A concrete value inside the symbolic interpreter.
#[derive(Debug, Clone, PartialEq)]
pub enum SymValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Char(char),
    Str(String),
    Array(Vec<SymValue>),
    Nil,
}

impl SymValue {
    fn truthy(&self) -> Option<bool> {
        match self {
            SymValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

enum Flow {
    Normal,
    Return(SymValue),
    Break,
    Continue,
}

/// Execute `decl` with concrete arguments. Returns `None` on budget
/// exhaustion, unsupported operations, or any would-be runtime failure —
/// the caller falls back to interval analysis.
pub fn execute(program: &Program, decl: &FunctionDecl, args: &[SymValue]) -> Option<SymValue> {
    let mut budget = MAX_LOOP_ITERATIONS;
    call(program, decl, args, &mut budget)
}

fn call(
    program: &Program,
    decl: &FunctionDecl,
    args: &[SymValue],
    budget: &mut u64,
) -> Option<SymValue> {
    if args.len() != decl.params.len() {
        return None;
    }
    let mut locals: FxHashMap<String, SymValue> = FxHashMap::default();
    for (param, arg) in decl.params.iter().zip(args.iter()) {
        locals.insert(param.name.clone(), arg.clone());
    }
    match exec_block(program, &decl.body, &mut locals, budget)? {
        Flow::Return(v) => Some(v),
        Flow::Normal => Some(SymValue::Nil),
        _ => None,
    }
}

fn exec_block(
    program: &Program,
    body: &[Stmt],
    locals: &mut FxHashMap<String, SymValue>,
    budget: &mut u64,
) -> Option<Flow> {
    for stmt in body {
        *budget = budget.checked_sub(1)?;
        match exec_stmt(program, stmt, locals, budget)? {
            Flow::Normal => {}
            flow => return Some(flow),
        }
    }
    Some(Flow::Normal)
}

fn exec_stmt(
    program: &Program,
    stmt: &Stmt,
    locals: &mut FxHashMap<String, SymValue>,
    budget: &mut u64,
) -> Option<Flow> {
    match &stmt.kind {
        StmtKind::Let { name, init, .. } => {
            let value = match init {
                Some(e) => eval(program, e, locals, budget)?,
                None => SymValue::Nil,
            };
            locals.insert(name.clone(), value);
            Some(Flow::Normal)
        }
        StmtKind::Assign { target, value } => {
            use crate::ast::LValue;
            let v = eval(program, value, locals, budget)?;
            match target {
                LValue::Var(name) => {
                    locals.insert(name.clone(), v);
                    Some(Flow::Normal)
                }
                LValue::Index { base, index } => {
                    let idx = match eval(program, index, locals, budget)? {
                        SymValue::Int(i) => i,
                        _ => return None,
                    };
                    let ExprKind::Var(name) = &base.kind else {
                        return None;
                    };
                    match locals.get_mut(name) {
                        Some(SymValue::Array(items)) => {
                            let slot = items.get_mut(usize::try_from(idx).ok()?)?;
                            *slot = v;
                            Some(Flow::Normal)
                        }
                        _ => None,
                    }
                }
                _ => None,
            }
        }
        StmtKind::ExprStmt(e) => {
            eval(program, e, locals, budget)?;
            Some(Flow::Normal)
        }
        StmtKind::If {
            cond,
            then_body,
            else_body,
        } => {
            let c = eval(program, cond, locals, budget)?.truthy()?;
            if c {
                exec_block(program, then_body, locals, budget)
            } else {
                exec_block(program, else_body, locals, budget)
            }
        }
        StmtKind::While { cond, body } => {
            loop {
                *budget = budget.checked_sub(1)?;
                let c = eval(program, cond, locals, budget)?.truthy()?;
                if !c {
                    break;
                }
                match exec_block(program, body, locals, budget)? {
                    Flow::Break => break,
                    Flow::Return(v) => return Some(Flow::Return(v)),
                    _ => {}
                }
            }
            Some(Flow::Normal)
        }
        StmtKind::For {
            var,
            from,
            to,
            body,
        } => {
            let lo = match eval(program, from, locals, budget)? {
                SymValue::Int(i) => i,
                _ => return None,
            };
            let hi = match eval(program, to, locals, budget)? {
                SymValue::Int(i) => i,
                _ => return None,
            };
            let mut i = lo;
            while i < hi {
                *budget = budget.checked_sub(1)?;
                locals.insert(var.clone(), SymValue::Int(i));
                match exec_block(program, body, locals, budget)? {
                    Flow::Break => break,
                    Flow::Return(v) => return Some(Flow::Return(v)),
                    _ => {}
                }
                i = i.checked_add(1)?;
            }
            Some(Flow::Normal)
        }
        StmtKind::Return(expr) => {
            let v = match expr {
                Some(e) => eval(program, e, locals, budget)?,
                None => SymValue::Nil,
            };
            Some(Flow::Return(v))
        }
        StmtKind::Block(body) => exec_block(program, body, locals, budget),
        StmtKind::Break => Some(Flow::Break),
        StmtKind::Continue => Some(Flow::Continue),
        // Defer and comptime have no place in a pure function's symbolic run.
        _ => None,
    }
}

fn eval(
    program: &Program,
    expr: &Expr,
    locals: &mut FxHashMap<String, SymValue>,
    budget: &mut u64,
) -> Option<SymValue> {
    *budget = budget.checked_sub(1)?;
    match &expr.kind {
        ExprKind::Int(v) => Some(SymValue::Int(*v)),
        ExprKind::Float(v) => Some(SymValue::Float(*v)),
        ExprKind::Bool(v) => Some(SymValue::Bool(*v)),
        ExprKind::Char(v) => Some(SymValue::Char(*v)),
        ExprKind::Str(v) => Some(SymValue::Str(v.clone())),
        ExprKind::Nil => Some(SymValue::Nil),
        ExprKind::Var(name) => locals.get(name).cloned(),
        ExprKind::ArrayLit(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(program, item, locals, budget)?);
            }
            Some(SymValue::Array(out))
        }
        ExprKind::Unary { op, operand } => {
            let v = eval(program, operand, locals, budget)?;
            match (op, v) {
                (UnOp::Neg, SymValue::Int(i)) => i.checked_neg().map(SymValue::Int),
                (UnOp::Neg, SymValue::Float(f)) => Some(SymValue::Float(-f)),
                (UnOp::Not, SymValue::Bool(b)) => Some(SymValue::Bool(!b)),
                _ => None,
            }
        }
        ExprKind::Binary { op, lhs, rhs } => {
            // Short-circuit forms first.
            if *op == BinOp::And || *op == BinOp::Or {
                let l = eval(program, lhs, locals, budget)?.truthy()?;
                return if (*op == BinOp::And && !l) || (*op == BinOp::Or && l) {
                    Some(SymValue::Bool(l))
                } else {
                    let r = eval(program, rhs, locals, budget)?.truthy()?;
                    Some(SymValue::Bool(r))
                };
            }
            let l = eval(program, lhs, locals, budget)?;
            let r = eval(program, rhs, locals, budget)?;
            eval_binop(*op, l, r)
        }
        ExprKind::Index { base, index } => {
            let b = eval(program, base, locals, budget)?;
            let i = match eval(program, index, locals, budget)? {
                SymValue::Int(i) => usize::try_from(i).ok()?,
                _ => return None,
            };
            match b {
                SymValue::Array(items) => items.get(i).cloned(),
                SymValue::Str(s) => s.chars().nth(i).map(SymValue::Char),
                _ => None,
            }
        }
        ExprKind::Call { name, args } => {
            // Only a handful of pure builtins participate.
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(program, arg, locals, budget)?);
            }
            match name.as_str() {
                "len" => match values.as_slice() {
                    [SymValue::Array(items)] => Some(SymValue::Int(items.len() as i64)),
                    [SymValue::Str(s)] => Some(SymValue::Int(s.chars().count() as i64)),
                    _ => None,
                },
                "abs" => match values.as_slice() {
                    [SymValue::Int(i)] => i.checked_abs().map(SymValue::Int),
                    _ => None,
                },
                "min" => match values.as_slice() {
                    [SymValue::Int(a), SymValue::Int(b)] => Some(SymValue::Int(*a.min(b))),
                    _ => None,
                },
                "max" => match values.as_slice() {
                    [SymValue::Int(a), SymValue::Int(b)] => Some(SymValue::Int(*a.max(b))),
                    _ => None,
                },
                _ => {
                    let decl = program.resolve(name)?;
                    if decl.flags.host || decl.flags.cffi || decl.flags.builtin {
                        return None;
                    }
                    call(program, decl, &values, budget)
                }
            }
        }
        _ => None,
    }
}

fn eval_binop(op: BinOp, l: SymValue, r: SymValue) -> Option<SymValue> {
    use SymValue::*;
    Some(match (op, l, r) {
        (BinOp::Add, Int(a), Int(b)) => Int(a.checked_add(b)?),
        (BinOp::Sub, Int(a), Int(b)) => Int(a.checked_sub(b)?),
        (BinOp::Mul, Int(a), Int(b)) => Int(a.checked_mul(b)?),
        (BinOp::Div, Int(a), Int(b)) => {
            if b == 0 {
                return None;
            }
            Int(a.checked_div(b)?)
        }
        (BinOp::Mod, Int(a), Int(b)) => {
            if b == 0 {
                return None;
            }
            Int(a.checked_rem(b)?)
        }
        (BinOp::Add, Float(a), Float(b)) => Float(a + b),
        (BinOp::Sub, Float(a), Float(b)) => Float(a - b),
        (BinOp::Mul, Float(a), Float(b)) => Float(a * b),
        (BinOp::Div, Float(a), Float(b)) => Float(a / b),
        (BinOp::Add, Str(a), Str(b)) => Str(a + &b),
        (BinOp::Eq, a, b) => Bool(a == b),
        (BinOp::Ne, a, b) => Bool(a != b),
        (BinOp::Lt, Int(a), Int(b)) => Bool(a < b),
        (BinOp::Le, Int(a), Int(b)) => Bool(a <= b),
        (BinOp::Gt, Int(a), Int(b)) => Bool(a > b),
        (BinOp::Ge, Int(a), Int(b)) => Bool(a >= b),
        (BinOp::Lt, Float(a), Float(b)) => Bool(a < b),
        (BinOp::Le, Float(a), Float(b)) => Bool(a <= b),
        (BinOp::Gt, Float(a), Float(b)) => Bool(a > b),
        (BinOp::Ge, Float(a), Float(b)) => Bool(a >= b),
        (BinOp::Lt, Str(a), Str(b)) => Bool(a < b),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builder::*;
    use crate::ast::{Program, Type};

    #[test]
    fn test_factorial_executes() {
        // fn fact(n: int) -> int { let acc = 1; for i in 1..n+1 { acc = acc * i; } return acc; }
        let mut program = Program::new();
        program.add_function(func(
            "fact",
            vec![param("n", Type::Int)],
            Type::Int,
            vec![
                let_stmt("acc", Type::Int, int(1)),
                for_stmt(
                    "i",
                    int(1),
                    binary(BinOp::Add, var("n"), int(1)),
                    vec![assign("acc", binary(BinOp::Mul, var("acc"), var("i")))],
                ),
                ret(var("acc")),
            ],
        ));
        let decl = program.resolve("fact").unwrap();
        let result = execute(&program, decl, &[SymValue::Int(5)]);
        assert_eq!(result, Some(SymValue::Int(120)));
    }

    #[test]
    fn test_budget_stops_infinite_loop() {
        // fn spin() -> int { while true { } return 0; }
        let mut program = Program::new();
        program.add_function(func(
            "spin",
            vec![],
            Type::Int,
            vec![while_stmt(boolean(true), vec![]), ret(int(0))],
        ));
        let decl = program.resolve("spin").unwrap();
        assert_eq!(execute(&program, decl, &[]), None);
    }

    #[test]
    fn test_overflow_bails_out() {
        // fn bad() -> int { return 9223372036854775807 + 1; } — unfoldable, unrunnable
        let mut program = Program::new();
        program.add_function(func(
            "bad",
            vec![],
            Type::Int,
            vec![ret(binary(BinOp::Add, int(i64::MAX), int(1)))],
        ));
        let decl = program.resolve("bad").unwrap();
        assert_eq!(execute(&program, decl, &[]), None);
    }

    #[test]
    fn test_division_by_zero_bails_out() {
        let mut program = Program::new();
        program.add_function(func(
            "bad",
            vec![],
            Type::Int,
            vec![ret(binary(BinOp::Div, int(1), int(0)))],
        ));
        let decl = program.resolve("bad").unwrap();
        assert_eq!(execute(&program, decl, &[]), None);
    }
}
