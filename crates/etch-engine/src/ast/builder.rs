//! Construction helpers for typed ASTs.
//!
//! The frontend is an external collaborator, so programs inside this
//! repository (tests, the comptime sandbox, injected globals) are assembled
//! through these helpers.

use super::{
    BinOp, Expr, ExprKind, FunctionDecl, FunctionFlags, LValue, Param, SourcePos, Stmt, StmtKind,
    Type, UnOp,
};

pub fn int(v: i64) -> Expr {
    Expr::new(ExprKind::Int(v), Type::Int, SourcePos::unknown())
}

pub fn float(v: f64) -> Expr {
    Expr::new(ExprKind::Float(v), Type::Float, SourcePos::unknown())
}

pub fn boolean(v: bool) -> Expr {
    Expr::new(ExprKind::Bool(v), Type::Bool, SourcePos::unknown())
}

pub fn string(v: &str) -> Expr {
    Expr::new(ExprKind::Str(v.to_string()), Type::Str, SourcePos::unknown())
}

pub fn nil() -> Expr {
    Expr::new(ExprKind::Nil, Type::Inferred, SourcePos::unknown())
}

pub fn var(name: &str) -> Expr {
    Expr::new(
        ExprKind::Var(name.to_string()),
        Type::Inferred,
        SourcePos::unknown(),
    )
}

pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    let pos = lhs.pos;
    Expr::new(
        ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        Type::Inferred,
        pos,
    )
}

pub fn unary(op: UnOp, operand: Expr) -> Expr {
    let pos = operand.pos;
    Expr::new(
        ExprKind::Unary {
            op,
            operand: Box::new(operand),
        },
        Type::Inferred,
        pos,
    )
}

pub fn call(name: &str, args: Vec<Expr>) -> Expr {
    Expr::new(
        ExprKind::Call {
            name: name.to_string(),
            args,
        },
        Type::Inferred,
        SourcePos::unknown(),
    )
}

pub fn index(base: Expr, idx: Expr) -> Expr {
    let pos = base.pos;
    Expr::new(
        ExprKind::Index {
            base: Box::new(base),
            index: Box::new(idx),
        },
        Type::Inferred,
        pos,
    )
}

pub fn array(items: Vec<Expr>) -> Expr {
    Expr::new(ExprKind::ArrayLit(items), Type::Inferred, SourcePos::unknown())
}

pub fn new_ref(inner: Expr) -> Expr {
    let pos = inner.pos;
    Expr::new(ExprKind::NewRef(Box::new(inner)), Type::Inferred, pos)
}

pub fn deref(inner: Expr) -> Expr {
    let pos = inner.pos;
    Expr::new(ExprKind::Deref(Box::new(inner)), Type::Inferred, pos)
}

pub fn propagate(inner: Expr) -> Expr {
    let pos = inner.pos;
    Expr::new(ExprKind::Propagate(Box::new(inner)), Type::Inferred, pos)
}

pub fn ok_of(inner: Expr) -> Expr {
    let pos = inner.pos;
    Expr::new(ExprKind::OkOf(Box::new(inner)), Type::Inferred, pos)
}

pub fn err_of(inner: Expr) -> Expr {
    let pos = inner.pos;
    Expr::new(ExprKind::ErrOf(Box::new(inner)), Type::Inferred, pos)
}

pub fn some_of(inner: Expr) -> Expr {
    let pos = inner.pos;
    Expr::new(ExprKind::SomeOf(Box::new(inner)), Type::Inferred, pos)
}

pub fn at(mut e: Expr, line: u32, col: u32) -> Expr {
    e.pos = SourcePos::new(line, col);
    e
}

pub fn let_stmt(name: &str, ty: Type, init: Expr) -> Stmt {
    Stmt::new(
        StmtKind::Let {
            name: name.to_string(),
            ty,
            init: Some(init),
        },
        SourcePos::unknown(),
    )
}

pub fn let_uninit(name: &str, ty: Type) -> Stmt {
    Stmt::new(
        StmtKind::Let {
            name: name.to_string(),
            ty,
            init: None,
        },
        SourcePos::unknown(),
    )
}

pub fn assign(name: &str, value: Expr) -> Stmt {
    Stmt::new(
        StmtKind::Assign {
            target: LValue::Var(name.to_string()),
            value,
        },
        SourcePos::unknown(),
    )
}

pub fn expr_stmt(e: Expr) -> Stmt {
    let pos = e.pos;
    Stmt::new(StmtKind::ExprStmt(e), pos)
}

pub fn ret(e: Expr) -> Stmt {
    let pos = e.pos;
    Stmt::new(StmtKind::Return(Some(e)), pos)
}

pub fn ret_void() -> Stmt {
    Stmt::new(StmtKind::Return(None), SourcePos::unknown())
}

pub fn if_stmt(cond: Expr, then_body: Vec<Stmt>, else_body: Vec<Stmt>) -> Stmt {
    let pos = cond.pos;
    Stmt::new(
        StmtKind::If {
            cond,
            then_body,
            else_body,
        },
        pos,
    )
}

pub fn while_stmt(cond: Expr, body: Vec<Stmt>) -> Stmt {
    let pos = cond.pos;
    Stmt::new(StmtKind::While { cond, body }, pos)
}

pub fn for_stmt(var_name: &str, from: Expr, to: Expr, body: Vec<Stmt>) -> Stmt {
    let pos = from.pos;
    Stmt::new(
        StmtKind::For {
            var: var_name.to_string(),
            from,
            to,
            body,
        },
        pos,
    )
}

pub fn stmt_at(mut s: Stmt, line: u32, col: u32) -> Stmt {
    s.pos = SourcePos::new(line, col);
    s
}

pub fn param(name: &str, ty: Type) -> Param {
    Param {
        name: name.to_string(),
        ty,
        default: None,
    }
}

/// A plain function declaration with propagation flags derived from the body.
pub fn func(name: &str, params: Vec<Param>, ret_ty: Type, body: Vec<Stmt>) -> FunctionDecl {
    let mut first_prop = None;
    scan_propagation(&body, &mut first_prop);
    FunctionDecl {
        name: name.to_string(),
        type_params: Vec::new(),
        params,
        ret: ret_ty,
        body,
        flags: FunctionFlags::default(),
        uses_result_propagation: first_prop.is_some(),
        first_propagation_pos: first_prop,
        extern_library: None,
        pos: SourcePos::unknown(),
    }
}

fn scan_propagation(body: &[Stmt], first: &mut Option<SourcePos>) {
    fn scan_expr(e: &Expr, first: &mut Option<SourcePos>) {
        if first.is_some() {
            return;
        }
        match &e.kind {
            ExprKind::Propagate(inner) => {
                *first = Some(e.pos);
                scan_expr(inner, first);
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                scan_expr(lhs, first);
                scan_expr(rhs, first);
            }
            ExprKind::Unary { operand, .. } => scan_expr(operand, first),
            ExprKind::Call { args, .. } => args.iter().for_each(|a| scan_expr(a, first)),
            ExprKind::Invoke { callee, args } => {
                scan_expr(callee, first);
                args.iter().for_each(|a| scan_expr(a, first));
            }
            ExprKind::Index { base, index } => {
                scan_expr(base, first);
                scan_expr(index, first);
            }
            ExprKind::ArrayLit(items) | ExprKind::TupleLit(items) => {
                items.iter().for_each(|a| scan_expr(a, first))
            }
            ExprKind::NewRef(x)
            | ExprKind::Deref(x)
            | ExprKind::WeakOf(x)
            | ExprKind::SomeOf(x)
            | ExprKind::OkOf(x)
            | ExprKind::ErrOf(x) => scan_expr(x, first),
            ExprKind::Cast { expr, .. } => scan_expr(expr, first),
            _ => {}
        }
    }
    fn scan_stmt(s: &Stmt, first: &mut Option<SourcePos>) {
        if first.is_some() {
            return;
        }
        match &s.kind {
            StmtKind::Let { init: Some(e), .. } | StmtKind::ExprStmt(e) => scan_expr(e, first),
            StmtKind::Assign { value, .. } => scan_expr(value, first),
            StmtKind::Return(Some(e)) => scan_expr(e, first),
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                scan_expr(cond, first);
                then_body.iter().for_each(|s| scan_stmt(s, first));
                else_body.iter().for_each(|s| scan_stmt(s, first));
            }
            StmtKind::While { cond, body } => {
                scan_expr(cond, first);
                body.iter().for_each(|s| scan_stmt(s, first));
            }
            StmtKind::For { from, to, body, .. } => {
                scan_expr(from, first);
                scan_expr(to, first);
                body.iter().for_each(|s| scan_stmt(s, first));
            }
            StmtKind::Block(body) | StmtKind::Defer(body) | StmtKind::Comptime(body) => {
                body.iter().for_each(|s| scan_stmt(s, first))
            }
            _ => {}
        }
    }
    body.iter().for_each(|s| scan_stmt(s, first));
}
