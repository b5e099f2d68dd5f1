//! Statement nodes.

use super::expr::Expr;
use super::pos::SourcePos;
use super::types::Type;

/// A statement with its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub pos: SourcePos,
}

impl Stmt {
    pub fn new(kind: StmtKind, pos: SourcePos) -> Self {
        Stmt { kind, pos }
    }
}

/// Assignment targets.
#[derive(Debug, Clone, PartialEq)]
pub enum LValue {
    Var(String),
    Index { base: Expr, index: Expr },
    Field { base: Expr, field: String },
    Deref(Expr),
}

impl LValue {
    /// The root variable this l-value writes through, if any. Used by the
    /// prover to invalidate tracked-expression nil knowledge.
    pub fn base_var(&self) -> Option<&str> {
        fn expr_base(e: &Expr) -> Option<&str> {
            use crate::ast::expr::ExprKind;
            match &e.kind {
                ExprKind::Var(name) => Some(name),
                ExprKind::Index { base, .. } | ExprKind::Field { base, .. } => expr_base(base),
                ExprKind::Deref(inner) => expr_base(inner),
                _ => None,
            }
        }
        match self {
            LValue::Var(name) => Some(name),
            LValue::Index { base, .. } | LValue::Field { base, .. } => expr_base(base),
            LValue::Deref(inner) => expr_base(inner),
        }
    }
}

/// Statement kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Let {
        name: String,
        ty: Type,
        init: Option<Expr>,
    },
    Assign {
        target: LValue,
        value: Expr,
    },
    ExprStmt(Expr),
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    /// `for var in from..to { body }` — half-open integer range.
    For {
        var: String,
        from: Expr,
        to: Expr,
        body: Vec<Stmt>,
    },
    Return(Option<Expr>),
    Block(Vec<Stmt>),
    /// Deferred block, run in reverse declaration order on every exit path.
    Defer(Vec<Stmt>),
    Break,
    Continue,
    /// `comptime { … }` — executed at compile time by the folder.
    Comptime(Vec<Stmt>),
}
