//! Typed expression nodes.

use super::pos::SourcePos;
use super::stmt::Stmt;
use super::types::Type;

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }
}

impl std::fmt::Display for BinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
        };
        write!(f, "{s}")
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

/// A function parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    pub default: Option<Expr>,
}

/// A typed expression: kind, (possibly inferred) type, and source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Type,
    pub pos: SourcePos,
}

impl Expr {
    pub fn new(kind: ExprKind, ty: Type, pos: SourcePos) -> Self {
        Expr { kind, ty, pos }
    }

    /// Whether this expression is a literal constant after folding.
    pub fn is_literal(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Int(_)
                | ExprKind::Float(_)
                | ExprKind::Bool(_)
                | ExprKind::Char(_)
                | ExprKind::Str(_)
                | ExprKind::Nil
                | ExprKind::NoneLit
        )
    }

    /// Whether evaluating this expression can have an observable side effect.
    /// Calls, channel operations, spawn/yield/resume, and anything containing
    /// them are effectful; everything else is pure.
    pub fn is_pure(&self) -> bool {
        match &self.kind {
            ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Bool(_)
            | ExprKind::Char(_)
            | ExprKind::Str(_)
            | ExprKind::Nil
            | ExprKind::NoneLit
            | ExprKind::Var(_)
            | ExprKind::EnumLit { .. } => true,
            ExprKind::ArrayLit(items) | ExprKind::TupleLit(items) => {
                items.iter().all(|e| e.is_pure())
            }
            ExprKind::Binary { lhs, rhs, .. } => lhs.is_pure() && rhs.is_pure(),
            ExprKind::Unary { operand, .. } => operand.is_pure(),
            ExprKind::Index { base, index } => base.is_pure() && index.is_pure(),
            ExprKind::Slice { base, lo, hi } => base.is_pure() && lo.is_pure() && hi.is_pure(),
            ExprKind::Field { base, .. } => base.is_pure(),
            ExprKind::NewRef(e)
            | ExprKind::Deref(e)
            | ExprKind::WeakOf(e)
            | ExprKind::SomeOf(e)
            | ExprKind::OkOf(e)
            | ExprKind::ErrOf(e) => e.is_pure(),
            ExprKind::Cast { expr, .. } => expr.is_pure(),
            ExprKind::ObjectLit { fields, .. } => fields.iter().all(|(_, e)| e.is_pure()),
            ExprKind::Lambda { .. } => true,
            ExprKind::Compiles(_) => true,
            _ => false,
        }
    }
}

/// Expression kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    Bool(bool),
    Char(char),
    Str(String),
    Nil,
    NoneLit,
    ArrayLit(Vec<Expr>),
    TupleLit(Vec<Expr>),
    Var(String),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    /// Call by (unmangled) name; overload resolution happens in the emitter.
    Call {
        name: String,
        args: Vec<Expr>,
    },
    /// Invoke a closure value.
    Invoke {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        base: Box<Expr>,
        lo: Box<Expr>,
        hi: Box<Expr>,
    },
    Field {
        base: Box<Expr>,
        field: String,
    },
    NewRef(Box<Expr>),
    Deref(Box<Expr>),
    WeakOf(Box<Expr>),
    SomeOf(Box<Expr>),
    OkOf(Box<Expr>),
    ErrOf(Box<Expr>),
    Cast {
        expr: Box<Expr>,
        target: Type,
    },
    Lambda {
        params: Vec<Param>,
        body: Vec<Stmt>,
        ret: Type,
    },
    /// `expr?` — early-return propagation of the error arm.
    Propagate(Box<Expr>),
    /// `compiles { … }` probe; resolved to a bool literal on the second fold
    /// pass.
    Compiles(Vec<Stmt>),
    Spawn {
        call: Box<Expr>,
    },
    YieldExpr(Option<Box<Expr>>),
    Resume(Box<Expr>),
    EnumLit {
        enum_name: String,
        variant: String,
    },
    ObjectLit {
        type_name: String,
        fields: Vec<(String, Expr)>,
    },
    MakeChannel {
        elem: Type,
        capacity: Box<Expr>,
    },
    ChanSend {
        chan: Box<Expr>,
        value: Box<Expr>,
    },
    ChanRecv {
        chan: Box<Expr>,
    },
}
