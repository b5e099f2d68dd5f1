//! Unused-variable sweep.
//!
//! A separate final pass that walks function bodies and marks variable
//! references as used, including names captured by lambda bodies. Any
//! remaining initialized-but-never-read variable is reported, unless its
//! type carries destructor semantics.

use crate::ast::{
    Expr, ExprKind, FunctionDecl, LValue, SourcePos, Stmt, StmtKind, Type, UserTypes,
};
use rustc_hash::{FxHashMap, FxHashSet};

/// One finding: variable name and its declaration position.
#[derive(Debug, Clone, PartialEq)]
pub struct UnusedVar {
    pub name: String,
    pub pos: SourcePos,
}

/// Sweep one function body.
pub fn sweep(decl: &FunctionDecl, user_types: &UserTypes) -> Vec<UnusedVar> {
    let mut declared: FxHashMap<String, (SourcePos, Type)> = FxHashMap::default();
    let mut reads: FxHashSet<String> = FxHashSet::default();

    collect_stmts(&decl.body, &mut declared, &mut reads);

    let mut findings: Vec<UnusedVar> = declared
        .into_iter()
        .filter(|(name, _)| !reads.contains(name))
        .filter(|(_, (_, ty))| !user_types.has_destructor(ty))
        .map(|(name, (pos, _))| UnusedVar { name, pos })
        .collect();
    findings.sort_by_key(|f| (f.pos.line, f.pos.col, f.name.clone()));
    findings
}

fn collect_stmts(
    body: &[Stmt],
    declared: &mut FxHashMap<String, (SourcePos, Type)>,
    reads: &mut FxHashSet<String>,
) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Let { name, ty, init } => {
                if let Some(e) = init {
                    collect_expr(e, reads);
                    declared.insert(name.clone(), (stmt.pos, ty.clone()));
                }
                // Uninitialized declarations are the init-tracking pass's
                // concern, not this one's.
            }
            StmtKind::Assign { target, value } => {
                collect_expr(value, reads);
                // A write through x[i], x.f, or *x reads the base binding;
                // a plain `x = e` does not.
                match target {
                    LValue::Var(_) => {}
                    LValue::Index { base, index } => {
                        collect_expr(base, reads);
                        collect_expr(index, reads);
                    }
                    LValue::Field { base, .. } => collect_expr(base, reads),
                    LValue::Deref(base) => collect_expr(base, reads),
                }
            }
            StmtKind::ExprStmt(e) => collect_expr(e, reads),
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                collect_expr(cond, reads);
                collect_stmts(then_body, declared, reads);
                collect_stmts(else_body, declared, reads);
            }
            StmtKind::While { cond, body } => {
                collect_expr(cond, reads);
                collect_stmts(body, declared, reads);
            }
            StmtKind::For {
                from, to, body, ..
            } => {
                collect_expr(from, reads);
                collect_expr(to, reads);
                collect_stmts(body, declared, reads);
            }
            StmtKind::Return(Some(e)) => collect_expr(e, reads),
            StmtKind::Return(None) | StmtKind::Break | StmtKind::Continue => {}
            StmtKind::Block(body) | StmtKind::Defer(body) | StmtKind::Comptime(body) => {
                collect_stmts(body, declared, reads)
            }
        }
    }
}

fn collect_expr(expr: &Expr, reads: &mut FxHashSet<String>) {
    match &expr.kind {
        ExprKind::Var(name) => {
            reads.insert(name.clone());
        }
        ExprKind::Binary { lhs, rhs, .. } => {
            collect_expr(lhs, reads);
            collect_expr(rhs, reads);
        }
        ExprKind::Unary { operand, .. } => collect_expr(operand, reads),
        ExprKind::Call { args, .. } => args.iter().for_each(|a| collect_expr(a, reads)),
        ExprKind::Invoke { callee, args } => {
            collect_expr(callee, reads);
            args.iter().for_each(|a| collect_expr(a, reads));
        }
        ExprKind::Index { base, index } => {
            collect_expr(base, reads);
            collect_expr(index, reads);
        }
        ExprKind::Slice { base, lo, hi } => {
            collect_expr(base, reads);
            collect_expr(lo, reads);
            collect_expr(hi, reads);
        }
        ExprKind::Field { base, .. } => collect_expr(base, reads),
        ExprKind::ArrayLit(items) | ExprKind::TupleLit(items) => {
            items.iter().for_each(|a| collect_expr(a, reads))
        }
        ExprKind::NewRef(e)
        | ExprKind::Deref(e)
        | ExprKind::WeakOf(e)
        | ExprKind::SomeOf(e)
        | ExprKind::OkOf(e)
        | ExprKind::ErrOf(e)
        | ExprKind::Propagate(e) => collect_expr(e, reads),
        ExprKind::Cast { expr, .. } => collect_expr(expr, reads),
        ExprKind::Lambda { body, .. } => {
            // Captured names inside the lambda count as uses of the outer
            // bindings. Lambda-local declarations also land in `reads`'
            // shadow-free namespace, which only ever over-approximates use.
            let mut inner_declared = FxHashMap::default();
            collect_stmts(body, &mut inner_declared, reads);
        }
        ExprKind::Compiles(_) => {}
        ExprKind::Spawn { call } => collect_expr(call, reads),
        ExprKind::YieldExpr(Some(e)) => collect_expr(e, reads),
        ExprKind::YieldExpr(None) => {}
        ExprKind::Resume(e) => collect_expr(e, reads),
        ExprKind::ObjectLit { fields, .. } => {
            fields.iter().for_each(|(_, e)| collect_expr(e, reads))
        }
        ExprKind::MakeChannel { capacity, .. } => collect_expr(capacity, reads),
        ExprKind::ChanSend { chan, value } => {
            collect_expr(chan, reads);
            collect_expr(value, reads);
        }
        ExprKind::ChanRecv { chan } => collect_expr(chan, reads),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builder::*;
    use crate::ast::{ObjectDecl, Type};

    #[test]
    fn test_reports_unused() {
        // fn main() -> void { let x = 5; print(0); }
        let decl = func(
            "main",
            vec![],
            Type::Void,
            vec![
                let_stmt("x", Type::Int, int(5)),
                expr_stmt(call("print", vec![int(0)])),
            ],
        );
        let findings = sweep(&decl, &UserTypes::new());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].name, "x");
    }

    #[test]
    fn test_read_through_index_write_counts() {
        // let xs = [1]; xs[0] = 2;  → xs is used
        let decl = func(
            "main",
            vec![],
            Type::Void,
            vec![
                let_stmt("xs", Type::Array(Box::new(Type::Int)), array(vec![int(1)])),
                Stmt::new(
                    StmtKind::Assign {
                        target: LValue::Index {
                            base: var("xs"),
                            index: int(0),
                        },
                        value: int(2),
                    },
                    SourcePos::unknown(),
                ),
            ],
        );
        assert!(sweep(&decl, &UserTypes::new()).is_empty());
    }

    #[test]
    fn test_plain_reassignment_is_not_a_use() {
        let decl = func(
            "main",
            vec![],
            Type::Void,
            vec![let_stmt("x", Type::Int, int(1)), assign("x", int(2))],
        );
        let findings = sweep(&decl, &UserTypes::new());
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn test_lambda_capture_counts_as_use() {
        use crate::ast::{Expr, ExprKind};
        let lambda = Expr::new(
            ExprKind::Lambda {
                params: vec![],
                body: vec![ret(var("x"))],
                ret: Type::Int,
            },
            Type::Inferred,
            SourcePos::unknown(),
        );
        let decl = func(
            "main",
            vec![],
            Type::Void,
            vec![
                let_stmt("x", Type::Int, int(1)),
                let_stmt("f", Type::Inferred, lambda),
                expr_stmt(call("print", vec![var("f")])),
            ],
        );
        assert!(sweep(&decl, &UserTypes::new()).is_empty());
    }

    #[test]
    fn test_destructor_type_exempt() {
        let mut types = UserTypes::new();
        types.objects.insert(
            "Guard".into(),
            ObjectDecl {
                name: "Guard".into(),
                fields: vec![],
                destructor: Some("release::OGuard:v".into()),
            },
        );
        let decl = func(
            "main",
            vec![],
            Type::Void,
            vec![Stmt::new(
                StmtKind::Let {
                    name: "g".into(),
                    ty: Type::Object("Guard".into()),
                    init: Some(call("acquire", vec![])),
                },
                SourcePos::unknown(),
            )],
        );
        assert!(sweep(&decl, &types).is_empty());
    }
}
