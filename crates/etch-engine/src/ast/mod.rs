//! Typed AST: the in-memory program produced by the external frontend and
//! consumed by the folder, prover, and bytecode emitter.

pub mod builder;
mod expr;
mod pos;
mod stmt;
mod types;

pub use expr::{BinOp, Expr, ExprKind, Param, UnOp};
pub use pos::{SourcePos, ORIGIN_NONE};
pub use stmt::{LValue, Stmt, StmtKind};
pub use types::{mangle, parse_type_str, unmangle_name, EnumDecl, ObjectDecl, Type, UserTypes};

use rustc_hash::FxHashMap;

/// Function behavior flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionFlags {
    pub exported: bool,
    /// Dispatched to a host callback registered through the embedding ABI
    pub host: bool,
    /// Dispatched through the CFFI thunk table
    pub cffi: bool,
    pub is_async: bool,
    /// Provided by the VM builtin registry
    pub builtin: bool,
}

/// A function declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub type_params: Vec<String>,
    pub params: Vec<Param>,
    pub ret: Type,
    pub body: Vec<Stmt>,
    pub flags: FunctionFlags,
    /// Set when the body contains the `?` operator anywhere
    pub uses_result_propagation: bool,
    /// Position of the first `?`, for error attribution
    pub first_propagation_pos: Option<SourcePos>,
    /// Library spec for `extern` (cffi) declarations
    pub extern_library: Option<String>,
    pub pos: SourcePos,
}

impl FunctionDecl {
    /// The mangled key for this declaration.
    pub fn key(&self) -> String {
        mangle(
            &self.name,
            &self.params.iter().map(|p| p.ty.clone()).collect::<Vec<_>>(),
            &self.ret,
        )
    }
}

/// A whole compiled-from-source program: functions by mangled key, overload
/// sets by plain name, global initializer statements, the user-type table,
/// and the compile-determined source hash.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub functions: FxHashMap<String, FunctionDecl>,
    pub overloads: FxHashMap<String, Vec<String>>,
    pub globals: Vec<Stmt>,
    pub user_types: UserTypes,
    pub source_hash: u64,
    /// File table referenced by `SourcePos::file`
    pub source_files: Vec<String>,
    /// Original-function table referenced by `SourcePos::origin`
    pub origin_names: Vec<String>,
}

impl Program {
    pub fn new() -> Self {
        Program {
            source_files: vec!["<input>".to_string()],
            ..Default::default()
        }
    }

    /// Register a function, maintaining the overload index.
    pub fn add_function(&mut self, decl: FunctionDecl) -> String {
        let key = decl.key();
        self.overloads
            .entry(decl.name.clone())
            .or_default()
            .push(key.clone());
        self.functions.insert(key.clone(), decl);
        key
    }

    /// Look up by mangled key, or by plain name when the overload set is a
    /// singleton.
    pub fn resolve(&self, name: &str) -> Option<&FunctionDecl> {
        if let Some(decl) = self.functions.get(name) {
            return Some(decl);
        }
        match self.overloads.get(name) {
            Some(keys) if keys.len() == 1 => self.functions.get(&keys[0]),
            _ => None,
        }
    }

    /// Intern an origin name (for inliner position rewriting).
    pub fn intern_origin(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.origin_names.iter().position(|n| n == name) {
            return idx as u32;
        }
        self.origin_names.push(name.to_string());
        (self.origin_names.len() - 1) as u32
    }

    /// Resolve an origin index back to a name.
    pub fn origin_name(&self, idx: u32) -> Option<&str> {
        if idx == ORIGIN_NONE {
            return None;
        }
        self.origin_names.get(idx as usize).map(|s| s.as_str())
    }

    pub fn file_name(&self, idx: u32) -> &str {
        self.source_files
            .get(idx as usize)
            .map(|s| s.as_str())
            .unwrap_or("<unknown>")
    }
}

#[cfg(test)]
mod tests {
    use super::builder::*;
    use super::*;

    #[test]
    fn test_overload_resolution() {
        let mut program = Program::new();
        program.add_function(func("abs", vec![param("x", Type::Int)], Type::Int, vec![]));
        assert!(program.resolve("abs").is_some());
        assert!(program.resolve("abs::i:i").is_some());

        program.add_function(func(
            "abs",
            vec![param("x", Type::Float)],
            Type::Float,
            vec![],
        ));
        // Ambiguous by plain name now, still reachable by key.
        assert!(program.resolve("abs").is_none());
        assert!(program.resolve("abs::f:f").is_some());
    }

    #[test]
    fn test_origin_interning() {
        let mut program = Program::new();
        let a = program.intern_origin("helper");
        let b = program.intern_origin("helper");
        assert_eq!(a, b);
        assert_eq!(program.origin_name(a), Some("helper"));
        assert_eq!(program.origin_name(ORIGIN_NONE), None);
    }
}
