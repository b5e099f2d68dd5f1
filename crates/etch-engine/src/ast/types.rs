//! The Etch type language and name mangling.
//!
//! Types are owned enums. Mangled function keys have the shape
//! `name::paramCodes:returnCode`; the separators `::` and `:` can never occur
//! inside an identifier, so keys parse unambiguously.

use rustc_hash::{FxHashMap, FxHashSet};

/// A type in the Etch surface language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Void,
    Bool,
    Char,
    Int,
    Float,
    Str,
    Array(Box<Type>),
    Ref(Box<Type>),
    Weak(Box<Type>),
    Option(Box<Type>),
    ResultTy(Box<Type>, Box<Type>),
    Tuple(Vec<Type>),
    Union(Vec<Type>),
    Enum(String),
    Object(String),
    Coroutine(Box<Type>),
    Channel(Box<Type>),
    /// A user-declared alias not yet resolved against the type table
    Named(String),
    /// Not yet inferred
    Inferred,
    /// A function type parameter
    Generic(String),
}

impl Type {
    /// Single-character or prefixed code used in mangled keys and in the
    /// cache's type-code fields.
    pub fn code(&self) -> String {
        match self {
            Type::Void => "v".into(),
            Type::Bool => "b".into(),
            Type::Char => "c".into(),
            Type::Int => "i".into(),
            Type::Float => "f".into(),
            Type::Str => "s".into(),
            Type::Array(t) => format!("a{}", t.code()),
            Type::Ref(t) => format!("r{}", t.code()),
            Type::Weak(t) => format!("w{}", t.code()),
            Type::Option(t) => format!("o{}", t.code()),
            Type::ResultTy(t, e) => format!("q{}{}", t.code(), e.code()),
            Type::Tuple(ts) => {
                let mut s = String::from("t");
                s.push_str(&ts.len().to_string());
                for t in ts {
                    s.push_str(&t.code());
                }
                s
            }
            Type::Union(ts) => {
                let mut s = String::from("u");
                s.push_str(&ts.len().to_string());
                for t in ts {
                    s.push_str(&t.code());
                }
                s
            }
            Type::Enum(name) => format!("E{name}"),
            Type::Object(name) => format!("O{name}"),
            Type::Coroutine(t) => format!("k{}", t.code()),
            Type::Channel(t) => format!("h{}", t.code()),
            Type::Named(name) => format!("N{name}"),
            Type::Inferred => "?".into(),
            Type::Generic(name) => format!("g{name}"),
        }
    }

    /// Whether two types are the same after resolving `Inferred` loosely.
    pub fn matches(&self, other: &Type) -> bool {
        self == other || matches!(self, Type::Inferred) || matches!(other, Type::Inferred)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::Float)
    }

    pub fn is_nilable(&self) -> bool {
        matches!(
            self,
            Type::Ref(_) | Type::Weak(_) | Type::Option(_) | Type::Inferred
        )
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Bool => write!(f, "bool"),
            Type::Char => write!(f, "char"),
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::Str => write!(f, "string"),
            Type::Array(t) => write!(f, "array[{t}]"),
            Type::Ref(t) => write!(f, "ref[{t}]"),
            Type::Weak(t) => write!(f, "weak[{t}]"),
            Type::Option(t) => write!(f, "option[{t}]"),
            Type::ResultTy(t, e) => write!(f, "result[{t},{e}]"),
            Type::Tuple(ts) => {
                write!(f, "tuple[")?;
                for (i, t) in ts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, "]")
            }
            Type::Union(ts) => {
                write!(f, "union[")?;
                for (i, t) in ts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, "]")
            }
            Type::Enum(name) => write!(f, "{name}"),
            Type::Object(name) => write!(f, "{name}"),
            Type::Coroutine(t) => write!(f, "coroutine[{t}]"),
            Type::Channel(t) => write!(f, "channel[{t}]"),
            Type::Named(name) => write!(f, "{name}"),
            Type::Inferred => write!(f, "_"),
            Type::Generic(name) => write!(f, "{name}"),
        }
    }
}

/// Parse a type from the literal strings accepted by `inject` and the cache
/// format. Only the spellings that can appear there are supported.
pub fn parse_type_str(s: &str) -> Option<Type> {
    let s = s.trim();
    Some(match s {
        "void" => Type::Void,
        "bool" => Type::Bool,
        "char" => Type::Char,
        "int" => Type::Int,
        "float" => Type::Float,
        "string" => Type::Str,
        _ => {
            if let Some(inner) = s.strip_prefix("array[").and_then(|r| r.strip_suffix(']')) {
                Type::Array(Box::new(parse_type_str(inner)?))
            } else if let Some(inner) = s.strip_prefix("ref[").and_then(|r| r.strip_suffix(']')) {
                Type::Ref(Box::new(parse_type_str(inner)?))
            } else if let Some(inner) = s.strip_prefix("option[").and_then(|r| r.strip_suffix(']'))
            {
                Type::Option(Box::new(parse_type_str(inner)?))
            } else {
                return None;
            }
        }
    })
}

/// A user-declared object type: named fields plus an optional destructor
/// function (mangled key), which exempts holders from unused-variable
/// diagnostics and is invoked on finalization.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDecl {
    pub name: String,
    pub fields: Vec<(String, Type)>,
    pub destructor: Option<String>,
}

/// A user-declared enum type.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumDecl {
    pub name: String,
    pub variants: Vec<String>,
}

/// The per-program user-type table.
#[derive(Debug, Clone, Default)]
pub struct UserTypes {
    pub objects: FxHashMap<String, ObjectDecl>,
    pub enums: FxHashMap<String, EnumDecl>,
}

impl UserTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, name: &str) -> Option<&ObjectDecl> {
        self.objects.get(name)
    }

    /// Whether values of `ty` carry destructor semantics, directly or through
    /// any transitively contained field. Recursive object graphs terminate
    /// through the visited set.
    pub fn has_destructor(&self, ty: &Type) -> bool {
        let mut visited = FxHashSet::default();
        self.has_destructor_inner(ty, &mut visited)
    }

    fn has_destructor_inner<'a>(&'a self, ty: &'a Type, visited: &mut FxHashSet<&'a str>) -> bool {
        match ty {
            Type::Object(name) | Type::Named(name) => {
                if !visited.insert(name.as_str()) {
                    return false;
                }
                match self.objects.get(name) {
                    Some(decl) => {
                        decl.destructor.is_some()
                            || decl
                                .fields
                                .iter()
                                .any(|(_, fty)| self.has_destructor_inner(fty, visited))
                    }
                    None => false,
                }
            }
            Type::Array(t)
            | Type::Ref(t)
            | Type::Weak(t)
            | Type::Option(t)
            | Type::Coroutine(t)
            | Type::Channel(t) => self.has_destructor_inner(t, visited),
            Type::ResultTy(t, e) => {
                self.has_destructor_inner(t, visited) || self.has_destructor_inner(e, visited)
            }
            Type::Tuple(ts) | Type::Union(ts) => {
                ts.iter().any(|t| self.has_destructor_inner(t, visited))
            }
            _ => false,
        }
    }
}

/// Build a mangled function key: `name::paramCodes:returnCode`.
pub fn mangle(name: &str, params: &[Type], ret: &Type) -> String {
    let mut key = String::with_capacity(name.len() + 8);
    key.push_str(name);
    key.push_str("::");
    for p in params {
        key.push_str(&p.code());
    }
    key.push(':');
    key.push_str(&ret.code());
    key
}

/// Recover the unmangled name from a mangled key.
pub fn unmangle_name(key: &str) -> &str {
    match key.find("::") {
        Some(idx) => &key[..idx],
        None => key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes() {
        assert_eq!(Type::Int.code(), "i");
        assert_eq!(Type::Array(Box::new(Type::Int)).code(), "ai");
        assert_eq!(
            Type::ResultTy(Box::new(Type::Int), Box::new(Type::Str)).code(),
            "qis"
        );
        assert_eq!(Type::Ref(Box::new(Type::Object("Node".into()))).code(), "rONode");
    }

    #[test]
    fn test_mangle_round_trip_name() {
        let key = mangle("parse", &[Type::Str], &Type::ResultTy(Box::new(Type::Int), Box::new(Type::Str)));
        assert_eq!(key, "parse::s:qis");
        assert_eq!(unmangle_name(&key), "parse");
    }

    #[test]
    fn test_parse_type_str() {
        assert_eq!(parse_type_str("int"), Some(Type::Int));
        assert_eq!(
            parse_type_str("array[string]"),
            Some(Type::Array(Box::new(Type::Str)))
        );
        assert_eq!(parse_type_str("what"), None);
    }

    #[test]
    fn test_destructor_transitivity() {
        let mut types = UserTypes::new();
        types.objects.insert(
            "File".into(),
            ObjectDecl {
                name: "File".into(),
                fields: vec![("fd".into(), Type::Int)],
                destructor: Some("closeFile::OFile:v".into()),
            },
        );
        types.objects.insert(
            "Logger".into(),
            ObjectDecl {
                name: "Logger".into(),
                fields: vec![("sink".into(), Type::Object("File".into()))],
                destructor: None,
            },
        );
        assert!(types.has_destructor(&Type::Object("File".into())));
        assert!(types.has_destructor(&Type::Object("Logger".into())));
        assert!(types.has_destructor(&Type::Array(Box::new(Type::Object("File".into())))));
        assert!(!types.has_destructor(&Type::Int));
    }
}
