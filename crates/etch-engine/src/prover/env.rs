//! Abstract environments: variable → Info, tracked nil knowledge, declaration
//! positions, static types, and reachability.

use super::info::Info;
use crate::ast::{SourcePos, Type};
use rustc_hash::FxHashMap;

/// One abstract state at a program point.
#[derive(Debug, Clone, Default)]
pub struct Env {
    pub vars: FxHashMap<String, Info>,
    /// Tracked-expression nil knowledge: serialized l-value path → proven
    /// non-nil. Keys rooted at a variable are invalidated by any write
    /// through that variable.
    pub nil_known: FxHashMap<String, bool>,
    pub decl_pos: FxHashMap<String, SourcePos>,
    pub types: FxHashMap<String, Type>,
    /// Set when this program point cannot be reached
    pub unreachable: bool,
}

impl Env {
    pub fn new() -> Self {
        Env::default()
    }

    /// Independent copy for a branch successor.
    pub fn copy_env(&self) -> Env {
        self.clone()
    }

    pub fn get(&self, name: &str) -> Option<&Info> {
        self.vars.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Info> {
        self.vars.get_mut(name)
    }

    pub fn declare(&mut self, name: &str, ty: Type, info: Info, pos: SourcePos) {
        self.vars.insert(name.to_string(), info);
        self.types.insert(name.to_string(), ty);
        self.decl_pos.insert(name.to_string(), pos);
    }

    /// Overwrite a variable's abstract value, dropping any tracked nil
    /// knowledge rooted at it.
    pub fn set(&mut self, name: &str, info: Info) {
        self.invalidate_rooted(name);
        self.vars.insert(name.to_string(), info);
    }

    /// Drop tracked-expression entries whose path is rooted at `base`.
    pub fn invalidate_rooted(&mut self, base: &str) {
        self.nil_known.retain(|key, _| {
            let root = key
                .split(|c: char| c == '[' || c == '.' || c == '*')
                .find(|s| !s.is_empty())
                .unwrap_or(key.as_str());
            root != base
        });
    }

    /// Merge another environment at a control-flow join. Variables present in
    /// both sides join pointwise; one-sided variables keep their info but
    /// lose certainty about initialization only if the other side declared
    /// them (out-of-scope names simply pass through, since declarations are
    /// block-scoped and the emitter rejects their escape).
    pub fn union_env(&self, other: &Env) -> Env {
        if self.unreachable {
            return other.clone();
        }
        if other.unreachable {
            return self.clone();
        }
        let mut merged = Env {
            unreachable: false,
            ..Env::default()
        };
        for (name, a) in &self.vars {
            match other.vars.get(name) {
                Some(b) => {
                    merged.vars.insert(name.clone(), a.union_with(b));
                }
                None => {
                    merged.vars.insert(name.clone(), a.clone());
                }
            }
        }
        for (name, b) in &other.vars {
            if !merged.vars.contains_key(name) {
                merged.vars.insert(name.clone(), b.clone());
            }
        }
        // Nil knowledge survives a join only when both sides agree.
        for (key, &a) in &self.nil_known {
            if let Some(&b) = other.nil_known.get(key) {
                if a == b {
                    merged.nil_known.insert(key.clone(), a);
                }
            }
        }
        merged.decl_pos = self.decl_pos.clone();
        for (name, pos) in &other.decl_pos {
            merged.decl_pos.entry(name.clone()).or_insert(*pos);
        }
        merged.types = self.types.clone();
        for (name, ty) in &other.types {
            merged.types.entry(name.clone()).or_insert_with(|| ty.clone());
        }
        merged
    }

    /// Mark a variable read.
    pub fn mark_used(&mut self, name: &str) {
        if let Some(info) = self.vars.get_mut(name) {
            info.used = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_env_joins_pointwise() {
        let mut a = Env::new();
        a.declare("x", Type::Int, Info::int_const(1), SourcePos::unknown());
        let mut b = a.copy_env();
        b.set("x", Info::int_const(5));

        let joined = a.union_env(&b);
        let x = joined.get("x").unwrap();
        assert_eq!((x.minv, x.maxv), (1, 5));
        assert!(!x.known);
    }

    #[test]
    fn test_unreachable_side_is_identity() {
        let mut a = Env::new();
        a.declare("x", Type::Int, Info::int_const(1), SourcePos::unknown());
        let mut dead = a.copy_env();
        dead.set("x", Info::int_const(99));
        dead.unreachable = true;

        let joined = a.union_env(&dead);
        assert!(joined.get("x").unwrap().known);
        assert_eq!(joined.get("x").unwrap().cval, 1);
    }

    #[test]
    fn test_nil_knowledge_requires_agreement() {
        let mut a = Env::new();
        a.nil_known.insert("p".into(), true);
        let mut b = Env::new();
        b.nil_known.insert("p".into(), true);
        assert_eq!(a.union_env(&b).nil_known.get("p"), Some(&true));

        b.nil_known.insert("p".into(), false);
        assert!(a.union_env(&b).nil_known.get("p").is_none());
    }

    #[test]
    fn test_invalidate_rooted() {
        let mut env = Env::new();
        env.nil_known.insert("arr[0]".into(), true);
        env.nil_known.insert("other".into(), true);
        env.invalidate_rooted("arr");
        assert!(env.nil_known.get("arr[0]").is_none());
        assert!(env.nil_known.get("other").is_some());
    }
}
