//! The builtin function registry.
//!
//! Builtins dispatch through the `Builtin` opcode by numeric id. The emitter
//! resolves names through `lookup`; `isError` is accepted as an alias of the
//! canonical `isErr`.

/// Builtin ids. Stable across the bytecode format.
pub mod id {
    pub const PRINT: u32 = 0;
    pub const PRINTLN: u32 = 1;
    pub const LEN: u32 = 2;
    pub const TO_STRING: u32 = 3;
    pub const PARSE_INT: u32 = 4;
    pub const PARSE_FLOAT: u32 = 5;
    pub const ABS: u32 = 6;
    pub const MIN: u32 = 7;
    pub const MAX: u32 = 8;
    pub const RAND: u32 = 9;
    pub const SEED: u32 = 10;
    pub const READ_FILE: u32 = 11;
    pub const IS_SOME: u32 = 12;
    pub const IS_NONE: u32 = 13;
    pub const IS_OK: u32 = 14;
    pub const IS_ERR: u32 = 15;
    pub const UNWRAP: u32 = 16;
    pub const UNWRAP_ERR: u32 = 17;
    pub const PUSH: u32 = 18;
    pub const POP: u32 = 19;
    pub const INJECT: u32 = 20;
    pub const CHR: u32 = 21;
    pub const ORD: u32 = 22;
}

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

const TABLE: &[(&str, u32)] = &[
    ("print", id::PRINT),
    ("println", id::PRINTLN),
    ("len", id::LEN),
    ("toString", id::TO_STRING),
    ("parseInt", id::PARSE_INT),
    ("parseFloat", id::PARSE_FLOAT),
    ("abs", id::ABS),
    ("min", id::MIN),
    ("max", id::MAX),
    ("rand", id::RAND),
    ("seed", id::SEED),
    ("readFile", id::READ_FILE),
    ("isSome", id::IS_SOME),
    ("isNone", id::IS_NONE),
    ("isOk", id::IS_OK),
    ("isErr", id::IS_ERR),
    // Accepted alias; canonical name is isErr.
    ("isError", id::IS_ERR),
    ("unwrap", id::UNWRAP),
    ("unwrapErr", id::UNWRAP_ERR),
    ("push", id::PUSH),
    ("pop", id::POP),
    ("inject", id::INJECT),
    ("chr", id::CHR),
    ("ord", id::ORD),
];

static BY_NAME: Lazy<FxHashMap<&'static str, u32>> =
    Lazy::new(|| TABLE.iter().copied().collect());

/// Resolve a builtin name to its id.
pub fn lookup(name: &str) -> Option<u32> {
    BY_NAME.get(name).copied()
}

/// Canonical name of a builtin id (for disassembly and error messages).
pub fn name_of(builtin: u32) -> &'static str {
    TABLE
        .iter()
        .find(|(n, i)| *i == builtin && *n != "isError")
        .map(|(n, _)| *n)
        .unwrap_or("<unknown builtin>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_alias() {
        assert_eq!(lookup("print"), Some(id::PRINT));
        assert_eq!(lookup("isErr"), Some(id::IS_ERR));
        assert_eq!(lookup("isError"), Some(id::IS_ERR));
        assert_eq!(lookup("nope"), None);
    }

    #[test]
    fn test_name_of_prefers_canonical() {
        assert_eq!(name_of(id::IS_ERR), "isErr");
        assert_eq!(name_of(id::TO_STRING), "toString");
    }
}
