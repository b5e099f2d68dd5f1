//! The register bytecode program: instruction stream, constant pools,
//! function table, globals, per-instruction debug records, and the CFFI
//! descriptor table.

pub mod cache;
mod encoder;
mod opcode;

pub use cache::{cache_path, load_cached, save_cached, source_digest, CacheError};
pub use encoder::{decode_program, encode_program, BytecodeReader, BytecodeWriter, DecodeError};
pub use opcode::{match_tag, pack_call, unpack_call, Opcode};

use crate::ast::ORIGIN_NONE;
use rustc_hash::FxHashMap;

/// Magic number for Etch bytecode files: "ETCH".
pub const MAGIC: [u8; 4] = *b"ETCH";

/// Current bytecode version.
pub const VERSION: u32 = 3;

/// Registers per frame fit in 8 bits.
pub const MAX_REGISTERS: usize = 256;

/// Constant pool indices fit in 16 bits.
pub const MAX_CONSTANTS: usize = 65_536;

/// Compiler flag bits carried in the cache header.
pub mod flags {
    pub const VERBOSE: u32 = 1 << 0;
    pub const DEBUG: u32 = 1 << 1;
    pub const RELEASE: u32 = 1 << 2;
    /// Optimization level occupies bits 8..16.
    pub const OPT_SHIFT: u32 = 8;
    pub const OPT_MASK: u32 = 0xFF << 8;
}

/// A single 64-bit-ish instruction: opcode, two register operands, and a wide
/// immediate / constant index / packed call descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub op: Opcode,
    pub a: u8,
    pub b: u8,
    pub wide: u32,
}

impl Instr {
    pub fn new(op: Opcode, a: u8, b: u8, wide: u32) -> Self {
        Instr { op, a, b, wide }
    }

    /// Right-operand register for the ABC-shaped binary instructions.
    pub fn c(&self) -> u8 {
        (self.wide & 0xFF) as u8
    }
}

/// Per-instruction source attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugRecord {
    /// Index into `BytecodeProgram::source_files`
    pub file: u32,
    pub line: u32,
    pub col: u32,
    /// Index into `BytecodeProgram::origin_names`, or `ORIGIN_NONE`
    pub origin: u32,
}

impl Default for DebugRecord {
    fn default() -> Self {
        DebugRecord {
            file: 0,
            line: 0,
            col: 0,
            origin: ORIGIN_NONE,
        }
    }
}

/// How a function-table entry is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncKind {
    /// Bytecode between start_pc and end_pc
    Native,
    /// VM builtin registry
    Builtin,
    /// Host callback registered through the embedding ABI
    Host,
    /// CFFI thunk table
    Cffi,
}

impl FuncKind {
    pub fn to_u8(self) -> u8 {
        match self {
            FuncKind::Native => 0,
            FuncKind::Builtin => 1,
            FuncKind::Host => 2,
            FuncKind::Cffi => 3,
        }
    }

    pub fn from_u8(b: u8) -> Option<FuncKind> {
        Some(match b {
            0 => FuncKind::Native,
            1 => FuncKind::Builtin,
            2 => FuncKind::Host,
            3 => FuncKind::Cffi,
            _ => return None,
        })
    }
}

/// Function table entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInfo {
    /// Mangled key
    pub name: String,
    pub start_pc: u32,
    pub end_pc: u32,
    pub kind: FuncKind,
    pub param_count: u8,
    pub max_register: u8,
    pub param_names: Vec<String>,
    pub return_type_code: String,
}

/// Serializable initial value of a global slot. Globals with computed
/// initializers are stored as `Nil` here and filled in by the synthetic
/// `<global>` function.
#[derive(Debug, Clone, PartialEq)]
pub enum InitialValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Global table entry.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalInfo {
    pub name: String,
    pub type_code: String,
    pub initial: InitialValue,
}

/// One externed function: resolution metadata for the CFFI thunk table.
#[derive(Debug, Clone, PartialEq)]
pub struct CffiDescriptor {
    pub mangled: String,
    pub library: String,
    pub symbol: String,
    pub param_codes: Vec<String>,
    pub return_code: String,
    pub resolved_path: String,
}

/// The executable program.
#[derive(Debug, Clone, Default)]
pub struct BytecodeProgram {
    pub version: u32,
    pub source_hash: u64,
    pub flags: u32,
    pub strings: Vec<String>,
    pub floats: Vec<f64>,
    pub ints: Vec<i64>,
    pub code: Vec<Instr>,
    pub debug: Vec<DebugRecord>,
    pub functions: Vec<FunctionInfo>,
    pub globals: Vec<GlobalInfo>,
    pub cffi: Vec<CffiDescriptor>,
    /// Object type name → destructor function key
    pub destructors: Vec<(String, String)>,
    pub source_files: Vec<String>,
    pub origin_names: Vec<String>,
    /// Mangled key → function table index (rebuilt on load)
    pub function_index: FxHashMap<String, usize>,
}

impl BytecodeProgram {
    pub fn new() -> Self {
        BytecodeProgram {
            version: VERSION,
            ..Default::default()
        }
    }

    /// Rebuild the mangled-key index after decoding.
    pub fn reindex(&mut self) {
        self.function_index = self
            .functions
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
    }

    /// Look up a function by mangled key, or by plain name when unambiguous.
    pub fn find_function(&self, name: &str) -> Option<usize> {
        if let Some(&idx) = self.function_index.get(name) {
            return Some(idx);
        }
        let prefix = format!("{name}::");
        let mut found = None;
        for (i, f) in self.functions.iter().enumerate() {
            if f.name.starts_with(&prefix) {
                if found.is_some() {
                    return None;
                }
                found = Some(i);
            }
        }
        found
    }

    pub fn file_name(&self, idx: u32) -> &str {
        self.source_files
            .get(idx as usize)
            .map(|s| s.as_str())
            .unwrap_or("<unknown>")
    }

    pub fn origin_name(&self, idx: u32) -> Option<&str> {
        if idx == ORIGIN_NONE {
            return None;
        }
        self.origin_names.get(idx as usize).map(|s| s.as_str())
    }

    /// Which native function contains the given pc.
    pub fn function_at_pc(&self, pc: usize) -> Option<&FunctionInfo> {
        self.functions.iter().find(|f| {
            f.kind == FuncKind::Native && (f.start_pc as usize) <= pc && pc < f.end_pc as usize
        })
    }

    /// Textual disassembly.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "; etch bytecode v{} hash={:016x} flags={:#x}\n",
            self.version, self.source_hash, self.flags
        ));
        for f in &self.functions {
            if f.kind != FuncKind::Native {
                out.push_str(&format!("; extern {} ({:?})\n", f.name, f.kind));
                continue;
            }
            out.push_str(&format!(
                "\nfn {} (params={} regs={})\n",
                f.name,
                f.param_count,
                f.max_register as u16 + 1
            ));
            for pc in f.start_pc as usize..f.end_pc as usize {
                let instr = &self.code[pc];
                out.push_str(&format!(
                    "  {pc:5}  {:<12} a={:<3} b={:<3} w={}\n",
                    instr.op.name(),
                    instr.a,
                    instr.b,
                    instr.wide
                ));
            }
        }
        out
    }

    /// Validate all branch targets and call indices. Every jump target must
    /// land inside the instruction stream and every packed table index must
    /// resolve.
    pub fn verify(&self) -> Result<(), DecodeError> {
        let count = self.code.len() as u32;
        for (pc, instr) in self.code.iter().enumerate() {
            match instr.op {
                Opcode::Jump | Opcode::JumpIfFalse | Opcode::DeferPush => {
                    if instr.wide >= count {
                        return Err(DecodeError::BadBranchTarget {
                            pc,
                            target: instr.wide,
                        });
                    }
                }
                Opcode::Call | Opcode::Spawn | Opcode::MakeClosure => {
                    let (idx, _) = unpack_call(instr.wide);
                    if idx as usize >= self.functions.len() {
                        return Err(DecodeError::BadTableIndex { pc, index: idx });
                    }
                }
                Opcode::CallCffi => {
                    let (idx, _) = unpack_call(instr.wide);
                    if idx as usize >= self.cffi.len() {
                        return Err(DecodeError::BadTableIndex { pc, index: idx });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_program() -> BytecodeProgram {
        let mut p = BytecodeProgram::new();
        p.source_files.push("<input>".into());
        p.code = vec![
            Instr::new(Opcode::LoadInt, 0, 0, 42),
            Instr::new(Opcode::Return, 0, 0, 0),
        ];
        p.debug = vec![DebugRecord::default(); 2];
        p.functions.push(FunctionInfo {
            name: "main:::i".into(),
            start_pc: 0,
            end_pc: 2,
            kind: FuncKind::Native,
            param_count: 0,
            max_register: 0,
            param_names: vec![],
            return_type_code: "i".into(),
        });
        p.reindex();
        p
    }

    #[test]
    fn test_find_function_by_plain_name() {
        let p = tiny_program();
        assert_eq!(p.find_function("main"), Some(0));
        assert_eq!(p.find_function("main:::i"), Some(0));
        assert_eq!(p.find_function("other"), None);
    }

    #[test]
    fn test_verify_rejects_bad_branch() {
        let mut p = tiny_program();
        p.code[0] = Instr::new(Opcode::Jump, 0, 0, 99);
        assert!(p.verify().is_err());
    }

    #[test]
    fn test_function_at_pc() {
        let p = tiny_program();
        assert_eq!(p.function_at_pc(1).map(|f| f.name.as_str()), Some("main:::i"));
        assert!(p.function_at_pc(5).is_none());
    }

    #[test]
    fn test_dump_contains_mnemonics() {
        let p = tiny_program();
        let text = p.dump();
        assert!(text.contains("load.int"));
        assert!(text.contains("fn main:::i"));
    }
}
