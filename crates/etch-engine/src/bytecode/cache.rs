//! On-disk bytecode cache.
//!
//! Each source file gets a sibling `__etch__` directory holding
//! `<basename>.etcx`. A cache hit requires exact match of magic, version,
//! source digest, and compiler flag bits. Writes go through a temp file in
//! the target directory followed by a rename, so concurrent compilers never
//! observe a half-written cache.

use super::encoder::{decode_program, encode_program, DecodeError};
use super::{BytecodeProgram, VERSION};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Cache directory name placed next to each source file.
pub const CACHE_DIR: &str = "__etch__";

/// Cache file extension.
pub const CACHE_EXT: &str = "etcx";

/// Compiler build fingerprint mixed into the source digest so caches from a
/// different compiler build never hit.
const BUILD_FINGERPRINT: &str = env!("CARGO_PKG_VERSION");

/// Errors from cache load/store.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("cache is stale: source digest mismatch")]
    StaleSource,

    #[error("cache is stale: compiler flags mismatch")]
    StaleFlags,
}

/// Stable 8-byte digest of (source text, compiler build fingerprint,
/// bytecode version, optimization level).
pub fn source_digest(source: &str, opt_level: u8) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(BUILD_FINGERPRINT.as_bytes());
    hasher.update(VERSION.to_le_bytes());
    hasher.update([opt_level]);
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

/// `dir/file.etch` → `dir/__etch__/file.etcx`.
pub fn cache_path(source_path: &Path) -> PathBuf {
    let dir = source_path.parent().unwrap_or_else(|| Path::new("."));
    let stem = source_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "out".to_string());
    dir.join(CACHE_DIR).join(format!("{stem}.{CACHE_EXT}"))
}

/// Serialize and atomically persist a compiled program next to its source.
pub fn save_cached(source_path: &Path, program: &BytecodeProgram) -> Result<PathBuf, CacheError> {
    let target = cache_path(source_path);
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let bytes = encode_program(program);
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.flush()?;
    tmp.persist(&target).map_err(|e| CacheError::Io(e.error))?;
    Ok(target)
}

/// Load a cached program, validating the header against the current source
/// text and compiler flags. Any mismatch is a miss, reported as a distinct
/// error so callers can fall back to a fresh compile.
pub fn load_cached(
    source_path: &Path,
    source: &str,
    expected_flags: u32,
    opt_level: u8,
) -> Result<BytecodeProgram, CacheError> {
    let target = cache_path(source_path);
    let bytes = std::fs::read(&target)?;
    let program = decode_program(&bytes)?;
    if program.source_hash != source_digest(source, opt_level) {
        return Err(CacheError::StaleSource);
    }
    if program.flags != expected_flags {
        return Err(CacheError::StaleFlags);
    }
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{DebugRecord, FuncKind, FunctionInfo, Instr, Opcode};

    fn program_for(source: &str, flags: u32, opt_level: u8) -> BytecodeProgram {
        let mut p = BytecodeProgram::new();
        p.source_hash = source_digest(source, opt_level);
        p.flags = flags;
        p.source_files = vec!["t.etch".into()];
        p.code = vec![Instr::new(Opcode::ReturnVoid, 0, 0, 0)];
        p.debug = vec![DebugRecord::default()];
        p.functions = vec![FunctionInfo {
            name: "main:::v".into(),
            start_pc: 0,
            end_pc: 1,
            kind: FuncKind::Native,
            param_count: 0,
            max_register: 0,
            param_names: vec![],
            return_type_code: "v".into(),
        }];
        p.reindex();
        p
    }

    #[test]
    fn test_digest_varies_by_input() {
        assert_ne!(source_digest("a", 0), source_digest("b", 0));
        assert_ne!(source_digest("a", 0), source_digest("a", 2));
        assert_eq!(source_digest("a", 1), source_digest("a", 1));
    }

    #[test]
    fn test_cache_path_layout() {
        let p = cache_path(Path::new("/tmp/proj/main.etch"));
        assert_eq!(p, PathBuf::from("/tmp/proj/__etch__/main.etcx"));
    }

    #[test]
    fn test_save_then_load_hit() {
        let dir = tempfile::TempDir::new().unwrap();
        let src_path = dir.path().join("hit.etch");
        let source = "fn main() -> void { }";
        std::fs::write(&src_path, source).unwrap();

        let program = program_for(source, 4, 2);
        save_cached(&src_path, &program).unwrap();

        let loaded = load_cached(&src_path, source, 4, 2).unwrap();
        assert_eq!(loaded.code, program.code);
        assert_eq!(loaded.functions, program.functions);
    }

    #[test]
    fn test_stale_source_misses() {
        let dir = tempfile::TempDir::new().unwrap();
        let src_path = dir.path().join("stale.etch");
        let source = "fn main() -> void { }";
        std::fs::write(&src_path, source).unwrap();

        let program = program_for(source, 0, 0);
        save_cached(&src_path, &program).unwrap();

        let edited = "fn main() -> void { print(1); }";
        assert!(matches!(
            load_cached(&src_path, edited, 0, 0),
            Err(CacheError::StaleSource)
        ));
    }

    #[test]
    fn test_flag_mismatch_misses() {
        let dir = tempfile::TempDir::new().unwrap();
        let src_path = dir.path().join("flags.etch");
        let source = "fn main() -> void { }";
        std::fs::write(&src_path, source).unwrap();

        let program = program_for(source, 0, 0);
        save_cached(&src_path, &program).unwrap();

        assert!(matches!(
            load_cached(&src_path, source, 2, 0),
            Err(CacheError::StaleFlags)
        ));
    }
}
