//! Binary encoding and decoding of bytecode programs (little-endian).

use super::{
    BytecodeProgram, CffiDescriptor, DebugRecord, FuncKind, FunctionInfo, GlobalInfo,
    InitialValue, Instr, Opcode, MAGIC, VERSION,
};
use thiserror::Error;

/// Errors that can occur while decoding a bytecode stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unexpected end of bytecode at offset {0}")]
    UnexpectedEnd(usize),

    #[error("invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    #[error("invalid opcode {0:#04x} at offset {1}")]
    InvalidOpcode(u8, usize),

    #[error("invalid function kind tag {0}")]
    InvalidFuncKind(u8),

    #[error("invalid magic number: expected ETCH, got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported bytecode version {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    #[error("branch target {target} out of range at pc {pc}")]
    BadBranchTarget { pc: usize, target: u32 },

    #[error("table index {index} out of range at pc {pc}")]
    BadTableIndex { pc: usize, index: u32 },

    #[error("invalid initial-value tag {0}")]
    InvalidInitialTag(u8),
}

/// Little-endian byte sink.
#[derive(Default)]
pub struct BytecodeWriter {
    buffer: Vec<u8>,
}

impl BytecodeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_f64(&mut self, value: f64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Length-prefixed UTF-8 string.
    pub fn emit_string(&mut self, s: &str) {
        self.emit_u32(s.len() as u32);
        self.buffer.extend_from_slice(s.as_bytes());
    }
}

/// Little-endian byte source.
pub struct BytecodeReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BytecodeReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        BytecodeReader { bytes, pos: 0 }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.pos + n > self.bytes.len() {
            return Err(DecodeError::UnexpectedEnd(self.pos));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let start = self.pos;
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8(start))
    }
}

/// Encode a full program, cache-file layout: magic, version, source hash,
/// flags, constant pools, file and origin tables, function table, globals,
/// instruction stream with debug records, CFFI descriptors.
pub fn encode_program(program: &BytecodeProgram) -> Vec<u8> {
    let mut w = BytecodeWriter::new();
    w.emit_bytes(&MAGIC);
    w.emit_u32(program.version);
    w.emit_u64(program.source_hash);
    w.emit_u32(program.flags);

    w.emit_u32(program.strings.len() as u32);
    for s in &program.strings {
        w.emit_string(s);
    }
    w.emit_u32(program.floats.len() as u32);
    for f in &program.floats {
        w.emit_f64(*f);
    }
    w.emit_u32(program.ints.len() as u32);
    for i in &program.ints {
        w.emit_i64(*i);
    }

    w.emit_u32(program.source_files.len() as u32);
    for f in &program.source_files {
        w.emit_string(f);
    }
    w.emit_u32(program.origin_names.len() as u32);
    for n in &program.origin_names {
        w.emit_string(n);
    }

    w.emit_u32(program.functions.len() as u32);
    for func in &program.functions {
        w.emit_string(&func.name);
        w.emit_u32(func.start_pc);
        w.emit_u32(func.end_pc);
        w.emit_u8(func.kind.to_u8());
        w.emit_u8(func.param_count);
        w.emit_u8(func.max_register);
        w.emit_u32(func.param_names.len() as u32);
        for p in &func.param_names {
            w.emit_string(p);
        }
        w.emit_string(&func.return_type_code);
    }

    w.emit_u32(program.globals.len() as u32);
    for g in &program.globals {
        w.emit_string(&g.name);
        w.emit_string(&g.type_code);
        match &g.initial {
            InitialValue::Nil => w.emit_u8(0),
            InitialValue::Bool(b) => {
                w.emit_u8(1);
                w.emit_u8(*b as u8);
            }
            InitialValue::Int(i) => {
                w.emit_u8(2);
                w.emit_i64(*i);
            }
            InitialValue::Float(f) => {
                w.emit_u8(3);
                w.emit_f64(*f);
            }
            InitialValue::Str(s) => {
                w.emit_u8(4);
                w.emit_string(s);
            }
        }
    }

    w.emit_u32(program.code.len() as u32);
    for (instr, rec) in program.code.iter().zip(program.debug.iter()) {
        w.emit_u8(instr.op.to_u8());
        w.emit_u8(instr.a);
        w.emit_u8(instr.b);
        w.emit_u32(instr.wide);
        w.emit_u32(rec.file);
        w.emit_u32(rec.line);
        w.emit_u32(rec.col);
        w.emit_u32(rec.origin);
    }

    w.emit_u32(program.cffi.len() as u32);
    for d in &program.cffi {
        w.emit_string(&d.mangled);
        w.emit_string(&d.library);
        w.emit_string(&d.symbol);
        w.emit_u32(d.param_codes.len() as u32);
        for c in &d.param_codes {
            w.emit_string(c);
        }
        w.emit_string(&d.return_code);
        w.emit_string(&d.resolved_path);
    }

    w.emit_u32(program.destructors.len() as u32);
    for (type_name, func_key) in &program.destructors {
        w.emit_string(type_name);
        w.emit_string(func_key);
    }

    w.into_bytes()
}

/// Decode a full program. Header fields are validated; branch targets are
/// checked by `BytecodeProgram::verify`.
pub fn decode_program(bytes: &[u8]) -> Result<BytecodeProgram, DecodeError> {
    let mut r = BytecodeReader::new(bytes);

    let magic_bytes = r.take(4)?;
    let magic: [u8; 4] = magic_bytes.try_into().unwrap();
    if magic != MAGIC {
        return Err(DecodeError::InvalidMagic(magic));
    }
    let version = r.read_u32()?;
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let source_hash = r.read_u64()?;
    let flags = r.read_u32()?;

    let mut program = BytecodeProgram::new();
    program.version = version;
    program.source_hash = source_hash;
    program.flags = flags;

    let nstrings = r.read_u32()? as usize;
    for _ in 0..nstrings {
        program.strings.push(r.read_string()?);
    }
    let nfloats = r.read_u32()? as usize;
    for _ in 0..nfloats {
        program.floats.push(r.read_f64()?);
    }
    let nints = r.read_u32()? as usize;
    for _ in 0..nints {
        program.ints.push(r.read_i64()?);
    }

    let nfiles = r.read_u32()? as usize;
    for _ in 0..nfiles {
        program.source_files.push(r.read_string()?);
    }
    let norigins = r.read_u32()? as usize;
    for _ in 0..norigins {
        program.origin_names.push(r.read_string()?);
    }

    let nfuncs = r.read_u32()? as usize;
    for _ in 0..nfuncs {
        let name = r.read_string()?;
        let start_pc = r.read_u32()?;
        let end_pc = r.read_u32()?;
        let kind_tag = r.read_u8()?;
        let kind = FuncKind::from_u8(kind_tag).ok_or(DecodeError::InvalidFuncKind(kind_tag))?;
        let param_count = r.read_u8()?;
        let max_register = r.read_u8()?;
        let nparams = r.read_u32()? as usize;
        let mut param_names = Vec::with_capacity(nparams);
        for _ in 0..nparams {
            param_names.push(r.read_string()?);
        }
        let return_type_code = r.read_string()?;
        program.functions.push(FunctionInfo {
            name,
            start_pc,
            end_pc,
            kind,
            param_count,
            max_register,
            param_names,
            return_type_code,
        });
    }

    let nglobals = r.read_u32()? as usize;
    for _ in 0..nglobals {
        let name = r.read_string()?;
        let type_code = r.read_string()?;
        let tag = r.read_u8()?;
        let initial = match tag {
            0 => InitialValue::Nil,
            1 => InitialValue::Bool(r.read_u8()? != 0),
            2 => InitialValue::Int(r.read_i64()?),
            3 => InitialValue::Float(r.read_f64()?),
            4 => InitialValue::Str(r.read_string()?),
            other => return Err(DecodeError::InvalidInitialTag(other)),
        };
        program.globals.push(GlobalInfo {
            name,
            type_code,
            initial,
        });
    }

    let ninstrs = r.read_u32()? as usize;
    program.code.reserve(ninstrs);
    program.debug.reserve(ninstrs);
    for _ in 0..ninstrs {
        let offset = r.offset();
        let byte = r.read_u8()?;
        let op = Opcode::from_u8(byte).ok_or(DecodeError::InvalidOpcode(byte, offset))?;
        let a = r.read_u8()?;
        let b = r.read_u8()?;
        let wide = r.read_u32()?;
        program.code.push(Instr { op, a, b, wide });
        program.debug.push(DebugRecord {
            file: r.read_u32()?,
            line: r.read_u32()?,
            col: r.read_u32()?,
            origin: r.read_u32()?,
        });
    }

    let ncffi = r.read_u32()? as usize;
    for _ in 0..ncffi {
        let mangled = r.read_string()?;
        let library = r.read_string()?;
        let symbol = r.read_string()?;
        let ncodes = r.read_u32()? as usize;
        let mut param_codes = Vec::with_capacity(ncodes);
        for _ in 0..ncodes {
            param_codes.push(r.read_string()?);
        }
        let return_code = r.read_string()?;
        let resolved_path = r.read_string()?;
        program.cffi.push(CffiDescriptor {
            mangled,
            library,
            symbol,
            param_codes,
            return_code,
            resolved_path,
        });
    }

    let ndtors = r.read_u32()? as usize;
    for _ in 0..ndtors {
        let type_name = r.read_string()?;
        let func_key = r.read_string()?;
        program.destructors.push((type_name, func_key));
    }

    program.reindex();
    program.verify()?;
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::DebugRecord;

    fn sample() -> BytecodeProgram {
        let mut p = BytecodeProgram::new();
        p.source_hash = 0xDEAD_BEEF_1234_5678;
        p.flags = 0x0000_0104;
        p.strings = vec!["hello".into(), "main".into()];
        p.floats = vec![2.5, -0.0];
        p.ints = vec![i64::MAX, -9];
        p.source_files = vec!["prog.etch".into()];
        p.origin_names = vec!["helper".into()];
        p.code = vec![
            Instr::new(Opcode::LoadStr, 0, 0, 0),
            Instr::new(Opcode::ReturnVoid, 0, 0, 0),
        ];
        p.debug = vec![
            DebugRecord {
                file: 0,
                line: 1,
                col: 5,
                origin: 0,
            },
            DebugRecord::default(),
        ];
        p.functions = vec![FunctionInfo {
            name: "main:::v".into(),
            start_pc: 0,
            end_pc: 2,
            kind: FuncKind::Native,
            param_count: 0,
            max_register: 0,
            param_names: vec![],
            return_type_code: "v".into(),
        }];
        p.globals = vec![GlobalInfo {
            name: "n".into(),
            type_code: "i".into(),
            initial: InitialValue::Int(42),
        }];
        p.cffi = vec![CffiDescriptor {
            mangled: "sin::f:f".into(),
            library: "m".into(),
            symbol: "sin".into(),
            param_codes: vec!["f".into()],
            return_code: "f".into(),
            resolved_path: "libm.so.6".into(),
        }];
        p.destructors = vec![("File".into(), "closeFile::OFile:v".into())];
        p.reindex();
        p
    }

    #[test]
    fn test_round_trip_identity() {
        let p = sample();
        let bytes = encode_program(&p);
        let q = decode_program(&bytes).unwrap();
        assert_eq!(p.source_hash, q.source_hash);
        assert_eq!(p.flags, q.flags);
        assert_eq!(p.strings, q.strings);
        assert_eq!(p.floats, q.floats);
        assert_eq!(p.ints, q.ints);
        assert_eq!(p.code, q.code);
        assert_eq!(p.debug, q.debug);
        assert_eq!(p.functions, q.functions);
        assert_eq!(p.globals, q.globals);
        assert_eq!(p.cffi, q.cffi);
        assert_eq!(p.destructors, q.destructors);
        assert_eq!(p.source_files, q.source_files);
        assert_eq!(p.origin_names, q.origin_names);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let p = sample();
        let mut bytes = encode_program(&p);
        bytes[0] = b'X';
        assert!(matches!(
            decode_program(&bytes),
            Err(DecodeError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_bad_version_rejected() {
        let p = sample();
        let mut bytes = encode_program(&p);
        bytes[4] = 0xFF;
        assert!(matches!(
            decode_program(&bytes),
            Err(DecodeError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let p = sample();
        let bytes = encode_program(&p);
        assert!(decode_program(&bytes[..bytes.len() - 3]).is_err());
    }
}
