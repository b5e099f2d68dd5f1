//! CFFI: resolving `extern` declarations to dynamic-library symbols and
//! dispatching calls through typed thunks.

pub mod loader;

pub use loader::{platform_library_name, resolve_library_path};

use crate::bytecode::CffiDescriptor;
use crate::vm::Value;
use libloading::Library;
use rustc_hash::FxHashMap;
use std::ffi::CString;
use std::os::raw::{c_char, c_double, c_longlong};
use parking_lot::Mutex;
use thiserror::Error;

/// Errors from library resolution and call dispatch.
#[derive(Debug, Error)]
pub enum FfiError {
    #[error("library not found: {0}")]
    LibraryNotFound(String),

    #[error("failed to load library '{path}': {message}")]
    LoadFailed { path: String, message: String },

    #[error("symbol not found: {symbol} in {library}")]
    SymbolNotFound { symbol: String, library: String },

    #[error("unsupported extern signature '{0}' (int/float/string/void, up to 4 parameters)")]
    UnsupportedSignature(String),

    #[error("extern argument type mismatch: expected {expected}, got {got}")]
    ArgumentMismatch {
        expected: &'static str,
        got: &'static str,
    },
}

/// A resolved symbol with its type codes.
struct BoundSymbol {
    /// Raw function pointer out of the loaded library
    ptr: *const (),
    param_codes: Vec<String>,
    return_code: String,
}

// Symbols are only dispatched from the owning context's thread; the registry
// may be shared read-only across contexts after load.
unsafe impl Send for BoundSymbol {}
unsafe impl Sync for BoundSymbol {}

/// The per-context table mapping mangled external names to resolved symbol
/// pointers with typed signatures.
pub struct CffiRegistry {
    libraries: Mutex<FxHashMap<String, Library>>,
    symbols: Mutex<FxHashMap<String, BoundSymbol>>,
}

impl Default for CffiRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CffiRegistry {
    pub fn new() -> Self {
        CffiRegistry {
            libraries: Mutex::new(FxHashMap::default()),
            symbols: Mutex::new(FxHashMap::default()),
        }
    }

    /// Load every descriptor's library and bind its symbol. Called at program
    /// load; failures surface as diagnostics at the import site.
    pub fn bind_all(&self, descriptors: &[CffiDescriptor]) -> Result<(), FfiError> {
        for d in descriptors {
            self.bind(d)?;
        }
        Ok(())
    }

    /// Resolve one descriptor.
    pub fn bind(&self, descriptor: &CffiDescriptor) -> Result<(), FfiError> {
        validate_signature(descriptor)?;
        let path = if descriptor.resolved_path.is_empty() {
            resolve_library_path(&descriptor.library)
                .ok_or_else(|| FfiError::LibraryNotFound(descriptor.library.clone()))?
        } else {
            descriptor.resolved_path.clone()
        };

        let mut libraries = self.libraries.lock();
        if !libraries.contains_key(&path) {
            let lib = unsafe { Library::new(&path) }.map_err(|e| FfiError::LoadFailed {
                path: path.clone(),
                message: e.to_string(),
            })?;
            libraries.insert(path.clone(), lib);
        }
        let lib = libraries.get(&path).expect("just inserted");
        let ptr = unsafe {
            let sym = lib
                .get::<*const ()>(descriptor.symbol.as_bytes())
                .map_err(|_| FfiError::SymbolNotFound {
                    symbol: descriptor.symbol.clone(),
                    library: path.clone(),
                })?;
            sym.try_as_raw_ptr()
                .ok_or_else(|| FfiError::SymbolNotFound {
                    symbol: descriptor.symbol.clone(),
                    library: path.clone(),
                })? as *const ()
        };

        self.symbols.lock().insert(
            descriptor.mangled.clone(),
            BoundSymbol {
                ptr,
                param_codes: descriptor.param_codes.clone(),
                return_code: descriptor.return_code.clone(),
            },
        );
        Ok(())
    }

    pub fn is_bound(&self, mangled: &str) -> bool {
        self.symbols.lock().contains_key(mangled)
    }

    /// Dispatch a call through the arity × signature thunk table.
    pub fn call(&self, descriptor: &CffiDescriptor, args: &[Value]) -> Result<Value, FfiError> {
        let symbols = self.symbols.lock();
        let bound = symbols.get(&descriptor.mangled).ok_or_else(|| {
            FfiError::SymbolNotFound {
                symbol: descriptor.symbol.clone(),
                library: descriptor.library.clone(),
            }
        })?;
        dispatch(bound, args)
    }
}

/// Only int (i64), float (f64), string (const char*), and void signatures up
/// to 4 parameters are representable through the thunk table.
fn validate_signature(descriptor: &CffiDescriptor) -> Result<(), FfiError> {
    let spelled = format!(
        "({}) -> {}",
        descriptor.param_codes.join(", "),
        descriptor.return_code
    );
    if descriptor.param_codes.len() > 4 {
        return Err(FfiError::UnsupportedSignature(spelled));
    }
    for code in &descriptor.param_codes {
        if !matches!(code.as_str(), "i" | "f" | "s") {
            return Err(FfiError::UnsupportedSignature(spelled));
        }
    }
    if !matches!(descriptor.return_code.as_str(), "i" | "f" | "s" | "v") {
        return Err(FfiError::UnsupportedSignature(spelled));
    }
    Ok(())
}

/// One marshalled argument slot. Strings stay alive in `_keep` until the call
/// returns.
enum Slot {
    Int(c_longlong),
    Float(c_double),
    Str(*const c_char),
}

fn dispatch(bound: &BoundSymbol, args: &[Value]) -> Result<Value, FfiError> {
    if args.len() != bound.param_codes.len() {
        return Err(FfiError::ArgumentMismatch {
            expected: "matching arity",
            got: "wrong argument count",
        });
    }
    let mut keep: Vec<CString> = Vec::new();
    let mut slots: Vec<Slot> = Vec::with_capacity(args.len());
    for (code, arg) in bound.param_codes.iter().zip(args.iter()) {
        match (code.as_str(), arg) {
            ("i", Value::Int(v)) => slots.push(Slot::Int(*v)),
            ("f", Value::Float(v)) => slots.push(Slot::Float(*v)),
            ("f", Value::Int(v)) => slots.push(Slot::Float(*v as f64)),
            ("s", Value::Str(s)) => {
                let c = CString::new(s.as_ref()).map_err(|_| FfiError::ArgumentMismatch {
                    expected: "string without NUL",
                    got: "string",
                })?;
                slots.push(Slot::Str(c.as_ptr()));
                keep.push(c);
            }
            ("i", other) => {
                return Err(FfiError::ArgumentMismatch {
                    expected: "int",
                    got: other.type_name(),
                })
            }
            ("f", other) => {
                return Err(FfiError::ArgumentMismatch {
                    expected: "float",
                    got: other.type_name(),
                })
            }
            (_, other) => {
                return Err(FfiError::ArgumentMismatch {
                    expected: "string",
                    got: other.type_name(),
                })
            }
        }
    }

    // All-int/float/string arguments degrade to two machine classes: integer
    // words (i64 / char*) and doubles. The thunk is selected by the argument
    // class pattern plus return class.
    let words: Vec<u64> = slots
        .iter()
        .map(|s| match s {
            Slot::Int(v) => *v as u64,
            Slot::Str(p) => *p as u64,
            Slot::Float(f) => f.to_bits(),
        })
        .collect();
    let is_double: Vec<bool> = slots.iter().map(|s| matches!(s, Slot::Float(_))).collect();

    let result = unsafe { invoke_thunk(bound.ptr, &words, &is_double, &bound.return_code) };
    drop(keep);
    result
}

/// The actual call. Each arity × (word/double) pattern gets its own transmute
/// target; doubles are passed in their natural positions.
unsafe fn invoke_thunk(
    ptr: *const (),
    words: &[u64],
    is_double: &[bool],
    return_code: &str,
) -> Result<Value, FfiError> {
    // Doubles-only and words-only fast paths cover the system C and math
    // library surface; mixed signatures fall back to per-pattern expansion.
    macro_rules! call_ret {
        ($val:expr) => {
            match return_code {
                "i" => Ok(Value::Int($val as i64)),
                "v" => Ok(Value::Nil),
                _ => unreachable!("checked by caller"),
            }
        };
    }

    let all_doubles = is_double.iter().all(|&d| d);
    let no_doubles = is_double.iter().all(|&d| !d);

    if return_code == "f" {
        if all_doubles {
            let f = |i: usize| f64::from_bits(words[i]);
            let v = match words.len() {
                0 => std::mem::transmute::<_, extern "C" fn() -> c_double>(ptr)(),
                1 => std::mem::transmute::<_, extern "C" fn(c_double) -> c_double>(ptr)(f(0)),
                2 => std::mem::transmute::<_, extern "C" fn(c_double, c_double) -> c_double>(ptr)(
                    f(0),
                    f(1),
                ),
                3 => std::mem::transmute::<
                    _,
                    extern "C" fn(c_double, c_double, c_double) -> c_double,
                >(ptr)(f(0), f(1), f(2)),
                4 => std::mem::transmute::<
                    _,
                    extern "C" fn(c_double, c_double, c_double, c_double) -> c_double,
                >(ptr)(f(0), f(1), f(2), f(3)),
                _ => unreachable!("arity checked"),
            };
            return Ok(Value::Float(v));
        }
        if no_doubles {
            let w = |i: usize| words[i];
            let v = match words.len() {
                0 => std::mem::transmute::<_, extern "C" fn() -> c_double>(ptr)(),
                1 => std::mem::transmute::<_, extern "C" fn(u64) -> c_double>(ptr)(w(0)),
                2 => std::mem::transmute::<_, extern "C" fn(u64, u64) -> c_double>(ptr)(w(0), w(1)),
                3 => std::mem::transmute::<_, extern "C" fn(u64, u64, u64) -> c_double>(ptr)(
                    w(0),
                    w(1),
                    w(2),
                ),
                4 => std::mem::transmute::<_, extern "C" fn(u64, u64, u64, u64) -> c_double>(ptr)(
                    w(0),
                    w(1),
                    w(2),
                    w(3),
                ),
                _ => unreachable!("arity checked"),
            };
            return Ok(Value::Float(v));
        }
        return Err(FfiError::UnsupportedSignature(
            "mixed int/float parameters with float return".to_string(),
        ));
    }

    if return_code == "s" {
        if !no_doubles {
            return Err(FfiError::UnsupportedSignature(
                "float parameters with string return".to_string(),
            ));
        }
        let w = |i: usize| words[i];
        let p: *const c_char = match words.len() {
            0 => std::mem::transmute::<_, extern "C" fn() -> *const c_char>(ptr)(),
            1 => std::mem::transmute::<_, extern "C" fn(u64) -> *const c_char>(ptr)(w(0)),
            2 => std::mem::transmute::<_, extern "C" fn(u64, u64) -> *const c_char>(ptr)(
                w(0),
                w(1),
            ),
            3 => std::mem::transmute::<_, extern "C" fn(u64, u64, u64) -> *const c_char>(ptr)(
                w(0),
                w(1),
                w(2),
            ),
            4 => std::mem::transmute::<_, extern "C" fn(u64, u64, u64, u64) -> *const c_char>(
                ptr,
            )(w(0), w(1), w(2), w(3)),
            _ => unreachable!("arity checked"),
        };
        if p.is_null() {
            return Ok(Value::Nil);
        }
        let s = std::ffi::CStr::from_ptr(p).to_string_lossy().into_owned();
        return Ok(Value::str(s));
    }

    // Integer or void return.
    if all_doubles && !words.is_empty() {
        let f = |i: usize| f64::from_bits(words[i]);
        let v: c_longlong = match words.len() {
            1 => std::mem::transmute::<_, extern "C" fn(c_double) -> c_longlong>(ptr)(f(0)),
            2 => std::mem::transmute::<_, extern "C" fn(c_double, c_double) -> c_longlong>(ptr)(
                f(0),
                f(1),
            ),
            3 => std::mem::transmute::<_, extern "C" fn(c_double, c_double, c_double) -> c_longlong>(
                ptr,
            )(f(0), f(1), f(2)),
            4 => std::mem::transmute::<
                _,
                extern "C" fn(c_double, c_double, c_double, c_double) -> c_longlong,
            >(ptr)(f(0), f(1), f(2), f(3)),
            _ => unreachable!("arity checked"),
        };
        return call_ret!(v);
    }
    if !no_doubles {
        return Err(FfiError::UnsupportedSignature(
            "mixed int/float parameters".to_string(),
        ));
    }
    let w = |i: usize| words[i];
    let v: c_longlong = match words.len() {
        0 => std::mem::transmute::<_, extern "C" fn() -> c_longlong>(ptr)(),
        1 => std::mem::transmute::<_, extern "C" fn(u64) -> c_longlong>(ptr)(w(0)),
        2 => std::mem::transmute::<_, extern "C" fn(u64, u64) -> c_longlong>(ptr)(w(0), w(1)),
        3 => std::mem::transmute::<_, extern "C" fn(u64, u64, u64) -> c_longlong>(ptr)(
            w(0),
            w(1),
            w(2),
        ),
        4 => std::mem::transmute::<_, extern "C" fn(u64, u64, u64, u64) -> c_longlong>(ptr)(
            w(0),
            w(1),
            w(2),
            w(3),
        ),
        _ => unreachable!("arity checked"),
    };
    call_ret!(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(params: &[&str], ret: &str) -> CffiDescriptor {
        CffiDescriptor {
            mangled: format!("f::{}:{}", params.join(""), ret),
            library: "m".to_string(),
            symbol: "f".to_string(),
            param_codes: params.iter().map(|s| s.to_string()).collect(),
            return_code: ret.to_string(),
            resolved_path: String::new(),
        }
    }

    #[test]
    fn test_signature_validation() {
        assert!(validate_signature(&descriptor(&["i", "f"], "i")).is_ok());
        assert!(validate_signature(&descriptor(&["s"], "v")).is_ok());
        assert!(validate_signature(&descriptor(&["i"; 5], "i")).is_err());
        assert!(validate_signature(&descriptor(&["x"], "i")).is_err());
        assert!(validate_signature(&descriptor(&[], "q")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_call_into_libm() {
        let d = CffiDescriptor {
            mangled: "sqrt::f:f".to_string(),
            library: "m".to_string(),
            symbol: "sqrt".to_string(),
            param_codes: vec!["f".to_string()],
            return_code: "f".to_string(),
            resolved_path: String::new(),
        };
        let registry = CffiRegistry::new();
        if registry.bind(&d).is_err() {
            // No libm on this system layout; binding is covered elsewhere.
            return;
        }
        let result = registry.call(&d, &[Value::Float(9.0)]).unwrap();
        match result {
            Value::Float(f) => assert!((f - 3.0).abs() < 1e-9),
            other => panic!("unexpected result {other:?}"),
        }
    }
}
