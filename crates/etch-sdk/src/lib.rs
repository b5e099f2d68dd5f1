//! C embedding ABI for the Etch engine.
//!
//! Opaque-handle surface over `etch_engine::embed::Context`:
//! - contexts are created/freed by the host and are not thread-safe
//! - values cross the boundary as `EtchValue` handles (self-contained deep
//!   copies; never views into the VM heap)
//! - integer-returning functions use 0 for success and non-zero for failure,
//!   with the message retrievable through `etch_get_error`
//! - every handle returned to the host must be freed with the matching
//!   `*_free` function

mod value;

pub use value::*;

use etch_engine::vm::StepInfo;
use etch_engine::{Context, ContextOptions, CValue};
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::Path;
use std::ptr;

/// Opaque context handle.
#[repr(C)]
pub struct EtchContext {
    _private: [u8; 0],
}

/// Context construction options. Zero-initialized fields give the defaults.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EtchOptions {
    pub verbose: c_int,
    pub debug: c_int,
    pub release: c_int,
    pub opt_level: u8,
    /// 0 keeps the engine default (1000 operations)
    pub gc_cycle_interval: u64,
    /// -1 = use `ETCH_DEBUG_PORT`
    pub debug_port: i32,
}

/// GC statistics snapshot.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct EtchGcStats {
    pub collections: u64,
    pub cells_freed: u64,
    pub gc_time_us: u64,
    pub total_gc_time_us: u64,
    pub heap_cells: u64,
    pub dirty_cells: u64,
}

/// Host callback: receives marshalled argument handles (borrowed; do not
/// free) and returns a new handle (ownership transfers to the VM), or NULL
/// for nil.
pub type EtchHostFn = extern "C" fn(
    args: *const *mut EtchValue,
    arg_count: usize,
    user_data: *mut c_void,
) -> *mut EtchValue;

/// Per-instruction callback; return non-zero to cancel execution.
pub type EtchStepFn = extern "C" fn(
    pc: usize,
    call_depth: usize,
    instruction_count: u64,
    user_data: *mut c_void,
) -> c_int;

pub(crate) struct ContextHandle {
    pub(crate) ctx: Context,
    /// Keeps the pointer from `etch_get_error` alive until the next call
    error_cstr: Option<CString>,
}

pub(crate) unsafe fn context<'a>(ctx: *mut EtchContext) -> Option<&'a mut ContextHandle> {
    (ctx as *mut ContextHandle).as_mut()
}

unsafe fn cstr<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    CStr::from_ptr(s).to_str().ok()
}

// ============================================================================
// Context lifecycle
// ============================================================================

/// Create a context with default options.
///
/// # Safety
/// The returned context must be freed with `etch_free`.
#[no_mangle]
pub unsafe extern "C" fn etch_new_context() -> *mut EtchContext {
    let handle = Box::new(ContextHandle {
        ctx: Context::new(ContextOptions::default()),
        error_cstr: None,
    });
    Box::into_raw(handle) as *mut EtchContext
}

/// Create a context with explicit options.
///
/// # Safety
/// `options` must be null or point to a valid `EtchOptions`.
#[no_mangle]
pub unsafe extern "C" fn etch_new_context_with_options(
    options: *const EtchOptions,
) -> *mut EtchContext {
    let opts = match options.as_ref() {
        Some(o) => ContextOptions {
            verbose: o.verbose != 0,
            debug: o.debug != 0,
            release: o.release != 0,
            opt_level: o.opt_level,
            gc_cycle_interval: if o.gc_cycle_interval == 0 {
                ContextOptions::default().gc_cycle_interval
            } else {
                o.gc_cycle_interval
            },
            debug_port: u16::try_from(o.debug_port).ok(),
        },
        None => ContextOptions::default(),
    };
    let handle = Box::new(ContextHandle {
        ctx: Context::new(opts),
        error_cstr: None,
    });
    Box::into_raw(handle) as *mut EtchContext
}

/// Destroy a context and every resource it owns.
///
/// # Safety
/// `ctx` must be a pointer from `etch_new_context*`, not used afterwards.
#[no_mangle]
pub unsafe extern "C" fn etch_free(ctx: *mut EtchContext) {
    if ctx.is_null() {
        return;
    }
    drop(Box::from_raw(ctx as *mut ContextHandle));
}

// ============================================================================
// Errors
// ============================================================================

/// Latest error message, or NULL. The pointer is valid until the next API
/// call on this context.
///
/// # Safety
/// `ctx` must be a valid context handle.
#[no_mangle]
pub unsafe extern "C" fn etch_get_error(ctx: *mut EtchContext) -> *const c_char {
    let Some(handle) = context(ctx) else {
        return ptr::null();
    };
    match handle.ctx.get_error() {
        Some(message) => {
            handle.error_cstr = CString::new(message).ok();
            handle
                .error_cstr
                .as_ref()
                .map(|c| c.as_ptr())
                .unwrap_or(ptr::null())
        }
        None => ptr::null(),
    }
}

/// Clear the per-context error slot.
///
/// # Safety
/// `ctx` must be a valid context handle.
#[no_mangle]
pub unsafe extern "C" fn etch_clear_error(ctx: *mut EtchContext) {
    if let Some(handle) = context(ctx) {
        handle.ctx.clear_error();
        handle.error_cstr = None;
    }
}

// ============================================================================
// Compilation & execution
// ============================================================================

/// Compile source text. Returns 0 on success.
///
/// # Safety
/// `ctx`, `source`, and `filename` must be valid; strings null-terminated.
#[no_mangle]
pub unsafe extern "C" fn etch_compile_string(
    ctx: *mut EtchContext,
    source: *const c_char,
    filename: *const c_char,
) -> c_int {
    let Some(handle) = context(ctx) else { return 1 };
    let (Some(source), Some(filename)) = (cstr(source), cstr(filename)) else {
        return 1;
    };
    match handle.ctx.compile_str(source, filename) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Compile a source file (with bytecode cache). Returns 0 on success.
///
/// # Safety
/// `ctx` and `path` must be valid; `path` null-terminated.
#[no_mangle]
pub unsafe extern "C" fn etch_compile_file(ctx: *mut EtchContext, path: *const c_char) -> c_int {
    let Some(handle) = context(ctx) else { return 1 };
    let Some(path) = cstr(path) else { return 1 };
    match handle.ctx.compile_file(Path::new(path)) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Run `main`. On success writes its integer result (0 for void) into
/// `exit_code` when non-null and returns 0.
///
/// # Safety
/// `ctx` must be valid; `exit_code` null or writable.
#[no_mangle]
pub unsafe extern "C" fn etch_execute(ctx: *mut EtchContext, exit_code: *mut i64) -> c_int {
    let Some(handle) = context(ctx) else { return 1 };
    match handle.ctx.execute() {
        Ok(value) => {
            if !exit_code.is_null() {
                *exit_code = match value {
                    CValue::Int(v) => v,
                    _ => 0,
                };
            }
            0
        }
        Err(_) => 1,
    }
}

/// Call a function by fully-qualified key (or unambiguous plain name).
/// Argument handles are borrowed. On success writes a new result handle.
///
/// # Safety
/// All pointers must be valid; `args` must point to `arg_count` handles.
#[no_mangle]
pub unsafe extern "C" fn etch_call_function(
    ctx: *mut EtchContext,
    name: *const c_char,
    args: *const *mut EtchValue,
    arg_count: usize,
    result: *mut *mut EtchValue,
) -> c_int {
    let Some(handle) = context(ctx) else { return 1 };
    let Some(name) = cstr(name) else { return 1 };
    let mut values = Vec::with_capacity(arg_count);
    for i in 0..arg_count {
        match value::borrow_value(*args.add(i)) {
            Some(v) => values.push(v.clone()),
            None => return 1,
        }
    }
    match handle.ctx.call_function(name, &values) {
        Ok(out) => {
            if !result.is_null() {
                *result = value::export_value(out);
            }
            0
        }
        Err(_) => 1,
    }
}

// ============================================================================
// Globals
// ============================================================================

/// Set (or override) a global. The value handle is borrowed.
///
/// # Safety
/// All pointers must be valid.
#[no_mangle]
pub unsafe extern "C" fn etch_set_global(
    ctx: *mut EtchContext,
    name: *const c_char,
    value: *mut EtchValue,
) -> c_int {
    let Some(handle) = context(ctx) else { return 1 };
    let Some(name) = cstr(name) else { return 1 };
    let Some(v) = value::borrow_value(value) else {
        return 1;
    };
    handle.ctx.set_global(name, v.clone());
    0
}

/// Read a global into a new handle. Returns 0 on success.
///
/// # Safety
/// All pointers must be valid.
#[no_mangle]
pub unsafe extern "C" fn etch_get_global(
    ctx: *mut EtchContext,
    name: *const c_char,
    result: *mut *mut EtchValue,
) -> c_int {
    let Some(handle) = context(ctx) else { return 1 };
    let Some(name) = cstr(name) else { return 1 };
    match handle.ctx.get_global(name) {
        Some(v) => {
            if !result.is_null() {
                *result = value::export_value(v);
            }
            0
        }
        None => 1,
    }
}

// ============================================================================
// Host functions
// ============================================================================

/// Register a host callback dispatched synchronously when the VM calls
/// `name`. Argument handles passed to the callback are borrowed; its return
/// handle transfers to the VM (NULL = nil).
///
/// # Safety
/// `ctx`/`name` must be valid; `callback` must stay callable and `user_data`
/// valid for the context's lifetime.
#[no_mangle]
pub unsafe extern "C" fn etch_register_function(
    ctx: *mut EtchContext,
    name: *const c_char,
    callback: EtchHostFn,
    user_data: *mut c_void,
) -> c_int {
    let Some(handle) = context(ctx) else { return 1 };
    let Some(name) = cstr(name) else { return 1 };

    // The raw user pointer rides inside the closure; the context is single-
    // threaded by contract.
    struct UserData(*mut c_void);
    let user = UserData(user_data);

    handle.ctx.register_function(
        name,
        Box::new(move |args: &[CValue]| {
            let handles: Vec<*mut EtchValue> = args
                .iter()
                .map(|v| value::export_value(v.clone()))
                .collect();
            let result = callback(handles.as_ptr(), handles.len(), user.0);
            for h in handles {
                value::free_value(h);
            }
            if result.is_null() {
                return Ok(CValue::Nil);
            }
            Ok(value::import_value(result))
        }),
    );
    0
}

// ============================================================================
// VM inspection
// ============================================================================

/// Current program counter (0 when no VM is live).
///
/// # Safety
/// `ctx` must be a valid context handle.
#[no_mangle]
pub unsafe extern "C" fn etch_current_pc(ctx: *mut EtchContext) -> usize {
    context(ctx).map(|h| h.ctx.current_pc()).unwrap_or(0)
}

/// Current call-stack depth.
///
/// # Safety
/// `ctx` must be a valid context handle.
#[no_mangle]
pub unsafe extern "C" fn etch_call_depth(ctx: *mut EtchContext) -> usize {
    context(ctx).map(|h| h.ctx.call_depth()).unwrap_or(0)
}

/// Total executed instructions.
///
/// # Safety
/// `ctx` must be a valid context handle.
#[no_mangle]
pub unsafe extern "C" fn etch_instruction_count(ctx: *mut EtchContext) -> u64 {
    context(ctx).map(|h| h.ctx.instruction_count()).unwrap_or(0)
}

/// Copy the current function's mangled name into `buffer` (NUL-terminated,
/// truncated to `len`). Returns the untruncated length.
///
/// # Safety
/// `buffer` must be writable for `len` bytes (or null with len 0).
#[no_mangle]
pub unsafe extern "C" fn etch_current_function(
    ctx: *mut EtchContext,
    buffer: *mut c_char,
    len: usize,
) -> usize {
    let name = context(ctx)
        .map(|h| h.ctx.current_function_name())
        .unwrap_or_default();
    if !buffer.is_null() && len > 0 {
        let bytes = name.as_bytes();
        let n = bytes.len().min(len - 1);
        ptr::copy_nonoverlapping(bytes.as_ptr(), buffer as *mut u8, n);
        *buffer.add(n) = 0;
    }
    name.len()
}

/// Width of the current frame's register window.
///
/// # Safety
/// `ctx` must be a valid context handle.
#[no_mangle]
pub unsafe extern "C" fn etch_register_count(ctx: *mut EtchContext) -> usize {
    context(ctx).map(|h| h.ctx.register_count()).unwrap_or(0)
}

/// Marshal one register of the current frame into a new handle. Returns 0 on
/// success.
///
/// # Safety
/// `ctx` must be valid; `result` null or writable.
#[no_mangle]
pub unsafe extern "C" fn etch_get_register(
    ctx: *mut EtchContext,
    index: usize,
    result: *mut *mut EtchValue,
) -> c_int {
    let Some(handle) = context(ctx) else { return 1 };
    match handle.ctx.register_value(index) {
        Some(v) => {
            if !result.is_null() {
                *result = value::export_value(v);
            }
            0
        }
        None => 1,
    }
}

/// Install a per-instruction callback; non-zero return cancels execution
/// (pending defers still run).
///
/// # Safety
/// `callback` must stay callable and `user_data` valid while the context
/// lives.
#[no_mangle]
pub unsafe extern "C" fn etch_set_step_callback(
    ctx: *mut EtchContext,
    callback: EtchStepFn,
    user_data: *mut c_void,
) -> c_int {
    let Some(handle) = context(ctx) else { return 1 };
    struct UserData(*mut c_void);
    let user = UserData(user_data);
    handle.ctx.set_step_callback(Box::new(move |info: &StepInfo| {
        callback(info.pc, info.depth, info.instruction_count, user.0)
    }));
    0
}

// ============================================================================
// Frame budgeting
// ============================================================================

/// Reset the per-frame GC budget (microseconds; 0 = adaptive only).
///
/// # Safety
/// `ctx` must be a valid context handle.
#[no_mangle]
pub unsafe extern "C" fn etch_begin_frame(ctx: *mut EtchContext, budget_us: u64) {
    if let Some(handle) = context(ctx) {
        handle.ctx.begin_frame(budget_us);
    }
}

/// Snapshot collector statistics.
///
/// # Safety
/// `ctx` must be valid; `stats` null or writable.
#[no_mangle]
pub unsafe extern "C" fn etch_gc_stats(ctx: *mut EtchContext, stats: *mut EtchGcStats) {
    let Some(handle) = context(ctx) else { return };
    if stats.is_null() {
        return;
    }
    let s = handle.ctx.gc_stats();
    *stats = EtchGcStats {
        collections: s.collections,
        cells_freed: s.cells_freed,
        gc_time_us: s.gc_time_us,
        total_gc_time_us: s.total_gc_time_us,
        heap_cells: s.heap_cells,
        dirty_cells: s.dirty_cells,
    };
}

/// Whether the dirty set has outgrown the high-water mark and the host should
/// grant a full collection frame.
///
/// # Safety
/// `ctx` must be a valid context handle.
#[no_mangle]
pub unsafe extern "C" fn etch_heap_needs_collection(ctx: *mut EtchContext) -> c_int {
    context(ctx)
        .map(|h| h.ctx.heap_needs_collection() as c_int)
        .unwrap_or(0)
}

// ============================================================================
// Debug server
// ============================================================================

/// Serve the inline (stdio) DAP session. Blocks until the client disconnects;
/// call from a dedicated host thread before `etch_execute`.
///
/// # Safety
/// `ctx` must be a valid context handle.
#[no_mangle]
pub unsafe extern "C" fn etch_debug_serve_stdio(ctx: *mut EtchContext) {
    if let Some(handle) = context(ctx) {
        handle.ctx.serve_debug_stdio();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etch_engine::ast::builder::*;
    use etch_engine::ast::{BinOp, Type};
    use etch_engine::Program;

    unsafe fn compile(ctx: *mut EtchContext, program: Program) {
        let handle = context(ctx).unwrap();
        handle.ctx.compile_ast(program).unwrap();
    }

    #[test]
    fn test_context_lifecycle_and_execute() {
        unsafe {
            let ctx = etch_new_context();
            let mut program = Program::new();
            program.add_function(func(
                "main",
                vec![],
                Type::Int,
                vec![ret(binary(BinOp::Add, int(40), int(2)))],
            ));
            compile(ctx, program);

            let mut exit_code = 0i64;
            assert_eq!(etch_execute(ctx, &mut exit_code), 0);
            assert_eq!(exit_code, 42);
            assert!(etch_get_error(ctx).is_null());
            etch_free(ctx);
        }
    }

    #[test]
    fn test_global_round_trip_through_abi() {
        unsafe {
            let ctx = etch_new_context();
            let n = etch_value_int(42);
            let name = CString::new("n").unwrap();
            assert_eq!(etch_set_global(ctx, name.as_ptr(), n), 0);
            etch_value_free(n);

            let mut program = Program::new();
            program.add_function(func("main", vec![], Type::Int, vec![ret(var("n"))]));
            compile(ctx, program);

            let mut exit_code = 0i64;
            assert_eq!(etch_execute(ctx, &mut exit_code), 0);
            assert_eq!(exit_code, 42);

            let mut out: *mut EtchValue = ptr::null_mut();
            assert_eq!(etch_get_global(ctx, name.as_ptr(), &mut out), 0);
            let mut value = 0i64;
            assert_eq!(etch_value_get_int(out, &mut value), 0);
            assert_eq!(value, 42);
            etch_value_free(out);
            etch_free(ctx);
        }
    }

    #[test]
    fn test_host_function_through_abi() {
        extern "C" fn double_it(
            args: *const *mut EtchValue,
            arg_count: usize,
            _user: *mut c_void,
        ) -> *mut EtchValue {
            unsafe {
                if arg_count != 1 {
                    return ptr::null_mut();
                }
                let mut v = 0i64;
                if etch_value_get_int(*args, &mut v) != 0 {
                    return ptr::null_mut();
                }
                etch_value_int(v * 2)
            }
        }

        unsafe {
            let ctx = etch_new_context();
            let name = CString::new("doubleIt").unwrap();
            assert_eq!(
                etch_register_function(ctx, name.as_ptr(), double_it, ptr::null_mut()),
                0
            );

            let mut program = Program::new();
            let mut host_decl = func("doubleIt", vec![param("n", Type::Int)], Type::Int, vec![]);
            host_decl.flags.host = true;
            program.add_function(host_decl);
            program.add_function(func(
                "main",
                vec![],
                Type::Int,
                vec![ret(call("doubleIt", vec![int(21)]))],
            ));
            compile(ctx, program);

            let mut exit_code = 0i64;
            assert_eq!(etch_execute(ctx, &mut exit_code), 0);
            assert_eq!(exit_code, 42);
            etch_free(ctx);
        }
    }

    #[test]
    fn test_error_surfaces_through_abi() {
        unsafe {
            let ctx = etch_new_context();
            let handle = context(ctx).unwrap();
            let mut program = Program::new();
            program.add_function(func(
                "main",
                vec![],
                Type::Void,
                vec![
                    let_stmt("x", Type::Int, int(5)),
                    expr_stmt(call("print", vec![int(0)])),
                ],
            ));
            assert!(handle.ctx.compile_ast(program).is_err());

            let err = etch_get_error(ctx);
            assert!(!err.is_null());
            let text = CStr::from_ptr(err).to_string_lossy();
            assert!(text.contains("unused variable 'x'"), "got: {text}");

            etch_clear_error(ctx);
            assert!(etch_get_error(ctx).is_null());
            etch_free(ctx);
        }
    }

    #[test]
    fn test_call_function_through_abi() {
        unsafe {
            let ctx = etch_new_context();
            let mut program = Program::new();
            program.add_function(func(
                "triple",
                vec![param("n", Type::Int)],
                Type::Int,
                vec![ret(binary(BinOp::Mul, var("n"), int(3)))],
            ));
            program.add_function(func("main", vec![], Type::Int, vec![ret(int(0))]));
            compile(ctx, program);

            let name = CString::new("triple").unwrap();
            let arg = etch_value_int(14);
            let args = [arg];
            let mut out: *mut EtchValue = ptr::null_mut();
            assert_eq!(
                etch_call_function(ctx, name.as_ptr(), args.as_ptr(), 1, &mut out),
                0
            );
            let mut v = 0i64;
            assert_eq!(etch_value_get_int(out, &mut v), 0);
            assert_eq!(v, 42);
            etch_value_free(arg);
            etch_value_free(out);
            etch_free(ctx);
        }
    }
}
