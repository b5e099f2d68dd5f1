//! `EtchValue` handles: constructors, predicates, extractors.
//!
//! Handles are self-contained trees (deep copies); they never point into a
//! VM heap and may outlive the context. Extractors return 0 on success and
//! non-zero on a type mismatch.

use etch_engine::CValue;
use std::ffi::{c_char, c_int, CStr, CString};

/// Opaque value handle.
#[repr(C)]
pub struct EtchValue {
    _private: [u8; 0],
}

pub(crate) unsafe fn borrow_value<'a>(v: *mut EtchValue) -> Option<&'a CValue> {
    (v as *mut CValue).as_ref()
}

pub(crate) fn export_value(v: CValue) -> *mut EtchValue {
    Box::into_raw(Box::new(v)) as *mut EtchValue
}

/// Consume a handle, returning its value.
pub(crate) unsafe fn import_value(v: *mut EtchValue) -> CValue {
    if v.is_null() {
        return CValue::Nil;
    }
    *Box::from_raw(v as *mut CValue)
}

pub(crate) unsafe fn free_value(v: *mut EtchValue) {
    if !v.is_null() {
        drop(Box::from_raw(v as *mut CValue));
    }
}

// ============================================================================
// Constructors
// ============================================================================

#[no_mangle]
pub extern "C" fn etch_value_nil() -> *mut EtchValue {
    export_value(CValue::Nil)
}

#[no_mangle]
pub extern "C" fn etch_value_bool(v: c_int) -> *mut EtchValue {
    export_value(CValue::Bool(v != 0))
}

#[no_mangle]
pub extern "C" fn etch_value_char(code_point: u32) -> *mut EtchValue {
    export_value(
        char::from_u32(code_point)
            .map(CValue::Char)
            .unwrap_or(CValue::Nil),
    )
}

#[no_mangle]
pub extern "C" fn etch_value_int(v: i64) -> *mut EtchValue {
    export_value(CValue::Int(v))
}

#[no_mangle]
pub extern "C" fn etch_value_float(v: f64) -> *mut EtchValue {
    export_value(CValue::Float(v))
}

/// # Safety
/// `s` must be a valid null-terminated UTF-8 string (NULL gives nil).
#[no_mangle]
pub unsafe extern "C" fn etch_value_string(s: *const c_char) -> *mut EtchValue {
    if s.is_null() {
        return export_value(CValue::Nil);
    }
    match CStr::from_ptr(s).to_str() {
        Ok(text) => export_value(CValue::Str(text.to_string())),
        Err(_) => export_value(CValue::Nil),
    }
}

#[no_mangle]
pub extern "C" fn etch_value_array_new() -> *mut EtchValue {
    export_value(CValue::Array(Vec::new()))
}

/// # Safety
/// `inner` is consumed (do not free it afterwards).
#[no_mangle]
pub unsafe extern "C" fn etch_value_some(inner: *mut EtchValue) -> *mut EtchValue {
    export_value(CValue::Some(Box::new(import_value(inner))))
}

#[no_mangle]
pub extern "C" fn etch_value_none() -> *mut EtchValue {
    export_value(CValue::None)
}

/// # Safety
/// `inner` is consumed.
#[no_mangle]
pub unsafe extern "C" fn etch_value_ok(inner: *mut EtchValue) -> *mut EtchValue {
    export_value(CValue::Ok(Box::new(import_value(inner))))
}

/// # Safety
/// `inner` is consumed.
#[no_mangle]
pub unsafe extern "C" fn etch_value_err(inner: *mut EtchValue) -> *mut EtchValue {
    export_value(CValue::Err(Box::new(import_value(inner))))
}

/// Free a handle.
///
/// # Safety
/// `v` must be a handle from this ABI (or NULL), not freed twice.
#[no_mangle]
pub unsafe extern "C" fn etch_value_free(v: *mut EtchValue) {
    free_value(v)
}

// ============================================================================
// Predicates
// ============================================================================

macro_rules! predicate {
    ($name:ident, $pattern:pat) => {
        /// # Safety
        /// `v` must be a valid handle or NULL.
        #[no_mangle]
        pub unsafe extern "C" fn $name(v: *mut EtchValue) -> c_int {
            matches!(borrow_value(v), Some($pattern)) as c_int
        }
    };
}

predicate!(etch_value_is_nil, CValue::Nil);
predicate!(etch_value_is_bool, CValue::Bool(_));
predicate!(etch_value_is_char, CValue::Char(_));
predicate!(etch_value_is_int, CValue::Int(_));
predicate!(etch_value_is_float, CValue::Float(_));
predicate!(etch_value_is_string, CValue::Str(_));
predicate!(etch_value_is_array, CValue::Array(_));
predicate!(etch_value_is_tuple, CValue::Tuple(_));
predicate!(etch_value_is_some, CValue::Some(_));
predicate!(etch_value_is_none, CValue::None);
predicate!(etch_value_is_ok, CValue::Ok(_));
predicate!(etch_value_is_err, CValue::Err(_));

// ============================================================================
// Extractors
// ============================================================================

/// # Safety
/// `v` must be a valid handle; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn etch_value_get_bool(v: *mut EtchValue, out: *mut c_int) -> c_int {
    match borrow_value(v) {
        Some(CValue::Bool(b)) => {
            if !out.is_null() {
                *out = *b as c_int;
            }
            0
        }
        _ => 1,
    }
}

/// # Safety
/// `v` must be a valid handle; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn etch_value_get_char(v: *mut EtchValue, out: *mut u32) -> c_int {
    match borrow_value(v) {
        Some(CValue::Char(c)) => {
            if !out.is_null() {
                *out = *c as u32;
            }
            0
        }
        _ => 1,
    }
}

/// # Safety
/// `v` must be a valid handle; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn etch_value_get_int(v: *mut EtchValue, out: *mut i64) -> c_int {
    match borrow_value(v) {
        Some(CValue::Int(i)) => {
            if !out.is_null() {
                *out = *i;
            }
            0
        }
        _ => 1,
    }
}

/// # Safety
/// `v` must be a valid handle; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn etch_value_get_float(v: *mut EtchValue, out: *mut f64) -> c_int {
    match borrow_value(v) {
        Some(CValue::Float(f)) => {
            if !out.is_null() {
                *out = *f;
            }
            0
        }
        _ => 1,
    }
}

/// Copy the string into a fresh NUL-terminated buffer; free it with
/// `etch_string_free`.
///
/// # Safety
/// `v` must be a valid handle; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn etch_value_get_string(
    v: *mut EtchValue,
    out: *mut *mut c_char,
) -> c_int {
    match borrow_value(v) {
        Some(CValue::Str(s)) => match CString::new(s.as_str()) {
            Ok(c) => {
                if !out.is_null() {
                    *out = c.into_raw();
                }
                0
            }
            Err(_) => 1,
        },
        _ => 1,
    }
}

/// Free a string returned by `etch_value_get_string`.
///
/// # Safety
/// `s` must come from `etch_value_get_string` (or be NULL).
#[no_mangle]
pub unsafe extern "C" fn etch_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

// ============================================================================
// Arrays
// ============================================================================

/// Element count, or -1 on type mismatch.
///
/// # Safety
/// `v` must be a valid handle or NULL.
#[no_mangle]
pub unsafe extern "C" fn etch_value_array_len(v: *mut EtchValue) -> isize {
    match borrow_value(v) {
        Some(CValue::Array(items)) | Some(CValue::Tuple(items)) => items.len() as isize,
        _ => -1,
    }
}

/// Append an element; the element handle is consumed.
///
/// # Safety
/// `array` must be a valid array handle; `element` a valid handle.
#[no_mangle]
pub unsafe extern "C" fn etch_value_array_push(
    array: *mut EtchValue,
    element: *mut EtchValue,
) -> c_int {
    let Some(slot) = (array as *mut CValue).as_mut() else {
        return 1;
    };
    match slot {
        CValue::Array(items) => {
            items.push(import_value(element));
            0
        }
        _ => 1,
    }
}

/// Copy the element at `index` into a new handle.
///
/// # Safety
/// All pointers must be valid.
#[no_mangle]
pub unsafe extern "C" fn etch_value_array_get(
    array: *mut EtchValue,
    index: usize,
    out: *mut *mut EtchValue,
) -> c_int {
    match borrow_value(array) {
        Some(CValue::Array(items)) | Some(CValue::Tuple(items)) => match items.get(index) {
            Some(item) => {
                if !out.is_null() {
                    *out = export_value(item.clone());
                }
                0
            }
            None => 1,
        },
        _ => 1,
    }
}

// ============================================================================
// Option / result unwrap helpers
// ============================================================================

/// Unwrap `some(x)` or `ok(x)` into a new handle.
///
/// # Safety
/// All pointers must be valid.
#[no_mangle]
pub unsafe extern "C" fn etch_value_unwrap(
    v: *mut EtchValue,
    out: *mut *mut EtchValue,
) -> c_int {
    match borrow_value(v) {
        Some(CValue::Some(inner)) | Some(CValue::Ok(inner)) => {
            if !out.is_null() {
                *out = export_value((**inner).clone());
            }
            0
        }
        _ => 1,
    }
}

/// Unwrap `err(x)` into a new handle.
///
/// # Safety
/// All pointers must be valid.
#[no_mangle]
pub unsafe extern "C" fn etch_value_unwrap_err(
    v: *mut EtchValue,
    out: *mut *mut EtchValue,
) -> c_int {
    match borrow_value(v) {
        Some(CValue::Err(inner)) => {
            if !out.is_null() {
                *out = export_value((**inner).clone());
            }
            0
        }
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_primitive_handles() {
        unsafe {
            let v = etch_value_int(42);
            assert_eq!(etch_value_is_int(v), 1);
            assert_eq!(etch_value_is_float(v), 0);
            let mut out = 0i64;
            assert_eq!(etch_value_get_int(v, &mut out), 0);
            assert_eq!(out, 42);
            let mut f = 0f64;
            assert_eq!(etch_value_get_float(v, &mut f), 1);
            etch_value_free(v);
        }
    }

    #[test]
    fn test_string_round_trip() {
        unsafe {
            let text = CString::new("etch").unwrap();
            let v = etch_value_string(text.as_ptr());
            assert_eq!(etch_value_is_string(v), 1);
            let mut out: *mut c_char = ptr::null_mut();
            assert_eq!(etch_value_get_string(v, &mut out), 0);
            assert_eq!(CStr::from_ptr(out).to_str().unwrap(), "etch");
            etch_string_free(out);
            etch_value_free(v);
        }
    }

    #[test]
    fn test_array_building() {
        unsafe {
            let arr = etch_value_array_new();
            for i in 0..3 {
                assert_eq!(etch_value_array_push(arr, etch_value_int(i)), 0);
            }
            assert_eq!(etch_value_array_len(arr), 3);
            let mut item: *mut EtchValue = ptr::null_mut();
            assert_eq!(etch_value_array_get(arr, 2, &mut item), 0);
            let mut v = 0i64;
            assert_eq!(etch_value_get_int(item, &mut v), 0);
            assert_eq!(v, 2);
            etch_value_free(item);
            etch_value_free(arr);
        }
    }

    #[test]
    fn test_option_result_unwrap() {
        unsafe {
            let some = etch_value_some(etch_value_int(7));
            assert_eq!(etch_value_is_some(some), 1);
            let mut out: *mut EtchValue = ptr::null_mut();
            assert_eq!(etch_value_unwrap(some, &mut out), 0);
            let mut v = 0i64;
            assert_eq!(etch_value_get_int(out, &mut v), 0);
            assert_eq!(v, 7);
            etch_value_free(out);
            etch_value_free(some);

            let err = etch_value_err(etch_value_string(
                CString::new("bad").unwrap().as_ptr(),
            ));
            assert_eq!(etch_value_is_err(err), 1);
            assert_eq!(etch_value_unwrap(err, &mut out), 1);
            assert_eq!(etch_value_unwrap_err(err, &mut out), 0);
            etch_value_free(out);
            etch_value_free(err);
        }
    }
}
