//! `bytes`: an immutable byte string with a trailing NUL.
//!
//! Embedded zero bytes are allowed; `ob_size` is the length without the
//! terminator.

use std::{
    ffi::{CStr, c_char, c_int},
    fmt::Write,
    mem::offset_of,
    ptr::{self, NonNull},
    sync::atomic::{AtomicI64, Ordering},
};

use crate::{
    errors::{RaiseOr, borrow_arg, c_str_arg, new_ref_or_null},
    exception_private::{ExcType, RunResult},
    gil, heap,
    object::{PyObject, PyTypeObject, PyVarObject, TypeFlags, builtin_type},
    owned::{PyBorrowed, PyOwned},
    py_hash,
    types::Type,
};

#[repr(C)]
#[derive(Debug)]
pub struct PyBytesObject {
    pub ob_base: PyVarObject,
    /// Cached hash; `-1` until first computed.
    pub ob_shash: AtomicI64,
    ob_sval: [u8; 0],
}

#[cfg(target_pointer_width = "64")]
const _: () = assert!(offset_of!(PyBytesObject, ob_sval) == 32);

#[unsafe(no_mangle)]
pub static PyBytes_Type: PyTypeObject = builtin_type!(
    name: c"bytes",
    kind: Type::Bytes,
    basicsize: size_of::<PyBytesObject>(),
    itemsize: 1,
    flags: TypeFlags::BASETYPE.union(TypeFlags::BYTES_SUBCLASS),
    base: ptr::null(),
    dealloc: None,
);

fn data_ptr(obj: *mut PyObject) -> *mut u8 {
    obj.cast::<u8>().wrapping_add(offset_of!(PyBytesObject, ob_sval))
}

/// Allocates a zero-filled `bytes` of `len` bytes.
fn alloc(len: usize) -> RunResult<NonNull<PyObject>> {
    let nitems = len.checked_add(1).ok_or_else(ExcType::memory_error)?;
    let obj = heap::alloc_object(&PyBytes_Type, nitems)?;
    // SAFETY: fresh `PyBytesObject` block; the terminator is already zero.
    unsafe {
        let payload = obj.cast::<PyBytesObject>().as_ptr();
        (*payload).ob_base.ob_size = isize::try_from(len).unwrap_or(isize::MAX);
        (&raw mut (*payload).ob_shash).write(AtomicI64::new(-1));
    }
    Ok(obj)
}

pub fn new(data: &[u8]) -> RunResult<PyOwned> {
    let obj = alloc(data.len())?;
    // SAFETY: the block has room for `data.len()` bytes past the header.
    unsafe {
        ptr::copy_nonoverlapping(data.as_ptr(), data_ptr(obj.as_ptr()), data.len());
        Ok(PyOwned::from_non_null(obj))
    }
}

#[must_use]
pub fn check(obj: PyBorrowed<'_>) -> bool {
    obj.get_type().has_flags(TypeFlags::BYTES_SUBCLASS)
}

/// The contents of a `bytes`, or `None` for other kinds.
#[must_use]
pub fn as_bytes<'a>(obj: PyBorrowed<'a>) -> Option<&'a [u8]> {
    if !check(obj) {
        return None;
    }
    // SAFETY: `bytes` objects hold `ob_size` immutable bytes inline.
    unsafe {
        let len = usize::try_from(obj.payload::<PyBytesObject>().ob_base.ob_size).unwrap_or_default();
        Some(std::slice::from_raw_parts(data_ptr(obj.as_ptr()), len))
    }
}

/// The contents including the terminator, for the `y` format code.
pub(crate) fn as_c_str<'a>(obj: PyBorrowed<'a>) -> Option<&'a CStr> {
    as_bytes(obj)?;
    // SAFETY: the inline data is NUL-terminated.
    Some(unsafe { CStr::from_ptr(data_ptr(obj.as_ptr()).cast::<c_char>()) })
}

fn expect_bytes<'a>(obj: PyBorrowed<'a>) -> RunResult<&'a [u8]> {
    as_bytes(obj).ok_or_else(|| ExcType::type_error(format!("expected bytes, {} found", obj.get_type().name())))
}

pub(crate) fn hash(obj: PyBorrowed<'_>) -> Option<i64> {
    let data = as_bytes(obj)?;
    // SAFETY: `check` passed inside `as_bytes`.
    let cache = &unsafe { obj.payload::<PyBytesObject>() }.ob_shash;
    let cached = cache.load(Ordering::Relaxed);
    if cached != -1 {
        return Some(cached);
    }
    let computed = py_hash::hash_bytes(data);
    cache.store(computed, Ordering::Relaxed);
    Some(computed)
}

/// `b'...'` representation.
#[must_use]
pub fn repr(data: &[u8]) -> String {
    let quote = if data.contains(&b'\'') && !data.contains(&b'"') { b'"' } else { b'\'' };
    let mut out = String::with_capacity(data.len() + 3);
    out.push('b');
    out.push(char::from(quote));
    for &byte in data {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b if b == quote => {
                out.push('\\');
                out.push(char::from(b));
            }
            0x20..0x7f => out.push(char::from(byte)),
            _ => {
                let _ = write!(out, "\\x{byte:02x}");
            }
        }
    }
    out.push(char::from(quote));
    out
}

/// Concatenates two `bytes` objects into a new one.
pub fn concat(left: PyBorrowed<'_>, right: PyBorrowed<'_>) -> RunResult<PyOwned> {
    let (Some(a), Some(b)) = (as_bytes(left), as_bytes(right)) else {
        return Err(ExcType::type_error(format!(
            "can't concat {} to {}",
            right.get_type().name(),
            left.get_type().name()
        )));
    };
    let len = a.len().checked_add(b.len()).ok_or_else(ExcType::memory_error)?;
    let obj = alloc(len)?;
    let dest = data_ptr(obj.as_ptr());
    // SAFETY: `dest` has room for both parts; the sources are distinct live objects.
    unsafe {
        ptr::copy_nonoverlapping(a.as_ptr(), dest, a.len());
        ptr::copy_nonoverlapping(b.as_ptr(), dest.add(a.len()), b.len());
        Ok(PyOwned::from_non_null(obj))
    }
}

// ============================================================================
// Exported API
// ============================================================================

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyBytes_FromString(text: *const c_char) -> *mut PyObject {
    let _gil = gil::acquire();
    // SAFETY: callers pass a NUL-terminated string.
    new_ref_or_null(unsafe { c_str_arg(text) }.and_then(|text| new(text.to_bytes())))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyBytes_FromStringAndSize(data: *const c_char, size: isize) -> *mut PyObject {
    let _gil = gil::acquire();
    let Ok(len) = usize::try_from(size) else {
        ExcType::system_error("Negative size passed to PyBytes_FromStringAndSize").restore();
        return ptr::null_mut();
    };
    if data.is_null() {
        // A null source yields a zero-filled object the caller fills in.
        return new_ref_or_null(alloc(len).map(|obj| {
            // SAFETY: `alloc` returned a fresh object we own.
            unsafe { PyOwned::from_non_null(obj) }
        }));
    }
    // SAFETY: callers pass at least `size` readable bytes.
    let data = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len) };
    new_ref_or_null(new(data))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyBytes_AsString(obj: *mut PyObject) -> *mut c_char {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    let result = unsafe { borrow_arg(obj) }.and_then(|obj| {
        expect_bytes(obj)?;
        Ok(data_ptr(obj.as_ptr()).cast::<c_char>())
    });
    result.or_raise(ptr::null_mut())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyBytes_Size(obj: *mut PyObject) -> isize {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    let result = unsafe { borrow_arg(obj) }
        .and_then(expect_bytes)
        .map(|data| isize::try_from(data.len()).unwrap_or(isize::MAX));
    result.or_raise(-1)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyBytes_Check(obj: *mut PyObject) -> c_int {
    // SAFETY: callers pass null or a live object.
    unsafe { PyBorrowed::from_raw(obj) }.map_or(0, |obj| c_int::from(check(obj)))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyBytes_CheckExact(obj: *mut PyObject) -> c_int {
    // SAFETY: callers pass null or a live object.
    unsafe { PyBorrowed::from_raw(obj) }.map_or(0, |obj| c_int::from(obj.kind() == Type::Bytes))
}

/// Replaces `*target` with `*target + part`.
///
/// Both operands are consumed. On failure `*target` becomes null and the
/// error is set. A null `*target` is left as is and `part` is still released.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyBytes_Concat(target: *mut *mut PyObject, part: *mut PyObject) {
    let _gil = gil::acquire();
    let Some(target) = NonNull::new(target) else {
        ExcType::bad_internal_call().restore();
        return;
    };
    // SAFETY: the caller hands over its references to both operands.
    let (left, right) = unsafe { (PyOwned::from_raw(target.read()), PyOwned::from_raw(part)) };
    let result = match (&left, &right) {
        (None, _) => return,
        (Some(_), None) => Err(ExcType::bad_internal_call()),
        (Some(left), Some(right)) => concat(left.borrow(), right.borrow()),
    };
    drop((left, right));
    // SAFETY: `target` is a valid out-pointer.
    unsafe { target.write(new_ref_or_null(result)) };
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyBytes_ConcatAndDel(target: *mut *mut PyObject, part: *mut PyObject) {
    // SAFETY: forwarded caller contract.
    unsafe { PyBytes_Concat(target, part) }
}
