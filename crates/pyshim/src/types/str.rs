//! `str`: immutable UTF-8 text with a trailing NUL.
//!
//! The text is stored inline after the header so `PyUnicode_AsUTF8` can hand
//! out a pointer that lives as long as the object. The code point count is
//! computed once at construction.

use std::{
    ffi::{CStr, c_char, c_int},
    mem::offset_of,
    ptr,
    sync::atomic::{AtomicI64, Ordering},
};

use crate::{
    errors::{RaiseOr, borrow_arg, new_ref_or_null},
    exception_private::{ExcType, RunError, RunResult},
    gil, heap,
    object::{PyObject, PyTypeObject, TypeFlags, builtin_type},
    owned::{PyBorrowed, PyOwned},
    py_hash,
    types::Type,
};

#[repr(C)]
#[derive(Debug)]
pub struct PyUnicodeObject {
    pub ob_base: PyObject,
    /// Length in code points.
    pub length: isize,
    /// Length of the UTF-8 encoding, excluding the NUL.
    pub utf8_length: isize,
    /// Cached hash; `-1` until first computed.
    pub hash: AtomicI64,
    data: [u8; 0],
}

#[unsafe(no_mangle)]
pub static PyUnicode_Type: PyTypeObject = builtin_type!(
    name: c"str",
    kind: Type::Str,
    basicsize: size_of::<PyUnicodeObject>(),
    itemsize: 1,
    flags: TypeFlags::BASETYPE.union(TypeFlags::UNICODE_SUBCLASS),
    base: ptr::null(),
    dealloc: None,
);

fn data_ptr(obj: *mut PyObject) -> *mut u8 {
    obj.cast::<u8>().wrapping_add(offset_of!(PyUnicodeObject, data))
}

/// Creates a `str` from valid UTF-8.
pub fn new(text: &str) -> RunResult<PyOwned> {
    let len = text.len();
    let nitems = len.checked_add(1).ok_or_else(ExcType::memory_error)?;
    let obj = heap::alloc_object(&PyUnicode_Type, nitems)?;
    let raw = obj.as_ptr();
    // SAFETY: the block holds the header plus `len + 1` data bytes and is zeroed,
    // so the NUL terminator is already in place.
    unsafe {
        let payload = raw.cast::<PyUnicodeObject>();
        (&raw mut (*payload).length).write(isize::try_from(text.chars().count()).unwrap_or(isize::MAX));
        (&raw mut (*payload).utf8_length).write(isize::try_from(len).unwrap_or(isize::MAX));
        (&raw mut (*payload).hash).write(AtomicI64::new(-1));
        ptr::copy_nonoverlapping(text.as_ptr(), data_ptr(raw), len);
        Ok(PyOwned::from_non_null(obj))
    }
}

/// Decodes UTF-8, raising `UnicodeDecodeError` on malformed input.
pub fn from_utf8(bytes: &[u8]) -> RunResult<PyOwned> {
    match std::str::from_utf8(bytes) {
        Ok(text) => new(text),
        Err(err) => Err(decode_error(bytes, &err)),
    }
}

fn decode_error(bytes: &[u8], err: &std::str::Utf8Error) -> RunError {
    let start = err.valid_up_to();
    let byte = bytes.get(start).copied().unwrap_or_default();
    let message = match err.error_len() {
        None if bytes.len() - start > 1 => format!(
            "'utf-8' codec can't decode bytes in position {start}-{}: unexpected end of data",
            bytes.len() - 1
        ),
        None => format!("'utf-8' codec can't decode byte 0x{byte:02x} in position {start}: unexpected end of data"),
        Some(_) => {
            let reason = if matches!(byte, 0x80..=0xC1 | 0xF5..=0xFF) {
                "invalid start byte"
            } else {
                "invalid continuation byte"
            };
            format!("'utf-8' codec can't decode byte 0x{byte:02x} in position {start}: {reason}")
        }
    };
    ExcType::UnicodeDecodeError.with_message(message)
}

#[must_use]
pub fn check(obj: PyBorrowed<'_>) -> bool {
    obj.get_type().has_flags(TypeFlags::UNICODE_SUBCLASS)
}

/// The text of a `str`, or `None` for other kinds.
#[must_use]
pub fn as_str<'a>(obj: PyBorrowed<'a>) -> Option<&'a str> {
    if !check(obj) {
        return None;
    }
    // SAFETY: `str` objects hold `utf8_length` bytes of valid UTF-8 inline,
    // immutable for the object's lifetime.
    unsafe {
        let payload = obj.payload::<PyUnicodeObject>();
        let len = usize::try_from(payload.utf8_length).unwrap_or_default();
        let bytes = std::slice::from_raw_parts(data_ptr(obj.as_ptr()), len);
        Some(std::str::from_utf8_unchecked(bytes))
    }
}

/// `str` text, raising `TypeError` for other kinds.
pub fn expect_str<'a>(obj: PyBorrowed<'a>) -> RunResult<&'a str> {
    as_str(obj).ok_or_else(|| ExcType::type_error("bad argument type for built-in operation"))
}

/// Hash of a `str`, cached after the first call.
pub(crate) fn hash(obj: PyBorrowed<'_>) -> Option<i64> {
    let text = as_str(obj)?;
    // SAFETY: `check` passed inside `as_str`.
    let cache = &unsafe { obj.payload::<PyUnicodeObject>() }.hash;
    let cached = cache.load(Ordering::Relaxed);
    if cached != -1 {
        return Some(cached);
    }
    let computed = py_hash::hash_bytes(text.as_bytes());
    cache.store(computed, Ordering::Relaxed);
    Some(computed)
}

/// Python-style quoted representation.
#[must_use]
pub fn repr(text: &str) -> String {
    let quote = if text.contains('\'') && !text.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if u32::from(c) < 0x20 || u32::from(c) == 0x7f => {
                out.push_str(&format!("\\x{:02x}", u32::from(c)));
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

// ============================================================================
// Exported API
// ============================================================================

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyUnicode_FromString(text: *const c_char) -> *mut PyObject {
    let _gil = gil::acquire();
    // SAFETY: callers pass a NUL-terminated string.
    let result = unsafe { crate::errors::c_str_arg(text) }.and_then(|text| from_utf8(text.to_bytes()));
    new_ref_or_null(result)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyUnicode_FromStringAndSize(text: *const c_char, size: isize) -> *mut PyObject {
    let _gil = gil::acquire();
    let result = (|| {
        let len = usize::try_from(size)
            .map_err(|_| ExcType::system_error("Negative size passed to PyUnicode_FromStringAndSize"))?;
        if len == 0 {
            return new("");
        }
        if text.is_null() {
            return Err(ExcType::bad_internal_call());
        }
        // SAFETY: callers pass at least `size` readable bytes.
        from_utf8(unsafe { std::slice::from_raw_parts(text.cast::<u8>(), len) })
    })();
    new_ref_or_null(result)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyUnicode_AsUTF8AndSize(obj: *mut PyObject, size: *mut isize) -> *const c_char {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    let result = unsafe { borrow_arg(obj) }.and_then(|obj| {
        let text = expect_str(obj)?;
        if !size.is_null() {
            // SAFETY: callers pass a writable out-pointer or null.
            unsafe { size.write(isize::try_from(text.len()).unwrap_or(isize::MAX)) };
        }
        Ok(data_ptr(obj.as_ptr()).cast_const().cast::<c_char>())
    });
    result.or_raise(ptr::null())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyUnicode_AsUTF8(obj: *mut PyObject) -> *const c_char {
    // SAFETY: forwarded caller contract.
    unsafe { PyUnicode_AsUTF8AndSize(obj, ptr::null_mut()) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyUnicode_GetLength(obj: *mut PyObject) -> isize {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    let result = unsafe { borrow_arg(obj) }.and_then(|obj| {
        expect_str(obj)?;
        // SAFETY: `expect_str` verified the kind.
        Ok(unsafe { obj.payload::<PyUnicodeObject>() }.length)
    });
    result.or_raise(-1)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyUnicode_Check(obj: *mut PyObject) -> c_int {
    // SAFETY: callers pass null or a live object.
    unsafe { PyBorrowed::from_raw(obj) }.map_or(0, |obj| c_int::from(check(obj)))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyUnicode_CheckExact(obj: *mut PyObject) -> c_int {
    // SAFETY: callers pass null or a live object.
    unsafe { PyBorrowed::from_raw(obj) }.map_or(0, |obj| c_int::from(obj.kind() == Type::Str))
}

/// Borrowed C view of a `str`, used by the `s`/`z` format codes.
pub(crate) fn as_c_str<'a>(obj: PyBorrowed<'a>) -> Option<&'a CStr> {
    as_str(obj)?;
    // SAFETY: the inline data is NUL-terminated.
    Some(unsafe { CStr::from_ptr(data_ptr(obj.as_ptr()).cast::<c_char>()) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repr_escapes_and_picks_quotes() {
        assert_eq!(repr("abc"), "'abc'");
        assert_eq!(repr("it's"), "\"it's\"");
        assert_eq!(repr("a\nb"), "'a\\nb'");
        assert_eq!(repr("q'\""), "'q\\'\"'");
    }

    #[test]
    fn decode_errors_name_the_byte() {
        let _gil = gil::acquire();
        let err = from_utf8(b"ab\xff").unwrap_err();
        assert_eq!(
            err.to_string(),
            "UnicodeDecodeError: 'utf-8' codec can't decode byte 0xff in position 2: invalid start byte"
        );
        let err = from_utf8(b"\xe2\x28\xa1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "UnicodeDecodeError: 'utf-8' codec can't decode byte 0xe2 in position 0: invalid continuation byte"
        );
        let err = from_utf8(b"\xe2\x82").unwrap_err();
        assert_eq!(
            err.to_string(),
            "UnicodeDecodeError: 'utf-8' codec can't decode bytes in position 0-1: unexpected end of data"
        );
    }

    #[test]
    fn text_round_trips_with_code_point_length() {
        let _gil = gil::acquire();
        let obj = new("héllo").unwrap();
        assert_eq!(as_str(obj.borrow()), Some("héllo"));
        assert_eq!(as_c_str(obj.borrow()).unwrap().to_bytes(), "héllo".as_bytes());
        // SAFETY: `obj` is a live str.
        assert_eq!(unsafe { PyUnicode_GetLength(obj.as_ptr()) }, 5);
        assert_eq!(hash(obj.borrow()), hash(obj.borrow()));
    }
}
