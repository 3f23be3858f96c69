//! `float`: an immutable IEEE-754 double.

use std::{
    ffi::c_int,
    fmt::Write,
    ptr,
};

use crate::{
    errors::{RaiseOr, borrow_arg, new_ref_or_null},
    exception_private::{ExcType, RunResult},
    gil, heap,
    object::{PyObject, PyTypeObject, TypeFlags, builtin_type},
    owned::{PyBorrowed, PyOwned},
    types::{Type, long},
};

#[repr(C)]
#[derive(Debug)]
pub struct PyFloatObject {
    pub ob_base: PyObject,
    pub ob_fval: f64,
}

#[unsafe(no_mangle)]
pub static PyFloat_Type: PyTypeObject = builtin_type!(
    name: c"float",
    kind: Type::Float,
    basicsize: size_of::<PyFloatObject>(),
    itemsize: 0,
    flags: TypeFlags::BASETYPE,
    base: ptr::null(),
    dealloc: None,
);

pub fn new(value: f64) -> RunResult<PyOwned> {
    let obj = heap::alloc_object(&PyFloat_Type, 0)?;
    // SAFETY: `obj` is a fresh `PyFloatObject` block.
    unsafe {
        (*obj.cast::<PyFloatObject>().as_ptr()).ob_fval = value;
        Ok(PyOwned::from_non_null(obj))
    }
}

/// The payload of a `float`, or `None` for other kinds.
#[must_use]
pub fn value(obj: PyBorrowed<'_>) -> Option<f64> {
    if obj.get_type().is_subtype_of(&PyFloat_Type) {
        // SAFETY: the kind check guarantees the `PyFloatObject` layout.
        Some(unsafe { obj.payload::<PyFloatObject>() }.ob_fval)
    } else {
        None
    }
}

/// Coerces a float or an int to `f64`.
pub fn as_f64(obj: PyBorrowed<'_>) -> RunResult<f64> {
    long::number_as_f64(obj).unwrap_or_else(|| {
        Err(ExcType::type_error(format!(
            "must be real number, not {}",
            obj.get_type().name()
        )))
    })
}

/// Shortest round-tripping text, formatted the way Python's `repr(float)` is.
#[must_use]
pub fn repr(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_owned();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_owned();
    }
    let mut buffer = ryu::Buffer::new();
    let shortest = buffer.format_finite(value);
    let (negative, unsigned) = match shortest.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, shortest),
    };
    let (mantissa, exponent) = match unsigned.split_once('e') {
        Some((mantissa, exponent)) => (mantissa, exponent.parse::<i32>().unwrap_or_default()),
        None => (unsigned, 0),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let all_digits: String = int_part.chars().chain(frac_part.chars()).collect();
    let leading_zeros = all_digits.len() - all_digits.trim_start_matches('0').len();
    let digits = all_digits.trim_start_matches('0').trim_end_matches('0');

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    if digits.is_empty() {
        out.push_str("0.0");
        return out;
    }
    let int_len = i32::try_from(int_part.len()).unwrap_or(i32::MAX);
    let zeros = i32::try_from(leading_zeros).unwrap_or(i32::MAX);
    // value == d.ddd * 10^exp10
    let exp10 = int_len - 1 - zeros + exponent;
    let n = digits.len();
    if (-4..16).contains(&exp10) {
        if exp10 < 0 {
            out.push_str("0.");
            for _ in 0..(-exp10 - 1) {
                out.push('0');
            }
            out.push_str(digits);
        } else {
            let point = usize::try_from(exp10).unwrap_or_default() + 1;
            if n <= point {
                out.push_str(digits);
                out.extend(std::iter::repeat_n('0', point - n));
                out.push_str(".0");
            } else {
                out.push_str(&digits[..point]);
                out.push('.');
                out.push_str(&digits[point..]);
            }
        }
    } else {
        out.push_str(&digits[..1]);
        if n > 1 {
            out.push('.');
            out.push_str(&digits[1..]);
        }
        let sign = if exp10 < 0 { '-' } else { '+' };
        let _ = write!(out, "e{sign}{:02}", exp10.unsigned_abs());
    }
    out
}

#[unsafe(no_mangle)]
pub extern "C" fn PyFloat_FromDouble(value: f64) -> *mut PyObject {
    let _gil = gil::acquire();
    new_ref_or_null(new(value))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyFloat_AsDouble(obj: *mut PyObject) -> f64 {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    unsafe { borrow_arg(obj) }.and_then(as_f64).or_raise(-1.0)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyFloat_Check(obj: *mut PyObject) -> c_int {
    // SAFETY: callers pass null or a live object.
    unsafe { PyBorrowed::from_raw(obj) }.map_or(0, |obj| c_int::from(value(obj).is_some()))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyFloat_CheckExact(obj: *mut PyObject) -> c_int {
    // SAFETY: callers pass null or a live object.
    unsafe { PyBorrowed::from_raw(obj) }.map_or(0, |obj| c_int::from(ptr::eq(obj.get_type(), &PyFloat_Type)))
}
