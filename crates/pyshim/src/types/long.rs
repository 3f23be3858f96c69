//! Arbitrary-precision `int`.
//!
//! Values that fit an `i64` use the inline fast path; larger values are
//! boxed in a `BigInt`. [`IntValue`] is always normalized, so two equal
//! integers have the same variant.

use std::{
    ffi::{c_int, c_long, c_longlong, c_ulong, c_ulonglong},
    fmt,
    ptr::{self, NonNull},
};

use num_bigint::BigInt;
use num_traits::{FromPrimitive, Signed, ToPrimitive, Zero};

use crate::{
    errors::RaiseOr,
    exception_private::{ExcType, RunResult},
    gil,
    heap::{self, ReleaseStack},
    object::{PyObject, PyTypeObject, TypeFlags, builtin_type},
    owned::{PyBorrowed, PyOwned},
    py_hash,
    types::{Type, float},
};

/// Payload of an `int` (and of `True`/`False`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntValue {
    Small(i64),
    Big(BigInt),
}

impl IntValue {
    /// Normalizes a `BigInt`, keeping the inline form whenever it fits.
    #[must_use]
    pub fn from_bigint(value: BigInt) -> Self {
        match value.to_i64() {
            Some(small) => Self::Small(small),
            None => Self::Big(value),
        }
    }

    #[must_use]
    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Self::Small(v) => Some(*v),
            Self::Big(_) => None,
        }
    }

    #[must_use]
    pub fn to_bigint(&self) -> BigInt {
        match self {
            Self::Small(v) => BigInt::from(*v),
            Self::Big(b) => b.clone(),
        }
    }

    #[must_use]
    pub fn is_negative(&self) -> bool {
        match self {
            Self::Small(v) => *v < 0,
            Self::Big(b) => b.is_negative(),
        }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        match self {
            Self::Small(v) => *v == 0,
            Self::Big(b) => b.is_zero(),
        }
    }

    /// Converts to the nearest float; `OverflowError` when out of range.
    pub fn to_f64(&self) -> RunResult<f64> {
        let value = match self {
            Self::Small(v) => *v as f64,
            Self::Big(b) => b.to_f64().unwrap_or(f64::INFINITY),
        };
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ExcType::overflow_error("int too large to convert to float"))
        }
    }

    /// The low 64 bits in two's complement, as the C `k`/`K` conversions see them.
    #[must_use]
    pub fn low_bits(&self) -> u64 {
        match self {
            Self::Small(v) => u64::from_ne_bytes(v.to_ne_bytes()),
            Self::Big(b) => (b & &BigInt::from(u64::MAX)).to_u64().unwrap_or_default(),
        }
    }

    /// Converts with `OverflowError(message)` when the value does not fit `T`.
    pub fn to_primitive<T>(&self, message: &str) -> RunResult<T>
    where
        T: TryFrom<i64> + FromPrimitive,
    {
        let converted = match self {
            Self::Small(v) => T::try_from(*v).ok(),
            Self::Big(b) => b.to_i128().and_then(T::from_i128),
        };
        converted.ok_or_else(|| ExcType::overflow_error(message))
    }

    /// Converts a non-negative value to an unsigned `T`.
    ///
    /// Negative values raise `OverflowError(negative)`, values above the
    /// target's range `OverflowError(too_large)`.
    pub fn to_unsigned<T>(&self, negative: &str, too_large: &str) -> RunResult<T>
    where
        T: FromPrimitive,
    {
        if self.is_negative() {
            return Err(ExcType::overflow_error(negative));
        }
        let converted = match self {
            Self::Small(v) => T::from_i64(*v),
            Self::Big(b) => b.to_u128().and_then(T::from_u128),
        };
        converted.ok_or_else(|| ExcType::overflow_error(too_large))
    }

    #[must_use]
    pub fn hash(&self) -> i64 {
        match self {
            Self::Small(v) => py_hash::hash_i64(*v),
            Self::Big(b) => py_hash::hash_bigint(b),
        }
    }

    /// Converts a float by truncating toward zero.
    pub fn from_f64(value: f64) -> RunResult<Self> {
        if value.is_nan() {
            return Err(ExcType::ValueError.with_message("cannot convert float NaN to integer"));
        }
        if value.is_infinite() {
            return Err(ExcType::overflow_error("cannot convert float infinity to integer"));
        }
        let truncated = value.trunc();
        BigInt::from_f64(truncated)
            .map(Self::from_bigint)
            .ok_or_else(|| ExcType::overflow_error("cannot convert float infinity to integer"))
    }
}

impl From<i64> for IntValue {
    fn from(value: i64) -> Self {
        Self::Small(value)
    }
}

impl From<u64> for IntValue {
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or_else(|_| Self::Big(BigInt::from(value)), Self::Small)
    }
}

impl From<BigInt> for IntValue {
    fn from(value: BigInt) -> Self {
        Self::from_bigint(value)
    }
}

impl fmt::Display for IntValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Small(v) => write!(f, "{v}"),
            Self::Big(b) => write!(f, "{b}"),
        }
    }
}

/// Layout of an `int` object.
#[repr(C)]
#[derive(Debug)]
pub struct PyLongObject {
    pub ob_base: PyObject,
    pub value: IntValue,
}

#[unsafe(no_mangle)]
pub static PyLong_Type: PyTypeObject = builtin_type!(
    name: c"int",
    kind: Type::Int,
    basicsize: size_of::<PyLongObject>(),
    itemsize: 0,
    flags: TypeFlags::BASETYPE.union(TypeFlags::LONG_SUBCLASS),
    base: ptr::null(),
    dealloc: Some(long_dealloc),
);

/// # Safety
/// `obj` is a dying `int` whose payload was initialized by [`new`].
unsafe fn long_dealloc(obj: NonNull<PyObject>, _stack: &mut ReleaseStack) {
    // SAFETY: caller contract; the value is dropped exactly once.
    unsafe { ptr::drop_in_place(&raw mut (*obj.cast::<PyLongObject>().as_ptr()).value) }
}

// ============================================================================
// Rust API
// ============================================================================

/// Creates a new `int`.
pub fn new(value: impl Into<IntValue>) -> RunResult<PyOwned> {
    let obj = heap::alloc_object(&PyLong_Type, 0)?;
    // SAFETY: `obj` is a fresh `PyLongObject` block whose payload is not yet initialized.
    unsafe {
        (&raw mut (*obj.cast::<PyLongObject>().as_ptr()).value).write(value.into());
        Ok(PyOwned::from_non_null(obj))
    }
}

/// True for `int` and its subtype `bool`.
#[must_use]
pub fn check(obj: PyBorrowed<'_>) -> bool {
    obj.get_type().has_flags(TypeFlags::LONG_SUBCLASS)
}

/// The integer payload, or `None` for non-ints.
#[must_use]
pub fn value<'a>(obj: PyBorrowed<'a>) -> Option<&'a IntValue> {
    if check(obj) {
        // SAFETY: every LONG_SUBCLASS kind has the `PyLongObject` layout.
        Some(&unsafe { obj.payload::<PyLongObject>() }.value)
    } else {
        None
    }
}

/// The integer payload, raising `TypeError` for non-ints.
pub fn index<'a>(obj: PyBorrowed<'a>) -> RunResult<&'a IntValue> {
    value(obj).ok_or_else(|| {
        ExcType::type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            obj.get_type().name()
        ))
    })
}

pub fn as_i64(obj: PyBorrowed<'_>) -> RunResult<i64> {
    index(obj)?.to_primitive("Python int too large to convert to C long")
}

// ============================================================================
// Exported API
// ============================================================================

#[unsafe(no_mangle)]
pub extern "C" fn PyLong_FromLong(value: c_long) -> *mut PyObject {
    let _gil = gil::acquire();
    crate::errors::new_ref_or_null(new(i64::from(value)))
}

#[unsafe(no_mangle)]
pub extern "C" fn PyLong_FromUnsignedLong(value: c_ulong) -> *mut PyObject {
    let _gil = gil::acquire();
    crate::errors::new_ref_or_null(new(u64::from(value)))
}

#[unsafe(no_mangle)]
pub extern "C" fn PyLong_FromLongLong(value: c_longlong) -> *mut PyObject {
    let _gil = gil::acquire();
    crate::errors::new_ref_or_null(new(value))
}

#[unsafe(no_mangle)]
pub extern "C" fn PyLong_FromUnsignedLongLong(value: c_ulonglong) -> *mut PyObject {
    let _gil = gil::acquire();
    crate::errors::new_ref_or_null(new(value))
}

#[unsafe(no_mangle)]
pub extern "C" fn PyLong_FromSsize_t(value: isize) -> *mut PyObject {
    let _gil = gil::acquire();
    crate::errors::new_ref_or_null(new(value as i64))
}

#[unsafe(no_mangle)]
pub extern "C" fn PyLong_FromSize_t(value: usize) -> *mut PyObject {
    let _gil = gil::acquire();
    crate::errors::new_ref_or_null(new(value as u64))
}

#[unsafe(no_mangle)]
pub extern "C" fn PyLong_FromDouble(value: f64) -> *mut PyObject {
    let _gil = gil::acquire();
    crate::errors::new_ref_or_null(IntValue::from_f64(value).and_then(new))
}

/// # Safety
/// `obj` must be null or a live object.
unsafe fn extract<T>(obj: *mut PyObject, sentinel: T, convert: impl FnOnce(&IntValue) -> RunResult<T>) -> T {
    let _gil = gil::acquire();
    // SAFETY: caller contract.
    let result = unsafe { crate::errors::borrow_arg(obj) }.and_then(|obj| convert(index(obj)?));
    result.or_raise(sentinel)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyLong_AsLong(obj: *mut PyObject) -> c_long {
    // SAFETY: forwarded caller contract.
    unsafe { extract(obj, -1, |v| v.to_primitive("Python int too large to convert to C long")) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyLong_AsLongLong(obj: *mut PyObject) -> c_longlong {
    // SAFETY: forwarded caller contract.
    unsafe { extract(obj, -1, |v| v.to_primitive("int too big to convert")) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyLong_AsSsize_t(obj: *mut PyObject) -> isize {
    // SAFETY: forwarded caller contract.
    unsafe { extract(obj, -1, |v| v.to_primitive("Python int too large to convert to C ssize_t")) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyLong_AsUnsignedLong(obj: *mut PyObject) -> c_ulong {
    // SAFETY: forwarded caller contract.
    unsafe {
        extract(obj, c_ulong::MAX, |v| {
            v.to_unsigned(
                "can't convert negative value to unsigned int",
                "Python int too large to convert to C unsigned long",
            )
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyLong_AsUnsignedLongLong(obj: *mut PyObject) -> c_ulonglong {
    // SAFETY: forwarded caller contract.
    unsafe {
        extract(obj, c_ulonglong::MAX, |v| {
            v.to_unsigned("can't convert negative int to unsigned", "int too big to convert")
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyLong_AsSize_t(obj: *mut PyObject) -> usize {
    // SAFETY: forwarded caller contract.
    unsafe {
        extract(obj, usize::MAX, |v| {
            v.to_unsigned(
                "can't convert negative value to size_t",
                "Python int too large to convert to C size_t",
            )
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyLong_AsDouble(obj: *mut PyObject) -> f64 {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    let result = unsafe { crate::errors::borrow_arg(obj) }.and_then(|obj| {
        value(obj)
            .ok_or_else(|| ExcType::type_error("an integer is required"))?
            .to_f64()
    });
    result.or_raise(-1.0)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyLong_Check(obj: *mut PyObject) -> c_int {
    // SAFETY: callers pass null or a live object.
    unsafe { PyBorrowed::from_raw(obj) }.map_or(0, |obj| c_int::from(check(obj)))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyLong_CheckExact(obj: *mut PyObject) -> c_int {
    // SAFETY: callers pass null or a live object.
    unsafe { PyBorrowed::from_raw(obj) }.map_or(0, |obj| c_int::from(obj.kind() == Type::Int))
}

/// Float-or-int coercion shared with `float` and the `d`/`f` format codes.
pub(crate) fn number_as_f64(obj: PyBorrowed<'_>) -> Option<RunResult<f64>> {
    if let Some(v) = float::value(obj) {
        return Some(Ok(v));
    }
    value(obj).map(IntValue::to_f64)
}
