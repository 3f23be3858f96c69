//! Build direction: native values into a new Python object.
//!
//! Values arrive as [`PyArgValue`]s, one lane per format unit, mirroring C's
//! default argument promotion: every integer code reads the `int` lane
//! (`k`/`K` read `uint`), `f` and `d` read `double`, and text, bytes and
//! object codes read `ptr`.

use std::{
    ffi::{CStr, c_char, c_void},
    fmt,
};

use smallvec::SmallVec;

use crate::{
    args::{
        format::{Code, Item, build_format},
        format_arg,
    },
    errors::{self, RaiseOr},
    exception_private::{ExcType, RunError, RunResult},
    gil,
    object::PyObject,
    owned::{PyBorrowed, PyOwned},
    singletons,
    types::{bytes, dict, float, list, long, str as pystr, tuple},
};

/// One promoted C argument.
#[repr(C)]
#[derive(Clone, Copy)]
pub union PyArgValue {
    pub int: i64,
    pub uint: u64,
    pub double: f64,
    pub ptr: *const c_void,
}

impl PyArgValue {
    #[must_use]
    pub const fn int(value: i64) -> Self {
        Self { int: value }
    }

    #[must_use]
    pub const fn uint(value: u64) -> Self {
        Self { uint: value }
    }

    #[must_use]
    pub const fn double(value: f64) -> Self {
        Self { double: value }
    }

    #[must_use]
    pub const fn ptr<T>(value: *const T) -> Self {
        Self { ptr: value.cast() }
    }

    #[must_use]
    pub const fn object(value: *mut PyObject) -> Self {
        Self {
            ptr: value.cast_const().cast(),
        }
    }
}

impl fmt::Debug for PyArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PyArgValue").finish_non_exhaustive()
    }
}

struct Builder<'v> {
    values: &'v [PyArgValue],
    next: usize,
}

impl<'v> Builder<'v> {
    /// # Safety
    /// Each value must carry the lane its format unit reads, and pointer
    /// lanes must be null or valid for the unit (NUL-terminated text unless
    /// a length follows, a live object for `O`/`S`, an owned one for `N`).
    unsafe fn new(values: &'v [PyArgValue]) -> Self {
        Self { values, next: 0 }
    }

    fn take(&mut self) -> RunResult<PyArgValue> {
        let value = *self
            .values
            .get(self.next)
            .ok_or_else(|| ExcType::system_error("more format units than values"))?;
        self.next += 1;
        Ok(value)
    }

    fn take_int(&mut self) -> RunResult<i64> {
        // SAFETY: `Builder::new` contract: integer units carry the `int` lane.
        Ok(unsafe { self.take()?.int })
    }

    fn take_ptr(&mut self) -> RunResult<*const c_void> {
        // SAFETY: `Builder::new` contract: pointer units carry the `ptr` lane.
        Ok(unsafe { self.take()?.ptr })
    }

    /// Text or bytes content, `None` for a null pointer.
    fn take_data(&mut self, with_length: bool) -> RunResult<Option<&'v [u8]>> {
        let data = self.take_ptr()?.cast::<c_char>();
        let length = if with_length { Some(self.take_int()?) } else { None };
        if data.is_null() {
            return Ok(None);
        }
        Ok(Some(match length.and_then(|len| usize::try_from(len).ok()) {
            // SAFETY: `Builder::new` contract: `len` readable bytes.
            Some(len) => unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len) },
            // SAFETY: `Builder::new` contract: NUL-terminated without a length.
            None => unsafe { CStr::from_ptr(data) }.to_bytes(),
        }))
    }

    fn null_object() -> RunError {
        if errors::occurred() {
            RunError::Pending
        } else {
            ExcType::system_error("NULL object passed to Py_BuildValue")
        }
    }

    fn build(&mut self, item: &Item) -> RunResult<PyOwned> {
        let (code, with_length) = match item {
            Item::Unit { code, with_length } => (*code, *with_length),
            Item::Tuple(items) => return tuple::from_owned(self.build_all(items)?),
            Item::List(items) => return list::from_owned(self.build_all(items)?),
            Item::Dict(pairs) => {
                let dict = dict::new()?;
                for (key, value) in pairs {
                    let key = self.build(key)?;
                    let value = self.build(value)?;
                    dict::set_item(dict.borrow(), key.borrow(), value.borrow())?;
                }
                return Ok(dict);
            }
        };
        match code {
            Code::Byte | Code::Short | Code::Int | Code::Long | Code::LongLong | Code::Ssize => {
                long::new(self.take_int()?)
            }
            Code::ULongMask | Code::ULongLongMask => {
                // SAFETY: `Builder::new` contract: unsigned units carry the `uint` lane.
                long::new(unsafe { self.take()?.uint })
            }
            Code::Double | Code::Float => {
                // SAFETY: `Builder::new` contract: float units carry the `double` lane.
                float::new(unsafe { self.take()?.double })
            }
            Code::Str | Code::NullableStr => match self.take_data(with_length)? {
                Some(text) => pystr::from_utf8(text),
                None => Ok(singletons::none().to_owned()),
            },
            Code::Bytes => match self.take_data(with_length)? {
                Some(data) => bytes::new(data),
                None => Ok(singletons::none().to_owned()),
            },
            Code::Object | Code::BytesObject => {
                let obj = self.take_ptr()?.cast_mut().cast::<PyObject>();
                // SAFETY: `Builder::new` contract: null or a live object.
                let obj = unsafe { PyBorrowed::from_raw(obj) }.ok_or_else(Self::null_object)?;
                Ok(obj.to_owned())
            }
            Code::Steal => {
                let obj = self.take_ptr()?.cast_mut().cast::<PyObject>();
                // SAFETY: `Builder::new` contract: the caller's reference moves here.
                unsafe { PyOwned::from_raw(obj) }.ok_or_else(Self::null_object)
            }
            Code::Predicate | Code::StrObject | Code::CheckedObject => Err(ExcType::bad_internal_call()),
        }
    }

    fn build_all(&mut self, items: &[Item]) -> RunResult<Vec<PyOwned>> {
        items.iter().map(|item| self.build(item)).collect()
    }
}

/// Value indices of every `N` unit, in order.
fn steal_positions(items: &[Item], index: &mut usize, out: &mut SmallVec<[usize; 4]>) {
    for item in items {
        match item {
            Item::Unit { code, .. } => {
                if *code == Code::Steal {
                    out.push(*index);
                }
                *index += item.width();
            }
            Item::Tuple(items) | Item::List(items) => steal_positions(items, index, out),
            Item::Dict(pairs) => {
                for (key, value) in pairs {
                    steal_positions(std::slice::from_ref(key), index, out);
                    steal_positions(std::slice::from_ref(value), index, out);
                }
            }
        }
    }
}

/// Builds a value from `format` and `values`.
///
/// No units yield `None`, one unit yields its value and several yield a
/// tuple. On failure every `N` reference not yet taken over is released.
///
/// # Safety
/// Each value must carry the lane its format unit reads; pointer lanes must
/// be null or valid for their unit, and `N` pointers are owned references.
pub unsafe fn build_value(format: &str, values: &[PyArgValue]) -> RunResult<PyOwned> {
    let items = build_format(format)?;
    // SAFETY: forwarded caller contract.
    let mut builder = unsafe { Builder::new(values) };
    let result = match items.as_slice() {
        [] => Ok(singletons::none().to_owned()),
        [item] => builder.build(item),
        items => builder.build_all(items).and_then(tuple::from_owned),
    };
    if result.is_err() {
        let mut positions = SmallVec::new();
        steal_positions(&items, &mut 0, &mut positions);
        for position in positions.into_iter().filter(|&p| p >= builder.next) {
            if let Some(value) = values.get(position) {
                // SAFETY: an `N` value the builder never took; the reference is still ours to drop.
                drop(unsafe { PyOwned::from_raw(value.ptr.cast_mut().cast::<PyObject>()) });
            }
        }
    }
    result
}

// ============================================================================
// Exported API
// ============================================================================

/// Array form of `Py_BuildValue`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn Py_BuildValueSlots(
    format: *const c_char,
    values: *const PyArgValue,
    nvalues: isize,
) -> *mut PyObject {
    let _gil = gil::acquire();
    let result = (|| {
        // SAFETY: callers pass a NUL-terminated format.
        let format = unsafe { format_arg(format) }?;
        let len = usize::try_from(nvalues).unwrap_or_default();
        let values = if values.is_null() || len == 0 {
            &[][..]
        } else {
            // SAFETY: callers pass `nvalues` readable values.
            unsafe { std::slice::from_raw_parts(values, len) }
        };
        // SAFETY: forwarded caller contract on the lanes.
        unsafe { build_value(format, values) }
    })();
    result.map(PyOwned::into_raw).or_raise(std::ptr::null_mut())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steal_positions_follow_value_order() {
        let items = build_format("(s#N)[iN]{s:N}").unwrap();
        let mut positions = SmallVec::new();
        steal_positions(&items, &mut 0, &mut positions);
        assert_eq!(positions.as_slice(), &[2, 4, 6]);
    }
}
