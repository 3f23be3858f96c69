//! `tuple`: a fixed-length sequence of owned references stored inline.
//!
//! `PyTuple_New` returns slots filled with null; callers populate them with
//! `PyTuple_SetItem` before the tuple escapes. The empty tuple is a shared
//! immortal instance.

use std::{
    ffi::c_int,
    mem::offset_of,
    ptr::{self, NonNull},
};

use crate::{
    errors::{RaiseOr, borrow_arg, new_ref_or_null, status},
    exception_private::{ExcType, RunResult},
    gil,
    heap::{self, ReleaseStack},
    object::{PyObject, PyTypeObject, PyVarObject, TypeFlags, builtin_type},
    owned::{PyBorrowed, PyOwned},
    types::Type,
};

#[repr(C)]
#[derive(Debug)]
pub struct PyTupleObject {
    pub ob_base: PyVarObject,
    ob_item: [*mut PyObject; 0],
}

// SAFETY: the only static instance is the empty tuple, which has no items.
unsafe impl Sync for PyTupleObject {}

#[unsafe(no_mangle)]
pub static PyTuple_Type: PyTypeObject = builtin_type!(
    name: c"tuple",
    kind: Type::Tuple,
    basicsize: size_of::<PyTupleObject>(),
    itemsize: size_of::<*mut PyObject>(),
    flags: TypeFlags::BASETYPE.union(TypeFlags::TUPLE_SUBCLASS),
    base: ptr::null(),
    dealloc: Some(tuple_dealloc),
);

static EMPTY: PyTupleObject = PyTupleObject {
    ob_base: PyVarObject {
        ob_base: PyObject::immortal(&raw const PyTuple_Type),
        ob_size: 0,
    },
    ob_item: [],
};

fn items_ptr(obj: *mut PyObject) -> *mut *mut PyObject {
    obj.cast::<u8>()
        .wrapping_add(offset_of!(PyTupleObject, ob_item))
        .cast::<*mut PyObject>()
}

fn len_of(obj: NonNull<PyObject>) -> usize {
    // SAFETY: only called on tuples, whose header is a `PyVarObject`.
    let size = unsafe { obj.cast::<PyVarObject>().as_ref() }.ob_size;
    usize::try_from(size).unwrap_or_default()
}

/// # Safety
/// `obj` is a dying tuple.
unsafe fn tuple_dealloc(obj: NonNull<PyObject>, stack: &mut ReleaseStack) {
    let len = len_of(obj);
    // SAFETY: the tuple owns one reference per non-null slot.
    unsafe {
        let items = std::slice::from_raw_parts(items_ptr(obj.as_ptr()), len);
        stack.release_children(items.iter().copied());
    }
}

// ============================================================================
// Rust API
// ============================================================================

/// A tuple of `len` null slots (the shared empty tuple when `len == 0`).
pub fn new(len: usize) -> RunResult<PyOwned> {
    if len == 0 {
        return Ok(empty().to_owned());
    }
    let obj = heap::alloc_object(&PyTuple_Type, len)?;
    // SAFETY: fresh tuple; slots are zeroed, i.e. null.
    Ok(unsafe { PyOwned::from_non_null(obj) })
}

/// The shared empty tuple.
#[must_use]
pub fn empty() -> PyBorrowed<'static> {
    PyBorrowed::from_static(&EMPTY.ob_base.ob_base)
}

/// Builds a tuple that takes over `items`.
pub fn from_owned(items: Vec<PyOwned>) -> RunResult<PyOwned> {
    let tuple = new(items.len())?;
    let slots = items_ptr(tuple.as_ptr());
    for (index, item) in items.into_iter().enumerate() {
        // SAFETY: `index < len` and the fresh slot is null.
        unsafe { slots.add(index).write(item.into_raw()) };
    }
    Ok(tuple)
}

/// Builds a tuple holding new references to `items`.
pub fn from_borrowed(items: &[PyBorrowed<'_>]) -> RunResult<PyOwned> {
    from_owned(items.iter().map(|&item| item.to_owned()).collect())
}

#[must_use]
pub fn check(obj: PyBorrowed<'_>) -> bool {
    obj.get_type().has_flags(TypeFlags::TUPLE_SUBCLASS)
}

/// The item slots of a tuple; empty for other kinds. Slots may be null
/// while the tuple is still being filled.
#[must_use]
pub fn items<'a>(obj: PyBorrowed<'a>) -> &'a [*mut PyObject] {
    if !check(obj) {
        return &[];
    }
    let len = len_of(obj.as_non_null());
    if len == 0 {
        return &[];
    }
    // SAFETY: a tuple holds `ob_size` slots inline; they are not resized.
    unsafe { std::slice::from_raw_parts(items_ptr(obj.as_ptr()), len) }
}

/// Borrowed item at `index`, or `None` when out of range or unset.
#[must_use]
pub fn get<'a>(obj: PyBorrowed<'a>, index: usize) -> Option<PyBorrowed<'a>> {
    let item = *items(obj).get(index)?;
    // SAFETY: the tuple owns a reference to each non-null item.
    unsafe { PyBorrowed::from_raw(item) }
}

fn expect_tuple(obj: PyBorrowed<'_>) -> RunResult<&[*mut PyObject]> {
    if check(obj) {
        Ok(items(obj))
    } else {
        Err(ExcType::bad_internal_call())
    }
}

/// Stores `item` at `index`, releasing any previous occupant.
///
/// Only a tuple nobody else references yet (refcount 1) may be filled. On
/// failure `item` is released.
pub fn set_item(tuple: PyBorrowed<'_>, index: usize, item: PyOwned) -> RunResult<()> {
    if !check(tuple) || tuple.refcnt() != 1 {
        return Err(ExcType::bad_internal_call());
    }
    if index >= items(tuple).len() {
        return Err(ExcType::index_error("tuple assignment index out of range"));
    }
    // SAFETY: in range; the tuple is uniquely owned, so no borrowed view of
    // its slots is alive.
    let previous = unsafe {
        let slot = items_ptr(tuple.as_ptr()).add(index);
        std::mem::replace(&mut *slot, item.into_raw())
    };
    // SAFETY: the tuple owned the previous occupant.
    drop(unsafe { PyOwned::from_raw(previous) });
    Ok(())
}

/// New tuple of the items in `low..high`; negative bounds clamp to 0, large ones to the length.
pub fn slice(obj: PyBorrowed<'_>, low: isize, high: isize) -> RunResult<PyOwned> {
    let items = expect_tuple(obj)?;
    let len = items.len();
    let clamp = |i: isize| usize::try_from(i).unwrap_or(0).min(len);
    let (low, high) = (clamp(low), clamp(high));
    if low == 0 && high == len {
        return Ok(obj.to_owned());
    }
    let picked = if low < high { &items[low..high] } else { &[][..] };
    from_owned(
        picked
            .iter()
            // SAFETY: the tuple owns a reference to each non-null item.
            .filter_map(|&item| unsafe { PyBorrowed::from_raw(item) })
            .map(PyBorrowed::to_owned)
            .collect(),
    )
}

// ============================================================================
// Exported API
// ============================================================================

#[unsafe(no_mangle)]
pub extern "C" fn PyTuple_New(size: isize) -> *mut PyObject {
    let _gil = gil::acquire();
    let result = usize::try_from(size).map_err(|_| ExcType::bad_internal_call()).and_then(new);
    new_ref_or_null(result)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyTuple_Size(obj: *mut PyObject) -> isize {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    let result = unsafe { borrow_arg(obj) }
        .and_then(expect_tuple)
        .map(|items| isize::try_from(items.len()).unwrap_or(isize::MAX));
    result.or_raise(-1)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyTuple_GetItem(obj: *mut PyObject, index: isize) -> *mut PyObject {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    let result = unsafe { borrow_arg(obj) }.and_then(|obj| {
        let items = expect_tuple(obj)?;
        usize::try_from(index)
            .ok()
            .and_then(|index| items.get(index).copied())
            .ok_or_else(|| ExcType::index_error("tuple index out of range"))
    });
    result.or_raise(ptr::null_mut())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyTuple_SetItem(obj: *mut PyObject, index: isize, item: *mut PyObject) -> c_int {
    let _gil = gil::acquire();
    // SAFETY: the caller hands over its reference to `item`; it is released on failure.
    let item = unsafe { PyOwned::from_raw(item) };
    // SAFETY: callers pass null or a live tuple.
    let result = unsafe { borrow_arg(obj) }.and_then(|obj| {
        let item = item.ok_or_else(ExcType::bad_internal_call)?;
        let index = usize::try_from(index)
            .map_err(|_| ExcType::index_error("tuple assignment index out of range"))?;
        set_item(obj, index, item)
    });
    status(result)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyTuple_GetSlice(obj: *mut PyObject, low: isize, high: isize) -> *mut PyObject {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    new_ref_or_null(unsafe { borrow_arg(obj) }.and_then(|obj| slice(obj, low, high)))
}

/// Builds a tuple from `n` borrowed objects; the array form of `PyTuple_Pack`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyTuple_PackSlots(n: isize, items: *const *mut PyObject) -> *mut PyObject {
    let _gil = gil::acquire();
    let result = (|| {
        let len = usize::try_from(n).map_err(|_| ExcType::bad_internal_call())?;
        if len == 0 {
            return new(0);
        }
        if items.is_null() {
            return Err(ExcType::bad_internal_call());
        }
        // SAFETY: callers pass `n` readable slots.
        let raw = unsafe { std::slice::from_raw_parts(items, len) };
        let borrowed = raw
            .iter()
            // SAFETY: callers pass live objects.
            .map(|&item| unsafe { borrow_arg(item) })
            .collect::<RunResult<Vec<_>>>()?;
        from_borrowed(&borrowed)
    })();
    new_ref_or_null(result)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyTuple_Check(obj: *mut PyObject) -> c_int {
    // SAFETY: callers pass null or a live object.
    unsafe { PyBorrowed::from_raw(obj) }.map_or(0, |obj| c_int::from(check(obj)))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyTuple_CheckExact(obj: *mut PyObject) -> c_int {
    // SAFETY: callers pass null or a live object.
    unsafe { PyBorrowed::from_raw(obj) }.map_or(0, |obj| c_int::from(obj.kind() == Type::Tuple))
}
