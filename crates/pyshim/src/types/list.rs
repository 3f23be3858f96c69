//! `list`: a growable sequence of owned references.
//!
//! Items live in a separate buffer from the general allocator so the object
//! header keeps a stable address while the list grows. `ob_size` is the
//! logical length and `allocated` the buffer capacity.

use std::{
    ffi::c_int,
    ptr::{self, NonNull},
};

use crate::{
    allocator::raw,
    errors::{RaiseOr, borrow_arg, new_ref_or_null, status},
    exception_private::{ExcType, RunResult},
    gil,
    heap::{self, ReleaseStack},
    object::{PyObject, PyTypeObject, PyVarObject, TypeFlags, builtin_type},
    owned::{PyBorrowed, PyOwned},
    types::{Type, tuple},
};

/// Capacity of the first buffer allocated for an empty list.
const MIN_CAPACITY: usize = 4;

#[repr(C)]
#[derive(Debug)]
pub struct PyListObject {
    pub ob_base: PyVarObject,
    pub ob_item: *mut *mut PyObject,
    pub allocated: isize,
}

#[cfg(target_pointer_width = "64")]
const _: () = {
    assert!(std::mem::offset_of!(PyListObject, ob_item) == 24);
    assert!(std::mem::offset_of!(PyListObject, allocated) == 32);
};

#[unsafe(no_mangle)]
pub static PyList_Type: PyTypeObject = builtin_type!(
    name: c"list",
    kind: Type::List,
    basicsize: size_of::<PyListObject>(),
    itemsize: 0,
    flags: TypeFlags::BASETYPE.union(TypeFlags::LIST_SUBCLASS),
    base: ptr::null(),
    dealloc: Some(list_dealloc),
);

fn raw_list(obj: PyBorrowed<'_>) -> *mut PyListObject {
    obj.as_ptr().cast::<PyListObject>()
}

/// # Safety
/// `obj` is a dying list.
unsafe fn list_dealloc(obj: NonNull<PyObject>, stack: &mut ReleaseStack) {
    let list = obj.cast::<PyListObject>().as_ptr();
    // SAFETY: the list owns one reference per slot below `ob_size`, and the buffer.
    unsafe {
        let len = usize::try_from((*list).ob_base.ob_size).unwrap_or_default();
        let buffer = (*list).ob_item;
        if !buffer.is_null() {
            stack.release_children(std::slice::from_raw_parts(buffer, len).iter().copied());
            raw::free(buffer.cast());
        }
    }
}

// ============================================================================
// Rust API
// ============================================================================

/// A list of `len` null slots.
pub fn new(len: usize) -> RunResult<PyOwned> {
    let obj = heap::alloc_object(&PyList_Type, len)?;
    let list = obj.cast::<PyListObject>().as_ptr();
    // SAFETY: fresh list; from here on the handle releases it on failure.
    let owned = unsafe { PyOwned::from_non_null(obj) };
    if len > 0 {
        let buffer = raw::calloc(len, size_of::<*mut PyObject>()).cast::<*mut PyObject>();
        // SAFETY: `list` is the fresh object owned by `owned`.
        unsafe {
            if buffer.is_null() {
                (*list).ob_base.ob_size = 0;
                return Err(ExcType::memory_error());
            }
            (*list).ob_item = buffer;
            (*list).allocated = isize::try_from(len).unwrap_or(isize::MAX);
        }
    }
    Ok(owned)
}

/// Builds a list that takes over `items`.
pub fn from_owned(items: Vec<PyOwned>) -> RunResult<PyOwned> {
    let list = new(0)?;
    for item in items {
        append(list.borrow(), item.borrow())?;
    }
    Ok(list)
}

#[must_use]
pub fn check(obj: PyBorrowed<'_>) -> bool {
    obj.get_type().has_flags(TypeFlags::LIST_SUBCLASS)
}

fn expect_list(obj: PyBorrowed<'_>) -> RunResult<*mut PyListObject> {
    if check(obj) {
        Ok(raw_list(obj))
    } else {
        Err(ExcType::bad_internal_call())
    }
}

/// Current length of a list; 0 for other kinds.
#[must_use]
pub fn len(obj: PyBorrowed<'_>) -> usize {
    if !check(obj) {
        return 0;
    }
    // SAFETY: list header.
    usize::try_from(unsafe { (*raw_list(obj)).ob_base.ob_size }).unwrap_or_default()
}

/// Borrowed item at `index`. The reference is only valid until the list is mutated.
#[must_use]
pub fn get<'a>(obj: PyBorrowed<'a>, index: usize) -> Option<PyBorrowed<'a>> {
    if index >= len(obj) {
        return None;
    }
    // SAFETY: `index < ob_size` and the list owns each non-null item.
    unsafe { PyBorrowed::from_raw(*(*raw_list(obj)).ob_item.add(index)) }
}

/// New references to the current items, in order. Unset slots are skipped.
#[must_use]
pub fn snapshot(obj: PyBorrowed<'_>) -> Vec<PyOwned> {
    (0..len(obj)).filter_map(|i| get(obj, i)).map(PyBorrowed::to_owned).collect()
}

/// Makes room for one more item, doubling the capacity when full.
///
/// # Safety
/// `list` must be a live list.
unsafe fn reserve_one(list: *mut PyListObject) -> RunResult<()> {
    // SAFETY: caller contract.
    let (len, capacity) = unsafe { ((*list).ob_base.ob_size, (*list).allocated) };
    if len < capacity {
        return Ok(());
    }
    let capacity = usize::try_from(capacity).unwrap_or_default();
    let new_capacity = if capacity == 0 { MIN_CAPACITY } else { capacity.saturating_mul(2) };
    let bytes = new_capacity
        .checked_mul(size_of::<*mut PyObject>())
        .ok_or_else(ExcType::memory_error)?;
    // SAFETY: `ob_item` is null or a buffer from the raw domain.
    let buffer = unsafe { raw::realloc((*list).ob_item.cast(), bytes) }.cast::<*mut PyObject>();
    if buffer.is_null() {
        return Err(ExcType::memory_error());
    }
    // SAFETY: caller contract; the old buffer was moved into `buffer`.
    unsafe {
        (*list).ob_item = buffer;
        (*list).allocated = isize::try_from(new_capacity).unwrap_or(isize::MAX);
    }
    Ok(())
}

/// Appends a new reference to `item`.
pub fn append(obj: PyBorrowed<'_>, item: PyBorrowed<'_>) -> RunResult<()> {
    insert(obj, isize::MAX, item)
}

/// Inserts a new reference to `item` before `index`. Indices are clamped:
/// negative values count from the end, out-of-range values hit the ends.
pub fn insert(obj: PyBorrowed<'_>, index: isize, item: PyBorrowed<'_>) -> RunResult<()> {
    let list = expect_list(obj)?;
    // SAFETY: `list` is a live list; the buffer has room for `ob_size + 1`
    // slots after `reserve_one`.
    unsafe {
        reserve_one(list)?;
        let len = (*list).ob_base.ob_size;
        let mut at = index;
        if at < 0 {
            at = (at + len).max(0);
        }
        let at = at.min(len);
        let tail = usize::try_from(len - at).unwrap_or_default();
        let slot = (*list).ob_item.add(usize::try_from(at).unwrap_or_default());
        ptr::copy(slot, slot.add(1), tail);
        slot.write(item.to_owned().into_raw());
        (*list).ob_base.ob_size = len + 1;
    }
    Ok(())
}

/// Replaces the item at `index`, releasing the previous occupant.
pub fn set_item(obj: PyBorrowed<'_>, index: usize, item: PyOwned) -> RunResult<()> {
    let list = expect_list(obj)?;
    if index >= len(obj) {
        return Err(ExcType::index_error("list assignment index out of range"));
    }
    // SAFETY: in range of the live buffer.
    let previous = unsafe { std::mem::replace(&mut *(*list).ob_item.add(index), item.into_raw()) };
    // SAFETY: the list owned the previous occupant. It is released after the
    // slot already holds the new item.
    drop(unsafe { PyOwned::from_raw(previous) });
    Ok(())
}

pub fn as_tuple(obj: PyBorrowed<'_>) -> RunResult<PyOwned> {
    expect_list(obj)?;
    tuple::from_owned(snapshot(obj))
}

// ============================================================================
// Exported API
// ============================================================================

#[unsafe(no_mangle)]
pub extern "C" fn PyList_New(size: isize) -> *mut PyObject {
    let _gil = gil::acquire();
    let result = usize::try_from(size).map_err(|_| ExcType::bad_internal_call()).and_then(new);
    new_ref_or_null(result)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyList_Size(obj: *mut PyObject) -> isize {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    let result = unsafe { borrow_arg(obj) }.and_then(|obj| {
        expect_list(obj)?;
        Ok(isize::try_from(len(obj)).unwrap_or(isize::MAX))
    });
    result.or_raise(-1)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyList_GetItem(obj: *mut PyObject, index: isize) -> *mut PyObject {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    let result = unsafe { borrow_arg(obj) }.and_then(|obj| {
        let list = expect_list(obj)?;
        match usize::try_from(index) {
            Ok(index) if index < len(obj) => {
                // SAFETY: in range of the live buffer.
                Ok(unsafe { *(*list).ob_item.add(index) })
            }
            _ => Err(ExcType::index_error("list index out of range")),
        }
    });
    result.or_raise(ptr::null_mut())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyList_SetItem(obj: *mut PyObject, index: isize, item: *mut PyObject) -> c_int {
    let _gil = gil::acquire();
    // SAFETY: the caller hands over its reference to `item`; it is released on failure.
    let item = unsafe { PyOwned::from_raw(item) };
    // SAFETY: callers pass null or a live object.
    let result = unsafe { borrow_arg(obj) }.and_then(|obj| {
        expect_list(obj)?;
        let item = item.ok_or_else(ExcType::bad_internal_call)?;
        let index = usize::try_from(index).map_err(|_| ExcType::index_error("list assignment index out of range"))?;
        set_item(obj, index, item)
    });
    status(result)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyList_Append(obj: *mut PyObject, item: *mut PyObject) -> c_int {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or live objects.
    let result = unsafe { borrow_arg(obj) }.and_then(|obj| append(obj, unsafe { borrow_arg(item) }?));
    status(result)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyList_Insert(obj: *mut PyObject, index: isize, item: *mut PyObject) -> c_int {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or live objects.
    let result = unsafe { borrow_arg(obj) }.and_then(|obj| insert(obj, index, unsafe { borrow_arg(item) }?));
    status(result)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyList_AsTuple(obj: *mut PyObject) -> *mut PyObject {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    new_ref_or_null(unsafe { borrow_arg(obj) }.and_then(as_tuple))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyList_Check(obj: *mut PyObject) -> c_int {
    // SAFETY: callers pass null or a live object.
    unsafe { PyBorrowed::from_raw(obj) }.map_or(0, |obj| c_int::from(check(obj)))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyList_CheckExact(obj: *mut PyObject) -> c_int {
    // SAFETY: callers pass null or a live object.
    unsafe { PyBorrowed::from_raw(obj) }.map_or(0, |obj| c_int::from(obj.kind() == Type::List))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IntValue, long};

    #[test]
    fn capacity_doubles_from_four() {
        let _gil = gil::acquire();
        let list = new(0).unwrap();
        let one = long::new(1i64).unwrap();
        let capacity = || {
            // SAFETY: `list` is a live list.
            unsafe { (*raw_list(list.borrow())).allocated }
        };
        assert_eq!(capacity(), 0);
        append(list.borrow(), one.borrow()).unwrap();
        assert_eq!(capacity(), 4);
        for _ in 0..4 {
            append(list.borrow(), one.borrow()).unwrap();
        }
        assert_eq!(capacity(), 8);
        assert_eq!(len(list.borrow()), 5);
        assert_eq!(one.refcnt(), 6);
    }

    #[test]
    fn insert_clamps_indices() {
        let _gil = gil::acquire();
        let list = new(0).unwrap();
        let values: Vec<_> = (0..3i64).map(|v| long::new(v).unwrap()).collect();
        insert(list.borrow(), 100, values[0].borrow()).unwrap();
        insert(list.borrow(), -100, values[1].borrow()).unwrap();
        insert(list.borrow(), -1, values[2].borrow()).unwrap();
        let order: Vec<_> = snapshot(list.borrow())
            .iter()
            .map(|item| long::value(item.borrow()).and_then(IntValue::to_i64))
            .collect();
        assert_eq!(order, vec![Some(1), Some(2), Some(0)]);
    }
}
