//! `None`, `True` and `False`.
//!
//! All three are statically allocated and immortal; handing them out as new
//! references never touches their refcount.

use std::{
    ffi::{c_int, c_long},
    ptr,
};

use crate::{
    object::{ObjectPtr, PyObject, PyTypeObject, TypeFlags, builtin_type},
    owned::PyBorrowed,
    types::{IntValue, PyLongObject, Type, long::PyLong_Type},
};

#[unsafe(no_mangle)]
pub static _PyNone_Type: PyTypeObject = builtin_type!(
    name: c"NoneType",
    kind: Type::NoneType,
    basicsize: size_of::<PyObject>(),
    itemsize: 0,
    flags: TypeFlags::empty(),
    base: ptr::null(),
    dealloc: None,
);

#[unsafe(no_mangle)]
pub static PyBool_Type: PyTypeObject = builtin_type!(
    name: c"bool",
    kind: Type::Bool,
    basicsize: size_of::<PyLongObject>(),
    itemsize: 0,
    flags: TypeFlags::LONG_SUBCLASS,
    base: &raw const PyLong_Type,
    dealloc: None,
);

#[unsafe(no_mangle)]
pub static _Py_NoneStruct: PyObject = PyObject::immortal(&raw const _PyNone_Type);

#[unsafe(no_mangle)]
pub static _Py_TrueStruct: PyLongObject = PyLongObject {
    ob_base: PyObject::immortal(&raw const PyBool_Type),
    value: IntValue::Small(1),
};

#[unsafe(no_mangle)]
pub static _Py_FalseStruct: PyLongObject = PyLongObject {
    ob_base: PyObject::immortal(&raw const PyBool_Type),
    value: IntValue::Small(0),
};

#[unsafe(no_mangle)]
pub static Py_None: ObjectPtr = ObjectPtr::new(&raw const _Py_NoneStruct);

#[unsafe(no_mangle)]
pub static Py_True: ObjectPtr = ObjectPtr::new((&raw const _Py_TrueStruct).cast::<PyObject>());

#[unsafe(no_mangle)]
pub static Py_False: ObjectPtr = ObjectPtr::new((&raw const _Py_FalseStruct).cast::<PyObject>());

#[must_use]
pub fn none() -> PyBorrowed<'static> {
    PyBorrowed::from_static(&_Py_NoneStruct)
}

#[must_use]
pub fn bool(value: bool) -> PyBorrowed<'static> {
    if value {
        PyBorrowed::from_static(&_Py_TrueStruct.ob_base)
    } else {
        PyBorrowed::from_static(&_Py_FalseStruct.ob_base)
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn PyBool_FromLong(value: c_long) -> *mut PyObject {
    bool(value != 0).to_owned().into_raw()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyBool_Check(obj: *mut PyObject) -> c_int {
    // SAFETY: callers pass null or a live object.
    unsafe { PyBorrowed::from_raw(obj) }.map_or(0, |obj| c_int::from(obj.kind() == Type::Bool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{object::IMMORTAL_REFCNT, types::long};

    #[test]
    fn singletons_are_immortal() {
        let owned = none().to_owned();
        assert_eq!(owned.refcnt(), IMMORTAL_REFCNT);
        drop(owned);
        assert_eq!(none().refcnt(), IMMORTAL_REFCNT);
    }

    #[test]
    fn bools_are_ints() {
        assert!(long::check(bool(true)));
        assert_eq!(long::value(bool(true)), Some(&IntValue::Small(1)));
        assert_eq!(bool(false).kind(), Type::Bool);
        assert!(bool(false).get_type().is_subtype_of(&PyLong_Type));
        assert_eq!(Py_True.as_ptr(), bool(true).as_ptr());
    }
}
