//! The metatype `type`.

use std::ffi::c_int;

use crate::{
    gil,
    object::{PyTypeObject, TypeFlags, builtin_type},
    types::Type,
};

/// Descriptor of `type`. Every static descriptor, this one included, is an
/// immortal instance of it.
#[unsafe(no_mangle)]
pub static PyType_Type: PyTypeObject = builtin_type!(
    name: c"type",
    kind: Type::Type,
    basicsize: size_of::<PyTypeObject>(),
    itemsize: 0,
    flags: TypeFlags::TYPE_SUBCLASS,
    base: std::ptr::null(),
    dealloc: None,
);

/// `1` when `a` is `b` or derives from it.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyType_IsSubtype(a: *const PyTypeObject, b: *const PyTypeObject) -> c_int {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or static descriptors.
    match unsafe { (a.as_ref(), b.as_ref()) } {
        (Some(a), Some(b)) => c_int::from(a.is_subtype_of(b)),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metatype_is_its_own_type() {
        let obj = PyType_Type.as_borrowed();
        assert!(std::ptr::eq(obj.get_type(), &PyType_Type));
        assert_eq!(obj.kind(), Type::Type);
        assert_eq!(PyType_Type.c_name(), c"type");
    }
}
