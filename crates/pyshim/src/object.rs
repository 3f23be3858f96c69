//! C-layout object header and type descriptor.
//!
//! Every object begins with a [`PyObject`] header; variable-length kinds
//! extend it to a [`PyVarObject`]. The kind-specific payload follows. Kind
//! identity is the address of the static [`PyTypeObject`] in `ob_type`.

use std::{
    ffi::{CStr, c_char},
    mem::offset_of,
    ptr::NonNull,
    sync::atomic::AtomicI64,
};

use bitflags::bitflags;

use crate::{heap::ReleaseStack, owned::PyBorrowed, types::Type};

/// Refcount carried by statically allocated objects.
///
/// Increments and decrements of an object at or above this value are no-ops,
/// so singletons, type descriptors and the empty tuple are never released.
pub const IMMORTAL_REFCNT: i64 = u32::MAX as i64;

/// The header shared by every object.
#[repr(C)]
#[derive(Debug)]
pub struct PyObject {
    pub ob_refcnt: AtomicI64,
    pub ob_type: *const PyTypeObject,
}

// SAFETY: the refcount is atomic and `ob_type` always points to an immutable
// static descriptor; payload mutation is serialized by the runtime lock.
unsafe impl Sync for PyObject {}

impl PyObject {
    /// Header for a statically allocated, immortal object of kind `tp`.
    pub(crate) const fn immortal(tp: *const PyTypeObject) -> Self {
        Self {
            ob_refcnt: AtomicI64::new(IMMORTAL_REFCNT),
            ob_type: tp,
        }
    }
}

/// Header of variable-length objects. `ob_size` is the logical length, not the capacity.
#[repr(C)]
#[derive(Debug)]
pub struct PyVarObject {
    pub ob_base: PyObject,
    pub ob_size: isize,
}

#[cfg(target_pointer_width = "64")]
const _: () = {
    assert!(offset_of!(PyObject, ob_refcnt) == 0);
    assert!(offset_of!(PyObject, ob_type) == 8);
    assert!(size_of::<PyObject>() == 16);
    assert!(offset_of!(PyVarObject, ob_size) == 16);
    assert!(size_of::<PyVarObject>() == 24);
};

bitflags! {
    /// `tp_flags` bits. The `*_SUBCLASS` bits back the fast `Py*_Check` tests.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeFlags: u64 {
        const IMMUTABLETYPE = 1 << 8;
        const BASETYPE = 1 << 10;
        const READY = 1 << 12;
        const LONG_SUBCLASS = 1 << 24;
        const LIST_SUBCLASS = 1 << 25;
        const TUPLE_SUBCLASS = 1 << 26;
        const BYTES_SUBCLASS = 1 << 27;
        const UNICODE_SUBCLASS = 1 << 28;
        const DICT_SUBCLASS = 1 << 29;
        const BASE_EXC_SUBCLASS = 1 << 30;
        const TYPE_SUBCLASS = 1 << 31;
    }
}

impl TypeFlags {
    /// Flags common to every built-in descriptor.
    pub const STATIC_BUILTIN: Self = Self::IMMUTABLETYPE.union(Self::READY);
}

/// Releases a dying object's payload, handing owned children to `stack`.
///
/// Runs exactly once per object, after its refcount reached zero and before
/// its memory returns to the object allocator.
pub(crate) type DeallocFn = unsafe fn(NonNull<PyObject>, &mut ReleaseStack);

/// Rust-side behaviour of a kind. Not part of the C layout contract.
#[derive(Debug)]
pub(crate) struct TypeSlots {
    pub kind: Type,
    pub dealloc: Option<DeallocFn>,
}

/// Immutable static type descriptor.
#[repr(C)]
#[derive(Debug)]
pub struct PyTypeObject {
    pub ob_base: PyVarObject,
    pub tp_name: *const c_char,
    pub tp_basicsize: isize,
    pub tp_itemsize: isize,
    pub tp_flags: TypeFlags,
    pub tp_base: *const PyTypeObject,
    pub(crate) slots: TypeSlots,
}

// SAFETY: descriptors are immutable statics; their raw pointers reference other
// statics (names, base descriptors) that live for the whole program.
unsafe impl Sync for PyTypeObject {}

impl PyTypeObject {
    /// The closed kind tag of instances.
    #[must_use]
    pub fn kind(&self) -> Type {
        self.slots.kind
    }

    /// The type name, e.g. `"int"` or `"TypeError"`.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.slots.kind.name()
    }

    /// `tp_name` as a C string.
    #[must_use]
    pub fn c_name(&self) -> &CStr {
        // SAFETY: every descriptor's `tp_name` is a static NUL-terminated literal.
        unsafe { CStr::from_ptr(self.tp_name) }
    }

    #[must_use]
    pub fn has_flags(&self, flags: TypeFlags) -> bool {
        self.tp_flags.contains(flags)
    }

    /// Base descriptor, if any.
    #[must_use]
    pub fn base(&self) -> Option<&'static Self> {
        // SAFETY: `tp_base` is null or points at a static descriptor.
        unsafe { self.tp_base.as_ref() }
    }

    /// True when `self` is `other` or derives from it through `tp_base`.
    #[must_use]
    pub fn is_subtype_of(&self, other: &Self) -> bool {
        let mut current = Some(self);
        while let Some(tp) = current {
            if std::ptr::eq(tp, other) {
                return true;
            }
            current = tp.base();
        }
        false
    }

    /// This descriptor viewed as an object (its header is a `PyObject`).
    #[must_use]
    pub fn as_object_ptr(&'static self) -> *mut PyObject {
        std::ptr::from_ref(self).cast::<PyObject>().cast_mut()
    }

    /// This descriptor as a borrowed immortal object.
    #[must_use]
    pub fn as_borrowed(&'static self) -> PyBorrowed<'static> {
        PyBorrowed::from_static(&self.ob_base.ob_base)
    }
}

/// An exported `PyObject *` variable such as `Py_None` or `PyExc_TypeError`.
#[repr(transparent)]
#[derive(Debug)]
pub struct ObjectPtr(*const PyObject);

// SAFETY: only ever points at immortal statics.
unsafe impl Sync for ObjectPtr {}

impl ObjectPtr {
    pub(crate) const fn new(ptr: *const PyObject) -> Self {
        Self(ptr)
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut PyObject {
        self.0.cast_mut()
    }
}

/// Builds a static descriptor for a built-in kind.
macro_rules! builtin_type {
    (
        name: $name:expr,
        kind: $kind:expr,
        basicsize: $basicsize:expr,
        itemsize: $itemsize:expr,
        flags: $flags:expr,
        base: $base:expr,
        dealloc: $dealloc:expr $(,)?
    ) => {
        $crate::object::PyTypeObject {
            ob_base: $crate::object::PyVarObject {
                ob_base: $crate::object::PyObject::immortal(&raw const $crate::types::type_object::PyType_Type),
                ob_size: 0,
            },
            tp_name: $name.as_ptr(),
            tp_basicsize: $basicsize as isize,
            tp_itemsize: $itemsize as isize,
            tp_flags: $crate::object::TypeFlags::STATIC_BUILTIN.union($flags),
            tp_base: $base,
            slots: $crate::object::TypeSlots {
                kind: $kind,
                dealloc: $dealloc,
            },
        }
    };
}

pub(crate) use builtin_type;
