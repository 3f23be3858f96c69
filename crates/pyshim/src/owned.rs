//! Ownership-typed object handles for Rust callers.
//!
//! [`PyOwned`] is a *new* reference: dropping it releases the reference.
//! [`PyBorrowed`] is a *borrowed* reference valid for `'a`: copying or dropping
//! it never touches the refcount. Raw `*mut PyObject` only appears at the C
//! boundary, where `from_raw`/`into_raw` make the transfer explicit.

use std::{fmt, marker::PhantomData, ptr::NonNull};

use crate::{
    heap,
    object::{PyObject, PyTypeObject},
    types::Type,
};

/// An owned (new) reference to a live object.
#[repr(transparent)]
pub struct PyOwned(NonNull<PyObject>);

impl PyOwned {
    /// Takes ownership of a new reference. Returns `None` for null.
    ///
    /// # Safety
    /// `ptr` must be null or a live object whose reference the caller owns and
    /// hands over.
    #[must_use]
    pub unsafe fn from_raw(ptr: *mut PyObject) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Wraps a reference the caller owns.
    ///
    /// # Safety
    /// `ptr` must be a live object whose reference the caller owns.
    pub(crate) unsafe fn from_non_null(ptr: NonNull<PyObject>) -> Self {
        Self(ptr)
    }

    /// Gives up ownership, returning the raw pointer. The caller must release it.
    #[must_use]
    pub fn into_raw(self) -> *mut PyObject {
        let ptr = self.0.as_ptr();
        std::mem::forget(self);
        ptr
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut PyObject {
        self.0.as_ptr()
    }

    #[must_use]
    pub fn as_non_null(&self) -> NonNull<PyObject> {
        self.0
    }

    /// A borrowed view tied to this handle's lifetime.
    #[must_use]
    pub fn borrow(&self) -> PyBorrowed<'_> {
        PyBorrowed::new(self.0)
    }

    #[must_use]
    pub fn refcnt(&self) -> i64 {
        self.borrow().refcnt()
    }

    #[must_use]
    pub fn get_type(&self) -> &'static PyTypeObject {
        self.borrow().get_type()
    }

    #[must_use]
    pub fn kind(&self) -> Type {
        self.borrow().kind()
    }

    /// Identity comparison.
    #[must_use]
    pub fn is(&self, other: PyBorrowed<'_>) -> bool {
        self.borrow().is(other)
    }
}

impl Clone for PyOwned {
    fn clone(&self) -> Self {
        self.borrow().to_owned()
    }
}

impl Drop for PyOwned {
    fn drop(&mut self) {
        // SAFETY: this handle owns one reference to a live object.
        unsafe { heap::dec_ref(self.0) }
    }
}

impl fmt::Debug for PyOwned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.borrow().fmt(f)
    }
}

/// A borrowed reference valid for `'a`.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PyBorrowed<'a> {
    ptr: NonNull<PyObject>,
    _lender: PhantomData<&'a PyObject>,
}

impl<'a> PyBorrowed<'a> {
    pub(crate) fn new(ptr: NonNull<PyObject>) -> Self {
        Self {
            ptr,
            _lender: PhantomData,
        }
    }

    /// Borrows a raw pointer. Returns `None` for null.
    ///
    /// # Safety
    /// `ptr` must be null or an object that stays alive for `'a`.
    #[must_use]
    pub unsafe fn from_raw(ptr: *mut PyObject) -> Option<Self> {
        NonNull::new(ptr).map(Self::new)
    }

    /// Borrows an immortal static object.
    pub(crate) fn from_static(obj: &'static PyObject) -> PyBorrowed<'static> {
        PyBorrowed::new(NonNull::from(obj))
    }

    /// Takes a new reference to the same object.
    #[must_use]
    pub fn to_owned(self) -> PyOwned {
        // SAFETY: the object is alive for 'a, and the increment creates the
        // reference the returned handle owns.
        unsafe {
            heap::inc_ref(self.ptr);
            PyOwned::from_non_null(self.ptr)
        }
    }

    #[must_use]
    pub fn as_ptr(self) -> *mut PyObject {
        self.ptr.as_ptr()
    }

    #[must_use]
    pub fn as_non_null(self) -> NonNull<PyObject> {
        self.ptr
    }

    #[must_use]
    pub fn refcnt(self) -> i64 {
        // SAFETY: alive for 'a.
        unsafe { heap::refcnt(self.ptr) }
    }

    #[must_use]
    pub fn get_type(self) -> &'static PyTypeObject {
        // SAFETY: alive for 'a.
        unsafe { heap::type_of(self.ptr) }
    }

    #[must_use]
    pub fn kind(self) -> Type {
        self.get_type().kind()
    }

    /// Identity comparison.
    #[must_use]
    pub fn is(self, other: PyBorrowed<'_>) -> bool {
        self.ptr == other.ptr
    }

    /// Reinterprets the object as its kind-specific layout.
    ///
    /// # Safety
    /// The object's layout must start with `T`.
    pub(crate) unsafe fn payload<T>(self) -> &'a T {
        // SAFETY: caller contract; alive for 'a.
        unsafe { self.ptr.cast::<T>().as_ref() }
    }
}

impl fmt::Debug for PyBorrowed<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} object at {:p}>", self.get_type().name(), self.ptr)
    }
}
