//! Method registration records and the calling conventions they select.
//!
//! A [`PyMethodDef`] names a C function and says, through its flags, how it
//! expects to be called. [`invoke`] checks the arguments against that
//! convention before dispatching, so the function itself never sees an
//! arity it did not ask for.

use std::{
    borrow::Cow,
    ffi::{CStr, c_char, c_int},
    ptr,
};

use bitflags::bitflags;

use crate::{
    errors::{self, RaiseOr},
    exception_private::{ExcType, RunError, RunResult},
    gil,
    object::PyObject,
    owned::{PyBorrowed, PyOwned},
    types::{dict, tuple},
};

pub const METH_VARARGS: c_int = 0x0001;
pub const METH_KEYWORDS: c_int = 0x0002;
pub const METH_NOARGS: c_int = 0x0004;
pub const METH_O: c_int = 0x0008;

bitflags! {
    /// Calling-convention bits of `ml_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MethodFlags: c_int {
        /// Positional arguments arrive as one tuple.
        const VARARGS = METH_VARARGS;
        /// Combined with `VARARGS`: a keyword dict (or null) follows the tuple.
        const KEYWORDS = METH_KEYWORDS;
        /// No arguments; the second parameter is null.
        const NOARGS = METH_NOARGS;
        /// Exactly one positional argument, passed directly.
        const O = METH_O;
    }
}

/// `PyObject *f(PyObject *self, PyObject *args)`.
pub type PyCFunction = unsafe extern "C" fn(*mut PyObject, *mut PyObject) -> *mut PyObject;

/// `PyObject *f(PyObject *self, PyObject *args, PyObject *kwargs)`.
pub type PyCFunctionWithKeywords =
    unsafe extern "C" fn(*mut PyObject, *mut PyObject, *mut PyObject) -> *mut PyObject;

/// One entry of a method table. Tables end with [`PyMethodDef::SENTINEL`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PyMethodDef {
    pub ml_name: *const c_char,
    /// Stored as a two-argument function whatever the convention;
    /// `METH_KEYWORDS` entries are cast back before the call.
    pub ml_meth: Option<PyCFunction>,
    pub ml_flags: c_int,
    pub ml_doc: *const c_char,
}

// SAFETY: method tables are immutable statics pointing at static strings and functions.
unsafe impl Sync for PyMethodDef {}

impl PyMethodDef {
    /// The all-null terminator of a method table.
    pub const SENTINEL: Self = Self {
        ml_name: ptr::null(),
        ml_meth: None,
        ml_flags: 0,
        ml_doc: ptr::null(),
    };

    /// Entry for a keyword-taking function.
    #[must_use]
    pub const fn with_keywords(name: &'static CStr, meth: PyCFunctionWithKeywords, doc: Option<&'static CStr>) -> Self {
        Self {
            ml_name: name.as_ptr(),
            // SAFETY: both are C function pointers; the call site casts back
            // because the flags carry METH_KEYWORDS.
            ml_meth: Some(unsafe { std::mem::transmute::<PyCFunctionWithKeywords, PyCFunction>(meth) }),
            ml_flags: METH_VARARGS | METH_KEYWORDS,
            ml_doc: match doc {
                Some(doc) => doc.as_ptr(),
                None => ptr::null(),
            },
        }
    }

    #[must_use]
    pub const fn new(name: &'static CStr, meth: PyCFunction, flags: MethodFlags, doc: Option<&'static CStr>) -> Self {
        Self {
            ml_name: name.as_ptr(),
            ml_meth: Some(meth),
            ml_flags: flags.bits(),
            ml_doc: match doc {
                Some(doc) => doc.as_ptr(),
                None => ptr::null(),
            },
        }
    }

    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.ml_name.is_null()
    }

    /// The method name, or `"?"` when unset.
    #[must_use]
    pub fn name(&self) -> Cow<'_, str> {
        if self.ml_name.is_null() {
            return Cow::Borrowed("?");
        }
        // SAFETY: a non-null `ml_name` is a NUL-terminated static string.
        unsafe { CStr::from_ptr(self.ml_name) }.to_string_lossy()
    }

    #[must_use]
    pub fn doc(&self) -> Option<Cow<'_, str>> {
        if self.ml_doc.is_null() {
            return None;
        }
        // SAFETY: a non-null `ml_doc` is a NUL-terminated static string.
        Some(unsafe { CStr::from_ptr(self.ml_doc) }.to_string_lossy())
    }

    #[must_use]
    pub fn flags(&self) -> MethodFlags {
        MethodFlags::from_bits_retain(self.ml_flags)
    }
}

/// Iterates a sentinel-terminated method table.
///
/// # Safety
/// `table` must point to entries ending with a sentinel.
pub unsafe fn table_entries<'a>(table: *const PyMethodDef) -> impl Iterator<Item = &'a PyMethodDef> {
    let mut next = table;
    std::iter::from_fn(move || {
        if next.is_null() {
            return None;
        }
        // SAFETY: caller contract; iteration stops at the sentinel.
        let entry = unsafe { &*next };
        if entry.is_sentinel() {
            return None;
        }
        // SAFETY: the sentinel has not been reached, so the next entry exists.
        next = unsafe { next.add(1) };
        Some(entry)
    })
}

/// The calling convention selected by a flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Convention {
    NoArgs,
    One,
    VarArgs,
    VarArgsKeywords,
}

impl TryFrom<MethodFlags> for Convention {
    type Error = RunError;

    fn try_from(flags: MethodFlags) -> RunResult<Self> {
        if flags == MethodFlags::NOARGS {
            Ok(Self::NoArgs)
        } else if flags == MethodFlags::O {
            Ok(Self::One)
        } else if flags == MethodFlags::VARARGS {
            Ok(Self::VarArgs)
        } else if flags == MethodFlags::VARARGS | MethodFlags::KEYWORDS {
            Ok(Self::VarArgsKeywords)
        } else {
            Err(ExcType::system_error(format!("bad call flags {:#x}", flags.bits())))
        }
    }
}

/// Calls `def` with `self_obj`, checking the arguments against its flags.
///
/// `args` must be a tuple when present (absent means no positional
/// arguments); `kwargs` a dict or absent.
///
/// # Safety
/// `def.ml_meth` must have the signature its flags imply, and `self_obj` must
/// be null or live.
pub unsafe fn invoke(
    def: &PyMethodDef,
    self_obj: *mut PyObject,
    args: Option<PyBorrowed<'_>>,
    kwargs: Option<PyBorrowed<'_>>,
) -> RunResult<PyOwned> {
    let name = def.name();
    let meth = def.ml_meth.ok_or_else(ExcType::bad_internal_call)?;
    let convention = Convention::try_from(def.flags())?;
    let args = match args {
        Some(args) if tuple::check(args) => args,
        Some(_) => return Err(ExcType::bad_internal_call()),
        None => tuple::empty(),
    };
    if kwargs.is_some_and(|kwargs| !dict::check(kwargs)) {
        return Err(ExcType::bad_internal_call());
    }
    let kwargs = kwargs.filter(|kwargs| dict::len(*kwargs) > 0);
    if kwargs.is_some() && convention != Convention::VarArgsKeywords {
        return Err(ExcType::type_error(format!("{name}() takes no keyword arguments")));
    }
    let given = tuple::items(args).len();

    let result = match convention {
        Convention::NoArgs => {
            if given != 0 {
                return Err(ExcType::type_error(format!("{name}() takes no arguments ({given} given)")));
            }
            // SAFETY: caller contract: a METH_NOARGS function accepts a null second argument.
            unsafe { meth(self_obj, ptr::null_mut()) }
        }
        Convention::One => {
            let Some(arg) = tuple::get(args, 0).filter(|_| given == 1) else {
                return Err(ExcType::type_error(format!(
                    "{name}() takes exactly one argument ({given} given)"
                )));
            };
            // SAFETY: caller contract; `arg` is kept alive by `args`.
            unsafe { meth(self_obj, arg.as_ptr()) }
        }
        // SAFETY: caller contract; `args` is a live tuple.
        Convention::VarArgs => unsafe { meth(self_obj, args.as_ptr()) },
        Convention::VarArgsKeywords => {
            // SAFETY: the flags say the entry was registered with the three-argument signature.
            let meth = unsafe { std::mem::transmute::<PyCFunction, PyCFunctionWithKeywords>(meth) };
            let kwargs = kwargs.map_or(ptr::null_mut(), PyBorrowed::as_ptr);
            // SAFETY: caller contract; both containers are live.
            unsafe { meth(self_obj, args.as_ptr(), kwargs) }
        }
    };

    // SAFETY: the function returns a new reference or null.
    match unsafe { PyOwned::from_raw(result) } {
        Some(_) if errors::occurred() => {
            Err(ExcType::system_error(format!("{name}() returned a result with an exception set")))
        }
        Some(result) => Ok(result),
        None if errors::occurred() => Err(RunError::Pending),
        None => Err(ExcType::system_error(format!(
            "{name}() returned NULL without setting an exception"
        ))),
    }
}

// ============================================================================
// Exported API
// ============================================================================

/// Calls a method entry. Returns a new reference, or null with the error set.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyCFunction_Invoke(
    def: *const PyMethodDef,
    self_obj: *mut PyObject,
    args: *mut PyObject,
    kwargs: *mut PyObject,
) -> *mut PyObject {
    let _gil = gil::acquire();
    // SAFETY: callers pass a valid method entry and null or live objects.
    let result = unsafe {
        match def.as_ref() {
            Some(def) => invoke(def, self_obj, PyBorrowed::from_raw(args), PyBorrowed::from_raw(kwargs)),
            None => Err(ExcType::bad_internal_call()),
        }
    };
    result.map(PyOwned::into_raw).or_raise(ptr::null_mut())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conventions_from_flags() {
        assert_eq!(Convention::try_from(MethodFlags::O), Ok(Convention::One));
        assert_eq!(
            Convention::try_from(MethodFlags::VARARGS | MethodFlags::KEYWORDS),
            Ok(Convention::VarArgsKeywords)
        );
        let err = Convention::try_from(MethodFlags::KEYWORDS).unwrap_err();
        assert_eq!(err.exc_type(), Some(ExcType::SystemError));
        let err = Convention::try_from(MethodFlags::NOARGS | MethodFlags::O).unwrap_err();
        assert_eq!(err, ExcType::system_error("bad call flags 0xc"));
    }

    #[test]
    fn table_iteration_stops_at_sentinel() {
        unsafe extern "C" fn noop(_: *mut PyObject, _: *mut PyObject) -> *mut PyObject {
            ptr::null_mut()
        }
        let table = [
            PyMethodDef::new(c"a", noop, MethodFlags::NOARGS, None),
            PyMethodDef::new(c"b", noop, MethodFlags::O, Some(c"doc")),
            PyMethodDef::SENTINEL,
        ];
        // SAFETY: the table ends with a sentinel.
        let names: Vec<_> = unsafe { table_entries(table.as_ptr()) }.map(|def| def.name().into_owned()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(table[1].doc().as_deref(), Some("doc"));
    }
}
