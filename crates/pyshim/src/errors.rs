//! The interpreter-wide error slot and the `PyErr_*` API.
//!
//! The slot holds `(type, value, traceback)`, each nullable and owned. An error
//! "has occurred" exactly when `type` is set. Rust code raises by returning
//! [`RunError`]; the `extern "C"` boundary installs it here via
//! [`RunError::restore`] and returns the C failure sentinel.

use std::{
    ffi::{CStr, c_char, c_int},
    ptr::{self, NonNull},
};

use crate::{
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    exceptions::{exception_kind, exception_type},
    gil::{self, GilCell},
    io,
    object::{PyObject, PyTypeObject},
    owned::{PyBorrowed, PyOwned},
    singletons, tracer,
    types::{Type, protocol, str as pystr, tuple},
};

/// Contents of the error slot.
#[derive(Debug, Default)]
pub struct ErrorState {
    pub exc_type: Option<PyOwned>,
    pub value: Option<PyOwned>,
    pub traceback: Option<PyOwned>,
}

impl ErrorState {
    /// The exception kind, when the type is one of the built-in exception classes.
    #[must_use]
    pub fn kind(&self) -> Option<ExcType> {
        self.exc_type.as_ref().and_then(|tp| as_type(tp.borrow())).and_then(exception_kind)
    }

    /// `str(value)`, or `None` when there is no value or it is `None`.
    #[must_use]
    pub fn message(&self) -> Option<String> {
        let value = self.value.as_ref()?;
        if value.is(singletons::none()) {
            return None;
        }
        protocol::str_string(value.borrow()).ok()
    }

    /// Installs these values, replacing the current slot contents.
    pub fn restore(self) {
        install(self);
    }
}

static ERROR: GilCell<ErrorState> = GilCell::new(ErrorState::default);

/// Swaps the slot contents with `state`, releasing the previous contents after
/// the slot borrow has ended.
fn install(state: ErrorState) {
    let set = state.exc_type.is_some();
    if set {
        let name = state.exc_type.as_ref().map_or("?", |tp| type_name_of_class(tp.borrow()));
        let message = state.message();
        tracer::with_tracer(|t| t.on_error_set(name, message.as_deref()));
    }
    let previous = ERROR.with(|slot| std::mem::replace(slot, state));
    if !set && previous.exc_type.is_some() {
        tracer::with_tracer(|t| t.on_error_clear());
    }
    drop(previous);
}

fn as_type(obj: PyBorrowed<'_>) -> Option<&'static PyTypeObject> {
    if obj.kind() == Type::Type {
        // SAFETY: objects of kind `type` are static descriptors.
        Some(unsafe { &*obj.as_ptr().cast::<PyTypeObject>() })
    } else {
        None
    }
}

fn type_name_of_class(obj: PyBorrowed<'_>) -> &'static str {
    as_type(obj).map_or_else(|| obj.get_type().name(), PyTypeObject::name)
}

/// Installs a not-yet-raised exception. Used by [`RunError::restore`].
pub(crate) fn set_exception(exc: &SimpleException) {
    let exc_type = exception_type(exc.exc_type()).as_borrowed().to_owned();
    // If building the message fails (memory limit) the error is raised without a value.
    let value = exc.message().and_then(|message| pystr::new(message).ok());
    install(ErrorState {
        exc_type: Some(exc_type),
        value,
        traceback: None,
    });
}

// ============================================================================
// Rust API
// ============================================================================

/// Raises `exc` with a str value.
pub fn set_string(exc: ExcType, message: &str) {
    exc.with_message(message).restore();
}

/// True when an error is pending.
#[must_use]
pub fn occurred() -> bool {
    ERROR.with(|slot| slot.exc_type.is_some())
}

/// The pending exception kind, if any and if it is a built-in class.
#[must_use]
pub fn occurred_kind() -> Option<ExcType> {
    ERROR.with(|slot| slot.kind())
}

/// Removes and returns the slot contents, leaving it clear.
#[must_use]
pub fn fetch() -> ErrorState {
    let state = ERROR.with(std::mem::take);
    if state.exc_type.is_some() {
        tracer::with_tracer(|t| t.on_error_clear());
    }
    state
}

/// Releases any pending error.
pub fn clear() {
    install(ErrorState::default());
}

/// Converts the pending error into a `RunError`, for Rust callers that want `?`.
pub fn take() -> RunResult<()> {
    if occurred() { Err(RunError::Pending) } else { Ok(()) }
}

/// Renders the pending error through the installed [`io::ErrorWriter`] and clears it.
pub fn print() {
    let state = fetch();
    let Some(exc_type) = &state.exc_type else {
        return;
    };
    let name = type_name_of_class(exc_type.borrow());
    let report = match state.message() {
        Some(message) if !message.is_empty() => format!("{name}: {message}\n"),
        _ => format!("{name}\n"),
    };
    io::write_report(&report);
}

/// True when `given` (a class or an instance) matches `exc` (a class or a tuple of classes).
#[must_use]
pub fn given_exception_matches(given: PyBorrowed<'_>, exc: PyBorrowed<'_>) -> bool {
    if exc.kind() == Type::Tuple {
        return tuple::items(exc).iter().any(|&item| {
            // SAFETY: tuple items are live while the tuple is borrowed.
            unsafe { PyBorrowed::from_raw(item) }.is_some_and(|item| given_exception_matches(given, item))
        });
    }
    let given_type = as_type(given).unwrap_or_else(|| given.get_type());
    match as_type(exc) {
        Some(exc_type) => match (exception_kind(given_type), exception_kind(exc_type)) {
            (Some(given_kind), Some(exc_kind)) => given_kind.is_subclass_of(exc_kind),
            _ => given_type.is_subtype_of(exc_type),
        },
        None => given.is(exc),
    }
}

/// Converts a C-side result into the sentinel convention, installing errors.
pub(crate) trait RaiseOr<T> {
    fn or_raise(self, sentinel: T) -> T;
}

impl<T> RaiseOr<T> for RunResult<T> {
    fn or_raise(self, sentinel: T) -> T {
        self.unwrap_or_else(|err| {
            err.restore();
            sentinel
        })
    }
}

/// New reference or null with the error installed.
pub(crate) fn new_ref_or_null(result: RunResult<PyOwned>) -> *mut PyObject {
    result.map(PyOwned::into_raw).or_raise(ptr::null_mut())
}

/// `0` on success, `-1` with the error installed.
pub(crate) fn status(result: RunResult<()>) -> c_int {
    result.map(|()| 0).or_raise(-1)
}

/// Borrows an argument, raising `SystemError` for null.
///
/// # Safety
/// `ptr` must be null or a live object that outlives `'a`.
pub(crate) unsafe fn borrow_arg<'a>(ptr: *mut PyObject) -> RunResult<PyBorrowed<'a>> {
    // SAFETY: caller contract.
    unsafe { PyBorrowed::from_raw(ptr) }.ok_or_else(ExcType::bad_internal_call)
}

/// Reads a C string argument, raising `SystemError` for null.
///
/// # Safety
/// `ptr` must be null or a NUL-terminated string that outlives `'a`.
pub(crate) unsafe fn c_str_arg<'a>(ptr: *const c_char) -> RunResult<&'a CStr> {
    if ptr.is_null() {
        return Err(ExcType::bad_internal_call());
    }
    // SAFETY: caller contract.
    Ok(unsafe { CStr::from_ptr(ptr) })
}

// ============================================================================
// Exported API
// ============================================================================

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyErr_SetString(exc_type: *mut PyObject, message: *const c_char) {
    let _gil = gil::acquire();
    let value = if message.is_null() {
        None
    } else {
        // SAFETY: callers pass a NUL-terminated string.
        let text = unsafe { CStr::from_ptr(message) }.to_string_lossy();
        pystr::new(&text).ok()
    };
    // SAFETY: callers pass a live exception class.
    unsafe { set_object_owned(exc_type, value) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyErr_SetObject(exc_type: *mut PyObject, value: *mut PyObject) {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    let value = unsafe { PyBorrowed::from_raw(value) }.map(PyBorrowed::to_owned);
    // SAFETY: callers pass a live exception class.
    unsafe { set_object_owned(exc_type, value) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyErr_SetNone(exc_type: *mut PyObject) {
    let _gil = gil::acquire();
    // SAFETY: callers pass a live exception class.
    unsafe { set_object_owned(exc_type, None) }
}

/// # Safety
/// `exc_type` must be null or a live object.
unsafe fn set_object_owned(exc_type: *mut PyObject, value: Option<PyOwned>) {
    // SAFETY: caller contract.
    match unsafe { PyBorrowed::from_raw(exc_type) } {
        Some(exc_type) => install(ErrorState {
            exc_type: Some(exc_type.to_owned()),
            value,
            traceback: None,
        }),
        None => ExcType::bad_internal_call().restore(),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn PyErr_Occurred() -> *mut PyObject {
    let _gil = gil::acquire();
    ERROR.with(|slot| slot.exc_type.as_ref().map_or(ptr::null_mut(), PyOwned::as_ptr))
}

#[unsafe(no_mangle)]
pub extern "C" fn PyErr_Clear() {
    let _gil = gil::acquire();
    clear();
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyErr_Fetch(
    ptype: *mut *mut PyObject,
    pvalue: *mut *mut PyObject,
    ptraceback: *mut *mut PyObject,
) {
    let _gil = gil::acquire();
    let state = fetch();
    let into_raw = |obj: Option<PyOwned>| obj.map_or(ptr::null_mut(), PyOwned::into_raw);
    for (out, obj) in [
        (ptype, state.exc_type),
        (pvalue, state.value),
        (ptraceback, state.traceback),
    ] {
        if let Some(out) = NonNull::new(out) {
            // SAFETY: callers pass valid out-pointers (or null to discard).
            unsafe { out.write(into_raw(obj)) };
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyErr_Restore(exc_type: *mut PyObject, value: *mut PyObject, traceback: *mut PyObject) {
    let _gil = gil::acquire();
    // SAFETY: the caller transfers ownership of each non-null reference.
    let (exc_type, value, traceback) = unsafe {
        (
            PyOwned::from_raw(exc_type),
            PyOwned::from_raw(value),
            PyOwned::from_raw(traceback),
        )
    };
    if exc_type.is_none() {
        drop((value, traceback));
        clear();
        return;
    }
    install(ErrorState {
        exc_type,
        value,
        traceback,
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn PyErr_Print() {
    let _gil = gil::acquire();
    print();
}

#[unsafe(no_mangle)]
pub extern "C" fn PyErr_PrintEx(_set_sys_last_vars: c_int) {
    PyErr_Print();
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyErr_GivenExceptionMatches(given: *mut PyObject, exc: *mut PyObject) -> c_int {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or live objects.
    let (given, exc) = unsafe { (PyBorrowed::from_raw(given), PyBorrowed::from_raw(exc)) };
    match (given, exc) {
        (Some(given), Some(exc)) => c_int::from(given_exception_matches(given, exc)),
        _ => 0,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyErr_ExceptionMatches(exc: *mut PyObject) -> c_int {
    let _gil = gil::acquire();
    let current = PyErr_Occurred();
    // SAFETY: `current` is the slot's live type (or null); `exc` comes from the caller.
    unsafe { PyErr_GivenExceptionMatches(current, exc) }
}

#[unsafe(no_mangle)]
pub extern "C" fn PyErr_NoMemory() -> *mut PyObject {
    let _gil = gil::acquire();
    ExcType::memory_error().restore();
    ptr::null_mut()
}

#[unsafe(no_mangle)]
pub extern "C" fn PyErr_BadArgument() -> c_int {
    let _gil = gil::acquire();
    ExcType::type_error("bad argument type for built-in operation").restore();
    0
}

#[unsafe(no_mangle)]
pub extern "C" fn PyErr_BadInternalCall() {
    let _gil = gil::acquire();
    ExcType::bad_internal_call().restore();
}
