//! Dispatching `PyMethodDef` entries through their calling conventions.

use std::{
    ffi::{c_int, c_void},
    ptr,
};

use pyshim::{
    ExcType, MethodFlags, PyBorrowed, PyMethodDef, PyObject, PyOwned, RunError, errors, gil,
    methods::{PyCFunction_Invoke, invoke, table_entries},
    parse_tuple_and_keywords, singletons,
    types::{dict, long, protocol, str as pystr, tuple},
};

unsafe extern "C" fn answer(_self: *mut PyObject, args: *mut PyObject) -> *mut PyObject {
    assert!(args.is_null(), "METH_NOARGS passes NULL");
    long::PyLong_FromLong(42)
}

unsafe extern "C" fn identity(_self: *mut PyObject, arg: *mut PyObject) -> *mut PyObject {
    unsafe { pyshim::heap::Py_IncRef(arg) };
    arg
}

unsafe extern "C" fn count(_self: *mut PyObject, args: *mut PyObject) -> *mut PyObject {
    long::PyLong_FromSsize_t(unsafe { tuple::PyTuple_Size(args) })
}

unsafe extern "C" fn greet(_self: *mut PyObject, args: *mut PyObject, kwargs: *mut PyObject) -> *mut PyObject {
    let mut name: *mut PyObject = ptr::null_mut();
    let mut times: c_int = 1;
    let slots = [ptr::from_mut(&mut name).cast::<c_void>(), ptr::from_mut(&mut times).cast::<c_void>()];
    let parsed = unsafe {
        parse_tuple_and_keywords(
            PyBorrowed::from_raw(args).unwrap(),
            PyBorrowed::from_raw(kwargs),
            "U|i:greet",
            &["name", "times"],
            &slots,
        )
    };
    if let Err(err) = parsed {
        err.restore();
        return ptr::null_mut();
    }
    let name = pystr::as_str(unsafe { PyBorrowed::from_raw(name) }.unwrap()).unwrap();
    let text = vec![name; usize::try_from(times).unwrap()].join(" ");
    pystr::new(&text).map_or(ptr::null_mut(), PyOwned::into_raw)
}

unsafe extern "C" fn forgets_error(_self: *mut PyObject, _args: *mut PyObject) -> *mut PyObject {
    ptr::null_mut()
}

unsafe extern "C" fn fails(_self: *mut PyObject, _args: *mut PyObject) -> *mut PyObject {
    errors::set_string(ExcType::RuntimeError, "expected failure");
    ptr::null_mut()
}

unsafe extern "C" fn leaks_error(_self: *mut PyObject, _args: *mut PyObject) -> *mut PyObject {
    errors::set_string(ExcType::RuntimeError, "stale");
    singletons::none().to_owned().into_raw()
}

static TABLE: [PyMethodDef; 5] = [
    PyMethodDef::new(c"answer", answer, MethodFlags::NOARGS, Some(c"Returns 42.")),
    PyMethodDef::new(c"identity", identity, MethodFlags::O, None),
    PyMethodDef::new(c"count", count, MethodFlags::VARARGS, None),
    PyMethodDef::with_keywords(c"greet", greet, None),
    PyMethodDef::SENTINEL,
];

fn entry(name: &str) -> &'static PyMethodDef {
    unsafe { table_entries(TABLE.as_ptr()) }
        .find(|def| def.name() == name)
        .unwrap()
}

fn call_args(items: Vec<PyOwned>) -> PyOwned {
    tuple::from_owned(items).unwrap()
}

// =============================================================================
// 1. Conventions
// =============================================================================

/// The table is walked up to the sentinel.
#[test]
fn table_lists_every_entry() {
    let names: Vec<_> = unsafe { table_entries(TABLE.as_ptr()) }.map(|def| def.name().into_owned()).collect();
    assert_eq!(names, ["answer", "identity", "count", "greet"]);
    assert_eq!(entry("answer").doc().as_deref(), Some("Returns 42."));
    assert_eq!(entry("greet").flags(), MethodFlags::VARARGS | MethodFlags::KEYWORDS);
}

/// Each convention receives the arguments in its own shape.
#[test]
fn each_convention_dispatches() {
    let _gil = gil::acquire();
    let result = unsafe { invoke(entry("answer"), ptr::null_mut(), None, None) }.unwrap();
    assert_eq!(long::as_i64(result.borrow()), Ok(42));

    let arg = pystr::new("same").unwrap();
    let result = unsafe { invoke(entry("identity"), ptr::null_mut(), Some(call_args(vec![arg.clone()]).borrow()), None) }
        .unwrap();
    assert!(result.is(arg.borrow()));

    let three = call_args(vec![long::new(1i64).unwrap(), long::new(2i64).unwrap(), long::new(3i64).unwrap()]);
    let result = unsafe { invoke(entry("count"), ptr::null_mut(), Some(three.borrow()), None) }.unwrap();
    assert_eq!(long::as_i64(result.borrow()), Ok(3));
}

/// Keyword functions receive the dict and parse it themselves.
#[test]
fn keywords_reach_the_function() {
    let _gil = gil::acquire();
    let args = call_args(vec![pystr::new("hi").unwrap()]);
    let kwargs = dict::new().unwrap();
    dict::set_item(kwargs.borrow(), pystr::new("times").unwrap().borrow(), long::new(3i64).unwrap().borrow()).unwrap();
    let result = unsafe { invoke(entry("greet"), ptr::null_mut(), Some(args.borrow()), Some(kwargs.borrow())) }.unwrap();
    assert_eq!(protocol::str_string(result.borrow()).unwrap(), "hi hi hi");

    let empty = dict::new().unwrap();
    let result = unsafe { invoke(entry("greet"), ptr::null_mut(), Some(args.borrow()), Some(empty.borrow())) }.unwrap();
    assert_eq!(protocol::str_string(result.borrow()).unwrap(), "hi");
}

// =============================================================================
// 2. Argument checking
// =============================================================================

/// Arity mismatches are rejected before the function runs.
#[test]
fn arity_is_checked_per_convention() {
    let _gil = gil::acquire();
    let two = call_args(vec![long::new(1i64).unwrap(), long::new(2i64).unwrap()]);
    assert_eq!(
        unsafe { invoke(entry("identity"), ptr::null_mut(), Some(two.borrow()), None) }.unwrap_err(),
        ExcType::type_error("identity() takes exactly one argument (2 given)")
    );
    assert_eq!(
        unsafe { invoke(entry("answer"), ptr::null_mut(), Some(two.borrow()), None) }.unwrap_err(),
        ExcType::type_error("answer() takes no arguments (2 given)")
    );
}

/// Non-keyword conventions refuse a non-empty keyword dict.
#[test]
fn keywords_refused_without_meth_keywords() {
    let _gil = gil::acquire();
    let kwargs = dict::new().unwrap();
    dict::set_item(kwargs.borrow(), pystr::new("x").unwrap().borrow(), long::new(1i64).unwrap().borrow()).unwrap();
    assert_eq!(
        unsafe { invoke(entry("count"), ptr::null_mut(), None, Some(kwargs.borrow())) }.unwrap_err(),
        ExcType::type_error("count() takes no keyword arguments")
    );
}

/// Invalid flag combinations are an internal error.
#[test]
fn bad_flags() {
    let _gil = gil::acquire();
    let mut def = *entry("count");
    def.ml_flags = MethodFlags::O.bits() | MethodFlags::NOARGS.bits();
    assert_eq!(
        unsafe { invoke(&def, ptr::null_mut(), None, None) }.unwrap_err(),
        ExcType::system_error("bad call flags 0xc")
    );
}

// =============================================================================
// 3. Result checking
// =============================================================================

/// A null result keeps the function's error; a null without one is a `SystemError`.
#[test]
fn null_results() {
    let _gil = gil::acquire();
    errors::clear();
    let failing = PyMethodDef::new(c"fails", fails, MethodFlags::VARARGS, None);
    assert_eq!(unsafe { invoke(&failing, ptr::null_mut(), None, None) }.unwrap_err(), RunError::Pending);
    assert_eq!(errors::occurred_kind(), Some(ExcType::RuntimeError));
    errors::clear();

    let silent = PyMethodDef::new(c"forgets_error", forgets_error, MethodFlags::VARARGS, None);
    assert_eq!(
        unsafe { invoke(&silent, ptr::null_mut(), None, None) }.unwrap_err(),
        ExcType::system_error("forgets_error() returned NULL without setting an exception")
    );
}

/// A result returned while an error is set is discarded.
#[test]
fn result_with_error_set() {
    let _gil = gil::acquire();
    errors::clear();
    let leaky = PyMethodDef::new(c"leaks_error", leaks_error, MethodFlags::VARARGS, None);
    assert_eq!(
        unsafe { invoke(&leaky, ptr::null_mut(), None, None) }.unwrap_err(),
        ExcType::system_error("leaks_error() returned a result with an exception set")
    );
    errors::clear();
}

/// The exported entry point installs the error and returns null.
#[test]
fn exported_invoke() {
    let _gil = gil::acquire();
    errors::clear();
    let two = call_args(vec![long::new(1i64).unwrap(), long::new(2i64).unwrap()]);
    let result = unsafe { PyCFunction_Invoke(entry("identity"), ptr::null_mut(), two.as_ptr(), ptr::null_mut()) };
    assert!(result.is_null());
    let state = errors::fetch();
    assert_eq!(state.kind(), Some(ExcType::TypeError));
    assert_eq!(state.message().as_deref(), Some("identity() takes exactly one argument (2 given)"));

    let raw = unsafe { PyCFunction_Invoke(entry("answer"), ptr::null_mut(), ptr::null_mut(), ptr::null_mut()) };
    let answer = unsafe { PyOwned::from_raw(raw) }.unwrap();
    assert_eq!(long::as_i64(answer.borrow()), Ok(42));
}
