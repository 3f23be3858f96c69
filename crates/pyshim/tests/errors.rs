//! The interpreter-wide error slot: setting, inspecting, matching and printing.

use std::{ffi::CStr, ptr};

use pyshim::{
    CollectStringPrint, ExcType, NoopTracer, RecordingTracer, RunError, StdErrPrint, TraceEvent,
    errors::{self, PyErr_Clear, PyErr_ExceptionMatches, PyErr_Fetch, PyErr_GivenExceptionMatches, PyErr_Occurred,
        PyErr_Print, PyErr_Restore, PyErr_SetString},
    exceptions::{
        PyExc_Exception, PyExc_IndexError, PyExc_KeyError, PyExc_LookupError, PyExc_RecursionError, PyExc_RuntimeError,
        PyExc_TypeError, PyExc_ValueError,
    },
    gil, io,
    types::{str as pystr, tuple},
    tracer,
};

/// Runs `f` with a fresh collecting writer installed, returning what was printed.
fn capture(f: impl FnOnce()) -> String {
    let writer = CollectStringPrint::new();
    let previous = io::set_error_writer(Box::new(writer.clone()));
    f();
    io::set_error_writer(previous);
    writer.output()
}

// =============================================================================
// 1. Setting and clearing
// =============================================================================

/// `PyErr_SetString` fills the slot; `PyErr_Occurred` returns the class as a borrowed reference.
#[test]
fn set_string_and_occurred() {
    let _gil = gil::acquire();
    errors::clear();
    unsafe {
        assert!(PyErr_Occurred().is_null());
        PyErr_SetString(PyExc_ValueError.as_ptr(), c"bad".as_ptr());
        assert_eq!(PyErr_Occurred(), PyExc_ValueError.as_ptr());
    }
    assert_eq!(errors::occurred_kind(), Some(ExcType::ValueError));
    PyErr_Clear();
    assert!(!errors::occurred());
}

/// Setting a second error replaces the first.
#[test]
fn second_error_replaces_first() {
    let _gil = gil::acquire();
    errors::set_string(ExcType::ValueError, "first");
    errors::set_string(ExcType::TypeError, "second");
    let state = errors::fetch();
    assert_eq!(state.kind(), Some(ExcType::TypeError));
    assert_eq!(state.message().as_deref(), Some("second"));
    assert!(!errors::occurred());
}

/// Fetch transfers ownership out of the slot and restore puts it back.
#[test]
fn fetch_restore_round_trip() {
    let _gil = gil::acquire();
    errors::set_string(ExcType::KeyError, "'missing'");
    let mut exc_type = ptr::null_mut();
    let mut value = ptr::null_mut();
    let mut traceback = ptr::null_mut();
    unsafe {
        PyErr_Fetch(&raw mut exc_type, &raw mut value, &raw mut traceback);
        assert!(PyErr_Occurred().is_null(), "fetch leaves the slot clear");
        assert_eq!(exc_type, PyExc_KeyError.as_ptr());
        assert!(traceback.is_null());
        let text = CStr::from_ptr(pystr::PyUnicode_AsUTF8(value));
        assert_eq!(text.to_str(), Ok("'missing'"));
        PyErr_Restore(exc_type, value, traceback);
    }
    assert_eq!(errors::occurred_kind(), Some(ExcType::KeyError));
    errors::clear();
}

/// `take` surfaces a pending error as `RunError::Pending`.
#[test]
fn take_reports_pending() {
    let _gil = gil::acquire();
    errors::clear();
    assert_eq!(errors::take(), Ok(()));
    errors::set_string(ExcType::RuntimeError, "boom");
    assert_eq!(errors::take(), Err(RunError::Pending));
    errors::clear();
}

// =============================================================================
// 2. Matching
// =============================================================================

/// Matching walks the class hierarchy and accepts tuples of classes.
#[test]
fn given_exception_matches_hierarchy_and_tuples() {
    let _gil = gil::acquire();
    unsafe {
        assert_eq!(PyErr_GivenExceptionMatches(PyExc_IndexError.as_ptr(), PyExc_LookupError.as_ptr()), 1);
        assert_eq!(PyErr_GivenExceptionMatches(PyExc_IndexError.as_ptr(), PyExc_Exception.as_ptr()), 1);
        assert_eq!(PyErr_GivenExceptionMatches(PyExc_LookupError.as_ptr(), PyExc_IndexError.as_ptr()), 0);
        assert_eq!(PyErr_GivenExceptionMatches(ptr::null_mut(), PyExc_Exception.as_ptr()), 0);
    }
    let classes = tuple::from_borrowed(&[
        unsafe { pyshim::PyBorrowed::from_raw(PyExc_TypeError.as_ptr()) }.unwrap(),
        unsafe { pyshim::PyBorrowed::from_raw(PyExc_KeyError.as_ptr()) }.unwrap(),
    ])
    .unwrap();
    unsafe {
        assert_eq!(PyErr_GivenExceptionMatches(PyExc_KeyError.as_ptr(), classes.as_ptr()), 1);
        assert_eq!(PyErr_GivenExceptionMatches(PyExc_ValueError.as_ptr(), classes.as_ptr()), 0);
    }
}

/// Built-in classes match through the kind hierarchy, including kinds that
/// sit below `RuntimeError`.
#[test]
fn recursion_error_is_a_runtime_error() {
    let _gil = gil::acquire();
    unsafe {
        assert_eq!(PyErr_GivenExceptionMatches(PyExc_RecursionError.as_ptr(), PyExc_RuntimeError.as_ptr()), 1);
        assert_eq!(PyErr_GivenExceptionMatches(PyExc_RecursionError.as_ptr(), PyExc_Exception.as_ptr()), 1);
        assert_eq!(PyErr_GivenExceptionMatches(PyExc_RuntimeError.as_ptr(), PyExc_RecursionError.as_ptr()), 0);
    }
    assert_eq!(ExcType::RecursionError.base(), Some(ExcType::RuntimeError));
}

/// `PyErr_ExceptionMatches` compares against the pending error, false when none is set.
#[test]
fn exception_matches_pending() {
    let _gil = gil::acquire();
    errors::clear();
    unsafe {
        assert_eq!(PyErr_ExceptionMatches(PyExc_Exception.as_ptr()), 0);
    }
    errors::set_string(ExcType::OverflowError, "too big");
    unsafe {
        assert_eq!(PyErr_ExceptionMatches(PyExc_Exception.as_ptr()), 1);
        assert_eq!(PyErr_ExceptionMatches(PyExc_TypeError.as_ptr()), 0);
    }
    errors::clear();
}

// =============================================================================
// 3. Printing
// =============================================================================

/// `PyErr_Print` writes `Name: message` and clears the slot.
#[test]
fn print_writes_report_and_clears() {
    let _gil = gil::acquire();
    errors::set_string(ExcType::ValueError, "bad");
    let output = capture(|| PyErr_Print());
    assert_eq!(output, "ValueError: bad\n");
    assert!(!errors::occurred());
}

/// Errors without a message print just the class name; an empty slot prints nothing.
#[test]
fn print_without_message() {
    let _gil = gil::acquire();
    ExcType::MemoryError.no_message().restore();
    let output = capture(|| {
        errors::print();
        errors::print();
    });
    assert_eq!(output, "MemoryError\n");
}

/// The default writer can be reinstalled after capturing.
#[test]
fn writer_can_be_swapped_back() {
    let _gil = gil::acquire();
    let previous = io::set_error_writer(Box::new(StdErrPrint));
    io::set_error_writer(previous);
}

// =============================================================================
// 4. Tracing
// =============================================================================

/// Set and clear transitions reach the installed tracer.
#[test]
fn error_events_are_traced() {
    let _gil = gil::acquire();
    errors::clear();
    let recorder = RecordingTracer::new();
    tracer::set_tracer(Box::new(recorder.clone()));
    errors::set_string(ExcType::TypeError, "nope");
    errors::clear();
    tracer::set_tracer(Box::new(NoopTracer));

    let events: Vec<_> = recorder
        .events()
        .into_iter()
        .filter(|event| matches!(event, TraceEvent::ErrorSet { .. } | TraceEvent::ErrorClear))
        .collect();
    assert_eq!(
        events,
        [
            TraceEvent::ErrorSet {
                type_name: "TypeError".to_owned(),
                message: Some("nope".to_owned()),
            },
            TraceEvent::ErrorClear,
        ]
    );
}
