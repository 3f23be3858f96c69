//! Building Python values from format strings and native values.

use std::ptr;

use pretty_assertions::assert_eq;
use pyshim::{
    ExcType, PyArgValue, PyOwned,
    args::Py_BuildValueSlots,
    build_value, errors, gil, heap_stats, singletons,
    types::{long, protocol, str as pystr},
};

/// Builds and returns the repr, panicking on failure.
fn build_repr(format: &str, values: &[PyArgValue]) -> String {
    let built = unsafe { build_value(format, values) }.unwrap();
    protocol::repr(built.borrow()).unwrap()
}

// =============================================================================
// 1. Shapes
// =============================================================================

/// No units give `None`, one unit its bare value, several a tuple.
#[test]
fn result_shape_depends_on_unit_count() {
    let _gil = gil::acquire();
    let none = unsafe { build_value("", &[]) }.unwrap();
    assert!(none.is(singletons::none()));
    assert_eq!(build_repr("i", &[PyArgValue::int(5)]), "5");
    assert_eq!(build_repr("(i)", &[PyArgValue::int(5)]), "(5,)");
    assert_eq!(build_repr("ii", &[PyArgValue::int(1), PyArgValue::int(2)]), "(1, 2)");
    assert_eq!(build_repr("()", &[]), "()");
}

/// Separators are ignored and containers nest.
#[test]
fn nested_containers() {
    let _gil = gil::acquire();
    let values = [
        PyArgValue::ptr(c"k".as_ptr()),
        PyArgValue::int(1),
        PyArgValue::double(0.5),
        PyArgValue::ptr(c"x".as_ptr()),
    ];
    assert_eq!(build_repr("{s: [i, d]}, s", &values), "({'k': [1, 0.5]}, 'x')");
}

/// Each scalar code reads its own lane.
#[test]
fn scalar_codes() {
    let _gil = gil::acquire();
    let values = [
        PyArgValue::int(-7),
        PyArgValue::uint(u64::MAX),
        PyArgValue::double(1.25),
        PyArgValue::ptr(b"ab\0cd".as_ptr()),
        PyArgValue::int(5),
        PyArgValue::ptr(ptr::null::<u8>()),
    ];
    assert_eq!(build_repr("lKfy#z", &values), r"(-7, 18446744073709551615, 1.25, b'ab\x00cd', None)");
}

/// `s` decodes UTF-8 and rejects malformed text.
#[test]
fn text_decoding() {
    let _gil = gil::acquire();
    assert_eq!(build_repr("s", &[PyArgValue::ptr(c"héllo".as_ptr())]), "'héllo'");
    let bad = [PyArgValue::ptr(b"\xff".as_ptr()), PyArgValue::int(1)];
    let err = unsafe { build_value("s#", &bad) }.unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::UnicodeDecodeError));
}

// =============================================================================
// 2. References
// =============================================================================

/// `O` adds a reference, `N` takes over the caller's.
#[test]
fn object_codes_and_ownership() {
    let _gil = gil::acquire();
    let kept = pystr::new("kept").unwrap();
    let stolen = pystr::new("stolen").unwrap();
    let stolen_raw = stolen.clone().into_raw();
    let built = unsafe {
        build_value("(ON)", &[PyArgValue::object(kept.as_ptr()), PyArgValue::object(stolen_raw)])
    }
    .unwrap();
    assert_eq!(kept.refcnt(), 2);
    assert_eq!(stolen.refcnt(), 2, "N moved the reference into the tuple");
    drop(built);
    assert_eq!(kept.refcnt(), 1);
    assert_eq!(stolen.refcnt(), 1);
}

/// A null object raises `SystemError`, or keeps an error already set.
#[test]
fn null_objects() {
    let _gil = gil::acquire();
    errors::clear();
    let err = unsafe { build_value("O", &[PyArgValue::object(ptr::null_mut())]) }.unwrap_err();
    assert_eq!(err, ExcType::system_error("NULL object passed to Py_BuildValue"));

    errors::set_string(ExcType::ValueError, "from the caller");
    let err = unsafe { build_value("N", &[PyArgValue::object(ptr::null_mut())]) }.unwrap_err();
    assert_eq!(err, pyshim::RunError::Pending);
    assert_eq!(errors::occurred_kind(), Some(ExcType::ValueError));
    errors::clear();
}

/// On failure every `N` reference not yet taken over is released.
#[test]
fn failure_releases_stolen_references() {
    let _gil = gil::acquire();
    errors::clear();
    let before = heap_stats();
    let first = long::new(1000i64).unwrap().into_raw();
    let second = long::new(2000i64).unwrap().into_raw();
    let values = [
        PyArgValue::object(first),
        PyArgValue::object(ptr::null_mut()),
        PyArgValue::object(second),
    ];
    let result = unsafe { Py_BuildValueSlots(c"[NON]".as_ptr(), values.as_ptr(), 3) };
    assert!(result.is_null());
    assert_eq!(errors::occurred_kind(), Some(ExcType::SystemError));
    errors::clear();
    let diff = before.diff(&heap_stats());
    assert!(diff.is_empty(), "leaked: {diff}");
}

/// The exported form returns a new reference.
#[test]
fn exported_build() {
    let _gil = gil::acquire();
    let values = [PyArgValue::int(3), PyArgValue::ptr(c"three".as_ptr())];
    let raw = unsafe { Py_BuildValueSlots(c"{i:s}".as_ptr(), values.as_ptr(), 2) };
    let built = unsafe { PyOwned::from_raw(raw) }.unwrap();
    assert_eq!(built.refcnt(), 1);
    assert_eq!(protocol::repr(built.borrow()).unwrap(), "{3: 'three'}");
}

/// Running out of values is reported instead of reading past the array.
#[test]
fn too_few_values() {
    let _gil = gil::acquire();
    let err = unsafe { build_value("ii", &[PyArgValue::int(1)]) }.unwrap_err();
    assert_eq!(err, ExcType::system_error("more format units than values"));
}
