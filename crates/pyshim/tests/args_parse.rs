//! Parsing argument tuples and keyword dicts into C storage.

use std::{
    ffi::{CStr, c_char, c_double, c_int, c_long, c_void},
    ptr,
};

use pyshim::{
    ExcType, PyObject, PyOwned, errors, gil,
    args::{PyArg_ParseTupleAndKeywordsSlots, PyArg_ParseTupleSlots, PyArg_UnpackTuple},
    parse_tuple, parse_tuple_and_keywords, singletons,
    types::{bytes, dict, float, list, long, str as pystr, tuple},
    unpack_tuple,
};

fn slot<T>(value: &mut T) -> *mut c_void {
    ptr::from_mut(value).cast()
}

fn args(items: Vec<PyOwned>) -> PyOwned {
    tuple::from_owned(items).unwrap()
}

fn int(value: i64) -> PyOwned {
    long::new(value).unwrap()
}

fn text(value: &str) -> PyOwned {
    pystr::new(value).unwrap()
}

fn kwargs(pairs: &[(&str, PyOwned)]) -> PyOwned {
    let map = dict::new().unwrap();
    for (name, value) in pairs {
        dict::set_item(map.borrow(), text(name).borrow(), value.borrow()).unwrap();
    }
    map
}

// =============================================================================
// 1. Positional parsing
// =============================================================================

/// Every scalar code writes its C type.
#[test]
fn scalar_codes() {
    let _gil = gil::acquire();
    let args = args(vec![
        int(7),
        int(-3),
        float::new(2.5).unwrap(),
        int(4),
        text("hi"),
        singletons::none().to_owned(),
        int(0),
    ]);
    let (mut i, mut l, mut d, mut f, mut s, mut z, mut p): (c_int, c_long, c_double, f32, *const c_char, *const c_char, c_int) =
        (0, 0, 0.0, 0.0, ptr::null(), c"x".as_ptr(), 1);
    let slots = [slot(&mut i), slot(&mut l), slot(&mut d), slot(&mut f), slot(&mut s), slot(&mut z), slot(&mut p)];
    unsafe { parse_tuple(args.borrow(), "ildfszp", &slots) }.unwrap();
    assert_eq!((i, l, d, f, p), (7, -3, 2.5, 4.0, 0));
    assert_eq!(unsafe { CStr::from_ptr(s) }.to_str(), Ok("hi"));
    assert!(z.is_null(), "None maps to NULL for z");
}

/// `#` codes write the data pointer followed by its length.
#[test]
fn length_codes() {
    let _gil = gil::acquire();
    let args = args(vec![text("a\0b"), bytes::new(b"xyz").unwrap()]);
    let (mut s, mut s_len, mut y, mut y_len): (*const c_char, isize, *const c_char, isize) = (ptr::null(), 0, ptr::null(), 0);
    let slots = [slot(&mut s), slot(&mut s_len), slot(&mut y), slot(&mut y_len)];
    unsafe { parse_tuple(args.borrow(), "s#y#", &slots) }.unwrap();
    assert_eq!(s_len, 3);
    assert_eq!(y_len, 3);
    assert_eq!(unsafe { std::slice::from_raw_parts(y.cast::<u8>(), 3) }, b"xyz");

    let err = unsafe { parse_tuple(args.borrow(), "sy", &slots) }.unwrap_err();
    assert_eq!(err, ExcType::ValueError.with_message("embedded null character"));
}

/// Optional fields after `|` keep their defaults when omitted.
#[test]
fn optional_fields_keep_defaults() {
    let _gil = gil::acquire();
    let args = args(vec![int(1)]);
    let (mut a, mut b): (c_int, c_int) = (0, 42);
    let slots = [slot(&mut a), slot(&mut b)];
    unsafe { parse_tuple(args.borrow(), "i|i:f", &slots) }.unwrap();
    assert_eq!((a, b), (1, 42));
}

/// Arity errors name the function when the format does.
#[test]
fn arity_errors() {
    let _gil = gil::acquire();
    let one = args(vec![int(1)]);
    let three = args(vec![int(1), int(2), int(3)]);
    let (mut a, mut b): (c_int, c_int) = (0, 0);
    let slots = [slot(&mut a), slot(&mut b)];
    unsafe {
        assert_eq!(
            parse_tuple(one.borrow(), "ii:pair", &slots),
            Err(ExcType::type_error("pair() takes exactly 2 arguments (1 given)"))
        );
        assert_eq!(
            parse_tuple(three.borrow(), "i|i:pair", &slots),
            Err(ExcType::type_error("pair() takes at most 2 arguments (3 given)"))
        );
        assert_eq!(
            parse_tuple(args(vec![]).borrow(), "i|i", &slots),
            Err(ExcType::type_error("function takes at least 1 argument (0 given)"))
        );
        assert_eq!(
            parse_tuple(one.borrow(), "ii;need two ints", &slots),
            Err(ExcType::type_error("need two ints"))
        );
    }
}

/// Range and kind errors report the argument position.
#[test]
fn conversion_errors() {
    let _gil = gil::acquire();
    let mut byte: u8 = 0;
    let mut out: c_int = 0;
    unsafe {
        assert_eq!(
            parse_tuple(args(vec![int(256)]).borrow(), "b", &[slot(&mut byte)]),
            Err(ExcType::overflow_error("unsigned byte integer is greater than maximum"))
        );
        assert_eq!(
            parse_tuple(args(vec![int(-1)]).borrow(), "b", &[slot(&mut byte)]),
            Err(ExcType::overflow_error("unsigned byte integer is less than minimum"))
        );
        assert_eq!(
            parse_tuple(args(vec![text("1")]).borrow(), "i:f", &[slot(&mut out)]),
            Err(ExcType::type_error("f() argument 1 must be int, not str"))
        );
    }
}

/// Values beyond the target width raise `OverflowError` and leave the slot alone.
#[test]
fn narrowing_overflow() {
    let _gil = gil::acquire();
    let mut out: c_int = 11;
    let mut wide: c_long = 0;
    unsafe {
        assert_eq!(
            parse_tuple(args(vec![int(5_000_000_000)]).borrow(), "i", &[slot(&mut out)]),
            Err(ExcType::overflow_error("signed integer is greater than maximum"))
        );
        assert_eq!(
            parse_tuple(args(vec![int(-5_000_000_000)]).borrow(), "i", &[slot(&mut out)]),
            Err(ExcType::overflow_error("signed integer is less than minimum"))
        );
        assert_eq!(out, 11);
        parse_tuple(args(vec![int(5_000_000_000)]).borrow(), "l", &[slot(&mut wide)]).unwrap();
    }
    assert_eq!(wide, 5_000_000_000);

    let call = args(vec![int(5_000_000_000)]);
    let status = unsafe { PyArg_ParseTupleSlots(call.as_ptr(), c"i".as_ptr(), [slot(&mut out)].as_ptr(), 1) };
    assert_eq!(status, 0);
    let state = errors::fetch();
    assert_eq!(state.kind(), Some(ExcType::OverflowError));
    assert_eq!(state.message().as_deref(), Some("signed integer is greater than maximum"));
}

/// `O!` checks the kind against the supplied type object.
#[test]
fn checked_object() {
    let _gil = gil::acquire();
    let items = list::new(0).unwrap();
    let args = args(vec![items.clone()]);
    let mut out: *mut PyObject = ptr::null_mut();
    let list_type = (&raw const list::PyList_Type).cast_mut().cast::<c_void>();
    let slots = [list_type, slot(&mut out)];
    unsafe { parse_tuple(args.borrow(), "O!", &slots) }.unwrap();
    assert_eq!(out, items.as_ptr());
    assert_eq!(items.refcnt(), 2, "O stores a borrowed reference");

    let dict_type = (&raw const dict::PyDict_Type).cast_mut().cast::<c_void>();
    let err = unsafe { parse_tuple(args.borrow(), "O!:g", &[dict_type, slot(&mut out)]) }.unwrap_err();
    assert_eq!(err, ExcType::type_error("g() argument 1 must be dict, not list"));
}

/// `(...)` unpacks a nested sequence into consecutive slots.
#[test]
fn nested_sequences() {
    let _gil = gil::acquire();
    let point = list::from_owned(vec![int(3), int(4)]).unwrap();
    let call = args(vec![point, text("p")]);
    let (mut x, mut y, mut name): (c_int, c_int, *const c_char) = (0, 0, ptr::null());
    unsafe { parse_tuple(call.borrow(), "(ii)s", &[slot(&mut x), slot(&mut y), slot(&mut name)]) }.unwrap();
    assert_eq!((x, y), (3, 4));

    let short = args(vec![args(vec![int(1)]), text("p")]);
    let err = unsafe { parse_tuple(short.borrow(), "(ii)s", &[slot(&mut x), slot(&mut y), slot(&mut name)]) }.unwrap_err();
    assert_eq!(err, ExcType::type_error("argument 1 must be sequence of length 2, not 1"));
}

// =============================================================================
// 2. Keyword parsing
// =============================================================================

/// Keywords fill fields by name; positional-only fields use empty names.
#[test]
fn keywords_fill_by_name() {
    let _gil = gil::acquire();
    let positional = args(vec![int(1)]);
    let named = kwargs(&[("c", int(3))]);
    let (mut a, mut b, mut c): (c_int, c_int, c_int) = (0, -1, 0);
    let slots = [slot(&mut a), slot(&mut b), slot(&mut c)];
    unsafe { parse_tuple_and_keywords(positional.borrow(), Some(named.borrow()), "i|i$i:f", &["", "b", "c"], &slots) }
        .unwrap();
    assert_eq!((a, b, c), (1, -1, 3));
}

/// Missing, unknown and duplicated keywords each raise `TypeError`.
#[test]
fn keyword_errors() {
    let _gil = gil::acquire();
    let (mut a, mut b): (c_int, c_int) = (0, 0);
    let slots = [slot(&mut a), slot(&mut b)];
    let keywords = ["a", "b"];
    unsafe {
        assert_eq!(
            parse_tuple_and_keywords(args(vec![int(1)]).borrow(), None, "ii:f", &keywords, &slots),
            Err(ExcType::type_error("f() missing required argument 'b' (pos 2)"))
        );
        let unknown = kwargs(&[("b", int(2)), ("c", int(3))]);
        assert_eq!(
            parse_tuple_and_keywords(args(vec![int(1)]).borrow(), Some(unknown.borrow()), "ii:f", &keywords, &slots),
            Err(ExcType::type_error("'c' is an invalid keyword argument for f()"))
        );
        let duplicate = kwargs(&[("a", int(1))]);
        assert_eq!(
            parse_tuple_and_keywords(args(vec![int(1)]).borrow(), Some(duplicate.borrow()), "i|i:f", &keywords, &slots),
            Err(ExcType::type_error("argument for f() given by name ('a') and position (1)"))
        );
        let too_many = args(vec![int(1), int(2), int(3)]);
        assert_eq!(
            parse_tuple_and_keywords(too_many.borrow(), None, "i|i", &keywords, &slots),
            Err(ExcType::type_error("function takes at most 2 arguments (3 given)"))
        );
    }
}

/// Non-string keys in the keyword dict are rejected.
#[test]
fn keyword_keys_must_be_strings() {
    let _gil = gil::acquire();
    let named = dict::new().unwrap();
    dict::set_item(named.borrow(), int(1).borrow(), int(1).borrow()).unwrap();
    let mut a: c_int = 0;
    let err =
        unsafe { parse_tuple_and_keywords(args(vec![]).borrow(), Some(named.borrow()), "|i", &["a"], &[slot(&mut a)]) }
            .unwrap_err();
    assert_eq!(err, ExcType::type_error("keywords must be strings"));
}

// =============================================================================
// 3. Unpacking and exported entry points
// =============================================================================

/// `unpack_tuple` checks counts without converting.
#[test]
fn unpack_counts() {
    let _gil = gil::acquire();
    let pair = args(vec![int(1), text("x")]);
    let items = unpack_tuple(pair.borrow(), Some("f"), 1, 3).unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(
        unpack_tuple(pair.borrow(), Some("f"), 3, 3).unwrap_err(),
        ExcType::type_error("f expected 3 arguments, got 2")
    );
    assert_eq!(
        unpack_tuple(pair.borrow(), None, 0, 1).unwrap_err(),
        ExcType::type_error("unpacked tuple should have at most 1 element, but has 2")
    );
}

/// The exported forms return 1/0 and leave the error in the slot.
#[test]
fn exported_entry_points() {
    let _gil = gil::acquire();
    errors::clear();
    let pair = args(vec![int(5), text("x")]);
    let mut n: c_int = 0;
    let mut s: *const c_char = ptr::null();
    let slots = [slot(&mut n), slot(&mut s)];
    unsafe {
        assert_eq!(PyArg_ParseTupleSlots(pair.as_ptr(), c"is".as_ptr(), slots.as_ptr(), 2), 1);
        assert_eq!(n, 5);
        assert_eq!(PyArg_ParseTupleSlots(pair.as_ptr(), c"ii".as_ptr(), slots.as_ptr(), 2), 0);
    }
    assert_eq!(errors::occurred_kind(), Some(ExcType::TypeError));
    errors::clear();

    let keywords = [c"n".as_ptr(), c"s".as_ptr(), ptr::null()];
    let named = kwargs(&[("s", text("y"))]);
    let positional = args(vec![int(6)]);
    unsafe {
        assert_eq!(
            PyArg_ParseTupleAndKeywordsSlots(
                positional.as_ptr(),
                named.as_ptr(),
                c"is".as_ptr(),
                keywords.as_ptr(),
                slots.as_ptr(),
                2
            ),
            1
        );
        assert_eq!(CStr::from_ptr(s).to_str(), Ok("y"));
    }

    let mut first: *mut PyObject = ptr::null_mut();
    let mut second: *mut PyObject = ptr::null_mut();
    let out = [slot(&mut first), slot(&mut second)];
    unsafe {
        assert_eq!(PyArg_UnpackTuple(pair.as_ptr(), c"f".as_ptr(), 1, 2, out.as_ptr(), 2), 1);
    }
    assert_eq!(second, tuple::get(pair.borrow(), 1).unwrap().as_ptr());
    assert!(!errors::occurred());
}

/// A non-tuple argument object is an internal error.
#[test]
fn args_must_be_a_tuple() {
    let _gil = gil::acquire();
    let items = list::new(0).unwrap();
    let err = unsafe { parse_tuple(items.borrow(), "", &[]) }.unwrap_err();
    assert_eq!(err, ExcType::system_error("new style getargs format but argument is not a tuple"));
}
