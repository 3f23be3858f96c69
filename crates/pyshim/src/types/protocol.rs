//! Generic object operations dispatched on the kind tag: hashing, equality,
//! ordering, truth, length, `repr` and `str`.
//!
//! Hashing and equality agree across numeric kinds, so `1`, `1.0` and `True`
//! compare equal and hash identically. Hashing, equality and ordering walk
//! containers with explicit stacks and raise `RecursionError` past
//! [`RECURSION_LIMIT`] levels. `repr` recurses, prints `...` below
//! [`MAX_DATA_RECURSION_DEPTH`] and `[...]` for a container already being
//! printed.

use std::{
    cmp::Ordering,
    ffi::c_int,
    fmt::Write,
};

use ahash::AHashSet;

use crate::{
    errors::{RaiseOr, borrow_arg, new_ref_or_null},
    exception_private::{ExcType, RunResult},
    gil,
    object::{PyObject, PyTypeObject},
    owned::PyBorrowed,
    py_hash,
    resource::{MAX_DATA_RECURSION_DEPTH, RECURSION_LIMIT},
    types::{IntValue, Type, bytes, dict, float, list, long, str as pystr, tuple},
};

/// Rich comparison operators, numbered as in the C API.
pub const Py_LT: c_int = 0;
pub const Py_LE: c_int = 1;
pub const Py_EQ: c_int = 2;
pub const Py_NE: c_int = 3;
pub const Py_GT: c_int = 4;
pub const Py_GE: c_int = 5;

/// Borrowed items of a tuple or list. Null slots (unfilled tuples) are skipped.
pub(crate) fn sequence_items(obj: PyBorrowed<'_>) -> Vec<PyBorrowed<'_>> {
    match obj.kind() {
        Type::Tuple => tuple::items(obj)
            .iter()
            // SAFETY: the tuple owns a reference to each non-null item.
            .filter_map(|&item| unsafe { PyBorrowed::from_raw(item) })
            .collect(),
        Type::List => (0..list::len(obj)).filter_map(|i| list::get(obj, i)).collect(),
        _ => Vec::new(),
    }
}

// ============================================================================
// Hashing
// ============================================================================

/// `hash(obj)`; `TypeError` for mutable containers.
pub fn hash(obj: PyBorrowed<'_>) -> RunResult<i64> {
    if obj.kind() == Type::Tuple { hash_tuple(obj) } else { hash_scalar(obj) }
}

fn hash_scalar(obj: PyBorrowed<'_>) -> RunResult<i64> {
    match obj.kind() {
        Type::Int | Type::Bool => Ok(long::value(obj).map_or(0, IntValue::hash)),
        Type::Float => {
            let value = float::value(obj).unwrap_or_default();
            if value.is_nan() {
                Ok(py_hash::hash_pointer(obj.as_ptr() as usize))
            } else {
                Ok(py_hash::hash_f64(value))
            }
        }
        Type::Str => Ok(pystr::hash(obj).unwrap_or_default()),
        Type::Bytes => Ok(bytes::hash(obj).unwrap_or_default()),
        Type::List | Type::Dict => Err(ExcType::type_error_unhashable(obj.kind().name())),
        Type::Tuple => Err(ExcType::bad_internal_call()),
        Type::NoneType | Type::Type | Type::Exception(_) => Ok(py_hash::hash_pointer(obj.as_ptr() as usize)),
    }
}

/// A tuple whose items are being hashed.
struct HashFrame<'a> {
    items: &'a [*mut PyObject],
    hashes: Vec<i64>,
}

impl<'a> HashFrame<'a> {
    fn new(tuple: PyBorrowed<'a>) -> Self {
        let items = tuple::items(tuple);
        Self {
            items,
            hashes: Vec::with_capacity(items.len()),
        }
    }
}

/// Hashes nested tuples bottom-up from an explicit stack of frames.
fn hash_tuple(root: PyBorrowed<'_>) -> RunResult<i64> {
    let mut frames = vec![HashFrame::new(root)];
    loop {
        let frame = frames.last_mut().ok_or_else(ExcType::bad_internal_call)?;
        if let Some(&item) = frame.items.get(frame.hashes.len()) {
            // SAFETY: the tuple owns a reference to each non-null item.
            let item = unsafe { PyBorrowed::from_raw(item) }.ok_or_else(ExcType::bad_internal_call)?;
            if item.kind() == Type::Tuple {
                if frames.len() > RECURSION_LIMIT {
                    return Err(ExcType::recursion_error("while hashing a tuple"));
                }
                frames.push(HashFrame::new(item));
            } else {
                frame.hashes.push(hash_scalar(item)?);
            }
            continue;
        }
        let finished = frames.pop().ok_or_else(ExcType::bad_internal_call)?;
        let hash = py_hash::hash_tuple(finished.hashes.into_iter());
        match frames.last_mut() {
            Some(parent) => parent.hashes.push(hash),
            None => return Ok(hash),
        }
    }
}

// ============================================================================
// Comparison
// ============================================================================

/// Numeric view used for cross-kind comparison.
enum Number<'a> {
    Int(&'a IntValue),
    Float(f64),
}

fn as_number(obj: PyBorrowed<'_>) -> Option<Number<'_>> {
    if let Some(value) = long::value(obj) {
        return Some(Number::Int(value));
    }
    float::value(obj).map(Number::Float)
}

/// Exact comparison of an int with a float; `None` when the float is NaN.
fn compare_int_float(int: &IntValue, float: f64) -> Option<Ordering> {
    if float.is_nan() {
        return None;
    }
    if float.is_infinite() {
        return Some(if float > 0.0 { Ordering::Less } else { Ordering::Greater });
    }
    let truncated = IntValue::from_f64(float).ok()?.to_bigint();
    let int = int.to_bigint();
    match int.cmp(&truncated) {
        Ordering::Equal => {
            let fraction = float - float.trunc();
            Some(if fraction > 0.0 {
                Ordering::Less
            } else if fraction < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            })
        }
        unequal => Some(unequal),
    }
}

fn compare_numbers(a: &Number<'_>, b: &Number<'_>) -> Option<Ordering> {
    match (a, b) {
        (Number::Int(a), Number::Int(b)) => Some(match (a, b) {
            (IntValue::Small(a), IntValue::Small(b)) => a.cmp(b),
            _ => a.to_bigint().cmp(&b.to_bigint()),
        }),
        (Number::Float(a), Number::Float(b)) => a.partial_cmp(b),
        (Number::Int(a), Number::Float(b)) => compare_int_float(a, *b),
        (Number::Float(a), Number::Int(b)) => compare_int_float(b, *a).map(Ordering::reverse),
    }
}

/// `a == b` with Python semantics. Identical objects are always equal.
///
/// Containers are compared item by item from a worklist, first items first,
/// and the comparison stops at the first difference.
pub fn eq(a: PyBorrowed<'_>, b: PyBorrowed<'_>) -> RunResult<bool> {
    let mut pending = vec![(a, b, 0usize)];
    while let Some((a, b, depth)) = pending.pop() {
        if a.is(b) {
            continue;
        }
        if depth > RECURSION_LIMIT {
            return Err(ExcType::recursion_error("in comparison"));
        }
        if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
            if compare_numbers(&x, &y) != Some(Ordering::Equal) {
                return Ok(false);
            }
            continue;
        }
        match (a.kind(), b.kind()) {
            (Type::Str, Type::Str) if pystr::as_str(a) == pystr::as_str(b) => {}
            (Type::Bytes, Type::Bytes) if bytes::as_bytes(a) == bytes::as_bytes(b) => {}
            (Type::Tuple, Type::Tuple) | (Type::List, Type::List) => {
                let (xs, ys) = (sequence_items(a), sequence_items(b));
                if xs.len() != ys.len() {
                    return Ok(false);
                }
                pending.extend(xs.into_iter().zip(ys).rev().map(|(x, y)| (x, y, depth + 1)));
            }
            (Type::Dict, Type::Dict) => {
                if dict::len(a) != dict::len(b) {
                    return Ok(false);
                }
                for (key, value) in dict::borrowed_entries(a).into_iter().rev() {
                    let Some(other) = dict::get_item(b, key)? else {
                        return Ok(false);
                    };
                    pending.push((value, other, depth + 1));
                }
            }
            _ => return Ok(false),
        }
    }
    Ok(true)
}

/// Ordering for numbers, `str`, `bytes` and sequences thereof.
pub fn compare(a: PyBorrowed<'_>, b: PyBorrowed<'_>, op: c_int) -> RunResult<bool> {
    match op {
        Py_EQ => return eq(a, b),
        Py_NE => return eq(a, b).map(|equal| !equal),
        Py_LT | Py_LE | Py_GT | Py_GE => {}
        _ => return Err(ExcType::bad_internal_call()),
    }
    let Some(ordering) = order(a, b)? else {
        // Unordered numbers (NaN) compare false under every operator.
        return Ok(false);
    };
    Ok(match op {
        Py_LT => ordering == Ordering::Less,
        Py_LE => ordering != Ordering::Greater,
        Py_GT => ordering == Ordering::Greater,
        _ => ordering != Ordering::Less,
    })
}

/// Sequences order by their first unequal pair, so the walk descends into
/// that pair until it reaches a leaf.
fn order(a: PyBorrowed<'_>, b: PyBorrowed<'_>) -> RunResult<Option<Ordering>> {
    let (mut a, mut b) = (a, b);
    for _ in 0..=RECURSION_LIMIT {
        if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
            return Ok(compare_numbers(&x, &y));
        }
        match (a.kind(), b.kind()) {
            (Type::Str, Type::Str) => return Ok(pystr::as_str(a).partial_cmp(&pystr::as_str(b))),
            (Type::Bytes, Type::Bytes) => return Ok(bytes::as_bytes(a).partial_cmp(&bytes::as_bytes(b))),
            (Type::Tuple, Type::Tuple) | (Type::List, Type::List) => {
                let (xs, ys) = (sequence_items(a), sequence_items(b));
                let mut first_difference = None;
                for (&x, &y) in xs.iter().zip(&ys) {
                    if !eq(x, y)? {
                        first_difference = Some((x, y));
                        break;
                    }
                }
                match first_difference {
                    Some((x, y)) => (a, b) = (x, y),
                    None => return Ok(Some(xs.len().cmp(&ys.len()))),
                }
            }
            _ => {
                return Err(ExcType::type_error(format!(
                    "'<' not supported between instances of '{}' and '{}'",
                    a.get_type().name(),
                    b.get_type().name()
                )));
            }
        }
    }
    Err(ExcType::recursion_error("in comparison"))
}

// ============================================================================
// Truth and length
// ============================================================================

#[must_use]
pub fn is_true(obj: PyBorrowed<'_>) -> bool {
    match obj.kind() {
        Type::NoneType => false,
        Type::Int | Type::Bool => long::value(obj).is_some_and(|v| !v.is_zero()),
        Type::Float => float::value(obj).is_some_and(|v| v != 0.0),
        _ => !matches!(length(obj), Ok(0)),
    }
}

/// `len(obj)`; `TypeError` for kinds without a length.
pub fn length(obj: PyBorrowed<'_>) -> RunResult<usize> {
    match obj.kind() {
        // SAFETY: the kind tag guarantees the `str` layout.
        Type::Str => Ok(usize::try_from(unsafe { obj.payload::<pystr::PyUnicodeObject>() }.length).unwrap_or_default()),
        Type::Bytes => Ok(bytes::as_bytes(obj).map_or(0, <[u8]>::len)),
        Type::Tuple => Ok(tuple::items(obj).len()),
        Type::List => Ok(list::len(obj)),
        Type::Dict => Ok(dict::len(obj)),
        kind => Err(ExcType::type_error(format!("object of type '{kind}' has no len()"))),
    }
}

// ============================================================================
// repr / str
// ============================================================================

/// `repr(obj)`.
pub fn repr(obj: PyBorrowed<'_>) -> RunResult<String> {
    let mut out = String::new();
    repr_into(obj, &mut out, &mut AHashSet::new(), 0)?;
    Ok(out)
}

/// `str(obj)`: the text of a `str`, the repr of everything else.
pub fn str_string(obj: PyBorrowed<'_>) -> RunResult<String> {
    match pystr::as_str(obj) {
        Some(text) => Ok(text.to_owned()),
        None => repr(obj),
    }
}

/// `printing` holds the addresses of the containers currently being printed,
/// so a container reached again through itself prints as `[...]`.
fn repr_into(obj: PyBorrowed<'_>, out: &mut String, printing: &mut AHashSet<usize>, depth: u16) -> RunResult<()> {
    if depth > MAX_DATA_RECURSION_DEPTH {
        out.push_str("...");
        return Ok(());
    }
    match obj.kind() {
        Type::NoneType => out.push_str("None"),
        Type::Bool => out.push_str(if is_true(obj) { "True" } else { "False" }),
        Type::Int => {
            if let Some(value) = long::value(obj) {
                let _ = write!(out, "{value}");
            }
        }
        Type::Float => out.push_str(&float::repr(float::value(obj).unwrap_or_default())),
        Type::Str => out.push_str(&pystr::repr(pystr::as_str(obj).unwrap_or_default())),
        Type::Bytes => out.push_str(&bytes::repr(bytes::as_bytes(obj).unwrap_or_default())),
        kind @ (Type::Tuple | Type::List | Type::Dict) => {
            let (open, close) = match kind {
                Type::Tuple => ('(', ')'),
                Type::List => ('[', ']'),
                _ => ('{', '}'),
            };
            let id = obj.as_ptr() as usize;
            if !printing.insert(id) {
                let _ = write!(out, "{open}...{close}");
                return Ok(());
            }
            out.push(open);
            let result = container_repr_into(obj, out, printing, depth);
            printing.remove(&id);
            result?;
            out.push(close);
        }
        Type::Type => {
            // SAFETY: objects of kind `type` are static descriptors.
            let name = unsafe { obj.payload::<PyTypeObject>() }.name();
            let _ = write!(out, "<class '{name}'>");
        }
        Type::Exception(exc) => {
            let _ = write!(out, "<{exc} object at {:p}>", obj.as_ptr());
        }
    }
    Ok(())
}

/// Items of a tuple, list or dict between the brackets.
fn container_repr_into(
    obj: PyBorrowed<'_>,
    out: &mut String,
    printing: &mut AHashSet<usize>,
    depth: u16,
) -> RunResult<()> {
    if obj.kind() == Type::Dict {
        for (i, (key, value)) in dict::borrowed_entries(obj).into_iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            repr_into(key, out, printing, depth + 1)?;
            out.push_str(": ");
            repr_into(value, out, printing, depth + 1)?;
        }
        return Ok(());
    }
    let items = sequence_items(obj);
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        repr_into(*item, out, printing, depth + 1)?;
    }
    if obj.kind() == Type::Tuple && items.len() == 1 {
        out.push(',');
    }
    Ok(())
}

// ============================================================================
// Exported API
// ============================================================================

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyObject_Hash(obj: *mut PyObject) -> isize {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    let result = unsafe { borrow_arg(obj) }.and_then(hash);
    result.map(|h| isize::try_from(h).unwrap_or(isize::MAX)).or_raise(-1)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyObject_Repr(obj: *mut PyObject) -> *mut PyObject {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    let text = unsafe { borrow_arg(obj) }.and_then(repr);
    new_ref_or_null(text.and_then(|text| pystr::new(&text)))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyObject_Str(obj: *mut PyObject) -> *mut PyObject {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    let result = unsafe { borrow_arg(obj) }.and_then(|obj| {
        if obj.kind() == Type::Str {
            Ok(obj.to_owned())
        } else {
            pystr::new(&repr(obj)?)
        }
    });
    new_ref_or_null(result)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyObject_RichCompareBool(a: *mut PyObject, b: *mut PyObject, op: c_int) -> c_int {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or live objects.
    let result = unsafe { (borrow_arg(a), borrow_arg(b)) };
    let result = match result {
        (Ok(a), Ok(b)) => compare(a, b, op),
        (Err(err), _) | (_, Err(err)) => Err(err),
    };
    result.map(c_int::from).or_raise(-1)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyObject_IsTrue(obj: *mut PyObject) -> c_int {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    unsafe { borrow_arg(obj) }.map(|obj| c_int::from(is_true(obj))).or_raise(-1)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyObject_Length(obj: *mut PyObject) -> isize {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    let result = unsafe { borrow_arg(obj) }.and_then(length);
    result.map(|len| isize::try_from(len).unwrap_or(isize::MAX)).or_raise(-1)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyObject_Size(obj: *mut PyObject) -> isize {
    // SAFETY: forwarded caller contract.
    unsafe { PyObject_Length(obj) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_float_comparison_is_exact() {
        let big = IntValue::from(u64::MAX);
        assert_eq!(compare_int_float(&big, 18_446_744_073_709_551_616.0), Some(Ordering::Less));
        assert_eq!(compare_int_float(&IntValue::Small(2), 2.5), Some(Ordering::Less));
        assert_eq!(compare_int_float(&IntValue::Small(-3), -3.5), Some(Ordering::Greater));
        assert_eq!(compare_int_float(&IntValue::Small(4), 4.0), Some(Ordering::Equal));
        assert_eq!(compare_int_float(&IntValue::Small(0), f64::NAN), None);
    }
}
