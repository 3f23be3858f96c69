//! `dict`: an insertion-ordered hash map of owned keys and values.
//!
//! Storage follows the compact-dict layout: a `HashTable<usize>` maps key
//! hashes to positions in a dense `Vec<DictEntry>`, so iteration order is
//! insertion order and lookups stay O(1). Keys compare with Python equality,
//! so `1`, `1.0` and `True` are the same key.

use std::{
    ffi::{c_char, c_int},
    ptr::{self, NonNull},
};

use hashbrown::{HashTable, hash_table::Entry};

use crate::{
    errors::{RaiseOr, borrow_arg, c_str_arg, new_ref_or_null, status},
    exception_private::{ExcType, RunError, RunResult},
    gil,
    heap::{self, ReleaseStack},
    object::{PyObject, PyTypeObject, TypeFlags, builtin_type},
    owned::{PyBorrowed, PyOwned},
    types::{Type, list, protocol, str as pystr, tuple},
};

/// Hash table payload of a `dict`.
#[derive(Debug, Default)]
pub(crate) struct DictTable {
    /// Maps the entry hash to its index in `entries`.
    indices: HashTable<usize>,
    /// Dense, insertion-ordered entries.
    entries: Vec<DictEntry>,
}

#[derive(Debug)]
struct DictEntry {
    key: PyOwned,
    value: PyOwned,
    /// The Python hash of `key`, kept for `insert_unique` rehashing.
    hash: i64,
}

fn table_hash(hash: i64) -> u64 {
    u64::from_ne_bytes(hash.to_ne_bytes())
}

/// Key equality during a table lookup; the first error is parked in `failure`
/// and every later candidate is rejected.
fn keys_equal(key: PyBorrowed<'_>, candidate: PyBorrowed<'_>, failure: &mut Option<RunError>) -> bool {
    if failure.is_some() {
        return false;
    }
    protocol::eq(key, candidate).unwrap_or_else(|err| {
        *failure = Some(err);
        false
    })
}

impl DictTable {
    /// Index of the entry equal to `key`. Equality errors abort the lookup.
    fn find(&self, key: PyBorrowed<'_>, hash: i64) -> RunResult<Option<usize>> {
        let mut failure = None;
        let found = self
            .indices
            .find(table_hash(hash), |&index| {
                let entry = &self.entries[index];
                entry.hash == hash && keys_equal(key, entry.key.borrow(), &mut failure)
            })
            .copied();
        failure.map_or(Ok(found), Err)
    }

    /// Inserts or replaces. On replacement the original key object is kept and
    /// the displaced objects are returned for the caller to release.
    fn set(&mut self, key: PyOwned, value: PyOwned, hash: i64) -> RunResult<Option<(PyOwned, PyOwned)>> {
        if let Some(index) = self.find(key.borrow(), hash)? {
            let old_value = std::mem::replace(&mut self.entries[index].value, value);
            return Ok(Some((key, old_value)));
        }
        let index = self.entries.len();
        self.entries.push(DictEntry { key, value, hash });
        let entries = &self.entries;
        self.indices
            .insert_unique(table_hash(hash), index, |&i| table_hash(entries[i].hash));
        Ok(None)
    }

    fn remove(&mut self, key: PyBorrowed<'_>, hash: i64) -> RunResult<Option<DictEntry>> {
        let entries = &self.entries;
        let mut failure = None;
        let entry = self.indices.entry(
            table_hash(hash),
            |&index| entries[index].hash == hash && keys_equal(key, entries[index].key.borrow(), &mut failure),
            |&index| table_hash(entries[index].hash),
        );
        if let Some(err) = failure {
            return Err(err);
        }
        let Entry::Occupied(occupied) = entry else {
            return Ok(None);
        };
        let (removed_index, _) = occupied.remove();
        let removed = self.entries.remove(removed_index);
        // Entries after the removed slot shift left by one, so stored indices
        // must follow.
        for index in &mut self.indices {
            if *index > removed_index {
                *index -= 1;
            }
        }
        Ok(Some(removed))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct PyDictObject {
    pub ob_base: PyObject,
    /// Number of entries.
    pub ma_used: isize,
    table: DictTable,
}

#[unsafe(no_mangle)]
pub static PyDict_Type: PyTypeObject = builtin_type!(
    name: c"dict",
    kind: Type::Dict,
    basicsize: size_of::<PyDictObject>(),
    itemsize: 0,
    flags: TypeFlags::BASETYPE.union(TypeFlags::DICT_SUBCLASS),
    base: ptr::null(),
    dealloc: Some(dict_dealloc),
);

/// # Safety
/// `obj` is a dying dict.
unsafe fn dict_dealloc(obj: NonNull<PyObject>, stack: &mut ReleaseStack) {
    // SAFETY: the table was initialized by `new` and is moved out exactly once.
    let DictTable { indices, entries } = unsafe { ptr::read(&raw const (*obj.cast::<PyDictObject>().as_ptr()).table) };
    drop(indices);
    let children = entries
        .into_iter()
        .flat_map(|DictEntry { key, value, .. }| [key.into_raw(), value.into_raw()]);
    // SAFETY: the dict owned one reference to every key and value.
    unsafe { stack.release_children(children) };
}

/// Runs `f` with exclusive access to a dict's table, then refreshes `ma_used`.
///
/// `f` must not call back into code that could reach the same dict's table;
/// objects to release are returned out of `f` and dropped by the caller.
fn with_table<R>(obj: PyBorrowed<'_>, f: impl FnOnce(&mut DictTable) -> R) -> R {
    let dict = obj.as_ptr().cast::<PyDictObject>();
    // SAFETY: `obj` is a live dict; the lock serializes access and no other
    // reference into the table exists for the duration of `f`.
    unsafe {
        let result = f(&mut (*dict).table);
        (*dict).ma_used = isize::try_from((*dict).table.len()).unwrap_or(isize::MAX);
        result
    }
}

// ============================================================================
// Rust API
// ============================================================================

pub fn new() -> RunResult<PyOwned> {
    let obj = heap::alloc_object(&PyDict_Type, 0)?;
    // SAFETY: fresh `PyDictObject` block; the table is written before use.
    unsafe {
        (&raw mut (*obj.cast::<PyDictObject>().as_ptr()).table).write(DictTable::default());
        Ok(PyOwned::from_non_null(obj))
    }
}

#[must_use]
pub fn check(obj: PyBorrowed<'_>) -> bool {
    obj.get_type().has_flags(TypeFlags::DICT_SUBCLASS)
}

fn expect_dict(obj: PyBorrowed<'_>) -> RunResult<()> {
    if check(obj) { Ok(()) } else { Err(ExcType::bad_internal_call()) }
}

#[must_use]
pub fn len(obj: PyBorrowed<'_>) -> usize {
    if check(obj) { with_table(obj, |table| table.len()) } else { 0 }
}

/// Borrowed value for `key`, `Ok(None)` when absent. The reference is only
/// valid until the dict is mutated.
pub fn get_item<'a>(obj: PyBorrowed<'a>, key: PyBorrowed<'_>) -> RunResult<Option<PyBorrowed<'a>>> {
    expect_dict(obj)?;
    let hash = protocol::hash(key)?;
    let value = with_table(obj, |table| {
        Ok::<_, RunError>(table.find(key, hash)?.map(|index| table.entries[index].value.as_ptr()))
    })?;
    // SAFETY: the dict owns a reference to the value.
    Ok(value.and_then(|value| unsafe { PyBorrowed::from_raw(value) }))
}

/// Inserts new references to `key` and `value`.
pub fn set_item(obj: PyBorrowed<'_>, key: PyBorrowed<'_>, value: PyBorrowed<'_>) -> RunResult<()> {
    expect_dict(obj)?;
    let hash = protocol::hash(key)?;
    let displaced = with_table(obj, |table| table.set(key.to_owned(), value.to_owned(), hash))?;
    drop(displaced);
    Ok(())
}

/// Removes `key`, raising `KeyError` when absent.
pub fn del_item(obj: PyBorrowed<'_>, key: PyBorrowed<'_>) -> RunResult<()> {
    expect_dict(obj)?;
    let hash = protocol::hash(key)?;
    match with_table(obj, |table| table.remove(key, hash))? {
        Some(removed) => {
            drop(removed);
            Ok(())
        }
        None => Err(ExcType::KeyError.with_message(protocol::repr(key)?)),
    }
}

pub fn contains(obj: PyBorrowed<'_>, key: PyBorrowed<'_>) -> RunResult<bool> {
    Ok(get_item(obj, key)?.is_some())
}

/// Removes every entry.
pub fn clear(obj: PyBorrowed<'_>) {
    if check(obj) {
        let old = with_table(obj, std::mem::take);
        drop(old);
    }
}

/// New references to every `(key, value)` pair, in insertion order.
#[must_use]
pub fn entries(obj: PyBorrowed<'_>) -> Vec<(PyOwned, PyOwned)> {
    if !check(obj) {
        return Vec::new();
    }
    with_table(obj, |table| {
        table
            .entries
            .iter()
            .map(|entry| (entry.key.clone(), entry.value.clone()))
            .collect()
    })
}

/// Borrowed `(key, value)` pairs in insertion order, valid until the dict is
/// mutated.
pub(crate) fn borrowed_entries<'a>(obj: PyBorrowed<'a>) -> Vec<(PyBorrowed<'a>, PyBorrowed<'a>)> {
    if !check(obj) {
        return Vec::new();
    }
    (0..len(obj)).filter_map(|pos| entry_at(obj, pos)).collect()
}

/// Borrowed pair at position `pos`, for `PyDict_Next`.
fn entry_at<'a>(obj: PyBorrowed<'a>, pos: usize) -> Option<(PyBorrowed<'a>, PyBorrowed<'a>)> {
    let (key, value) = with_table(obj, |table| {
        table.entries.get(pos).map(|entry| (entry.key.as_ptr(), entry.value.as_ptr()))
    })?;
    // SAFETY: the dict owns references to both objects.
    unsafe { Some((PyBorrowed::from_raw(key)?, PyBorrowed::from_raw(value)?)) }
}

pub fn copy(obj: PyBorrowed<'_>) -> RunResult<PyOwned> {
    expect_dict(obj)?;
    let copy = new()?;
    for (key, value) in entries(obj) {
        set_item(copy.borrow(), key.borrow(), value.borrow())?;
    }
    Ok(copy)
}

pub fn keys(obj: PyBorrowed<'_>) -> RunResult<PyOwned> {
    expect_dict(obj)?;
    list::from_owned(entries(obj).into_iter().map(|(key, _)| key).collect())
}

pub fn values(obj: PyBorrowed<'_>) -> RunResult<PyOwned> {
    expect_dict(obj)?;
    list::from_owned(entries(obj).into_iter().map(|(_, value)| value).collect())
}

pub fn items(obj: PyBorrowed<'_>) -> RunResult<PyOwned> {
    expect_dict(obj)?;
    let pairs = entries(obj)
        .into_iter()
        .map(|(key, value)| tuple::from_owned(vec![key, value]))
        .collect::<RunResult<Vec<_>>>()?;
    list::from_owned(pairs)
}

// ============================================================================
// Exported API
// ============================================================================

#[unsafe(no_mangle)]
pub extern "C" fn PyDict_New() -> *mut PyObject {
    let _gil = gil::acquire();
    new_ref_or_null(new())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyDict_Size(obj: *mut PyObject) -> isize {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    let result = unsafe { borrow_arg(obj) }.and_then(|obj| {
        expect_dict(obj)?;
        Ok(isize::try_from(len(obj)).unwrap_or(isize::MAX))
    });
    result.or_raise(-1)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyDict_GetItem(obj: *mut PyObject, key: *mut PyObject) -> *mut PyObject {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or live objects.
    let result = unsafe { borrow_arg(obj) }.and_then(|obj| get_item(obj, unsafe { borrow_arg(key) }?));
    result
        .map(|value| value.map_or(ptr::null_mut(), PyBorrowed::as_ptr))
        .or_raise(ptr::null_mut())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyDict_GetItemString(obj: *mut PyObject, key: *const c_char) -> *mut PyObject {
    let _gil = gil::acquire();
    // SAFETY: callers pass a NUL-terminated key.
    let key = match unsafe { c_str_arg(key) }.and_then(|key| pystr::from_utf8(key.to_bytes())) {
        Ok(key) => key,
        Err(err) => {
            err.restore();
            return ptr::null_mut();
        }
    };
    // SAFETY: forwarded caller contract; `key` is live for the call.
    unsafe { PyDict_GetItem(obj, key.as_ptr()) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyDict_SetItem(obj: *mut PyObject, key: *mut PyObject, value: *mut PyObject) -> c_int {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or live objects.
    let result = unsafe { (borrow_arg(obj), borrow_arg(key), borrow_arg(value)) };
    status(match result {
        (Ok(obj), Ok(key), Ok(value)) => set_item(obj, key, value),
        (Err(err), _, _) | (_, Err(err), _) | (_, _, Err(err)) => Err(err),
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyDict_SetItemString(obj: *mut PyObject, key: *const c_char, value: *mut PyObject) -> c_int {
    let _gil = gil::acquire();
    // SAFETY: callers pass a NUL-terminated key.
    match unsafe { c_str_arg(key) }.and_then(|key| pystr::from_utf8(key.to_bytes())) {
        // SAFETY: forwarded caller contract; `key` is live for the call.
        Ok(key) => unsafe { PyDict_SetItem(obj, key.as_ptr(), value) },
        Err(err) => status(Err(err)),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyDict_DelItem(obj: *mut PyObject, key: *mut PyObject) -> c_int {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or live objects.
    let result = unsafe { borrow_arg(obj) }.and_then(|obj| del_item(obj, unsafe { borrow_arg(key) }?));
    status(result)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyDict_DelItemString(obj: *mut PyObject, key: *const c_char) -> c_int {
    let _gil = gil::acquire();
    // SAFETY: callers pass a NUL-terminated key.
    match unsafe { c_str_arg(key) }.and_then(|key| pystr::from_utf8(key.to_bytes())) {
        // SAFETY: forwarded caller contract; `key` is live for the call.
        Ok(key) => unsafe { PyDict_DelItem(obj, key.as_ptr()) },
        Err(err) => status(Err(err)),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyDict_Clear(obj: *mut PyObject) {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    if let Some(obj) = unsafe { PyBorrowed::from_raw(obj) } {
        clear(obj);
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyDict_Contains(obj: *mut PyObject, key: *mut PyObject) -> c_int {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or live objects.
    let result = unsafe { borrow_arg(obj) }.and_then(|obj| contains(obj, unsafe { borrow_arg(key) }?));
    result.map(c_int::from).or_raise(-1)
}

/// Iterates entries: returns 1 and writes borrowed key/value while `*pos` is in range.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyDict_Next(
    obj: *mut PyObject,
    pos: *mut isize,
    key: *mut *mut PyObject,
    value: *mut *mut PyObject,
) -> c_int {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    let Some(obj) = (unsafe { PyBorrowed::from_raw(obj) }).filter(|obj| check(*obj)) else {
        return 0;
    };
    let Some(pos) = NonNull::new(pos) else {
        return 0;
    };
    // SAFETY: callers pass a valid position cursor.
    let Ok(index) = usize::try_from(unsafe { pos.read() }) else {
        return 0;
    };
    let Some((k, v)) = entry_at(obj, index) else {
        return 0;
    };
    // SAFETY: callers pass valid out-pointers, or null to skip.
    unsafe {
        pos.write(pos.read() + 1);
        if !key.is_null() {
            key.write(k.as_ptr());
        }
        if !value.is_null() {
            value.write(v.as_ptr());
        }
    }
    1
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyDict_Keys(obj: *mut PyObject) -> *mut PyObject {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    new_ref_or_null(unsafe { borrow_arg(obj) }.and_then(keys))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyDict_Values(obj: *mut PyObject) -> *mut PyObject {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    new_ref_or_null(unsafe { borrow_arg(obj) }.and_then(values))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyDict_Items(obj: *mut PyObject) -> *mut PyObject {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    new_ref_or_null(unsafe { borrow_arg(obj) }.and_then(items))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyDict_Copy(obj: *mut PyObject) -> *mut PyObject {
    let _gil = gil::acquire();
    // SAFETY: callers pass null or a live object.
    new_ref_or_null(unsafe { borrow_arg(obj) }.and_then(copy))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyDict_Check(obj: *mut PyObject) -> c_int {
    // SAFETY: callers pass null or a live object.
    unsafe { PyBorrowed::from_raw(obj) }.map_or(0, |obj| c_int::from(check(obj)))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyDict_CheckExact(obj: *mut PyObject) -> c_int {
    // SAFETY: callers pass null or a live object.
    unsafe { PyBorrowed::from_raw(obj) }.map_or(0, |obj| c_int::from(obj.kind() == Type::Dict))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::long;

    #[test]
    fn removal_keeps_indices_aligned() {
        let _gil = gil::acquire();
        let dict = new().unwrap();
        let keys: Vec<_> = (0..5i64).map(|v| long::new(v).unwrap()).collect();
        for key in &keys {
            set_item(dict.borrow(), key.borrow(), key.borrow()).unwrap();
        }
        del_item(dict.borrow(), keys[1].borrow()).unwrap();
        for (i, key) in keys.iter().enumerate() {
            let found = get_item(dict.borrow(), key.borrow()).unwrap();
            assert_eq!(found.is_some(), i != 1);
        }
        assert_eq!(len(dict.borrow()), 4);
    }

    #[test]
    fn replacing_keeps_the_original_key() {
        let _gil = gil::acquire();
        let dict = new().unwrap();
        let first = long::new(7i64).unwrap();
        let second = long::new(7i64).unwrap();
        set_item(dict.borrow(), first.borrow(), first.borrow()).unwrap();
        set_item(dict.borrow(), second.borrow(), second.borrow()).unwrap();
        let (key, value) = entries(dict.borrow()).pop().unwrap();
        assert!(key.is(first.borrow()));
        assert!(value.is(second.borrow()));
        assert_eq!(second.refcnt(), 3);
    }
}
