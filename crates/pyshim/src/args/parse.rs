//! Parse direction: Python argument objects into native output slots.
//!
//! Each output slot is a pointer to caller storage of the C type implied by
//! its format code. Conversion stops at the first failure; slots written
//! before it keep their values and optional fields that were not supplied are
//! never touched.

use std::{
    ffi::{c_char, c_int, c_long, c_longlong, c_short, c_ulong, c_ulonglong, c_void},
    ptr,
};

use crate::{
    args::{
        format::{Code, Item, ParseFormat, parse_format},
        format_arg, slots_arg,
    },
    errors::{RaiseOr, borrow_arg},
    exception_private::{ExcType, RunError, RunResult, call_prefix, callable_name},
    gil,
    object::{PyObject, PyTypeObject},
    owned::{PyBorrowed, PyOwned},
    singletons,
    types::{IntValue, bytes, dict, list, long, protocol, str as pystr, tuple},
};

/// Walks the output slots while converting fields.
struct Parser<'s> {
    fname: Option<&'s str>,
    slots: &'s [*mut c_void],
    next: usize,
}

impl<'s> Parser<'s> {
    /// # Safety
    /// Every slot must point to writable storage of the C type its format
    /// code implies, and `O!` type slots must point to a live type object.
    unsafe fn new(fname: Option<&'s str>, slots: &'s [*mut c_void]) -> Self {
        Self { fname, slots, next: 0 }
    }

    fn slot(&mut self) -> RunResult<*mut c_void> {
        let slot = *self
            .slots
            .get(self.next)
            .ok_or_else(|| ExcType::system_error("more format units than output slots"))?;
        self.next += 1;
        if slot.is_null() {
            return Err(ExcType::bad_internal_call());
        }
        Ok(slot)
    }

    fn store<T>(&mut self, value: T) -> RunResult<()> {
        let slot = self.slot()?;
        // SAFETY: `Parser::new` contract: the slot addresses storage for a `T`.
        unsafe { slot.cast::<T>().write(value) };
        Ok(())
    }

    /// Steps over the slots of an optional field that was not supplied.
    fn skip(&mut self, item: &Item) {
        self.next += item.width();
    }

    fn mismatch(&self, position: usize, expected: &str, arg: PyBorrowed<'_>) -> RunError {
        ExcType::type_error_argument(self.fname, position, expected, arg.get_type().name())
    }

    fn int<'a>(&self, arg: PyBorrowed<'a>, position: usize) -> RunResult<&'a IntValue> {
        long::value(arg).ok_or_else(|| self.mismatch(position, "int", arg))
    }

    fn real(&self, arg: PyBorrowed<'_>, position: usize) -> RunResult<f64> {
        long::number_as_f64(arg).unwrap_or_else(|| Err(self.mismatch(position, "float", arg)))
    }

    fn convert(&mut self, item: &Item, arg: PyBorrowed<'_>, position: usize) -> RunResult<()> {
        let (code, with_length) = match item {
            Item::Unit { code, with_length } => (*code, *with_length),
            Item::Tuple(items) => return self.convert_sequence(items, arg, position),
            Item::List(_) | Item::Dict(_) => return Err(ExcType::bad_internal_call()),
        };
        match code {
            Code::Byte => {
                let value = ranged::<u8>(
                    self.int(arg, position)?,
                    "unsigned byte integer is less than minimum",
                    "unsigned byte integer is greater than maximum",
                )?;
                self.store(value)
            }
            Code::Short => {
                let value = ranged::<c_short>(
                    self.int(arg, position)?,
                    "signed short integer is less than minimum",
                    "signed short integer is greater than maximum",
                )?;
                self.store(value)
            }
            Code::Int => {
                let value = ranged::<c_int>(
                    self.int(arg, position)?,
                    "signed integer is less than minimum",
                    "signed integer is greater than maximum",
                )?;
                self.store(value)
            }
            Code::Long => {
                let value: c_long = self.int(arg, position)?.to_primitive("Python int too large to convert to C long")?;
                self.store(value)
            }
            Code::LongLong => {
                let value: c_longlong = self.int(arg, position)?.to_primitive("int too big to convert")?;
                self.store(value)
            }
            Code::Ssize => {
                let value: isize = self
                    .int(arg, position)?
                    .to_primitive("Python int too large to convert to C ssize_t")?;
                self.store(value)
            }
            Code::ULongMask => {
                let bits = self.int(arg, position)?.low_bits();
                self.store(bits as c_ulong)
            }
            Code::ULongLongMask => {
                let bits: c_ulonglong = self.int(arg, position)?.low_bits();
                self.store(bits)
            }
            Code::Double => {
                let value = self.real(arg, position)?;
                self.store(value)
            }
            Code::Float => {
                let value = narrow(self.real(arg, position)?);
                self.store(value)
            }
            Code::Predicate => self.store(c_int::from(protocol::is_true(arg))),
            Code::Str | Code::NullableStr => self.convert_text(arg, position, code == Code::NullableStr, with_length),
            Code::Bytes => self.convert_bytes(arg, position, with_length),
            Code::StrObject if pystr::check(arg) => self.store(arg.as_ptr()),
            Code::StrObject => Err(self.mismatch(position, "str", arg)),
            Code::BytesObject if bytes::check(arg) => self.store(arg.as_ptr()),
            Code::BytesObject => Err(self.mismatch(position, "bytes", arg)),
            Code::Object => self.store(arg.as_ptr()),
            Code::CheckedObject => {
                let tp = self.slot()?.cast::<PyTypeObject>().cast_const();
                // SAFETY: `Parser::new` contract: `O!` type slots hold a live type object.
                let tp = unsafe { &*tp };
                if !arg.get_type().is_subtype_of(tp) {
                    return Err(self.mismatch(position, tp.name(), arg));
                }
                self.store(arg.as_ptr())
            }
            Code::Steal => Err(ExcType::bad_internal_call()),
        }
    }

    fn convert_text(&mut self, arg: PyBorrowed<'_>, position: usize, nullable: bool, with_length: bool) -> RunResult<()> {
        if nullable && arg.is(singletons::none()) {
            self.store::<*const c_char>(ptr::null())?;
            if with_length {
                self.store::<isize>(0)?;
            }
            return Ok(());
        }
        let (Some(text), Some(c_text)) = (pystr::as_str(arg), pystr::as_c_str(arg)) else {
            return Err(self.mismatch(position, if nullable { "str or None" } else { "str" }, arg));
        };
        if !with_length && text.contains('\0') {
            return Err(ExcType::ValueError.with_message("embedded null character"));
        }
        self.store(c_text.as_ptr())?;
        if with_length {
            self.store(isize::try_from(text.len()).unwrap_or(isize::MAX))?;
        }
        Ok(())
    }

    fn convert_bytes(&mut self, arg: PyBorrowed<'_>, position: usize, with_length: bool) -> RunResult<()> {
        let (Some(data), Some(c_data)) = (bytes::as_bytes(arg), bytes::as_c_str(arg)) else {
            return Err(self.mismatch(position, "bytes", arg));
        };
        if !with_length && data.contains(&0) {
            return Err(ExcType::ValueError.with_message("embedded null byte"));
        }
        self.store(c_data.as_ptr())?;
        if with_length {
            self.store(isize::try_from(data.len()).unwrap_or(isize::MAX))?;
        }
        Ok(())
    }

    /// `(...)`: a tuple or list whose items fill the nested fields.
    fn convert_sequence(&mut self, items: &[Item], arg: PyBorrowed<'_>, position: usize) -> RunResult<()> {
        if !tuple::check(arg) && !list::check(arg) {
            return Err(ExcType::type_error(format!(
                "{}argument {position} must be {}-item sequence, not {}",
                call_prefix(self.fname),
                items.len(),
                arg.get_type().name()
            )));
        }
        let children = protocol::sequence_items(arg);
        if children.len() != items.len() {
            return Err(ExcType::type_error(format!(
                "{}argument {position} must be sequence of length {}, not {}",
                call_prefix(self.fname),
                items.len(),
                children.len()
            )));
        }
        for (item, child) in items.iter().zip(children) {
            self.convert(item, child, position)?;
        }
        Ok(())
    }
}

/// Range-checked narrowing with separate messages for each side.
fn ranged<T: TryFrom<i64>>(value: &IntValue, below: &str, above: &str) -> RunResult<T> {
    let overflow = || ExcType::overflow_error(if value.is_negative() { below } else { above });
    value
        .to_i64()
        .and_then(|small| T::try_from(small).ok())
        .ok_or_else(overflow)
}

#[expect(clippy::cast_possible_truncation, reason = "the `f` code stores a C float")]
fn narrow(value: f64) -> f32 {
    value as f32
}

fn positional_args(args: PyBorrowed<'_>) -> RunResult<Vec<PyBorrowed<'_>>> {
    if tuple::check(args) {
        Ok(protocol::sequence_items(args))
    } else {
        Err(ExcType::system_error("new style getargs format but argument is not a tuple"))
    }
}

fn arity_error(format: &ParseFormat, max: usize, given: usize) -> RunError {
    if let Some(message) = &format.message {
        return ExcType::type_error(message.clone());
    }
    if format.required == max {
        ExcType::type_error_arg_count(format.fname(), max, given)
    } else if given < format.required {
        ExcType::type_error_at_least(format.fname(), format.required, given)
    } else {
        ExcType::type_error_at_most(format.fname(), max, given)
    }
}

// ============================================================================
// Rust API
// ============================================================================

/// Converts the items of the `args` tuple into `slots` according to `format`.
///
/// # Safety
/// Each slot must point to writable storage of the C type its format code
/// implies (two slots for `#` codes and for `O!`, whose first slot is the
/// type object itself).
pub unsafe fn parse_tuple(args: PyBorrowed<'_>, format: &str, slots: &[*mut c_void]) -> RunResult<()> {
    let format = parse_format(format)?;
    let args = positional_args(args)?;
    let max = format.items.len();
    if args.len() < format.required || args.len() > max {
        return Err(arity_error(&format, max, args.len()));
    }
    // SAFETY: forwarded caller contract.
    let mut parser = unsafe { Parser::new(format.fname(), slots) };
    for (index, item) in format.items.iter().enumerate() {
        match args.get(index) {
            Some(arg) => parser.convert(item, *arg, index + 1)?,
            None => parser.skip(item),
        }
    }
    Ok(())
}

/// Like [`parse_tuple`], with fields also fillable by keyword.
///
/// `keywords` names each top-level field in order; an empty name marks a
/// positional-only field.
///
/// # Safety
/// Same slot contract as [`parse_tuple`].
pub unsafe fn parse_tuple_and_keywords(
    args: PyBorrowed<'_>,
    kwargs: Option<PyBorrowed<'_>>,
    format: &str,
    keywords: &[&str],
    slots: &[*mut c_void],
) -> RunResult<()> {
    let format = parse_format(format)?;
    let fname = format.fname();
    let max = format.items.len();
    if keywords.len() != max {
        return Err(ExcType::system_error(format!(
            "keyword list has {} entries but format has {max} fields",
            keywords.len()
        )));
    }
    let args = positional_args(args)?;
    let kwargs = match kwargs {
        Some(kwargs) if dict::check(kwargs) => dict::entries(kwargs),
        Some(_) => return Err(ExcType::bad_internal_call()),
        None => Vec::new(),
    };
    let mut named: Vec<(&str, &PyOwned)> = Vec::with_capacity(kwargs.len());
    for (key, value) in &kwargs {
        let key = pystr::as_str(key.borrow()).ok_or_else(|| ExcType::type_error("keywords must be strings"))?;
        named.push((key, value));
    }
    let lookup = |name: &str| {
        named
            .iter()
            .find(|(key, _)| !name.is_empty() && *key == name)
            .map(|(_, value)| value.borrow())
    };

    if args.len() > format.positional {
        return Err(arity_error(&format, format.positional, args.len()));
    }

    // SAFETY: forwarded caller contract.
    let mut parser = unsafe { Parser::new(fname, slots) };
    for (index, (item, &name)) in format.items.iter().zip(keywords).enumerate() {
        let arg = match args.get(index) {
            Some(arg) => {
                if lookup(name).is_some() {
                    return Err(ExcType::type_error(format!(
                        "argument for {} given by name ('{name}') and position ({})",
                        callable_name(fname),
                        index + 1
                    )));
                }
                Some(*arg)
            }
            None => lookup(name),
        };
        match arg {
            Some(arg) => parser.convert(item, arg, index + 1)?,
            None if index < format.required => {
                if name.is_empty() {
                    return Err(arity_error(&format, format.positional, args.len()));
                }
                return Err(ExcType::type_error(format!(
                    "{} missing required argument '{name}' (pos {})",
                    callable_name(fname),
                    index + 1
                )));
            }
            None => parser.skip(item),
        }
    }

    if let Some((unknown, _)) = named.iter().find(|(key, _)| !keywords.contains(key) || key.is_empty()) {
        let target = fname.map_or_else(|| "this function".to_owned(), |name| format!("{name}()"));
        return Err(ExcType::type_error(format!(
            "'{unknown}' is an invalid keyword argument for {target}"
        )));
    }
    Ok(())
}

/// Checks the length of `args` and returns its items, without conversion.
pub fn unpack_tuple<'a>(args: PyBorrowed<'a>, name: Option<&str>, min: usize, max: usize) -> RunResult<Vec<PyBorrowed<'a>>> {
    let items = positional_args(args)?;
    let given = items.len();
    if given >= min && given <= max {
        return Ok(items);
    }
    let (qualifier, bound) = if given < min {
        (if min == max { "" } else { "at least " }, min)
    } else {
        (if min == max { "" } else { "at most " }, max)
    };
    let plural = if bound == 1 { "" } else { "s" };
    let message = match name {
        Some(name) => format!("{name} expected {qualifier}{bound} argument{plural}, got {given}"),
        None => format!("unpacked tuple should have {qualifier}{bound} element{plural}, but has {given}"),
    };
    Err(ExcType::type_error(message))
}

// ============================================================================
// Exported API
// ============================================================================

/// Array form of `PyArg_ParseTuple`. Returns 1 on success, 0 with the error set.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyArg_ParseTupleSlots(
    args: *mut PyObject,
    format: *const c_char,
    slots: *const *mut c_void,
    nslots: isize,
) -> c_int {
    let _gil = gil::acquire();
    // SAFETY: callers pass a live tuple, a NUL-terminated format and `nslots`
    // slots matching it.
    let result = unsafe {
        borrow_arg(args).and_then(|args| parse_tuple(args, format_arg(format)?, slots_arg(slots, nslots)?))
    };
    result.map(|()| 1).or_raise(0)
}

/// Reads a NULL-terminated array of keyword names.
///
/// # Safety
/// `keywords` must be a NULL-terminated array of NUL-terminated strings.
unsafe fn keyword_list<'a>(keywords: *const *const c_char) -> RunResult<Vec<&'a str>> {
    if keywords.is_null() {
        return Err(ExcType::bad_internal_call());
    }
    let mut names = Vec::new();
    for index in 0.. {
        // SAFETY: caller contract; reading stops at the terminator.
        let name = unsafe { keywords.add(index).read() };
        if name.is_null() {
            break;
        }
        // SAFETY: caller contract.
        let name = unsafe { crate::errors::c_str_arg(name) }?;
        names.push(
            name.to_str()
                .map_err(|_| ExcType::system_error("keyword name is not valid UTF-8"))?,
        );
    }
    Ok(names)
}

/// Array form of `PyArg_ParseTupleAndKeywords`. Returns 1 on success, 0 with
/// the error set.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyArg_ParseTupleAndKeywordsSlots(
    args: *mut PyObject,
    kwargs: *mut PyObject,
    format: *const c_char,
    keywords: *const *const c_char,
    slots: *const *mut c_void,
    nslots: isize,
) -> c_int {
    let _gil = gil::acquire();
    // SAFETY: callers pass a live tuple, null or a live dict, a NUL-terminated
    // format, a NULL-terminated keyword array and `nslots` slots.
    let result = unsafe {
        borrow_arg(args).and_then(|args| {
            parse_tuple_and_keywords(
                args,
                PyBorrowed::from_raw(kwargs),
                format_arg(format)?,
                &keyword_list(keywords)?,
                slots_arg(slots, nslots)?,
            )
        })
    };
    result.map(|()| 1).or_raise(0)
}

/// Stores borrowed references to the items of `args` into the first slots.
/// Returns 1 on success, 0 with the error set.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyArg_UnpackTuple(
    args: *mut PyObject,
    name: *const c_char,
    min: isize,
    max: isize,
    slots: *const *mut c_void,
    nslots: isize,
) -> c_int {
    let _gil = gil::acquire();
    let result = (|| {
        // SAFETY: callers pass a live tuple.
        let args = unsafe { borrow_arg(args) }?;
        let name = if name.is_null() {
            None
        } else {
            // SAFETY: a non-null name is NUL-terminated.
            Some(unsafe { format_arg(name) }?)
        };
        let min = usize::try_from(min).map_err(|_| ExcType::bad_internal_call())?;
        let max = usize::try_from(max).map_err(|_| ExcType::bad_internal_call())?;
        let items = unpack_tuple(args, name, min, max)?;
        // SAFETY: callers pass `nslots` slots.
        let slots = unsafe { slots_arg(slots, nslots) }?;
        if slots.len() < items.len() {
            return Err(ExcType::system_error("more arguments than output slots"));
        }
        for (slot, item) in slots.iter().zip(items) {
            // SAFETY: each slot addresses a `PyObject *`.
            unsafe { slot.cast::<*mut PyObject>().write(item.as_ptr()) };
        }
        Ok(())
    })();
    result.map(|()| 1).or_raise(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranged_reports_the_violated_bound() {
        let err = ranged::<u8>(&IntValue::Small(-1), "low", "high").unwrap_err();
        assert_eq!(err, ExcType::overflow_error("low"));
        let err = ranged::<u8>(&IntValue::Small(256), "low", "high").unwrap_err();
        assert_eq!(err, ExcType::overflow_error("high"));
        let big = IntValue::from(u64::MAX);
        assert_eq!(ranged::<c_int>(&big, "low", "high").unwrap_err(), ExcType::overflow_error("high"));
        assert_eq!(ranged::<u8>(&IntValue::Small(255), "low", "high"), Ok(255));
    }

    #[test]
    fn unpack_messages() {
        let _gil = gil::acquire();
        let args = tuple::from_owned(vec![long::new(1i64).unwrap()]).unwrap();
        let err = unpack_tuple(args.borrow(), Some("f"), 2, 3).unwrap_err();
        assert_eq!(err, ExcType::type_error("f expected at least 2 arguments, got 1"));
        let err = unpack_tuple(args.borrow(), None, 0, 0).unwrap_err();
        assert_eq!(err, ExcType::type_error("unpacked tuple should have 0 elements, but has 1"));
        assert_eq!(unpack_tuple(args.borrow(), None, 1, 1).unwrap().len(), 1);
    }
}
