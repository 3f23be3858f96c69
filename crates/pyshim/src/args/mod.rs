//! Format-string argument marshalling.
//!
//! The parse direction ([`parse_tuple`], [`parse_tuple_and_keywords`])
//! converts argument objects into caller-provided output slots; the build
//! direction ([`build_value`]) turns native values into a new object. Both
//! share one tokenizer, and the `extern "C"` entry points take slot and value
//! arrays in place of C varargs.

mod build;
mod format;
mod parse;

use std::ffi::{c_char, c_void};

pub use build::{PyArgValue, Py_BuildValueSlots, build_value};
pub use parse::{
    PyArg_ParseTupleAndKeywordsSlots, PyArg_ParseTupleSlots, PyArg_UnpackTuple, parse_tuple,
    parse_tuple_and_keywords, unpack_tuple,
};

use crate::{
    errors::c_str_arg,
    exception_private::{ExcType, RunResult},
};

/// Reads a NUL-terminated UTF-8 format string.
///
/// # Safety
/// `format` must be null or NUL-terminated.
pub(crate) unsafe fn format_arg<'a>(format: *const c_char) -> RunResult<&'a str> {
    // SAFETY: caller contract.
    unsafe { c_str_arg(format) }?
        .to_str()
        .map_err(|_| ExcType::system_error("format string is not valid UTF-8"))
}

/// Views `nslots` output slots; an empty view for zero slots.
///
/// # Safety
/// `slots` must be null or point to `nslots` readable pointers.
pub(crate) unsafe fn slots_arg<'a>(slots: *const *mut c_void, nslots: isize) -> RunResult<&'a [*mut c_void]> {
    let len = usize::try_from(nslots).map_err(|_| ExcType::bad_internal_call())?;
    if len == 0 {
        return Ok(&[]);
    }
    if slots.is_null() {
        return Err(ExcType::bad_internal_call());
    }
    // SAFETY: caller contract.
    Ok(unsafe { std::slice::from_raw_parts(slots, len) })
}
