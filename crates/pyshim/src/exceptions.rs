//! Static exception class descriptors and the exported `PyExc_*` variables.
//!
//! Each [`ExcType`] has one immortal descriptor whose `tp_base` mirrors the
//! standard hierarchy, so `PyErr_GivenExceptionMatches` is a plain walk of the
//! base chain.

use std::ptr;

use crate::{
    exception_private::ExcType,
    object::{ObjectPtr, PyObject, PyTypeObject, TypeFlags, builtin_type},
    types::Type,
};

macro_rules! exception_types {
    ($($exc:ident => $descr:ident, $export:ident, base: $base:expr;)*) => {
        $(
            static $descr: PyTypeObject = builtin_type!(
                name: {
                    const NAME: &std::ffi::CStr = match std::ffi::CStr::from_bytes_with_nul(
                        concat!(stringify!($exc), "\0").as_bytes(),
                    ) {
                        Ok(name) => name,
                        Err(_) => panic!("exception names never contain NUL"),
                    };
                    NAME
                },
                kind: Type::Exception(ExcType::$exc),
                basicsize: size_of::<PyObject>(),
                itemsize: 0,
                flags: TypeFlags::BASETYPE.union(TypeFlags::BASE_EXC_SUBCLASS),
                base: $base,
                dealloc: None,
            );

            #[unsafe(no_mangle)]
            pub static $export: ObjectPtr = ObjectPtr::new((&raw const $descr).cast::<PyObject>());
        )*

        /// The static descriptor of an exception kind.
        #[must_use]
        pub fn exception_type(exc: ExcType) -> &'static PyTypeObject {
            match exc {
                $(ExcType::$exc => &$descr,)*
            }
        }
    };
}

exception_types! {
    BaseException => BASE_EXCEPTION, PyExc_BaseException, base: ptr::null();
    Exception => EXCEPTION, PyExc_Exception, base: &raw const BASE_EXCEPTION;
    ArithmeticError => ARITHMETIC_ERROR, PyExc_ArithmeticError, base: &raw const EXCEPTION;
    OverflowError => OVERFLOW_ERROR, PyExc_OverflowError, base: &raw const ARITHMETIC_ERROR;
    ZeroDivisionError => ZERO_DIVISION_ERROR, PyExc_ZeroDivisionError, base: &raw const ARITHMETIC_ERROR;
    LookupError => LOOKUP_ERROR, PyExc_LookupError, base: &raw const EXCEPTION;
    IndexError => INDEX_ERROR, PyExc_IndexError, base: &raw const LOOKUP_ERROR;
    KeyError => KEY_ERROR, PyExc_KeyError, base: &raw const LOOKUP_ERROR;
    RuntimeError => RUNTIME_ERROR, PyExc_RuntimeError, base: &raw const EXCEPTION;
    NotImplementedError => NOT_IMPLEMENTED_ERROR, PyExc_NotImplementedError, base: &raw const RUNTIME_ERROR;
    RecursionError => RECURSION_ERROR, PyExc_RecursionError, base: &raw const RUNTIME_ERROR;
    ValueError => VALUE_ERROR, PyExc_ValueError, base: &raw const EXCEPTION;
    UnicodeDecodeError => UNICODE_DECODE_ERROR, PyExc_UnicodeDecodeError, base: &raw const VALUE_ERROR;
    AttributeError => ATTRIBUTE_ERROR, PyExc_AttributeError, base: &raw const EXCEPTION;
    AssertionError => ASSERTION_ERROR, PyExc_AssertionError, base: &raw const EXCEPTION;
    MemoryError => MEMORY_ERROR, PyExc_MemoryError, base: &raw const EXCEPTION;
    OSError => OS_ERROR, PyExc_OSError, base: &raw const EXCEPTION;
    StopIteration => STOP_ITERATION, PyExc_StopIteration, base: &raw const EXCEPTION;
    SystemError => SYSTEM_ERROR, PyExc_SystemError, base: &raw const EXCEPTION;
    TypeError => TYPE_ERROR, PyExc_TypeError, base: &raw const EXCEPTION;
}

/// The exception kind a descriptor stands for, if it is an exception class.
#[must_use]
pub fn exception_kind(tp: &PyTypeObject) -> Option<ExcType> {
    match tp.kind() {
        Type::Exception(exc) => Some(exc),
        _ => None,
    }
}
