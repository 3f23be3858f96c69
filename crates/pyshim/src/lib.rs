#![doc = include_str!("../../../README.md")]
#![expect(non_snake_case, reason = "exported functions keep their C API names")]
#![expect(non_upper_case_globals, reason = "exported statics keep their C API names")]
// first so the object header and release machinery are in scope for every kind
pub mod heap;

pub mod allocator;
pub mod args;
pub mod errors;
mod exception_private;
pub mod exceptions;
pub mod gil;
pub mod io;
pub mod methods;
pub mod object;
mod owned;
mod py_hash;
pub mod resource;
pub mod singletons;
pub mod tracer;
pub mod types;

pub use crate::{
    allocator::AllocatorStats,
    args::{PyArgValue, build_value, parse_tuple, parse_tuple_and_keywords, unpack_tuple},
    errors::ErrorState,
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    heap::{HeapDiff, HeapStats, heap_stats},
    io::{CollectStringPrint, ErrorWriter, NoPrint, StdErrPrint},
    methods::{MethodFlags, PyMethodDef},
    object::{IMMORTAL_REFCNT, PyObject, PyTypeObject, PyVarObject},
    owned::{PyBorrowed, PyOwned},
    resource::{ResourceError, ResourceLimits},
    tracer::{NoopTracer, RecordingTracer, RuntimeTracer, StderrTracer, TraceEvent},
    types::Type,
};
