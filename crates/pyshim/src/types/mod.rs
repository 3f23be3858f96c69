//! Built-in object kinds.
//!
//! Each kind module defines the C payload layout, the exported type
//! descriptor, a Rust API working on [`PyOwned`](crate::PyOwned) and
//! [`PyBorrowed`](crate::PyBorrowed), and the `extern "C"` entry points.
//! Generic operations that dispatch on the kind tag live in [`protocol`].

use std::fmt;

use crate::exception_private::ExcType;

pub mod bytes;
pub mod dict;
pub mod float;
pub mod list;
pub mod long;
pub mod protocol;
pub mod str;
pub mod tuple;
pub mod type_object;

pub use bytes::PyBytesObject;
pub use dict::PyDictObject;
pub use float::PyFloatObject;
pub use list::PyListObject;
pub use long::{IntValue, PyLongObject};
pub use str::PyUnicodeObject;
pub use tuple::PyTupleObject;

/// Closed kind tag stored in every type descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    NoneType,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    Tuple,
    List,
    Dict,
    Type,
    /// Descriptor of an exception class. Instances are never materialized: the
    /// error slot stores the class and a separate value object.
    Exception(ExcType),
}

impl Type {
    /// The Python-visible type name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::NoneType => "NoneType",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::Bytes => "bytes",
            Self::Tuple => "tuple",
            Self::List => "list",
            Self::Dict => "dict",
            Self::Type => "type",
            Self::Exception(exc) => exc.into(),
        }
    }

    /// True for kinds whose layout starts with a `PyVarObject`.
    #[must_use]
    pub fn is_var_sized(self) -> bool {
        matches!(self, Self::Bytes | Self::Tuple | Self::List)
    }

    /// True for `int` and `bool`.
    #[must_use]
    pub fn is_int(self) -> bool {
        matches!(self, Self::Int | Self::Bool)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
