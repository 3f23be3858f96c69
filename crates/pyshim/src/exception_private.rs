use std::fmt::{self, Display};

use strum::{Display, EnumCount, EnumIter, IntoStaticStr};

/// Result type alias for operations that can raise.
pub type RunResult<T> = Result<T, RunError>;

/// Exception kinds exported by the runtime.
///
/// Uses strum derives for automatic `Display` and `Into<&'static str>` implementations.
/// The string representation matches the variant name exactly (e.g., `ValueError` -> "ValueError").
/// The declaration order is the index of each kind's type object in the static exception table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, EnumCount, EnumIter,
)]
pub enum ExcType {
    /// Root of the hierarchy.
    BaseException,
    /// Base class of every standard error below.
    Exception,

    // --- ArithmeticError hierarchy ---
    ArithmeticError,
    OverflowError,
    ZeroDivisionError,

    // --- LookupError hierarchy ---
    LookupError,
    IndexError,
    KeyError,

    // --- RuntimeError hierarchy ---
    RuntimeError,
    NotImplementedError,
    /// Raised when comparing or hashing nests deeper than the recursion limit.
    RecursionError,

    // --- ValueError hierarchy ---
    ValueError,
    /// Raised when a byte sequence is not valid UTF-8.
    UnicodeDecodeError,

    // --- Standalone exception types ---
    AttributeError,
    AssertionError,
    MemoryError,
    OSError,
    StopIteration,
    /// Internal error, usually a misuse of the C API (null argument, wrong kind).
    SystemError,
    TypeError,
}

impl ExcType {
    /// Returns the direct base class, or `None` for `BaseException`.
    #[must_use]
    pub fn base(self) -> Option<Self> {
        match self {
            Self::BaseException => None,
            Self::Exception => Some(Self::BaseException),
            Self::OverflowError | Self::ZeroDivisionError => Some(Self::ArithmeticError),
            Self::IndexError | Self::KeyError => Some(Self::LookupError),
            Self::NotImplementedError | Self::RecursionError => Some(Self::RuntimeError),
            Self::UnicodeDecodeError => Some(Self::ValueError),
            _ => Some(Self::Exception),
        }
    }

    /// Checks if this exception type is a subclass of another exception type.
    ///
    /// Returns true if `self` would be caught by `except handler_type:`.
    #[must_use]
    pub fn is_subclass_of(self, handler_type: Self) -> bool {
        let mut current = Some(self);
        while let Some(exc) = current {
            if exc == handler_type {
                return true;
            }
            current = exc.base();
        }
        false
    }

    /// Creates an error of this kind carrying `message`.
    #[must_use]
    pub fn with_message(self, message: impl Into<String>) -> RunError {
        RunError::Exc(SimpleException::new(self, Some(message.into())))
    }

    /// Creates an error of this kind with no message (value is `None`).
    #[must_use]
    pub fn no_message(self) -> RunError {
        RunError::Exc(SimpleException::new(self, None))
    }

    #[must_use]
    pub fn type_error(message: impl Into<String>) -> RunError {
        Self::TypeError.with_message(message)
    }

    #[must_use]
    pub fn overflow_error(message: impl Into<String>) -> RunError {
        Self::OverflowError.with_message(message)
    }

    #[must_use]
    pub fn index_error(message: impl Into<String>) -> RunError {
        Self::IndexError.with_message(message)
    }

    #[must_use]
    pub fn system_error(message: impl Into<String>) -> RunError {
        Self::SystemError.with_message(message)
    }

    /// `RecursionError` for nesting past the recursion limit; `while_doing` names the operation.
    #[must_use]
    pub fn recursion_error(while_doing: &str) -> RunError {
        Self::RecursionError.with_message(format!("maximum recursion depth exceeded {while_doing}"))
    }

    #[must_use]
    pub fn memory_error() -> RunError {
        Self::MemoryError.no_message()
    }

    /// `SystemError` raised when a C API function receives an argument of the wrong kind.
    #[must_use]
    pub fn bad_internal_call() -> RunError {
        Self::system_error("bad argument to internal function")
    }

    /// Error for `TypeError: unhashable type: 'list'`.
    #[must_use]
    pub fn type_error_unhashable(type_name: &str) -> RunError {
        Self::type_error(format!("unhashable type: '{type_name}'"))
    }

    /// Error for a wrong-kind argument at a 1-based position.
    #[must_use]
    pub fn type_error_argument(fname: Option<&str>, position: usize, expected: &str, got: &str) -> RunError {
        Self::type_error(format!(
            "{}argument {position} must be {expected}, not {got}",
            call_prefix(fname)
        ))
    }

    /// Error for a fixed argument count mismatch.
    #[must_use]
    pub fn type_error_arg_count(fname: Option<&str>, expected: usize, given: usize) -> RunError {
        Self::type_error(format!(
            "{} takes exactly {expected} argument{} ({given} given)",
            callable_name(fname),
            plural(expected)
        ))
    }

    /// Error for too few arguments when some are optional.
    #[must_use]
    pub fn type_error_at_least(fname: Option<&str>, min: usize, given: usize) -> RunError {
        Self::type_error(format!(
            "{} takes at least {min} argument{} ({given} given)",
            callable_name(fname),
            plural(min)
        ))
    }

    /// Error for too many arguments when some are optional.
    #[must_use]
    pub fn type_error_at_most(fname: Option<&str>, max: usize, given: usize) -> RunError {
        Self::type_error(format!(
            "{} takes at most {max} argument{} ({given} given)",
            callable_name(fname),
            plural(max)
        ))
    }
}

/// `"f() "` when a function name is known, empty otherwise.
pub(crate) fn call_prefix(fname: Option<&str>) -> String {
    fname.map_or_else(String::new, |name| format!("{name}() "))
}

/// `"f()"` when a function name is known, `"function"` otherwise.
pub(crate) fn callable_name(fname: Option<&str>) -> String {
    fname.map_or_else(|| "function".to_owned(), |name| format!("{name}()"))
}

fn plural(count: usize) -> &'static str {
    if count == 1 { "" } else { "s" }
}

/// An exception that has been raised in Rust but not yet installed in the error slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleException {
    exc_type: ExcType,
    message: Option<String>,
}

impl SimpleException {
    #[must_use]
    pub fn new(exc_type: ExcType, message: Option<String>) -> Self {
        Self { exc_type, message }
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl Display for SimpleException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.exc_type),
            None => write!(f, "{}", self.exc_type),
        }
    }
}

/// Failure of a runtime operation.
///
/// Rust code propagates this with `?`; the `extern "C"` boundary installs it in
/// the error slot and returns the C failure sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    /// A freshly raised exception that still has to be installed.
    Exc(SimpleException),
    /// The error slot already holds the failure (set by a nested call).
    Pending,
}

impl RunError {
    /// The exception kind, when it is still held here rather than in the slot.
    #[must_use]
    pub fn exc_type(&self) -> Option<ExcType> {
        match self {
            Self::Exc(exc) => Some(exc.exc_type()),
            Self::Pending => None,
        }
    }

    /// Installs this error in the interpreter-wide slot, replacing what was there.
    ///
    /// `Pending` errors are already installed and are left untouched.
    pub fn restore(self) {
        if let Self::Exc(exc) = self {
            crate::errors::set_exception(&exc);
        }
    }
}

impl Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exc(exc) => write!(f, "{exc}"),
            Self::Pending => write!(f, "<error pending in the error slot>"),
        }
    }
}

impl std::error::Error for RunError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy_follows_standard_bases() {
        assert!(ExcType::IndexError.is_subclass_of(ExcType::LookupError));
        assert!(ExcType::KeyError.is_subclass_of(ExcType::Exception));
        assert!(ExcType::UnicodeDecodeError.is_subclass_of(ExcType::ValueError));
        assert!(ExcType::TypeError.is_subclass_of(ExcType::BaseException));
        assert!(!ExcType::TypeError.is_subclass_of(ExcType::ValueError));
        assert!(!ExcType::Exception.is_subclass_of(ExcType::TypeError));
    }

    #[test]
    fn arity_messages_match_cpython() {
        let err = ExcType::type_error_arg_count(Some("add"), 2, 1);
        assert_eq!(err.to_string(), "TypeError: add() takes exactly 2 arguments (1 given)");
        let err = ExcType::type_error_at_least(None, 1, 0);
        assert_eq!(err.to_string(), "TypeError: function takes at least 1 argument (0 given)");
    }
}
