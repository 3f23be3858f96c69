//! The coarse, re-entrant exclusion lock that serializes every mutation of
//! runtime state.
//!
//! Extension code written against the C API assumes a single owner of
//! execution at any instant. Every exported entry point calls [`acquire`]
//! before touching refcounts, allocator structures, containers or the error
//! slot. A thread that already holds the lock re-enters without blocking, so
//! native routines may call back into the API (for example building a nested
//! container while parsing arguments).
//!
//! Rust-side mutable state lives in [`GilCell`]s. A cell is only borrowed for
//! a short section that never calls back into code that could borrow the same
//! cell; values that must be released are moved out first and dropped after
//! the borrow ends.

use std::cell::RefCell;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard, const_reentrant_mutex};

static GIL: ReentrantMutex<()> = const_reentrant_mutex(());

/// Proof that the current thread holds the lock.
///
/// Dropping the outermost guard on a thread releases the lock. Guards are
/// `!Send`: the lock is owned by a thread, not by a value.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct GilGuard {
    _guard: ReentrantMutexGuard<'static, ()>,
}

/// Acquires the lock, blocking while another thread holds it.
///
/// Nested calls on the owning thread return immediately.
pub fn acquire() -> GilGuard {
    GilGuard { _guard: GIL.lock() }
}

/// Lazily initialized runtime state that may only be touched under the lock.
///
/// `with` acquires the lock itself, so callers from Rust need not hold it
/// beforehand. A re-entrant borrow of the same cell is a bug in this crate and
/// panics.
pub(crate) struct GilCell<T> {
    value: RefCell<Option<T>>,
    init: fn() -> T,
}

// SAFETY: the inner `RefCell` is only accessed from `with`, which holds the
// process-wide lock for the whole borrow, so at most one thread touches it.
unsafe impl<T> Sync for GilCell<T> {}

impl<T> GilCell<T> {
    /// Creates a cell whose value is built by `init` on first access.
    pub const fn new(init: fn() -> T) -> Self {
        Self {
            value: RefCell::new(None),
            init,
        }
    }

    /// Runs `f` with exclusive access to the value.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let _gil = acquire();
        let mut slot = self.value.borrow_mut();
        let value = slot.get_or_insert_with(self.init);
        f(value)
    }
}
