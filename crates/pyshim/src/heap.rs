//! Object allocation, reference counting and release.
//!
//! Objects live in blocks from the pool allocator. A refcount reaching zero
//! starts an iterative release: dying objects are processed from an explicit
//! [`ReleaseStack`], each kind's deallocator hands its owned children to the
//! stack, and children whose refcount also reaches zero are queued. Release
//! order is depth-first pre-order with children in slot order, and the Rust
//! call stack stays flat however deeply containers nest.

use std::{
    collections::BTreeMap,
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicI64, Ordering},
};

use smallvec::SmallVec;

use crate::{
    allocator::{self, AllocatorStats, pool},
    exception_private::{ExcType, RunResult},
    gil::{self, GilCell},
    object::{IMMORTAL_REFCNT, PyObject, PyTypeObject, PyVarObject},
    tracer,
};

/// Snapshot of live objects.
///
/// `objects_by_type` uses `BTreeMap` for deterministic iteration order, so
/// snapshots can be displayed and compared directly.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HeapStats {
    /// Total number of live heap objects (statics are not counted).
    pub live_objects: usize,
    /// Live objects keyed by type name (e.g. "list", "int").
    pub objects_by_type: BTreeMap<&'static str, usize>,
    /// Allocator usage at the time of the snapshot.
    pub allocator: AllocatorStats,
}

/// Difference between two heap snapshots.
///
/// Positive deltas mean growth. Only types present in at least one snapshot
/// appear in `objects_by_type_delta`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapDiff {
    /// Change in live object count (`after - before`).
    pub live_objects_delta: isize,
    /// Per-type deltas.
    pub objects_by_type_delta: BTreeMap<&'static str, isize>,
    /// Types that appeared in "after" but not "before".
    pub new_types: Vec<&'static str>,
    /// Types that appeared in "before" but not "after".
    pub removed_types: Vec<&'static str>,
    /// Change in live allocator blocks across both domains.
    pub live_allocations_delta: isize,
}

impl HeapStats {
    /// Computes the difference between `self` ("before") and `other` ("after").
    ///
    /// # Example
    ///
    /// ```
    /// # use std::collections::BTreeMap;
    /// # use pyshim::{AllocatorStats, HeapStats};
    /// let before = HeapStats {
    ///     live_objects: 2,
    ///     objects_by_type: BTreeMap::from([("list", 2)]),
    ///     allocator: AllocatorStats::default(),
    /// };
    /// let after = HeapStats {
    ///     live_objects: 3,
    ///     objects_by_type: BTreeMap::from([("list", 1), ("dict", 2)]),
    ///     allocator: AllocatorStats::default(),
    /// };
    /// let diff = before.diff(&after);
    /// assert_eq!(diff.live_objects_delta, 1);
    /// assert_eq!(diff.new_types, vec!["dict"]);
    /// ```
    #[must_use]
    pub fn diff(&self, other: &Self) -> HeapDiff {
        let mut objects_by_type_delta = BTreeMap::new();
        let mut new_types = Vec::new();
        let mut removed_types = Vec::new();
        for (&name, &count) in &self.objects_by_type {
            let after = other.objects_by_type.get(name).copied().unwrap_or_default();
            objects_by_type_delta.insert(name, isize_delta(count, after));
            if !other.objects_by_type.contains_key(name) {
                removed_types.push(name);
            }
        }
        for (&name, &count) in &other.objects_by_type {
            if !self.objects_by_type.contains_key(name) {
                objects_by_type_delta.insert(name, isize_delta(0, count));
                new_types.push(name);
            }
        }
        HeapDiff {
            live_objects_delta: isize_delta(self.live_objects, other.live_objects),
            objects_by_type_delta,
            new_types,
            removed_types,
            live_allocations_delta: isize_delta(
                self.allocator.live_allocations,
                other.allocator.live_allocations,
            ),
        }
    }
}

impl HeapDiff {
    /// True when no object was leaked or freed between the snapshots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live_objects_delta == 0
            && self.new_types.is_empty()
            && self.removed_types.is_empty()
            && self.objects_by_type_delta.values().all(|&v| v == 0)
            && self.live_allocations_delta == 0
    }
}

impl fmt::Display for HeapDiff {
    /// ```text
    /// HeapDiff: +3 live objects
    ///   list: +1
    ///   str: +2
    ///   New types: dict
    /// ```
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "HeapDiff: no changes");
        }
        write!(f, "HeapDiff: {:+} live objects", self.live_objects_delta)?;
        for (&name, &delta) in &self.objects_by_type_delta {
            if delta != 0 {
                write!(f, "\n  {name}: {delta:+}")?;
            }
        }
        if !self.new_types.is_empty() {
            write!(f, "\n  New types: {}", self.new_types.join(", "))?;
        }
        if !self.removed_types.is_empty() {
            write!(f, "\n  Removed types: {}", self.removed_types.join(", "))?;
        }
        Ok(())
    }
}

fn isize_delta(before: usize, after: usize) -> isize {
    let before = isize::try_from(before).unwrap_or(isize::MAX);
    let after = isize::try_from(after).unwrap_or(isize::MAX);
    after - before
}

#[derive(Debug, Default)]
struct LiveObjects {
    total: usize,
    by_type: BTreeMap<&'static str, usize>,
}

static LIVE: GilCell<LiveObjects> = GilCell::new(LiveObjects::default);

/// Returns a snapshot of live heap objects and allocator usage.
#[must_use]
pub fn heap_stats() -> HeapStats {
    let (live_objects, objects_by_type) = LIVE.with(|live| {
        let by_type = live.by_type.iter().filter(|&(_, &count)| count > 0).map(|(&k, &v)| (k, v));
        (live.total, by_type.collect())
    });
    HeapStats {
        live_objects,
        objects_by_type,
        allocator: allocator::stats(),
    }
}

// ============================================================================
// Allocation
// ============================================================================

/// Allocates a zeroed object of kind `tp` with room for `nitems` trailing items.
///
/// The header is initialized with refcount 1; for variable-sized kinds
/// `ob_size` is set to `nitems`. The caller must initialize the payload with
/// `ptr::write` before the object escapes.
pub(crate) fn alloc_object(tp: &'static PyTypeObject, nitems: usize) -> RunResult<NonNull<PyObject>> {
    let _gil = gil::acquire();
    let basicsize = usize::try_from(tp.tp_basicsize).map_err(|_| ExcType::bad_internal_call())?;
    let itemsize = usize::try_from(tp.tp_itemsize).map_err(|_| ExcType::bad_internal_call())?;
    let size = nitems
        .checked_mul(itemsize)
        .and_then(|items| items.checked_add(basicsize))
        .ok_or_else(ExcType::memory_error)?;
    let block = pool::calloc(1, size).cast::<PyObject>();
    let obj = NonNull::new(block).ok_or_else(ExcType::memory_error)?;
    // SAFETY: `block` is a fresh, zeroed, 16-byte aligned allocation of at least
    // `tp_basicsize` bytes, which covers the header.
    unsafe {
        obj.as_ptr().write(PyObject {
            ob_refcnt: AtomicI64::new(1),
            ob_type: tp,
        });
        if tp.kind().is_var_sized() {
            (*obj.as_ptr().cast::<PyVarObject>()).ob_size = isize::try_from(nitems).unwrap_or(isize::MAX);
        }
    }
    let name = tp.name();
    LIVE.with(|live| {
        live.total += 1;
        *live.by_type.entry(name).or_default() += 1;
    });
    tracer::with_tracer(|t| t.on_alloc(name));
    Ok(obj)
}

// ============================================================================
// Reference counting
// ============================================================================

/// Current refcount of a live object.
///
/// # Safety
/// `op` must point to a live object.
pub(crate) unsafe fn refcnt(op: NonNull<PyObject>) -> i64 {
    // SAFETY: caller contract.
    unsafe { op.as_ref() }.ob_refcnt.load(Ordering::Relaxed)
}

/// Type descriptor of a live object.
///
/// # Safety
/// `op` must point to a live object.
pub(crate) unsafe fn type_of(op: NonNull<PyObject>) -> &'static PyTypeObject {
    // SAFETY: caller contract; every `ob_type` points to a static descriptor.
    unsafe { &*op.as_ref().ob_type }
}

/// Adds one reference. No-op on immortal objects.
///
/// # Safety
/// `op` must point to a live object.
pub(crate) unsafe fn inc_ref(op: NonNull<PyObject>) {
    // SAFETY: caller contract.
    let counter = unsafe { &op.as_ref().ob_refcnt };
    if counter.load(Ordering::Relaxed) < IMMORTAL_REFCNT {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Drops one reference, releasing the object when it was the last.
///
/// # Safety
/// `op` must point to a live object and the caller must own the reference.
pub(crate) unsafe fn dec_ref(op: NonNull<PyObject>) {
    // SAFETY: caller contract.
    if unsafe { drop_one(op) } {
        let _gil = gil::acquire();
        let mut stack = ReleaseStack::default();
        stack.pending.push(op);
        // SAFETY: `op` just reached zero and nothing else references it.
        unsafe { stack.drain() };
    }
}

/// Decrements the refcount; returns true when it reached zero.
///
/// # Safety
/// `op` must point to a live object.
unsafe fn drop_one(op: NonNull<PyObject>) -> bool {
    // SAFETY: caller contract.
    let counter = unsafe { &op.as_ref().ob_refcnt };
    if counter.load(Ordering::Relaxed) >= IMMORTAL_REFCNT {
        return false;
    }
    let previous = counter.fetch_sub(1, Ordering::Relaxed);
    #[cfg(feature = "ref-count-panic")]
    assert!(previous > 0, "refcount of {op:p} decremented below zero");
    previous == 1
}

/// Worklist of objects whose refcount reached zero.
#[derive(Debug, Default)]
pub(crate) struct ReleaseStack {
    pending: SmallVec<[NonNull<PyObject>; 16]>,
}

impl ReleaseStack {
    /// Drops the references a dying container held, in slot order.
    ///
    /// Null entries are skipped. Children that die are queued so they are
    /// released next, first child first.
    ///
    /// # Safety
    /// Each non-null pointer must be a live object whose reference the dying
    /// container owned.
    pub(crate) unsafe fn release_children(&mut self, children: impl IntoIterator<Item = *mut PyObject>) {
        let start = self.pending.len();
        for child in children.into_iter().filter_map(NonNull::new) {
            // SAFETY: caller contract.
            if unsafe { drop_one(child) } {
                self.pending.push(child);
            }
        }
        self.pending[start..].reverse();
    }

    /// Releases queued objects until none are left.
    ///
    /// # Safety
    /// Every queued object must have refcount zero and be unreachable.
    unsafe fn drain(&mut self) {
        while let Some(obj) = self.pending.pop() {
            // SAFETY: queued objects are dead but their memory is still valid.
            let tp = unsafe { type_of(obj) };
            let name = tp.name();
            tracer::with_tracer(|t| t.on_dealloc(name));
            if let Some(dealloc) = tp.slots.dealloc {
                // SAFETY: the deallocator runs exactly once, on a dead object of its kind.
                unsafe { dealloc(obj, self) };
            }
            LIVE.with(|live| {
                live.total -= 1;
                if let Some(count) = live.by_type.get_mut(name) {
                    *count -= 1;
                }
            });
            // SAFETY: the block came from `alloc_object` and the payload is released.
            unsafe { pool::free(obj.as_ptr().cast()) };
        }
    }
}

// ============================================================================
// Exported refcount and header API
// ============================================================================

#[unsafe(no_mangle)]
pub unsafe extern "C" fn Py_IncRef(op: *mut PyObject) {
    if let Some(op) = NonNull::new(op) {
        let _gil = gil::acquire();
        // SAFETY: callers pass live objects.
        unsafe { inc_ref(op) }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn Py_DecRef(op: *mut PyObject) {
    if let Some(op) = NonNull::new(op) {
        let _gil = gil::acquire();
        // SAFETY: callers pass live objects they own a reference to.
        unsafe { dec_ref(op) }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn Py_INCREF(op: *mut PyObject) {
    // SAFETY: forwarded caller contract.
    unsafe { Py_IncRef(op) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn Py_DECREF(op: *mut PyObject) {
    // SAFETY: forwarded caller contract.
    unsafe { Py_DecRef(op) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn Py_XINCREF(op: *mut PyObject) {
    // SAFETY: forwarded caller contract; null is accepted.
    unsafe { Py_IncRef(op) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn Py_XDECREF(op: *mut PyObject) {
    // SAFETY: forwarded caller contract; null is accepted.
    unsafe { Py_DecRef(op) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn Py_REFCNT(op: *mut PyObject) -> isize {
    NonNull::new(op).map_or(0, |op| {
        // SAFETY: callers pass live objects.
        let count = unsafe { refcnt(op) };
        isize::try_from(count).unwrap_or(isize::MAX)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn Py_TYPE(op: *mut PyObject) -> *mut PyTypeObject {
    NonNull::new(op).map_or(std::ptr::null_mut(), |op| {
        // SAFETY: callers pass live objects.
        unsafe { op.as_ref() }.ob_type.cast_mut()
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn Py_SIZE(op: *mut PyObject) -> isize {
    let Some(op) = NonNull::new(op) else {
        return 0;
    };
    // SAFETY: callers pass live objects; only variable-sized kinds carry ob_size.
    unsafe {
        if type_of(op).kind().is_var_sized() {
            (*op.as_ptr().cast::<PyVarObject>()).ob_size
        } else {
            0
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn Py_Is(x: *mut PyObject, y: *mut PyObject) -> i32 {
    i32::from(std::ptr::eq(x, y))
}
