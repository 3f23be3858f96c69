//! Allocator domains and resource limits.

use std::ffi::c_void;

use pyshim::{
    ExcType, NoopTracer, RecordingTracer, ResourceLimits, TraceEvent,
    allocator::{
        self, PyMem_Calloc, PyMem_Free, PyMem_Malloc, PyMem_RawFree, PyMem_RawMalloc, PyMem_Realloc, PyObject_Calloc,
        PyObject_Free, PyObject_Malloc, PyObject_Realloc,
    },
    errors, gil,
    types::{list, long},
    resource, tracer,
};

/// Restores the previous limits when dropped, so a failing assertion cannot
/// leave a limit installed for other tests.
struct LimitGuard(Option<ResourceLimits>);

impl LimitGuard {
    fn install(limits: ResourceLimits) -> Self {
        Self(Some(resource::set_limits(limits)))
    }
}

impl Drop for LimitGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.0.take() {
            resource::set_limits(previous);
        }
    }
}

// =============================================================================
// 1. Allocation basics
// =============================================================================

/// Zero-byte requests return distinct non-null blocks in both domains.
#[test]
fn zero_size_requests_are_distinct() {
    let _gil = gil::acquire();
    let a = PyObject_Malloc(0);
    let b = PyObject_Malloc(0);
    let c = PyMem_Malloc(0);
    let d = PyMem_Malloc(0);
    assert!(!a.is_null() && !b.is_null() && !c.is_null() && !d.is_null());
    assert_ne!(a, b);
    assert_ne!(c, d);
    unsafe {
        PyObject_Free(a);
        PyObject_Free(b);
        PyMem_Free(c);
        PyMem_Free(d);
    }
}

/// Calloc zeroes memory and realloc keeps the common prefix.
#[test]
fn calloc_zeroes_and_realloc_preserves() {
    let _gil = gil::acquire();
    let block = PyObject_Calloc(4, 8).cast::<u8>();
    assert!(!block.is_null());
    unsafe {
        let bytes = std::slice::from_raw_parts_mut(block, 32);
        assert!(bytes.iter().all(|&b| b == 0));
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::try_from(i).unwrap();
        }
        // grows past the pooled size classes into the raw domain
        let grown = PyObject_Realloc(block.cast::<c_void>(), 4096).cast::<u8>();
        assert!(!grown.is_null());
        let prefix = std::slice::from_raw_parts(grown, 32);
        assert!(prefix.iter().enumerate().all(|(i, &b)| usize::from(b) == i));
        PyObject_Free(grown.cast());
    }

    let raw = PyMem_Calloc(3, 5).cast::<u8>();
    unsafe {
        assert!(std::slice::from_raw_parts(raw, 15).iter().all(|&b| b == 0));
        let raw = PyMem_Realloc(raw.cast(), 1);
        assert!(!raw.is_null());
        PyMem_Free(raw);
    }
}

/// Overflowing calloc products fail with null instead of wrapping.
#[test]
fn calloc_overflow_is_null() {
    let _gil = gil::acquire();
    assert!(PyObject_Calloc(usize::MAX, 2).is_null());
    assert!(PyMem_Calloc(usize::MAX / 2 + 1, 2).is_null());
}

/// Freeing null is a no-op and realloc of null behaves like malloc.
#[test]
fn null_handling() {
    let _gil = gil::acquire();
    unsafe {
        PyObject_Free(std::ptr::null_mut());
        PyMem_RawFree(std::ptr::null_mut());
        let block = PyObject_Realloc(std::ptr::null_mut(), 24);
        assert!(!block.is_null());
        PyObject_Free(block);
    }
}

/// Live block counts go back to where they started.
#[test]
fn stats_track_live_blocks() {
    let _gil = gil::acquire();
    let before = allocator::stats();
    let blocks: Vec<_> = (0..10).map(|_| PyObject_Malloc(48)).collect();
    let raw = PyMem_RawMalloc(100_000);
    let during = allocator::stats();
    assert_eq!(during.live_allocations, before.live_allocations + 11);
    assert!(during.raw_bytes >= before.raw_bytes + 100_000);
    for block in blocks {
        unsafe { PyObject_Free(block) };
    }
    unsafe { PyMem_RawFree(raw) };
    assert_eq!(allocator::stats().live_allocations, before.live_allocations);
}

/// Pool acquisition is reported to the tracer.
#[test]
fn pool_events_are_traced() {
    let _gil = gil::acquire();
    let recorder = RecordingTracer::new();
    tracer::set_tracer(Box::new(recorder.clone()));
    // a size class no other test uses, so a fresh pool is needed
    let block = PyObject_Malloc(500);
    unsafe { PyObject_Free(block) };
    tracer::set_tracer(Box::new(NoopTracer));
    assert!(
        recorder.events().contains(&TraceEvent::PoolAcquire { size_class: 512 }),
        "events: {:?}",
        recorder.events()
    );
}

// =============================================================================
// 2. Limits
// =============================================================================

/// With the allocation cap at current usage, constructors fail with MemoryError.
#[test]
fn allocation_limit_makes_constructors_fail() {
    let _gil = gil::acquire();
    errors::clear();
    let live = allocator::stats().live_allocations;
    {
        let _limits = LimitGuard::install(ResourceLimits::new().max_allocations(live));
        let obj = long::PyLong_FromLong(5);
        assert!(obj.is_null());
        assert_eq!(errors::occurred_kind(), Some(ExcType::MemoryError));
        assert!(PyObject_Malloc(8).is_null());
    }
    errors::clear();

    let obj = long::PyLong_FromLong(5);
    assert!(!obj.is_null(), "allocation works again once the limit is lifted");
    unsafe { pyshim::heap::Py_DecRef(obj) };
}

/// Freeing makes room under a limit again.
#[test]
fn freeing_makes_room() {
    let _gil = gil::acquire();
    let live = allocator::stats().live_allocations;
    let _limits = LimitGuard::install(ResourceLimits::new().max_allocations(live + 1));
    let first = long::new(1i64).unwrap();
    assert_eq!(long::new(2i64).unwrap_err(), ExcType::memory_error());
    drop(first);
    assert!(long::new(3i64).is_ok());
}

/// A memory cap rejects a single oversized request without touching usage.
#[test]
fn memory_limit_rejects_large_requests() {
    let _gil = gil::acquire();
    let before = allocator::stats();
    let _limits = LimitGuard::install(ResourceLimits::new().max_memory(before.live_bytes + 1024));
    assert!(PyMem_Malloc(4096).is_null());
    assert!(list::new(1000).is_err());
    assert_eq!(allocator::stats().live_allocations, before.live_allocations);
}

/// Limits round-trip through their serialized form.
#[test]
fn limits_deserialize_from_json() {
    let limits: ResourceLimits = serde_json::from_str(r#"{"max_allocations": 10}"#).unwrap();
    assert_eq!(limits, ResourceLimits::new().max_allocations(10));
    let text = serde_json::to_string(&ResourceLimits::new().max_memory(64)).unwrap();
    assert_eq!(text, r#"{"max_allocations":null,"max_memory":64}"#);
}
