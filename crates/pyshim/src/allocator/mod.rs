//! The two allocator domains and their exported entry points.
//!
//! `PyMem_*` goes straight to the [`raw`] domain. `PyObject_*` goes through the
//! size-classed [`pool`] allocator, which forwards large requests to `raw`.
//! Both honour the limits installed with [`crate::resource::set_limits`] and
//! report exhaustion as a null return, never by aborting.

use std::ffi::c_void;

use crate::{gil, resource};

pub mod pool;
pub(crate) mod raw;

/// Snapshot of allocator usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AllocatorStats {
    /// Live blocks in the raw domain (including large object requests).
    pub raw_blocks: usize,
    /// Live payload bytes in the raw domain.
    pub raw_bytes: usize,
    /// Pools currently held by the object allocator.
    pub pools: usize,
    /// Live blocks served from pools.
    pub pooled_blocks: usize,
    /// Live blocks across both domains, as counted against the limits.
    pub live_allocations: usize,
    /// Live bytes across both domains, as counted against the limits.
    pub live_bytes: usize,
}

/// Returns a snapshot of allocator usage.
#[must_use]
pub fn stats() -> AllocatorStats {
    let raw = raw::stats();
    let (pools, pooled_blocks) = pool::stats();
    let (live_allocations, live_bytes) = resource::usage();
    AllocatorStats {
        raw_blocks: raw.blocks,
        raw_bytes: raw.bytes,
        pools,
        pooled_blocks,
        live_allocations,
        live_bytes,
    }
}

// ============================================================================
// General allocator: PyMem_*
// ============================================================================

#[unsafe(no_mangle)]
pub extern "C" fn PyMem_Malloc(size: usize) -> *mut c_void {
    let _gil = gil::acquire();
    raw::malloc(size).cast()
}

#[unsafe(no_mangle)]
pub extern "C" fn PyMem_Calloc(nelem: usize, elsize: usize) -> *mut c_void {
    let _gil = gil::acquire();
    raw::calloc(nelem, elsize).cast()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyMem_Realloc(ptr: *mut c_void, new_size: usize) -> *mut c_void {
    let _gil = gil::acquire();
    // SAFETY: the caller passes null or a live PyMem block.
    unsafe { raw::realloc(ptr.cast(), new_size).cast() }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyMem_Free(ptr: *mut c_void) {
    let _gil = gil::acquire();
    // SAFETY: the caller passes null or a live PyMem block.
    unsafe { raw::free(ptr.cast()) }
}

#[unsafe(no_mangle)]
pub extern "C" fn PyMem_RawMalloc(size: usize) -> *mut c_void {
    PyMem_Malloc(size)
}

#[unsafe(no_mangle)]
pub extern "C" fn PyMem_RawCalloc(nelem: usize, elsize: usize) -> *mut c_void {
    PyMem_Calloc(nelem, elsize)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyMem_RawRealloc(ptr: *mut c_void, new_size: usize) -> *mut c_void {
    // SAFETY: same domain and contract as PyMem_Realloc.
    unsafe { PyMem_Realloc(ptr, new_size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyMem_RawFree(ptr: *mut c_void) {
    // SAFETY: same domain and contract as PyMem_Free.
    unsafe { PyMem_Free(ptr) }
}

// ============================================================================
// Object allocator: PyObject_*
// ============================================================================

#[unsafe(no_mangle)]
pub extern "C" fn PyObject_Malloc(size: usize) -> *mut c_void {
    let _gil = gil::acquire();
    pool::malloc(size).cast()
}

#[unsafe(no_mangle)]
pub extern "C" fn PyObject_Calloc(nelem: usize, elsize: usize) -> *mut c_void {
    let _gil = gil::acquire();
    pool::calloc(nelem, elsize).cast()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyObject_Realloc(ptr: *mut c_void, new_size: usize) -> *mut c_void {
    let _gil = gil::acquire();
    // SAFETY: the caller passes null or a live PyObject_Malloc block.
    unsafe { pool::realloc(ptr.cast(), new_size).cast() }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyObject_Free(ptr: *mut c_void) {
    let _gil = gil::acquire();
    // SAFETY: the caller passes null or a live PyObject_Malloc block.
    unsafe { pool::free(ptr.cast()) }
}
