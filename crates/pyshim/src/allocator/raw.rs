//! General-purpose allocator domain backing `PyMem_*` and large object requests.
//!
//! Every block carries a 16-byte prefix recording its payload size so that
//! `free` and `realloc` can rebuild the `Layout` the system allocator needs.

use std::{
    alloc::{self, Layout},
    ptr,
};

use crate::{gil::GilCell, resource};

/// Alignment of every returned block; matches `max_align_t` on 64-bit targets.
pub(crate) const ALIGN: usize = 16;

/// Bytes reserved in front of each payload for the size prefix.
const HEADER: usize = 16;

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RawStats {
    pub blocks: usize,
    pub bytes: usize,
}

static STATS: GilCell<RawStats> = GilCell::new(RawStats::default);

pub(crate) fn stats() -> RawStats {
    STATS.with(|stats| *stats)
}

fn layout_for(size: usize) -> Option<Layout> {
    let total = size.checked_add(HEADER)?;
    Layout::from_size_align(total, ALIGN).ok()
}

/// Allocates `size` bytes, returning null on exhaustion or when a limit refuses.
///
/// A zero-byte request still returns a unique non-null block.
pub(crate) fn malloc(size: usize) -> *mut u8 {
    allocate(size, false)
}

/// Allocates `nelem * elsize` zeroed bytes; null when the product overflows.
pub(crate) fn calloc(nelem: usize, elsize: usize) -> *mut u8 {
    match nelem.checked_mul(elsize) {
        Some(size) => allocate(size, true),
        None => ptr::null_mut(),
    }
}

fn allocate(size: usize, zeroed: bool) -> *mut u8 {
    let Some(layout) = layout_for(size) else {
        return ptr::null_mut();
    };
    if resource::on_allocate(size).is_err() {
        return ptr::null_mut();
    }
    // SAFETY: the layout has a non-zero size because it always includes the header.
    let base = unsafe {
        if zeroed {
            alloc::alloc_zeroed(layout)
        } else {
            alloc::alloc(layout)
        }
    };
    if base.is_null() {
        resource::on_free(size);
        return ptr::null_mut();
    }
    // SAFETY: `base` points to at least HEADER bytes aligned to 16.
    unsafe { base.cast::<usize>().write(size) };
    STATS.with(|stats| {
        stats.blocks += 1;
        stats.bytes += size;
    });
    // SAFETY: the payload starts HEADER bytes into the allocation.
    unsafe { base.add(HEADER) }
}

/// Returns the start of the allocation and the recorded payload size.
///
/// # Safety
/// `payload` must have been returned by this module and not yet freed.
unsafe fn header(payload: *mut u8) -> (*mut u8, usize) {
    // SAFETY: the caller guarantees `payload` was produced by `allocate`, which
    // placed the size prefix HEADER bytes before it.
    unsafe {
        let base = payload.sub(HEADER);
        (base, base.cast::<usize>().read())
    }
}

/// Payload size of a live block.
///
/// # Safety
/// `payload` must be a live block from this module.
pub(crate) unsafe fn block_size(payload: *mut u8) -> usize {
    // SAFETY: forwarded caller contract.
    unsafe { header(payload).1 }
}

/// Resizes a block, preserving the common prefix of its contents.
///
/// Null input behaves like `malloc`. On failure the original block is left
/// untouched and null is returned.
///
/// # Safety
/// `payload` must be null or a live block from this module.
pub(crate) unsafe fn realloc(payload: *mut u8, new_size: usize) -> *mut u8 {
    if payload.is_null() {
        return malloc(new_size);
    }
    // SAFETY: caller contract.
    let (base, old_size) = unsafe { header(payload) };
    let (Some(old_layout), Some(new_layout)) = (layout_for(old_size), layout_for(new_size)) else {
        return ptr::null_mut();
    };
    resource::on_free(old_size);
    if resource::on_allocate(new_size).is_err() {
        // Re-account the untouched block; it fit before so it fits again.
        let _ = resource::on_allocate(old_size);
        return ptr::null_mut();
    }
    // SAFETY: `base` was allocated with `old_layout`, and the new size is non-zero.
    let new_base = unsafe { alloc::realloc(base, old_layout, new_layout.size()) };
    if new_base.is_null() {
        resource::on_free(new_size);
        let _ = resource::on_allocate(old_size);
        return ptr::null_mut();
    }
    // SAFETY: `new_base` is a fresh allocation of at least HEADER bytes.
    unsafe { new_base.cast::<usize>().write(new_size) };
    STATS.with(|stats| {
        stats.bytes = stats.bytes - old_size + new_size;
    });
    // SAFETY: payload offset inside the new allocation.
    unsafe { new_base.add(HEADER) }
}

/// Releases a block. Null is ignored.
///
/// # Safety
/// `payload` must be null or a live block from this module.
pub(crate) unsafe fn free(payload: *mut u8) {
    if payload.is_null() {
        return;
    }
    // SAFETY: caller contract.
    let (base, size) = unsafe { header(payload) };
    if let Some(layout) = layout_for(size) {
        // SAFETY: `base` was allocated by `allocate` or `realloc` with exactly this layout.
        unsafe { alloc::dealloc(base, layout) };
    }
    resource::on_free(size);
    STATS.with(|stats| {
        stats.blocks -= 1;
        stats.bytes -= size;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_blocks_are_distinct() {
        let a = malloc(0);
        let b = malloc(0);
        assert!(!a.is_null());
        assert!(!b.is_null());
        assert_ne!(a, b);
        unsafe {
            free(a);
            free(b);
        }
    }

    #[test]
    fn calloc_overflow_returns_null() {
        assert!(calloc(usize::MAX, 2).is_null());
    }

    #[test]
    fn realloc_preserves_prefix() {
        unsafe {
            let p = malloc(4);
            p.copy_from_nonoverlapping(b"abcd".as_ptr(), 4);
            let q = realloc(p, 4096);
            assert!(!q.is_null());
            assert_eq!(std::slice::from_raw_parts(q, 4), b"abcd");
            assert_eq!(block_size(q), 4096);
            assert_eq!(q as usize % ALIGN, 0);
            free(q);
        }
    }
}
