//! Size-classed small-object allocator backing `PyObject_Malloc`.
//!
//! Requests up to [`SMALL_REQUEST_THRESHOLD`] bytes are rounded up to a
//! multiple of [`ALIGNMENT`] and served from pools of [`POOL_SIZE`] bytes. A
//! pool serves exactly one size class. Pools are aligned to their own size, so
//! the owning pool of any block is found by masking the block address; a
//! masked address that is not a known pool base means the block came from the
//! raw domain.
//!
//! Within a pool, never-used space is handed out bump-style and released
//! blocks go onto an intrusive singly linked free list threaded through the
//! blocks themselves.

use std::{
    alloc::{self, Layout},
    ptr,
};

use ahash::AHashMap;

use super::raw;
use crate::{gil::GilCell, resource, tracer};

/// Granularity of size classes.
pub const ALIGNMENT: usize = 16;
/// Largest request served from pools.
pub const SMALL_REQUEST_THRESHOLD: usize = 512;
/// Number of size classes.
pub const NUM_SIZE_CLASSES: usize = SMALL_REQUEST_THRESHOLD / ALIGNMENT;
/// Bytes per pool, also its alignment.
pub const POOL_SIZE: usize = 16 * 1024;

/// Size class index for a small request; zero-byte requests use the smallest class.
const fn size_class(size: usize) -> usize {
    if size == 0 { 0 } else { (size - 1) / ALIGNMENT }
}

const fn class_block_size(class: usize) -> usize {
    (class + 1) * ALIGNMENT
}

/// A released block's first word links to the next free block.
struct FreeBlock {
    next: *mut FreeBlock,
}

#[derive(Debug)]
struct Pool {
    class: usize,
    /// Blocks currently handed out.
    used: usize,
    /// Offset of the first never-used byte.
    next_offset: usize,
    free: *mut FreeBlock,
    /// Whether the pool is on its class's list of pools with free blocks.
    in_partial: bool,
}

impl Pool {
    fn block_size(&self) -> usize {
        class_block_size(self.class)
    }

    fn has_room(&self) -> bool {
        !self.free.is_null() || self.next_offset + self.block_size() <= POOL_SIZE
    }
}

#[derive(Debug)]
struct PoolState {
    /// Live pools keyed by base address.
    pools: AHashMap<usize, Pool>,
    /// Per class, bases of pools that still have a free block.
    partial: [Vec<usize>; NUM_SIZE_CLASSES],
    pooled_blocks: usize,
}

impl Default for PoolState {
    fn default() -> Self {
        Self {
            pools: AHashMap::new(),
            partial: std::array::from_fn(|_| Vec::new()),
            pooled_blocks: 0,
        }
    }
}

static POOLS: GilCell<PoolState> = GilCell::new(PoolState::default);

fn pool_layout() -> Layout {
    // POOL_SIZE is a non-zero power of two, so this layout is always valid.
    Layout::from_size_align(POOL_SIZE, POOL_SIZE).unwrap_or(Layout::new::<u8>())
}

fn pool_base(block: *mut u8) -> usize {
    block as usize & !(POOL_SIZE - 1)
}

impl PoolState {
    /// Returns a block of `class`, carving a new pool if none has room.
    fn allocate(&mut self, class: usize) -> *mut u8 {
        let base = match self.partial[class].last() {
            Some(&base) => base,
            None => {
                // SAFETY: the pool layout has non-zero size.
                let memory = unsafe { alloc::alloc(pool_layout()) };
                if memory.is_null() {
                    return ptr::null_mut();
                }
                let base = memory as usize;
                self.pools.insert(
                    base,
                    Pool {
                        class,
                        used: 0,
                        next_offset: 0,
                        free: ptr::null_mut(),
                        in_partial: true,
                    },
                );
                self.partial[class].push(base);
                tracer::with_tracer(|t| t.on_pool_acquire(class_block_size(class)));
                base
            }
        };
        let Some(pool) = self.pools.get_mut(&base) else {
            return ptr::null_mut();
        };
        let block = if pool.free.is_null() {
            let block = (base + pool.next_offset) as *mut u8;
            pool.next_offset += pool.block_size();
            block
        } else {
            let block = pool.free;
            // SAFETY: every entry on the free list is a released block of this
            // pool whose first word was written by `release`.
            pool.free = unsafe { (*block).next };
            block.cast::<u8>()
        };
        pool.used += 1;
        if !pool.has_room() {
            pool.in_partial = false;
            self.partial[class].retain(|&b| b != base);
        }
        self.pooled_blocks += 1;
        block
    }

    /// Returns a block to its pool. Returns the block size, or `None` when the
    /// address does not belong to any pool.
    fn release(&mut self, block: *mut u8) -> Option<usize> {
        let base = pool_base(block);
        let pool = self.pools.get_mut(&base)?;
        let class = pool.class;
        let free_block = block.cast::<FreeBlock>();
        // SAFETY: `block` is a live block of this pool, at least 16 bytes long
        // and 16-byte aligned, so it can hold the link word.
        unsafe { free_block.write(FreeBlock { next: pool.free }) };
        pool.free = free_block;
        pool.used -= 1;
        let size = pool.block_size();
        self.pooled_blocks -= 1;

        if pool.used == 0 && self.partial[class].iter().any(|&b| b != base) {
            let was_partial = pool.in_partial;
            self.pools.remove(&base);
            if was_partial {
                self.partial[class].retain(|&b| b != base);
            }
            // SAFETY: `base` was allocated in `allocate` with `pool_layout()` and
            // no block of it is live any more.
            unsafe { alloc::dealloc(base as *mut u8, pool_layout()) };
            tracer::with_tracer(|t| t.on_pool_release(class_block_size(class)));
        } else if !pool.in_partial {
            pool.in_partial = true;
            self.partial[class].push(base);
        }
        Some(size)
    }

    fn block_size_of(&self, block: *mut u8) -> Option<usize> {
        self.pools.get(&pool_base(block)).map(Pool::block_size)
    }
}

/// Allocates `size` bytes from a pool, or from the raw domain above the threshold.
pub(crate) fn malloc(size: usize) -> *mut u8 {
    if size > SMALL_REQUEST_THRESHOLD {
        return raw::malloc(size);
    }
    let class = size_class(size);
    let block_size = class_block_size(class);
    if resource::on_allocate(block_size).is_err() {
        return ptr::null_mut();
    }
    let block = POOLS.with(|state| state.allocate(class));
    if block.is_null() {
        resource::on_free(block_size);
    }
    block
}

/// Zeroed allocation of `nelem * elsize` bytes; null on overflow.
pub(crate) fn calloc(nelem: usize, elsize: usize) -> *mut u8 {
    let Some(size) = nelem.checked_mul(elsize) else {
        return ptr::null_mut();
    };
    if size > SMALL_REQUEST_THRESHOLD {
        return raw::calloc(nelem, elsize);
    }
    let block = malloc(size);
    if !block.is_null() {
        // SAFETY: the block is at least `size` bytes.
        unsafe { block.write_bytes(0, size) };
    }
    block
}

/// Resizes a block from either domain.
///
/// # Safety
/// `block` must be null or a live block returned by this module.
pub(crate) unsafe fn realloc(block: *mut u8, new_size: usize) -> *mut u8 {
    if block.is_null() {
        return malloc(new_size);
    }
    let old_size = match POOLS.with(|state| state.block_size_of(block)) {
        Some(size) if new_size <= size && new_size > size / 2 => return block,
        Some(size) => size,
        None if new_size > SMALL_REQUEST_THRESHOLD => {
            // SAFETY: not a pool block, so it came from the raw domain.
            return unsafe { raw::realloc(block, new_size) };
        }
        // SAFETY: not a pool block, so it came from the raw domain.
        None => unsafe { raw::block_size(block) },
    };
    let new_block = malloc(new_size);
    if !new_block.is_null() {
        // SAFETY: both blocks are live and distinct; the copy stays within both.
        unsafe {
            ptr::copy_nonoverlapping(block, new_block, old_size.min(new_size));
            free(block);
        }
    }
    new_block
}

/// Releases a block from either domain. Null is ignored.
///
/// # Safety
/// `block` must be null or a live block returned by this module.
pub(crate) unsafe fn free(block: *mut u8) {
    if block.is_null() {
        return;
    }
    match POOLS.with(|state| state.release(block)) {
        Some(size) => resource::on_free(size),
        // SAFETY: not a pool block, so it came from the raw domain.
        None => unsafe { raw::free(block) },
    }
}

/// Number of live pools and live pooled blocks.
pub(crate) fn stats() -> (usize, usize) {
    POOLS.with(|state| (state.pools.len(), state.pooled_blocks))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes_round_up_to_sixteen() {
        assert_eq!(size_class(0), 0);
        assert_eq!(size_class(1), 0);
        assert_eq!(size_class(16), 0);
        assert_eq!(size_class(17), 1);
        assert_eq!(size_class(512), NUM_SIZE_CLASSES - 1);
        assert_eq!(class_block_size(size_class(100)), 112);
    }

    #[test]
    fn blocks_are_aligned_and_reused() {
        let _gil = crate::gil::acquire();
        unsafe {
            let a = malloc(40);
            assert_eq!(a as usize % ALIGNMENT, 0);
            let b = malloc(40);
            assert_ne!(a, b);
            free(b);
            let c = malloc(33);
            // Same class, so the freed block comes straight back off the free list.
            assert_eq!(b, c);
            free(a);
            free(c);
        }
    }

    #[test]
    fn large_requests_use_raw_domain() {
        let _gil = crate::gil::acquire();
        unsafe {
            let before = raw::stats().blocks;
            let big = malloc(SMALL_REQUEST_THRESHOLD + 1);
            assert_eq!(raw::stats().blocks, before + 1);
            let grown = realloc(big, 4 * SMALL_REQUEST_THRESHOLD);
            assert!(!grown.is_null());
            free(grown);
            assert_eq!(raw::stats().blocks, before);
        }
    }

    #[test]
    fn realloc_moves_between_classes() {
        let _gil = crate::gil::acquire();
        unsafe {
            let small = malloc(8);
            small.copy_from_nonoverlapping(b"pyshim!\0".as_ptr(), 8);
            let bigger = realloc(small, 200);
            assert_eq!(std::slice::from_raw_parts(bigger, 8), b"pyshim!\0");
            let huge = realloc(bigger, 2048);
            assert_eq!(std::slice::from_raw_parts(huge, 8), b"pyshim!\0");
            free(huge);
        }
    }
}
