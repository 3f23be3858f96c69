use std::fmt;

use crate::{
    exception_private::{ExcType, RunError},
    gil::GilCell,
};

/// Maximum recursion depth for data structure traversals (repr).
///
/// Refcount release is iterative and never bounded by this; it only protects
/// the recursive rendering of deeply nested containers.
#[cfg(debug_assertions)]
pub const MAX_DATA_RECURSION_DEPTH: u16 = 100;

/// Maximum recursion depth for data structure traversals (repr).
///
/// Refcount release is iterative and never bounded by this; it only protects
/// the recursive rendering of deeply nested containers.
#[cfg(not(debug_assertions))]
pub const MAX_DATA_RECURSION_DEPTH: u16 = 500;

/// Nesting limit for equality, ordering and hashing, CPython's default
/// recursion limit.
///
/// These walks keep their own explicit stacks, so the limit does not protect
/// the call stack. It turns self-referencing or absurdly deep data into
/// `RecursionError` instead of an endless walk.
pub const RECURSION_LIMIT: usize = 1000;

/// Error returned when an allocation would exceed the configured limits.
///
/// The allocator reports this as a null return; object constructors turn it
/// into `MemoryError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Maximum number of live allocations exceeded.
    Allocation { limit: usize, count: usize },
    /// Maximum number of live bytes exceeded.
    Memory { limit: usize, used: usize },
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocation { limit, count } => {
                write!(f, "allocation limit exceeded: {count} > {limit}")
            }
            Self::Memory { limit, used } => {
                write!(f, "memory limit exceeded: {used} bytes > {limit} bytes")
            }
        }
    }
}

impl std::error::Error for ResourceError {}

impl From<ResourceError> for RunError {
    fn from(err: ResourceError) -> Self {
        ExcType::MemoryError.with_message(err.to_string())
    }
}

/// Configurable limits enforced by the allocator subsystem.
///
/// Both limits count *live* usage: freeing a block makes room again. With no
/// limits installed (the default) the allocator only fails when the system
/// allocator does.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResourceLimits {
    /// Maximum number of live blocks across both allocator domains.
    #[serde(default)]
    pub max_allocations: Option<usize>,
    /// Maximum number of live bytes across both allocator domains.
    #[serde(default)]
    pub max_memory: Option<usize>,
}

impl ResourceLimits {
    /// Creates limits with everything disabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_allocations(mut self, limit: usize) -> Self {
        self.max_allocations = Some(limit);
        self
    }

    #[must_use]
    pub fn max_memory(mut self, limit: usize) -> Self {
        self.max_memory = Some(limit);
        self
    }
}

/// Trait for tracking allocator usage against limits.
pub trait ResourceTracker: fmt::Debug {
    /// Called before each allocation of `size` bytes.
    ///
    /// Returns `Err` when the allocation must fail.
    fn on_allocate(&mut self, size: usize) -> Result<(), ResourceError>;

    /// Called after a block of `size` bytes is returned.
    fn on_free(&mut self, size: usize);

    /// Number of live allocations, if tracked.
    fn allocation_count(&self) -> Option<usize> {
        None
    }

    /// Number of live bytes, if tracked.
    fn current_memory_bytes(&self) -> Option<usize> {
        None
    }
}

/// Tracker enforcing a [`ResourceLimits`].
///
/// With default limits every check compiles down to two `is_none` tests.
#[derive(Debug, Clone, Default)]
pub struct LimitedTracker {
    limits: ResourceLimits,
    allocation_count: usize,
    current_memory: usize,
}

impl LimitedTracker {
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            allocation_count: 0,
            current_memory: 0,
        }
    }

    /// Replaces the limits while keeping the live counters.
    pub fn set_limits(&mut self, limits: ResourceLimits) {
        self.limits = limits;
    }

    #[must_use]
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }
}

impl ResourceTracker for LimitedTracker {
    fn on_allocate(&mut self, size: usize) -> Result<(), ResourceError> {
        if let Some(max) = self.limits.max_allocations
            && self.allocation_count >= max
        {
            return Err(ResourceError::Allocation {
                limit: max,
                count: self.allocation_count + 1,
            });
        }
        let new_memory = self.current_memory.saturating_add(size);
        if let Some(max) = self.limits.max_memory
            && new_memory > max
        {
            return Err(ResourceError::Memory {
                limit: max,
                used: new_memory,
            });
        }
        self.allocation_count += 1;
        self.current_memory = new_memory;
        Ok(())
    }

    fn on_free(&mut self, size: usize) {
        self.allocation_count = self.allocation_count.saturating_sub(1);
        self.current_memory = self.current_memory.saturating_sub(size);
    }

    fn allocation_count(&self) -> Option<usize> {
        Some(self.allocation_count)
    }

    fn current_memory_bytes(&self) -> Option<usize> {
        Some(self.current_memory)
    }
}

static TRACKER: GilCell<LimitedTracker> = GilCell::new(LimitedTracker::default);

/// Installs new allocator limits, returning the previous ones.
///
/// Usage already counted stays counted, so lowering a limit below current
/// usage makes every further allocation fail until enough is freed.
pub fn set_limits(limits: ResourceLimits) -> ResourceLimits {
    TRACKER.with(|tracker| {
        let previous = tracker.limits().clone();
        tracker.set_limits(limits);
        previous
    })
}

/// Returns the currently installed limits.
#[must_use]
pub fn limits() -> ResourceLimits {
    TRACKER.with(|tracker| tracker.limits().clone())
}

pub(crate) fn on_allocate(size: usize) -> Result<(), ResourceError> {
    TRACKER.with(|tracker| tracker.on_allocate(size))
}

pub(crate) fn on_free(size: usize) {
    TRACKER.with(|tracker| tracker.on_free(size));
}

/// Live allocation count and live bytes as seen by the tracker.
pub(crate) fn usage() -> (usize, usize) {
    TRACKER.with(|tracker| {
        (
            tracker.allocation_count().unwrap_or_default(),
            tracker.current_memory_bytes().unwrap_or_default(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_limit_counts_live_blocks() {
        let mut tracker = LimitedTracker::new(ResourceLimits::new().max_allocations(2));
        tracker.on_allocate(8).unwrap();
        tracker.on_allocate(8).unwrap();
        assert_eq!(
            tracker.on_allocate(8),
            Err(ResourceError::Allocation { limit: 2, count: 3 })
        );
        tracker.on_free(8);
        assert!(tracker.on_allocate(8).is_ok());
    }

    #[test]
    fn memory_limit_rejects_oversized_request() {
        let mut tracker = LimitedTracker::new(ResourceLimits::new().max_memory(100));
        tracker.on_allocate(60).unwrap();
        let err = tracker.on_allocate(60).unwrap_err();
        assert_eq!(err.to_string(), "memory limit exceeded: 120 bytes > 100 bytes");
        assert_eq!(tracker.current_memory_bytes(), Some(60));
    }
}
