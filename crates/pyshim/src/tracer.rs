//! Runtime tracing infrastructure.
//!
//! Provides a trait-based hook system for observing object lifetimes, pool
//! traffic and error-state changes. Every hook defaults to a no-op, so
//! [`NoopTracer`] (the installed default) costs one virtual call per event.
//!
//! # Usage
//!
//! ```
//! use pyshim::tracer::{RecordingTracer, TraceEvent, set_tracer};
//!
//! let recorder = RecordingTracer::new();
//! let previous = set_tracer(Box::new(recorder.clone()));
//! // ... exercise the API ...
//! let events: Vec<TraceEvent> = recorder.events();
//! set_tracer(previous);
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

use crate::gil::GilCell;

/// A single recorded runtime event.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TraceEvent {
    /// An object of the named type was allocated.
    Alloc { type_name: String },
    /// An object of the named type reached refcount zero and was released.
    Dealloc { type_name: String },
    /// The error slot was populated.
    ErrorSet { type_name: String, message: Option<String> },
    /// The error slot was cleared (including by fetch).
    ErrorClear,
    /// A new pool was carved out for the given size class.
    PoolAcquire { size_class: usize },
    /// A fully free pool was returned to the system.
    PoolRelease { size_class: usize },
}

/// Trait for runtime tracing.
///
/// Hooks run while the runtime lock is held and must not call back into the
/// C API.
pub trait RuntimeTracer: std::fmt::Debug {
    /// Called after an object is allocated and its header initialized.
    #[inline]
    fn on_alloc(&mut self, _type_name: &str) {}

    /// Called when an object is released, before its memory is freed.
    #[inline]
    fn on_dealloc(&mut self, _type_name: &str) {}

    /// Called when an error is installed in the error slot.
    #[inline]
    fn on_error_set(&mut self, _type_name: &str, _message: Option<&str>) {}

    /// Called when the error slot is cleared or fetched.
    #[inline]
    fn on_error_clear(&mut self) {}

    /// Called when the object allocator creates a pool.
    #[inline]
    fn on_pool_acquire(&mut self, _size_class: usize) {}

    /// Called when the object allocator returns a pool to the system.
    #[inline]
    fn on_pool_release(&mut self, _size_class: usize) {}
}

// ============================================================================
// NoopTracer: production default
// ============================================================================

/// A tracer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl RuntimeTracer for NoopTracer {}

// ============================================================================
// StderrTracer: human-readable event log
// ============================================================================

/// Tracer that prints one line per event to stderr.
///
/// Output format:
/// ```text
/// [alloc]   list
/// [alloc]   int
/// [error]   TypeError: argument 1 must be int, not str
/// [dealloc] int
/// [clear]
/// ```
#[derive(Debug, Default)]
pub struct StderrTracer {
    /// Maximum number of events to print before going quiet. None = unlimited.
    limit: Option<usize>,
    count: usize,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracer that stops printing after `limit` events.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            count: 0,
        }
    }

    fn emit(&mut self, line: std::fmt::Arguments<'_>) {
        if let Some(limit) = self.limit {
            if self.count == limit {
                eprintln!("--- trace limit reached ({limit} events) ---");
            }
            if self.count >= limit {
                self.count += 1;
                return;
            }
        }
        self.count += 1;
        eprintln!("{line}");
    }
}

impl RuntimeTracer for StderrTracer {
    fn on_alloc(&mut self, type_name: &str) {
        self.emit(format_args!("[alloc]   {type_name}"));
    }

    fn on_dealloc(&mut self, type_name: &str) {
        self.emit(format_args!("[dealloc] {type_name}"));
    }

    fn on_error_set(&mut self, type_name: &str, message: Option<&str>) {
        match message {
            Some(message) => self.emit(format_args!("[error]   {type_name}: {message}")),
            None => self.emit(format_args!("[error]   {type_name}")),
        }
    }

    fn on_error_clear(&mut self) {
        self.emit(format_args!("[clear]"));
    }

    fn on_pool_acquire(&mut self, size_class: usize) {
        self.emit(format_args!("[pool+]   class {size_class}"));
    }

    fn on_pool_release(&mut self, size_class: usize) {
        self.emit(format_args!("[pool-]   class {size_class}"));
    }
}

// ============================================================================
// RecordingTracer: collects events for inspection
// ============================================================================

/// Tracer that appends every event to a shared buffer.
///
/// Clones share the buffer, so keep one clone to read the events after
/// installing the other.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracer {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every event recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// Type names of the `Dealloc` events, in release order.
    #[must_use]
    pub fn deallocs(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TraceEvent::Dealloc { type_name } => Some(type_name),
                _ => None,
            })
            .collect()
    }

    /// Discards every recorded event.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn push(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}

impl RuntimeTracer for RecordingTracer {
    fn on_alloc(&mut self, type_name: &str) {
        self.push(TraceEvent::Alloc {
            type_name: type_name.to_owned(),
        });
    }

    fn on_dealloc(&mut self, type_name: &str) {
        self.push(TraceEvent::Dealloc {
            type_name: type_name.to_owned(),
        });
    }

    fn on_error_set(&mut self, type_name: &str, message: Option<&str>) {
        self.push(TraceEvent::ErrorSet {
            type_name: type_name.to_owned(),
            message: message.map(str::to_owned),
        });
    }

    fn on_error_clear(&mut self) {
        self.push(TraceEvent::ErrorClear);
    }

    fn on_pool_acquire(&mut self, size_class: usize) {
        self.push(TraceEvent::PoolAcquire { size_class });
    }

    fn on_pool_release(&mut self, size_class: usize) {
        self.push(TraceEvent::PoolRelease { size_class });
    }
}

static TRACER: GilCell<Box<dyn RuntimeTracer>> = GilCell::new(|| Box::new(NoopTracer));

/// Installs a tracer, returning the previously installed one.
pub fn set_tracer(tracer: Box<dyn RuntimeTracer>) -> Box<dyn RuntimeTracer> {
    TRACER.with(|slot| std::mem::replace(slot, tracer))
}

/// Runs `f` against the installed tracer.
pub(crate) fn with_tracer(f: impl FnOnce(&mut dyn RuntimeTracer)) {
    TRACER.with(|tracer| f(tracer.as_mut()));
}
