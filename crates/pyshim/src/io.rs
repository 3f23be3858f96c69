//! Sinks for the diagnostic text `PyErr_Print` renders.

use std::{
    io::{self, Write as _},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::gil::GilCell;

/// Trait for the diagnostic sink used by `PyErr_Print`.
///
/// Implement this trait to capture or redirect error reports. The default
/// implementation [`StdErrPrint`] writes to stderr.
pub trait ErrorWriter: std::fmt::Debug {
    /// Writes one fully rendered report, including its trailing newline.
    fn write_report(&mut self, report: &str);
}

/// Default `ErrorWriter` that writes to stderr.
#[derive(Debug, Default)]
pub struct StdErrPrint;

impl ErrorWriter for StdErrPrint {
    fn write_report(&mut self, report: &str) {
        let mut stderr = io::stderr().lock();
        let _ = stderr.write_all(report.as_bytes());
        let _ = stderr.flush();
    }
}

/// An `ErrorWriter` that collects all reports into a shared string.
///
/// Clones share the buffer, so one clone can be installed while another is
/// kept for reading.
#[derive(Debug, Clone, Default)]
pub struct CollectStringPrint(Arc<Mutex<String>>);

impl CollectStringPrint {
    /// Creates a new empty `CollectStringPrint`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns everything collected so far.
    #[must_use]
    pub fn output(&self) -> String {
        self.0.lock().clone()
    }
}

impl ErrorWriter for CollectStringPrint {
    fn write_report(&mut self, report: &str) {
        self.0.lock().push_str(report);
    }
}

/// `ErrorWriter` that ignores all output.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrint;

impl ErrorWriter for NoPrint {
    fn write_report(&mut self, _report: &str) {}
}

static ERROR_WRITER: GilCell<Box<dyn ErrorWriter>> = GilCell::new(|| Box::new(StdErrPrint));

/// Installs the sink used by `PyErr_Print`, returning the previous one.
pub fn set_error_writer(writer: Box<dyn ErrorWriter>) -> Box<dyn ErrorWriter> {
    ERROR_WRITER.with(|slot| std::mem::replace(slot, writer))
}

pub(crate) fn write_report(report: &str) {
    ERROR_WRITER.with(|writer| writer.write_report(report));
}
