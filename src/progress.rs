//! Synchronous progress reporting.
//!
//! Long-running operations (initializing a fixed disk, large writes) report
//! the cumulative number of bytes processed after every segment. The sink is
//! invoked on the caller's thread during the call, never deferred.

/// Receiver of progress values.
///
/// Any `FnMut(u64)` closure is a sink, so callers can collect values with
/// `|v| values.push(v)`.
pub trait ProgressSink {
    fn report(&mut self, value: u64);
}

impl<F: FnMut(u64)> ProgressSink for F {
    fn report(&mut self, value: u64) {
        self(value)
    }
}

/// Forwards to an optional sink.
pub(crate) fn report(sink: &mut Option<&mut dyn ProgressSink>, value: u64) {
    if let Some(sink) = sink.as_mut() {
        sink.report(value);
    }
}
