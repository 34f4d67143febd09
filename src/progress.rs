//! Progress reporting sinks

/// Receives `(current, total, label)` updates as work items finish
pub trait ProgressSink {
    fn report(&self, current: usize, total: usize, label: &str);
}

/// Reports progress as `tracing` events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn report(&self, current: usize, total: usize, label: &str) {
        tracing::info!("[{current}/{total}] {label}");
    }
}

/// Discards progress
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _current: usize, _total: usize, _label: &str) {}
}
