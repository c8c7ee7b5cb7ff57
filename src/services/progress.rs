//! Progress reporting service
//!
//! Progress events are `(label, current, total)` triples. Downloads report
//! under `fetch:<key>` after every received chunk, the inference pipeline
//! reports `compute:inference` once before and once after the computation.

use std::sync::Arc;

/// Label used for pipeline-level inference milestones
pub const INFERENCE_LABEL: &str = "compute:inference";

/// Build the progress label for downloading the artifact `key`
#[must_use]
pub fn fetch_label(key: &str) -> String {
    format!("fetch:{}", key)
}

/// Receiver of progress events
pub trait ProgressSink: Send + Sync {
    /// Report that `current` of `total` units of work under `label` are done
    fn report(&self, label: &str, current: u64, total: u64);
}

impl<F> ProgressSink for F
where
    F: Fn(&str, u64, u64) + Send + Sync,
{
    fn report(&self, label: &str, current: u64, total: u64) {
        self(label, current, total);
    }
}

/// Shared handle to a progress sink, as stored in configuration
pub type ProgressCallback = Arc<dyn ProgressSink>;

/// No-op progress sink that discards all events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpProgressSink;

impl ProgressSink for NoOpProgressSink {
    fn report(&self, _label: &str, _current: u64, _total: u64) {}
}

/// Progress sink installed in debug mode when the caller supplied none
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingProgressSink;

impl ProgressSink for LoggingProgressSink {
    fn report(&self, label: &str, current: u64, total: u64) {
        log::debug!("Downloading {}: {} of {}", label, current, total);
    }
}

/// Pick the sink a pipeline should report to
///
/// An explicit callback always wins; debug mode falls back to logging.
#[must_use]
pub fn effective_sink(progress: Option<&ProgressCallback>, debug: bool) -> Option<ProgressCallback> {
    match progress {
        Some(sink) => Some(Arc::clone(sink)),
        None if debug => Some(Arc::new(LoggingProgressSink)),
        None => None,
    }
}
