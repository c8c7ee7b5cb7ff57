//! Services around the core pipeline
//!
//! - [`io`]: turning image sources into RGBA buffers and back into bytes
//! - [`progress`]: progress event sinks

pub mod io;
pub mod progress;

pub use io::{ImageIOService, ImageSource};
pub use progress::{
    effective_sink, fetch_label, LoggingProgressSink, NoOpProgressSink, ProgressCallback,
    ProgressSink, INFERENCE_LABEL,
};
