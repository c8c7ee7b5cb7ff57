//! Inference runtime implementations
//!
//! - Tract runtime (pure Rust, default)
//! - ONNX Runtime (native library, `onnx` feature)

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "tract")]
pub mod tract;

// Test utilities for runtime and transport doubles
#[cfg(test)]
pub mod test_utils;

#[cfg(feature = "onnx")]
pub use self::onnx::{OnnxRuntime, OnnxSession};

#[cfg(feature = "tract")]
pub use self::tract::{TractRuntime, TractSession};
