//! Image geometry, tensor conversion, resampling and host capability helpers

pub mod capabilities;
pub mod geometry;
pub mod preprocessing;
pub mod resampling;

pub use capabilities::{BackendProfile, HostInfo, RuntimeCapabilities};
pub use geometry::{output_size, scale_to_fit};
pub use preprocessing::{ImagePreprocessor, NormalizationParams};
pub use resampling::resize_premultiplied;
