#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]

//! # IMG.LY Background Removal for the Web, in Rust
//!
//! Removes image backgrounds with a pre-trained segmentation model. The crate
//! downloads the model and runtime backend binaries, caches them durably by
//! logical key, builds one inference session per configuration, and runs
//! images through a fixed 1024×1024 working resolution before scaling the
//! masked result back to the original aspect ratio.
//!
//! ## Features
//!
//! - **Asset cache**: byte-exact chunked downloads with progress events,
//!   size verification, and a write-once on-disk store
//! - **Memoized sessions**: concurrent requests with equal configuration
//!   share one model fetch and one session construction
//! - **Pluggable runtimes**: Tract (pure Rust) and ONNX Runtime behind one
//!   two-operation trait
//! - **Cancellation**: downloads and pipeline stages observe a
//!   `CancellationToken`
//! - **CLI**: `preload`, `remove` and `cache` commands (enable with `cli`)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "tract")]
//! # async fn example() -> anyhow::Result<()> {
//! use imgly_bgremove_web::{BackgroundRemover, ModelVariant, RemovalConfig, TractRuntime};
//! use std::sync::Arc;
//!
//! let config = RemovalConfig::builder()
//!     .public_path("https://cdn.example.com/background-removal/dist/")
//!     .model(ModelVariant::Small)
//!     .on_progress(|label, current, total| println!("{label}: {current}/{total}"))
//!     .build()?;
//!
//! let remover = BackgroundRemover::open(config, Arc::new(TractRuntime::new()), None).await?;
//! let png = remover.remove_background("input.jpg").await?;
//! tokio::fs::write("output.png", png).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `tract` (default): pure Rust runtime
//! - `onnx`: ONNX Runtime
//! - `cli` (default): command-line interface
//! - `webp-support` (default): WebP input decoding
//! - `tracing-json`: JSON log output for the CLI

pub mod api;
pub mod backends;
pub mod cache;
pub mod catalog;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod download;
pub mod error;
pub mod inference;
pub mod processor;
pub mod services;
pub mod session_cache;
#[cfg(feature = "cli")]
pub mod tracing_config;
pub mod utils;

pub use api::BackgroundRemover;
pub use cache::{
    default_cache_dir, format_size, ArtifactMetadata, ArtifactStore, AssetCache, CachedArtifact,
    FsArtifactStore, MemoryArtifactStore,
};
pub use catalog::{AssetCatalog, AssetEntry};
pub use config::{FetchOverrides, ModelVariant, RemovalConfig, RemovalConfigBuilder};
pub use download::{
    ChunkedFetcher, FetchOptions, FetchRequest, FetchResponse, FetchedArtifact, HttpTransport,
    Transport,
};
pub use error::{BgRemovalError, Result};
pub use inference::{InferenceRuntime, RuntimeEnvironment, Tensor};
pub use processor::{InferenceOptions, InferencePipeline, WORKING_RESOLUTION};
pub use services::{ImageIOService, ImageSource, ProgressCallback, ProgressSink};
pub use session_cache::SessionBuilder;
pub use utils::{BackendProfile, HostInfo, RuntimeCapabilities};

#[cfg(feature = "onnx")]
pub use backends::OnnxRuntime;
#[cfg(feature = "tract")]
pub use backends::TractRuntime;

pub use tokio_util::sync::CancellationToken;
