//! Public facade
//!
//! [`BackgroundRemover`] ties configuration, asset cache, session builder
//! and inference pipeline together behind a small async API.

pub mod background_remover;

pub use background_remover::BackgroundRemover;
