//! Error types for asset acquisition, session construction and inference

use thiserror::Error;

/// Result type alias for background removal operations
pub type Result<T> = std::result::Result<T, BgRemovalError>;

/// Error taxonomy for the whole crate
#[derive(Error, Debug)]
pub enum BgRemovalError {
    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding or encoding errors
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// Downloaded artifact does not match the size declared by the catalog
    #[error("Integrity error: failed to fetch {key} with size {expected} but got {actual}")]
    Integrity {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Network failure while fetching an artifact
    #[error("Network error: {0}")]
    Network(String),

    /// The inference runtime rejected the model or its configuration
    #[error("Session error: {0}")]
    Session(String),

    /// Tensor or mask dimensions do not line up
    #[error("Shape error: {0}")]
    Shape(String),

    /// Backend inference errors
    #[error("Inference error: {0}")]
    Inference(String),

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Input source could not be turned into an image
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Durable artifact storage failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// Processing errors outside the tensor contract
    #[error("Processing error: {0}")]
    Processing(String),

    /// The operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BgRemovalError {
    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new unsupported format error
    pub fn unsupported_format<S: Into<String>>(format: S) -> Self {
        Self::UnsupportedFormat(format.into())
    }

    /// Create a new processing error
    pub fn processing<S: Into<String>>(msg: S) -> Self {
        Self::Processing(msg.into())
    }

    /// Create a new inference error
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    /// Create a new shape error
    pub fn shape<S: Into<String>>(msg: S) -> Self {
        Self::Shape(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an integrity error for a size mismatch
    pub fn integrity<S: Into<String>>(key: S, expected: u64, actual: u64) -> Self {
        Self::Integrity {
            key: key.into(),
            expected,
            actual,
        }
    }

    /// Create a network error with context
    pub fn network_error<S: Into<String>, E: std::fmt::Display>(context: S, error: E) -> Self {
        Self::Network(format!("{}: {}", context.into(), error))
    }

    /// Wrap a runtime session failure with the asset base path hint
    pub fn session_construction<E: std::fmt::Display>(error: E) -> Self {
        Self::Session(format!(
            "Failed to create session: {}. Please check if the public path is set correctly.",
            error
        ))
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<std::path::Path>>(
        operation: &str,
        path: P,
        error: &std::io::Error,
    ) -> Self {
        let path_display = path.as_ref().display();
        Self::Io(std::io::Error::new(
            error.kind(),
            format!("Failed to {} '{}': {}", operation, path_display, error),
        ))
    }

    /// Create processing error with stage context
    pub fn processing_stage_error(stage: &str, details: &str, input_info: Option<&str>) -> Self {
        let input_context = match input_info {
            Some(info) => format!(" (input: {})", info),
            None => String::new(),
        };

        Self::Processing(format!(
            "Processing failed at stage '{}'{}: {}",
            stage, input_context, details
        ))
    }

    /// Whether the caller may reasonably retry the failed operation
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Cancelled)
    }
}
