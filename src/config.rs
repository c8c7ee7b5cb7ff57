//! Configuration types for background removal operations

use crate::error::{BgRemovalError, Result};
use crate::services::progress::ProgressCallback;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Segmentation model variant shipped in the asset catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    /// Quantised model, roughly half the download size
    Small,
    /// Full precision model
    #[default]
    Medium,
}

impl ModelVariant {
    /// Catalog key of the model artifact
    #[must_use]
    pub fn asset_key(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
        }
    }
}

impl std::fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.asset_key())
    }
}

impl FromStr for ModelVariant {
    type Err = BgRemovalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            other => Err(BgRemovalError::invalid_config(format!(
                "Unknown model variant: {}. Supported: small, medium",
                other
            ))),
        }
    }
}

/// Caller-supplied overrides applied to every artifact request
///
/// Header names are stored lower-cased so that equal overrides always
/// serialize identically. Overrides win over the default request headers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FetchOverrides {
    /// Extra or replacement request headers
    pub headers: BTreeMap<String, String>,
    /// Per-request timeout; no timeout is applied when unset
    pub timeout: Option<Duration>,
}

impl FetchOverrides {
    /// Add or replace a header override
    #[must_use]
    pub fn with_header<K: AsRef<str>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Set the per-request timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in &self.headers {
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                BgRemovalError::invalid_config(format!("Invalid header name '{}': {}", name, e))
            })?;
            HeaderValue::from_str(value).map_err(|e| {
                BgRemovalError::invalid_config(format!(
                    "Invalid value for header '{}': {}",
                    name, e
                ))
            })?;
        }
        Ok(())
    }
}

/// Configuration for background removal operations
#[derive(Clone, Default)]
pub struct RemovalConfig {
    /// Enable debug mode (default progress logging, capability diagnostics)
    pub debug: bool,

    /// Ask the runtime to proxy execution to a worker thread
    pub proxy_to_worker: bool,

    /// Model variant to load
    pub model: ModelVariant,

    /// Request overrides for asset downloads
    pub fetch_args: FetchOverrides,

    /// Optional progress sink for downloads and inference milestones
    pub progress: Option<ProgressCallback>,

    /// Base URL that asset file names are resolved against
    pub public_path: Option<Url>,
}

impl std::fmt::Debug for RemovalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemovalConfig")
            .field("debug", &self.debug)
            .field("proxy_to_worker", &self.proxy_to_worker)
            .field("model", &self.model)
            .field("fetch_args", &self.fetch_args)
            .field("progress", &self.progress.as_ref().map(|_| "<sink>"))
            .field("public_path", &self.public_path.as_ref().map(Url::as_str))
            .finish()
    }
}

/// Serializable view of a configuration, used for fingerprinting
#[derive(Serialize)]
struct FingerprintView<'a> {
    debug: bool,
    proxy_to_worker: bool,
    model: ModelVariant,
    fetch_args: &'a FetchOverrides,
    public_path: Option<&'a str>,
}

impl RemovalConfig {
    /// Create a new configuration builder
    ///
    /// # Examples
    ///
    /// ```rust
    /// use imgly_bgremove_web::{ModelVariant, RemovalConfig};
    ///
    /// let config = RemovalConfig::builder()
    ///     .model(ModelVariant::Small)
    ///     .public_path("https://cdn.example.com/bgremove/")
    ///     .debug(true)
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(config.model, ModelVariant::Small);
    /// ```
    #[must_use]
    pub fn builder() -> RemovalConfigBuilder {
        RemovalConfigBuilder::default()
    }

    /// Validate all configuration parameters
    ///
    /// # Errors
    /// - Header overrides that are not valid HTTP header names or values
    /// - A public path that cannot serve as a base URL
    pub fn validate(&self) -> Result<()> {
        self.fetch_args.validate()?;
        if let Some(public_path) = &self.public_path {
            if public_path.cannot_be_a_base() {
                return Err(BgRemovalError::invalid_config(format!(
                    "Public path '{}' cannot be used as a base URL",
                    public_path
                )));
            }
        }
        Ok(())
    }

    /// Normalized serialization of the configuration
    ///
    /// Structurally equal configurations produce identical strings. The
    /// progress sink is not part of the serialization.
    #[must_use]
    pub fn normalized(&self) -> String {
        let view = FingerprintView {
            debug: self.debug,
            proxy_to_worker: self.proxy_to_worker,
            model: self.model,
            fetch_args: &self.fetch_args,
            public_path: self.public_path.as_ref().map(Url::as_str),
        };
        // Plain structs and BTreeMaps always serialize
        serde_json::to_string(&view).unwrap_or_default()
    }

    /// Memoization key for session construction
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.normalized().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Builder for `RemovalConfig`
#[derive(Default)]
pub struct RemovalConfigBuilder {
    config: RemovalConfig,
    public_path: Option<String>,
}

impl RemovalConfigBuilder {
    /// Enable or disable debug mode
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Forward execution to a worker thread inside the runtime
    #[must_use]
    pub fn proxy_to_worker(mut self, proxy: bool) -> Self {
        self.config.proxy_to_worker = proxy;
        self
    }

    /// Select the model variant
    #[must_use]
    pub fn model(mut self, model: ModelVariant) -> Self {
        self.config.model = model;
        self
    }

    /// Replace all fetch overrides
    #[must_use]
    pub fn fetch_args(mut self, fetch_args: FetchOverrides) -> Self {
        self.config.fetch_args = fetch_args;
        self
    }

    /// Add a single header override
    #[must_use]
    pub fn header<K: AsRef<str>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.config.fetch_args = self.config.fetch_args.with_header(name, value);
        self
    }

    /// Set a per-request download timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_args.timeout = Some(timeout);
        self
    }

    /// Install a progress sink
    #[must_use]
    pub fn progress(mut self, progress: ProgressCallback) -> Self {
        self.config.progress = Some(progress);
        self
    }

    /// Install a progress closure
    #[must_use]
    pub fn on_progress<F>(self, progress: F) -> Self
    where
        F: Fn(&str, u64, u64) + Send + Sync + 'static,
    {
        self.progress(Arc::new(progress))
    }

    /// Base URL that asset file names are resolved against
    ///
    /// Resolution follows URL join rules: keep a trailing slash to resolve
    /// inside the last path segment.
    #[must_use]
    pub fn public_path<S: Into<String>>(mut self, public_path: S) -> Self {
        self.public_path = Some(public_path.into());
        self
    }

    /// Build and validate the configuration
    ///
    /// # Errors
    /// - Public path is not an absolute URL
    /// - Invalid header overrides
    pub fn build(self) -> Result<RemovalConfig> {
        let mut config = self.config;
        if let Some(raw) = self.public_path {
            let url = Url::parse(&raw).map_err(|e| {
                BgRemovalError::invalid_config(format!(
                    "Public path must be an absolute URL, got '{}': {}",
                    raw, e
                ))
            })?;
            if !url.path().ends_with('/') {
                log::warn!(
                    "Public path '{}' has no trailing slash; its last segment will be replaced during resolution",
                    url
                );
            }
            config.public_path = Some(url);
        }
        config.validate()?;
        Ok(config)
    }
}
