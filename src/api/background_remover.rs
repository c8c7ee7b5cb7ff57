//! High-level background removal facade

use crate::cache::AssetCache;
use crate::catalog::{AssetCatalog, AssetEntry};
use crate::config::RemovalConfig;
use crate::download::{ChunkedFetcher, FetchOptions};
use crate::error::{BgRemovalError, Result};
use crate::inference::InferenceRuntime;
use crate::processor::{InferenceOptions, InferencePipeline};
use crate::services::io::{ImageIOService, ImageSource};
use crate::session_cache::SessionBuilder;
use image::RgbaImage;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Background remover bound to one configuration
///
/// Every call builds (or reuses) the session for the configuration, so a
/// separate warm-up is optional. Only one operation is tracked for
/// cancellation: starting a call replaces the token [`Self::cancel`] fires.
///
/// # Examples
///
/// ```rust,no_run
/// # #[cfg(feature = "tract")]
/// # async fn example() -> imgly_bgremove_web::Result<()> {
/// use imgly_bgremove_web::{BackgroundRemover, RemovalConfig, TractRuntime};
/// use std::sync::Arc;
///
/// let config = RemovalConfig::builder()
///     .public_path("https://cdn.example.com/bgremove/")
///     .build()?;
/// let remover = BackgroundRemover::open(config, Arc::new(TractRuntime::new()), None).await?;
/// let png = remover.remove_background("portrait.jpg").await?;
/// std::fs::write("portrait.png", png)?;
/// # Ok(())
/// # }
/// ```
pub struct BackgroundRemover<R: InferenceRuntime> {
    config: RemovalConfig,
    sessions: Arc<SessionBuilder<R>>,
    pipeline: InferencePipeline<R>,
    current: Mutex<CancellationToken>,
}

impl<R: InferenceRuntime> std::fmt::Debug for BackgroundRemover<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundRemover")
            .field("config", &self.config)
            .field("sessions", &self.sessions)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl<R: InferenceRuntime> BackgroundRemover<R> {
    /// Remover over an existing asset cache
    ///
    /// # Errors
    /// - `InvalidConfig` when the configuration fails validation
    pub fn new(config: RemovalConfig, runtime: Arc<R>, cache: Arc<AssetCache>) -> Result<Self> {
        let sessions = Arc::new(SessionBuilder::new(runtime, cache));
        Self::with_session_builder(config, sessions)
    }

    /// Remover sharing memoized sessions with other removers
    ///
    /// # Errors
    /// - `InvalidConfig` when the configuration fails validation
    pub fn with_session_builder(
        config: RemovalConfig,
        sessions: Arc<SessionBuilder<R>>,
    ) -> Result<Self> {
        config.validate()?;
        let pipeline = InferencePipeline::new(Arc::clone(sessions.runtime()));
        Ok(Self {
            config,
            sessions,
            pipeline,
            current: Mutex::new(CancellationToken::new()),
        })
    }

    /// Remover over the default catalog, HTTP transport and on-disk cache
    ///
    /// # Errors
    /// - `InvalidConfig` when the configuration fails validation
    /// - `Network` when the HTTP client cannot be created
    pub async fn open(
        config: RemovalConfig,
        runtime: Arc<R>,
        cache_dir: Option<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = AssetCache::open(
            Arc::new(AssetCatalog::default()),
            ChunkedFetcher::http()?,
            cache_dir,
        )
        .await;
        Self::new(config, runtime, Arc::new(cache))
    }

    #[must_use]
    pub fn config(&self) -> &RemovalConfig {
        &self.config
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionBuilder<R>> {
        &self.sessions
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<AssetCache> {
        self.sessions.cache()
    }

    /// Cancel the most recently started operation
    pub fn cancel(&self) {
        if let Ok(current) = self.current.lock() {
            log::debug!("Cancelling current background removal");
            current.cancel();
        }
    }

    /// Start tracking a new operation
    fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut current) = self.current.lock() {
            *current = token.clone();
        }
        token
    }

    fn fetch_options(&self, cancel: &CancellationToken) -> FetchOptions {
        FetchOptions::from_config(&self.config).with_cancel(cancel.clone())
    }

    /// Start downloading every catalog artifact in the background
    pub fn preload(&self) -> BTreeMap<String, AssetEntry> {
        let token = self.begin();
        self.cache().preload_all(&self.fetch_options(&token))
    }

    /// Download the assets and build the session ahead of the first image
    ///
    /// # Errors
    /// - Download and session construction failures
    pub async fn warm_up(&self) -> Result<()> {
        let token = self.begin();
        self.sessions.build(&self.config, Some(token)).await?;
        Ok(())
    }

    /// Remove the background of any image source, returning PNG bytes
    ///
    /// # Errors
    /// - `UnsupportedFormat` before any model work when the source cannot
    ///   be decoded
    /// - Download, session and inference failures
    /// - `Cancelled` after [`Self::cancel`]
    pub async fn remove_background<S: Into<ImageSource>>(&self, source: S) -> Result<Vec<u8>> {
        let token = self.begin();
        let source = source.into();
        log::debug!("Removing background from {}", source.describe());

        let image = ImageIOService::load(
            source,
            self.cache().fetcher(),
            &self.fetch_options(&token),
        )
        .await?;
        let output = self.run(&image, &token).await?;
        ImageIOService::encode_png(&output)
    }

    /// Remove the background of decoded pixels
    ///
    /// # Errors
    /// - Download, session and inference failures
    /// - `Cancelled` after [`Self::cancel`]
    pub async fn remove_background_image(&self, image: &RgbaImage) -> Result<RgbaImage> {
        let token = self.begin();
        self.run(image, &token).await
    }

    async fn run(&self, image: &RgbaImage, token: &CancellationToken) -> Result<RgbaImage> {
        if image.width() == 0 || image.height() == 0 {
            return Err(BgRemovalError::unsupported_format(format!(
                "Image has no pixels ({}x{})",
                image.width(),
                image.height()
            )));
        }

        let session = self
            .sessions
            .build(&self.config, Some(token.clone()))
            .await?;
        let options = InferenceOptions {
            progress: self.config.progress.clone(),
            cancel: Some(token.clone()),
        };
        self.pipeline.infer(image, Some(&session), &options).await
    }
}
