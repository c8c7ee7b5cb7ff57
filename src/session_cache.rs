//! Memoized inference session construction
//!
//! Sessions are keyed by [`RemovalConfig::fingerprint`]. Concurrent builds for
//! structurally equal configurations share one pending slot, so the model is
//! fetched and the runtime session constructed at most once per fingerprint.

use crate::cache::{AssetCache, CachedArtifact};
use crate::config::RemovalConfig;
use crate::download::{wait_cancelled, FetchOptions};
use crate::error::{BgRemovalError, Result};
use crate::inference::{InferenceRuntime, RuntimeEnvironment};
use crate::utils::{BackendProfile, HostInfo, RuntimeCapabilities};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

// Use instant crate for cross-platform time compatibility
use instant::Instant;

type SessionSlot<S> = Arc<OnceCell<Arc<S>>>;

/// Builds and memoizes runtime sessions
pub struct SessionBuilder<R: InferenceRuntime> {
    runtime: Arc<R>,
    cache: Arc<AssetCache>,
    host: HostInfo,
    sessions: Mutex<HashMap<String, SessionSlot<R::Session>>>,
}

impl<R: InferenceRuntime> std::fmt::Debug for SessionBuilder<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("runtime", &self.runtime.name())
            .field("host", &self.host)
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}

impl<R: InferenceRuntime> SessionBuilder<R> {
    /// Builder probing the current host
    #[must_use]
    pub fn new(runtime: Arc<R>, cache: Arc<AssetCache>) -> Self {
        Self::with_host(runtime, cache, HostInfo::detect())
    }

    /// Builder for an explicitly described host
    #[must_use]
    pub fn with_host(runtime: Arc<R>, cache: Arc<AssetCache>, host: HostInfo) -> Self {
        Self {
            runtime,
            cache,
            host,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<AssetCache> {
        &self.cache
    }

    #[must_use]
    pub fn host(&self) -> HostInfo {
        self.host
    }

    /// Return the session for `config`, building it on first use
    ///
    /// Callers racing on the same fingerprint await the same build. A failed
    /// or cancelled build is not remembered; the next call builds again.
    ///
    /// # Errors
    /// - Asset download failures (`Network`, `Integrity`, `Cancelled`)
    /// - `Session` when the runtime rejects the model
    pub async fn build(
        &self,
        config: &RemovalConfig,
        cancel: Option<CancellationToken>,
    ) -> Result<Arc<R::Session>> {
        let slot = self.slot(&config.fingerprint())?;
        let waiting = cancel.clone();
        tokio::select! {
            biased;
            session = slot.get_or_try_init(|| self.construct(config, cancel)) => session.cloned(),
            () = wait_cancelled(waiting.as_ref()) => Err(BgRemovalError::Cancelled),
        }
    }

    /// Completed session for `config`, without building one
    #[must_use]
    pub fn cached_session(&self, config: &RemovalConfig) -> Option<Arc<R::Session>> {
        let sessions = self.sessions.lock().ok()?;
        sessions.get(&config.fingerprint())?.get().cloned()
    }

    /// Forget the session built for `config`
    pub fn invalidate(&self, config: &RemovalConfig) -> bool {
        self.sessions
            .lock()
            .map(|mut sessions| sessions.remove(&config.fingerprint()).is_some())
            .unwrap_or(false)
    }

    /// Forget every memoized session
    pub fn clear(&self) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.clear();
        }
    }

    /// Number of fingerprints with a pending or completed build
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, fingerprint: &str) -> Result<SessionSlot<R::Session>> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| BgRemovalError::internal("Session table lock poisoned"))?;
        Ok(Arc::clone(
            sessions.entry(fingerprint.to_string()).or_default(),
        ))
    }

    #[instrument(
        skip(self, config, cancel),
        fields(runtime = self.runtime.name(), model = %config.model)
    )]
    async fn construct(
        &self,
        config: &RemovalConfig,
        cancel: Option<CancellationToken>,
    ) -> Result<Arc<R::Session>> {
        let start = Instant::now();
        let mut options = FetchOptions::from_config(config);
        options.cancel = cancel;

        let backends = self.ensure_backends(&options).await?;

        let capabilities = RuntimeCapabilities::probe(self.host, config.proxy_to_worker);
        if config.debug {
            log::debug!("Runtime capabilities: {:?}", capabilities);
            if !self.host.cross_origin_isolated {
                log::warn!(
                    "Host is not cross-origin isolated; shared-memory threading is \
                     disabled and inference runs on a single thread"
                );
            }
        }

        let model = self
            .cache
            .fetch_artifact(config.model.asset_key(), &options)
            .await?;

        let StagedBackends {
            dir: staging_dir,
            paths,
        } = Self::stage_backends(&backends).await?;
        let mut environment = RuntimeEnvironment::new(capabilities, config.debug);
        environment.backend_paths = paths;
        if config.debug {
            log::debug!(
                "Runtime environment: {} threads, preferred backend {:?}, proxy {}",
                environment.num_threads(),
                environment.preferred_profile,
                environment.proxy
            );
        }

        let session = self
            .runtime
            .create_session(&model.bytes, &environment)
            .await
            .map_err(|e| match e {
                BgRemovalError::Session(_) => e,
                other => BgRemovalError::session_construction(other),
            });
        drop(staging_dir);
        let session = session?;

        log::info!(
            "Built {} session for model '{}' in {:.0}ms",
            self.runtime.name(),
            config.model,
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(Arc::new(session))
    }

    /// Make sure every backend binary is available
    async fn ensure_backends(&self, options: &FetchOptions) -> Result<Vec<CachedArtifact>> {
        let fetches = BackendProfile::ALL
            .iter()
            .map(|profile| self.cache.fetch_artifact(profile.asset_key(), options));
        futures::future::try_join_all(fetches).await
    }

    async fn stage_backends(backends: &[CachedArtifact]) -> Result<StagedBackends> {
        let dir = tempfile::Builder::new()
            .prefix("imgly-bgremove-backends-")
            .tempdir()
            .map_err(|e| BgRemovalError::file_io_error("create staging directory", std::env::temp_dir(), &e))?;

        let mut paths = BTreeMap::new();
        for artifact in backends {
            let path = dir.path().join(&artifact.key);
            tokio::fs::write(&path, &artifact.bytes)
                .await
                .map_err(|e| BgRemovalError::file_io_error("stage backend binary", &path, &e))?;
            paths.insert(artifact.key.clone(), path);
        }
        Ok(StagedBackends { dir, paths })
    }
}

/// Backend binaries written to a temporary directory
///
/// The directory is deleted when this value is dropped.
struct StagedBackends {
    dir: TempDir,
    paths: BTreeMap<String, PathBuf>,
}
