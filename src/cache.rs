//! Durable, idempotent artifact cache
//!
//! Artifacts are looked up by logical key in an [`ArtifactStore`] and only
//! downloaded on a miss. A stored artifact is never overwritten and never
//! returned unless its length matches the catalog size. Concurrent first-time
//! fetches of one key share a single download.

use crate::catalog::{AssetCatalog, AssetEntry};
use crate::download::{wait_cancelled, ChunkedFetcher, FetchOptions};
use crate::error::{BgRemovalError, Result};
use crate::services::progress::{fetch_label, ProgressCallback, ProgressSink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, OnceCell};

/// Environment variable overriding the cache root
pub const CACHE_DIR_ENV: &str = "IMGLY_BGREMOVE_CACHE_DIR";

/// Sidecar record stored next to every artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub key: String,
    pub size: u64,
    /// Server `Last-Modified` marker captured on download
    pub last_modified: Option<String>,
    pub stored_at: DateTime<Utc>,
}

/// A complete artifact held by the cache
#[derive(Debug, Clone)]
pub struct CachedArtifact {
    pub key: String,
    pub bytes: Arc<[u8]>,
    pub last_modified: Option<String>,
}

impl CachedArtifact {
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Durable key-value storage for artifact bytes
#[async_trait]
pub trait ArtifactStore: Send + Sync + std::fmt::Debug {
    /// Metadata of a stored artifact without reading its bytes
    async fn metadata(&self, key: &str) -> Result<Option<ArtifactMetadata>>;

    async fn get(&self, key: &str) -> Result<Option<CachedArtifact>>;

    /// Store an artifact; an existing entry under `key` is kept
    async fn put(&self, artifact: &CachedArtifact) -> Result<()>;

    /// Returns whether anything was removed
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Stored keys in sorted order
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Resolve the default on-disk cache directory
///
/// Uses XDG Base Directory specification for cache location:
/// - Linux/macOS: `~/.cache/imgly-bgremove/assets/`
/// - Windows: `%LOCALAPPDATA%/imgly-bgremove/assets/`
///
/// # Errors
/// - Failed to determine user cache directory
pub fn default_cache_dir() -> Result<PathBuf> {
    if let Ok(cache_override) = std::env::var(CACHE_DIR_ENV) {
        return Ok(PathBuf::from(cache_override).join("assets"));
    }

    Ok(dirs::cache_dir()
        .ok_or_else(|| {
            BgRemovalError::invalid_config(format!(
                "Failed to determine cache directory. Set {} environment variable.",
                CACHE_DIR_ENV
            ))
        })?
        .join("imgly-bgremove")
        .join("assets"))
}

/// One `<key>.bin` plus `<key>.meta.json` per artifact
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Open (and create) a store rooted at `root`
    ///
    /// # Errors
    /// - Failed to create the directory
    pub async fn open<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| BgRemovalError::file_io_error("create cache directory", &root, &e))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File-name-safe form of a key
    fn file_stem(key: &str) -> String {
        key.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.bin", Self::file_stem(key)))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.meta.json", Self::file_stem(key)))
    }

    /// Write via a temporary file and rename into place
    async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
        let temp_path = path.with_extension(format!("partial-{}", std::process::id()));
        tokio::fs::write(&temp_path, contents)
            .await
            .map_err(|e| BgRemovalError::file_io_error("write temporary file", &temp_path, &e))?;
        if let Err(e) = tokio::fs::rename(&temp_path, path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(BgRemovalError::file_io_error("move file into cache", path, &e));
        }
        Ok(())
    }

    async fn read_metadata(path: &Path) -> Result<Option<ArtifactMetadata>> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BgRemovalError::file_io_error("read metadata", path, &e)),
        };
        let metadata = serde_json::from_slice(&raw).map_err(|e| {
            BgRemovalError::storage(format!("Corrupt metadata {}: {}", path.display(), e))
        })?;
        Ok(Some(metadata))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn metadata(&self, key: &str) -> Result<Option<ArtifactMetadata>> {
        Self::read_metadata(&self.meta_path(key)).await
    }

    async fn get(&self, key: &str) -> Result<Option<CachedArtifact>> {
        let Some(metadata) = self.metadata(key).await? else {
            return Ok(None);
        };
        let data_path = self.data_path(key);
        let bytes = match tokio::fs::read(&data_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BgRemovalError::file_io_error("read artifact", &data_path, &e)),
        };
        Ok(Some(CachedArtifact {
            key: metadata.key,
            bytes: bytes.into(),
            last_modified: metadata.last_modified,
        }))
    }

    async fn put(&self, artifact: &CachedArtifact) -> Result<()> {
        if self.metadata(&artifact.key).await?.is_some() {
            log::debug!("Artifact {} already stored; keeping existing entry", artifact.key);
            return Ok(());
        }

        let metadata = ArtifactMetadata {
            key: artifact.key.clone(),
            size: artifact.bytes.len() as u64,
            last_modified: artifact.last_modified.clone(),
            stored_at: Utc::now(),
        };
        let meta_json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| BgRemovalError::storage(format!("Failed to encode metadata: {}", e)))?;

        // Data first: metadata marks the entry complete
        Self::write_atomic(&self.data_path(&artifact.key), &artifact.bytes).await?;
        Self::write_atomic(&self.meta_path(&artifact.key), &meta_json).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut removed = false;
        for path in [self.meta_path(key), self.data_path(key)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => return Err(BgRemovalError::file_io_error("remove artifact", &path, &e)),
            }
        }
        Ok(removed)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| BgRemovalError::file_io_error("read cache directory", &self.root, &e))?;

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BgRemovalError::file_io_error("read cache directory", &self.root, &e))?
        {
            let path = entry.path();
            let is_meta = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(".meta.json"));
            if !is_meta {
                continue;
            }
            match Self::read_metadata(&path).await {
                Ok(Some(metadata)) => keys.push(metadata.key),
                Ok(None) => {},
                Err(e) => log::warn!("Skipping unreadable cache entry: {}", e),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Non-durable in-process store
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    entries: Mutex<HashMap<String, (CachedArtifact, DateTime<Utc>)>>,
}

impl MemoryArtifactStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, (CachedArtifact, DateTime<Utc>)>>> {
        self.entries
            .lock()
            .map_err(|_| BgRemovalError::internal("Memory store lock poisoned"))
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn metadata(&self, key: &str) -> Result<Option<ArtifactMetadata>> {
        Ok(self.lock()?.get(key).map(|(artifact, stored_at)| ArtifactMetadata {
            key: artifact.key.clone(),
            size: artifact.bytes.len() as u64,
            last_modified: artifact.last_modified.clone(),
            stored_at: *stored_at,
        }))
    }

    async fn get(&self, key: &str) -> Result<Option<CachedArtifact>> {
        Ok(self.lock()?.get(key).map(|(artifact, _)| artifact.clone()))
    }

    async fn put(&self, artifact: &CachedArtifact) -> Result<()> {
        self.lock()?
            .entry(artifact.key.clone())
            .or_insert_with(|| (artifact.clone(), Utc::now()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.lock()?.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.lock()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// A fetch shared by every caller asking for the same key
#[derive(Debug)]
struct InFlightFetch {
    artifact: OnceCell<CachedArtifact>,
    /// Bytes received by the download currently running for this slot
    received: watch::Sender<u64>,
}

impl Default for InFlightFetch {
    fn default() -> Self {
        Self {
            artifact: OnceCell::new(),
            received: watch::channel(0).0,
        }
    }
}

/// Progress sink of the caller running the download
///
/// Mirrors every chunk into the slot so joined callers can follow along.
struct SharedProgress {
    own: Option<ProgressCallback>,
    slot: Arc<InFlightFetch>,
}

impl ProgressSink for SharedProgress {
    fn report(&self, label: &str, current: u64, total: u64) {
        self.slot.received.send_replace(current);
        if let Some(own) = &self.own {
            own.report(label, current, total);
        }
    }
}

type InFlight = Mutex<HashMap<String, Arc<InFlightFetch>>>;

/// Catalog-driven artifact cache
#[derive(Debug)]
pub struct AssetCache {
    catalog: Arc<AssetCatalog>,
    fetcher: ChunkedFetcher,
    store: Option<Arc<dyn ArtifactStore>>,
    in_flight: InFlight,
}

impl AssetCache {
    /// Cache over an explicit store; `None` fetches every time
    #[must_use]
    pub fn new(
        catalog: Arc<AssetCatalog>,
        fetcher: ChunkedFetcher,
        store: Option<Arc<dyn ArtifactStore>>,
    ) -> Self {
        Self {
            catalog,
            fetcher,
            store,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Cache backed by the filesystem
    ///
    /// `dir` defaults to [`default_cache_dir`]. When the directory cannot be
    /// used the cache still works, downloading on every request.
    pub async fn open(
        catalog: Arc<AssetCatalog>,
        fetcher: ChunkedFetcher,
        dir: Option<PathBuf>,
    ) -> Self {
        let dir = match dir.map_or_else(default_cache_dir, Ok) {
            Ok(dir) => dir,
            Err(e) => {
                log::warn!("Durable cache unavailable, artifacts will not persist: {}", e);
                return Self::new(catalog, fetcher, None);
            },
        };

        match FsArtifactStore::open(&dir).await {
            Ok(store) => {
                log::debug!("Using artifact cache at {}", dir.display());
                Self::new(catalog, fetcher, Some(Arc::new(store)))
            },
            Err(e) => {
                log::warn!("Durable cache unavailable, artifacts will not persist: {}", e);
                Self::new(catalog, fetcher, None)
            },
        }
    }

    /// Cache backed by process memory
    #[must_use]
    pub fn in_memory(catalog: Arc<AssetCatalog>, fetcher: ChunkedFetcher) -> Self {
        Self::new(catalog, fetcher, Some(Arc::new(MemoryArtifactStore::new())))
    }

    #[must_use]
    pub fn catalog(&self) -> &AssetCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn fetcher(&self) -> &ChunkedFetcher {
        &self.fetcher
    }

    /// Whether fetched artifacts are retained
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    /// Return the artifact for `key`, downloading it on a miss
    ///
    /// # Errors
    /// - `InvalidConfig` for keys outside the catalog or unresolvable URLs
    /// - Transport errors, `Cancelled`, and `Integrity` from the download
    pub async fn fetch_artifact(&self, key: &str, options: &FetchOptions) -> Result<CachedArtifact> {
        let entry = self.catalog.get(key)?;

        let slot = {
            let mut in_flight = self
                .in_flight
                .lock()
                .map_err(|_| BgRemovalError::internal("In-flight table lock poisoned"))?;
            Arc::clone(in_flight.entry(key.to_string()).or_default())
        };

        let result = self.await_slot(entry, &slot, options).await;

        // Completed slots are dropped so later calls consult the store again.
        // An empty slot stays; the next caller simply runs the download.
        if slot.artifact.initialized() {
            if let Ok(mut in_flight) = self.in_flight.lock() {
                if in_flight
                    .get(key)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot))
                {
                    in_flight.remove(key);
                }
            }
        }

        result
    }

    /// Wait for the slot, running the download if nobody else is
    ///
    /// Callers that join a running download receive its progress through
    /// their own sink. Each caller stops waiting when its own token fires.
    async fn await_slot(
        &self,
        entry: &AssetEntry,
        slot: &Arc<InFlightFetch>,
        options: &FetchOptions,
    ) -> Result<CachedArtifact> {
        let running = AtomicBool::new(false);
        let forwarded = AtomicU64::new(0);
        let label = fetch_label(&entry.key);

        let init = slot.artifact.get_or_try_init(|| {
            running.store(true, Ordering::SeqCst);
            slot.received.send_replace(0);
            let mut options = options.clone();
            options.progress = Some(Arc::new(SharedProgress {
                own: options.progress.take(),
                slot: Arc::clone(slot),
            }));
            async move { self.load(entry, &options).await }
        });

        let forward = async {
            let Some(sink) = &options.progress else {
                return std::future::pending::<()>().await;
            };
            let mut received = slot.received.subscribe();
            while received.changed().await.is_ok() {
                let current = *received.borrow_and_update();
                if !running.load(Ordering::SeqCst) {
                    forwarded.store(current, Ordering::SeqCst);
                    sink.report(&label, current, entry.size);
                }
            }
            std::future::pending::<()>().await;
        };

        let result = tokio::select! {
            biased;
            result = init => result.cloned(),
            () = wait_cancelled(options.cancel.as_ref()) => Err(BgRemovalError::Cancelled),
            () = forward => Err(BgRemovalError::internal("Progress forwarding stopped")),
        };

        // Joined callers may have missed the last chunk before the slot filled
        if result.is_ok() && !running.load(Ordering::SeqCst) {
            if let Some(sink) = &options.progress {
                let received = *slot.received.borrow();
                if received > forwarded.load(Ordering::SeqCst) {
                    sink.report(&label, received, entry.size);
                }
            }
        }
        result
    }

    async fn load(&self, entry: &AssetEntry, options: &FetchOptions) -> Result<CachedArtifact> {
        if let Some(stored) = self.lookup(entry).await {
            log::debug!("Cache hit for {}", entry.key);
            return Ok(stored);
        }

        log::info!("Downloading {} ({} bytes)", entry.key, entry.size);
        let fetched = self.fetcher.fetch_entry(entry, options).await?;
        let artifact = CachedArtifact {
            key: entry.key.clone(),
            bytes: fetched.bytes.into(),
            last_modified: fetched.last_modified,
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.put(&artifact).await {
                log::warn!("Failed to persist {}: {}", entry.key, e);
            }
        }
        Ok(artifact)
    }

    /// Stored artifact with the catalog size, discarding anything else
    async fn lookup(&self, entry: &AssetEntry) -> Option<CachedArtifact> {
        let store = self.store.as_ref()?;
        match store.get(&entry.key).await {
            Ok(Some(stored)) if stored.bytes.len() as u64 == entry.size => Some(stored),
            Ok(Some(stored)) => {
                log::warn!(
                    "Stored {} has {} bytes, expected {}; refetching",
                    entry.key,
                    stored.bytes.len(),
                    entry.size
                );
                if let Err(e) = store.remove(&entry.key).await {
                    log::warn!("Failed to discard {}: {}", entry.key, e);
                }
                None
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("Cache lookup for {} failed: {}", entry.key, e);
                None
            },
        }
    }

    /// Start downloading every catalog entry in the background
    ///
    /// Returns the catalog immediately. Each download runs in its own task;
    /// failures are logged and never affect the other downloads.
    pub fn preload_all(self: &Arc<Self>, options: &FetchOptions) -> BTreeMap<String, AssetEntry> {
        let entries: BTreeMap<String, AssetEntry> = self
            .catalog
            .entries()
            .map(|entry| (entry.key.clone(), entry.clone()))
            .collect();

        for key in entries.keys() {
            let cache = Arc::clone(self);
            let options = options.clone();
            let key = key.clone();
            tokio::spawn(async move {
                if let Err(e) = cache.fetch_artifact(&key, &options).await {
                    log::warn!("Preloading {} failed: {}", key, e);
                }
            });
        }
        entries
    }

    /// Download every catalog entry concurrently and wait for all of them
    pub async fn fetch_all(&self, options: &FetchOptions) -> Vec<(String, Result<CachedArtifact>)> {
        let futures = self.catalog.entries().map(|entry| async move {
            let result = self.fetch_artifact(&entry.key, options).await;
            (entry.key.clone(), result)
        });
        futures::future::join_all(futures).await
    }

    /// Whether a valid artifact is stored for `key`
    pub async fn is_cached(&self, key: &str) -> bool {
        let (Some(store), Ok(entry)) = (&self.store, self.catalog.get(key)) else {
            return false;
        };
        matches!(
            store.metadata(key).await,
            Ok(Some(metadata)) if metadata.size == entry.size
        )
    }

    /// Metadata of every stored artifact
    ///
    /// # Errors
    /// - Store read failures
    pub async fn cached_entries(&self) -> Result<Vec<ArtifactMetadata>> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for key in store.keys().await? {
            if let Some(metadata) = store.metadata(&key).await? {
                entries.push(metadata);
            }
        }
        Ok(entries)
    }

    /// Keys of every stored artifact
    ///
    /// # Errors
    /// - Store read failures
    pub async fn cached_keys(&self) -> Result<Vec<String>> {
        match &self.store {
            Some(store) => store.keys().await,
            None => Ok(Vec::new()),
        }
    }

    /// Remove one stored artifact
    ///
    /// # Errors
    /// - Store write failures
    pub async fn remove(&self, key: &str) -> Result<bool> {
        match &self.store {
            Some(store) => store.remove(key).await,
            None => Ok(false),
        }
    }

    /// Remove every stored artifact, returning the removed keys
    ///
    /// # Errors
    /// - Store read or write failures
    pub async fn clear(&self) -> Result<Vec<String>> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        let mut removed = Vec::new();
        for key in store.keys().await? {
            if store.remove(&key).await? {
                log::info!("Removed cached artifact: {}", key);
                removed.push(key);
            }
        }
        Ok(removed)
    }
}

/// Format file size in human-readable format
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS.get(unit_index).unwrap_or(&"B"))
    } else {
        format!("{:.1} {}", size, UNITS.get(unit_index).unwrap_or(&"B"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::MockTransport;
    use crate::catalog::MODEL_MIME;
    use reqwest::Url;
    use std::time::Duration;
    use tempfile::TempDir;

    const BASE: &str = "https://cdn.example.com/dist/";

    fn catalog() -> Arc<AssetCatalog> {
        Arc::new(AssetCatalog::with_entries([
            AssetEntry::new("small", "models/s.onnx", 10, MODEL_MIME),
            AssetEntry::new("medium", "models/m.onnx", 20, MODEL_MIME),
        ]))
    }

    fn options() -> FetchOptions {
        FetchOptions {
            public_path: Some(Url::parse(BASE).unwrap()),
            ..FetchOptions::default()
        }
    }

    fn serving_transport() -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::new().with_last_modified("Tue, 01 Oct 2024 10:00:00 GMT"));
        transport.serve(format!("{BASE}s.onnx"), vec![1u8; 10]);
        transport.serve(format!("{BASE}m.onnx"), vec![2u8; 20]);
        transport
    }

    /// Store whose every operation fails
    #[derive(Debug)]
    struct BrokenStore;

    #[async_trait]
    impl ArtifactStore for BrokenStore {
        async fn metadata(&self, _key: &str) -> Result<Option<ArtifactMetadata>> {
            Err(BgRemovalError::storage("broken"))
        }
        async fn get(&self, _key: &str) -> Result<Option<CachedArtifact>> {
            Err(BgRemovalError::storage("broken"))
        }
        async fn put(&self, _artifact: &CachedArtifact) -> Result<()> {
            Err(BgRemovalError::storage("broken"))
        }
        async fn remove(&self, _key: &str) -> Result<bool> {
            Err(BgRemovalError::storage("broken"))
        }
        async fn keys(&self) -> Result<Vec<String>> {
            Err(BgRemovalError::storage("broken"))
        }
    }

    #[tokio::test]
    async fn test_second_fetch_is_served_from_store() {
        let transport = serving_transport();
        let cache = AssetCache::in_memory(catalog(), ChunkedFetcher::new(transport.clone()));

        let first = cache.fetch_artifact("small", &options()).await.unwrap();
        let second = cache.fetch_artifact("small", &options()).await.unwrap();

        assert_eq!(first.len(), 10);
        assert_eq!(&*first.bytes, &*second.bytes);
        assert_eq!(transport.request_count(), 1);
        assert!(cache.is_cached("small").await);
        assert!(!cache.is_cached("medium").await);
    }

    #[tokio::test]
    async fn test_truncated_download_is_not_retained() {
        let transport = serving_transport();
        transport.serve(format!("{BASE}m.onnx"), vec![2u8; 15]);
        let cache = AssetCache::in_memory(catalog(), ChunkedFetcher::new(transport.clone()));

        let err = cache.fetch_artifact("medium", &options()).await.unwrap_err();
        assert!(matches!(err, BgRemovalError::Integrity { .. }));
        assert!(!cache.is_cached("medium").await);

        transport.serve(format!("{BASE}m.onnx"), vec![2u8; 20]);
        let artifact = cache.fetch_artifact("medium", &options()).await.unwrap();
        assert_eq!(artifact.len(), 20);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_fetches_share_one_download() {
        let transport = Arc::new(
            MockTransport::new()
                .with_chunk_size(2)
                .with_chunk_delay(Duration::from_millis(5)),
        );
        transport.serve(format!("{BASE}m.onnx"), vec![2u8; 20]);
        let cache = AssetCache::in_memory(catalog(), ChunkedFetcher::new(transport.clone()));

        let opts = options();
        let (a, b, c) = tokio::join!(
            cache.fetch_artifact("medium", &opts),
            cache.fetch_artifact("medium", &opts),
            cache.fetch_artifact("medium", &opts),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(transport.request_count(), 1);
    }

    fn recording_options() -> (FetchOptions, Arc<Mutex<Vec<(String, u64, u64)>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&events);
        let opts = options().with_progress(Arc::new(move |label: &str, current: u64, total: u64| {
            captured.lock().unwrap().push((label.to_string(), current, total));
        }));
        (opts, events)
    }

    #[tokio::test]
    async fn test_joined_fetch_reports_progress_to_its_own_sink() {
        let transport = Arc::new(
            MockTransport::new()
                .with_chunk_size(2)
                .with_chunk_delay(Duration::from_millis(5)),
        );
        transport.serve(format!("{BASE}m.onnx"), vec![2u8; 20]);
        let cache = AssetCache::in_memory(catalog(), ChunkedFetcher::new(transport.clone()));

        let (first_opts, first_events) = recording_options();
        let (second_opts, second_events) = recording_options();
        let (a, b) = tokio::join!(
            cache.fetch_artifact("medium", &first_opts),
            cache.fetch_artifact("medium", &second_opts),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(transport.request_count(), 1);

        for events in [first_events, second_events] {
            let events = events.lock().unwrap();
            assert!(!events.is_empty());
            assert!(events.windows(2).all(|w| w[0].1 <= w[1].1));
            assert!(events.iter().all(|(label, _, total)| label == "fetch:medium" && *total == 20));
            assert_eq!(events.last().map(|e| e.1), Some(20));
        }
    }

    #[tokio::test]
    async fn test_joined_fetch_stops_waiting_on_its_own_cancel() {
        let transport = Arc::new(
            MockTransport::new()
                .with_chunk_size(1)
                .with_chunk_delay(Duration::from_millis(10)),
        );
        transport.serve(format!("{BASE}m.onnx"), vec![2u8; 20]);
        let cache = AssetCache::in_memory(catalog(), ChunkedFetcher::new(transport.clone()));

        let token = tokio_util::sync::CancellationToken::new();
        let joined_opts = options().with_cancel(token.clone());
        let plain_opts = options();
        let joined = async {
            let result = cache.fetch_artifact("medium", &joined_opts).await;
            (result, tokio::time::Instant::now())
        };
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.cancel();
            tokio::time::Instant::now()
        };

        let (owner, (joined, returned_at), cancelled_at) =
            tokio::join!(cache.fetch_artifact("medium", &plain_opts), joined, canceller);

        assert!(owner.is_ok());
        assert!(matches!(joined, Err(BgRemovalError::Cancelled)));
        assert!(returned_at.duration_since(cancelled_at) < Duration::from_millis(100));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_slot_is_kept_and_completed_slot_dropped() {
        let transport = serving_transport();
        transport.serve(format!("{BASE}m.onnx"), vec![2u8; 15]);
        let cache = AssetCache::in_memory(catalog(), ChunkedFetcher::new(transport.clone()));

        assert!(cache.fetch_artifact("medium", &options()).await.is_err());
        assert!(cache.in_flight.lock().unwrap().contains_key("medium"));

        transport.serve(format!("{BASE}m.onnx"), vec![2u8; 20]);
        cache.fetch_artifact("medium", &options()).await.unwrap();
        assert!(cache.in_flight.lock().unwrap().is_empty());
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn test_without_store_every_fetch_hits_network() {
        let transport = serving_transport();
        let cache = AssetCache::new(catalog(), ChunkedFetcher::new(transport.clone()), None);

        cache.fetch_artifact("small", &options()).await.unwrap();
        cache.fetch_artifact("small", &options()).await.unwrap();

        assert_eq!(transport.request_count(), 2);
        assert!(!cache.is_persistent());
        assert!(cache.cached_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broken_store_is_not_fatal() {
        let transport = serving_transport();
        let cache = AssetCache::new(
            catalog(),
            ChunkedFetcher::new(transport.clone()),
            Some(Arc::new(BrokenStore)),
        );

        let artifact = cache.fetch_artifact("small", &options()).await.unwrap();
        assert_eq!(artifact.len(), 10);
    }

    #[tokio::test]
    async fn test_unknown_key_is_rejected() {
        let cache = AssetCache::in_memory(catalog(), ChunkedFetcher::new(serving_transport()));
        let result = cache.fetch_artifact("large", &options()).await;
        assert!(matches!(result, Err(BgRemovalError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_fs_store_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let transport = serving_transport();

        let cache = AssetCache::open(
            catalog(),
            ChunkedFetcher::new(transport.clone()),
            Some(temp_dir.path().to_path_buf()),
        )
        .await;
        assert!(cache.is_persistent());
        cache.fetch_artifact("medium", &options()).await.unwrap();

        let reopened = AssetCache::open(
            catalog(),
            ChunkedFetcher::new(transport.clone()),
            Some(temp_dir.path().to_path_buf()),
        )
        .await;
        let artifact = reopened.fetch_artifact("medium", &options()).await.unwrap();

        assert_eq!(artifact.len(), 20);
        assert_eq!(
            artifact.last_modified.as_deref(),
            Some("Tue, 01 Oct 2024 10:00:00 GMT")
        );
        assert_eq!(transport.request_count(), 1);
        assert_eq!(reopened.cached_keys().await.unwrap(), vec!["medium".to_string()]);
    }

    #[tokio::test]
    async fn test_fs_store_discards_wrong_sized_entry() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsArtifactStore::open(temp_dir.path()).await.unwrap();
        store
            .put(&CachedArtifact {
                key: "small".to_string(),
                bytes: vec![0u8; 3].into(),
                last_modified: None,
            })
            .await
            .unwrap();

        let transport = serving_transport();
        let cache = AssetCache::new(
            catalog(),
            ChunkedFetcher::new(transport.clone()),
            Some(Arc::new(store.clone())),
        );

        let artifact = cache.fetch_artifact("small", &options()).await.unwrap();
        assert_eq!(artifact.len(), 10);
        assert_eq!(transport.request_count(), 1);
        assert_eq!(store.metadata("small").await.unwrap().unwrap().size, 10);
    }

    #[tokio::test]
    async fn test_fs_store_is_write_once() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsArtifactStore::open(temp_dir.path()).await.unwrap();
        let artifact = |byte: u8| CachedArtifact {
            key: "ort-wasm.wasm".to_string(),
            bytes: vec![byte; 4].into(),
            last_modified: None,
        };

        store.put(&artifact(1)).await.unwrap();
        store.put(&artifact(2)).await.unwrap();

        let stored = store.get("ort-wasm.wasm").await.unwrap().unwrap();
        assert_eq!(&*stored.bytes, &[1u8; 4]);
        assert!(temp_dir.path().join("ort-wasm.wasm.bin").exists());
        assert!(temp_dir.path().join("ort-wasm.wasm.meta.json").exists());
    }

    #[tokio::test]
    async fn test_fs_store_sanitises_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsArtifactStore::open(temp_dir.path()).await.unwrap();
        store
            .put(&CachedArtifact {
                key: "../escape/key".to_string(),
                bytes: vec![0u8; 1].into(),
                last_modified: None,
            })
            .await
            .unwrap();

        assert!(temp_dir.path().join(".._escape_key.bin").exists());
        assert_eq!(store.keys().await.unwrap(), vec!["../escape/key".to_string()]);
    }

    #[tokio::test]
    async fn test_clear_and_remove() {
        let cache = AssetCache::in_memory(catalog(), ChunkedFetcher::new(serving_transport()));
        cache.fetch_artifact("small", &options()).await.unwrap();
        cache.fetch_artifact("medium", &options()).await.unwrap();

        assert!(cache.remove("small").await.unwrap());
        assert!(!cache.remove("small").await.unwrap());
        assert_eq!(cache.cached_entries().await.unwrap().len(), 1);

        let removed = cache.clear().await.unwrap();
        assert_eq!(removed, vec!["medium".to_string()]);
        assert!(cache.cached_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_all_reports_individual_failures() {
        let transport = Arc::new(MockTransport::new());
        transport.serve(format!("{BASE}s.onnx"), vec![1u8; 10]);
        let cache = AssetCache::in_memory(catalog(), ChunkedFetcher::new(transport));

        let results = cache.fetch_all(&options()).await;
        assert_eq!(results.len(), 2);
        let by_key: HashMap<_, _> = results.into_iter().collect();
        assert!(by_key["small"].is_ok());
        assert!(matches!(by_key["medium"], Err(BgRemovalError::Network(_))));
    }

    #[tokio::test]
    async fn test_preload_all_returns_catalog_and_warms_store() {
        let transport = serving_transport();
        let cache = Arc::new(AssetCache::in_memory(
            catalog(),
            ChunkedFetcher::new(transport.clone()),
        ));

        let entries = cache.preload_all(&options());
        assert_eq!(entries.len(), 2);

        for _ in 0..100 {
            if cache.is_cached("small").await && cache.is_cached("medium").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cache.is_cached("small").await);
        assert!(cache.is_cached("medium").await);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(88_188_479), "84.1 MB");
    }
}
