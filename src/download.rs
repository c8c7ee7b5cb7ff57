//! Chunked artifact downloading
//!
//! This module streams artifacts over a pluggable [`Transport`], reports
//! progress after every chunk, honours cancellation between chunks and
//! verifies the final byte count against the catalog.

use crate::catalog::AssetEntry;
use crate::config::{FetchOverrides, RemovalConfig};
use crate::error::{BgRemovalError, Result};
use crate::services::progress::{effective_sink, fetch_label, ProgressCallback};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LAST_MODIFIED};
use reqwest::{Client, Url};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default `Cache-Control` request header
pub const DEFAULT_CACHE_CONTROL: &str = "public, max-age=48000, must-revalidate";

/// Stream of body chunks
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// Default request headers, keyed by lower-case name
///
/// The HTTP client does not decode content encodings, so `identity` keeps
/// byte counts comparable with catalog sizes.
#[must_use]
pub fn default_headers() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("cache-control".to_string(), DEFAULT_CACHE_CONTROL.to_string()),
        ("accept-encoding".to_string(), "identity".to_string()),
    ])
}

/// Default headers with caller overrides applied on top
///
/// Names compare case-insensitively; an override always wins.
#[must_use]
pub fn merge_headers(overrides: &FetchOverrides) -> BTreeMap<String, String> {
    let mut headers = default_headers();
    for (name, value) in &overrides.headers {
        headers.insert(name.to_ascii_lowercase(), value.clone());
    }
    headers
}

/// A single request handed to a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: Url,
    pub headers: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

/// A response whose body has not been consumed yet
pub struct FetchResponse {
    /// Server `Last-Modified` marker, when present
    pub last_modified: Option<String>,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("last_modified", &self.last_modified)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Network capability used by the fetcher
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start a request and return the streaming response
    ///
    /// # Errors
    /// - Connection failures or non-success statuses, as `Network` errors
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse>;
}

/// `reqwest`-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport with a fresh HTTP client
    ///
    /// # Errors
    /// - Failed to create HTTP client
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| BgRemovalError::network_error("Failed to create HTTP client", e))?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
        let mut map = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                BgRemovalError::invalid_config(format!("Invalid header name '{}': {}", name, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                BgRemovalError::invalid_config(format!("Invalid header value for '{}': {}", name, e))
            })?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let mut builder = self
            .client
            .get(request.url.clone())
            .headers(Self::header_map(&request.headers)?);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| {
            BgRemovalError::network_error(format!("Failed to download {}", request.url), e)
        })?;

        if !response.status().is_success() {
            return Err(BgRemovalError::network_error(
                format!("HTTP error for {}", request.url),
                response.status(),
            ));
        }

        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let content_length = response.content_length();
        let url = request.url;
        let body = response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map(|bytes| bytes.to_vec()).map_err(|e| {
                    BgRemovalError::network_error(format!("Failed to read body of {}", url), e)
                })
            })
            .boxed();

        Ok(FetchResponse {
            last_modified,
            content_length,
            body,
        })
    }
}

/// Per-call options shared by every artifact fetch
#[derive(Clone, Default)]
pub struct FetchOptions {
    /// Base URL that relative locators are rebased onto
    pub public_path: Option<Url>,
    pub overrides: FetchOverrides,
    pub progress: Option<ProgressCallback>,
    /// Checked between chunks
    pub cancel: Option<CancellationToken>,
}

impl std::fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOptions")
            .field("public_path", &self.public_path.as_ref().map(Url::as_str))
            .field("overrides", &self.overrides)
            .field("progress", &self.progress.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}

impl FetchOptions {
    /// Options derived from a removal configuration
    ///
    /// Debug configurations without a progress sink get a logging sink.
    #[must_use]
    pub fn from_config(config: &RemovalConfig) -> Self {
        Self {
            public_path: config.public_path.clone(),
            overrides: config.fetch_args.clone(),
            progress: effective_sink(config.progress.as_ref(), config.debug),
            cancel: None,
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

/// Resolves when `token` fires; never resolves without a token
pub(crate) async fn wait_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Fully downloaded artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArtifact {
    pub bytes: Vec<u8>,
    pub last_modified: Option<String>,
}

/// Streams artifacts through a transport
#[derive(Clone)]
pub struct ChunkedFetcher {
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for ChunkedFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedFetcher").finish_non_exhaustive()
    }
}

impl ChunkedFetcher {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Fetcher over the default HTTP transport
    ///
    /// # Errors
    /// - Failed to create HTTP client
    pub fn http() -> Result<Self> {
        Ok(Self::new(Arc::new(HttpTransport::new()?)))
    }

    #[must_use]
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Download a catalog entry and verify its size
    ///
    /// Progress is reported as `fetch:<key>` with the catalog size as total.
    ///
    /// # Errors
    /// - URL resolution failures
    /// - Transport errors
    /// - `Cancelled` when the token fires between chunks
    /// - `Integrity` when the byte count differs from the catalog size
    pub async fn fetch_entry(
        &self,
        entry: &AssetEntry,
        options: &FetchOptions,
    ) -> Result<FetchedArtifact> {
        let url = entry.resolve_url(options.public_path.as_ref())?;
        log::debug!("Fetching {} from {}", entry.key, url);

        let artifact = self
            .download(url, &fetch_label(&entry.key), Some(entry.size), options)
            .await?;

        let actual = artifact.bytes.len() as u64;
        if actual != entry.size {
            log::warn!(
                "Discarding {}: expected {} bytes, received {}",
                entry.key,
                entry.size,
                actual
            );
            return Err(BgRemovalError::integrity(&entry.key, entry.size, actual));
        }
        Ok(artifact)
    }

    /// Download an arbitrary URL without size verification
    ///
    /// # Errors
    /// - Transport errors
    /// - `Cancelled` when the token fires between chunks
    pub async fn fetch_url(&self, url: Url, options: &FetchOptions) -> Result<Vec<u8>> {
        let label = format!("fetch:{}", url);
        Ok(self.download(url, &label, None, options).await?.bytes)
    }

    async fn download(
        &self,
        url: Url,
        label: &str,
        expected: Option<u64>,
        options: &FetchOptions,
    ) -> Result<FetchedArtifact> {
        if options.is_cancelled() {
            return Err(BgRemovalError::Cancelled);
        }

        let request = FetchRequest {
            url,
            headers: merge_headers(&options.overrides),
            timeout: options.overrides.timeout,
        };
        let mut response = self.transport.fetch(request).await?;

        let total = expected.or(response.content_length).unwrap_or(0);
        let capacity = usize::try_from(total).unwrap_or(0);
        let mut bytes = Vec::with_capacity(capacity);

        loop {
            let next = match &options.cancel {
                Some(token) => tokio::select! {
                    biased;
                    () = token.cancelled() => return Err(BgRemovalError::Cancelled),
                    chunk = response.body.next() => chunk,
                },
                None => response.body.next().await,
            };

            let Some(chunk) = next else {
                break;
            };
            bytes.extend_from_slice(&chunk?);

            if let Some(sink) = &options.progress {
                sink.report(label, bytes.len() as u64, total);
            }
        }

        Ok(FetchedArtifact {
            bytes,
            last_modified: response.last_modified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::MockTransport;
    use crate::catalog::MODEL_MIME;
    use std::sync::Mutex;

    fn entry(size: u64) -> AssetEntry {
        AssetEntry::new("medium", "models/m.onnx", size, MODEL_MIME)
    }

    fn options() -> FetchOptions {
        FetchOptions {
            public_path: Some(Url::parse("https://cdn.example.com/dist/").unwrap()),
            ..FetchOptions::default()
        }
    }

    #[test]
    fn test_default_headers() {
        let headers = default_headers();
        assert_eq!(headers.get("cache-control").unwrap(), DEFAULT_CACHE_CONTROL);
        assert_eq!(headers.get("accept-encoding").unwrap(), "identity");
    }

    #[test]
    fn test_overrides_win_case_insensitively() {
        let overrides = FetchOverrides::default()
            .with_header("Cache-Control", "no-cache")
            .with_header("Authorization", "Bearer t");
        let merged = merge_headers(&overrides);
        assert_eq!(merged.get("cache-control").unwrap(), "no-cache");
        assert_eq!(merged.get("authorization").unwrap(), "Bearer t");
        assert_eq!(merged.get("accept-encoding").unwrap(), "identity");
        assert_eq!(merged.len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_entry_reports_monotonic_progress() {
        let transport = Arc::new(MockTransport::new().with_chunk_size(7));
        transport.serve("https://cdn.example.com/dist/m.onnx", vec![1u8; 50]);
        let fetcher = ChunkedFetcher::new(transport.clone());

        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&events);
        let opts = options().with_progress(Arc::new(move |label: &str, current: u64, total: u64| {
            captured.lock().unwrap().push((label.to_string(), current, total));
        }));

        let artifact = fetcher.fetch_entry(&entry(50), &opts).await.unwrap();
        assert_eq!(artifact.bytes.len(), 50);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 8);
        assert!(events.windows(2).all(|w| w[0].1 <= w[1].1));
        assert_eq!(events.last().unwrap(), &("fetch:medium".to_string(), 50, 50));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_entry_detects_truncation() {
        let transport = Arc::new(MockTransport::new());
        transport.serve("https://cdn.example.com/dist/m.onnx", vec![0u8; 40]);
        let fetcher = ChunkedFetcher::new(transport);

        let err = fetcher.fetch_entry(&entry(50), &options()).await.unwrap_err();
        match err {
            BgRemovalError::Integrity {
                key,
                expected,
                actual,
            } => {
                assert_eq!(key, "medium");
                assert_eq!(expected, 50);
                assert_eq!(actual, 40);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_entry_sends_merged_headers() {
        let transport = Arc::new(MockTransport::new());
        transport.serve("https://cdn.example.com/dist/m.onnx", vec![0u8; 4]);
        let fetcher = ChunkedFetcher::new(transport.clone());

        let mut opts = options();
        opts.overrides = FetchOverrides::default()
            .with_header("X-Api-Key", "k")
            .with_timeout(Duration::from_secs(3));
        fetcher.fetch_entry(&entry(4), &opts).await.unwrap();

        let request = transport.last_request().unwrap();
        assert_eq!(request.headers.get("x-api-key").unwrap(), "k");
        assert_eq!(request.headers.get("cache-control").unwrap(), DEFAULT_CACHE_CONTROL);
        assert_eq!(request.timeout, Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_pre_cancelled_fetch_never_hits_transport() {
        let transport = Arc::new(MockTransport::new());
        transport.serve("https://cdn.example.com/dist/m.onnx", vec![0u8; 4]);
        let fetcher = ChunkedFetcher::new(transport.clone());

        let token = CancellationToken::new();
        token.cancel();
        let result = fetcher
            .fetch_entry(&entry(4), &options().with_cancel(token))
            .await;

        assert!(matches!(result, Err(BgRemovalError::Cancelled)));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_between_chunks() {
        let transport = Arc::new(
            MockTransport::new()
                .with_chunk_size(1)
                .with_chunk_delay(Duration::from_millis(20)),
        );
        transport.serve("https://cdn.example.com/dist/m.onnx", vec![0u8; 100]);
        let fetcher = ChunkedFetcher::new(transport);

        let token = CancellationToken::new();
        let opts = options().with_cancel(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let result = fetcher.fetch_entry(&entry(100), &opts).await;
        canceller.await.unwrap();
        assert!(matches!(result, Err(BgRemovalError::Cancelled)));
    }

    #[tokio::test]
    async fn test_missing_resource_is_network_error() {
        let fetcher = ChunkedFetcher::new(Arc::new(MockTransport::new()));
        let result = fetcher.fetch_entry(&entry(4), &options()).await;
        assert!(matches!(result, Err(BgRemovalError::Network(_))));
    }

    #[test]
    fn test_http_transport_rejects_bad_header() {
        let headers = BTreeMap::from([("bad header".to_string(), "v".to_string())]);
        assert!(HttpTransport::header_map(&headers).is_err());
    }
}
