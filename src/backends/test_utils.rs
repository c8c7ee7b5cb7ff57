//! Test utilities: mock runtime and mock transport
//!
//! The mocks count every call so tests can assert how many sessions were
//! constructed and how many network requests were issued, without model
//! files or a network.

use crate::{
    catalog::{AssetCatalog, AssetEntry, BACKEND_MIME, MODEL_MIME},
    config::RemovalConfig,
    download::{FetchRequest, FetchResponse, Transport},
    error::{BgRemovalError, Result},
    inference::{InferenceRuntime, RuntimeEnvironment, Tensor},
    utils::BackendProfile,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use ndarray::ArrayD;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Public path every test fixture is served from
pub const TEST_PUBLIC_PATH: &str = "https://assets.example.com/dist/";

/// Catalog with tiny stand-ins for the model and backend binaries
#[must_use]
pub fn test_catalog() -> AssetCatalog {
    let mut entries = vec![
        AssetEntry::new("small", "models/small.onnx", 16, MODEL_MIME),
        AssetEntry::new("medium", "models/medium.onnx", 32, MODEL_MIME),
    ];
    entries.extend(BackendProfile::ALL.iter().map(|profile| {
        AssetEntry::new(
            profile.asset_key(),
            format!("wasm/{}", profile.asset_key()),
            8,
            BACKEND_MIME,
        )
    }));
    AssetCatalog::with_entries(entries)
}

/// Transport serving every entry of `catalog` under [`TEST_PUBLIC_PATH`]
#[must_use]
pub fn serving_transport(catalog: &AssetCatalog) -> MockTransport {
    let transport = MockTransport::new();
    for entry in catalog.entries() {
        let len = usize::try_from(entry.size).unwrap_or(0);
        transport.serve(
            format!("{}{}", TEST_PUBLIC_PATH, entry.file_name()),
            vec![0xAB; len],
        );
    }
    transport
}

/// Configuration pointing at [`TEST_PUBLIC_PATH`]
#[must_use]
pub fn test_config() -> RemovalConfig {
    RemovalConfig::builder()
        .public_path(TEST_PUBLIC_PATH)
        .build()
        .unwrap()
}

/// Shape of the mask produced by [`MockRuntime`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaskPattern {
    /// Every pixel gets the same value
    Constant(f32),
    /// Soft circular foreground in the middle of the frame
    Circle,
}

/// Session handed out by [`MockRuntime`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockSession {
    /// Sequence number of the construction that produced this session
    pub id: usize,
    pub model_len: usize,
    pub num_threads: usize,
}

/// Mock inference runtime for testing
#[derive(Debug)]
pub struct MockRuntime {
    create_calls: AtomicUsize,
    run_calls: AtomicUsize,
    /// Number of upcoming `create_session` calls that fail
    pending_create_failures: AtomicUsize,
    create_delay: Option<Duration>,
    pattern: MaskPattern,
    /// Call history for verification in tests
    call_history: Arc<Mutex<Vec<String>>>,
    last_environment: Mutex<Option<RuntimeEnvironment>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self {
            create_calls: AtomicUsize::new(0),
            run_calls: AtomicUsize::new(0),
            pending_create_failures: AtomicUsize::new(0),
            create_delay: None,
            pattern: MaskPattern::Constant(1.0),
            call_history: Arc::new(Mutex::new(Vec::new())),
            last_environment: Mutex::new(None),
        }
    }

    /// Sleep inside `create_session` to widen race windows
    #[must_use]
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn with_pattern(mut self, pattern: MaskPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Make the next `count` session constructions fail
    #[must_use]
    pub fn failing_creates(self, count: usize) -> Self {
        self.pending_create_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn create_count(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn run_count(&self) -> usize {
        self.run_calls.load(Ordering::SeqCst)
    }

    pub fn get_call_history(&self) -> Vec<String> {
        self.call_history.lock().unwrap().clone()
    }

    pub fn last_environment(&self) -> Option<RuntimeEnvironment> {
        self.last_environment.lock().unwrap().clone()
    }

    fn record_call(&self, method: &str) {
        if let Ok(mut history) = self.call_history.lock() {
            history.push(method.to_string());
        }
    }

    fn take_failure(&self) -> bool {
        self.pending_create_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Mask of shape `(1, 1, H, W)` matching the input's spatial size
    fn generate_mask(&self, input: &Tensor) -> Tensor {
        let shape = input.shape();
        let height = shape.get(2).copied().unwrap_or(1);
        let width = shape.get(3).copied().unwrap_or(1);

        match self.pattern {
            MaskPattern::Constant(value) => ArrayD::from_elem(vec![1, 1, height, width], value),
            MaskPattern::Circle => {
                let center_x = width as f32 / 2.0;
                let center_y = height as f32 / 2.0;
                let radius = (width.min(height) as f32 / 3.0).max(1.0);
                ArrayD::from_shape_fn(vec![1, 1, height, width], |idx| {
                    let dx = idx[3] as f32 - center_x;
                    let dy = idx[2] as f32 - center_y;
                    let distance = (dx * dx + dy * dy).sqrt();
                    ((radius - distance) / radius).clamp(0.0, 1.0)
                })
            },
        }
    }
}

#[async_trait]
impl InferenceRuntime for MockRuntime {
    type Session = MockSession;

    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_session(
        &self,
        model: &[u8],
        environment: &RuntimeEnvironment,
    ) -> Result<MockSession> {
        self.record_call("create_session");
        let id = self.create_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_environment.lock().unwrap() = Some(environment.clone());

        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if self.take_failure() {
            return Err(BgRemovalError::session_construction(
                "mock runtime configured to fail",
            ));
        }

        Ok(MockSession {
            id,
            model_len: model.len(),
            num_threads: environment.num_threads(),
        })
    }

    async fn run_session(
        &self,
        _session: &MockSession,
        inputs: &[(String, Tensor)],
        outputs: &[&str],
    ) -> Result<Vec<(String, Tensor)>> {
        self.record_call("run_session");
        self.run_calls.fetch_add(1, Ordering::SeqCst);

        let (_, input) = inputs
            .iter()
            .find(|(name, _)| name == crate::inference::INPUT_NAME)
            .ok_or_else(|| BgRemovalError::inference("mock runtime expects an 'input' tensor"))?;

        let mask = self.generate_mask(input);
        Ok(outputs
            .iter()
            .map(|name| ((*name).to_string(), mask.clone()))
            .collect())
    }
}

/// Mock transport serving in-memory bodies
#[derive(Debug, Default)]
pub struct MockTransport {
    resources: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<FetchRequest>>,
    chunk_size: Option<usize>,
    chunk_delay: Option<Duration>,
    last_modified: Option<String>,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Split bodies into chunks of this many bytes (default 4096)
    #[must_use]
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));
        self
    }

    /// Sleep before yielding each chunk
    #[must_use]
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn with_last_modified<S: Into<String>>(mut self, value: S) -> Self {
        self.last_modified = Some(value.into());
        self
    }

    /// Serve `body` at `url`, replacing any previous body
    pub fn serve<S: Into<String>>(&self, url: S, body: Vec<u8>) {
        self.resources.lock().unwrap().insert(url.into(), body);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request_count_for(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.as_str() == url)
            .count()
    }

    pub fn last_request(&self) -> Option<FetchRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let url = request.url.to_string();
        self.requests.lock().unwrap().push(request);

        let body = self
            .resources
            .lock()
            .unwrap()
            .get(&url)
            .cloned()
            .ok_or_else(|| {
                BgRemovalError::network_error(format!("HTTP error for {}", url), "404 Not Found")
            })?;

        let content_length = Some(body.len() as u64);
        let chunk_size = self.chunk_size.unwrap_or(4096);
        let chunks: Vec<Vec<u8>> = body.chunks(chunk_size).map(<[u8]>::to_vec).collect();
        let delay = self.chunk_delay;

        let stream = futures_util::stream::iter(chunks)
            .then(move |chunk| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, BgRemovalError>(chunk)
            })
            .boxed();

        Ok(FetchResponse {
            last_modified: self.last_modified.clone(),
            content_length,
            body: stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{HostInfo, RuntimeCapabilities};

    fn environment() -> RuntimeEnvironment {
        RuntimeEnvironment::new(
            RuntimeCapabilities::probe(
                HostInfo {
                    hardware_concurrency: 4,
                    cross_origin_isolated: true,
                },
                false,
            ),
            false,
        )
    }

    #[tokio::test]
    async fn test_mock_runtime_counts_and_fails_on_demand() {
        let runtime = MockRuntime::new().failing_creates(1);
        assert!(runtime.create_session(b"m", &environment()).await.is_err());
        let session = runtime.create_session(b"model", &environment()).await.unwrap();

        assert_eq!(runtime.create_count(), 2);
        assert_eq!(session.id, 1);
        assert_eq!(session.model_len, 5);
        assert_eq!(session.num_threads, 2);
        assert_eq!(
            runtime.get_call_history(),
            vec!["create_session", "create_session"]
        );
    }

    #[tokio::test]
    async fn test_mock_runtime_mask_matches_input() {
        let runtime = MockRuntime::new().with_pattern(MaskPattern::Circle);
        let session = runtime.create_session(b"m", &environment()).await.unwrap();
        let input = ArrayD::<f32>::zeros(vec![1, 3, 8, 6]);

        let outputs = runtime
            .run_session(&session, &[("input".to_string(), input)], &["output"])
            .await
            .unwrap();

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].0, "output");
        assert_eq!(outputs[0].1.shape(), &[1, 1, 8, 6]);
        assert!(outputs[0].1.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(runtime.run_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_transport_chunks_body() {
        let transport = MockTransport::new().with_chunk_size(3);
        transport.serve("https://example.com/a", vec![9u8; 10]);

        let request = FetchRequest {
            url: reqwest::Url::parse("https://example.com/a").unwrap(),
            headers: Default::default(),
            timeout: None,
        };
        let response = transport.fetch(request).await.unwrap();
        let chunks: Vec<_> = response.body.collect().await;

        assert_eq!(chunks.len(), 4);
        assert_eq!(transport.request_count_for("https://example.com/a"), 1);
    }
}
