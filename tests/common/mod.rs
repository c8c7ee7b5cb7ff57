//! Shared doubles for integration tests
//!
//! Integration tests link against the library without `cfg(test)`, so they
//! carry their own transport and runtime doubles built on the public traits.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::StreamExt;
use imgly_bgremove_web::{
    catalog::{AssetCatalog, AssetEntry, BACKEND_MIME, MODEL_MIME},
    error::{BgRemovalError, Result},
    inference::{InferenceRuntime, RuntimeEnvironment, Tensor, INPUT_NAME},
    AssetCache, BackendProfile, ChunkedFetcher, FetchRequest, FetchResponse, HostInfo,
    RemovalConfig, SessionBuilder, Transport,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PUBLIC_PATH: &str = "https://cdn.example.com/bgremove/dist/";

/// Six-entry catalog with small sizes
pub fn catalog() -> AssetCatalog {
    let mut entries = vec![
        AssetEntry::new("small", "models/aaa.onnx", 64, MODEL_MIME),
        AssetEntry::new("medium", "models/bbb.onnx", 128, MODEL_MIME),
    ];
    for profile in BackendProfile::ALL {
        entries.push(AssetEntry::new(
            profile.asset_key(),
            format!("wasm/{}", profile.asset_key()),
            24,
            BACKEND_MIME,
        ));
    }
    AssetCatalog::with_entries(entries)
}

pub fn config() -> RemovalConfig {
    RemovalConfig::builder()
        .public_path(PUBLIC_PATH)
        .build()
        .unwrap()
}

pub fn url_of(entry: &AssetEntry) -> String {
    format!("{}{}", PUBLIC_PATH, entry.file_name())
}

/// In-memory web server double
#[derive(Default)]
pub struct FakeCdn {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    hits: Mutex<Vec<FetchRequest>>,
    chunk: usize,
    delay: Option<Duration>,
}

impl FakeCdn {
    pub fn new(chunk: usize) -> Self {
        Self {
            chunk: chunk.max(1),
            ..Self::default()
        }
    }

    /// Serve every catalog entry with its exact size
    pub fn serving(catalog: &AssetCatalog, chunk: usize) -> Self {
        let cdn = Self::new(chunk);
        for (idx, entry) in catalog.entries().enumerate() {
            cdn.put(&url_of(entry), vec![idx as u8; entry.size as usize]);
        }
        cdn
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn put(&self, url: &str, body: Vec<u8>) {
        self.bodies.lock().unwrap().insert(url.to_string(), body);
    }

    pub fn hits(&self) -> usize {
        self.hits.lock().unwrap().len()
    }

    pub fn hits_for(&self, url: &str) -> usize {
        self.hits
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.as_str() == url)
            .count()
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.hits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeCdn {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let url = request.url.to_string();
        self.hits.lock().unwrap().push(request);
        let body = self
            .bodies
            .lock()
            .unwrap()
            .get(&url)
            .cloned()
            .ok_or_else(|| BgRemovalError::network_error(format!("GET {}", url), "404 Not Found"))?;

        let chunks: Vec<Vec<u8>> = body.chunks(self.chunk).map(<[u8]>::to_vec).collect();
        let delay = self.delay;
        Ok(FetchResponse {
            last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string()),
            content_length: Some(body.len() as u64),
            body: futures_util::stream::iter(chunks)
                .then(move |chunk| async move {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    Ok::<_, BgRemovalError>(chunk)
                })
                .boxed(),
        })
    }
}

/// Runtime double producing a left-half-opaque mask
#[derive(Default)]
pub struct HalfMaskRuntime {
    pub created: AtomicUsize,
    pub runs: AtomicUsize,
    pub delay: Option<Duration>,
}

impl HalfMaskRuntime {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceRuntime for HalfMaskRuntime {
    type Session = usize;

    fn name(&self) -> &'static str {
        "half-mask"
    }

    async fn create_session(&self, model: &[u8], _environment: &RuntimeEnvironment) -> Result<usize> {
        self.created.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(model.len())
    }

    async fn run_session(
        &self,
        _session: &usize,
        inputs: &[(String, Tensor)],
        outputs: &[&str],
    ) -> Result<Vec<(String, Tensor)>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let (_, input) = inputs
            .iter()
            .find(|(name, _)| name == INPUT_NAME)
            .ok_or_else(|| BgRemovalError::inference("missing input"))?;
        let (height, width) = (input.shape()[2], input.shape()[3]);
        let mask = Tensor::from_shape_fn(vec![1, 1, height, width], |idx| {
            if idx[3] < width / 2 {
                1.0
            } else {
                0.0
            }
        });
        Ok(outputs.iter().map(|n| ((*n).to_string(), mask.clone())).collect())
    }
}

/// Session builder over an in-memory cache fed by `cdn`
pub fn session_builder<R: InferenceRuntime>(
    runtime: Arc<R>,
    cdn: Arc<FakeCdn>,
) -> Arc<SessionBuilder<R>> {
    let cache = Arc::new(AssetCache::in_memory(
        Arc::new(catalog()),
        ChunkedFetcher::new(cdn),
    ));
    Arc::new(SessionBuilder::with_host(
        runtime,
        cache,
        HostInfo {
            hardware_concurrency: 8,
            cross_origin_isolated: true,
        },
    ))
}
