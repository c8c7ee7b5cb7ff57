//! Catalog of downloadable artifacts
//!
//! The catalog is an immutable table built once and handed to the asset
//! cache. Each entry pins the exact byte size of its artifact so downloads
//! can be verified before they are stored.

use crate::error::{BgRemovalError, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// MIME type of model weights
pub const MODEL_MIME: &str = "application/octet-stream";

/// MIME type of runtime backend binaries
pub const BACKEND_MIME: &str = "application/wasm";

/// A single downloadable artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEntry {
    /// Logical key the artifact is cached under
    pub key: String,
    /// Absolute URL or path relative to the asset base
    pub locator: String,
    /// Exact size of the artifact in bytes
    pub size: u64,
    /// Declared MIME type
    pub mime: String,
}

impl AssetEntry {
    #[must_use]
    pub fn new<K, L, M>(key: K, locator: L, size: u64, mime: M) -> Self
    where
        K: Into<String>,
        L: Into<String>,
        M: Into<String>,
    {
        Self {
            key: key.into(),
            locator: locator.into(),
            size,
            mime: mime.into(),
        }
    }

    /// Final path segment of the locator
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.locator
            .rsplit('/')
            .next()
            .unwrap_or(self.locator.as_str())
    }

    /// Resolve the URL this artifact is downloaded from
    ///
    /// With a public path the locator's file name is joined onto it, so
    /// `models/abc.onnx` under `https://cdn.example.com/dist/` becomes
    /// `https://cdn.example.com/dist/abc.onnx`. Without one the locator is
    /// used as-is and must be absolute.
    ///
    /// # Errors
    /// - The joined URL is invalid
    /// - No public path is configured and the locator is relative
    pub fn resolve_url(&self, public_path: Option<&Url>) -> Result<Url> {
        match public_path {
            Some(base) => base.join(self.file_name()).map_err(|e| {
                BgRemovalError::invalid_config(format!(
                    "Cannot resolve '{}' against public path '{}': {}",
                    self.file_name(),
                    base,
                    e
                ))
            }),
            None => Url::parse(&self.locator).map_err(|_| {
                BgRemovalError::invalid_config(format!(
                    "Asset '{}' has relative locator '{}'; set a public path to resolve it",
                    self.key, self.locator
                ))
            }),
        }
    }
}

/// Immutable table of artifacts keyed by logical name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetCatalog {
    entries: BTreeMap<String, AssetEntry>,
}

impl AssetCatalog {
    /// Build a catalog from arbitrary entries
    ///
    /// Later entries replace earlier ones with the same key.
    #[must_use]
    pub fn with_entries<I: IntoIterator<Item = AssetEntry>>(entries: I) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.key.clone(), entry))
                .collect(),
        }
    }

    /// Look up an entry
    ///
    /// # Errors
    /// - The key is not part of the catalog
    pub fn get(&self, key: &str) -> Result<&AssetEntry> {
        self.entries.get(key).ok_or_else(|| {
            BgRemovalError::invalid_config(format!("Unknown asset key: {}", key))
        })
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Iterate entries in key order
    pub fn entries(&self) -> impl Iterator<Item = &AssetEntry> {
        self.entries.values()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all artifact sizes
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|entry| entry.size).sum()
    }
}

impl Default for AssetCatalog {
    /// The bundled model variants and runtime backends
    fn default() -> Self {
        Self::with_entries([
            AssetEntry::new(
                "small",
                "models/a620c8c752bdf5c69d98.onnx",
                44_342_436,
                MODEL_MIME,
            ),
            AssetEntry::new(
                "medium",
                "models/2ebb460f4adfe0ebf34d.onnx",
                88_188_479,
                MODEL_MIME,
            ),
            AssetEntry::new(
                "ort-wasm-simd-threaded.wasm",
                "wasm/ort-wasm-simd-threaded.wasm",
                10_281_838,
                BACKEND_MIME,
            ),
            AssetEntry::new(
                "ort-wasm-simd.wasm",
                "wasm/ort-wasm-simd.wasm",
                10_335_238,
                BACKEND_MIME,
            ),
            AssetEntry::new(
                "ort-wasm-threaded.wasm",
                "wasm/ort-wasm-threaded.wasm",
                9_413_659,
                BACKEND_MIME,
            ),
            AssetEntry::new(
                "ort-wasm.wasm",
                "wasm/ort-wasm.wasm",
                9_487_920,
                BACKEND_MIME,
            ),
        ])
    }
}
