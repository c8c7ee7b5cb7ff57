//! Host capability probing and runtime backend profiles

use serde::{Deserialize, Serialize};

/// Facts about the host the runtime will execute on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    /// Number of logical cores
    pub hardware_concurrency: usize,
    /// Whether shared-memory threading is permitted
    pub cross_origin_isolated: bool,
}

impl HostInfo {
    /// Inspect the current process
    ///
    /// Native processes have no cross-origin restriction on shared memory,
    /// so they always count as isolated.
    #[must_use]
    pub fn detect() -> Self {
        let hardware_concurrency = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        Self {
            hardware_concurrency,
            cross_origin_isolated: true,
        }
    }
}

/// Snapshot of what the runtime may use, computed once per session build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCapabilities {
    pub simd: bool,
    pub threads: bool,
    pub shared_memory: bool,
    pub proxy_to_worker: bool,
    /// Worker threads handed to the runtime
    pub num_threads: usize,
}

impl RuntimeCapabilities {
    /// Probe capabilities for `host`
    ///
    /// Threads are only used when the host is isolated, in which case half
    /// of the logical cores are requested (at least one).
    #[must_use]
    pub fn probe(host: HostInfo, proxy_to_worker: bool) -> Self {
        let num_threads = if host.cross_origin_isolated {
            (host.hardware_concurrency / 2).max(1)
        } else {
            1
        };

        Self {
            simd: simd_available(),
            threads: threads_available(),
            shared_memory: host.cross_origin_isolated,
            proxy_to_worker,
            num_threads,
        }
    }

    /// Backend binary best suited to these capabilities
    #[must_use]
    pub fn preferred_profile(&self) -> BackendProfile {
        let threaded = self.threads && self.shared_memory && self.num_threads > 1;
        match (self.simd, threaded) {
            (true, true) => BackendProfile::SimdThreaded,
            (true, false) => BackendProfile::Simd,
            (false, true) => BackendProfile::Threaded,
            (false, false) => BackendProfile::Baseline,
        }
    }
}

fn simd_available() -> bool {
    cfg!(any(
        target_feature = "sse2",
        target_feature = "neon",
        target_feature = "simd128"
    ))
}

fn threads_available() -> bool {
    cfg!(any(not(target_arch = "wasm32"), target_feature = "atomics"))
}

/// Runtime backend binaries, one per capability profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendProfile {
    SimdThreaded,
    Simd,
    Threaded,
    Baseline,
}

impl BackendProfile {
    /// Every profile, in preference order
    pub const ALL: [Self; 4] = [
        Self::SimdThreaded,
        Self::Simd,
        Self::Threaded,
        Self::Baseline,
    ];

    /// Catalog key of the backend binary
    #[must_use]
    pub fn asset_key(self) -> &'static str {
        match self {
            Self::SimdThreaded => "ort-wasm-simd-threaded.wasm",
            Self::Simd => "ort-wasm-simd.wasm",
            Self::Threaded => "ort-wasm-threaded.wasm",
            Self::Baseline => "ort-wasm.wasm",
        }
    }
}
