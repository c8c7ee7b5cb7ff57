//! Inference runtime abstraction
//!
//! A runtime is an opaque capability with exactly two operations: turn model
//! bytes into a session, and push named tensors through a session. Concrete
//! runtimes live in [`crate::backends`].

use crate::error::Result;
use crate::utils::{BackendProfile, RuntimeCapabilities};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Dynamically shaped float32 tensor exchanged with runtimes
pub type Tensor = ndarray::ArrayD<f32>;

/// Name of the model's image input
pub const INPUT_NAME: &str = "input";

/// Name of the model's alpha mask output
pub const OUTPUT_NAME: &str = "output";

/// Graph optimisation requested from the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GraphOptimization {
    Disabled,
    Basic,
    #[default]
    All,
}

/// Operator scheduling mode requested from the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExecutionMode {
    Sequential,
    #[default]
    Parallel,
}

/// Everything a runtime needs besides the model bytes
#[derive(Debug, Clone)]
pub struct RuntimeEnvironment {
    pub capabilities: RuntimeCapabilities,
    /// Backend binary matching the capabilities
    pub preferred_profile: BackendProfile,
    /// Staged backend binaries keyed by catalog key
    ///
    /// Paths are only valid while the session is being constructed.
    pub backend_paths: BTreeMap<String, PathBuf>,
    pub debug: bool,
    /// Ask the runtime to proxy execution to a worker thread
    pub proxy: bool,
    pub graph_optimization: GraphOptimization,
    pub execution_mode: ExecutionMode,
}

impl RuntimeEnvironment {
    /// Environment for the given capabilities with no staged binaries
    #[must_use]
    pub fn new(capabilities: RuntimeCapabilities, debug: bool) -> Self {
        Self {
            capabilities,
            preferred_profile: capabilities.preferred_profile(),
            backend_paths: BTreeMap::new(),
            debug,
            proxy: capabilities.proxy_to_worker,
            graph_optimization: GraphOptimization::default(),
            execution_mode: ExecutionMode::default(),
        }
    }

    /// Worker threads the runtime may use
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.capabilities.num_threads
    }

    /// Staged path of the preferred backend binary, if any
    #[must_use]
    pub fn preferred_backend_path(&self) -> Option<&PathBuf> {
        self.backend_paths.get(self.preferred_profile.asset_key())
    }
}

/// Opaque tensor execution runtime
#[async_trait]
pub trait InferenceRuntime: Send + Sync + 'static {
    /// Loaded model bound to one runtime configuration
    type Session: Send + Sync + 'static;

    /// Human-readable runtime name for logs
    fn name(&self) -> &'static str;

    /// Build a session from serialized model bytes
    ///
    /// # Errors
    /// - The runtime rejects the model or the environment
    async fn create_session(
        &self,
        model: &[u8],
        environment: &RuntimeEnvironment,
    ) -> Result<Self::Session>;

    /// Run named inputs through `session`, returning the requested outputs
    /// in the order they were asked for
    ///
    /// # Errors
    /// - Runtime execution failures
    /// - A requested output does not exist
    async fn run_session(
        &self,
        session: &Self::Session,
        inputs: &[(String, Tensor)],
        outputs: &[&str],
    ) -> Result<Vec<(String, Tensor)>>;
}
