//! ONNX Runtime implementation of the inference runtime capability

use crate::error::{BgRemovalError, Result};
use crate::inference::{ExecutionMode, GraphOptimization, InferenceRuntime, RuntimeEnvironment, Tensor};
use async_trait::async_trait;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use std::sync::Mutex;

// Use instant crate for cross-platform time compatibility
use instant::Instant;

/// ONNX Runtime session; runs need exclusive access
#[derive(Debug)]
pub struct OnnxSession {
    session: Mutex<Session>,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl OnnxSession {
    #[must_use]
    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    #[must_use]
    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }
}

/// Runtime backed by ONNX Runtime on the CPU execution provider
#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxRuntime;

impl OnnxRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn optimization_level(level: GraphOptimization) -> GraphOptimizationLevel {
        match level {
            GraphOptimization::Disabled => GraphOptimizationLevel::Disable,
            GraphOptimization::Basic => GraphOptimizationLevel::Level1,
            GraphOptimization::All => GraphOptimizationLevel::Level3,
        }
    }
}

#[async_trait]
impl InferenceRuntime for OnnxRuntime {
    type Session = OnnxSession;

    fn name(&self) -> &'static str {
        "onnx"
    }

    async fn create_session(
        &self,
        model: &[u8],
        environment: &RuntimeEnvironment,
    ) -> Result<OnnxSession> {
        let start = Instant::now();
        let intra_threads = environment.num_threads();
        let parallel = environment.execution_mode == ExecutionMode::Parallel;

        log::debug!("Creating ONNX Runtime session:");
        log::debug!("  - Model size: {} bytes", model.len());
        log::debug!("  - Intra-op threads: {intra_threads}");
        log::debug!("  - Parallel execution: {parallel}");
        log::debug!("  - Optimization: {:?}", environment.graph_optimization);
        log::debug!("  - Preferred backend: {:?}", environment.preferred_profile);

        let session = Session::builder()
            .map_err(BgRemovalError::session_construction)?
            .with_optimization_level(Self::optimization_level(environment.graph_optimization))
            .map_err(BgRemovalError::session_construction)?
            .with_parallel_execution(parallel)
            .map_err(BgRemovalError::session_construction)?
            .with_intra_threads(intra_threads)
            .map_err(BgRemovalError::session_construction)?
            .commit_from_memory(model)
            .map_err(BgRemovalError::session_construction)?;

        let input_names = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_names = session.outputs.iter().map(|o| o.name.clone()).collect();

        log::info!(
            "ONNX Runtime session ready in {:.0}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(OnnxSession {
            session: Mutex::new(session),
            input_names,
            output_names,
        })
    }

    async fn run_session(
        &self,
        session: &OnnxSession,
        inputs: &[(String, Tensor)],
        outputs: &[&str],
    ) -> Result<Vec<(String, Tensor)>> {
        let mut feeds = Vec::with_capacity(inputs.len());
        for (name, tensor) in inputs {
            let value = Value::from_array(tensor.clone()).map_err(|e| {
                BgRemovalError::inference(format!("Failed to convert input tensor '{name}': {e}"))
            })?;
            feeds.push((name.clone(), value));
        }

        let mut guard = session
            .session
            .lock()
            .map_err(|_| BgRemovalError::internal("ONNX session lock poisoned"))?;

        let start = Instant::now();
        let results = guard
            .run(feeds)
            .map_err(|e| BgRemovalError::inference(format!("ONNX inference failed: {e}")))?;
        log::debug!(
            "ONNX inference completed in {:.2}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );

        outputs
            .iter()
            .map(|&name| {
                let value = results.get(name).ok_or_else(|| {
                    BgRemovalError::inference(format!("Model has no output named '{name}'"))
                })?;
                let array = value
                    .try_extract_array::<f32>()
                    .map_err(|e| {
                        BgRemovalError::inference(format!("Failed to extract output tensor: {e}"))
                    })?
                    .to_owned();
                Ok((name.to_string(), array))
            })
            .collect()
    }
}
