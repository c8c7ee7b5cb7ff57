//! Tract runtime
//!
//! Pure Rust implementation of the inference runtime capability. Tract has
//! no notion of backend binaries or worker proxies, so those parts of the
//! runtime environment are only logged.

use crate::error::{BgRemovalError, Result};
use crate::inference::{InferenceRuntime, RuntimeEnvironment};
use async_trait::async_trait;
use tract_onnx::prelude::*;

/// Type alias for the complex Tract model type to reduce complexity warnings
type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

type ArrayTensor = crate::inference::Tensor;

// Use instant crate for cross-platform time compatibility
use instant::Instant;

/// Loaded tract plan plus its I/O names
#[derive(Debug)]
pub struct TractSession {
    model: TractModel,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl TractSession {
    #[must_use]
    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    #[must_use]
    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// Position of a named input, falling back to the only input
    fn input_slot(&self, name: &str) -> Option<usize> {
        self.input_names
            .iter()
            .position(|n| n == name)
            .or_else(|| (self.input_names.len() == 1).then_some(0))
    }

    fn output_slot(&self, name: &str) -> Option<usize> {
        self.output_names
            .iter()
            .position(|n| n == name)
            .or_else(|| (self.output_names.len() == 1).then_some(0))
    }
}

/// Runtime backed by tract-onnx
#[derive(Debug, Default, Clone, Copy)]
pub struct TractRuntime;

impl TractRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn load(model: &[u8]) -> TractResult<TractModel> {
        onnx()
            .model_for_read(&mut std::io::Cursor::new(model))?
            .into_optimized()?
            .into_runnable()
    }

    fn outlet_names(model: &TractModel, outlets: &[OutletId]) -> Vec<String> {
        let graph = model.model();
        outlets
            .iter()
            .map(|outlet| {
                graph
                    .outlet_label(*outlet)
                    .map_or_else(|| graph.node(outlet.node).name.clone(), str::to_string)
            })
            .collect()
    }
}

#[async_trait]
impl InferenceRuntime for TractRuntime {
    type Session = TractSession;

    fn name(&self) -> &'static str {
        "tract"
    }

    async fn create_session(
        &self,
        model: &[u8],
        environment: &RuntimeEnvironment,
    ) -> Result<TractSession> {
        let start = Instant::now();
        log::debug!(
            "Creating tract session from {} bytes (preferred backend {:?}, {} staged binaries)",
            model.len(),
            environment.preferred_profile,
            environment.backend_paths.len()
        );
        if environment.proxy {
            log::debug!("Worker proxying is not supported by tract; running inline");
        }

        let plan = Self::load(model).map_err(BgRemovalError::session_construction)?;

        let graph = plan.model();
        let inputs = graph
            .input_outlets()
            .map_err(BgRemovalError::session_construction)?
            .to_vec();
        let outputs = graph
            .output_outlets()
            .map_err(BgRemovalError::session_construction)?
            .to_vec();
        let input_names = Self::outlet_names(&plan, &inputs);
        let output_names = Self::outlet_names(&plan, &outputs);

        log::info!(
            "Tract session ready in {:.2}ms (inputs {:?}, outputs {:?})",
            start.elapsed().as_secs_f64() * 1000.0,
            input_names,
            output_names
        );

        Ok(TractSession {
            model: plan,
            input_names,
            output_names,
        })
    }

    async fn run_session(
        &self,
        session: &TractSession,
        inputs: &[(String, ArrayTensor)],
        outputs: &[&str],
    ) -> Result<Vec<(String, ArrayTensor)>> {
        let mut ordered: Vec<Option<TValue>> = vec![None; session.input_names.len()];
        for (name, tensor) in inputs {
            let slot = session.input_slot(name).ok_or_else(|| {
                BgRemovalError::inference(format!("Model has no input named '{}'", name))
            })?;
            if let Some(entry) = ordered.get_mut(slot) {
                *entry = Some(Tensor::from(tensor.clone()).into());
            }
        }
        let feeds: TVec<TValue> = ordered
            .into_iter()
            .enumerate()
            .map(|(idx, value)| {
                value.ok_or_else(|| {
                    BgRemovalError::inference(format!(
                        "Missing tensor for model input {}",
                        session.input_names.get(idx).map_or("?", String::as_str)
                    ))
                })
            })
            .collect::<Result<_>>()?;

        let start = Instant::now();
        let results = session
            .model
            .run(feeds)
            .map_err(|e| BgRemovalError::inference(format!("Tract inference failed: {e}")))?;
        log::debug!(
            "Tract inference completed in {:.2}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );

        outputs
            .iter()
            .map(|&name| {
                let value = session
                    .output_slot(name)
                    .and_then(|slot| results.get(slot))
                    .ok_or_else(|| {
                        BgRemovalError::inference(format!("Model has no output named '{}'", name))
                    })?;
                let array = value
                    .to_array_view::<f32>()
                    .map_err(|e| {
                        BgRemovalError::inference(format!("Failed to convert output tensor: {e}"))
                    })?
                    .to_owned();
                Ok((name.to_string(), array))
            })
            .collect()
    }
}
