//! Inference pipeline
//!
//! Turns an RGBA image into the same image with a predicted alpha channel:
//! stretch to the working square, encode, run the session, composite the
//! mask, and scale back to a size with the original aspect ratio.

use crate::error::{BgRemovalError, Result};
use crate::inference::{InferenceRuntime, Tensor, INPUT_NAME, OUTPUT_NAME};
use crate::services::progress::{ProgressCallback, INFERENCE_LABEL};
use crate::utils::{output_size, resize_premultiplied, ImagePreprocessor, NormalizationParams};
use image::RgbaImage;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, span, Level};

// Use instant crate for cross-platform time compatibility
use instant::Instant;

/// Side length of the square the model was trained at
pub const WORKING_RESOLUTION: u32 = 1024;

/// Timing breakdown of one pipeline run
#[derive(Debug, Clone, Default)]
pub struct PipelineTimings {
    pub preprocessing_ms: u64,
    pub inference_ms: u64,
    pub postprocessing_ms: u64,
}

impl PipelineTimings {
    #[must_use]
    pub fn total_ms(&self) -> u64 {
        self.preprocessing_ms + self.inference_ms + self.postprocessing_ms
    }
}

/// Per-call collaborators of [`InferencePipeline::infer`]
#[derive(Clone, Default)]
pub struct InferenceOptions {
    pub progress: Option<ProgressCallback>,
    /// Checked between pipeline stages
    pub cancel: Option<CancellationToken>,
}

impl std::fmt::Debug for InferenceOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceOptions")
            .field("progress", &self.progress.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}

impl InferenceOptions {
    fn report(&self, current: u64) {
        if let Some(progress) = &self.progress {
            progress.report(INFERENCE_LABEL, current, 1);
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(BgRemovalError::Cancelled),
            _ => Ok(()),
        }
    }
}

/// Runs images through a runtime session
pub struct InferencePipeline<R: InferenceRuntime> {
    runtime: Arc<R>,
    working_resolution: u32,
    normalization: NormalizationParams,
}

impl<R: InferenceRuntime> std::fmt::Debug for InferencePipeline<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferencePipeline")
            .field("runtime", &self.runtime.name())
            .field("working_resolution", &self.working_resolution)
            .field("normalization", &self.normalization)
            .finish()
    }
}

impl<R: InferenceRuntime> InferencePipeline<R> {
    #[must_use]
    pub fn new(runtime: Arc<R>) -> Self {
        Self {
            runtime,
            working_resolution: WORKING_RESOLUTION,
            normalization: NormalizationParams::default(),
        }
    }

    /// Override the working square, for models trained at another size
    #[must_use]
    pub fn with_working_resolution(mut self, resolution: u32) -> Self {
        self.working_resolution = resolution.max(1);
        self
    }

    #[must_use]
    pub fn working_resolution(&self) -> u32 {
        self.working_resolution
    }

    /// Remove the background of `image`
    ///
    /// Without a session the input is returned unchanged. Output dimensions
    /// follow [`output_size`]: images within the working square keep their
    /// size, larger ones are scaled down proportionally.
    ///
    /// # Errors
    /// - `Processing` for images with a zero dimension
    /// - `Inference` when the runtime fails or lacks the output tensor
    /// - `Shape` when the mask does not cover the working square
    /// - `Cancelled` when the token fires between stages
    pub async fn infer(
        &self,
        image: &RgbaImage,
        session: Option<&R::Session>,
        options: &InferenceOptions,
    ) -> Result<RgbaImage> {
        self.infer_with_timings(image, session, options)
            .await
            .map(|(output, _)| output)
    }

    /// [`Self::infer`] plus a timing breakdown
    ///
    /// # Errors
    /// - See [`Self::infer`]
    #[instrument(
        skip(self, image, session, options),
        fields(
            runtime = self.runtime.name(),
            dimensions = %format!("{}x{}", image.width(), image.height())
        )
    )]
    pub async fn infer_with_timings(
        &self,
        image: &RgbaImage,
        session: Option<&R::Session>,
        options: &InferenceOptions,
    ) -> Result<(RgbaImage, PipelineTimings)> {
        let mut timings = PipelineTimings::default();
        options.check_cancelled()?;
        options.report(0);

        let Some(session) = session else {
            log::debug!("No inference session available; returning input unchanged");
            options.report(1);
            return Ok((image.clone(), timings));
        };

        let (original_width, original_height) = image.dimensions();
        if original_width == 0 || original_height == 0 {
            return Err(BgRemovalError::processing_stage_error(
                "preprocessing",
                "image has a zero dimension",
                Some(&format!("{}x{}", original_width, original_height)),
            ));
        }
        let working = self.working_resolution;

        let (working_image, input) = {
            let _span = span!(Level::DEBUG, "preprocessing", working = working).entered();
            let start = Instant::now();
            let working_image = resize_premultiplied(image, working, working);
            let tensor = ImagePreprocessor::encode(&working_image, &self.normalization)?;
            timings.preprocessing_ms = start.elapsed().as_millis() as u64;
            (working_image, tensor.into_dyn())
        };
        options.check_cancelled()?;

        let start = Instant::now();
        let mask = self.run_model(session, input).await?;
        timings.inference_ms = start.elapsed().as_millis() as u64;
        options.check_cancelled()?;

        let output = {
            let _span = span!(
                Level::DEBUG,
                "postprocessing",
                original_width = original_width,
                original_height = original_height
            )
            .entered();
            let start = Instant::now();
            let masked = ImagePreprocessor::apply_mask(&working_image, &mask)?;
            let (target_width, target_height) =
                output_size(original_width, original_height, working);
            let output = resize_premultiplied(&masked, target_width, target_height);
            timings.postprocessing_ms = start.elapsed().as_millis() as u64;
            output
        };

        options.report(1);
        log::debug!(
            "Inference pipeline finished in {}ms (pre {}ms, model {}ms, post {}ms)",
            timings.total_ms(),
            timings.preprocessing_ms,
            timings.inference_ms,
            timings.postprocessing_ms
        );
        Ok((output, timings))
    }

    /// Run the model and flatten its mask plane
    async fn run_model(&self, session: &R::Session, input: Tensor) -> Result<Vec<f32>> {
        let outputs = self
            .runtime
            .run_session(session, &[(INPUT_NAME.to_string(), input)], &[OUTPUT_NAME])
            .await?;

        let (_, mask) = outputs
            .into_iter()
            .find(|(name, _)| name == OUTPUT_NAME)
            .ok_or_else(|| {
                BgRemovalError::inference(format!("Runtime returned no '{}' tensor", OUTPUT_NAME))
            })?;

        let expected = self.working_resolution as usize * self.working_resolution as usize;
        if mask.len() != expected {
            return Err(BgRemovalError::shape(format!(
                "Mask tensor {:?} has {} values, expected {}",
                mask.shape(),
                mask.len(),
                expected
            )));
        }
        Ok(mask.iter().copied().collect())
    }
}
