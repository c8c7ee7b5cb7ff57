//! Tensor codec between RGBA images and planar float tensors
//!
//! The model consumes a `(1, 3, H, W)` float32 tensor in channel-major
//! order: the full R plane, then G, then B. Alpha is discarded on the way in
//! and replaced by the predicted mask on the way out.

use crate::error::{BgRemovalError, Result};
use image::RgbaImage;
use ndarray::Array4;

/// Per-channel normalization applied as `(byte - mean) / std`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizationParams {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for NormalizationParams {
    fn default() -> Self {
        Self {
            mean: [128.0, 128.0, 128.0],
            std: [256.0, 256.0, 256.0],
        }
    }
}

/// Image to tensor conversion and mask compositing
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// Encode an RGBA image into a planar `(1, 3, H, W)` tensor
    ///
    /// Element `c * H * W + y * W + x` of the flat buffer holds channel `c`
    /// of pixel `(x, y)`.
    ///
    /// # Errors
    /// - Image dimensions do not fit the tensor shape
    pub fn encode(image: &RgbaImage, params: &NormalizationParams) -> Result<Array4<f32>> {
        let (width, height) = image.dimensions();
        let (width, height) = (width as usize, height as usize);
        let stride = width * height;

        let mut data = vec![0.0f32; 3 * stride];
        let (r_plane, rest) = data.split_at_mut(stride);
        let (g_plane, b_plane) = rest.split_at_mut(stride);

        for (idx, pixel) in image.pixels().enumerate() {
            let [r, g, b, _] = pixel.0;
            if let (Some(r_out), Some(g_out), Some(b_out)) =
                (r_plane.get_mut(idx), g_plane.get_mut(idx), b_plane.get_mut(idx))
            {
                *r_out = (f32::from(r) - params.mean[0]) / params.std[0];
                *g_out = (f32::from(g) - params.mean[1]) / params.std[1];
                *b_out = (f32::from(b) - params.mean[2]) / params.std[2];
            }
        }

        Array4::from_shape_vec((1, 3, height, width), data).map_err(|e| {
            BgRemovalError::shape(format!(
                "Cannot shape {}x{} image into tensor: {}",
                width, height, e
            ))
        })
    }

    /// Encode with the default mean 128 / std 256 normalization
    ///
    /// # Errors
    /// - Image dimensions do not fit the tensor shape
    pub fn encode_default(image: &RgbaImage) -> Result<Array4<f32>> {
        Self::encode(image, &NormalizationParams::default())
    }

    /// Return a copy of `image` whose alpha channel is `round(mask * 255)`
    ///
    /// RGB bytes are left untouched. Mask values outside `[0, 1]` saturate.
    ///
    /// # Errors
    /// - Mask length differs from `width * height`
    pub fn apply_mask(image: &RgbaImage, mask: &[f32]) -> Result<RgbaImage> {
        let (width, height) = image.dimensions();
        let expected = width as usize * height as usize;
        if mask.len() != expected {
            return Err(BgRemovalError::shape(format!(
                "Mask has {} values but image {}x{} needs {}",
                mask.len(),
                width,
                height,
                expected
            )));
        }

        let mut output = image.clone();
        for (pixel, &alpha) in output.pixels_mut().zip(mask) {
            pixel.0[3] = mask_to_alpha(alpha);
        }
        Ok(output)
    }
}

/// Saturating float to byte conversion; NaN maps to transparent
fn mask_to_alpha(value: f32) -> u8 {
    (value * 255.0).round().clamp(0.0, 255.0) as u8
}
