//! High-quality resampling with alpha premultiplication
//!
//! Colour is premultiplied by alpha before filtering so that fully
//! transparent pixels do not bleed their RGB values into visible neighbours.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgba, RgbaImage};

type PremultipliedImage = ImageBuffer<Rgba<f32>, Vec<f32>>;

/// Resize an RGBA image using Lanczos3 on premultiplied colour
///
/// Returns a copy when the size is unchanged.
#[must_use]
pub fn resize_premultiplied(image: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    if width == 0 || height == 0 {
        return RgbaImage::new(width, height);
    }

    let premultiplied = premultiply(image);
    let resized = imageops::resize(&premultiplied, width, height, FilterType::Lanczos3);
    unpremultiply(&resized)
}

fn premultiply(image: &RgbaImage) -> PremultipliedImage {
    let (width, height) = image.dimensions();
    PremultipliedImage::from_fn(width, height, |x, y| {
        let [r, g, b, a] = image.get_pixel(x, y).0;
        let alpha = f32::from(a) / 255.0;
        Rgba([
            f32::from(r) / 255.0 * alpha,
            f32::from(g) / 255.0 * alpha,
            f32::from(b) / 255.0 * alpha,
            alpha,
        ])
    })
}

fn unpremultiply(image: &PremultipliedImage) -> RgbaImage {
    let (width, height) = image.dimensions();
    RgbaImage::from_fn(width, height, |x, y| {
        let [r, g, b, a] = image.get_pixel(x, y).0;
        // Lanczos lobes overshoot at hard edges
        let alpha = a.clamp(0.0, 1.0);
        if alpha <= f32::EPSILON {
            return Rgba([0, 0, 0, 0]);
        }
        Rgba([
            to_byte(r / alpha),
            to_byte(g / alpha),
            to_byte(b / alpha),
            to_byte(alpha),
        ])
    })
}

fn to_byte(value: f32) -> u8 {
    (value * 255.0).round().clamp(0.0, 255.0) as u8
}
