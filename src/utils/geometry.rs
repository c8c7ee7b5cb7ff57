//! Proportional resize geometry

/// Largest size with the original aspect ratio that fits the `max` box
///
/// `ratio = min(max_width / width, max_height / height)`, each side floored.
/// The computation is done on integers so the bound side is hit exactly.
/// The box is a hard bound, so results can be larger than the original when
/// the original is smaller than the box. Callers clamp where needed.
///
/// Both original dimensions must be non-zero; zero-sized images are rejected
/// before they reach the pipeline.
///
/// # Examples
///
/// ```rust
/// use imgly_bgremove_web::utils::scale_to_fit;
///
/// assert_eq!(scale_to_fit(800, 600, 1024, 1024), (1024, 768));
/// assert_eq!(scale_to_fit(4000, 1000, 1024, 1024), (1024, 256));
/// ```
#[must_use]
pub fn scale_to_fit(
    original_width: u32,
    original_height: u32,
    max_width: u32,
    max_height: u32,
) -> (u32, u32) {
    debug_assert!(original_width > 0 && original_height > 0);

    let (ow, oh) = (u64::from(original_width), u64::from(original_height));
    let (mw, mh) = (u64::from(max_width), u64::from(max_height));

    // Exact rational arithmetic: floor(o * m / o') without float rounding
    let (new_width, new_height) = if mw * oh <= mh * ow {
        (mw, oh * mw / ow.max(1))
    } else {
        (ow * mh / oh.max(1), mh)
    };

    (
        u32::try_from(new_width).unwrap_or(max_width),
        u32::try_from(new_height).unwrap_or(max_height),
    )
}

/// Output size of the inference pipeline for an original image
///
/// Fits the original into the working square and never exceeds the original
/// resolution. An original that already matches the working square maps back
/// to itself. Extreme aspect ratios keep at least one pixel per side.
#[must_use]
pub fn output_size(original_width: u32, original_height: u32, working: u32) -> (u32, u32) {
    if original_width == working && original_height == working {
        return (original_width, original_height);
    }
    let (width, height) = scale_to_fit(original_width, original_height, working, working);
    (
        width.min(original_width).max(1),
        height.min(original_height).max(1),
    )
}
