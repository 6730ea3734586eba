use super::types::ProbabilityMap;
use image::{Rgb, RgbImage};
use ndarray::Array2;

/// Turns a model probability map into a binary mask at frame resolution.
///
/// The map is resized first and thresholded second. Swapping the two steps
/// produces different edges, so callers must not reorder them.
pub struct MaskPostprocessor;

impl MaskPostprocessor {
    /// Resize `probabilities` to `width`x`height`, then mark every pixel whose
    /// resized probability is strictly above `threshold` as foreground.
    ///
    /// Returns a 3-channel mask where every pixel is either all-0 or all-255.
    pub fn postprocess(
        probabilities: &ProbabilityMap,
        width: u32,
        height: u32,
        threshold: f32,
    ) -> RgbImage {
        let _span = tracing::debug_span!("postprocess").entered();

        let resized = resize_bilinear(probabilities, width as usize, height as usize);
        RgbImage::from_fn(width, height, |x, y| {
            if resized[[y as usize, x as usize]] > threshold {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        })
    }
}

/// Bilinear resize with pixel-center alignment and edge clamping.
pub fn resize_bilinear(src: &Array2<f32>, dst_width: usize, dst_height: usize) -> Array2<f32> {
    let (src_height, src_width) = src.dim();
    if src_height == 0 || src_width == 0 {
        return Array2::zeros((dst_height, dst_width));
    }
    if (src_height, src_width) == (dst_height, dst_width) {
        return src.clone();
    }

    let xs = sample_positions(src_width, dst_width);
    let ys = sample_positions(src_height, dst_height);

    Array2::from_shape_fn((dst_height, dst_width), |(y, x)| {
        let (y0, y1, wy) = ys[y];
        let (x0, x1, wx) = xs[x];
        let top = src[[y0, x0]] * (1.0 - wx) + src[[y0, x1]] * wx;
        let bottom = src[[y1, x0]] * (1.0 - wx) + src[[y1, x1]] * wx;
        top * (1.0 - wy) + bottom * wy
    })
}

/// For each destination index, the two source neighbours and the weight of the second.
fn sample_positions(src_len: usize, dst_len: usize) -> Vec<(usize, usize, f32)> {
    let scale = src_len as f32 / dst_len as f32;
    let last = src_len - 1;

    (0..dst_len)
        .map(|d| {
            let f = (d as f32 + 0.5) * scale - 0.5;
            let base = f.floor();
            let weight = f - base;
            if base < 0.0 {
                (0, 0, 0.0)
            } else if base as usize >= last {
                (last, last, 0.0)
            } else {
                let i = base as usize;
                (i, i + 1, weight)
            }
        })
        .collect()
}
