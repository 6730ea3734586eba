use super::types::{Tensor, MODEL_HEIGHT, MODEL_WIDTH};
use crate::error::{PipelineError, PipelineResult};
use image::{imageops, RgbImage};

const MEAN: [f32; 3] = [0.5, 0.5, 0.5];
const STD: [f32; 3] = [0.5, 0.5, 0.5];

/// Color order of a three-channel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Bgr,
}

impl ChannelOrder {
    /// Index into an RGB pixel for output channel `c`.
    fn source_index(self, c: usize) -> usize {
        match self {
            ChannelOrder::Rgb => c,
            ChannelOrder::Bgr => 2 - c,
        }
    }
}

/// Preprocessor for converting captured RGB frames to model input tensors
pub struct Preprocessor {
    target_width: u32,
    target_height: u32,
    model_order: ChannelOrder,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(ChannelOrder::Rgb)
    }
}

impl Preprocessor {
    pub fn new(model_order: ChannelOrder) -> Self {
        Self {
            target_width: MODEL_WIDTH as u32,
            target_height: MODEL_HEIGHT as u32,
            model_order,
        }
    }

    /// Preprocess an RGB frame into a normalized NCHW tensor
    ///
    /// Steps:
    /// 1. Bilinear resize to the model resolution
    /// 2. Reorder channels into the model's color order
    /// 3. Scale to [0, 1], then normalize with `(v - 0.5) / 0.5`
    /// 4. Scatter from interleaved HWC into planar CHW
    ///
    /// Returns: Array4<f32> with shape [1, 3, 192, 384]
    pub fn preprocess(&self, frame: &RgbImage) -> PipelineResult<Tensor> {
        let _span = tracing::debug_span!("preprocess").entered();

        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Err(PipelineError::InvalidFrame(format!(
                "cannot preprocess a {width}x{height} frame"
            )));
        }

        let resized = if frame.dimensions() != (self.target_width, self.target_height) {
            imageops::resize(
                frame,
                self.target_width,
                self.target_height,
                imageops::FilterType::Triangle,
            )
        } else {
            frame.clone()
        };

        let h = self.target_height as usize;
        let w = self.target_width as usize;
        let mut tensor = Tensor::zeros((1, 3, h, w));

        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                let v = pixel[self.model_order.source_index(c)] as f32 / 255.0;
                tensor[[0, c, y as usize, x as usize]] = (v - MEAN[c]) / STD[c];
            }
        }

        Ok(tensor)
    }
}
