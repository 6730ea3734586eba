use crate::error::PipelineResult;
use ndarray::{Array2, Array4};

/// Model input height in pixels.
pub const MODEL_HEIGHT: usize = 192;
/// Model input width in pixels.
pub const MODEL_WIDTH: usize = 384;

/// Planar NCHW input tensor with shape (1, 3, MODEL_HEIGHT, MODEL_WIDTH)
pub type Tensor = Array4<f32>;

/// Per-pixel foreground likelihood at model resolution, shape (height, width)
pub type ProbabilityMap = Array2<f32>;

/// Trait for segmentation engines
/// Allows swapping the ONNX session for a fake in tests, or for another backend.
pub trait SegmentationEngine {
    /// Run one synchronous inference.
    ///
    /// The tensor must have shape (1, 3, MODEL_HEIGHT, MODEL_WIDTH). Any failure
    /// is an `Inference` error and must not leave the engine unusable for the
    /// next call.
    fn infer(&mut self, tensor: Tensor) -> PipelineResult<ProbabilityMap>;
}
