mod modnet;
mod postprocess;
mod preprocess;
pub mod types;

pub use modnet::ModnetSession;
pub use postprocess::MaskPostprocessor;
pub use preprocess::{ChannelOrder, Preprocessor};
pub use types::{ProbabilityMap, SegmentationEngine, Tensor, MODEL_HEIGHT, MODEL_WIDTH};

use crate::error::PipelineResult;
use std::path::Path;

/// Create the default segmentation engine (MODNet)
pub fn create_default_model(
    model_path: &Path,
    input_name: &str,
    output_name: &str,
) -> PipelineResult<Box<dyn SegmentationEngine>> {
    let model = ModnetSession::new(model_path, input_name, output_name)?;
    Ok(Box::new(model))
}
