use super::types::{ProbabilityMap, SegmentationEngine, Tensor, MODEL_HEIGHT, MODEL_WIDTH};
use crate::error::{PipelineError, PipelineResult};
use anyhow::{anyhow, Context};
use ndarray::Array2;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor as OrtTensor;
use std::path::Path;

/// Execution backend the session ended up preferring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    TensorRt,
    Cuda,
    Cpu,
}

/// MODNet human segmentation behind an ONNX Runtime session
///
/// The session is created once and reused for every frame. GPU execution
/// providers are registered ahead of the CPU provider, so ONNX Runtime picks
/// the fastest one that is actually available on this machine.
pub struct ModnetSession {
    session: Session,
    input_name: String,
    output_name: String,
}

impl ModnetSession {
    /// Load a MODNet ONNX model
    ///
    /// # Arguments
    /// * `model_path` - Path to the ONNX model file
    /// * `input_name` - Name of the (1, 3, 192, 384) input tensor
    /// * `output_name` - Name of the probability output tensor
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_name: &str,
        output_name: &str,
    ) -> PipelineResult<Self> {
        let path = model_path.as_ref();
        tracing::info!("Loading MODNet model from {}", path.display());

        let load = || -> anyhow::Result<(Session, Backend)> {
            if !path.is_file() {
                return Err(anyhow!("model file does not exist"));
            }

            let backend = detect_backend();
            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level2)?
                .with_intra_threads(4)?
                .with_execution_providers([
                    TensorRTExecutionProvider::default().build(),
                    CUDAExecutionProvider::default().build(),
                    CPUExecutionProvider::default().build(),
                ])?
                .commit_from_file(path)
                .with_context(|| format!("Failed to load model from {}", path.display()))?;
            Ok((session, backend))
        };

        let (session, backend) = load().map_err(|source| PipelineError::ModelLoad {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::info!("MODNet model loaded, backend={:?}", backend);

        Ok(Self {
            session,
            input_name: input_name.to_string(),
            output_name: output_name.to_string(),
        })
    }
}

fn detect_backend() -> Backend {
    if TensorRTExecutionProvider::default().is_available().unwrap_or(false) {
        Backend::TensorRt
    } else if CUDAExecutionProvider::default().is_available().unwrap_or(false) {
        Backend::Cuda
    } else {
        Backend::Cpu
    }
}

impl SegmentationEngine for ModnetSession {
    fn infer(&mut self, tensor: Tensor) -> PipelineResult<ProbabilityMap> {
        let _span = tracing::debug_span!("inference").entered();

        let expected = [1, 3, MODEL_HEIGHT, MODEL_WIDTH];
        if tensor.shape() != expected {
            return Err(PipelineError::Inference(format!(
                "input tensor shape {:?}, expected {:?}",
                tensor.shape(),
                expected
            )));
        }

        let input = OrtTensor::from_array(tensor)
            .map_err(|e| PipelineError::Inference(format!("failed to build input tensor: {e}")))?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])
            .map_err(|e| PipelineError::Inference(e.to_string()))?;

        let output = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| {
                PipelineError::Inference(format!("model has no output named {}", self.output_name))
            })?;

        let view = output
            .try_extract_array::<f32>()
            .map_err(|e| PipelineError::Inference(format!("failed to extract output: {e}")))?;

        // MODNet emits (1, 1, H, W); anything with H*W elements is accepted.
        if view.len() != MODEL_HEIGHT * MODEL_WIDTH {
            return Err(PipelineError::Inference(format!(
                "output tensor shape {:?}, expected {} elements",
                view.shape(),
                MODEL_HEIGHT * MODEL_WIDTH
            )));
        }

        let values: Vec<f32> = view.iter().copied().collect();
        Array2::from_shape_vec((MODEL_HEIGHT, MODEL_WIDTH), values)
            .map_err(|e| PipelineError::Inference(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_is_a_fatal_load_error() {
        let err = ModnetSession::new("does/not/exist/modnet.onnx", "input", "output")
            .err()
            .unwrap();
        assert!(err.is_fatal());
        assert!(matches!(err, PipelineError::ModelLoad { .. }));
    }

    #[test]
    fn malformed_model_is_a_fatal_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modnet.onnx");
        std::fs::write(&path, b"definitely not protobuf").unwrap();

        let err = ModnetSession::new(&path, "input", "output").err().unwrap();
        assert!(matches!(err, PipelineError::ModelLoad { .. }));
    }
}
