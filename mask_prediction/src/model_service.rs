use crate::tiling::Patch;
use ndarray::Array2;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("ONNX runtime error: {0}")]
    Runtime(#[from] ort::Error),
    #[error("session mutex poisoned: {0}")]
    PoisonedSession(String),
    #[error("unexpected model output shape {actual:?}, expected {expected} values")]
    OutputShape { actual: Vec<i64>, expected: usize },
    #[error("model output `{0}` not found")]
    MissingOutput(String),
}

/// Runs the segmentation network on a single patch and returns a
/// `patch_size` x `patch_size` map of foreground probabilities.
pub trait ModelService: Send + Sync + 'static {
    fn predict_patch(&self, patch: &Patch) -> Result<Array2<f32>, ModelError>;
}
