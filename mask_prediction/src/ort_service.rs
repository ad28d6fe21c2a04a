use crate::{
    config::ModelConfig,
    model_service::{ModelError, ModelService},
    tiling::Patch,
};
use ndarray::{Array, Array2, Array4};
#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::path::Path;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Converts an RGB patch into a normalised NCHW tensor of shape (1, 3, P, P).
pub fn patch_to_tensor(patch: &Patch) -> Array4<f32> {
    let (width, height) = patch.pixels.dimensions();
    let mut input = Array::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in patch.pixels.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for (c, value) in pixel.0.iter().enumerate() {
            input[[0, c, y, x]] = ((*value as f32) / 255. - MEAN[c]) / STD[c];
        }
    }
    input
}

pub fn sigmoid(logit: f32) -> f32 {
    1.0 / (1.0 + (-logit).exp())
}

#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    output_name: String,
}

impl OrtModelService {
    pub fn new(model_config: &ModelConfig) -> Result<Self, ModelError> {
        Self::from_file(
            &model_config.get_path(),
            model_config.num_instances.max(1),
            model_config.intra_threads.max(1),
            &model_config.output_name,
        )
    }

    pub fn from_file(
        path: &Path,
        num_instances: usize,
        intra_threads: usize,
        output_name: &str,
    ) -> Result<Self, ModelError> {
        #[cfg(feature = "tensorrt")]
        ort::init()
            .with_execution_providers([TensorRTExecutionProvider::default()
                .with_engine_cache(true)
                .build()])
            .commit()?;

        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .with_intra_threads(intra_threads)?
                    .commit_from_file(path)?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        tracing::info!(
            "Created {} ONNX sessions from {}",
            num_instances,
            path.display()
        );

        Ok(Self {
            counter: Arc::new(AtomicUsize::new(0)),
            sessions: Arc::new(sessions),
            output_name: output_name.to_string(),
        })
    }

    /// Runs one forward pass and returns the raw logits, flattened.
    pub fn run_inference(&self, input: &Array4<f32>) -> Result<(Vec<i64>, Vec<f32>), ModelError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| ModelError::PoisonedSession(e.to_string()))?;

        tracing::trace!("Running patch on session {}", index);
        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.as_standard_layout().into_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)?;
        let outputs = session.run(ort::inputs![tensor_ref])?;

        let output = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| ModelError::MissingOutput(self.output_name.clone()))?;
        let (shape, data) = output.try_extract_tensor::<f32>()?;

        Ok((shape.to_vec(), data.to_vec()))
    }
}

impl ModelService for OrtModelService {
    fn predict_patch(&self, patch: &Patch) -> Result<Array2<f32>, ModelError> {
        let input = patch_to_tensor(patch);
        let (height, width) = (input.shape()[2], input.shape()[3]);

        let (shape, logits) = self.run_inference(&input)?;
        logits_to_mask(shape, logits, height, width)
    }
}

/// Applies the sigmoid to raw logits and lays them out as a `height` x `width`
/// probability map. The output must hold exactly `height * width` values.
pub fn logits_to_mask(
    shape: Vec<i64>,
    logits: Vec<f32>,
    height: usize,
    width: usize,
) -> Result<Array2<f32>, ModelError> {
    if logits.len() != height * width {
        return Err(ModelError::OutputShape {
            actual: shape,
            expected: height * width,
        });
    }

    let probabilities = logits.into_iter().map(sigmoid).collect();
    Array2::from_shape_vec((height, width), probabilities).map_err(|_| ModelError::OutputShape {
        actual: shape,
        expected: height * width,
    })
}
