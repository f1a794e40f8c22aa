use std::sync::{Arc, Mutex};

use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::config::ModelConfig;

use super::window::FrameWindow;

/// Index of the "accident" class in a two-way softmax output.
const ACCIDENT_CLASS: usize = 1;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("onnx runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("failed to load model: {0}")]
    Load(String),
    #[error("unexpected model output: {0}")]
    UnexpectedOutput(String),
    #[error("model session lock poisoned")]
    Poisoned,
    #[error("inference task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub camera_id: String,
    pub is_accident: bool,
    pub confidence: f32,
}

impl DetectionResult {
    pub fn from_confidence(camera_id: &str, confidence: f32, threshold: f32) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            is_accident: confidence > threshold,
            confidence,
        }
    }

    pub fn negative(camera_id: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            is_accident: false,
            confidence: 0.0,
        }
    }
}

/// Opaque window scorer. Implementations must be safe to share across
/// every camera pipeline.
pub trait Classifier: Send + Sync {
    /// Probability in `[0, 1]` that the window shows an accident.
    fn score(&self, window: &FrameWindow) -> Result<f32, InferenceError>;
}

pub struct OnnxClassifier {
    session: Mutex<Session>,
}

impl OnnxClassifier {
    pub fn new(model_path: &str, intra_threads: usize) -> Result<Self, InferenceError> {
        let builder = Session::builder()
            .map_err(load_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(load_error)?
            .with_intra_threads(intra_threads)
            .map_err(load_error)?;

        let session = if model_path.starts_with("http://") || model_path.starts_with("https://") {
            builder.commit_from_url(model_path)
        } else {
            builder.commit_from_file(model_path)
        }
        .map_err(|e| InferenceError::Load(format!("{model_path}: {e}")))?;

        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

impl Classifier for OnnxClassifier {
    fn score(&self, window: &FrameWindow) -> Result<f32, InferenceError> {
        let tensor_ref = TensorRef::from_array_view(window.tensor().view())?.into_dyn();

        let mut session = self.session.lock().map_err(|_| InferenceError::Poisoned)?;
        let outputs = session.run(ort::inputs![tensor_ref])?;
        let probabilities: Vec<f32> = outputs[0]
            .try_extract_array::<f32>()?
            .iter()
            .copied()
            .collect();
        drop(outputs);

        accident_probability(&probabilities)
    }
}

fn load_error(e: impl std::fmt::Display) -> InferenceError {
    InferenceError::Load(e.to_string())
}

/// Accepts either a `[normal, accident]` softmax pair or a single sigmoid.
fn accident_probability(values: &[f32]) -> Result<f32, InferenceError> {
    let p = match values.len() {
        1 => values[0],
        2 => values[ACCIDENT_CLASS],
        n => {
            return Err(InferenceError::UnexpectedOutput(format!(
                "expected 1 or 2 values, got {n}"
            )))
        }
    };
    if !p.is_finite() {
        return Err(InferenceError::UnexpectedOutput(format!("non-finite score {p}")));
    }
    Ok(p.clamp(0.0, 1.0))
}

type Loader = dyn Fn() -> Result<Arc<dyn Classifier>, InferenceError> + Send + Sync;

/// Loads the model on first use and hands the same instance to every
/// pipeline. A failed load is retried on the next call.
pub struct SharedModel {
    cell: OnceCell<Arc<dyn Classifier>>,
    loader: Arc<Loader>,
}

impl SharedModel {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Classifier>, InferenceError> + Send + Sync + 'static,
    {
        Self {
            cell: OnceCell::new(),
            loader: Arc::new(loader),
        }
    }

    pub fn onnx(config: ModelConfig) -> Self {
        Self::new(move || {
            tracing::info!(path = %config.path, "loading accident model");
            let classifier = OnnxClassifier::new(&config.path, config.intra_threads)?;
            tracing::info!(path = %config.path, "accident model loaded");
            Ok(Arc::new(classifier) as Arc<dyn Classifier>)
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn get(&self) -> Result<Arc<dyn Classifier>, InferenceError> {
        let classifier = self
            .cell
            .get_or_try_init(|| async {
                let loader = Arc::clone(&self.loader);
                match tokio::task::spawn_blocking(move || loader()).await {
                    Ok(loaded) => loaded,
                    Err(e) => Err(InferenceError::from(e)),
                }
            })
            .await?;
        Ok(Arc::clone(classifier))
    }
}

/// Runs the shared classifier off the async workers and turns any failure
/// into a negative result so the pipeline keeps going.
#[derive(Clone)]
pub struct InferenceInvoker {
    classifier: Arc<dyn Classifier>,
    threshold: f32,
}

impl InferenceInvoker {
    pub fn new(classifier: Arc<dyn Classifier>, threshold: f32) -> Self {
        Self {
            classifier,
            threshold,
        }
    }

    pub async fn classify(&self, camera_id: &str, window: FrameWindow) -> DetectionResult {
        let classifier = Arc::clone(&self.classifier);
        let outcome = tokio::task::spawn_blocking(move || classifier.score(&window))
            .await
            .map_err(InferenceError::from)
            .and_then(|r| r);

        match outcome {
            Ok(confidence) => {
                let result =
                    DetectionResult::from_confidence(camera_id, confidence, self.threshold);
                tracing::debug!(
                    camera = %camera_id,
                    confidence = format!("{:.4}", result.confidence),
                    accident = result.is_accident,
                    "prediction"
                );
                result
            }
            Err(e) => {
                tracing::warn!(camera = %camera_id, error = %e, "inference failed, treating window as negative");
                DetectionResult::negative(camera_id)
            }
        }
    }
}
