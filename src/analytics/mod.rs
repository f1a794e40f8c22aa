mod classifier;
mod confirm;
mod pipeline;
mod preprocess;
mod window;

pub use classifier::{Classifier, InferenceError, SharedModel};
pub use pipeline::{DetectionPipeline, PipelineExit};

#[cfg(test)]
pub(crate) use classifier::testing::ScriptedClassifier;
