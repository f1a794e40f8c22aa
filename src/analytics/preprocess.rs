use ndarray::Array3;
use opencv::core::{Mat, Size};
use opencv::imgproc;
use opencv::prelude::*;
use thiserror::Error;

use crate::camera::RawFrame;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("tensor shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Resizes frames to the model's input resolution. Pixel values stay raw
/// BGR in 0..=255, the encoding the accident model was trained on.
#[derive(Debug, Clone, Copy)]
pub struct FramePreprocessor {
    width: i32,
    height: i32,
}

impl FramePreprocessor {
    pub fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    /// Output shape is `(height, width, 3)`.
    pub fn process(&self, frame: &RawFrame) -> Result<Array3<f32>, PreprocessError> {
        if frame.width <= 0 || frame.height <= 0 {
            return Err(PreprocessError::Malformed(format!(
                "{}x{} frame",
                frame.width, frame.height
            )));
        }
        if frame.data.len() != frame.expected_len() {
            return Err(PreprocessError::Malformed(format!(
                "{} bytes for a {}x{} BGR frame",
                frame.data.len(),
                frame.width,
                frame.height
            )));
        }

        let mat = Mat::from_slice(&frame.data)?;
        let reshaped = mat.reshape(3, frame.height)?;

        let mut resized = Mat::default();
        imgproc::resize(
            &reshaped,
            &mut resized,
            Size::new(self.width, self.height),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let data = resized.data_bytes()?;
        let pixels: Vec<f32> = data.iter().map(|&b| b as f32).collect();
        let shape = (self.height as usize, self.width as usize, 3);
        let tensor = Array3::from_shape_vec(shape, pixels)?;

        Ok(tensor)
    }
}
