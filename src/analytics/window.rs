use std::collections::VecDeque;

use ndarray::{Array3, Array5, Axis};

/// Exactly `sequence_length` preprocessed frames in temporal order, shaped
/// `(1, frames, height, width, channels)` for the model.
#[derive(Debug)]
pub struct FrameWindow {
    tensor: Array5<f32>,
}

impl FrameWindow {
    pub fn tensor(&self) -> &Array5<f32> {
        &self.tensor
    }

    pub fn len(&self) -> usize {
        self.tensor.shape()[1]
    }
}

/// Fixed-capacity FIFO of preprocessed frames; the oldest frame is evicted
/// when a push would exceed capacity.
pub struct SlidingWindow {
    frames: VecDeque<Array3<f32>>,
    capacity: usize,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, frame: Array3<f32>) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() == self.capacity
    }

    /// Copies the buffered frames into a model-ready window, or `None` while
    /// the buffer is still filling.
    pub fn snapshot(&self) -> Result<Option<FrameWindow>, ndarray::ShapeError> {
        if !self.is_full() {
            return Ok(None);
        }

        let views: Vec<_> = self.frames.iter().map(|f| f.view()).collect();
        let stacked = ndarray::stack(Axis(0), &views)?;

        Ok(Some(FrameWindow {
            tensor: stacked.insert_axis(Axis(0)),
        }))
    }
}
