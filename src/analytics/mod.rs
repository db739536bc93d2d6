mod accumulator;
mod object;

use thiserror::Error;

use crate::frame::RawFrame;

pub use accumulator::{AccumulatorState, Decision, DetectionAccumulator};
pub use object::ObjectDetector;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    /// In `[0, 1]`.
    pub confidence: f32,
}

/// Result of running one frame through a model.
#[derive(Debug, Clone)]
pub struct Inference {
    /// Same geometry and layout as the input frame, ready for the encoder.
    pub annotated: Vec<u8>,
    pub detections: Vec<Detection>,
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("model backend failed: {0}")]
    Backend(#[from] BoxError),
}

/// Blocking per-frame inference. The pipeline tick waits for it.
pub trait InferenceAdapter: Send {
    fn infer(&mut self, frame: &RawFrame) -> Result<Inference, InferenceError>;
}
