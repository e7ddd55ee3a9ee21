// THEORY:
// The `engine` module is the inference boundary. The pipeline never links a native
// runtime directly; it talks to an `InferenceEngine` created by an `EngineFactory`.
//
// Key architectural principles:
// 1.  **Classify once, at the edge**: A backend maps every native failure onto an
//     `InferenceError` with an explicit `Transient` or `Fatal` kind. Nothing upstream
//     inspects error text.
// 2.  **One session per worker**: Engines are `Send` but not `Sync`. Each worker owns
//     its sessions exclusively, so inference runs truly in parallel without a lock.
// 3.  **Tagged model variants**: The single-frame and grid models are a `ModelVariant`
//     chosen by `select_model`, not a runtime string comparison.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

mod noop;

pub use noop::{NoOpEngine, NoOpEngineFactory};

/// Which trained model a batch runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    /// Trained on one frame per input.
    Single,
    /// Trained on packed multi-frame grids.
    Grid,
}

/// Picks the model for a batch of `batch_size` frames.
pub fn select_model(batch_size: usize) -> ModelVariant {
    if batch_size <= 1 {
        ModelVariant::Single
    } else {
        ModelVariant::Grid
    }
}

/// How the first four output attributes express a box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoxConvention {
    /// Center/size normalized to `0.0..=1.0` of the input.
    #[default]
    Normalized,
    /// Center/size in input pixels (`0..=input_size`).
    Pixels,
}

/// Static facts about a loaded model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMetadata {
    /// Required square input side. `None` lets the pipeline configuration decide.
    pub input_size: Option<u32>,
    pub num_classes: usize,
    pub box_convention: BoxConvention,
    /// Identifier written next to every committed frame.
    pub version: String,
}

/// One packed, square RGB model input.
pub struct ModelInput {
    pub image: RgbImage,
}

impl ModelInput {
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    pub fn size(&self) -> u32 {
        self.image.width()
    }

    /// `[1, H, W, 3]` floats scaled to `0.0..=1.0`.
    pub fn to_nhwc_f32(&self) -> Vec<f32> {
        self.image.as_raw().iter().map(|&v| v as f32 / 255.0).collect()
    }

    /// `[1, 3, H, W]` floats scaled to `0.0..=1.0`.
    pub fn to_nchw_f32(&self) -> Vec<f32> {
        let (width, height) = self.image.dimensions();
        let plane = (width * height) as usize;
        let mut tensor = vec![0.0f32; plane * 3];
        for (i, pixel) in self.image.pixels().enumerate() {
            for c in 0..3 {
                tensor[c * plane + i] = pixel.0[c] as f32 / 255.0;
            }
        }
        tensor
    }
}

/// Raw model output in `[1, attributes, predictions]` layout, where
/// `attributes = 4 box terms + one score per class`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
    pub attributes: usize,
    pub predictions: usize,
    pub data: Vec<f32>,
}

impl RawOutput {
    pub fn new(attributes: usize, predictions: usize, data: Vec<f32>) -> Self {
        Self {
            attributes,
            predictions,
            data,
        }
    }

    /// An output with no predictions.
    pub fn empty(num_classes: usize) -> Self {
        Self::new(4 + num_classes, 0, Vec::new())
    }

    pub fn get(&self, attribute: usize, prediction: usize) -> f32 {
        self.data[attribute * self.predictions + prediction]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceErrorKind {
    /// Worth retrying on the same session.
    Transient,
    /// The session is unusable and must be rebuilt before the next batch.
    Fatal,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?} inference error: {message}")]
pub struct InferenceError {
    pub kind: InferenceErrorKind,
    pub message: String,
}

impl InferenceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: InferenceErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: InferenceErrorKind::Fatal,
            message: message.into(),
        }
    }

    /// A call that did not return in time. The session may be wedged, so it is fatal.
    pub fn timeout(limit: Duration) -> Self {
        Self::fatal(format!("inference did not finish within {} ms", limit.as_millis()))
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == InferenceErrorKind::Fatal
    }
}

/// A loaded model session.
pub trait InferenceEngine: Send {
    fn metadata(&self) -> &ModelMetadata;

    /// Runs one packed input through the model.
    fn infer(&mut self, input: &ModelInput) -> Result<RawOutput, InferenceError>;
}

/// Creates sessions. Shared by every worker.
pub trait EngineFactory: Send + Sync {
    fn create(&self, variant: ModelVariant) -> Result<Box<dyn InferenceEngine>, InferenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn single_frames_use_the_single_model() {
        assert_eq!(select_model(1), ModelVariant::Single);
        assert_eq!(select_model(2), ModelVariant::Grid);
        assert_eq!(select_model(9), ModelVariant::Grid);
    }

    #[test]
    fn tensor_layouts_agree() {
        let image = RgbImage::from_fn(2, 2, |x, y| Rgb([(x * 10) as u8, (y * 20) as u8, 255]));
        let input = ModelInput::new(image);
        let nhwc = input.to_nhwc_f32();
        let nchw = input.to_nchw_f32();
        assert_eq!(nhwc.len(), 12);
        // Pixel (1, 0), channel 0.
        assert_eq!(nhwc[3], 10.0 / 255.0);
        assert_eq!(nchw[1], 10.0 / 255.0);
        // Blue plane is all ones.
        assert!(nchw[8..].iter().all(|&v| v == 1.0));
    }

    #[test]
    fn timeouts_are_fatal() {
        let error = InferenceError::timeout(Duration::from_millis(1500));
        assert!(error.is_fatal());
        assert!(error.to_string().contains("1500 ms"));
        assert!(!InferenceError::transient("busy").is_fatal());
    }
}
