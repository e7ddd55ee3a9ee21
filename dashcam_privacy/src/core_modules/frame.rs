// THEORY:
// The `frame` module holds the plain data that flows through the privacy pipeline.
// Nothing in here knows how a frame is claimed, packed, inferred or redacted; it only
// describes what a frame *is* and what the pipeline produces for it.
//
// Key architectural principles:
// 1.  **Identity by name**: A `Frame` is addressed by its unique image name. Every
//     piece of scheduler state (claims, retries) is keyed by that name.
// 2.  **Detections live in original-frame pixels**: By the time a `Detection` exists,
//     all grid and model-space math has been undone. Consumers never see cell offsets.
// 3.  **Metrics are observational**: `Metrics` is a bag of named numbers attached to a
//     committed frame. Control flow never reads it.

use crate::core_modules::geometry::BoundingBox;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub const METRIC_GRID: &str = "grid";
pub const METRIC_LOAD_TIME: &str = "load_time";
pub const METRIC_INFERENCE_TIME: &str = "inference_time";
pub const METRIC_BLUR_TIME: &str = "blur_time";
pub const METRIC_DOWNSCALE_TIME: &str = "downscale_time";
pub const METRIC_UPSCALE_TIME: &str = "upscale_time";
pub const METRIC_MASK_TIME: &str = "mask_time";
pub const METRIC_COMPOSITE_TIME: &str = "composite_time";
pub const METRIC_WRITE_TIME: &str = "write_time";

/// How the camera was mounted when the frame was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Upright,
    /// The sensor was mounted upside-down; the image must be rotated 180° for inference.
    UpsideDown,
}

impl Orientation {
    /// Maps the store's integer flag onto an orientation. Any non-zero value means flipped.
    pub fn from_flag(flag: i64) -> Self {
        if flag != 0 {
            Orientation::UpsideDown
        } else {
            Orientation::Upright
        }
    }

    pub fn as_flag(self) -> i64 {
        match self {
            Orientation::Upright => 0,
            Orientation::UpsideDown => 1,
        }
    }
}

/// One captured image artifact plus the metadata row the capture subsystem wrote for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Unique image name, e.g. `1700000000123.jpg`.
    pub name: String,
    /// Directory under the durable root where the image lives.
    pub storage_dir: PathBuf,
    /// Vehicle speed at capture time.
    pub speed: f64,
    pub orientation: Orientation,
    /// Capture time in milliseconds since the Unix epoch.
    pub captured_at_ms: i64,
}

impl Frame {
    /// The durable location of the image.
    pub fn durable_path(&self) -> PathBuf {
        self.storage_dir.join(&self.name)
    }
}

/// A single object found in a frame, in that frame's original pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    pub bbox: BoundingBox,
    pub score: f32,
}

/// Serialized shape of a detection: `[[x0, y0, x1, y1], score, class_id]`.
type DetectionRecord = ([i64; 4], f32, usize);

impl Detection {
    fn to_record(&self) -> DetectionRecord {
        (
            [
                self.bbox.x0 as i64,
                self.bbox.y0 as i64,
                self.bbox.x1 as i64,
                self.bbox.y1 as i64,
            ],
            self.score,
            self.class_id,
        )
    }
}

/// Serializes detections into the JSON form stored alongside the frame record.
pub fn detections_to_json(detections: &[Detection]) -> serde_json::Result<String> {
    let records: Vec<DetectionRecord> = detections.iter().map(Detection::to_record).collect();
    serde_json::to_string(&records)
}

/// Named durations (milliseconds) and counters recorded while processing a frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics(BTreeMap<String, f64>);

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a duration in milliseconds under `name`, replacing any previous value.
    pub fn record(&mut self, name: &str, elapsed: Duration) {
        self.0.insert(name.to_string(), elapsed.as_secs_f64() * 1000.0);
    }

    pub fn set(&mut self, name: &str, value: f64) {
        self.0.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
