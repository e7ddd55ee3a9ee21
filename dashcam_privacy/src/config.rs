//! Pipeline configuration.
//!
//! Every field has a default so a device can run with no file at all. A JSON file may
//! override any subset, and the store's `config` table may override a few tuning keys
//! at startup.

use crate::core_modules::geometry::DetectionFilter;
use crate::core_modules::redaction::RedactionConfig;
use crate::store::StorageConfig;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const OVERRIDE_CONF_THRESHOLD: &str = "PrivacyConfThreshold";
pub const OVERRIDE_NMS_THRESHOLD: &str = "PrivacyNmsThreshold";
pub const OVERRIDE_NUM_THREADS: &str = "PrivacyNumThreads";
pub const OVERRIDE_MODEL_PATH: &str = "PrivacyModelPath";
pub const OVERRIDE_MODEL_HASH: &str = "PrivacyModelHash";

/// Backlog thresholds that trade per-frame latency for throughput.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingPolicy {
    /// Above this backlog, batches use the largest grid.
    pub high_backlog: usize,
    /// Above this backlog, batches hold four frames.
    pub medium_backlog: usize,
    /// Above this backlog, batches hold two frames. At or below it, one.
    pub low_backlog: usize,
}

impl Default for BatchingPolicy {
    fn default() -> Self {
        Self {
            high_backlog: 40,
            medium_backlog: 15,
            low_backlog: 4,
        }
    }
}

impl BatchingPolicy {
    /// Frames per batch for the given backlog, never above `max_capacity`.
    pub fn batch_size(&self, backlog: usize, max_capacity: usize) -> usize {
        let wanted = if backlog > self.high_backlog {
            max_capacity
        } else if backlog > self.medium_backlog {
            4
        } else if backlog > self.low_backlog {
            2
        } else {
            1
        };
        wanted.clamp(1, max_capacity.max(1))
    }
}

/// One model file and the identifier recorded with its results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: PathBuf,
    pub version: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/data/models/privacy_grid.onnx"),
            version: "unversioned".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Model for every packed input, single frames included.
    pub grid: ModelConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Name of this service's row in the health table.
    pub service_name: String,
    /// Canonical frame width in pixels.
    pub frame_width: u32,
    /// Canonical frame height in pixels.
    pub frame_height: u32,
    /// Model input side used when the engine does not report one.
    pub model_size: u32,
    pub conf_threshold: f32,
    pub nms_threshold: f32,
    pub worker_count: usize,
    /// Bounded task queue between the watcher and the workers.
    pub queue_capacity: usize,
    /// Most frames claimed per round.
    pub claim_limit: usize,
    pub max_grid_dimension: u32,
    /// Pack two-frame batches as a stacked 1x2 layout instead of a 2x2 grid.
    pub pair_layout: bool,
    pub batching: BatchingPolicy,
    /// Consecutive failures before a frame is abandoned.
    pub max_retries: u32,
    /// Consecutive batch errors tolerated before health flips to failed.
    pub error_escalation_threshold: u32,
    /// Backlog above which health flips to failed. Disabled when unset.
    pub backlog_failure_threshold: Option<usize>,
    pub poll_busy_ms: u64,
    pub poll_retry_ms: u64,
    pub poll_idle_ms: u64,
    /// Abandon an inference call after this long. Disabled when unset.
    pub inference_timeout_ms: Option<u64>,
    pub redaction: RedactionConfig,
    pub filters: DetectionFilter,
    pub storage: StorageConfig,
    pub models: ModelsConfig,
    /// `config` table key that enables processing.
    pub feature_flag_key: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            service_name: "privacy".to_string(),
            frame_width: 2028,
            frame_height: 1024,
            model_size: 640,
            conf_threshold: 0.2,
            nms_threshold: 0.9,
            worker_count: num_cpus::get().clamp(1, 4),
            queue_capacity: 32,
            claim_limit: 50,
            max_grid_dimension: 3,
            pair_layout: true,
            batching: BatchingPolicy::default(),
            max_retries: 3,
            error_escalation_threshold: 10,
            backlog_failure_threshold: None,
            poll_busy_ms: 100,
            poll_retry_ms: 1_000,
            poll_idle_ms: 3_000,
            inference_timeout_ms: None,
            redaction: RedactionConfig::default(),
            filters: DetectionFilter::default(),
            storage: StorageConfig::default(),
            models: ModelsConfig::default(),
            feature_flag_key: "isDashcamMLEnabled".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Reads a JSON configuration file. Missing fields keep their defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse config JSON at {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_width == 0 || self.frame_height == 0 {
            bail!("frame dimensions must be non-zero");
        }
        if self.model_size == 0 {
            bail!("model_size must be non-zero");
        }
        if !(1..=4).contains(&self.max_grid_dimension) {
            bail!("max_grid_dimension must be between 1 and 4, got {}", self.max_grid_dimension);
        }
        if !(0.0..=1.0).contains(&self.conf_threshold) || !(0.0..=1.0).contains(&self.nms_threshold) {
            bail!("thresholds must lie in [0, 1]");
        }
        if self.worker_count == 0 || self.queue_capacity == 0 || self.claim_limit == 0 {
            bail!("worker_count, queue_capacity and claim_limit must be positive");
        }
        if self.max_retries == 0 {
            bail!("max_retries must be positive");
        }
        if !(self.redaction.downscale_factor > 0.0 && self.redaction.downscale_factor <= 1.0) {
            bail!("redaction.downscale_factor must lie in (0, 1]");
        }
        if self.models.grid.version.is_empty() {
            bail!("models.grid.version must not be empty");
        }
        Ok(())
    }

    /// Applies tuning overrides read from the store's `config` table. Unparseable
    /// values are skipped with a warning. Returns the keys that took effect.
    pub fn apply_overrides(&mut self, values: &HashMap<String, String>) -> Vec<&'static str> {
        let mut applied = Vec::new();

        if let Some(v) = parse_override::<f32>(values, OVERRIDE_CONF_THRESHOLD) {
            self.conf_threshold = v;
            applied.push(OVERRIDE_CONF_THRESHOLD);
        }
        if let Some(v) = parse_override::<f32>(values, OVERRIDE_NMS_THRESHOLD) {
            self.nms_threshold = v;
            applied.push(OVERRIDE_NMS_THRESHOLD);
        }
        if let Some(v) = parse_override::<usize>(values, OVERRIDE_NUM_THREADS).filter(|&n| n > 0) {
            self.worker_count = v;
            applied.push(OVERRIDE_NUM_THREADS);
        }
        if let Some(v) = values.get(OVERRIDE_MODEL_PATH).filter(|v| !v.is_empty()) {
            self.models.grid.path = PathBuf::from(v);
            applied.push(OVERRIDE_MODEL_PATH);
        }
        if let Some(v) = values.get(OVERRIDE_MODEL_HASH).filter(|v| !v.is_empty()) {
            self.models.grid.version = v.clone();
            applied.push(OVERRIDE_MODEL_HASH);
        }

        if !applied.is_empty() {
            info!(keys = ?applied, "applied configuration overrides from store");
        }
        applied
    }

    pub fn poll_busy(&self) -> Duration {
        Duration::from_millis(self.poll_busy_ms)
    }

    pub fn poll_retry(&self) -> Duration {
        Duration::from_millis(self.poll_retry_ms)
    }

    pub fn poll_idle(&self) -> Duration {
        Duration::from_millis(self.poll_idle_ms)
    }

    pub fn inference_timeout(&self) -> Option<Duration> {
        self.inference_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_override<T: std::str::FromStr>(values: &HashMap<String, String>, key: &str) -> Option<T> {
    let raw = values.get(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable configuration override");
            None
        }
    }
}
