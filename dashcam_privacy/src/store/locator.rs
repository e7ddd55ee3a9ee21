use crate::core_modules::frame::Frame;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Where frame images live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Fast-storage mirror holding recently captured images by name.
    pub recent_root: Option<PathBuf>,
    /// Frames captured within this window may be read from the mirror.
    pub freshness_window_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            recent_root: None,
            freshness_window_ms: 60_000,
        }
    }
}

/// Resolved paths for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSource {
    /// Where the image is read from.
    pub read_path: PathBuf,
    /// The authoritative location. Write-back always lands here.
    pub durable_path: PathBuf,
    /// Set when the read came from the mirror; that copy is replaced too.
    pub mirror_path: Option<PathBuf>,
}

impl FrameSource {
    /// Every path the redacted image must be written to, durable first.
    pub fn write_targets(&self) -> Vec<&Path> {
        let mut targets = vec![self.durable_path.as_path()];
        if let Some(mirror) = &self.mirror_path {
            targets.push(mirror.as_path());
        }
        targets
    }
}

/// Resolves frame images across the durable root and the optional recent mirror.
#[derive(Debug, Clone)]
pub struct FrameLocator {
    config: StorageConfig,
}

impl FrameLocator {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    pub fn locate(&self, frame: &Frame, now_ms: i64) -> FrameSource {
        let durable_path = frame.durable_path();
        if let Some(root) = &self.config.recent_root {
            let age = now_ms.saturating_sub(frame.captured_at_ms);
            let mirror = root.join(&frame.name);
            if (0..=self.config.freshness_window_ms as i64).contains(&age) && mirror.is_file() {
                return FrameSource {
                    read_path: mirror.clone(),
                    durable_path,
                    mirror_path: Some(mirror),
                };
            }
        }
        FrameSource {
            read_path: durable_path.clone(),
            durable_path,
            mirror_path: None,
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
