// THEORY:
// The `store` module is the boundary to durable state: the frame work queue, the
// health table, the error log and the on-disk frame images.
//
// Key architectural principles:
// 1.  **A narrow trait**: The scheduler only ever sees `WorkQueue`. The SQLite client
//     is one implementation; tests substitute their own.
// 2.  **Everything is retryable**: Every `StoreError` variant is treated as transient by
//     callers. No call assumes that an earlier call's write landed.
// 3.  **Claim exclusion is the caller's**: The queue itself has no notion of ownership.
//     The scheduler passes its in-flight and abandoned names into every `claim`.

use crate::core_modules::frame::{Detection, Frame, Metrics};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

mod locator;
mod sqlite;

pub use locator::{FrameLocator, FrameSource, StorageConfig, now_ms};
pub use sqlite::{FrameRecord, SqliteWorkQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Failed,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "healthy" => Some(HealthStatus::Healthy),
            "failed" => Some(HealthStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of one claim: frames to process plus the pending backlog they came from.
#[derive(Debug, Clone, Default)]
pub struct Claim {
    pub frames: Vec<Frame>,
    /// Pending frames outstanding, excluding the ones the caller already holds.
    pub backlog: usize,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("failed to serialize frame results: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store is busy: {0}")]
    Contention(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &error {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                StoreError::Contention(error.to_string())
            }
            _ => StoreError::Sqlite(error),
        }
    }
}

/// Durable work queue the scheduler pulls frames from and writes results to.
pub trait WorkQueue: Send + Sync {
    /// Up to `limit` pending frames, oldest capture first, none of them in `exclude`.
    /// Returns an empty claim when processing is disabled by the feature flag.
    fn claim(&self, limit: usize, exclude: &HashSet<String>) -> Result<Claim, StoreError>;

    /// Marks a frame processed with its detections. Safe to repeat.
    fn commit(
        &self,
        frame: &str,
        model_version: &str,
        detections: &[Detection],
        metrics: &Metrics,
    ) -> Result<(), StoreError>;

    /// Records a terminal error for a frame without marking it processed.
    fn mark_error(&self, frame: &str, message: &str) -> Result<(), StoreError>;

    /// Upserts the single health value of `service`.
    fn set_health(&self, service: &str, status: HealthStatus) -> Result<(), StoreError>;

    /// Appends a line to the durable error log.
    fn log_error(&self, service: &str, message: &str) -> Result<(), StoreError>;
}
