use super::{Claim, HealthStatus, StoreError, WorkQueue};
use crate::core_modules::frame::{
    Detection, Frame, METRIC_BLUR_TIME, METRIC_INFERENCE_TIME, METRIC_LOAD_TIME, METRIC_WRITE_TIME, Metrics,
    Orientation, detections_to_json,
};
use crate::store::locator::now_ms;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS framekms (
    image_name TEXT PRIMARY KEY,
    image_path TEXT NOT NULL,
    speed REAL NOT NULL DEFAULT 0,
    time INTEGER NOT NULL,
    orientation INTEGER NOT NULL DEFAULT 0,
    ml_model_hash TEXT,
    ml_detections TEXT,
    ml_processed_at INTEGER,
    ml_read_time REAL,
    ml_inference_time REAL,
    ml_blur_time REAL,
    ml_write_time REAL,
    ml_metrics TEXT,
    ml_error TEXT
);
CREATE INDEX IF NOT EXISTS framekms_pending ON framekms (ml_model_hash, time);
CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT
);
CREATE TABLE IF NOT EXISTS health_state (
    service_name TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS error_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    system_time INTEGER NOT NULL,
    service_name TEXT NOT NULL,
    message TEXT NOT NULL
);
";

/// What the store holds about one frame's processing, for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub model_version: Option<String>,
    pub detections: Option<String>,
    pub processed_at: Option<i64>,
    pub metrics: Option<Metrics>,
    pub error: Option<String>,
}

/// `WorkQueue` over the device's SQLite database.
pub struct SqliteWorkQueue {
    conn: Mutex<Connection>,
    feature_flag_key: String,
}

impl SqliteWorkQueue {
    /// Opens the database with WAL journaling and a busy timeout.
    pub fn open(path: &Path, feature_flag_key: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "opened work queue");
        Self::from_connection(conn, feature_flag_key)
    }

    pub fn open_in_memory(feature_flag_key: &str) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, feature_flag_key)
    }

    fn from_connection(conn: Connection, feature_flag_key: &str) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn: Mutex::new(conn),
            feature_flag_key: feature_flag_key.to_string(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates any missing tables.
    pub fn create_schema(&self) -> Result<(), StoreError> {
        self.lock().execute_batch(SCHEMA)?;
        info!("work queue schema ready");
        Ok(())
    }

    /// Every key/value pair of the `config` table.
    pub fn config_values(&self) -> Result<HashMap<String, String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT key, value FROM config WHERE value IS NOT NULL")?;
        let values = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(values)
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT OR REPLACE INTO config (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Inserts a pending frame row the way the capture subsystem does.
    pub fn insert_frame(&self, frame: &Frame) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO framekms (image_name, image_path, speed, time, orientation) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                frame.name,
                frame.storage_dir.to_string_lossy().into_owned(),
                frame.speed,
                frame.captured_at_ms,
                frame.orientation.as_flag(),
            ],
        )?;
        Ok(())
    }

    pub fn frame_record(&self, name: &str) -> Result<Option<FrameRecord>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT ml_model_hash, ml_detections, ml_processed_at, ml_metrics, ml_error
                 FROM framekms WHERE image_name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((model_version, detections, processed_at, metrics, error)) = row else {
            return Ok(None);
        };
        let metrics = metrics.map(|json| serde_json::from_str(&json)).transpose()?;
        Ok(Some(FrameRecord {
            model_version,
            detections,
            processed_at,
            metrics,
            error,
        }))
    }

    pub fn health(&self, service: &str) -> Result<Option<HealthStatus>, StoreError> {
        let status: Option<String> = self
            .lock()
            .query_row(
                "SELECT status FROM health_state WHERE service_name = ?1",
                params![service],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.as_deref().and_then(HealthStatus::parse))
    }

    /// Messages logged for `service`, oldest first.
    pub fn error_log(&self, service: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT message FROM error_logs WHERE service_name = ?1 ORDER BY id")?;
        let messages = stmt
            .query_map(params![service], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(messages)
    }

    fn processing_enabled(conn: &Connection, key: &str) -> Result<bool, StoreError> {
        let value: Option<Option<String>> = conn
            .query_row("SELECT value FROM config WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(matches!(value, Some(Some(v)) if v != "false"))
    }
}

impl WorkQueue for SqliteWorkQueue {
    fn claim(&self, limit: usize, exclude: &HashSet<String>) -> Result<Claim, StoreError> {
        let conn = self.lock();
        if !Self::processing_enabled(&conn, &self.feature_flag_key)? {
            return Ok(Claim::default());
        }

        let fetch = (limit + exclude.len()) as i64;
        let mut stmt = conn.prepare(
            "SELECT image_name, image_path, speed, time, orientation FROM framekms
             WHERE ml_model_hash IS NULL ORDER BY time ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![fetch], |row| {
                Ok(Frame {
                    name: row.get(0)?,
                    storage_dir: PathBuf::from(row.get::<_, String>(1)?),
                    speed: row.get::<_, Option<f64>>(2)?.unwrap_or_default(),
                    captured_at_ms: row.get(3)?,
                    orientation: Orientation::from_flag(row.get::<_, Option<i64>>(4)?.unwrap_or_default()),
                })
            })?
            .collect::<rusqlite::Result<Vec<Frame>>>()?;
        let frames: Vec<Frame> = rows
            .into_iter()
            .filter(|frame| !exclude.contains(&frame.name))
            .take(limit)
            .collect();

        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM framekms WHERE ml_model_hash IS NULL",
            [],
            |row| row.get(0),
        )?;
        let backlog = (pending as usize).saturating_sub(exclude.len());
        Ok(Claim { frames, backlog })
    }

    fn commit(
        &self,
        frame: &str,
        model_version: &str,
        detections: &[Detection],
        metrics: &Metrics,
    ) -> Result<(), StoreError> {
        let detections = detections_to_json(detections)?;
        let metrics_json = serde_json::to_string(metrics)?;
        let timing = |name: &str| metrics.get(name).unwrap_or_default();
        self.lock().execute(
            "UPDATE framekms SET ml_model_hash = ?1, ml_detections = ?2, ml_processed_at = ?3,
                 ml_read_time = ?4, ml_inference_time = ?5, ml_blur_time = ?6, ml_write_time = ?7,
                 ml_metrics = ?8, ml_error = NULL
             WHERE image_name = ?9",
            params![
                model_version,
                detections,
                now_ms(),
                timing(METRIC_LOAD_TIME),
                timing(METRIC_INFERENCE_TIME),
                timing(METRIC_BLUR_TIME),
                timing(METRIC_WRITE_TIME),
                metrics_json,
                frame,
            ],
        )?;
        Ok(())
    }

    fn mark_error(&self, frame: &str, message: &str) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE framekms SET ml_error = ?1 WHERE image_name = ?2",
            params![message, frame],
        )?;
        Ok(())
    }

    fn set_health(&self, service: &str, status: HealthStatus) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT OR REPLACE INTO health_state (service_name, status, updated_at) VALUES (?1, ?2, ?3)",
            params![service, status.as_str(), now_ms()],
        )?;
        Ok(())
    }

    fn log_error(&self, service: &str, message: &str) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO error_logs (system_time, service_name, message) VALUES (?1, ?2, ?3)",
            params![now_ms(), service, message],
        )?;
        Ok(())
    }
}
