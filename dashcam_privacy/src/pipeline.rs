// THEORY:
// The `pipeline` module is the top-level API of the privacy engine: the watcher loop.
// It owns the polling cadence, claims work from the durable queue, sizes batches by
// backlog and hands each round to the `WorkerPool`.
//
// Key architectural principles:
// 1.  **Single poller**: Exactly one task claims frames. Together with the claim set
//     this guarantees no frame is dispatched twice.
// 2.  **Round-based backpressure**: A new claim happens only after the previous round
//     fully drained, so memory stays bounded however far behind the device falls.
// 3.  **Adaptive cadence**: Busy rounds poll again almost immediately, pending retries
//     poll on a short delay, and an empty queue polls on a long one.
// 4.  **Clean shutdown**: The shutdown signal is only observed between rounds. A round
//     in flight always finishes its write-back before the pool is closed.

use crate::config::PipelineConfig;
use crate::core_modules::frame::Frame;
use crate::core_modules::grid_manager::GridManager;
use crate::core_modules::scheduler_state::SchedulerState;
use crate::engine::EngineFactory;
use crate::parallel_pipeline::{RoundReport, WorkerContext, WorkerPool, WorkerState};
use crate::store::{HealthStatus, WorkQueue};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What one watcher cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Frames returned by the claim.
    pub claimed: usize,
    /// Pending frames reported alongside the claim.
    pub backlog: usize,
    /// Frames per batch chosen for this round.
    pub batch_size: usize,
    /// Frames handed back unprocessed because no batch had room.
    pub deferred: usize,
    /// The claim itself failed; nothing was dispatched.
    pub claim_failed: bool,
    pub round: RoundReport,
}

pub struct PrivacyPipeline {
    config: Arc<PipelineConfig>,
    queue: Arc<dyn WorkQueue>,
    state: Arc<SchedulerState>,
    grid_manager: GridManager,
    pool: WorkerPool,
}

impl PrivacyPipeline {
    /// Builds the pipeline and spawns its workers on the current Tokio runtime.
    pub fn new(config: PipelineConfig, queue: Arc<dyn WorkQueue>, factory: Arc<dyn EngineFactory>) -> Self {
        let config = Arc::new(config);
        let state = Arc::new(SchedulerState::new(config.max_retries, config.error_escalation_threshold));
        let grid_manager = GridManager::new(
            config.frame_width,
            config.frame_height,
            config.max_grid_dimension,
            config.pair_layout,
        );
        let pool = WorkerPool::new(WorkerContext::new(
            Arc::clone(&config),
            Arc::clone(&queue),
            factory,
            Arc::clone(&state),
        ));
        info!(
            workers = pool.worker_count(),
            max_grid = config.max_grid_dimension,
            service = %config.service_name,
            "privacy pipeline ready"
        );
        Self {
            config,
            queue,
            state,
            grid_manager,
            pool,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<SchedulerState> {
        &self.state
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.pool.worker_states()
    }

    /// Publishes `healthy`. Called once before the first claim.
    pub async fn start(&self) -> Result<()> {
        self.state.health().mark_healthy();
        self.publish_health(HealthStatus::Healthy).await
    }

    async fn publish_health(&self, status: HealthStatus) -> Result<()> {
        let queue = Arc::clone(&self.queue);
        let service = self.config.service_name.clone();
        let result = tokio::task::spawn_blocking(move || queue.set_health(&service, status))
            .await
            .context("health update task panicked")?;
        if let Err(e) = result {
            warn!(%status, error = %e, "failed to publish health");
        }
        Ok(())
    }

    /// Claims one round of frames, dispatches it and waits for it to drain.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let queue = Arc::clone(&self.queue);
        let excluded = self.state.excluded();
        let limit = self.config.claim_limit;
        let claim = tokio::task::spawn_blocking(move || queue.claim(limit, &excluded))
            .await
            .context("claim task panicked")?;
        let claim = match claim {
            Ok(claim) => claim,
            Err(e) => {
                warn!(error = %e, "claim failed; will retry");
                report.claim_failed = true;
                return Ok(report);
            }
        };
        report.claimed = claim.frames.len();
        report.backlog = claim.backlog;

        let transition = self
            .state
            .health()
            .observe_backlog(claim.backlog, self.config.backlog_failure_threshold);
        if let Some(status) = transition {
            warn!(backlog = claim.backlog, %status, "backlog changed service health");
            self.publish_health(status).await?;
        }

        if claim.frames.is_empty() {
            return Ok(report);
        }

        let frames = self.acquire(claim.frames);
        report.batch_size = self
            .config
            .batching
            .batch_size(claim.backlog, self.grid_manager.max_capacity());
        let (batches, deferred) = self.grid_manager.partition(frames, report.batch_size);
        report.deferred = deferred.len();
        {
            let mut claims = self.state.claims();
            for frame in &deferred {
                claims.release(&frame.name);
            }
        }

        debug!(
            claimed = report.claimed,
            backlog = report.backlog,
            batch_size = report.batch_size,
            batches = batches.len(),
            "dispatching round"
        );
        report.round = self.pool.run_round(batches).await;
        Ok(report)
    }

    /// Marks claimed frames in flight, dropping any another batch already holds.
    fn acquire(&self, frames: Vec<Frame>) -> Vec<Frame> {
        let mut claims = self.state.claims();
        frames
            .into_iter()
            .filter(|frame| {
                let acquired = claims.acquire([frame.name.as_str()]);
                if !acquired {
                    warn!(frame = %frame.name, "frame already in flight; skipping");
                }
                acquired
            })
            .collect()
    }

    /// How long to wait before the next cycle.
    pub fn next_delay(&self, report: &CycleReport) -> Duration {
        if report.claim_failed {
            self.config.poll_retry()
        } else if report.claimed == 0 {
            self.config.poll_idle()
        } else if self.state.pending_retries() > 0 {
            self.config.poll_retry()
        } else {
            self.config.poll_busy()
        }
    }

    /// Runs until `shutdown` turns true, then closes the worker pool.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.start().await?;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let report = self.run_cycle().await?;
            let delay = self.next_delay(&report);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("shutdown requested; stopping workers");
        self.pool.shutdown().await;
        Ok(())
    }
}
