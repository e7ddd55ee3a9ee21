// THEORY:
// The `WorkerPool` is the execution half of the scheduler. The watcher hands it a round
// of batches; a fixed set of workers pulls them from one bounded queue and drives each
// through `inferring -> decoding -> redacting -> writing`, then reports back.
//
// Key architectural principles:
// 1.  **One shared bounded queue**: Every worker pops from the same `mpsc` receiver.
//     A slow batch never holds up the others, and `submit` applies backpressure when
//     the queue is full.
// 2.  **Rounds drain completely**: `run_round` resolves only after every batch of the
//     round has acknowledged completion through its `oneshot`. The watcher never claims
//     more work while a round is in flight.
// 3.  **Sessions belong to workers**: Each worker owns its engine sessions and builds
//     them lazily. A fatal error or a timeout discards the session; the next batch
//     gets a fresh one from the factory.
// 4.  **Blocking work stays off the runtime**: Image decoding, inference, redaction and
//     store writes run under `spawn_blocking`. The async side only coordinates.
// 5.  **Every frame ends accounted for**: A batch attempt ends with each of its frames
//     either committed, released for retry, or abandoned with its error persisted. A
//     panic while finishing one frame fails that frame alone.

use crate::config::PipelineConfig;
use crate::core_modules::decoder::{DecodeError, OutputDecoder};
use crate::core_modules::frame::{
    Detection, Frame, METRIC_GRID, METRIC_INFERENCE_TIME, METRIC_LOAD_TIME, Metrics,
};
use crate::core_modules::grid_manager::{AssembledBatch, AssemblyError, Batch, GridManager};
use crate::core_modules::redaction::Redactor;
use crate::core_modules::scheduler_state::{RetryOutcome, SchedulerState};
use crate::engine::{
    EngineFactory, InferenceEngine, InferenceError, ModelInput, ModelVariant, RawOutput, select_model,
};
use crate::store::{FrameLocator, FrameSource, WorkQueue, now_ms};
use futures::future::join_all;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What a worker is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Idle,
    /// Loading frames, packing the grid and running the model.
    Inferring,
    Decoding,
    Redacting,
    /// Writing images and committing results.
    Writing,
}

/// Why a batch attempt failed as a whole.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch assembly failed: {0}")]
    Assembly(#[from] AssemblyError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("decoding model output failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("worker task failed: {0}")]
    Join(String),
}

impl BatchError {
    /// Whether the inference session that ran this batch must be rebuilt.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, BatchError::Inference(e) if e.is_fatal())
    }
}

impl From<tokio::task::JoinError> for BatchError {
    fn from(error: tokio::task::JoinError) -> Self {
        BatchError::Join(error.to_string())
    }
}

/// How one batch attempt ended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub committed: usize,
    pub retried: usize,
    pub abandoned: usize,
    /// Set when the batch failed as a whole.
    pub error: Option<String>,
}

/// Totals across one drained round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundReport {
    pub batches: usize,
    pub committed: usize,
    pub retried: usize,
    pub abandoned: usize,
    pub failed_batches: usize,
}

impl RoundReport {
    fn absorb(&mut self, report: &BatchReport) {
        self.batches += 1;
        self.committed += report.committed;
        self.retried += report.retried;
        self.abandoned += report.abandoned;
        if report.error.is_some() {
            self.failed_batches += 1;
        }
    }
}

pub struct BatchTask {
    pub batch: Batch,
    pub done: oneshot::Sender<BatchReport>,
}

/// Everything a worker needs, shared by all of them.
pub struct WorkerContext {
    pub config: Arc<PipelineConfig>,
    pub queue: Arc<dyn WorkQueue>,
    pub factory: Arc<dyn EngineFactory>,
    pub state: Arc<SchedulerState>,
    pub grid_manager: GridManager,
    pub redactor: Redactor,
    pub locator: FrameLocator,
}

impl WorkerContext {
    pub fn new(
        config: Arc<PipelineConfig>,
        queue: Arc<dyn WorkQueue>,
        factory: Arc<dyn EngineFactory>,
        state: Arc<SchedulerState>,
    ) -> Self {
        let grid_manager = GridManager::new(
            config.frame_width,
            config.frame_height,
            config.max_grid_dimension,
            config.pair_layout,
        );
        let redactor = Redactor::new(config.redaction.clone());
        let locator = FrameLocator::new(config.storage.clone());
        Self {
            config,
            queue,
            factory,
            state,
            grid_manager,
            redactor,
            locator,
        }
    }

    /// A frame attempt did not resolve: count it and either release it for another
    /// claim or abandon it with its error persisted.
    fn fail_frame(&self, frame: &str, message: &str) -> RetryOutcome {
        let outcome = self.state.retries().record_failure(frame);
        match outcome {
            RetryOutcome::Retry { attempts } => {
                debug!(frame, attempts, error = message, "frame will be retried");
                self.state.claims().release(frame);
            }
            RetryOutcome::Abandon { attempts } => {
                warn!(frame, attempts, error = message, "abandoning frame");
                if let Err(e) = self.queue.mark_error(frame, message) {
                    warn!(frame, error = %e, "failed to record frame error");
                }
                self.state.claims().abandon(frame);
            }
        }
        outcome
    }

    fn succeed_frame(&self, frame: &str) {
        self.state.retries().record_success(frame);
        self.state.claims().release(frame);
    }

    /// Batch-level failure bookkeeping. Store writes here are best effort.
    fn record_batch_error(&self, message: &str) {
        let service = self.config.service_name.as_str();
        if let Err(e) = self.queue.log_error(service, message) {
            warn!(error = %e, "failed to append to error log");
        }
        let escalated = self.state.escalation().record_error();
        if escalated {
            let status = self.state.health().escalate_errors();
            error!(service, "too many consecutive batch errors; reporting failed health");
            if let Err(e) = self.queue.set_health(service, status) {
                warn!(error = %e, "failed to publish health");
            }
        }
    }
}

/// Inference sessions owned by one worker, created on first use.
struct EngineSessions {
    factory: Arc<dyn EngineFactory>,
    sessions: HashMap<ModelVariant, Box<dyn InferenceEngine>>,
}

impl EngineSessions {
    fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            sessions: HashMap::new(),
        }
    }

    async fn take(&mut self, variant: ModelVariant) -> Result<Box<dyn InferenceEngine>, BatchError> {
        if let Some(engine) = self.sessions.remove(&variant) {
            return Ok(engine);
        }
        let factory = Arc::clone(&self.factory);
        info!(?variant, "creating inference session");
        Ok(tokio::task::spawn_blocking(move || factory.create(variant)).await??)
    }

    fn put_back(&mut self, variant: ModelVariant, engine: Box<dyn InferenceEngine>) {
        self.sessions.insert(variant, engine);
    }
}

type WorkerStates = Arc<Vec<Mutex<WorkerState>>>;

fn set_state(states: &WorkerStates, worker: usize, state: WorkerState) {
    if let Some(slot) = states.get(worker) {
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

pub struct WorkerPool {
    task_sender: Option<mpsc::Sender<BatchTask>>,
    workers: Vec<JoinHandle<()>>,
    states: WorkerStates,
    context: Arc<WorkerContext>,
}

impl WorkerPool {
    /// Spawns `worker_count` workers on the current Tokio runtime.
    pub fn new(context: WorkerContext) -> Self {
        let worker_count = context.config.worker_count.max(1);
        let (task_sender, task_receiver) = mpsc::channel::<BatchTask>(context.config.queue_capacity.max(1));
        let task_receiver = Arc::new(tokio::sync::Mutex::new(task_receiver));
        let states: WorkerStates = Arc::new((0..worker_count).map(|_| Mutex::new(WorkerState::Idle)).collect());
        let context = Arc::new(context);

        let workers = (0..worker_count)
            .map(|id| {
                let receiver = Arc::clone(&task_receiver);
                let context = Arc::clone(&context);
                let states = Arc::clone(&states);
                tokio::spawn(async move {
                    let mut sessions = EngineSessions::new(Arc::clone(&context.factory));
                    loop {
                        // Hold the lock only while waiting for the next task.
                        let task = { receiver.lock().await.recv().await };
                        let Some(task) = task else { break };
                        let report = Self::process_batch(id, &context, &mut sessions, &states, task.batch).await;
                        set_state(&states, id, WorkerState::Idle);
                        let _ = task.done.send(report);
                    }
                    debug!(worker = id, "worker stopped");
                })
            })
            .collect();

        Self {
            task_sender: Some(task_sender),
            workers,
            states,
            context,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Snapshot of every worker's current state.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.states
            .iter()
            .map(|slot| *slot.lock().unwrap_or_else(PoisonError::into_inner))
            .collect()
    }

    /// Queues one batch. Waits while the queue is full.
    pub async fn submit(&self, batch: Batch) -> Result<oneshot::Receiver<BatchReport>, Batch> {
        let Some(sender) = &self.task_sender else {
            return Err(batch);
        };
        let (done, receiver) = oneshot::channel();
        sender
            .send(BatchTask { batch, done })
            .await
            .map_err(|e| e.0.batch)?;
        Ok(receiver)
    }

    /// Submits every batch and waits until all of them have been acknowledged.
    pub async fn run_round(&self, batches: Vec<Batch>) -> RoundReport {
        let mut pending = Vec::with_capacity(batches.len());
        let mut round = RoundReport::default();
        for batch in batches {
            let names: Vec<String> = batch.frames.iter().map(|f| f.name.clone()).collect();
            match self.submit(batch).await {
                Ok(receiver) => pending.push((names, receiver)),
                Err(batch) => {
                    warn!(frames = batch.len(), "worker pool closed; releasing batch");
                    for frame in &batch.frames {
                        self.context.state.claims().release(&frame.name);
                    }
                }
            }
        }

        let results = join_all(pending.into_iter().map(|(names, receiver)| async move {
            match receiver.await {
                Ok(report) => report,
                Err(_) => self.lost_batch(&names),
            }
        }))
        .await;
        for report in &results {
            round.absorb(report);
        }
        round
    }

    /// A worker dropped a batch without reporting (it panicked). Its frames count as
    /// failed attempts.
    fn lost_batch(&self, names: &[String]) -> BatchReport {
        let message = "worker stopped before finishing the batch";
        error!(frames = names.len(), "{message}");
        self.context.record_batch_error(message);
        let mut report = BatchReport {
            error: Some(message.to_string()),
            ..BatchReport::default()
        };
        for name in names {
            match self.context.fail_frame(name, message) {
                RetryOutcome::Retry { .. } => report.retried += 1,
                RetryOutcome::Abandon { .. } => report.abandoned += 1,
            }
        }
        report
    }

    /// Closes the queue and waits for every worker to finish its current batch.
    pub async fn shutdown(mut self) {
        self.task_sender.take();
        for result in join_all(self.workers.drain(..)).await {
            if let Err(e) = result {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }

    async fn process_batch(
        worker: usize,
        context: &Arc<WorkerContext>,
        sessions: &mut EngineSessions,
        states: &WorkerStates,
        batch: Batch,
    ) -> BatchReport {
        let started = Instant::now();
        let frame_count = batch.len();
        let result = Self::run_batch(worker, context, sessions, states, &batch).await;

        let mut report = BatchReport::default();
        match result {
            Ok(outcomes) => {
                context.state.escalation().record_success();
                for (frame, outcome) in batch.frames.iter().zip(outcomes) {
                    match outcome {
                        Ok(()) => {
                            context.succeed_frame(&frame.name);
                            report.committed += 1;
                        }
                        Err(message) => match context.fail_frame(&frame.name, &message) {
                            RetryOutcome::Retry { .. } => report.retried += 1,
                            RetryOutcome::Abandon { .. } => report.abandoned += 1,
                        },
                    }
                }
                info!(
                    worker,
                    frames = frame_count,
                    committed = report.committed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "batch finished"
                );
            }
            Err(batch_error) => {
                let message = batch_error.to_string();
                error!(
                    worker,
                    frames = frame_count,
                    session_reset = batch_error.is_fatal_to_session(),
                    error = %message,
                    "batch failed"
                );
                let context = Arc::clone(context);
                let names: Vec<String> = batch.frames.iter().map(|f| f.name.clone()).collect();
                let bookkeeping = tokio::task::spawn_blocking(move || {
                    context.record_batch_error(&message);
                    let outcomes: Vec<RetryOutcome> =
                        names.iter().map(|name| context.fail_frame(name, &message)).collect();
                    (message, outcomes)
                })
                .await;
                match bookkeeping {
                    Ok((message, outcomes)) => {
                        for outcome in outcomes {
                            match outcome {
                                RetryOutcome::Retry { .. } => report.retried += 1,
                                RetryOutcome::Abandon { .. } => report.abandoned += 1,
                            }
                        }
                        report.error = Some(message);
                    }
                    Err(e) => report.error = Some(e.to_string()),
                }
            }
        }
        report
    }

    /// One attempt at a batch. Returns a per-frame result when the batch got as far as
    /// decoding; any earlier failure fails the whole batch.
    async fn run_batch(
        worker: usize,
        context: &Arc<WorkerContext>,
        sessions: &mut EngineSessions,
        states: &WorkerStates,
        batch: &Batch,
    ) -> Result<Vec<Result<(), String>>, BatchError> {
        set_state(states, worker, WorkerState::Inferring);
        let variant = select_model(batch.len());
        let engine = sessions.take(variant).await?;
        let metadata = engine.metadata().clone();
        let model_size = metadata.input_size.unwrap_or(context.config.model_size);

        let now = now_ms();
        let sources: Vec<FrameSource> = batch.frames.iter().map(|f| context.locator.locate(f, now)).collect();
        let assembled = {
            let context = Arc::clone(context);
            let batch = batch.clone();
            let read_paths: Vec<_> = sources.iter().map(|s| s.read_path.clone()).collect();
            tokio::task::spawn_blocking(move || context.grid_manager.assemble(&batch, &read_paths, model_size))
        };
        let assembled = match assembled.await {
            Ok(Ok(assembled)) => assembled,
            Ok(Err(e)) => {
                sessions.put_back(variant, engine);
                return Err(e.into());
            }
            Err(e) => {
                sessions.put_back(variant, engine);
                return Err(e.into());
            }
        };
        let AssembledBatch {
            canvas,
            originals,
            load_errors,
            elapsed: load_elapsed,
        } = assembled;

        let inference_started = Instant::now();
        let timeout = context.config.inference_timeout();
        let output = Self::infer(sessions, variant, engine, ModelInput::new(canvas), timeout).await?;
        let inference_elapsed = inference_started.elapsed();

        set_state(states, worker, WorkerState::Decoding);
        let decoder = OutputDecoder {
            conf_threshold: context.config.conf_threshold,
            nms_threshold: context.config.nms_threshold,
            filter: context.config.filters,
            convention: metadata.box_convention,
            model_size,
        };
        let detections = decoder.decode(&output, batch)?;

        let frame_count = batch.len().max(1) as u32;
        let mut base_metrics = Metrics::new();
        base_metrics.set(METRIC_GRID, batch.geometry.dimension() as f64);
        base_metrics.record(METRIC_LOAD_TIME, load_elapsed / frame_count);
        base_metrics.record(METRIC_INFERENCE_TIME, inference_elapsed / frame_count);

        let mut load_failures: HashMap<usize, String> = load_errors.into_iter().collect();
        let jobs: Vec<FrameJob> = batch
            .frames
            .iter()
            .cloned()
            .zip(sources)
            .zip(originals)
            .zip(detections)
            .enumerate()
            .map(|(index, (((frame, source), original), detections))| FrameJob {
                load_error: load_failures.remove(&index),
                frame,
                source,
                original,
                detections,
            })
            .collect();

        let context = Arc::clone(context);
        let states = Arc::clone(states);
        let version = metadata.version;
        let outcomes = tokio::task::spawn_blocking(move || {
            jobs.into_iter()
                .map(|job| finish_frame_isolated(worker, &context, &states, &version, &base_metrics, job))
                .collect::<Vec<_>>()
        })
        .await?;
        Ok(outcomes)
    }

    /// Runs the model off the runtime. The session survives unless the call failed
    /// fatally or timed out.
    async fn infer(
        sessions: &mut EngineSessions,
        variant: ModelVariant,
        mut engine: Box<dyn InferenceEngine>,
        input: ModelInput,
        timeout: Option<Duration>,
    ) -> Result<RawOutput, BatchError> {
        let call = tokio::task::spawn_blocking(move || {
            let result = engine.infer(&input);
            (engine, result)
        });
        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(?variant, limit_ms = limit.as_millis() as u64, "inference timed out; discarding session");
                    return Err(InferenceError::timeout(limit).into());
                }
            },
            None => call.await,
        };
        let (engine, result) = joined?;
        match result {
            Ok(output) => {
                sessions.put_back(variant, engine);
                Ok(output)
            }
            Err(e) if e.is_fatal() => {
                warn!(?variant, error = %e, "fatal inference error; session will be rebuilt");
                Err(e.into())
            }
            Err(e) => {
                sessions.put_back(variant, engine);
                Err(e.into())
            }
        }
    }
}

/// One frame's share of a decoded batch.
struct FrameJob {
    frame: Frame,
    source: FrameSource,
    original: Option<image::RgbImage>,
    detections: Vec<Detection>,
    load_error: Option<String>,
}

/// Runs `finish_frame` so that a panic fails only the frame that raised it. Frames
/// finished before it keep their committed outcome.
fn finish_frame_isolated(
    worker: usize,
    context: &WorkerContext,
    states: &WorkerStates,
    model_version: &str,
    base_metrics: &Metrics,
    job: FrameJob,
) -> Result<(), String> {
    let name = job.frame.name.clone();
    panic::catch_unwind(AssertUnwindSafe(|| {
        finish_frame(worker, context, states, model_version, base_metrics, job)
    }))
    .unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        error!(worker, frame = %name, error = %message, "frame processing panicked");
        Err(format!("processing {name} panicked: {message}"))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Redacts, writes back and commits one frame. Runs on a blocking thread.
fn finish_frame(
    worker: usize,
    context: &WorkerContext,
    states: &WorkerStates,
    model_version: &str,
    base_metrics: &Metrics,
    job: FrameJob,
) -> Result<(), String> {
    let FrameJob {
        frame,
        source,
        original,
        detections,
        load_error,
    } = job;
    if let Some(message) = load_error {
        return Err(message);
    }
    let mut metrics = base_metrics.clone();

    if !detections.is_empty() {
        let Some(original) = original else {
            return Err(format!("original image of {} missing after assembly", frame.name));
        };
        set_state(states, worker, WorkerState::Redacting);
        let (width, height) = original.dimensions();
        let scale_x = width as f32 / context.config.frame_width as f32;
        let scale_y = height as f32 / context.config.frame_height as f32;
        let boxes: Vec<_> = detections.iter().map(|d| d.bbox.scaled(scale_x, scale_y)).collect();
        let (redacted, strategy) = context.redactor.redact(&original, &boxes, &mut metrics);
        debug!(frame = %frame.name, boxes = boxes.len(), ?strategy, "redacted frame");

        set_state(states, worker, WorkerState::Writing);
        let mut targets = source.write_targets().into_iter();
        if let Some(durable) = targets.next() {
            context
                .redactor
                .write(&redacted, durable, &mut metrics)
                .map_err(|e| format!("failed to write {}: {e}", durable.display()))?;
        }
        for mirror in targets {
            if let Err(e) = context.redactor.write(&redacted, mirror, &mut Metrics::new()) {
                warn!(frame = %frame.name, error = %e, "failed to refresh mirror copy");
            }
        }
    }

    set_state(states, worker, WorkerState::Writing);
    context
        .queue
        .commit(&frame.name, model_version, &detections, &metrics)
        .map_err(|e| format!("failed to commit {}: {e}", frame.name))?;
    debug!(frame = %frame.name, detections = detections.len(), "committed frame");
    Ok(())
}
