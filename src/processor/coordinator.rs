//! Pipeline orchestration.
//!
//! `Pipeline` owns configuration and the store handles; each call to [`Pipeline::start`]
//! spawns one run that walks `Idle → Running → {Completed, Failed, Cancelled}`:
//! - the read loop (this module) turns cursor pages into batches and pushes them onto the
//!   bounded queue, resizing batches from worker latency feedback;
//! - `worker_pool` owns the worker tasks and the drain/grace/abort sequence;
//! - `lifecycle` wires the run-scoped tokens, the metrics reporter, and fatal error capture.

use super::backoff::RetryPolicy;
use super::lifecycle::{LifecycleHandles, LifecycleSpawnParams};
use super::worker::{BatchExecutor, BatchOutcome, WorkerActivityTracker, WorkerShared};
use super::worker_pool::WorkerPool;
use crate::batching::batch::BatchFeedback;
use crate::batching::checkpoint::CheckpointWriter;
use crate::batching::cursor::{CursorReader, Fetch, PipelineError};
use crate::batching::queue::{BatchQueue, QueueGauge};
use crate::batching::sizer::AdaptiveBatcher;
use crate::runtime::config::PipelineConfig;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::progress::{FailureKind, ProgressTracker, RunFailure, RunState, RunStatus};
use crate::runtime::telemetry::Telemetry;
use crate::runtime::transform::Transform;
use crate::store::{QuarantineReason, QuarantineStore, SinkStore, SourceStore, StateStore};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Store handles and business logic a pipeline runs against.
pub struct PipelineParts<S, T, K> {
    pub source: Arc<S>,
    pub transform: Arc<T>,
    pub sink: Arc<K>,
    pub quarantine: Arc<dyn QuarantineStore>,
    pub state: Arc<dyn StateStore>,
}

impl<S, T, K> Clone for PipelineParts<S, T, K> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            transform: Arc::clone(&self.transform),
            sink: Arc::clone(&self.sink),
            quarantine: Arc::clone(&self.quarantine),
            state: Arc::clone(&self.state),
        }
    }
}

pub struct Pipeline<S, T, K> {
    config: PipelineConfig,
    parts: PipelineParts<S, T, K>,
    shutdown_root: CancellationToken,
    telemetry: Arc<Telemetry>,
}

impl<S, T, K> Pipeline<S, T, K>
where
    S: SourceStore,
    T: Transform<Input = S::Record>,
    K: SinkStore<Record = T::Output>,
{
    /// Creates a pipeline with its own root cancellation token. Use
    /// [`Self::with_cancellation_token`] to integrate with an existing shutdown mechanism.
    pub fn new(config: PipelineConfig, parts: PipelineParts<S, T, K>) -> Self {
        Self::with_cancellation_token(config, parts, CancellationToken::new())
    }

    /// Every run derives its cancellation token from `shutdown_token`.
    pub fn with_cancellation_token(
        config: PipelineConfig,
        parts: PipelineParts<S, T, K>,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            parts,
            shutdown_root: shutdown_token,
            telemetry: Arc::new(Telemetry::default()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown_root.clone()
    }

    /// Returns a clone of the telemetry handle for observability.
    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Spawns a run over `query` and returns immediately.
    pub fn start(&self, query: impl Into<String>) -> RunHandle {
        let run_id = Uuid::new_v4();
        let run_token = self.shutdown_root.child_token();
        let gauge = Arc::new(QueueGauge::default());
        let progress = Arc::new(ProgressTracker::new(
            run_id,
            self.config.pipeline_name(),
            gauge.clone(),
        ));

        let context = RunContext {
            config: self.config.clone(),
            parts: self.parts.clone(),
            query: query.into(),
            run_token: run_token.clone(),
            progress: progress.clone(),
            gauge,
            telemetry: self.telemetry.clone(),
        };
        let task = tokio::spawn(context.run());

        RunHandle {
            progress,
            cancel: run_token,
            task,
        }
    }

    /// Starts a run and waits for its terminal state.
    pub async fn run(&self, query: impl Into<String>) -> Result<RunState> {
        self.start(query).wait().await
    }

    pub fn replayer(&self) -> QuarantineReplayer<T, K> {
        QuarantineReplayer::new(
            self.parts.transform.clone(),
            self.parts.sink.clone(),
            self.parts.quarantine.clone(),
            self.config.write_retry_policy(),
            self.config.write_timeout(),
            self.telemetry.clone(),
        )
    }

    /// Re-submits one quarantined batch through the transform, sink, and retry path.
    pub async fn replay_quarantined(&self, run_id: Uuid, batch_id: u64) -> Result<ReplayOutcome> {
        self.replayer()
            .replay(run_id, batch_id, &self.shutdown_root)
            .await
    }
}

/// Handle to a run spawned by [`Pipeline::start`].
pub struct RunHandle {
    progress: Arc<ProgressTracker>,
    cancel: CancellationToken,
    task: JoinHandle<RunState>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.progress.run_id()
    }

    pub fn status(&self) -> RunStatus {
        self.progress.status()
    }

    /// Point-in-time progress of the run.
    pub fn progress(&self) -> RunState {
        self.progress.snapshot()
    }

    pub fn progress_tracker(&self) -> Arc<ProgressTracker> {
        self.progress.clone()
    }

    /// Requests a graceful stop: reading stops, in-flight batches drain.
    pub fn cancel(&self) {
        self.progress.begin_cancelling();
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<RunState> {
        self.task.await.context("pipeline run task panicked")
    }
}

enum ReadOutcome {
    EndOfStream,
    Cancelled,
}

struct RunContext<S, T, K> {
    config: PipelineConfig,
    parts: PipelineParts<S, T, K>,
    query: String,
    run_token: CancellationToken,
    progress: Arc<ProgressTracker>,
    gauge: Arc<QueueGauge>,
    telemetry: Arc<Telemetry>,
}

impl<S, T, K> RunContext<S, T, K>
where
    S: SourceStore,
    T: Transform<Input = S::Record>,
    K: SinkStore<Record = T::Output>,
{
    async fn run(self) -> RunState {
        self.progress.mark_running();
        tracing::info!(
            run_id = %self.progress.run_id(),
            pipeline = self.config.pipeline_name(),
            concurrency = self.config.concurrency(),
            "pipeline run started"
        );

        let lifecycle = LifecycleHandles::spawn(LifecycleSpawnParams {
            run_token: self.run_token.clone(),
            telemetry: self.telemetry.clone(),
            progress: self.progress.clone(),
            state: self.parts.state.clone(),
            metrics_interval: self.config.metrics_interval(),
        });
        let fatal_handler = lifecycle.fatal_handler();

        let reached_end = self.drive(&lifecycle, &fatal_handler).await;
        lifecycle.shutdown().await;
        self.conclude(reached_end, &fatal_handler).await
    }

    /// Returns `true` when the read loop reached end of stream.
    async fn drive(
        &self,
        lifecycle: &LifecycleHandles,
        fatal_handler: &Arc<FatalErrorHandler>,
    ) -> bool {
        let (resume_from, accounted_records) = match self.load_resume_point().await {
            Ok(resume) => resume,
            Err(err) => {
                fatal_handler.trigger(
                    FailureKind::Infrastructure,
                    "failed to load resume checkpoint",
                    err,
                );
                return false;
            }
        };

        let mut reader = match CursorReader::open(
            self.parts.source.clone(),
            &self.query,
            resume_from,
            self.config.source_retry_policy(),
            self.telemetry.clone(),
            &self.run_token,
        )
        .await
        {
            Ok(reader) => reader,
            Err(PipelineError::Interrupted) => return false,
            Err(err) => {
                fatal_handler.trigger(err.failure_kind(), "failed to open source cursor", err.into());
                return false;
            }
        };

        let queue = Arc::new(BatchQueue::new(
            self.config.queue_capacity(),
            self.gauge.clone(),
        ));
        let (feedback_tx, mut feedback_rx) = mpsc::channel(self.config.feedback_capacity());
        let shared: WorkerShared<S, T, K> = WorkerShared {
            run_id: self.progress.run_id(),
            executor: BatchExecutor::new(
                self.parts.transform.clone(),
                self.parts.sink.clone(),
                self.config.write_retry_policy(),
                self.config.write_timeout(),
                self.telemetry.clone(),
            ),
            queue: queue.clone(),
            quarantine: self.parts.quarantine.clone(),
            checkpoints: Arc::new(CheckpointWriter::new(
                self.config.pipeline_name(),
                self.progress.run_id(),
                accounted_records,
                self.parts.state.clone(),
            )),
            progress: self.progress.clone(),
            activity: Arc::new(WorkerActivityTracker::default()),
            feedback: feedback_tx,
        };
        let pool = WorkerPool::launch(
            self.config.concurrency(),
            shared,
            lifecycle.run_token.clone(),
            lifecycle.abort_token.clone(),
            fatal_handler.clone(),
        );

        let mut batcher = AdaptiveBatcher::new(
            self.config.sizing(),
            self.config.min_batch_size(),
            self.config.max_batch_size(),
        );
        let read_result = self
            .read_loop(&mut reader, &queue, &mut batcher, &mut feedback_rx)
            .await;
        queue.close().await;

        let reached_end = match read_result {
            Ok(ReadOutcome::EndOfStream) => {
                tracing::info!(
                    batches = reader.next_batch_id(),
                    position = ?reader.position(),
                    "source exhausted; waiting for workers"
                );
                true
            }
            Ok(ReadOutcome::Cancelled) => {
                if !fatal_handler.is_triggered() {
                    self.progress.begin_cancelling();
                }
                false
            }
            Err(err) => {
                fatal_handler.trigger(err.failure_kind(), "source read failed", err.into());
                false
            }
        };

        let progress = self.progress.clone();
        let fatal = fatal_handler.clone();
        let drained = pool
            .join(
                &lifecycle.run_token,
                &lifecycle.abort_token,
                self.config.grace_timeout(),
                move || {
                    if !fatal.is_triggered() {
                        progress.begin_cancelling();
                    }
                },
            )
            .await;

        let leftover = queue.drain().await;
        if !leftover.is_empty() || !drained {
            let records: usize = leftover.iter().map(|batch| batch.len()).sum();
            tracing::info!(
                undispatched_batches = leftover.len(),
                undispatched_records = records,
                drained_in_time = drained,
                "run stopped with batches left for the next run"
            );
        }

        if let Err(err) = reader.close().await {
            tracing::warn!(error = %err, "failed to close source cursor");
        }
        reached_end
    }

    async fn load_resume_point(&self) -> Result<(Option<S::Position>, u64)> {
        let checkpoint = self
            .parts
            .state
            .load_checkpoint(self.config.pipeline_name())
            .await?;
        let Some(checkpoint) = checkpoint else {
            return Ok((None, 0));
        };

        let position: S::Position = serde_json::from_value(checkpoint.position.clone())
            .with_context(|| {
                format!(
                    "checkpoint of pipeline {} holds an unreadable position",
                    checkpoint.pipeline
                )
            })?;
        tracing::info!(
            position = ?position,
            committed_records = checkpoint.committed_records,
            previous_run = %checkpoint.run_id,
            "resuming from checkpoint"
        );
        Ok((Some(position), checkpoint.committed_records))
    }

    async fn read_loop(
        &self,
        reader: &mut CursorReader<S>,
        queue: &BatchQueue<S::Record, S::Position>,
        batcher: &mut AdaptiveBatcher,
        feedback_rx: &mut mpsc::Receiver<BatchFeedback>,
    ) -> Result<ReadOutcome, PipelineError> {
        loop {
            if self.run_token.is_cancelled() {
                return Ok(ReadOutcome::Cancelled);
            }

            while let Ok(feedback) = feedback_rx.try_recv() {
                batcher.next_size(feedback.latency, feedback.records);
            }
            let size = batcher.current_size();
            self.progress.set_current_batch_size(size);

            let batch = match reader.fetch_next(size, &self.run_token).await {
                Ok(Fetch::Batch(batch)) => batch,
                Ok(Fetch::EndOfStream) => return Ok(ReadOutcome::EndOfStream),
                Err(PipelineError::Interrupted) => return Ok(ReadOutcome::Cancelled),
                Err(err) => return Err(err),
            };

            let batch_id = batch.id();
            let records = batch.len();
            // Emitted before the push so no worker can report an outcome for an uncounted batch.
            self.progress.record_emitted(1, records as u64);
            let pushed = tokio::select! {
                biased;
                _ = self.run_token.cancelled() => false,
                result = queue.push(batch) => result.is_ok(),
            };
            if !pushed {
                return Ok(ReadOutcome::Cancelled);
            }
            tracing::trace!(batch_id, records, batch_size = size, "batch dispatched");
        }
    }

    async fn conclude(&self, reached_end: bool, fatal_handler: &FatalErrorHandler) -> RunState {
        let snapshot = self.progress.snapshot();
        let (status, failure) = if let Some(failure) = fatal_handler.failure() {
            (RunStatus::Failed, Some(failure))
        } else if reached_end && snapshot.in_flight_records == 0 {
            (RunStatus::Completed, None)
        } else if reached_end && !self.run_token.is_cancelled() {
            let failure = RunFailure {
                kind: FailureKind::InvariantViolation,
                message: format!(
                    "{} record(s) unaccounted for after end of stream",
                    snapshot.in_flight_records
                ),
            };
            (RunStatus::Failed, Some(failure))
        } else {
            (RunStatus::Cancelled, None)
        };

        self.progress.finish(status, failure);
        let state = self.progress.snapshot();
        if let Err(err) = self.parts.state.save_run_state(&state).await {
            tracing::error!(run_id = %state.run_id, error = %err, "failed to persist final run state");
        }

        tracing::info!(
            run_id = %state.run_id,
            status = ?state.status,
            emitted = state.emitted_records,
            committed = state.committed_records,
            quarantined = state.quarantined_records,
            in_flight = state.in_flight_records,
            failure = state.failure.as_ref().map(|failure| failure.message.as_str()),
            "pipeline run finished"
        );
        state
    }
}

/// Result of replaying one quarantined batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The batch reached the sink and the quarantine record is marked replayed.
    Committed { records: usize },
    /// The batch failed again; the quarantine record stays pending.
    StillFailing {
        reason: QuarantineReason,
        message: String,
    },
    /// No pending record for that run and batch.
    NotFound,
}

/// Replays quarantined batches through the same transform/sink/retry path the workers use.
pub struct QuarantineReplayer<T: Transform, K> {
    executor: BatchExecutor<T, K>,
    quarantine: Arc<dyn QuarantineStore>,
}

impl<T, K> QuarantineReplayer<T, K>
where
    T: Transform,
    K: SinkStore<Record = T::Output>,
{
    pub fn new(
        transform: Arc<T>,
        sink: Arc<K>,
        quarantine: Arc<dyn QuarantineStore>,
        retry: RetryPolicy,
        write_timeout: Duration,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            executor: BatchExecutor::new(transform, sink, retry, write_timeout, telemetry),
            quarantine,
        }
    }

    pub async fn replay(
        &self,
        run_id: Uuid,
        batch_id: u64,
        cancel: &CancellationToken,
    ) -> Result<ReplayOutcome> {
        let Some(record) = self.quarantine.get(run_id, batch_id).await? else {
            return Ok(ReplayOutcome::NotFound);
        };
        let records: Vec<T::Input> = record.decode_records()?;

        match self.executor.execute(batch_id, &records, cancel).await {
            BatchOutcome::Committed { attempts } => {
                self.quarantine
                    .mark_replayed(run_id, batch_id)
                    .await
                    .with_context(|| {
                        format!("batch {batch_id} of run {run_id} committed but could not be marked replayed")
                    })?;
                tracing::info!(%run_id, batch_id, records = records.len(), attempts, "quarantined batch replayed");
                Ok(ReplayOutcome::Committed {
                    records: records.len(),
                })
            }
            BatchOutcome::Quarantined {
                reason,
                message,
                attempts,
            } => {
                tracing::warn!(%run_id, batch_id, attempts, error = %message, "replayed batch failed again");
                Ok(ReplayOutcome::StillFailing { reason, message })
            }
            BatchOutcome::Aborted { .. } => {
                bail!("replay of batch {batch_id} from run {run_id} was cancelled")
            }
        }
    }
}
