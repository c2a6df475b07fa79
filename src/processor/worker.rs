//! Batch workers: transform, bulk write with retries, and outcome bookkeeping.

use super::backoff::{sleep_with_cancellation, FailureClass, RetryDecision, RetryPolicy, Retryable};
use crate::batching::batch::{Batch, BatchFeedback};
use crate::batching::checkpoint::CheckpointWriter;
use crate::batching::queue::BatchQueue;
use crate::runtime::hooks::HookDecision;
use crate::runtime::progress::ProgressTracker;
use crate::runtime::telemetry::Telemetry;
use crate::runtime::transform::{Transform, TransformError};
use crate::store::{
    QuarantineReason, QuarantineRecord, QuarantineStore, SinkError, SinkStore, SourceStore,
};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why one attempt at a batch failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("bulk write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error(transparent)]
    Transform(#[from] TransformError),
}

impl Retryable for BatchError {
    fn failure_class(&self) -> FailureClass {
        match self {
            BatchError::Sink(err) if err.is_transient() => FailureClass::Transient,
            BatchError::WriteTimeout(_) => FailureClass::Transient,
            BatchError::Sink(_) | BatchError::Transform(_) => FailureClass::Permanent,
        }
    }
}

impl BatchError {
    fn quarantine_reason(&self, decision: RetryDecision) -> QuarantineReason {
        match (self, decision) {
            (BatchError::Transform(_), _) => QuarantineReason::TransformRejected,
            (_, RetryDecision::Exhausted) => QuarantineReason::TransientExhausted,
            _ => QuarantineReason::PermanentSink,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BatchOutcome {
    Committed {
        attempts: u32,
    },
    Quarantined {
        reason: QuarantineReason,
        message: String,
        attempts: u32,
    },
    /// The abort token fired before the batch reached an outcome.
    Aborted {
        attempts: u32,
    },
}

/// Transform + sink + retry policy. Shared by the workers and by quarantine replay.
pub(crate) struct BatchExecutor<T: Transform, K> {
    transform: Arc<T>,
    sink: Arc<K>,
    retry: RetryPolicy,
    write_timeout: Duration,
    telemetry: Arc<Telemetry>,
}

impl<T: Transform, K> Clone for BatchExecutor<T, K> {
    fn clone(&self) -> Self {
        Self {
            transform: Arc::clone(&self.transform),
            sink: Arc::clone(&self.sink),
            retry: self.retry,
            write_timeout: self.write_timeout,
            telemetry: Arc::clone(&self.telemetry),
        }
    }
}

impl<T, K> BatchExecutor<T, K>
where
    T: Transform,
    K: SinkStore<Record = T::Output>,
{
    pub(crate) fn new(
        transform: Arc<T>,
        sink: Arc<K>,
        retry: RetryPolicy,
        write_timeout: Duration,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            transform,
            sink,
            retry,
            write_timeout,
            telemetry,
        }
    }

    /// Runs one batch to an outcome. `abort` interrupts the transform and backoff sleeps; a
    /// bulk write that has started always runs to completion or timeout.
    pub(crate) async fn execute(
        &self,
        batch_id: u64,
        records: &[T::Input],
        abort: &CancellationToken,
    ) -> BatchOutcome {
        let transformed = tokio::select! {
            biased;
            _ = abort.cancelled() => HookDecision::Cancelled,
            result = self.transform.transform(records) => HookDecision::Finished(result),
        };
        let output = match transformed {
            HookDecision::Cancelled => return BatchOutcome::Aborted { attempts: 0 },
            HookDecision::Finished(Ok(output)) => output,
            HookDecision::Finished(Err(err)) => {
                let err = BatchError::from(err);
                return BatchOutcome::Quarantined {
                    reason: err.quarantine_reason(RetryDecision::GiveUp),
                    message: err.to_string(),
                    attempts: 0,
                };
            }
        };

        if output.is_empty() {
            return BatchOutcome::Committed { attempts: 0 };
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.telemetry.record_write_attempt();
            let error = match timeout(self.write_timeout, self.sink.bulk_write(&output)).await {
                Ok(Ok(())) => return BatchOutcome::Committed { attempts: attempt },
                Ok(Err(err)) => BatchError::Sink(err),
                Err(_) => {
                    self.telemetry.record_write_timeout();
                    BatchError::WriteTimeout(self.write_timeout)
                }
            };

            let decision = self.retry.decide(attempt, &error);
            match decision {
                RetryDecision::RetryAfter(delay) => {
                    self.telemetry.record_write_retry();
                    tracing::warn!(
                        batch_id,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient sink failure; retrying batch"
                    );
                    if sleep_with_cancellation(delay, abort).await.is_err() {
                        return BatchOutcome::Aborted { attempts: attempt };
                    }
                }
                RetryDecision::Exhausted | RetryDecision::GiveUp => {
                    return BatchOutcome::Quarantined {
                        reason: error.quarantine_reason(decision),
                        message: error.to_string(),
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

/// Counts batches currently held by workers.
#[derive(Debug, Default)]
pub(crate) struct WorkerActivityTracker {
    active_batches: AtomicUsize,
}

impl WorkerActivityTracker {
    pub(crate) fn enter(self: &Arc<Self>) -> WorkerActivityGuard {
        self.active_batches.fetch_add(1, Ordering::SeqCst);
        WorkerActivityGuard {
            tracker: Arc::clone(self),
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.active_batches.load(Ordering::SeqCst)
    }
}

pub(crate) struct WorkerActivityGuard {
    tracker: Arc<WorkerActivityTracker>,
}

impl Drop for WorkerActivityGuard {
    fn drop(&mut self) {
        self.tracker.active_batches.fetch_sub(1, Ordering::SeqCst);
    }
}

/// State every worker of a run shares.
pub(crate) struct WorkerShared<S: SourceStore, T: Transform, K> {
    pub(crate) run_id: Uuid,
    pub(crate) executor: BatchExecutor<T, K>,
    pub(crate) queue: Arc<BatchQueue<S::Record, S::Position>>,
    pub(crate) quarantine: Arc<dyn QuarantineStore>,
    pub(crate) checkpoints: Arc<CheckpointWriter<S::Position>>,
    pub(crate) progress: Arc<ProgressTracker>,
    pub(crate) activity: Arc<WorkerActivityTracker>,
    pub(crate) feedback: mpsc::Sender<BatchFeedback>,
}

impl<S: SourceStore, T: Transform, K> Clone for WorkerShared<S, T, K> {
    fn clone(&self) -> Self {
        Self {
            run_id: self.run_id,
            executor: self.executor.clone(),
            queue: Arc::clone(&self.queue),
            quarantine: Arc::clone(&self.quarantine),
            checkpoints: Arc::clone(&self.checkpoints),
            progress: Arc::clone(&self.progress),
            activity: Arc::clone(&self.activity),
            feedback: self.feedback.clone(),
        }
    }
}

pub(crate) struct Worker<S: SourceStore, T: Transform, K> {
    pub(crate) id: usize,
    shared: WorkerShared<S, T, K>,
    cancel: CancellationToken,
    abort: CancellationToken,
}

impl<S, T, K> Worker<S, T, K>
where
    S: SourceStore,
    T: Transform<Input = S::Record>,
    K: SinkStore<Record = T::Output>,
{
    pub(crate) fn new(
        id: usize,
        shared: WorkerShared<S, T, K>,
        cancel: CancellationToken,
        abort: CancellationToken,
    ) -> Self {
        Self {
            id,
            shared,
            cancel,
            abort,
        }
    }

    #[tracing::instrument(name = "worker", skip_all, fields(worker = self.id))]
    pub(crate) async fn run(self) -> Result<()> {
        tracing::debug!("worker task started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                batch = self.shared.queue.pop() => batch,
            };
            let Some(mut batch) = next else {
                break;
            };

            let _active = self.shared.activity.enter();
            batch.mark_in_flight();
            let started = Instant::now();
            let outcome = self
                .shared
                .executor
                .execute(batch.id(), batch.records(), &self.abort)
                .await;

            if let BatchOutcome::Aborted { attempts } = outcome {
                tracing::warn!(
                    batch_id = batch.id(),
                    records = batch.len(),
                    attempts,
                    "grace period expired; batch left in flight"
                );
                break;
            }
            self.finish_batch(&mut batch, outcome, started.elapsed())
                .await?;
        }

        tracing::debug!("worker task exiting");
        Ok(())
    }

    /// Quarantine write, then checkpoint, then feedback and the progress update. A failed
    /// checkpoint save is returned only after the outcome has been counted.
    async fn finish_batch(
        &self,
        batch: &mut Batch<S::Record, S::Position>,
        outcome: BatchOutcome,
        latency: Duration,
    ) -> Result<()> {
        let batch_id = batch.id();
        let records = batch.len() as u64;

        let quarantined = match outcome {
            BatchOutcome::Committed { attempts } => {
                batch.mark_committed();
                tracing::debug!(batch_id, records, attempts, "batch committed");
                false
            }
            BatchOutcome::Quarantined {
                reason,
                message,
                attempts,
            } => {
                let record = QuarantineRecord::new(
                    self.shared.run_id,
                    batch_id,
                    batch.records(),
                    reason,
                    message.clone(),
                    attempts,
                )?;
                self.shared
                    .quarantine
                    .record(record)
                    .await
                    .with_context(|| format!("failed to quarantine batch {batch_id}"))?;
                batch.mark_quarantined();
                tracing::warn!(
                    batch_id,
                    records,
                    attempts,
                    reason = ?reason,
                    error = %message,
                    "batch quarantined"
                );
                true
            }
            BatchOutcome::Aborted { .. } => return Ok(()),
        };

        let checkpointed = self
            .shared
            .checkpoints
            .advance(batch_id, batch.end_position().clone(), records)
            .await;

        let feedback = BatchFeedback {
            batch_id,
            records: batch.len(),
            latency,
        };
        if self.shared.feedback.try_send(feedback).is_err() {
            tracing::trace!(batch_id, "feedback channel full; dropping latency sample");
        }

        if quarantined {
            self.shared.progress.record_quarantined(batch_id, records);
        } else {
            self.shared.progress.record_committed(records);
        }
        checkpointed.map(|_| ())
    }
}
