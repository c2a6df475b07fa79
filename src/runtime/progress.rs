use crate::batching::queue::QueueGauge;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Lifecycle status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    /// Cancellation observed; in-flight batches are draining.
    Cancelling,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Cancelled | RunStatus::Failed
        )
    }

    fn as_u8(self) -> u8 {
        match self {
            RunStatus::Idle => 0,
            RunStatus::Running => 1,
            RunStatus::Cancelling => 2,
            RunStatus::Completed => 3,
            RunStatus::Cancelled => 4,
            RunStatus::Failed => 5,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunStatus::Idle,
            1 => RunStatus::Running,
            2 => RunStatus::Cancelling,
            3 => RunStatus::Completed,
            4 => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        }
    }
}

/// Category of a run-fatal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SourceUnavailable,
    SourceCorrupt,
    CursorClosed,
    /// Quarantine or state store writes failed.
    Infrastructure,
    WorkerPanic,
    /// The run reached end of stream but records are unaccounted for.
    InvariantViolation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Point-in-time view of a run, persisted by the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub pipeline: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub emitted_records: u64,
    pub committed_records: u64,
    pub quarantined_records: u64,
    pub in_flight_records: u64,
    pub emitted_batches: u64,
    pub committed_batches: u64,
    pub quarantined_batches: u64,
    pub quarantined_batch_ids: Vec<u64>,
    pub current_batch_size: usize,
    pub queued_batches: usize,
    pub queued_records: usize,
    pub peak_queued_records: usize,
    pub failure: Option<RunFailure>,
}

impl RunState {
    /// `emitted == committed + quarantined + in_flight`.
    pub fn is_conserved(&self) -> bool {
        self.emitted_records
            == self
                .committed_records
                .saturating_add(self.quarantined_records)
                .saturating_add(self.in_flight_records)
    }
}

/// Process-wide counters for one run. Workers update it concurrently; readers take snapshots.
#[derive(Debug)]
pub struct ProgressTracker {
    run_id: Uuid,
    pipeline: String,
    started_at: DateTime<Utc>,
    status: AtomicU8,
    emitted_records: AtomicU64,
    committed_records: AtomicU64,
    quarantined_records: AtomicU64,
    emitted_batches: AtomicU64,
    committed_batches: AtomicU64,
    quarantined_batches: AtomicU64,
    current_batch_size: AtomicUsize,
    quarantined_batch_ids: Mutex<Vec<u64>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    failure: Mutex<Option<RunFailure>>,
    queue: Arc<QueueGauge>,
}

impl ProgressTracker {
    pub fn new(run_id: Uuid, pipeline: impl Into<String>, queue: Arc<QueueGauge>) -> Self {
        Self {
            run_id,
            pipeline: pipeline.into(),
            started_at: Utc::now(),
            status: AtomicU8::new(RunStatus::Idle.as_u8()),
            emitted_records: AtomicU64::new(0),
            committed_records: AtomicU64::new(0),
            quarantined_records: AtomicU64::new(0),
            emitted_batches: AtomicU64::new(0),
            committed_batches: AtomicU64::new(0),
            quarantined_batches: AtomicU64::new(0),
            current_batch_size: AtomicUsize::new(0),
            quarantined_batch_ids: Mutex::new(Vec::new()),
            finished_at: Mutex::new(None),
            failure: Mutex::new(None),
            queue,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn status(&self) -> RunStatus {
        RunStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub(crate) fn mark_running(&self) -> bool {
        self.transition(RunStatus::Idle, RunStatus::Running)
    }

    /// Moves a running run into the draining state. Returns `false` if it was not running.
    pub(crate) fn begin_cancelling(&self) -> bool {
        self.transition(RunStatus::Running, RunStatus::Cancelling)
    }

    fn transition(&self, from: RunStatus, to: RunStatus) -> bool {
        self.status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn finish(&self, status: RunStatus, failure: Option<RunFailure>) {
        debug_assert!(status.is_terminal(), "finish requires a terminal status");
        *self.failure.lock().unwrap() = failure;
        *self.finished_at.lock().unwrap() = Some(Utc::now());
        self.status.store(status.as_u8(), Ordering::SeqCst);
    }

    pub fn record_emitted(&self, batches: u64, records: u64) {
        self.emitted_batches.fetch_add(batches, Ordering::SeqCst);
        self.emitted_records.fetch_add(records, Ordering::SeqCst);
    }

    pub fn record_committed(&self, records: u64) {
        self.committed_records.fetch_add(records, Ordering::SeqCst);
        self.committed_batches.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_quarantined(&self, batch_id: u64, records: u64) {
        self.quarantined_batch_ids.lock().unwrap().push(batch_id);
        self.quarantined_records.fetch_add(records, Ordering::SeqCst);
        self.quarantined_batches.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn set_current_batch_size(&self, size: usize) {
        self.current_batch_size.store(size, Ordering::Relaxed);
    }

    pub fn committed_records(&self) -> u64 {
        self.committed_records.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> RunState {
        // Outcomes are loaded before emissions so in-flight never goes negative.
        let committed_records = self.committed_records.load(Ordering::SeqCst);
        let quarantined_records = self.quarantined_records.load(Ordering::SeqCst);
        let committed_batches = self.committed_batches.load(Ordering::SeqCst);
        let quarantined_batches = self.quarantined_batches.load(Ordering::SeqCst);
        let emitted_records = self.emitted_records.load(Ordering::SeqCst);
        let emitted_batches = self.emitted_batches.load(Ordering::SeqCst);

        let mut quarantined_batch_ids = self.quarantined_batch_ids.lock().unwrap().clone();
        quarantined_batch_ids.sort_unstable();

        RunState {
            run_id: self.run_id,
            pipeline: self.pipeline.clone(),
            status: self.status(),
            started_at: self.started_at,
            finished_at: *self.finished_at.lock().unwrap(),
            emitted_records,
            committed_records,
            quarantined_records,
            in_flight_records: emitted_records
                .saturating_sub(committed_records)
                .saturating_sub(quarantined_records),
            emitted_batches,
            committed_batches,
            quarantined_batches,
            quarantined_batch_ids,
            current_batch_size: self.current_batch_size.load(Ordering::Relaxed),
            queued_batches: self.queue.batches(),
            queued_records: self.queue.records(),
            peak_queued_records: self.queue.peak_records(),
            failure: self.failure.lock().unwrap().clone(),
        }
    }
}
