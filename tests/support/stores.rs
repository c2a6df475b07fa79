//! Fault-injecting stores and transforms for pipeline tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use cursorflow::{
    Checkpoint, MemorySink, MemorySource, MemoryStateStore, Page, QuarantineRecord, QuarantineStore, RunState,
    SinkError, SinkStore, SourceError, SourceStore, StateStore, Transform, TransformError,
};
use futures::future::{self, BoxFuture};
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Sink over `u64` records with configurable failure modes. Batches are identified by
/// their first record.
#[derive(Default)]
pub struct FaultySink {
    committed: Mutex<Vec<u64>>,
    batch_sizes: Mutex<Vec<usize>>,
    attempts: Mutex<HashMap<u64, u32>>,
    writes: AtomicUsize,
    poison: HashSet<u64>,
    transient_failures: u32,
    always_transient: bool,
    delay: Duration,
}

impl FaultySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any batch containing one of `ids` fails permanently.
    pub fn poison(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.poison.extend(ids);
        self
    }

    /// Every batch fails transiently `count` times before it is accepted.
    pub fn transient_failures(mut self, count: u32) -> Self {
        self.transient_failures = count;
        self
    }

    pub fn always_transient(mut self) -> Self {
        self.always_transient = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn committed(&self) -> Vec<u64> {
        self.committed.lock().unwrap().clone()
    }

    /// Sizes of accepted batches, in commit order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    /// Bulk write calls, successful or not.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SinkStore for FaultySink {
    type Record = u64;

    fn bulk_write<'a>(&'a self, records: &'a [u64]) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }

            if records.iter().any(|id| self.poison.contains(id)) {
                return Err(SinkError::permanent("constraint violated"));
            }
            if self.always_transient {
                return Err(SinkError::transient("store unavailable"));
            }
            if self.transient_failures > 0 {
                let key = records.first().copied().unwrap_or_default();
                let mut attempts = self.attempts.lock().unwrap();
                let seen = attempts.entry(key).or_default();
                *seen += 1;
                if *seen <= self.transient_failures {
                    return Err(SinkError::transient("throttled"));
                }
            }

            self.committed.lock().unwrap().extend_from_slice(records);
            self.batch_sizes.lock().unwrap().push(records.len());
            Ok(())
        })
    }
}

/// Wraps a sink and cancels `token` once `threshold` records have been accepted.
pub struct CancelAfter<K> {
    inner: Arc<K>,
    written: AtomicU64,
    threshold: u64,
    token: CancellationToken,
}

impl<K> CancelAfter<K> {
    pub fn new(inner: Arc<K>, threshold: u64, token: CancellationToken) -> Self {
        Self {
            inner,
            written: AtomicU64::new(0),
            threshold,
            token,
        }
    }
}

impl<K: SinkStore> SinkStore for CancelAfter<K> {
    type Record = K::Record;

    fn bulk_write<'a>(
        &'a self,
        records: &'a [K::Record],
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            self.inner.bulk_write(records).await?;
            let total = self
                .written
                .fetch_add(records.len() as u64, Ordering::SeqCst)
                + records.len() as u64;
            if total >= self.threshold {
                self.token.cancel();
            }
            Ok(())
        })
    }
}

/// Holds every write until [`GatedSink::release`] is called.
#[derive(Default)]
pub struct GatedSink {
    committed: Mutex<Vec<Vec<u64>>>,
    entered: AtomicUsize,
    open: AtomicBool,
    gate: Notify,
}

impl GatedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.gate.notify_waiters();
    }

    /// Committed batches, each kept whole.
    pub fn committed_batches(&self) -> Vec<Vec<u64>> {
        self.committed.lock().unwrap().clone()
    }

    pub async fn wait_for_entered(&self, expected: usize, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            let entered = self.entered.load(Ordering::SeqCst);
            if entered >= expected {
                return Ok(());
            }
            if start.elapsed() > timeout {
                bail!("only {entered} of {expected} writes reached the gate within {timeout:?}");
            }
            sleep(Duration::from_millis(5)).await;
        }
    }
}

impl SinkStore for GatedSink {
    type Record = u64;

    fn bulk_write<'a>(&'a self, records: &'a [u64]) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            self.entered.fetch_add(1, Ordering::SeqCst);
            loop {
                let notified = self.gate.notified();
                if self.open.load(Ordering::SeqCst) {
                    break;
                }
                notified.await;
            }
            self.committed.lock().unwrap().push(records.to_vec());
            Ok(())
        })
    }
}

/// Memory sink that never finishes writing a batch whose first record is held.
pub struct HoldingSink {
    inner: Arc<MemorySink<u64>>,
    held: HashSet<u64>,
}

impl HoldingSink {
    pub fn new(inner: Arc<MemorySink<u64>>, held: impl IntoIterator<Item = u64>) -> Self {
        Self {
            inner,
            held: held.into_iter().collect(),
        }
    }
}

impl SinkStore for HoldingSink {
    type Record = u64;

    fn bulk_write<'a>(&'a self, records: &'a [u64]) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            if records.first().is_some_and(|first| self.held.contains(first)) {
                return future::pending().await;
            }
            self.inner.bulk_write(records).await
        })
    }
}

/// Memory source that stops answering once `stall_after` records have been handed out.
pub struct StallingSource {
    inner: MemorySource<u64>,
    stall_after: usize,
}

impl StallingSource {
    pub fn new(records: Vec<u64>, stall_after: usize) -> Self {
        Self {
            inner: MemorySource::new(records),
            stall_after,
        }
    }

    pub fn closed_cursors(&self) -> usize {
        self.inner.closed_cursors()
    }
}

impl SourceStore for StallingSource {
    type Record = u64;
    type Position = usize;
    type Handle = <MemorySource<u64> as SourceStore>::Handle;

    fn open_cursor<'a>(
        &'a self,
        query: &'a str,
        resume_from: Option<usize>,
    ) -> BoxFuture<'a, Result<Self::Handle, SourceError>> {
        self.inner.open_cursor(query, resume_from)
    }

    fn fetch_batch<'a>(
        &'a self,
        handle: &'a mut Self::Handle,
        desired: usize,
    ) -> BoxFuture<'a, Result<Page<u64, usize>, SourceError>> {
        if self.inner.position(handle) >= self.stall_after {
            return Box::pin(future::pending());
        }
        self.inner.fetch_batch(handle, desired)
    }

    fn position(&self, handle: &Self::Handle) -> usize {
        self.inner.position(handle)
    }

    fn close_cursor(&self, handle: Self::Handle) -> BoxFuture<'_, Result<(), SourceError>> {
        self.inner.close_cursor(handle)
    }
}

/// Source whose cursor can never be opened.
#[derive(Default)]
pub struct UnreachableSource {
    pub open_attempts: AtomicUsize,
}

impl SourceStore for UnreachableSource {
    type Record = u64;
    type Position = usize;
    type Handle = ();

    fn open_cursor<'a>(
        &'a self,
        _query: &'a str,
        _resume_from: Option<usize>,
    ) -> BoxFuture<'a, Result<(), SourceError>> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(SourceError::Unavailable("connection refused".into())) })
    }

    fn fetch_batch<'a>(
        &'a self,
        _handle: &'a mut (),
        _desired: usize,
    ) -> BoxFuture<'a, Result<Page<u64, usize>, SourceError>> {
        Box::pin(async { Err(SourceError::Unavailable("connection refused".into())) })
    }

    fn position(&self, _handle: &()) -> usize {
        0
    }

    fn close_cursor(&self, _handle: ()) -> BoxFuture<'_, Result<(), SourceError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Passes records through but panics on a batch containing `trigger`.
pub struct PanickingTransform {
    pub trigger: u64,
}

impl Transform for PanickingTransform {
    type Input = u64;
    type Output = u64;

    fn transform<'a>(&'a self, records: &'a [u64]) -> BoxFuture<'a, Result<Vec<u64>, TransformError>> {
        Box::pin(async move {
            if records.contains(&self.trigger) {
                panic!("transform blew up on record {}", self.trigger);
            }
            Ok(records.to_vec())
        })
    }
}

/// Quarantine store whose writes always fail.
#[derive(Default)]
pub struct BrokenQuarantineStore;

impl QuarantineStore for BrokenQuarantineStore {
    fn record(&self, _record: QuarantineRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { bail!("quarantine volume is read-only") })
    }

    fn list_pending(&self) -> BoxFuture<'_, Result<Vec<QuarantineRecord>>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn get(&self, _run_id: Uuid, _batch_id: u64) -> BoxFuture<'_, Result<Option<QuarantineRecord>>> {
        Box::pin(async { Ok(None) })
    }

    fn mark_replayed(&self, _run_id: Uuid, _batch_id: u64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// State store whose checkpoint saves start failing after `healthy_saves` succeed. Run
/// state is kept in memory so the failed run can still be inspected.
pub struct FailingCheckpointStore {
    inner: MemoryStateStore,
    healthy_saves: usize,
    saves: AtomicUsize,
}

impl FailingCheckpointStore {
    pub fn new(healthy_saves: usize) -> Self {
        Self {
            inner: MemoryStateStore::new(),
            healthy_saves,
            saves: AtomicUsize::new(0),
        }
    }

    pub fn checkpoint_history(&self) -> Vec<Checkpoint> {
        self.inner.checkpoint_history()
    }
}

impl StateStore for FailingCheckpointStore {
    fn load_checkpoint<'a>(&'a self, pipeline: &'a str) -> BoxFuture<'a, Result<Option<Checkpoint>>> {
        self.inner.load_checkpoint(pipeline)
    }

    fn save_checkpoint<'a>(&'a self, checkpoint: &'a Checkpoint) -> BoxFuture<'a, Result<()>> {
        if self.saves.fetch_add(1, Ordering::SeqCst) < self.healthy_saves {
            return self.inner.save_checkpoint(checkpoint);
        }
        Box::pin(async { bail!("state volume is full") })
    }

    fn save_run_state<'a>(&'a self, state: &'a RunState) -> BoxFuture<'a, Result<()>> {
        self.inner.save_run_state(state)
    }

    fn load_run_state(&self, run_id: Uuid) -> BoxFuture<'_, Result<Option<RunState>>> {
        self.inner.load_run_state(run_id)
    }
}
