use super::batch::Batch;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// Queue depth counters readable without taking the queue lock.
#[derive(Debug, Default)]
pub struct QueueGauge {
    batches: AtomicUsize,
    records: AtomicUsize,
    peak_records: AtomicUsize,
}

impl QueueGauge {
    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn records(&self) -> usize {
        self.records.load(Ordering::Relaxed)
    }

    /// Highest number of queued records observed so far.
    pub fn peak_records(&self) -> usize {
        self.peak_records.load(Ordering::Relaxed)
    }

    fn on_push(&self, records: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        let total = self.records.fetch_add(records, Ordering::Relaxed) + records;
        self.peak_records.fetch_max(total, Ordering::Relaxed);
    }

    fn on_pop(&self, records: usize) {
        self.batches.fetch_sub(1, Ordering::Relaxed);
        self.records.fetch_sub(records, Ordering::Relaxed);
    }
}

struct QueueState<R, P> {
    batches: VecDeque<Batch<R, P>>,
    closed: bool,
}

/// Bounded FIFO between the cursor reader and the workers.
///
/// `push` waits while `capacity` batches are queued. Once closed, pushes are refused and
/// `pop` returns `None` after the remaining batches are handed out.
pub struct BatchQueue<R, P> {
    state: Mutex<QueueState<R, P>>,
    notify: Notify,
    capacity: usize,
    gauge: Arc<QueueGauge>,
}

impl<R, P> BatchQueue<R, P> {
    pub fn new(capacity: usize, gauge: Arc<QueueGauge>) -> Self {
        assert!(capacity > 0, "capacity must be greater than zero");
        Self {
            state: Mutex::new(QueueState {
                batches: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            gauge,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn gauge(&self) -> &Arc<QueueGauge> {
        &self.gauge
    }

    /// Hands the batch back if the queue was closed before it could be enqueued.
    pub async fn push(&self, batch: Batch<R, P>) -> Result<(), Batch<R, P>> {
        loop {
            let notified = self.notify.notified();
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(batch);
            }
            if state.batches.len() < self.capacity {
                self.gauge.on_push(batch.len());
                state.batches.push_back(batch);
                drop(state);
                self.notify.notify_waiters();
                return Ok(());
            }
            drop(state);
            notified.await;
        }
    }

    pub async fn pop(&self) -> Option<Batch<R, P>> {
        loop {
            let notified = self.notify.notified();
            let mut state = self.state.lock().await;
            if let Some(batch) = state.batches.pop_front() {
                self.gauge.on_pop(batch.len());
                drop(state);
                self.notify.notify_waiters();
                return Some(batch);
            }
            if state.closed {
                return None;
            }
            drop(state);
            notified.await;
        }
    }

    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Removes every queued batch without handing it to a worker.
    pub async fn drain(&self) -> Vec<Batch<R, P>> {
        let mut state = self.state.lock().await;
        let drained: Vec<_> = state.batches.drain(..).collect();
        for batch in &drained {
            self.gauge.on_pop(batch.len());
        }
        drop(state);
        self.notify.notify_waiters();
        drained
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.batches.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.batches.is_empty()
    }
}
