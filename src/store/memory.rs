//! In-memory store implementations. Useful for tests and for embedding the pipeline
//! where durability is provided elsewhere.

use super::quarantine::{QuarantineRecord, QuarantineStore};
use super::sink::{SinkError, SinkStore};
use super::source::{Page, SourceError, SourceRecord, SourceStore};
use super::state::{Checkpoint, StateStore};
use crate::runtime::progress::RunState;
use anyhow::Result;
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Source over a fixed vector of records. Positions are record offsets.
#[derive(Debug)]
pub struct MemorySource<R> {
    records: Arc<Vec<R>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

#[derive(Debug)]
pub struct MemoryCursor {
    offset: usize,
}

impl<R> MemorySource<R> {
    pub fn new(records: Vec<R>) -> Self {
        Self {
            records: Arc::new(records),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn opened_cursors(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed_cursors(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<R: SourceRecord + Clone> SourceStore for MemorySource<R> {
    type Record = R;
    type Position = usize;
    type Handle = MemoryCursor;

    fn open_cursor<'a>(
        &'a self,
        _query: &'a str,
        resume_from: Option<usize>,
    ) -> BoxFuture<'a, Result<MemoryCursor, SourceError>> {
        Box::pin(async move {
            let offset = resume_from.unwrap_or(0);
            if offset > self.records.len() {
                return Err(SourceError::Corrupt(format!(
                    "resume offset {offset} is past the end of the source ({} records)",
                    self.records.len()
                )));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(MemoryCursor { offset })
        })
    }

    fn fetch_batch<'a>(
        &'a self,
        handle: &'a mut MemoryCursor,
        desired: usize,
    ) -> BoxFuture<'a, Result<Page<R, usize>, SourceError>> {
        Box::pin(async move {
            let start = handle.offset.min(self.records.len());
            let end = start.saturating_add(desired).min(self.records.len());
            let records = self.records[start..end].to_vec();
            handle.offset = end;
            Ok(Page {
                records,
                position: end,
                exhausted: end == self.records.len(),
            })
        })
    }

    fn position(&self, handle: &MemoryCursor) -> usize {
        handle.offset
    }

    fn close_cursor(&self, _handle: MemoryCursor) -> BoxFuture<'_, Result<(), SourceError>> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// Sink that appends every committed batch to a vector.
#[derive(Debug)]
pub struct MemorySink<R> {
    records: Mutex<Vec<R>>,
    writes: AtomicUsize,
}

impl<R> Default for MemorySink<R> {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            writes: AtomicUsize::new(0),
        }
    }
}

impl<R: Clone> MemorySink<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<R> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful bulk writes.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl<R: Clone + Send + Sync + 'static> SinkStore for MemorySink<R> {
    type Record = R;

    fn bulk_write<'a>(&'a self, records: &'a [R]) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            self.records.lock().unwrap().extend_from_slice(records);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryQuarantineStore {
    records: Mutex<Vec<QuarantineRecord>>,
    replayed: Mutex<HashSet<(Uuid, u64)>>,
}

impl MemoryQuarantineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record ever quarantined, including replayed ones.
    pub fn all(&self) -> Vec<QuarantineRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl QuarantineStore for MemoryQuarantineStore {
    fn record(&self, record: QuarantineRecord) -> BoxFuture<'_, Result<()>> {
        self.records.lock().unwrap().push(record);
        Box::pin(async { Ok(()) })
    }

    fn list_pending(&self) -> BoxFuture<'_, Result<Vec<QuarantineRecord>>> {
        let replayed = self.replayed.lock().unwrap().clone();
        let pending = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|record| !replayed.contains(&(record.run_id, record.batch_id)))
            .cloned()
            .collect();
        Box::pin(async move { Ok(pending) })
    }

    fn get(&self, run_id: Uuid, batch_id: u64) -> BoxFuture<'_, Result<Option<QuarantineRecord>>> {
        let replayed = self.replayed.lock().unwrap().contains(&(run_id, batch_id));
        let found = if replayed {
            None
        } else {
            self.records
                .lock()
                .unwrap()
                .iter()
                .find(|record| record.run_id == run_id && record.batch_id == batch_id)
                .cloned()
        };
        Box::pin(async move { Ok(found) })
    }

    fn mark_replayed(&self, run_id: Uuid, batch_id: u64) -> BoxFuture<'_, Result<()>> {
        self.replayed.lock().unwrap().insert((run_id, batch_id));
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    history: Mutex<Vec<Checkpoint>>,
    runs: Mutex<HashMap<Uuid, RunState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every checkpoint written, oldest first.
    pub fn checkpoint_history(&self) -> Vec<Checkpoint> {
        self.history.lock().unwrap().clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load_checkpoint<'a>(&'a self, pipeline: &'a str) -> BoxFuture<'a, Result<Option<Checkpoint>>> {
        let checkpoint = self.checkpoints.lock().unwrap().get(pipeline).cloned();
        Box::pin(async move { Ok(checkpoint) })
    }

    fn save_checkpoint<'a>(&'a self, checkpoint: &'a Checkpoint) -> BoxFuture<'a, Result<()>> {
        self.checkpoints
            .lock()
            .unwrap()
            .insert(checkpoint.pipeline.clone(), checkpoint.clone());
        self.history.lock().unwrap().push(checkpoint.clone());
        Box::pin(async { Ok(()) })
    }

    fn save_run_state<'a>(&'a self, state: &'a RunState) -> BoxFuture<'a, Result<()>> {
        self.runs
            .lock()
            .unwrap()
            .insert(state.run_id, state.clone());
        Box::pin(async { Ok(()) })
    }

    fn load_run_state(&self, run_id: Uuid) -> BoxFuture<'_, Result<Option<RunState>>> {
        let state = self.runs.lock().unwrap().get(&run_id).cloned();
        Box::pin(async move { Ok(state) })
    }
}
