use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    InFlight,
    Committed,
    Quarantined,
}

/// Records produced by one fetch. Only `state` changes after construction.
#[derive(Debug, Clone)]
pub struct Batch<R, P> {
    id: u64,
    records: Vec<R>,
    end_position: P,
    state: BatchState,
}

impl<R, P> Batch<R, P> {
    pub fn new(id: u64, records: Vec<R>, end_position: P) -> Self {
        Self {
            id,
            records,
            end_position,
            state: BatchState::Pending,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn records(&self) -> &[R] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Source position right after the last record of the batch.
    pub fn end_position(&self) -> &P {
        &self.end_position
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn mark_in_flight(&mut self) {
        self.move_to(BatchState::Pending, BatchState::InFlight);
    }

    pub fn mark_committed(&mut self) {
        self.move_to(BatchState::InFlight, BatchState::Committed);
    }

    pub fn mark_quarantined(&mut self) {
        self.move_to(BatchState::InFlight, BatchState::Quarantined);
    }

    fn move_to(&mut self, expected: BatchState, next: BatchState) {
        debug_assert_eq!(
            self.state, expected,
            "batch {} cannot move to {next:?} from {:?}",
            self.id, self.state
        );
        self.state = next;
    }
}

/// Latency report a worker sends back to the coordinator after finishing a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchFeedback {
    pub batch_id: u64,
    pub records: usize,
    pub latency: Duration,
}
