//! Contiguous low-watermark over finished batches.
//!
//! Batches finish out of order, but the resume position may only move past a batch once it
//! and every batch before it is committed or quarantined.

use crate::store::{Checkpoint, StateStore};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug)]
pub struct CheckpointTracker<P> {
    next_expected: u64,
    finished: HashMap<u64, (P, u64)>,
    accounted_records: u64,
}

impl<P> CheckpointTracker<P> {
    /// `accounted_records` carries the count from the checkpoint this run resumed from.
    pub fn new(accounted_records: u64) -> Self {
        Self {
            next_expected: 0,
            finished: HashMap::new(),
            accounted_records,
        }
    }

    /// Marks `batch_id` finished. Returns the new watermark position when it moved.
    pub fn complete(&mut self, batch_id: u64, end_position: P, records: u64) -> Option<P> {
        if batch_id < self.next_expected {
            return None;
        }
        self.finished.insert(batch_id, (end_position, records));

        let mut advanced = None;
        loop {
            let expected = self.next_expected;
            let Some((position, records)) = self.finished.remove(&expected) else {
                break;
            };
            self.next_expected += 1;
            self.accounted_records += records;
            advanced = Some(position);
        }
        advanced
    }

    /// First batch id not yet covered by the watermark.
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn accounted_records(&self) -> u64 {
        self.accounted_records
    }

    /// Finished batches waiting on an earlier one.
    pub fn pending(&self) -> usize {
        self.finished.len()
    }
}

/// Persists the watermark. Saves happen under the lock so stored checkpoints never regress.
pub struct CheckpointWriter<P> {
    pipeline: String,
    run_id: Uuid,
    tracker: Mutex<CheckpointTracker<P>>,
    store: Arc<dyn StateStore>,
}

impl<P: Serialize> CheckpointWriter<P> {
    pub fn new(
        pipeline: impl Into<String>,
        run_id: Uuid,
        accounted_records: u64,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            run_id,
            tracker: Mutex::new(CheckpointTracker::new(accounted_records)),
            store,
        }
    }

    pub async fn advance(
        &self,
        batch_id: u64,
        end_position: P,
        records: u64,
    ) -> Result<Option<Checkpoint>> {
        let mut tracker = self.tracker.lock().await;
        let Some(position) = tracker.complete(batch_id, end_position, records) else {
            return Ok(None);
        };

        let checkpoint = Checkpoint {
            pipeline: self.pipeline.clone(),
            run_id: self.run_id,
            position: serde_json::to_value(&position)
                .context("failed to serialize checkpoint position")?,
            committed_records: tracker.accounted_records(),
            updated_at: Utc::now(),
        };
        self.store
            .save_checkpoint(&checkpoint)
            .await
            .with_context(|| format!("failed to save checkpoint after batch {batch_id}"))?;

        tracing::debug!(
            batch_id,
            watermark = tracker.next_expected(),
            accounted = checkpoint.committed_records,
            "checkpoint advanced"
        );
        Ok(Some(checkpoint))
    }
}
