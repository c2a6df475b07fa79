//! Persisted run state: the resume checkpoint and the latest `RunState` of each run.

use crate::runtime::progress::RunState;
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resume point for a pipeline. Only written once every batch up to `position` is
/// committed or quarantined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub pipeline: String,
    pub run_id: Uuid,
    /// Serialized source position.
    pub position: serde_json::Value,
    /// Records accounted for up to `position`, across all runs of the pipeline.
    pub committed_records: u64,
    pub updated_at: DateTime<Utc>,
}

pub trait StateStore: Send + Sync + 'static {
    fn load_checkpoint<'a>(&'a self, pipeline: &'a str) -> BoxFuture<'a, Result<Option<Checkpoint>>>;

    fn save_checkpoint<'a>(&'a self, checkpoint: &'a Checkpoint) -> BoxFuture<'a, Result<()>>;

    fn save_run_state<'a>(&'a self, state: &'a RunState) -> BoxFuture<'a, Result<()>>;

    fn load_run_state(&self, run_id: Uuid) -> BoxFuture<'_, Result<Option<RunState>>>;
}
