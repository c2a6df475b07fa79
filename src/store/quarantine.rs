//! Durable side storage for batches that could not be committed.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a batch ended up in quarantine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    /// Transient sink failures outlived the retry budget.
    TransientExhausted,
    /// The sink classified the failure as permanent.
    PermanentSink,
    /// The transform refused the batch.
    TransformRejected,
}

/// Persisted artifact describing one quarantined batch. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub run_id: Uuid,
    pub batch_id: u64,
    /// Source records of the batch, serialized as a JSON array.
    pub records: serde_json::Value,
    pub error_kind: QuarantineReason,
    pub error_message: String,
    /// Sink write attempts made before giving up (0 when the transform rejected the batch).
    pub attempts: u32,
    pub quarantined_at: DateTime<Utc>,
}

impl QuarantineRecord {
    pub fn new<R: Serialize>(
        run_id: Uuid,
        batch_id: u64,
        records: &[R],
        error_kind: QuarantineReason,
        error_message: impl Into<String>,
        attempts: u32,
    ) -> Result<Self> {
        let records = serde_json::to_value(records)
            .with_context(|| format!("failed to serialize records of batch {batch_id}"))?;
        Ok(Self {
            run_id,
            batch_id,
            records,
            error_kind,
            error_message: error_message.into(),
            attempts,
            quarantined_at: Utc::now(),
        })
    }

    pub fn record_count(&self) -> usize {
        self.records.as_array().map(Vec::len).unwrap_or(0)
    }

    pub fn decode_records<R: DeserializeOwned>(&self) -> Result<Vec<R>> {
        serde_json::from_value(self.records.clone()).with_context(|| {
            format!(
                "failed to decode quarantined records of run {} batch {}",
                self.run_id, self.batch_id
            )
        })
    }
}

/// Storage for quarantined batches.
///
/// `record` must not return before the record is durable. Replay resolution is tracked
/// separately so the original record stays intact for audit.
pub trait QuarantineStore: Send + Sync + 'static {
    fn record(&self, record: QuarantineRecord) -> BoxFuture<'_, Result<()>>;

    /// Records that have not been successfully replayed, in quarantine order.
    fn list_pending(&self) -> BoxFuture<'_, Result<Vec<QuarantineRecord>>>;

    /// Looks up a pending record.
    fn get(&self, run_id: Uuid, batch_id: u64) -> BoxFuture<'_, Result<Option<QuarantineRecord>>>;

    fn mark_replayed(&self, run_id: Uuid, batch_id: u64) -> BoxFuture<'_, Result<()>>;
}
