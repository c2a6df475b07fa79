use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;

use crate::support::{
    helpers::{assert_conserved, init_tracing, records, test_config, MemoryStores},
    stores::{
        BrokenQuarantineStore, FailingCheckpointStore, FaultySink, PanickingTransform,
        UnreachableSource,
    },
};
use anyhow::{Context, Result};
use chrono::Utc;
use cursorflow::{
    Checkpoint, FailureKind, MemorySink, MemorySource, PassThrough, Pipeline, PipelineParts,
    RunStatus, StateStore,
};
use tokio::time::timeout;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_source_fails_the_run() -> Result<()> {
    init_tracing();
    let stores = MemoryStores::new();
    let source = Arc::new(UnreachableSource::default());
    let config = test_config("unreachable").source_max_attempts(3).build()?;

    let pipeline = Pipeline::new(
        config,
        stores.parts(
            source.clone(),
            Arc::new(PassThrough::<u64>::new()),
            Arc::new(MemorySink::new()),
        ),
    );
    let state = timeout(Duration::from_secs(5), pipeline.run("all"))
        .await
        .context("run should give up")??;

    assert_eq!(state.status, RunStatus::Failed);
    let failure = state.failure.context("failed run records its cause")?;
    assert_eq!(failure.kind, FailureKind::SourceUnavailable);
    assert!(
        failure.message.contains("connection refused"),
        "unexpected failure message: {}",
        failure.message
    );
    assert_eq!(source.open_attempts.load(Ordering::SeqCst), 3);
    assert_eq!(pipeline.telemetry().snapshot().source_retries, 2);
    assert_eq!(state.emitted_records, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_panic_fails_the_run() -> Result<()> {
    init_tracing();
    let stores = MemoryStores::new();
    let source = Arc::new(MemorySource::new(records(200)));
    let config = test_config("panic")
        .concurrency(2)
        .min_batch_size(10)
        .max_batch_size(10)
        .build()?;

    let pipeline = Pipeline::new(
        config,
        stores.parts(
            source.clone(),
            Arc::new(PanickingTransform { trigger: 42 }),
            Arc::new(MemorySink::<u64>::new()),
        ),
    );
    let state = timeout(Duration::from_secs(5), pipeline.run("all"))
        .await
        .context("run should stop after the panic")??;

    assert_eq!(state.status, RunStatus::Failed);
    let failure = state.failure.context("failed run records its cause")?;
    assert_eq!(failure.kind, FailureKind::WorkerPanic);
    assert!(failure.message.contains("record 42"), "{}", failure.message);
    assert!(state.in_flight_records >= 10);
    assert_eq!(source.closed_cursors(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quarantine_store_failure_is_fatal() -> Result<()> {
    init_tracing();
    let stores = MemoryStores::new();
    let config = test_config("broken-quarantine")
        .concurrency(1)
        .min_batch_size(10)
        .max_batch_size(10)
        .build()?;

    let parts = PipelineParts {
        source: Arc::new(MemorySource::new(records(100))),
        transform: Arc::new(PassThrough::<u64>::new()),
        sink: Arc::new(FaultySink::new().poison(0..10)),
        quarantine: Arc::new(BrokenQuarantineStore),
        state: stores.state.clone(),
    };
    let state = timeout(Duration::from_secs(5), Pipeline::new(config, parts).run("all"))
        .await
        .context("run should stop")??;

    assert_eq!(state.status, RunStatus::Failed);
    let failure = state.failure.context("failed run records its cause")?;
    assert_eq!(failure.kind, FailureKind::Infrastructure);
    assert!(
        failure.message.contains("read-only"),
        "unexpected failure message: {}",
        failure.message
    );
    // The batch that could not be quarantined never counts as an outcome.
    assert_eq!(state.quarantined_records, 0);
    assert!(stores.state.load_checkpoint("broken-quarantine").await?.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checkpoint_failure_still_counts_the_committed_batch() -> Result<()> {
    init_tracing();
    let stores = MemoryStores::new();
    let state_store = Arc::new(FailingCheckpointStore::new(2));
    let sink = Arc::new(MemorySink::<u64>::new());
    let config = test_config("full-state-volume")
        .concurrency(1)
        .min_batch_size(10)
        .max_batch_size(10)
        .build()?;

    let parts = PipelineParts {
        source: Arc::new(MemorySource::new(records(100))),
        transform: Arc::new(PassThrough::<u64>::new()),
        sink: sink.clone(),
        quarantine: stores.quarantine.clone(),
        state: state_store.clone(),
    };
    let state = timeout(Duration::from_secs(5), Pipeline::new(config, parts).run("all"))
        .await
        .context("run should stop")??;

    assert_eq!(state.status, RunStatus::Failed);
    let failure = state.failure.as_ref().context("failed run records its cause")?;
    assert_eq!(failure.kind, FailureKind::Infrastructure);
    assert!(
        failure.message.contains("state volume is full"),
        "unexpected failure message: {}",
        failure.message
    );
    // The third batch reached the sink before its checkpoint failed.
    assert_eq!(sink.len(), 30);
    assert_eq!(state.committed_records, 30);
    assert_conserved(&state);

    let history = state_store.checkpoint_history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].position, serde_json::json!(20));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checkpoint_past_the_source_end_is_corrupt() -> Result<()> {
    init_tracing();
    let stores = MemoryStores::new();
    stores
        .state
        .save_checkpoint(&Checkpoint {
            pipeline: "corrupt".into(),
            run_id: Uuid::new_v4(),
            position: serde_json::json!(500),
            committed_records: 500,
            updated_at: Utc::now(),
        })
        .await?;

    let pipeline = Pipeline::new(
        test_config("corrupt").build()?,
        stores.parts(
            Arc::new(MemorySource::new(records(100))),
            Arc::new(PassThrough::new()),
            Arc::new(MemorySink::<u64>::new()),
        ),
    );
    let state = timeout(Duration::from_secs(5), pipeline.run("all"))
        .await
        .context("run should fail fast")??;

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(
        state.failure.map(|failure| failure.kind),
        Some(FailureKind::SourceCorrupt)
    );
    Ok(())
}
