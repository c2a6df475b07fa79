use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{assert_conserved, init_tracing, records, test_config, MemoryStores},
    stores::{GatedSink, StallingSource},
};
use anyhow::{Context, Result};
use cursorflow::{
    MemorySink, MemorySource, PassThrough, Pipeline, RunStatus, SizingPolicy, StateStore,
};
use tokio::time::{sleep, timeout};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_drains_in_flight_batches() -> Result<()> {
    init_tracing();
    let stores = MemoryStores::new();
    // Three batches are readable, then the source goes quiet.
    let source = Arc::new(StallingSource::new(records(100), 30));
    let sink = Arc::new(GatedSink::new());
    let config = test_config("drain")
        .concurrency(4)
        .min_batch_size(10)
        .max_batch_size(10)
        .sizing(SizingPolicy::Fixed { size: 10 })
        .build()?;

    let pipeline = Pipeline::new(
        config,
        stores.parts(source.clone(), Arc::new(PassThrough::new()), sink.clone()),
    );
    let handle = pipeline.start("all");
    sink.wait_for_entered(3, Duration::from_secs(5)).await?;

    let progress = handle.progress();
    assert_eq!(progress.status, RunStatus::Running);
    assert_eq!(progress.emitted_batches, 3);
    assert_eq!(progress.in_flight_records, 30);

    handle.cancel();
    assert_eq!(handle.status(), RunStatus::Cancelling);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.status(), RunStatus::Cancelling);
    assert_eq!(handle.progress().committed_records, 0);

    sink.release();
    let state = timeout(Duration::from_secs(5), handle.wait())
        .await
        .context("cancelled run should finish draining")??;

    assert_eq!(state.status, RunStatus::Cancelled);
    assert_eq!(state.committed_batches, 3);
    assert_eq!(state.committed_records, 30);
    assert_eq!(state.in_flight_records, 0);
    assert!(state.finished_at.is_some());
    assert_conserved(&state);

    let batches = sink.committed_batches();
    assert_eq!(batches.len(), 3);
    assert!(batches.iter().all(|batch| batch.len() == 10));
    assert_eq!(source.closed_cursors(), 1);

    let persisted = stores
        .state
        .load_run_state(state.run_id)
        .await?
        .context("final run state should be persisted")?;
    assert_eq!(persisted, state);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn grace_expiry_leaves_batches_for_the_next_run() -> Result<()> {
    init_tracing();
    let stores = MemoryStores::new();
    let source = Arc::new(StallingSource::new(records(100), 30));
    let sink = Arc::new(GatedSink::new());
    let config = test_config("grace")
        .concurrency(4)
        .min_batch_size(10)
        .max_batch_size(10)
        .sizing(SizingPolicy::Fixed { size: 10 })
        .grace_timeout(Duration::from_millis(100))
        .write_timeout(Duration::from_millis(400))
        .build()?;

    let pipeline = Pipeline::new(
        config.clone(),
        stores.parts(source.clone(), Arc::new(PassThrough::new()), sink.clone()),
    );
    let handle = pipeline.start("all");
    sink.wait_for_entered(3, Duration::from_secs(5)).await?;
    handle.cancel();

    let state = timeout(Duration::from_secs(5), handle.wait())
        .await
        .context("run should stop after the grace period")??;

    assert_eq!(state.status, RunStatus::Cancelled);
    assert_eq!(state.committed_records, 0);
    assert_eq!(state.in_flight_records, 30);
    assert_conserved(&state);
    assert!(sink.committed_batches().is_empty());
    assert_eq!(pipeline.telemetry().snapshot().write_timeouts, 3);
    assert_eq!(source.closed_cursors(), 1);
    assert!(stores.state.load_checkpoint("grace").await?.is_none());

    // Nothing was checkpointed, so the next run starts from the beginning.
    let sink = Arc::new(MemorySink::<u64>::new());
    let resumed = Pipeline::new(
        config,
        stores.parts(
            Arc::new(MemorySource::new(records(100))),
            Arc::new(PassThrough::new()),
            sink.clone(),
        ),
    );
    let state = timeout(Duration::from_secs(5), resumed.run("all"))
        .await
        .context("second run should finish")??;
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.committed_records, 100);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_the_root_token_stops_every_run() -> Result<()> {
    init_tracing();
    let stores = MemoryStores::new();
    let source = Arc::new(StallingSource::new(records(100), 20));
    let sink = Arc::new(MemorySink::<u64>::new());
    let config = test_config("root")
        .concurrency(2)
        .min_batch_size(10)
        .max_batch_size(10)
        .build()?;

    let root = tokio_util::sync::CancellationToken::new();
    let pipeline = Pipeline::with_cancellation_token(
        config,
        stores.parts(source.clone(), Arc::new(PassThrough::new()), sink.clone()),
        root.clone(),
    );
    let handle = pipeline.start("all");
    crate::support::helpers::wait_for_committed(
        &handle.progress_tracker(),
        20,
        Duration::from_secs(5),
    )
    .await?;

    root.cancel();
    let state = timeout(Duration::from_secs(5), handle.wait())
        .await
        .context("run should observe root cancellation")??;

    assert_eq!(state.status, RunStatus::Cancelled);
    assert_eq!(state.committed_records, 20);
    assert_eq!(source.closed_cursors(), 1);
    Ok(())
}
