use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{assert_conserved, assert_unique, init_tracing, records, test_config, MemoryStores},
    stores::FaultySink,
};
use anyhow::{Context, Result};
use cursorflow::{
    transform_fn, MemorySink, MemorySource, PassThrough, Pipeline, QuarantineReason,
    QuarantineStore, ReplayOutcome, RunStatus, SizingPolicy, TransformError,
};
use tokio::time::timeout;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn small_source_completes_within_bounds() -> Result<()> {
    init_tracing();
    let stores = MemoryStores::new();
    let source = Arc::new(MemorySource::new(records(250)));
    let sink = Arc::new(MemorySink::<u64>::new());
    let config = test_config("scenario")
        .concurrency(4)
        .min_batch_size(10)
        .max_batch_size(100)
        .build()?;

    let pipeline = Pipeline::new(
        config,
        stores.parts(source.clone(), Arc::new(PassThrough::new()), sink.clone()),
    );
    let state = timeout(Duration::from_secs(10), pipeline.run("all"))
        .await
        .context("run should finish")??;

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.committed_records, 250);
    assert_eq!(state.quarantined_records, 0);
    assert_eq!(state.in_flight_records, 0);
    assert!(state.current_batch_size <= 100);
    assert!(state.current_batch_size >= 10);
    assert_conserved(&state);

    let mut committed = sink.records();
    assert_unique(&committed);
    committed.sort_unstable();
    assert_eq!(committed, records(250));
    assert_eq!(source.opened_cursors(), 1);
    assert_eq!(source.closed_cursors(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn permanent_failure_quarantines_only_its_batch() -> Result<()> {
    init_tracing();
    let stores = MemoryStores::new();
    let sink = Arc::new(FaultySink::new().poison(370..380));
    let config = test_config("isolation")
        .concurrency(4)
        .min_batch_size(10)
        .max_batch_size(10)
        .sizing(SizingPolicy::Fixed { size: 10 })
        .build()?;

    let pipeline = Pipeline::new(
        config,
        stores.parts(
            Arc::new(MemorySource::new(records(1_000))),
            Arc::new(PassThrough::new()),
            sink.clone(),
        ),
    );
    let state = timeout(Duration::from_secs(10), pipeline.run("all"))
        .await
        .context("run should finish")??;

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.emitted_batches, 100);
    assert_eq!(state.committed_batches, 99);
    assert_eq!(state.quarantined_batches, 1);
    assert_eq!(state.quarantined_batch_ids, vec![37]);
    assert_eq!(state.committed_records, 990);
    assert_conserved(&state);
    assert!(sink.committed().iter().all(|id| !(370..380).contains(id)));

    let quarantined = stores.quarantine.all();
    assert_eq!(quarantined.len(), 1);
    let record = &quarantined[0];
    assert_eq!(record.run_id, state.run_id);
    assert_eq!(record.batch_id, 37);
    assert_eq!(record.error_kind, QuarantineReason::PermanentSink);
    assert_eq!(record.attempts, 1);
    assert_eq!(record.decode_records::<u64>()?, (370..380).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_failures_are_retried_to_commit() -> Result<()> {
    init_tracing();
    let stores = MemoryStores::new();
    let sink = Arc::new(FaultySink::new().transient_failures(2));
    let config = test_config("retry")
        .concurrency(2)
        .min_batch_size(25)
        .max_batch_size(25)
        .max_write_attempts(3)
        .build()?;

    let pipeline = Pipeline::new(
        config,
        stores.parts(
            Arc::new(MemorySource::new(records(100))),
            Arc::new(PassThrough::new()),
            sink.clone(),
        ),
    );
    let state = timeout(Duration::from_secs(10), pipeline.run("all"))
        .await
        .context("run should finish")??;

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.committed_records, 100);
    assert_eq!(state.quarantined_records, 0);
    assert_eq!(sink.writes(), 12);
    let counters = pipeline.telemetry().snapshot();
    assert_eq!(counters.write_attempts, 12);
    assert_eq!(counters.write_retries, 8);
    assert_unique(&sink.committed());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_retries_quarantine_and_still_complete() -> Result<()> {
    init_tracing();
    let stores = MemoryStores::new();
    let sink = Arc::new(FaultySink::new().always_transient());
    let config = test_config("exhausted")
        .concurrency(2)
        .min_batch_size(10)
        .max_batch_size(10)
        .max_write_attempts(2)
        .build()?;

    let pipeline = Pipeline::new(
        config,
        stores.parts(
            Arc::new(MemorySource::new(records(30))),
            Arc::new(PassThrough::new()),
            sink.clone(),
        ),
    );
    let state = timeout(Duration::from_secs(10), pipeline.run("all"))
        .await
        .context("run should finish")??;

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.committed_records, 0);
    assert_eq!(state.quarantined_records, 30);
    assert_eq!(state.quarantined_batch_ids, vec![0, 1, 2]);
    assert_eq!(sink.writes(), 6);
    assert!(stores
        .quarantine
        .all()
        .iter()
        .all(|record| record.error_kind == QuarantineReason::TransientExhausted
            && record.attempts == 2));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transform_rejections_are_quarantined_and_replayable() -> Result<()> {
    init_tracing();
    let stores = MemoryStores::new();
    let sink = Arc::new(MemorySink::<u64>::new());
    let config = test_config("transform")
        .concurrency(2)
        .min_batch_size(5)
        .max_batch_size(5)
        .build()?;

    let strict = transform_fn(|batch: &[u64]| {
        if batch.contains(&7) {
            return Err(TransformError::new("record 7 is malformed"));
        }
        Ok(batch.to_vec())
    });
    let pipeline = Pipeline::new(
        config.clone(),
        stores.parts(
            Arc::new(MemorySource::new(records(20))),
            Arc::new(strict),
            sink.clone(),
        ),
    );
    let state = pipeline.run("all").await?;
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.quarantined_batch_ids, vec![1]);
    assert_eq!(
        stores.quarantine.all()[0].error_kind,
        QuarantineReason::TransformRejected
    );

    // Still rejected by the same transform.
    let outcome = pipeline.replay_quarantined(state.run_id, 1).await?;
    assert!(matches!(
        outcome,
        ReplayOutcome::StillFailing {
            reason: QuarantineReason::TransformRejected,
            ..
        }
    ));
    assert_eq!(stores.quarantine.list_pending().await?.len(), 1);

    // A fixed transform drains the quarantine.
    let fixed = Pipeline::new(
        config,
        stores.parts(
            Arc::new(MemorySource::new(Vec::<u64>::new())),
            Arc::new(PassThrough::new()),
            sink.clone(),
        ),
    );
    let outcome = fixed.replay_quarantined(state.run_id, 1).await?;
    assert_eq!(outcome, ReplayOutcome::Committed { records: 5 });
    assert!(stores.quarantine.list_pending().await?.is_empty());

    let mut committed = sink.records();
    committed.sort_unstable();
    assert_eq!(committed, records(20));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_records_stay_within_backpressure_bound() -> Result<()> {
    init_tracing();
    let stores = MemoryStores::new();
    let sink = Arc::new(FaultySink::new().with_delay(Duration::from_millis(5)));
    let config = test_config("backpressure")
        .concurrency(2)
        .min_batch_size(5)
        .max_batch_size(20)
        .queue_capacity(2)
        .build()?;
    let bound = config.queue_capacity() * config.max_batch_size();

    let pipeline = Pipeline::new(
        config,
        stores.parts(
            Arc::new(MemorySource::new(records(600))),
            Arc::new(PassThrough::new()),
            sink.clone(),
        ),
    );
    let state = timeout(Duration::from_secs(20), pipeline.run("all"))
        .await
        .context("run should finish")??;

    assert_eq!(state.status, RunStatus::Completed);
    assert!(
        state.peak_queued_records <= bound,
        "peak queue depth {} exceeds {bound}",
        state.peak_queued_records
    );
    assert!(state.peak_queued_records > 0);
    assert_eq!(state.queued_records, 0);
    assert_eq!(sink.committed().len(), 600);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn adaptive_batches_respect_bounds() -> Result<()> {
    init_tracing();
    let stores = MemoryStores::new();
    // Slow enough that the projected batch latency crosses the high watermark.
    let sink = Arc::new(FaultySink::new().with_delay(Duration::from_millis(60)));
    let config = test_config("bounds")
        .concurrency(1)
        .min_batch_size(4)
        .max_batch_size(64)
        .queue_capacity(1)
        .sizing(SizingPolicy::Adaptive {
            seed: 64,
            low_watermark: Duration::from_millis(1),
            high_watermark: Duration::from_millis(20),
            smoothing: 0.5,
        })
        .build()?;

    let pipeline = Pipeline::new(
        config,
        stores.parts(
            Arc::new(MemorySource::new(records(400))),
            Arc::new(PassThrough::new()),
            sink.clone(),
        ),
    );
    let state = timeout(Duration::from_secs(20), pipeline.run("all"))
        .await
        .context("run should finish")??;

    assert_eq!(state.status, RunStatus::Completed);
    let sizes = sink.batch_sizes();
    let (last, body) = sizes.split_last().context("at least one batch")?;
    assert!(*last <= 64);
    assert!(
        body.iter().all(|size| (4..=64).contains(size)),
        "batch sizes out of bounds: {sizes:?}"
    );
    assert!(
        body.iter().any(|size| *size < 64),
        "slow writes should shrink the batch size: {sizes:?}"
    );
    assert_eq!(sizes.iter().sum::<usize>(), 400);
    Ok(())
}
