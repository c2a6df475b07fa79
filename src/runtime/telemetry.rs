use crate::runtime::progress::ProgressTracker;
use crate::store::StateStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Operational counters that are not part of the run's record accounting.
#[derive(Default, Debug)]
pub struct Telemetry {
    write_attempts: AtomicU64,
    write_retries: AtomicU64,
    write_timeouts: AtomicU64,
    source_retries: AtomicU64,
    batches_fetched: AtomicU64,
}

impl Telemetry {
    pub fn record_write_attempt(&self) {
        self.write_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_retry(&self) {
        self.write_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_timeout(&self) {
        self.write_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_source_retry(&self) {
        self.source_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_fetched(&self) {
        self.batches_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            write_attempts: self.write_attempts.load(Ordering::Relaxed),
            write_retries: self.write_retries.load(Ordering::Relaxed),
            write_timeouts: self.write_timeouts.load(Ordering::Relaxed),
            source_retries: self.source_retries.load(Ordering::Relaxed),
            batches_fetched: self.batches_fetched.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub write_attempts: u64,
    pub write_retries: u64,
    pub write_timeouts: u64,
    pub source_retries: u64,
    pub batches_fetched: u64,
}

/// Spawns a background task that periodically logs throughput, queue depth, and batch size,
/// and persists the current run state.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    progress: Arc<ProgressTracker>,
    state: Arc<dyn StateStore>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_committed = progress.committed_records();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(target: "cursorflow::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let run = progress.snapshot();
                    let counters = telemetry.snapshot();
                    let committed_delta = run.committed_records.saturating_sub(last_committed);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        committed_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "cursorflow::metrics",
                        run_id = %run.run_id,
                        status = ?run.status,
                        throughput = format!("{throughput:.2}"),
                        emitted = run.emitted_records,
                        committed = run.committed_records,
                        quarantined = run.quarantined_records,
                        in_flight = run.in_flight_records,
                        queue_batches = run.queued_batches,
                        queue_records = run.queued_records,
                        batch_size = run.current_batch_size,
                        write_retries = counters.write_retries,
                        write_timeouts = counters.write_timeouts,
                        source_retries = counters.source_retries,
                        "runtime metrics snapshot"
                    );

                    if let Err(err) = state.save_run_state(&run).await {
                        tracing::warn!(
                            target: "cursorflow::metrics",
                            error = %err,
                            "failed to persist run state snapshot"
                        );
                    }

                    last_committed = run.committed_records;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
