use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use cursorflow::{
    MemoryQuarantineStore, MemoryStateStore, PipelineConfig, PipelineConfigBuilder,
    PipelineParts, ProgressTracker, QuarantineStore, RunState, SinkStore, SourceStore,
    StateStore, Transform,
};
use once_cell::sync::Lazy;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Fast retries and frequent metrics so tests do not sit in backoff sleeps.
pub fn test_config(name: &str) -> PipelineConfigBuilder {
    PipelineConfig::builder()
        .pipeline_name(name)
        .retry_initial_backoff(Duration::from_millis(1))
        .retry_max_backoff(Duration::from_millis(5))
        .metrics_interval(Duration::from_millis(50))
        .grace_timeout(Duration::from_secs(5))
}

pub fn records(count: u64) -> Vec<u64> {
    (0..count).collect()
}

pub struct MemoryStores {
    pub quarantine: Arc<MemoryQuarantineStore>,
    pub state: Arc<MemoryStateStore>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self {
            quarantine: Arc::new(MemoryQuarantineStore::new()),
            state: Arc::new(MemoryStateStore::new()),
        }
    }

    pub fn parts<S, T, K>(
        &self,
        source: Arc<S>,
        transform: Arc<T>,
        sink: Arc<K>,
    ) -> PipelineParts<S, T, K>
    where
        S: SourceStore,
        T: Transform<Input = S::Record>,
        K: SinkStore<Record = T::Output>,
    {
        PipelineParts {
            source,
            transform,
            sink,
            quarantine: self.quarantine.clone() as Arc<dyn QuarantineStore>,
            state: self.state.clone() as Arc<dyn StateStore>,
        }
    }
}

pub fn assert_conserved(state: &RunState) {
    assert!(
        state.is_conserved(),
        "emitted {} != committed {} + quarantined {} + in flight {}",
        state.emitted_records,
        state.committed_records,
        state.quarantined_records,
        state.in_flight_records
    );
}

pub fn assert_unique(values: &[u64]) {
    let unique: HashSet<_> = values.iter().collect();
    assert_eq!(
        unique.len(),
        values.len(),
        "sink received {} duplicate record(s)",
        values.len() - unique.len()
    );
}

pub async fn wait_for_committed(
    progress: &ProgressTracker,
    target: u64,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        let committed = progress.committed_records();
        if committed >= target {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("run did not commit {target} records within {timeout:?} (committed: {committed})");
        }
        sleep(Duration::from_millis(10)).await;
    }
}
