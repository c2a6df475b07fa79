use crate::processor::coordinator::{Pipeline, PipelineParts, RunHandle};
use crate::runtime::config::PipelineConfig;
use crate::runtime::progress::RunState;
use crate::runtime::transform::Transform;
use crate::store::{SinkStore, SourceStore};
use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Binds a pipeline to OS signals so Ctrl-C drains the current run instead of killing it.
pub struct Runner<S, T, K> {
    pipeline: Pipeline<S, T, K>,
    shutdown: CancellationToken,
}

impl<S, T, K> Runner<S, T, K>
where
    S: SourceStore,
    T: Transform<Input = S::Record>,
    K: SinkStore<Record = T::Output>,
{
    /// Creates a new runner and wires a root [`CancellationToken`] that propagates
    /// through every run (reader, workers, backoff sleeps).
    pub fn new(config: PipelineConfig, parts: PipelineParts<S, T, K>) -> Self {
        let shutdown = CancellationToken::new();
        let pipeline = Pipeline::with_cancellation_token(config, parts, shutdown.clone());
        Self { pipeline, shutdown }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn pipeline(&self) -> &Pipeline<S, T, K> {
        &self.pipeline
    }

    /// Runs `query` until it finishes, a Ctrl-C (SIGINT) arrives, or the shutdown token is
    /// cancelled elsewhere. Interrupted runs still drain and return their final state.
    pub async fn run_until_ctrl_c(&self, query: impl Into<String>) -> Result<RunState> {
        let handle = self.pipeline.start(query);
        tracing::info!(
            run_id = %handle.run_id(),
            "runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown"
        );
        self.supervise(handle).await
    }

    /// Waits on an already started run, translating signals into cancellation.
    pub async fn supervise(&self, handle: RunHandle) -> Result<RunState> {
        let progress = handle.progress_tracker();
        let run_token = handle.cancel_token();
        let wait = handle.wait();
        tokio::pin!(wait);

        tokio::select! {
            state = &mut wait => return state,
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; draining pipeline run");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        progress.begin_cancelling();
        run_token.cancel();
        wait.await
    }
}
