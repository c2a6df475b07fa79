//! Per-run background tasks and the tokens that stop them.

use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::progress::ProgressTracker;
use crate::runtime::telemetry::{self, Telemetry};
use crate::store::StateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) struct LifecycleHandles {
    pub run_token: CancellationToken,
    pub abort_token: CancellationToken,
    reporter_token: CancellationToken,
    fatal_handler: Arc<FatalErrorHandler>,
    metrics_handle: Option<JoinHandle<()>>,
}

pub(crate) struct LifecycleSpawnParams {
    pub run_token: CancellationToken,
    pub telemetry: Arc<Telemetry>,
    pub progress: Arc<ProgressTracker>,
    pub state: Arc<dyn StateStore>,
    pub metrics_interval: Duration,
}

impl LifecycleHandles {
    pub(crate) fn spawn(params: LifecycleSpawnParams) -> Self {
        let LifecycleSpawnParams {
            run_token,
            telemetry,
            progress,
            state,
            metrics_interval,
        } = params;

        let fatal_handler = Arc::new(FatalErrorHandler::new(run_token.clone()));
        // The reporter keeps persisting snapshots while the run drains, so it gets its own token.
        let reporter_token = CancellationToken::new();
        let metrics_handle = telemetry::spawn_metrics_reporter(
            telemetry,
            progress,
            state,
            reporter_token.clone(),
            metrics_interval,
        );

        Self {
            run_token,
            abort_token: CancellationToken::new(),
            reporter_token,
            fatal_handler,
            metrics_handle: Some(metrics_handle),
        }
    }

    pub(crate) fn fatal_handler(&self) -> Arc<FatalErrorHandler> {
        self.fatal_handler.clone()
    }

    pub(crate) async fn shutdown(mut self) {
        self.reporter_token.cancel();
        if let Some(handle) = self.metrics_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "metrics reporter task panicked");
            }
        }
    }
}
