//! Worker pool orchestration for a pipeline run.
//!
//! Owns worker task creation, panic capture, and the drain/grace/abort sequence the
//! coordinator runs once reading stops.

use super::worker::{Worker, WorkerActivityTracker, WorkerShared};
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::progress::FailureKind;
use crate::runtime::transform::Transform;
use crate::store::{SinkStore, SourceStore};
use futures::FutureExt;
use std::{
    any::Any,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub(crate) struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    workers_done_rx: watch::Receiver<bool>,
    activity: Arc<WorkerActivityTracker>,
}

impl WorkerPool {
    /// Spawns `concurrency` workers. `run_token` stops dequeuing; `abort` interrupts
    /// batches still in progress after the grace period.
    pub(crate) fn launch<S, T, K>(
        concurrency: usize,
        shared: WorkerShared<S, T, K>,
        run_token: CancellationToken,
        abort: CancellationToken,
        fatal_handler: Arc<FatalErrorHandler>,
    ) -> Self
    where
        S: SourceStore,
        T: Transform<Input = S::Record>,
        K: SinkStore<Record = T::Output>,
    {
        let concurrency = concurrency.max(1);
        let (workers_done_tx, workers_done_rx) = watch::channel(false);
        let remaining_workers = Arc::new(AtomicUsize::new(concurrency));
        let activity = Arc::clone(&shared.activity);
        let mut workers = Vec::with_capacity(concurrency);

        for worker_id in 0..concurrency {
            let worker = Worker::new(worker_id, shared.clone(), run_token.clone(), abort.clone());
            let workers_done = workers_done_tx.clone();
            let remaining_workers = remaining_workers.clone();
            let fatal_handler = fatal_handler.clone();

            let handle = tokio::spawn(async move {
                let result = std::panic::AssertUnwindSafe(worker.run())
                    .catch_unwind()
                    .await;

                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::error!(
                            worker = worker_id,
                            error = %err,
                            "worker task exited with error"
                        );
                        let context = format!("worker {worker_id} exited with error");
                        fatal_handler.trigger(FailureKind::Infrastructure, &context, err);
                    }
                    Err(panic_payload) => {
                        let panic_msg = panic_message(panic_payload.as_ref());
                        tracing::error!(
                            worker = worker_id,
                            panic = %panic_msg,
                            "worker task panicked"
                        );
                        let context = format!("worker {worker_id} panicked");
                        let panic_error =
                            anyhow::anyhow!("worker {worker_id} panicked: {panic_msg}");
                        fatal_handler.trigger(FailureKind::WorkerPanic, &context, panic_error);
                    }
                }

                if remaining_workers.fetch_sub(1, Ordering::SeqCst) == 1 {
                    let _ = workers_done.send(true);
                }
            });
            workers.push(handle);
        }

        Self {
            workers,
            workers_done_rx,
            activity,
        }
    }

    /// Waits for the workers to exit. Once `cancel` fires, `on_cancel` runs and the
    /// workers get `grace` to finish the batches they hold; after that `abort` is
    /// cancelled. Returns `false` when the grace period expired.
    pub(crate) async fn join(
        mut self,
        cancel: &CancellationToken,
        abort: &CancellationToken,
        grace: Duration,
        on_cancel: impl FnOnce(),
    ) -> bool {
        let mut drained_in_time = true;

        let finished = tokio::select! {
            biased;
            _ = wait_done(&mut self.workers_done_rx) => true,
            _ = cancel.cancelled() => false,
        };

        if !finished {
            on_cancel();
            tracing::info!(
                active_batches = self.activity.active(),
                grace_ms = grace.as_millis() as u64,
                "draining in-flight batches"
            );
            if timeout(grace, wait_done(&mut self.workers_done_rx))
                .await
                .is_err()
            {
                drained_in_time = false;
                tracing::warn!(
                    active_batches = self.activity.active(),
                    "grace period expired; aborting outstanding batches"
                );
                abort.cancel();
                wait_done(&mut self.workers_done_rx).await;
            }
        }

        for (worker_id, handle) in self.workers.drain(..).enumerate() {
            if let Err(err) = handle.await {
                tracing::warn!(worker = worker_id, error = %err, "worker task join failed");
            }
        }
        drained_in_time
    }
}

async fn wait_done(rx: &mut watch::Receiver<bool>) {
    // The sender lives in the worker tasks; a dropped sender also means they are gone.
    let _ = rx.wait_for(|done| *done).await;
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
