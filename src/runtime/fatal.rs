use crate::runtime::progress::{FailureKind, RunFailure};
use anyhow::Error as AnyError;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Captures the first run-fatal error and cancels the run so the reader and workers wind down.
#[derive(Clone)]
pub struct FatalErrorHandler {
    inner: Arc<FatalInner>,
}

struct FatalInner {
    triggered: AtomicBool,
    run_shutdown: CancellationToken,
    captured_error: Mutex<Option<CapturedFatalError>>,
}

#[derive(Clone)]
struct CapturedFatalError {
    kind: FailureKind,
    inner: Arc<AnyError>,
}

impl CapturedFatalError {
    fn new(kind: FailureKind, inner: AnyError) -> Self {
        Self {
            kind,
            inner: Arc::new(inner),
        }
    }
}

impl fmt::Debug for CapturedFatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedFatalError")
            .field("kind", &self.kind)
            .field("error", &self.inner)
            .finish()
    }
}

impl fmt::Display for CapturedFatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.inner.as_ref())
    }
}

impl std::error::Error for CapturedFatalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref().as_ref())
    }
}

impl FatalErrorHandler {
    pub fn new(run_shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(FatalInner {
                triggered: AtomicBool::new(false),
                run_shutdown,
                captured_error: Mutex::new(None),
            }),
        }
    }

    /// Records `error` as the run's failure cause unless one was already captured, then
    /// cancels the run. Later triggers are logged by the caller and otherwise ignored.
    pub fn trigger(&self, kind: FailureKind, context: &str, error: AnyError) -> AnyError {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            return error;
        }

        tracing::error!(
            context,
            kind = ?kind,
            error = %format!("{error:#}"),
            "fatal pipeline error; cancelling run"
        );

        let captured = CapturedFatalError::new(kind, error);
        {
            let mut slot = self.inner.captured_error.lock().unwrap();
            if slot.is_none() {
                *slot = Some(captured.clone());
            }
        }

        self.inner.run_shutdown.cancel();
        captured.into()
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub fn error(&self) -> Option<AnyError> {
        self.inner
            .captured_error
            .lock()
            .unwrap()
            .as_ref()
            .map(|error| error.clone().into())
    }

    pub fn failure(&self) -> Option<RunFailure> {
        self.inner
            .captured_error
            .lock()
            .unwrap()
            .as_ref()
            .map(|error| RunFailure {
                kind: error.kind,
                message: error.to_string(),
            })
    }
}
