use super::batch::Batch;
use crate::processor::backoff::{sleep_with_cancellation, RetryDecision, RetryPolicy};
use crate::runtime::progress::FailureKind;
use crate::runtime::telemetry::Telemetry;
use crate::store::{SourceError, SourceStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Run-fatal conditions raised by the reader side of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("source unavailable after {attempts} attempt(s): {message}")]
    SourceUnavailable { attempts: u32, message: String },
    #[error("source returned corrupt data: {0}")]
    SourceCorrupt(String),
    #[error("cursor is closed")]
    CursorClosed,
    /// Cancellation arrived while the reader was waiting on the source.
    #[error("interrupted by cancellation")]
    Interrupted,
}

impl PipelineError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            PipelineError::SourceUnavailable { .. } | PipelineError::Interrupted => {
                FailureKind::SourceUnavailable
            }
            PipelineError::SourceCorrupt(_) => FailureKind::SourceCorrupt,
            PipelineError::CursorClosed => FailureKind::CursorClosed,
        }
    }
}

pub enum Fetch<R, P> {
    Batch(Batch<R, P>),
    EndOfStream,
}

/// Owns the single forward-only cursor of a run and turns source pages into numbered batches.
pub struct CursorReader<S: SourceStore> {
    source: Arc<S>,
    handle: Option<S::Handle>,
    position: S::Position,
    exhausted: bool,
    next_batch_id: u64,
    retry: RetryPolicy,
    telemetry: Arc<Telemetry>,
}

impl<S: SourceStore> CursorReader<S> {
    pub async fn open(
        source: Arc<S>,
        query: &str,
        resume_from: Option<S::Position>,
        retry: RetryPolicy,
        telemetry: Arc<Telemetry>,
        cancel: &CancellationToken,
    ) -> Result<Self, PipelineError> {
        let mut attempt = 0u32;
        let handle = loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Interrupted),
                result = source.open_cursor(query, resume_from.clone()) => result,
            };
            match result {
                Ok(handle) => break handle,
                Err(err) => {
                    retry_or_fail(&retry, &telemetry, attempt, err, cancel, "open").await?
                }
            }
        };

        let position = source.position(&handle);
        tracing::info!(position = ?position, resumed = resume_from.is_some(), "source cursor opened");

        Ok(Self {
            source,
            handle: Some(handle),
            position,
            exhausted: false,
            next_batch_id: 0,
            retry,
            telemetry,
        })
    }

    /// Fetches up to `desired` records as the next batch.
    pub async fn fetch_next(
        &mut self,
        desired: usize,
        cancel: &CancellationToken,
    ) -> Result<Fetch<S::Record, S::Position>, PipelineError> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(PipelineError::CursorClosed);
        };
        if self.exhausted {
            return Ok(Fetch::EndOfStream);
        }

        let desired = desired.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Interrupted),
                result = self.source.fetch_batch(handle, desired) => result,
            };

            match result {
                Ok(page) => {
                    self.telemetry.record_batch_fetched();
                    self.position = page.position.clone();
                    if page.records.is_empty() {
                        self.exhausted = true;
                        return Ok(Fetch::EndOfStream);
                    }
                    self.exhausted = page.exhausted;

                    let batch_id = self.next_batch_id;
                    self.next_batch_id += 1;
                    return Ok(Fetch::Batch(Batch::new(
                        batch_id,
                        page.records,
                        page.position,
                    )));
                }
                Err(err) => {
                    retry_or_fail(&self.retry, &self.telemetry, attempt, err, cancel, "fetch")
                        .await?
                }
            }
        }
    }

    /// Releases the source cursor. Only the first call succeeds.
    pub async fn close(&mut self) -> Result<(), PipelineError> {
        let handle = self.handle.take().ok_or(PipelineError::CursorClosed)?;
        self.source
            .close_cursor(handle)
            .await
            .map_err(|err| PipelineError::SourceUnavailable {
                attempts: 1,
                message: err.to_string(),
            })?;
        tracing::debug!(position = ?self.position, "source cursor closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    pub fn position(&self) -> &S::Position {
        &self.position
    }

    pub fn next_batch_id(&self) -> u64 {
        self.next_batch_id
    }
}

async fn retry_or_fail(
    retry: &RetryPolicy,
    telemetry: &Telemetry,
    attempt: u32,
    err: SourceError,
    cancel: &CancellationToken,
    operation: &'static str,
) -> Result<(), PipelineError> {
    match retry.decide(attempt, &err) {
        RetryDecision::RetryAfter(delay) => {
            telemetry.record_source_retry();
            tracing::warn!(
                operation,
                attempt,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "source call failed; retrying"
            );
            sleep_with_cancellation(delay, cancel)
                .await
                .map_err(|_| PipelineError::Interrupted)
        }
        RetryDecision::Exhausted => Err(PipelineError::SourceUnavailable {
            attempts: attempt,
            message: err.to_string(),
        }),
        RetryDecision::GiveUp => match err {
            SourceError::Corrupt(message) => Err(PipelineError::SourceCorrupt(message)),
            SourceError::Unavailable(message) => Err(PipelineError::SourceUnavailable {
                attempts: attempt,
                message,
            }),
        },
    }
}
