use crate::batching::sizer::SizingPolicy;
use crate::processor::backoff::RetryPolicy;
use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use std::time::Duration;

const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_MIN_BATCH_SIZE: usize = 1;
const DEFAULT_MAX_BATCH_SIZE: usize = 1_000;
const DEFAULT_QUEUE_CAPACITY: usize = 8;
const DEFAULT_MAX_WRITE_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 100;
const DEFAULT_RETRY_MAX_BACKOFF_SECS: u64 = 5;
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SOURCE_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_GRACE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_FEEDBACK_CAPACITY: usize = 64;

/// Runtime configuration for a pipeline.
///
/// All instances must be constructed via [`PipelineConfig::builder`] or [`PipelineConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pipeline_name: String,
    concurrency: usize,
    min_batch_size: usize,
    max_batch_size: usize,
    sizing: SizingPolicy,
    queue_capacity: usize,
    max_write_attempts: u32,
    retry_initial_backoff: Duration,
    retry_max_backoff: Duration,
    write_timeout: Duration,
    source_max_attempts: u32,
    grace_timeout: Duration,
    metrics_interval: Duration,
    feedback_capacity: usize,
}

pub struct PipelineConfigParams {
    pub pipeline_name: String,
    pub concurrency: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub sizing: SizingPolicy,
    pub queue_capacity: usize,
    pub max_write_attempts: u32,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
    pub write_timeout: Duration,
    pub source_max_attempts: u32,
    pub grace_timeout: Duration,
    pub metrics_interval: Duration,
    pub feedback_capacity: usize,
}

impl PipelineConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: PipelineConfigParams) -> Result<Self> {
        let PipelineConfigParams {
            pipeline_name,
            concurrency,
            min_batch_size,
            max_batch_size,
            sizing,
            queue_capacity,
            max_write_attempts,
            retry_initial_backoff,
            retry_max_backoff,
            write_timeout,
            source_max_attempts,
            grace_timeout,
            metrics_interval,
            feedback_capacity,
        } = params;

        let config = Self {
            pipeline_name: pipeline_name.trim().to_owned(),
            concurrency,
            min_batch_size,
            max_batch_size,
            sizing,
            queue_capacity,
            max_write_attempts,
            retry_initial_backoff,
            retry_max_backoff,
            write_timeout,
            source_max_attempts,
            grace_timeout,
            metrics_interval,
            feedback_capacity,
        };

        config.validate()?;
        Ok(config)
    }

    /// Name keying the pipeline's checkpoint. Runs with the same name resume each other.
    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    /// Number of workers.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn min_batch_size(&self) -> usize {
        self.min_batch_size
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn sizing(&self) -> SizingPolicy {
        self.sizing
    }

    /// Maximum batches waiting between the reader and the workers.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn max_write_attempts(&self) -> u32 {
        self.max_write_attempts
    }

    pub fn retry_initial_backoff(&self) -> Duration {
        self.retry_initial_backoff
    }

    pub fn retry_max_backoff(&self) -> Duration {
        self.retry_max_backoff
    }

    /// Upper bound on a single bulk write attempt.
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn source_max_attempts(&self) -> u32 {
        self.source_max_attempts
    }

    /// Time in-flight batches get to finish after cancellation before the abort token fires.
    pub fn grace_timeout(&self) -> Duration {
        self.grace_timeout
    }

    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    pub fn feedback_capacity(&self) -> usize {
        self.feedback_capacity
    }

    pub fn write_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_write_attempts,
            self.retry_initial_backoff,
            self.retry_max_backoff,
        )
    }

    pub fn source_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.source_max_attempts,
            self.retry_initial_backoff,
            self.retry_max_backoff,
        )
    }

    /// Upper bound on records held by the queue at any time.
    pub fn max_queued_records(&self) -> usize {
        self.queue_capacity.saturating_mul(self.max_batch_size)
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        validate_pipeline_name(&self.pipeline_name)?;

        if self.concurrency == 0 {
            bail!("concurrency must be greater than 0");
        }

        if self.min_batch_size == 0 {
            bail!("min_batch_size must be greater than 0");
        }

        if self.max_batch_size < self.min_batch_size {
            bail!(
                "max_batch_size ({}) must be at least min_batch_size ({})",
                self.max_batch_size,
                self.min_batch_size
            );
        }

        self.sizing.validate()?;

        if self.queue_capacity == 0 {
            bail!("queue_capacity must be greater than 0");
        }

        if self.max_write_attempts == 0 {
            bail!("max_write_attempts must be greater than 0");
        }

        if self.retry_initial_backoff > self.retry_max_backoff {
            bail!(
                "retry_initial_backoff ({:?}) must not exceed retry_max_backoff ({:?})",
                self.retry_initial_backoff,
                self.retry_max_backoff
            );
        }

        if self.write_timeout.is_zero() {
            bail!("write_timeout must be greater than 0");
        }

        if self.source_max_attempts == 0 {
            bail!("source_max_attempts must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if self.feedback_capacity == 0 {
            bail!("feedback_capacity must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct PipelineConfigBuilder {
    pipeline_name: Option<String>,
    concurrency: Option<usize>,
    min_batch_size: Option<usize>,
    max_batch_size: Option<usize>,
    sizing: Option<SizingPolicy>,
    queue_capacity: Option<usize>,
    max_write_attempts: Option<u32>,
    retry_initial_backoff: Option<Duration>,
    retry_max_backoff: Option<Duration>,
    write_timeout: Option<Duration>,
    source_max_attempts: Option<u32>,
    grace_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
    feedback_capacity: Option<usize>,
}

impl PipelineConfigBuilder {
    pub fn pipeline_name(mut self, name: impl Into<String>) -> Self {
        self.pipeline_name = Some(name.into());
        self
    }

    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = Some(workers);
        self
    }

    pub fn min_batch_size(mut self, size: usize) -> Self {
        self.min_batch_size = Some(size);
        self
    }

    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }

    pub fn sizing(mut self, policy: SizingPolicy) -> Self {
        self.sizing = Some(policy);
        self
    }

    pub fn queue_capacity(mut self, batches: usize) -> Self {
        self.queue_capacity = Some(batches);
        self
    }

    pub fn max_write_attempts(mut self, attempts: u32) -> Self {
        self.max_write_attempts = Some(attempts);
        self
    }

    pub fn retry_initial_backoff(mut self, backoff: Duration) -> Self {
        self.retry_initial_backoff = Some(backoff);
        self
    }

    pub fn retry_max_backoff(mut self, backoff: Duration) -> Self {
        self.retry_max_backoff = Some(backoff);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn source_max_attempts(mut self, attempts: u32) -> Self {
        self.source_max_attempts = Some(attempts);
        self
    }

    pub fn grace_timeout(mut self, timeout: Duration) -> Self {
        self.grace_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn feedback_capacity(mut self, capacity: usize) -> Self {
        self.feedback_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Result<PipelineConfig> {
        let min_batch_size = self.min_batch_size.unwrap_or(DEFAULT_MIN_BATCH_SIZE);
        let max_batch_size = self.max_batch_size.unwrap_or(DEFAULT_MAX_BATCH_SIZE);
        let params = PipelineConfigParams {
            pipeline_name: self.pipeline_name.context("pipeline_name is required")?,
            concurrency: self.concurrency.unwrap_or(DEFAULT_CONCURRENCY),
            min_batch_size,
            max_batch_size,
            sizing: self
                .sizing
                .unwrap_or_else(|| SizingPolicy::adaptive(min_batch_size.max(1))),
            queue_capacity: self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            max_write_attempts: self
                .max_write_attempts
                .unwrap_or(DEFAULT_MAX_WRITE_ATTEMPTS),
            retry_initial_backoff: self
                .retry_initial_backoff
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_RETRY_INITIAL_BACKOFF_MS)),
            retry_max_backoff: self
                .retry_max_backoff
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RETRY_MAX_BACKOFF_SECS)),
            write_timeout: self
                .write_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS)),
            source_max_attempts: self
                .source_max_attempts
                .unwrap_or(DEFAULT_SOURCE_MAX_ATTEMPTS),
            grace_timeout: self
                .grace_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_GRACE_TIMEOUT_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
            feedback_capacity: self.feedback_capacity.unwrap_or(DEFAULT_FEEDBACK_CAPACITY),
        };

        PipelineConfig::new(params)
    }
}

fn validate_pipeline_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("pipeline_name cannot be empty");
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid || name.starts_with('.') {
        bail!(
            "pipeline_name `{name}` may only contain ASCII letters, digits, '-', '_' and '.', and must not start with '.'"
        );
    }
    Ok(())
}
