use anyhow::{bail, Result};
use std::time::Duration;

pub const DEFAULT_LOW_WATERMARK: Duration = Duration::from_millis(50);
pub const DEFAULT_HIGH_WATERMARK: Duration = Duration::from_millis(500);
pub const DEFAULT_SMOOTHING: f64 = 0.3;

/// How the coordinator picks the size of the next fetch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizingPolicy {
    /// Always request `size` records (clamped to the configured bounds).
    Fixed { size: usize },
    /// Track an exponential moving average of per-record latency and double or halve the
    /// batch size when the projected batch latency leaves `[low_watermark, high_watermark]`.
    Adaptive {
        seed: usize,
        low_watermark: Duration,
        high_watermark: Duration,
        smoothing: f64,
    },
}

impl SizingPolicy {
    pub fn adaptive(seed: usize) -> Self {
        SizingPolicy::Adaptive {
            seed,
            low_watermark: DEFAULT_LOW_WATERMARK,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            smoothing: DEFAULT_SMOOTHING,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            SizingPolicy::Fixed { size } => {
                if size == 0 {
                    bail!("sizing.size must be greater than 0");
                }
            }
            SizingPolicy::Adaptive {
                seed,
                low_watermark,
                high_watermark,
                smoothing,
            } => {
                if seed == 0 {
                    bail!("sizing.seed must be greater than 0");
                }
                if low_watermark >= high_watermark {
                    bail!(
                        "sizing.low_watermark ({low_watermark:?}) must be below sizing.high_watermark ({high_watermark:?})"
                    );
                }
                if !(smoothing > 0.0 && smoothing <= 1.0) {
                    bail!("sizing.smoothing must be in (0, 1], got {smoothing}");
                }
            }
        }
        Ok(())
    }

    fn initial_size(&self) -> usize {
        match *self {
            SizingPolicy::Fixed { size } => size,
            SizingPolicy::Adaptive { seed, .. } => seed,
        }
    }
}

/// Recommends the next batch size from observed processing latency.
#[derive(Debug, Clone)]
pub struct AdaptiveBatcher {
    policy: SizingPolicy,
    min_size: usize,
    max_size: usize,
    current: usize,
    /// Smoothed seconds per record.
    ema: Option<f64>,
}

impl AdaptiveBatcher {
    pub fn new(policy: SizingPolicy, min_size: usize, max_size: usize) -> Self {
        let min_size = min_size.max(1);
        let max_size = max_size.max(min_size);
        let current = policy.initial_size().clamp(min_size, max_size);
        Self {
            policy,
            min_size,
            max_size,
            current,
            ema: None,
        }
    }

    /// Size to request when no feedback has arrived since the last call.
    pub fn current_size(&self) -> usize {
        self.current
    }

    pub fn next_size(&mut self, last_latency: Duration, last_batch_size: usize) -> usize {
        let SizingPolicy::Adaptive {
            low_watermark,
            high_watermark,
            smoothing,
            ..
        } = self.policy
        else {
            return self.current;
        };

        if last_batch_size == 0 {
            return self.current;
        }

        let sample = last_latency.as_secs_f64() / last_batch_size as f64;
        let ema = match self.ema {
            Some(previous) => smoothing * sample + (1.0 - smoothing) * previous,
            None => sample,
        };
        self.ema = Some(ema);

        let projected = ema * self.current as f64;
        if projected < low_watermark.as_secs_f64() {
            self.current = self.current.saturating_mul(2).min(self.max_size);
        } else if projected > high_watermark.as_secs_f64() {
            self.current = (self.current / 2).max(self.min_size);
        }
        self.current
    }
}
