pub mod batching;
pub mod processor;
pub mod runtime;
pub mod store;

pub use batching::batch::{Batch, BatchFeedback, BatchState};
pub use batching::cursor::{CursorReader, Fetch, PipelineError};
pub use batching::queue::{BatchQueue, QueueGauge};
pub use batching::sizer::{AdaptiveBatcher, SizingPolicy};
pub use processor::backoff::{RetryDecision, RetryPolicy};
pub use processor::coordinator::{
    Pipeline, PipelineParts, QuarantineReplayer, ReplayOutcome, RunHandle,
};
pub use runtime::config::{PipelineConfig, PipelineConfigBuilder, PipelineConfigParams};
pub use runtime::progress::{FailureKind, ProgressTracker, RunFailure, RunState, RunStatus};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use runtime::transform::{transform_fn, FnTransform, PassThrough, Transform, TransformError};
pub use store::{
    Checkpoint, FilePosition, FileQuarantineStore, FileStateStore, JsonLinesSink,
    JsonLinesSource, MemoryQuarantineStore, MemorySink, MemorySource, MemoryStateStore, Page,
    QuarantineReason, QuarantineRecord, QuarantineStore, SinkError, SinkStore, SourceError,
    SourceRecord, SourceStore, StateStore,
};
