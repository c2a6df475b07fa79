//! Store boundaries the pipeline talks to: the cursor-capable source, the bulk-write
//! sink, durable quarantine storage, and run/checkpoint state. Each boundary is a
//! trait with in-memory and JSON-lines file implementations.

pub mod file;
pub mod memory;
pub mod quarantine;
pub mod sink;
pub mod source;
pub mod state;

pub use file::{FilePosition, FileQuarantineStore, FileStateStore, JsonLinesSink, JsonLinesSource};
pub use memory::{MemoryQuarantineStore, MemorySink, MemorySource, MemoryStateStore};
pub use quarantine::{QuarantineReason, QuarantineRecord, QuarantineStore};
pub use sink::{SinkError, SinkStore};
pub use source::{Page, SourceError, SourceRecord, SourceStore};
pub use state::{Checkpoint, StateStore};
