//! Reader-side building blocks: the cursor reader, batch sizing, the bounded batch queue,
//! and checkpoint watermark tracking.

pub mod batch;
pub mod checkpoint;
pub mod cursor;
pub mod queue;
pub mod sizer;
